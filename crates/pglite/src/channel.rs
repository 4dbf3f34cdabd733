//! Query submission through the guest's fixed query buffer.

use tracing::debug;

use crate::{
    error::{Error, Result},
    exports,
    lifecycle::Lifecycle,
    sandbox::Guest,
};

/// Guest linear-memory address of the query buffer.
///
/// This is a compatibility contract with the pglite guest build, which reads
/// the NUL-terminated statement for `interactive_one` from this address. It is
/// not negotiated at runtime; a guest built with a different layout needs a
/// different constant.
pub const QUERY_BUFFER_OFFSET: usize = 1;

/// Exclusive owner of a bootstrapped guest and its query buffer.
///
/// `submit` takes `&mut self`, so at most one query is in flight at a time.
pub struct QueryChannel<G> {
    guest: G,
    buf: Vec<u8>,
    submitted: usize,
}

impl<G: Guest> QueryChannel<G> {
    pub(crate) const fn new(guest: G) -> Self {
        Self {
            guest,
            buf: Vec::new(),
            submitted: 0,
        }
    }

    pub const fn state(&self) -> Lifecycle {
        if self.submitted == 0 {
            Lifecycle::Bootstrapped
        } else {
            Lifecycle::Serving
        }
    }

    /// Number of statements the guest has processed successfully.
    pub const fn submitted(&self) -> usize {
        self.submitted
    }

    pub const fn guest_mut(&mut self) -> &mut G {
        &mut self.guest
    }

    pub fn into_guest(self) -> G {
        self.guest
    }

    /// Write `text` as a C string into the query buffer and have the guest
    /// process it.
    ///
    /// Results and query-level errors appear on the guest's stdout/stderr only.
    ///
    /// # Errors
    /// - [`Error::InteriorNul`] if `text` contains a NUL byte.
    /// - [`Error::MemoryWriteOutOfBounds`] if the statement does not fit into
    ///   guest memory at [`QUERY_BUFFER_OFFSET`].
    /// - [`Error::QueryExecutionFailed`] if `interactive_one` traps.
    pub async fn submit(&mut self, text: &str) -> Result<()> {
        if let Some(position) = text.bytes().position(|b| b == 0) {
            return Err(Error::InteriorNul { position });
        }

        self.buf.clear();
        self.buf.extend_from_slice(text.as_bytes());
        self.buf.push(0);
        self.guest.write_memory(QUERY_BUFFER_OFFSET, &self.buf)?;

        debug!(bytes = self.buf.len(), "submitting query");
        self.guest
            .call(exports::INTERACTIVE_ONE)
            .await
            .map_err(Error::QueryExecutionFailed)?;
        self.submitted += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        sandbox::{EntryOutcome, GuestConfig},
        start_guest,
        testing::{StubGuest, StubRuntime, calls, queries},
    };

    async fn channel(guest: StubGuest) -> QueryChannel<StubGuest> {
        start_guest(
            &StubRuntime::new(guest, EntryOutcome::Running),
            &GuestConfig::default(),
        )
        .await
        .expect("start")
        .bootstrap()
        .await
        .expect("bootstrap")
    }

    #[tokio::test]
    async fn writes_nul_terminated_query_at_offset() {
        let (guest, journal) = StubGuest::new(64);
        let mut channel = channel(guest).await;

        channel.submit("SELECT 1;").await.expect("submit");

        let memory = channel.guest_mut().memory();
        let end = QUERY_BUFFER_OFFSET + "SELECT 1;".len();
        assert_eq!(&memory[QUERY_BUFFER_OFFSET..end], b"SELECT 1;");
        assert_eq!(memory[end], 0);
        // Bytes outside the written range are left alone.
        assert_eq!(memory[0], 0xAA);
        assert_eq!(memory[end + 1], 0xAA);
        assert_eq!(queries(&journal), ["SELECT 1;"]);
    }

    #[tokio::test]
    async fn shorter_query_is_not_mixed_with_previous_one() {
        let (guest, journal) = StubGuest::new(64);
        let mut channel = channel(guest).await;

        channel.submit("SELECT 12345;").await.expect("submit");
        channel.submit("SELECT 1;").await.expect("submit");
        assert_eq!(queries(&journal), ["SELECT 12345;", "SELECT 1;"]);
    }

    #[tokio::test]
    async fn state_moves_to_serving() {
        let (guest, _journal) = StubGuest::new(64);
        let mut channel = channel(guest).await;
        assert_eq!(channel.state(), Lifecycle::Bootstrapped);

        channel.submit("SELECT 1;").await.expect("submit");
        assert_eq!(channel.state(), Lifecycle::Serving);
        assert_eq!(channel.submitted(), 1);
    }

    #[tokio::test]
    async fn query_filling_memory_exactly_fits() {
        let (guest, _journal) = StubGuest::new(16);
        let mut channel = channel(guest).await;
        // offset 1 + 14 bytes + NUL == 16
        channel.submit("SELECT 123456;").await.expect("fits");
    }

    #[tokio::test]
    async fn oversized_query_is_rejected_before_invocation() {
        let (guest, journal) = StubGuest::new(16);
        let mut channel = channel(guest).await;

        let err = channel
            .submit("SELECT 1234567;")
            .await
            .expect_err("does not fit");
        assert!(
            matches!(
                err,
                Error::MemoryWriteOutOfBounds {
                    offset: QUERY_BUFFER_OFFSET,
                    len: 16,
                    size: 16
                }
            ),
            "got {err}"
        );
        assert!(!calls(&journal).contains(&exports::INTERACTIVE_ONE.to_string()));
        assert_eq!(channel.submitted(), 0);
    }

    #[tokio::test]
    async fn interior_nul_is_rejected() {
        let (guest, journal) = StubGuest::new(64);
        let mut channel = channel(guest).await;

        let err = channel
            .submit("SELECT 1;\0DROP TABLE t;")
            .await
            .expect_err("nul byte");
        assert!(matches!(err, Error::InteriorNul { position: 9 }), "got {err}");
        assert!(queries(&journal).is_empty());
    }

    #[tokio::test]
    async fn guest_failure_is_not_retried() {
        let (guest, journal) = StubGuest::new(64);
        let mut channel = channel(guest.fail_on(exports::INTERACTIVE_ONE, 1)).await;

        let err = channel.submit("SELECT 1;").await.expect_err("trap");
        assert!(matches!(err, Error::QueryExecutionFailed(_)), "got {err}");
        assert_eq!(queries(&journal).len(), 1);
        assert_eq!(channel.submitted(), 0);
    }
}
