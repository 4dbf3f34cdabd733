//! Warm-up batch followed by an interactive statement loop.

use core::convert::Infallible;
use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt as _};
use tracing::{debug, info};

use crate::{
    channel::QueryChannel,
    error::{Error, Result},
    sandbox::Guest,
};

/// Terminates a statement on the interactive input stream.
pub const STATEMENT_TERMINATOR: u8 = b';';

/// Separates statements in a warm-up script.
pub const WARMUP_SEPARATOR: &str = "\n\n";

/// Statements run before reading from the input stream.
pub const DEFAULT_WARMUP: &str = r"

SHOW client_encoding;

CREATE OR REPLACE FUNCTION test_func() RETURNS TEXT AS $$ BEGIN RETURN 'test'; END; $$ LANGUAGE plpgsql;

CREATE OR REPLACE FUNCTION addition (entier1 integer, entier2 integer)
RETURNS integer
LANGUAGE plpgsql
IMMUTABLE
AS '
DECLARE
  resultat integer;
BEGIN
  resultat := entier1 + entier2;
  RETURN resultat;
END ' ;

SELECT test_func();

SELECT now(), current_database(), session_user, current_user;

SELECT addition(40,2);

";

/// Non-blank statements of a warm-up script, trimmed, in order.
pub fn warmup_statements(script: &str) -> impl Iterator<Item = &str> {
    script
        .split(WARMUP_SEPARATOR)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Feeds statements into a [`QueryChannel`].
pub struct SessionDriver<G> {
    channel: QueryChannel<G>,
}

impl<G: Guest> SessionDriver<G> {
    pub const fn new(channel: QueryChannel<G>) -> Self {
        Self { channel }
    }

    pub const fn channel(&self) -> &QueryChannel<G> {
        &self.channel
    }

    pub fn into_channel(self) -> QueryChannel<G> {
        self.channel
    }

    /// Run the warm-up script, then serve `input` until it fails.
    ///
    /// There is no quit command: the session only ends with an error, usually
    /// [`Error::EndOfInput`].
    ///
    /// # Errors
    /// The first error from [`Self::run_warmup`] or [`Self::serve`].
    pub async fn run<R>(&mut self, warmup: &str, input: R) -> Result<Infallible>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        self.run_warmup(warmup).await?;
        self.serve(input).await
    }

    /// Submit every non-blank statement of `script`. Returns how many were
    /// submitted.
    ///
    /// # Errors
    /// Stops at the first failed submission.
    pub async fn run_warmup(&mut self, script: &str) -> Result<usize> {
        let mut count = 0;
        for statement in warmup_statements(script) {
            info!("REPL: {statement}");
            self.channel.submit(statement).await?;
            count += 1;
        }
        Ok(count)
    }

    /// Submit `;`-terminated statements read from `input`, exactly as read.
    ///
    /// # Errors
    /// - [`Error::EndOfInput`] once the stream is exhausted, including when
    ///   it ends inside an unterminated statement.
    /// - [`Error::Input`] on read failures or non-UTF-8 input.
    /// - Any error from [`QueryChannel::submit`].
    pub async fn serve<R>(&mut self, mut input: R) -> Result<Infallible>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let n = input
                .read_until(STATEMENT_TERMINATOR, &mut buf)
                .await
                .map_err(Error::Input)?;
            if n == 0 || buf.last() != Some(&STATEMENT_TERMINATOR) {
                if !buf.is_empty() {
                    debug!(bytes = buf.len(), "discarding unterminated statement");
                }
                return Err(Error::EndOfInput {
                    submitted: self.channel.submitted(),
                });
            }

            let statement = std::str::from_utf8(&buf)
                .map_err(|e| Error::Input(io::Error::new(io::ErrorKind::InvalidData, e)))?;
            info!("REPL: {}", statement.trim());
            self.channel.submit(statement).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        exports,
        sandbox::{EntryOutcome, GuestConfig},
        start_guest,
        testing::{StubGuest, StubRuntime, calls, queries},
    };

    async fn driver(guest: StubGuest) -> SessionDriver<StubGuest> {
        let channel = start_guest(
            &StubRuntime::new(guest, EntryOutcome::Running),
            &GuestConfig::default(),
        )
        .await
        .expect("start")
        .bootstrap()
        .await
        .expect("bootstrap");
        SessionDriver::new(channel)
    }

    #[test]
    fn default_warmup_has_six_statements() {
        let statements: Vec<_> = warmup_statements(DEFAULT_WARMUP).collect();
        assert_eq!(statements.len(), 6);
        assert_eq!(statements[0], "SHOW client_encoding;");
        assert!(statements[2].starts_with("CREATE OR REPLACE FUNCTION addition"));
        assert!(statements[2].ends_with("END ' ;"));
        assert_eq!(statements[5], "SELECT addition(40,2);");
    }

    #[tokio::test]
    async fn warmup_then_end_of_input() {
        let (guest, journal) = StubGuest::new(4096);
        let mut driver = driver(guest).await;

        let Err(err) = driver.run("SELECT 1;\n\nSELECT 2;", &b""[..]).await;
        assert!(
            matches!(err, Error::EndOfInput { submitted: 2 }),
            "got {err}"
        );
        assert_eq!(queries(&journal), ["SELECT 1;", "SELECT 2;"]);
    }

    #[tokio::test]
    async fn blank_warmup_pieces_are_skipped() {
        let (guest, journal) = StubGuest::new(4096);
        let mut driver = driver(guest).await;

        let count = driver
            .run_warmup("\n\n   \n\n  SELECT 1;  \n\n\n\n")
            .await
            .expect("warmup");
        assert_eq!(count, 1);
        assert_eq!(queries(&journal), ["SELECT 1;"]);
    }

    #[tokio::test]
    async fn input_statements_are_split_on_terminator() {
        let (guest, journal) = StubGuest::new(4096);
        let mut driver = driver(guest).await;

        let input = "SELECT 3;\nSELECT\n  4;\nSELECT 5";
        let Err(err) = driver.serve(input.as_bytes()).await;
        assert!(
            matches!(err, Error::EndOfInput { submitted: 2 }),
            "got {err}"
        );
        // The trailing unterminated statement is never submitted.
        assert_eq!(queries(&journal), ["SELECT 3;", "\nSELECT\n  4;"]);
    }

    #[tokio::test]
    async fn warmup_failure_stops_the_session() {
        let (guest, journal) = StubGuest::new(4096);
        let mut driver = driver(guest.fail_on(exports::INTERACTIVE_ONE, 2)).await;

        let Err(err) = driver
            .run("SELECT 1;\n\nSELECT 2;\n\nSELECT 3;", &b"SELECT 4;"[..])
            .await;
        assert!(matches!(err, Error::QueryExecutionFailed(_)), "got {err}");
        assert_eq!(queries(&journal), ["SELECT 1;", "SELECT 2;"]);
    }

    #[tokio::test]
    async fn interactive_failure_stops_the_session() {
        let (guest, journal) = StubGuest::new(4096);
        let mut driver = driver(guest.fail_on(exports::INTERACTIVE_ONE, 1)).await;

        let Err(err) = driver.serve(&b"SELECT 1; SELECT 2; SELECT 3;"[..]).await;
        assert!(matches!(err, Error::QueryExecutionFailed(_)), "got {err}");
        let interactive = calls(&journal)
            .into_iter()
            .filter(|c| c == exports::INTERACTIVE_ONE)
            .count();
        assert_eq!(interactive, 1);
        assert_eq!(driver.channel().submitted(), 0);
    }

    #[tokio::test]
    async fn invalid_utf8_is_an_input_error() {
        let (guest, journal) = StubGuest::new(4096);
        let mut driver = driver(guest).await;

        let Err(err) = driver.serve(&b"SELECT '\xff';"[..]).await;
        assert!(matches!(err, Error::Input(_)), "got {err}");
        assert!(queries(&journal).is_empty());
    }
}
