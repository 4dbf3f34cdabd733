//! Guest lifecycle: `Uninstantiated -> Running -> Bootstrapped -> Serving`.
//!
//! Each state is its own type. [`GuestLauncher`] starts the guest,
//! [`GuestHandle`] bootstraps it, and the resulting
//! [`QueryChannel`](crate::channel::QueryChannel) serves queries.

use tracing::{Instrument as _, info, info_span, warn};

use crate::{
    channel::QueryChannel,
    error::{BootstrapStage, Error, Result},
    exports,
    sandbox::{EntryOutcome, Guest, GuestConfig, Instantiated, Runtime},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninstantiated,
    /// Instantiated; the entry point finished with the given outcome.
    Running(EntryOutcome),
    /// `pg_initdb` and `use_socketfile` succeeded.
    Bootstrapped,
    /// At least one query went through.
    Serving,
}

/// A runtime paired with the configuration to instantiate the guest with.
pub struct GuestLauncher<R> {
    runtime: R,
    config: GuestConfig,
}

impl<R: Runtime> GuestLauncher<R> {
    pub const fn new(runtime: R, config: GuestConfig) -> Self {
        Self { runtime, config }
    }

    pub const fn state(&self) -> Lifecycle {
        Lifecycle::Uninstantiated
    }

    pub const fn config(&self) -> &GuestConfig {
        &self.config
    }

    #[cfg(test)]
    pub(crate) const fn runtime(&self) -> &R {
        &self.runtime
    }

    /// # Errors
    /// See [`start_guest`].
    pub async fn start(&self) -> Result<GuestHandle<R::Guest>> {
        start_guest(&self.runtime, &self.config).await
    }
}

/// Instantiate the guest and interpret how its entry point finished.
///
/// An exit with code zero is a normal completion of the guest's main routine;
/// its exports stay callable.
///
/// # Errors
/// - [`Error::GuestExited`] if the entry point exited with a non-zero code.
/// - [`Error::InstantiationFailed`] for any other instantiation failure.
pub async fn start_guest<R: Runtime + ?Sized>(
    runtime: &R,
    config: &GuestConfig,
) -> Result<GuestHandle<R::Guest>> {
    let Instantiated { guest, entry } = runtime.instantiate(config).await?;
    match entry {
        EntryOutcome::Exited(code) if code != 0 => {
            warn!(code, "guest entry point exited with failure");
            Err(Error::GuestExited { code })
        }
        entry => Ok(GuestHandle { guest, entry }),
    }
}

/// Instantiated guest that has not been bootstrapped yet.
pub struct GuestHandle<G> {
    guest: G,
    entry: EntryOutcome,
}

impl<G: Guest> GuestHandle<G> {
    pub const fn entry(&self) -> EntryOutcome {
        self.entry
    }

    pub const fn state(&self) -> Lifecycle {
        Lifecycle::Running(self.entry)
    }

    pub const fn guest_mut(&mut self) -> &mut G {
        &mut self.guest
    }

    /// Initialize the database cluster, then set up the socket transport.
    ///
    /// # Errors
    /// Returns [`Error::BootstrapFailed`] naming the stage that failed.
    /// `use_socketfile` is not invoked if `pg_initdb` fails.
    pub async fn bootstrap(mut self) -> Result<QueryChannel<G>> {
        async {
            let status = self
                .guest
                .call(exports::PG_INITDB)
                .await
                .map_err(|source| Error::BootstrapFailed {
                    stage: BootstrapStage::InitDb,
                    source,
                })?;
            info!(?status, "initdb returned");

            self.guest
                .call(exports::USE_SOCKETFILE)
                .await
                .map_err(|source| Error::BootstrapFailed {
                    stage: BootstrapStage::SocketSetup,
                    source,
                })?;
            Ok::<_, Error>(())
        }
        .instrument(info_span!("guest.bootstrap"))
        .await?;

        Ok(QueryChannel::new(self.guest))
    }
}
