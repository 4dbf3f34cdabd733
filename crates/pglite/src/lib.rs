//! Host for the WASI build of the PostgreSQL engine.
//!
//! Typical flow:
//! 1. Materialize the guest filesystem with [`image::ImageMaterializer`] and
//!    provision its entropy file with [`entropy::ensure_entropy`].
//! 2. Instantiate the guest through a [`sandbox::Runtime`] (usually
//!    [`sandbox::wasi::WasiRuntime`]) using [`lifecycle::start_guest`].
//! 3. [`lifecycle::GuestHandle::bootstrap`] the guest into a
//!    [`channel::QueryChannel`].
//! 4. Feed statements through [`session::SessionDriver`].

pub mod channel;
pub mod entropy;
pub mod error;
pub mod image;
pub mod lifecycle;
pub mod sandbox;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use channel::{QUERY_BUFFER_OFFSET, QueryChannel};
pub use error::{BootstrapStage, Error, Result};
pub use lifecycle::{GuestHandle, GuestLauncher, Lifecycle, start_guest};
pub use sandbox::{EntryOutcome, Guest, GuestConfig, Runtime, Value};
pub use session::{DEFAULT_WARMUP, SessionDriver};

/// Names of the functions exported by the pglite guest.
pub mod exports {
    /// Initializes the database cluster. Returns an informational status word.
    pub const PG_INITDB: &str = "pg_initdb";
    /// Switches the guest transport to its socket file.
    pub const USE_SOCKETFILE: &str = "use_socketfile";
    /// Runs the statement currently stored in the query buffer.
    pub const INTERACTIVE_ONE: &str = "interactive_one";
    /// WASI command entry point.
    pub const START: &str = "_start";
    /// Linear memory export.
    pub const MEMORY: &str = "memory";
}
