//! Boundary between the host and the sandbox execution engine.
//!
//! The engine is consumed through four primitives: instantiate a guest, call
//! one of its exports, and read or write its linear memory.
//! [`wasi::WasiRuntime`] implements them on top of wasmtime.

pub mod wasi;

mod cache;
mod limits;

use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Scalar returned by a guest export.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl core::fmt::Display for Value {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::I32(v) => write!(f, "{v}"),
            Self::I64(v) => write!(f, "{v}"),
            Self::F32(v) => write!(f, "{v}"),
            Self::F64(v) => write!(f, "{v}"),
        }
    }
}

/// How the guest's nominal entry point finished during instantiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    /// The entry point returned, or the module has none.
    Running,
    /// The entry point called `proc_exit`. The module stays callable.
    Exited(i32),
}

/// A freshly instantiated guest together with its entry outcome.
pub struct Instantiated<G> {
    pub guest: G,
    pub entry: EntryOutcome,
}

/// A live guest instance.
#[async_trait]
pub trait Guest: Send {
    /// Invoke the named export without arguments.
    async fn call(&mut self, export: &str) -> anyhow::Result<Vec<Value>>;

    /// Current size of the guest's linear memory in bytes.
    fn memory_size(&self) -> usize;

    /// # Errors
    /// Returns [`Error::MemoryReadOutOfBounds`] if the range exceeds the
    /// guest memory.
    fn read_memory(&mut self, offset: usize, buf: &mut [u8]) -> Result<()>;

    /// # Errors
    /// Returns [`Error::MemoryWriteOutOfBounds`] if the range exceeds the
    /// guest memory. Guest memory is never grown by the host.
    fn write_memory(&mut self, offset: usize, bytes: &[u8]) -> Result<()>;
}

/// Factory for guest instances.
#[async_trait]
pub trait Runtime: Send + Sync {
    type Guest: Guest;

    /// Instantiate the guest and run its entry point.
    ///
    /// A `proc_exit` from the entry point is reported through
    /// [`Instantiated::entry`], not as an error.
    ///
    /// # Errors
    /// Returns [`Error::InstantiationFailed`] for any other failure.
    async fn instantiate(&self, config: &GuestConfig) -> Result<Instantiated<Self::Guest>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// Validate that `len` bytes at `offset` fit into a memory of `size` bytes.
///
/// # Errors
/// Returns the out-of-bounds error matching `access`.
pub fn check_bounds(access: Access, offset: usize, len: usize, size: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(match access {
            Access::Read => Error::MemoryReadOutOfBounds { offset, len, size },
            Access::Write => Error::MemoryWriteOutOfBounds { offset, len, size },
        }),
    }
}

/// Host directory exposed to the guest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryMapping {
    pub host: PathBuf,
    pub guest: String,
    pub writable: bool,
}

impl DirectoryMapping {
    #[must_use]
    pub fn new(host: impl Into<PathBuf>, guest: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            guest: guest.into(),
            writable: false,
        }
    }

    #[must_use]
    pub const fn writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }
}

/// Where guest stdout/stderr go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Stdio {
    /// Share the host's stdout/stderr.
    #[default]
    Inherit,
    /// Discard guest output.
    Null,
}

/// Sandbox configuration for one guest instance.
#[derive(Clone, Debug, Default)]
pub struct GuestConfig {
    pub directory_mappings: Vec<DirectoryMapping>,
    /// Full argument vector, including `argv[0]`.
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdio: Stdio,
    /// Linear memory cap in bytes. `None` leaves growth to the module's own
    /// limits.
    pub max_memory: Option<usize>,
}

impl GuestConfig {
    /// Guest-visible mount point of the image's `tmp` directory.
    pub const TMP_MOUNT: &str = "/tmp";
    /// Guest-visible mount point of the entropy directory.
    pub const DEV_MOUNT: &str = "/dev";

    /// Configuration expected by the pglite guest: single-user mode on the
    /// `postgres` database with the REPL prompt disabled.
    #[must_use]
    pub fn pglite(tmp_dir: impl Into<PathBuf>, dev_dir: impl Into<PathBuf>) -> Self {
        Self {
            directory_mappings: vec![
                DirectoryMapping::new(tmp_dir, Self::TMP_MOUNT).writable(true),
                DirectoryMapping::new(dev_dir, Self::DEV_MOUNT).writable(true),
            ],
            args: vec!["--single".to_string(), "postgres".to_string()],
            env: [
                ("ENVIRONMENT", "wasi-embed"),
                ("REPL", "N"),
                ("PGUSER", "postgres"),
                ("PGDATABASE", "postgres"),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
            stdio: Stdio::Inherit,
            max_memory: None,
        }
    }

    /// Mount a host directory into the guest. A mount on the same guest path
    /// replaces the earlier one.
    #[must_use]
    pub fn mount(mut self, mapping: DirectoryMapping) -> Self {
        if let Some(existing) = self
            .directory_mappings
            .iter_mut()
            .find(|m| m.guest == mapping.guest)
        {
            *existing = mapping;
        } else {
            self.directory_mappings.push(mapping);
        }
        self
    }

    /// Set an environment variable. The last value for a key wins.
    #[must_use]
    pub fn env(mut self, k: impl AsRef<str>, v: impl AsRef<str>) -> Self {
        let (k, v) = (k.as_ref(), v.as_ref());
        if let Some(existing) = self.env.iter_mut().find(|(key, _)| key == k) {
            v.clone_into(&mut existing.1);
        } else {
            self.env.push((k.to_string(), v.to_string()));
        }
        self
    }

    #[must_use]
    pub const fn stdio(mut self, stdio: Stdio) -> Self {
        self.stdio = stdio;
        self
    }

    #[must_use]
    pub const fn max_memory(mut self, max_memory: Option<usize>) -> Self {
        self.max_memory = max_memory;
        self
    }
}
