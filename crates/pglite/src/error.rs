use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Step of the guest bootstrap sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapStage {
    InitDb,
    SocketSetup,
}

impl core::fmt::Display for BootstrapStage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InitDb => f.write_str(crate::exports::PG_INITDB),
            Self::SocketSetup => f.write_str(crate::exports::USE_SOCKETFILE),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    /// Writing the guest image to disk failed.
    #[error("failed to extract {}: {source}", path.display())]
    ExtractionFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The image archive could not be decoded (gzip or tar framing).
    #[error("corrupt image archive: {0}")]
    CorruptArchive(#[source] std::io::Error),

    /// The image archive holds an entry that is not a directory, file or
    /// symlink.
    #[error("unsupported entry kind in archive: {kind} ({})", path.display())]
    UnsupportedEntryKind { kind: char, path: PathBuf },

    /// An archive entry would land outside the destination root.
    #[error("archive entry escapes destination: {}", path.display())]
    UnsafeEntryPath { path: PathBuf },

    #[error("failed to provision entropy file {}: {source}", path.display())]
    EntropyProvisionFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Wasmtime engine error while compiling or instantiating the guest.
    #[error("guest instantiation failed: {0}")]
    InstantiationFailed(#[source] anyhow::Error),

    /// The guest entry point exited with a non-zero status.
    #[error("guest exited with code {code}")]
    GuestExited { code: i32 },

    #[error("guest bootstrap failed in {stage}: {source}")]
    BootstrapFailed {
        stage: BootstrapStage,
        #[source]
        source: anyhow::Error,
    },

    #[error("memory write of {len} bytes at offset {offset} exceeds guest memory ({size} bytes)")]
    MemoryWriteOutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("memory read of {len} bytes at offset {offset} exceeds guest memory ({size} bytes)")]
    MemoryReadOutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },

    /// Query text cannot be passed as a C string.
    #[error("query contains a nul byte at position {position}")]
    InteriorNul { position: usize },

    #[error("query execution failed: {0}")]
    QueryExecutionFailed(#[source] anyhow::Error),

    /// Input stream was exhausted, possibly in the middle of a statement.
    #[error("end of input after {submitted} statements")]
    EndOfInput { submitted: usize },

    #[error("failed to read input: {0}")]
    Input(#[source] std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
