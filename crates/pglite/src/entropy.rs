//! Host-backed random byte file standing in for the guest's `/dev/urandom`.

use std::{fs, path::Path, str::FromStr};

use rand::RngCore as _;
use tracing::debug;

use crate::error::{Error, Result};

/// Entropy file location relative to the working directory. The `dev`
/// directory is mounted at `/dev` inside the guest.
pub const ENTROPY_FILE: &str = "dev/urandom";

/// Size of the provisioned entropy file.
pub const ENTROPY_BYTES: usize = 128;

/// What to do with an entropy file left by an earlier run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EntropyPolicy {
    /// Rewrite the file on every start.
    #[default]
    Refresh,
    /// Keep a file of the expected size; write one otherwise.
    KeepExisting,
}

impl FromStr for EntropyPolicy {
    type Err = String;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        match s {
            "refresh" => Ok(Self::Refresh),
            "keep" => Ok(Self::KeepExisting),
            other => Err(format!("unknown entropy policy: {other}")),
        }
    }
}

/// Write `byte_count` cryptographically secure random bytes to `path`,
/// creating the parent directory and replacing any existing file.
///
/// # Errors
/// Returns [`Error::EntropyProvisionFailed`] on any I/O failure.
pub fn provision_entropy(path: &Path, byte_count: usize) -> Result<()> {
    let failed = |source| Error::EntropyProvisionFailed {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(failed)?;
    }

    let mut bytes = vec![0; byte_count];
    rand::rng().fill_bytes(&mut bytes);
    fs::write(path, &bytes).map_err(failed)?;
    debug!(path = %path.display(), byte_count, "entropy file provisioned");
    Ok(())
}

/// Apply `policy` to the entropy file at `path`. Returns whether a new file
/// was written.
///
/// # Errors
/// Returns [`Error::EntropyProvisionFailed`] on any I/O failure.
pub fn ensure_entropy(path: &Path, byte_count: usize, policy: EntropyPolicy) -> Result<bool> {
    if policy == EntropyPolicy::KeepExisting
        && fs::metadata(path).is_ok_and(|m| m.is_file() && m.len() == byte_count as u64)
    {
        debug!(path = %path.display(), "keeping existing entropy file");
        return Ok(false);
    }
    provision_entropy(path, byte_count)?;
    Ok(true)
}
