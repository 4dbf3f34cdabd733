use std::path::PathBuf;

use anyhow::{Context as _, anyhow};
use pglite::{entropy::EntropyPolicy, image::GUEST_BINARY};

/// Host settings read from `PGLITE_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    pub workdir: PathBuf,
    pub archive: PathBuf,
    pub wasm: PathBuf,
    pub cache_dir: Option<PathBuf>,
    pub max_memory: Option<usize>,
    pub entropy: EntropyPolicy,
    pub warmup: Option<PathBuf>,
}

impl HostConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let workdir = PathBuf::from(lookup("PGLITE_WORKDIR").unwrap_or_else(|| ".".to_string()));
        let archive = lookup("PGLITE_ARCHIVE")
            .map_or_else(|| PathBuf::from("pglite-wasi.tar.gz"), PathBuf::from);
        let wasm = lookup("PGLITE_WASM").map_or_else(|| workdir.join(GUEST_BINARY), PathBuf::from);
        let max_memory = lookup("PGLITE_MAX_MEMORY")
            .map(|v| {
                v.parse::<usize>()
                    .with_context(|| format!("invalid PGLITE_MAX_MEMORY: {v}"))
            })
            .transpose()?;
        let entropy = lookup("PGLITE_ENTROPY")
            .map(|v| v.parse::<EntropyPolicy>().map_err(|e| anyhow!(e)))
            .transpose()?
            .unwrap_or_default();

        Ok(Self {
            archive,
            wasm,
            cache_dir: lookup("PGLITE_CACHE_DIR").map(PathBuf::from),
            max_memory,
            entropy,
            warmup: lookup("PGLITE_WARMUP").map(PathBuf::from),
            workdir,
        })
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.workdir.join("tmp")
    }

    pub fn dev_dir(&self) -> PathBuf {
        self.workdir.join("dev")
    }
}
