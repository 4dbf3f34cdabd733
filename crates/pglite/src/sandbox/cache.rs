use std::{
    hash::{Hash, Hasher},
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use sha2::{Digest, Sha256};
use tracing::{debug, info};
use wasmtime::{Engine, Module};

use crate::error::{Error, Result};

/// Routes `Hash` output straight into the digest.
struct DigestWriter<'a>(&'a mut Sha256);

impl Hasher for DigestWriter<'_> {
    // `Hash` implementations only write.
    fn finish(&self) -> u64 {
        0
    }

    fn write(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }
}

/// Cache file stem for `wasm_bytes` compiled by `engine`.
pub fn cache_key(engine: &Engine, wasm_bytes: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(b"pglite-module-v1\0");
    h.update(Sha256::digest(wasm_bytes));
    engine
        .precompile_compatibility_hash()
        .hash(&mut DigestWriter(&mut h));
    format!("{:x}", h.finalize())
}

pub fn cache_path(cache_dir: &Path, engine: &Engine, wasm_bytes: &[u8]) -> PathBuf {
    cache_dir.join(format!("{}.cwasm", cache_key(engine, wasm_bytes)))
}

/// Compile `wasm_bytes`, reusing a precompiled artifact from `cache_dir` when
/// one matches.
pub async fn load_or_compile_module(
    engine: &Engine,
    wasm_bytes: &[u8],
    cache_dir: Option<&Path>,
) -> Result<Module> {
    let Some(cache_dir) = cache_dir else {
        return compile(engine, wasm_bytes).await;
    };

    tokio::fs::create_dir_all(cache_dir).await?;
    let path = cache_path(cache_dir, engine, wasm_bytes);

    // SAFETY: artifacts in the cache directory are only produced by
    // `Module::serialize` for an engine with the same compatibility hash,
    // which is part of the file name.
    if let Ok(module) = unsafe { Module::deserialize_file(engine, &path) } {
        debug!(path = %path.display(), "loaded precompiled guest");
        return Ok(module);
    }

    let module = compile(engine, wasm_bytes).await?;
    let bytes = module.serialize().map_err(Error::InstantiationFailed)?;
    publish_artifact(&path, &bytes).await?;
    info!(path = %path.display(), "cached precompiled guest");
    Ok(module)
}

async fn compile(engine: &Engine, wasm_bytes: &[u8]) -> Result<Module> {
    let engine = engine.clone();
    let wasm_bytes = wasm_bytes.to_vec();
    info!(bytes = wasm_bytes.len(), "compiling guest module");
    // Cranelift compilation of the database engine takes seconds; keep it off
    // the async worker.
    tokio::task::spawn_blocking(move || Module::new(&engine, &wasm_bytes))
        .await
        .map_err(|e| Error::InstantiationFailed(e.into()))?
        .map_err(Error::InstantiationFailed)
}

/// Publish `bytes` at `dest` through a uniquely named sibling and a rename.
async fn publish_artifact(dest: &Path, bytes: &[u8]) -> Result<()> {
    static NEXT_STAGING_ID: AtomicU64 = AtomicU64::new(0);

    let id = NEXT_STAGING_ID.fetch_add(1, Ordering::Relaxed);
    let staging = dest.with_extension(format!("partial.{}.{id}", std::process::id()));

    tokio::fs::write(&staging, bytes).await?;
    if let Err(e) = tokio::fs::rename(&staging, dest).await {
        let _ = tokio::fs::remove_file(&staging).await;
        // Identical content is already in place.
        if e.kind() != std::io::ErrorKind::AlreadyExists {
            return Err(e.into());
        }
    }
    Ok(())
}
