use std::{env::args, path::Path};

use anyhow::{Context as _, anyhow};
use config::HostConfig;
use pglite::{
    DEFAULT_WARMUP, GuestConfig, GuestLauncher, SessionDriver,
    entropy::{ENTROPY_BYTES, ENTROPY_FILE, ensure_entropy},
    image::{ImageMaterializer, Materialized},
    sandbox::wasi::{WasiRuntime, WasiRuntimeOptions},
};
use tokio::io::BufReader;
use tracing::{debug, info};
use trace::init_tracing;

mod config;
mod trace;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;
    let config = HostConfig::from_env()?;

    let task = args().nth(1);
    match task.as_deref() {
        Some("extract") => prepare(&config).await,
        Some("build") => {
            prepare(&config).await?;
            load_runtime(&config).await?;
            Ok(())
        }
        None | Some("run") => {
            prepare(&config).await?;
            run(&config).await
        }
        _ => Err(anyhow!("unknown task")),
    }
}

/// Unpack the guest image if needed and provision the entropy file.
async fn prepare(config: &HostConfig) -> anyhow::Result<()> {
    let materializer = ImageMaterializer::new(&config.workdir);
    let archive = config.archive.clone();
    let entropy_path = config.workdir.join(ENTROPY_FILE);
    let policy = config.entropy;

    tokio::task::spawn_blocking(move || {
        if !materializer.is_materialized() {
            let bytes = std::fs::read(&archive)
                .with_context(|| format!("failed to read {}", archive.display()))?;
            if let Materialized::Extracted { entries } = materializer.ensure(&bytes)? {
                info!(entries, archive = %archive.display(), "guest image ready");
            }
        }
        ensure_entropy(&entropy_path, ENTROPY_BYTES, policy)?;
        Ok::<_, anyhow::Error>(())
    })
    .await?
}

async fn load_runtime(config: &HostConfig) -> anyhow::Result<WasiRuntime> {
    let options = WasiRuntimeOptions {
        cache: config.cache_dir.clone(),
    };
    let runtime = WasiRuntime::load(&config.wasm, options)
        .await
        .with_context(|| format!("failed to load {}", config.wasm.display()))?;
    Ok(runtime)
}

async fn read_warmup(path: Option<&Path>) -> anyhow::Result<String> {
    match path {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display())),
        None => Ok(DEFAULT_WARMUP.to_string()),
    }
}

async fn run(config: &HostConfig) -> anyhow::Result<()> {
    let warmup = read_warmup(config.warmup.as_deref()).await?;
    let runtime = load_runtime(config).await?;
    let guest_config =
        GuestConfig::pglite(config.tmp_dir(), config.dev_dir()).max_memory(config.max_memory);

    let launcher = GuestLauncher::new(runtime, guest_config);
    for mapping in &launcher.config().directory_mappings {
        debug!(host = %mapping.host.display(), guest = %mapping.guest, "mounting");
    }
    let channel = launcher.start().await?.bootstrap().await?;
    info!("guest bootstrapped");

    let mut driver = SessionDriver::new(channel);
    let Err(err) = driver
        .run(&warmup, BufReader::new(tokio::io::stdin()))
        .await;
    Err(err.into())
}
