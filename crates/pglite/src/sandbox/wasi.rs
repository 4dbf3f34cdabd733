//! wasmtime-backed [`Runtime`] for WASI preview1 command modules.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use async_trait::async_trait;
use tracing::{Instrument as _, debug, info, info_span};
use wasmtime::{Config, Engine, Instance, Linker, Memory, Module, Store, Val};
use wasmtime_wasi::{DirPerms, FilePerms, I32Exit, WasiCtxBuilder, p1::WasiP1Ctx};

use super::{
    Access, EntryOutcome, Guest, GuestConfig, Instantiated, Runtime, Stdio, Value, cache,
    check_bounds, limits::GuestLimits,
};
use crate::{
    error::{Error, Result},
    exports,
};

fn configure_engine(cfg: &mut Config) {
    cfg.async_support(true);
    cfg.wasm_backtrace(false);
    cfg.native_unwind_info(false);
    cfg.cranelift_opt_level(wasmtime::OptLevel::Speed);
}

/// Options for loading the guest module.
#[derive(Clone, Debug, Default)]
pub struct WasiRuntimeOptions {
    /// Directory holding precompiled `.cwasm` artifacts. `None` disables
    /// caching.
    pub cache: Option<PathBuf>,
}

/// Compiled guest module ready to be instantiated.
pub struct WasiRuntime {
    engine: Engine,
    module: Module,
    linker: Linker<GuestState>,
}

pub struct GuestState {
    wasi: WasiP1Ctx,
    limits: GuestLimits,
}

impl WasiRuntime {
    /// Read and compile the guest binary at `path`.
    ///
    /// # Errors
    /// Returns [`Error::Io`] if the file cannot be read and
    /// [`Error::InstantiationFailed`] if it does not compile.
    pub async fn load(path: impl AsRef<Path>, options: WasiRuntimeOptions) -> Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await?;
        debug!(path = %path.display(), bytes = bytes.len(), "read guest binary");
        Self::from_bytes(&bytes, options).await
    }

    /// Compile a guest from binary or text wasm.
    ///
    /// # Errors
    /// Returns [`Error::InstantiationFailed`] if the module does not compile.
    pub async fn from_bytes(wasm: &[u8], options: WasiRuntimeOptions) -> Result<Self> {
        let mut engine_cfg = Config::default();
        configure_engine(&mut engine_cfg);
        let engine = Engine::new(&engine_cfg).map_err(Error::InstantiationFailed)?;

        let module = cache::load_or_compile_module(&engine, wasm, options.cache.as_deref()).await?;

        let mut linker = Linker::new(&engine);
        wasmtime_wasi::p1::add_to_linker_async(&mut linker, |s: &mut GuestState| &mut s.wasi)
            .map_err(Error::InstantiationFailed)?;

        Ok(Self {
            engine,
            module,
            linker,
        })
    }

    fn new_store(&self, config: &GuestConfig) -> anyhow::Result<Store<GuestState>> {
        let mut builder = WasiCtxBuilder::new();
        for mapping in &config.directory_mappings {
            let (dir_perms, file_perms) = if mapping.writable {
                (DirPerms::all(), FilePerms::all())
            } else {
                (DirPerms::READ, FilePerms::READ)
            };
            builder
                .preopened_dir(&mapping.host, &mapping.guest, dir_perms, file_perms)
                .with_context(|| {
                    format!(
                        "failed to mount '{}' at '{}'",
                        mapping.host.display(),
                        mapping.guest
                    )
                })?;
        }
        builder.args(config.args.as_slice());
        for (k, v) in &config.env {
            builder.env(k, v);
        }
        if config.stdio == Stdio::Inherit {
            builder.inherit_stdout().inherit_stderr();
        }

        let mut store = Store::new(
            &self.engine,
            GuestState {
                wasi: builder.build_p1(),
                limits: GuestLimits::new(config.max_memory),
            },
        );
        store.limiter(|s| &mut s.limits);
        Ok(store)
    }
}

#[async_trait]
impl Runtime for WasiRuntime {
    type Guest = WasiGuest;

    async fn instantiate(&self, config: &GuestConfig) -> Result<Instantiated<WasiGuest>> {
        async {
            let mut store = self.new_store(config).map_err(Error::InstantiationFailed)?;
            let instance = self
                .linker
                .instantiate_async(&mut store, &self.module)
                .await
                .map_err(Error::InstantiationFailed)?;
            let memory = instance
                .get_memory(&mut store, exports::MEMORY)
                .ok_or_else(|| {
                    Error::InstantiationFailed(anyhow!("guest exports no `{}`", exports::MEMORY))
                })?;

            let mut guest = WasiGuest {
                store,
                instance,
                memory,
            };
            let entry = guest.run_entry().await?;
            info!(?entry, "guest instantiated");
            Ok::<_, Error>(Instantiated { guest, entry })
        }
        .instrument(info_span!("guest.instantiate"))
        .await
    }
}

/// Live wasmtime instance of the guest.
pub struct WasiGuest {
    store: Store<GuestState>,
    instance: Instance,
    memory: Memory,
}

impl WasiGuest {
    async fn run_entry(&mut self) -> Result<EntryOutcome> {
        let Some(start) = self.instance.get_func(&mut self.store, exports::START) else {
            return Ok(EntryOutcome::Running);
        };
        match start.call_async(&mut self.store, &[], &mut []).await {
            Ok(()) => Ok(EntryOutcome::Running),
            Err(e) => match e.downcast_ref::<I32Exit>() {
                Some(exit) => Ok(EntryOutcome::Exited(exit.0)),
                None => Err(Error::InstantiationFailed(e)),
            },
        }
    }

    /// Largest linear memory size the guest has grown to.
    pub fn peak_memory(&self) -> usize {
        self.store.data().limits.peak_memory()
    }
}

fn to_value(val: &Val) -> anyhow::Result<Value> {
    match val {
        Val::I32(v) => Ok(Value::I32(*v)),
        Val::I64(v) => Ok(Value::I64(*v)),
        Val::F32(bits) => Ok(Value::F32(f32::from_bits(*bits))),
        Val::F64(bits) => Ok(Value::F64(f64::from_bits(*bits))),
        other => Err(anyhow!("unsupported export result value: {other:?}")),
    }
}

#[async_trait]
impl Guest for WasiGuest {
    async fn call(&mut self, export: &str) -> anyhow::Result<Vec<Value>> {
        let func = self
            .instance
            .get_func(&mut self.store, export)
            .with_context(|| format!("guest exports no function `{export}`"))?;
        let ty = func.ty(&self.store);
        let mut results = ty
            .results()
            .map(|t| {
                Val::default_for_ty(&t)
                    .with_context(|| format!("unsupported result type in `{export}`: {t:?}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        func.call_async(&mut self.store, &[], &mut results).await?;
        results.iter().map(to_value).collect()
    }

    fn memory_size(&self) -> usize {
        self.memory.data_size(&self.store)
    }

    fn read_memory(&mut self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let (len, size) = (buf.len(), self.memory_size());
        check_bounds(Access::Read, offset, len, size)?;
        self.memory
            .read(&self.store, offset, buf)
            .map_err(|_| Error::MemoryReadOutOfBounds { offset, len, size })
    }

    fn write_memory(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let (len, size) = (bytes.len(), self.memory_size());
        check_bounds(Access::Write, offset, len, size)?;
        self.memory
            .write(&mut self.store, offset, bytes)
            .map_err(|_| Error::MemoryWriteOutOfBounds { offset, len, size })
    }
}
