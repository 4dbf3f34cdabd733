//! In-process stand-ins for the sandbox engine.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use anyhow::anyhow;
use async_trait::async_trait;

use crate::{
    channel::QUERY_BUFFER_OFFSET,
    error::{Error, Result},
    exports,
    sandbox::{
        Access, EntryOutcome, Guest, GuestConfig, Instantiated, Runtime, Value, check_bounds,
    },
};

/// Observations shared between a stub guest and the test body.
#[derive(Debug, Default)]
pub struct Journal {
    /// Every export invocation, in order.
    pub calls: Vec<String>,
    /// Query text seen by each `interactive_one` call.
    pub queries: Vec<String>,
}

pub type SharedJournal = Arc<Mutex<Journal>>;

pub fn calls(journal: &SharedJournal) -> Vec<String> {
    journal.lock().expect("journal lock poisoned").calls.clone()
}

pub fn queries(journal: &SharedJournal) -> Vec<String> {
    journal.lock().expect("journal lock poisoned").queries.clone()
}

pub struct StubGuest {
    memory: Vec<u8>,
    journal: SharedJournal,
    /// Export name -> 1-based invocation number that fails.
    failures: HashMap<String, usize>,
    invocations: HashMap<String, usize>,
}

impl StubGuest {
    pub fn new(memory_size: usize) -> (Self, SharedJournal) {
        let journal = SharedJournal::default();
        let guest = Self {
            memory: vec![0xAA; memory_size],
            journal: Arc::clone(&journal),
            failures: HashMap::new(),
            invocations: HashMap::new(),
        };
        (guest, journal)
    }

    /// Make the `nth` call (1-based) of `export` fail.
    #[must_use]
    pub fn fail_on(mut self, export: &str, nth: usize) -> Self {
        self.failures.insert(export.to_string(), nth);
        self
    }

    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    fn query_buffer(&self) -> String {
        let buf = &self.memory[QUERY_BUFFER_OFFSET..];
        let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
        String::from_utf8_lossy(&buf[..end]).into_owned()
    }
}

#[async_trait]
impl Guest for StubGuest {
    async fn call(&mut self, export: &str) -> anyhow::Result<Vec<Value>> {
        let n = self.invocations.entry(export.to_string()).or_default();
        *n += 1;
        let n = *n;

        let mut journal = self.journal.lock().expect("journal lock poisoned");
        journal.calls.push(export.to_string());
        if export == exports::INTERACTIVE_ONE {
            journal.queries.push(self.query_buffer());
        }
        drop(journal);

        if self.failures.get(export) == Some(&n) {
            return Err(anyhow!("wasm trap: unreachable in `{export}`"));
        }
        match export {
            exports::PG_INITDB => Ok(vec![Value::I32(0b1110)]),
            exports::USE_SOCKETFILE | exports::INTERACTIVE_ONE => Ok(Vec::new()),
            other => Err(anyhow!("guest exports no function `{other}`")),
        }
    }

    fn memory_size(&self) -> usize {
        self.memory.len()
    }

    fn read_memory(&mut self, offset: usize, buf: &mut [u8]) -> Result<()> {
        check_bounds(Access::Read, offset, buf.len(), self.memory.len())?;
        buf.copy_from_slice(&self.memory[offset..offset + buf.len()]);
        Ok(())
    }

    fn write_memory(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        check_bounds(Access::Write, offset, bytes.len(), self.memory.len())?;
        self.memory[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

/// Runtime handing out one pre-built guest with a scripted entry outcome.
pub struct StubRuntime {
    guest: Mutex<Option<StubGuest>>,
    entry: EntryOutcome,
    pub seen_config: Mutex<Option<GuestConfig>>,
}

impl StubRuntime {
    pub fn new(guest: StubGuest, entry: EntryOutcome) -> Self {
        Self {
            guest: Mutex::new(Some(guest)),
            entry,
            seen_config: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Runtime for StubRuntime {
    type Guest = StubGuest;

    async fn instantiate(&self, config: &GuestConfig) -> Result<Instantiated<StubGuest>> {
        *self.seen_config.lock().expect("config lock poisoned") = Some(config.clone());
        let guest = self
            .guest
            .lock()
            .expect("guest lock poisoned")
            .take()
            .ok_or_else(|| Error::InstantiationFailed(anyhow!("stub guest already taken")))?;
        Ok(Instantiated {
            guest,
            entry: self.entry,
        })
    }
}
