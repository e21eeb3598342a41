#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use oxide_stepwise::prelude::*;

pub const MIGRATIONS_DIR: &str = "migrations";

/// Shared state of the scripted driver, handed over as the connection instance.
///
/// Scripts whose body starts with `FAIL` are rejected, anything else applies.
#[derive(Debug)]
pub struct Ledger {
    versions: Mutex<HashMap<String, BTreeSet<u64>>>,
    steps: Mutex<Vec<(u64, Direction)>>,
    pub closes: AtomicUsize,
    pub fail_close: AtomicBool,
    pub gated: AtomicBool,
    pub gate: Semaphore,
}

impl Ledger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            versions: Mutex::default(),
            steps: Mutex::default(),
            closes: AtomicUsize::new(0),
            fail_close: AtomicBool::new(false),
            gated: AtomicBool::new(false),
            gate: Semaphore::new(0),
        })
    }

    pub fn version(&self, id: &str) -> u64 {
        self.versions
            .lock()
            .unwrap()
            .get(id)
            .and_then(|versions| versions.last().copied())
            .unwrap_or(0)
    }

    pub fn set_versions(&self, id: &str, versions: &[u64]) {
        self.versions
            .lock()
            .unwrap()
            .insert(id.to_string(), versions.iter().copied().collect());
    }

    /// Every script that applied successfully, in order.
    pub fn steps(&self) -> Vec<(u64, Direction)> {
        self.steps.lock().unwrap().clone()
    }

    pub fn clear_steps(&self) {
        self.steps.lock().unwrap().clear();
    }
}

#[derive(Default)]
pub struct ScriptedDriver {
    ledger: Option<Arc<Ledger>>,
}

impl ScriptedDriver {
    fn ledger(&self) -> Result<&Arc<Ledger>> {
        self.ledger
            .as_ref()
            .ok_or_else(|| MigrateError::Connection("scripted driver is not initialized".into()))
    }
}

#[async_trait]
impl Driver for ScriptedDriver {
    async fn initialize(&mut self, config: &ConnectionConfig) -> Result<()> {
        let ledger = config
            .instance_as::<Ledger>()
            .ok_or_else(|| MigrateError::Connection("scripted driver needs a Ledger".into()))?;
        self.ledger = Some(ledger);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let ledger = self.ledger()?;
        ledger.closes.fetch_add(1, Ordering::SeqCst);
        if ledger.fail_close.load(Ordering::SeqCst) {
            return Err(MigrateError::Close("ledger is busy".into()));
        }
        Ok(())
    }

    fn filename_extension(&self) -> &'static str {
        "sql"
    }

    async fn version(&self, id: &str) -> Result<u64> {
        Ok(self.ledger()?.version(id))
    }

    async fn migrate(&self, id: &str, file: MigrationFile, pipe: PipeSender) {
        let _ = pipe.send(Event::File(file.clone())).await;
        let Ok(ledger) = self.ledger() else {
            return;
        };

        if ledger.gated.load(Ordering::SeqCst) {
            if let Ok(permit) = ledger.gate.acquire().await {
                permit.forget();
            }
        }

        let result = file.read_content().and_then(|content| {
            if content.trim_start().starts_with("FAIL") {
                Err(MigrateError::Step {
                    file: file.file_name.clone(),
                    message: "syntax error".into(),
                })
            } else {
                Ok(())
            }
        });

        match result {
            Ok(()) => {
                let mut versions = ledger.versions.lock().unwrap();
                let track = versions.entry(id.to_string()).or_default();
                match file.direction {
                    Direction::Up => track.insert(file.version),
                    Direction::Down => track.remove(&file.version),
                };
                drop(versions);
                ledger
                    .steps
                    .lock()
                    .unwrap()
                    .push((file.version, file.direction));
            }
            Err(err) => {
                let _ = pipe.send(Event::Error(err)).await;
            }
        }
    }
}

pub fn scripted_driver() -> Box<dyn Driver> {
    Box::new(ScriptedDriver::default())
}

/// Migrator wired to the scripted driver and an in-memory store.
pub fn scripted_migrator(ledger: &Arc<Ledger>, store: &Arc<MemoryStore>) -> Migrator {
    let instance: Instance = ledger.clone();
    let store: Arc<dyn FileStore> = store.clone();
    Migrator::new("scripted://test")
        .registry(DriverRegistry::default().with("scripted", scripted_driver))
        .instance(instance)
        .store(store)
        .path(MIGRATIONS_DIR)
        .interrupts(InterruptMode::NonGraceful)
}

/// Adds a migration pair with the given bodies.
pub fn add_migration(store: &MemoryStore, version: u64, name: &str, up: &str, down: &str) {
    let dir = Path::new(MIGRATIONS_DIR);
    store.insert(dir.join(format!("{version:04}_{name}.up.sql")), up);
    store.insert(dir.join(format!("{version:04}_{name}.down.sql")), down);
}

/// Drains a pipe, keeping every event.
pub async fn collect(mut pipe: PipeReceiver) -> Vec<Event> {
    let mut events = Vec::new();
    while let Some(event) = pipe.recv().await {
        events.push(event);
    }
    events
}

/// Compact view of an event stream for assertions.
pub fn describe(events: &[Event]) -> Vec<String> {
    events
        .iter()
        .map(|event| match event {
            Event::File(file) => format!("{} {}", file.direction, file.version),
            Event::Error(_) => "error".to_string(),
            Event::Text(_) => "text".to_string(),
        })
        .collect()
}
