//! Migration orchestrator.
//!
//! A [`Migrator`] opens a driver, discovers the migration files, reads the
//! current version, selects the scripts to run and drives them one at a
//! time, streaming progress into a pipe.
//!
//! Every operation comes in two flavours: a streaming one that takes the
//! pipe to report into (and closes it when done) and returns the run's
//! [`Verdict`], and a `*_sync` one that waits for the run and returns the
//! collected errors.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::driver::{ConnectionConfig, Driver, DriverRegistry, Instance};
use crate::error::{MigrateError, Result};
use crate::file::{self, FileStore, FsStore, MigrationFile, MigrationFilePair, MigrationFileSet};
use crate::interrupt::InterruptMode;
use crate::pipe::{self, Event, PipeReceiver, PipeSender, Verdict};

/// A migration run a caller can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Apply every pending migration.
    Up,
    /// Roll back every applied migration.
    Down,
    /// Move `n` migrations forward (positive) or back (negative).
    Migrate(i64),
    /// Move to exactly this version.
    Goto(u64),
    /// Roll back the latest migration and apply it again.
    Redo,
    /// `Down` followed by `Up`.
    Reset,
}

/// Single-pass selections; composite operations chain two of these.
#[derive(Debug, Clone, Copy)]
enum Plan {
    ToLast,
    ToFirst,
    Relative(i64),
    Target(u64),
}

impl Plan {
    fn select(self, files: &MigrationFileSet, current: u64) -> Result<Vec<MigrationFile>> {
        match self {
            Self::ToLast => Ok(files.to_last_from(current)),
            Self::ToFirst => Ok(files.to_first_from(current)),
            Self::Relative(n) => files.from(current, n),
            Self::Target(version) => files.to(current, version),
        }
    }
}

/// Result of a run waited for with one of the `*_sync` methods.
#[derive(Debug)]
pub struct Outcome {
    /// Every error reported, in order.
    pub errors: Vec<MigrateError>,
    /// Whether the run succeeded. Failing to close the driver after the run
    /// is reported in `errors` but does not count as a failure.
    pub ok: bool,
    /// Whether the run was interrupted before reaching its target.
    pub aborted: bool,
}

impl Outcome {
    fn new(errors: Vec<MigrateError>, verdict: Verdict) -> Self {
        let ok = verdict != Verdict::Failed
            && errors
                .iter()
                .all(|err| matches!(err, MigrateError::Close(_)));
        Self {
            errors,
            ok,
            aborted: verdict == Verdict::Aborted,
        }
    }
}

/// What a single pass did before its driver was closed.
#[derive(Debug, Clone, Copy)]
struct Pass {
    verdict: Verdict,
    completed: usize,
}

/// Runs migrations from a directory against a driver.
#[derive(Debug, Clone)]
pub struct Migrator {
    id: String,
    connection: ConnectionConfig,
    path: PathBuf,
    store: Arc<dyn FileStore>,
    registry: Arc<DriverRegistry>,
    interrupts: InterruptMode,
}

impl Migrator {
    /// Creates a migrator for the driver behind `url`, reading migrations
    /// from the current directory.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            connection: ConnectionConfig::new(url),
            path: PathBuf::from("."),
            store: Arc::new(FsStore),
            registry: Arc::new(DriverRegistry::default()),
            interrupts: InterruptMode::default(),
        }
    }

    /// Sets the migration identity whose version track is used.
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Uses an existing connection instead of opening one. It is not closed.
    #[must_use]
    pub fn instance(mut self, instance: Instance) -> Self {
        self.connection.instance = Some(instance);
        self
    }

    /// Sets the directory holding the migration files.
    #[must_use]
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    /// Reads migration files from `store` instead of the file system.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn FileStore>) -> Self {
        self.store = store;
        self
    }

    /// Replaces the set of available drivers.
    #[must_use]
    pub fn registry(mut self, registry: DriverRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Sets how interrupts are handled.
    #[must_use]
    pub fn interrupts(mut self, mode: InterruptMode) -> Self {
        self.interrupts = mode;
        self
    }

    /// Applies every pending migration.
    pub async fn up(&self, pipe: PipeSender) -> Verdict {
        self.single(pipe, Plan::ToLast).await
    }

    /// Rolls back every applied migration.
    pub async fn down(&self, pipe: PipeSender) -> Verdict {
        self.single(pipe, Plan::ToFirst).await
    }

    /// Applies (`relative_n > 0`) or rolls back (`relative_n < 0`) that many
    /// migrations.
    pub async fn migrate(&self, pipe: PipeSender, relative_n: i64) -> Verdict {
        self.single(pipe, Plan::Relative(relative_n)).await
    }

    /// Migrates up or down to exactly `version`.
    pub async fn goto(&self, pipe: PipeSender, version: u64) -> Verdict {
        self.single(pipe, Plan::Target(version)).await
    }

    /// Rolls back the most recent migration, then applies it again.
    ///
    /// Nothing is re-applied when no migration was rolled back, so a redo at
    /// version 0 is a no-op.
    pub async fn redo(&self, pipe: PipeSender) -> Verdict {
        self.chain(pipe, Plan::Relative(-1), Plan::Relative(1), true)
            .await
    }

    /// Rolls back everything, then applies everything.
    pub async fn reset(&self, pipe: PipeSender) -> Verdict {
        self.chain(pipe, Plan::ToFirst, Plan::ToLast, false).await
    }

    /// Runs `operation`, reporting into `pipe`.
    pub async fn execute(&self, pipe: PipeSender, operation: Operation) -> Verdict {
        info!(?operation, id = %self.id, "Starting migration run");
        let verdict = match operation {
            Operation::Up => self.up(pipe).await,
            Operation::Down => self.down(pipe).await,
            Operation::Migrate(n) => self.migrate(pipe, n).await,
            Operation::Goto(version) => self.goto(pipe, version).await,
            Operation::Redo => self.redo(pipe).await,
            Operation::Reset => self.reset(pipe).await,
        };
        info!(?operation, ?verdict, "Migration run ended");
        verdict
    }

    /// Starts `operation` in the background and returns its progress stream.
    #[must_use]
    pub fn stream(&self, operation: Operation) -> PipeReceiver {
        let (tx, rx) = pipe::new();
        let migrator = self.clone();
        tokio::spawn(async move { migrator.execute(tx, operation).await });
        rx
    }

    /// Runs `operation` to completion and collects its errors.
    pub async fn execute_sync(&self, operation: Operation) -> Outcome {
        let (tx, rx) = pipe::new();
        let (verdict, errors) =
            tokio::join!(self.execute(tx, operation), pipe::read_errors(rx));
        Outcome::new(errors, verdict)
    }

    /// Waiting version of [`Migrator::up`].
    pub async fn up_sync(&self) -> Outcome {
        self.execute_sync(Operation::Up).await
    }

    /// Waiting version of [`Migrator::down`].
    pub async fn down_sync(&self) -> Outcome {
        self.execute_sync(Operation::Down).await
    }

    /// Waiting version of [`Migrator::migrate`].
    pub async fn migrate_sync(&self, relative_n: i64) -> Outcome {
        self.execute_sync(Operation::Migrate(relative_n)).await
    }

    /// Waiting version of [`Migrator::goto`].
    pub async fn goto_sync(&self, version: u64) -> Outcome {
        self.execute_sync(Operation::Goto(version)).await
    }

    /// Waiting version of [`Migrator::redo`].
    pub async fn redo_sync(&self) -> Outcome {
        self.execute_sync(Operation::Redo).await
    }

    /// Waiting version of [`Migrator::reset`].
    pub async fn reset_sync(&self) -> Outcome {
        self.execute_sync(Operation::Reset).await
    }

    /// Reads the current version.
    pub async fn version(&self) -> Result<u64> {
        let driver = self.registry.open(&self.connection).await?;
        let version = driver.version(&self.id).await;
        release(driver.as_ref()).await;
        version
    }

    /// Reads the migration files the driver would run.
    pub async fn files(&self) -> Result<MigrationFileSet> {
        let driver = self.registry.open(&self.connection).await?;
        let files = file::discover(&self.store, &self.path, driver.filename_extension());
        release(driver.as_ref()).await;
        files
    }

    /// Writes an empty migration pair named `name` for the next version.
    pub async fn create(&self, name: &str) -> Result<MigrationFilePair> {
        let driver = self.registry.open(&self.connection).await?;
        let extension = driver.filename_extension();
        release(driver.as_ref()).await;

        let pair = file::create(&self.store, &self.path, name, extension)?;
        info!(
            version = pair.version,
            path = %self.path.display(),
            "Created migration files"
        );
        Ok(pair)
    }

    async fn single(&self, pipe: PipeSender, plan: Plan) -> Verdict {
        let pass = self.run(&pipe, plan).await;
        finish(pipe, pass).await
    }

    /// Runs `first`, then `second` only if `first` completed. With
    /// `needs_step`, `first` must also have run at least one script.
    ///
    /// Both passes report straight into `pipe`; interrupts are observed by
    /// their steps only.
    async fn chain(
        &self,
        pipe: PipeSender,
        first: Plan,
        second: Plan,
        needs_step: bool,
    ) -> Verdict {
        let pass = match self.run(&pipe, first).await {
            Ok(pass) if pass.verdict.is_success() && (pass.completed > 0 || !needs_step) => {
                self.run(&pipe, second).await
            }
            Ok(pass) => {
                if pass.verdict.is_success() {
                    debug!(?first, "Nothing was rolled back, skipping {second:?}");
                } else {
                    warn!(
                        ?first,
                        verdict = ?pass.verdict,
                        "First phase did not complete, skipping {second:?}"
                    );
                }
                Ok(pass)
            }
            Err(err) => Err(err),
        };
        finish(pipe, pass).await
    }

    async fn prepare(&self) -> Result<(Arc<dyn Driver>, MigrationFileSet, u64)> {
        let driver = self.registry.open(&self.connection).await?;

        let files = match file::discover(&self.store, &self.path, driver.filename_extension()) {
            Ok(files) => files,
            Err(err) => {
                release(driver.as_ref()).await;
                return Err(err);
            }
        };

        match driver.version(&self.id).await {
            Ok(version) => Ok((driver, files, version)),
            Err(err) => {
                release(driver.as_ref()).await;
                Err(err)
            }
        }
    }

    /// One pass over the selected scripts. Errors returned here happened
    /// before any step ran; the driver is already closed either way.
    async fn run(&self, pipe: &PipeSender, plan: Plan) -> Result<Pass> {
        let (driver, files, version) = self.prepare().await.inspect_err(|err| {
            error!(error = %err, "Migration run failed before executing any step");
        })?;

        let steps = match plan.select(&files, version) {
            Ok(steps) => steps,
            Err(err) => {
                error!(error = %err, "Could not select migrations");
                close_driver(driver.as_ref(), pipe).await;
                return Err(err);
            }
        };
        debug!(?plan, current = version, steps = steps.len(), "Planned migration run");

        let total = steps.len();
        let mut pass = Pass {
            verdict: Verdict::Completed,
            completed: 0,
        };
        for file in steps {
            pass.verdict = self.step(&driver, file, pipe).await;
            if !pass.verdict.is_success() {
                warn!(
                    completed = pass.completed,
                    total,
                    verdict = ?pass.verdict,
                    "Stopping migration run"
                );
                break;
            }
            pass.completed += 1;
        }

        close_driver(driver.as_ref(), pipe).await;
        info!(completed = pass.completed, total, "Migration pass finished");
        Ok(pass)
    }

    /// Runs one script on its own task and forwards its events.
    async fn step(
        &self,
        driver: &Arc<dyn Driver>,
        file: MigrationFile,
        pipe: &PipeSender,
    ) -> Verdict {
        let (tx, rx) = pipe::new();
        let interrupt = self.interrupts.listen();
        let file_name = file.file_name.clone();
        let driver = Arc::clone(driver);
        let id = self.id.clone();
        let task = tokio::spawn(async move { driver.migrate(&id, file, tx).await });

        let verdict = pipe::wait_and_redirect(rx, pipe, interrupt).await;
        if let Err(join_error) = task.await {
            error!(file = %file_name, error = %join_error, "Driver task failed");
            let err = MigrateError::step(file_name, format!("driver task failed: {join_error}"));
            let _ = pipe.send(Event::Error(err)).await;
            return Verdict::Failed;
        }
        verdict
    }
}

/// Closes `pipe`, adding the error that stopped the run before any step.
async fn finish(pipe: PipeSender, pass: Result<Pass>) -> Verdict {
    match pass {
        Ok(pass) => {
            pipe::close(pipe, None).await;
            pass.verdict
        }
        Err(err) => {
            pipe::close(pipe, Some(err)).await;
            Verdict::Failed
        }
    }
}

/// Closes a driver whose failure is already being reported.
async fn release(driver: &dyn Driver) {
    if let Err(err) = driver.close().await {
        warn!(error = %err, "Failed to close driver");
    }
}

/// Closes a driver at the end of a run, reporting failures on `pipe`.
async fn close_driver(driver: &dyn Driver, pipe: &PipeSender) {
    if let Err(err) = driver.close().await {
        warn!(error = %err, "Failed to close driver");
        let err = match err {
            MigrateError::Close(_) => err,
            other => MigrateError::Close(other.to_string()),
        };
        let _ = pipe.send(Event::Error(err)).await;
    }
}
