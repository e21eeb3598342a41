//! Versioned, file based database migrations.
//!
//! `oxide-stepwise` applies and reverts an ordered set of SQL scripts,
//! keeping track of the highest applied version in the database itself:
//!
//! - Migrations are plain files named `<version>_<name>.<up|down>.<ext>`
//! - Runs are strictly linear: scripts are applied one at a time, in version order
//! - Progress is streamed through a [`pipe`] while the run is going on
//! - Backends are pluggable through the [`driver::Driver`] trait
//!
//! # Architecture
//!
//! - **Pipe** - Channel of progress events (files, errors, text) between a run and its caller
//! - **File** - Discovery, creation and range selection of migration files
//! - **Driver** - Backend contract, plus the SQLite implementation
//! - **Migrator** - Orchestrates a run: open driver, discover, plan, execute, close
//!
//! # Example
//!
//! ```rust,ignore
//! use oxide_stepwise::prelude::*;
//!
//! let migrator = Migrator::new("sqlite://app.sqlite3").path("migrations");
//!
//! migrator.create("init users").await?;
//!
//! let outcome = migrator.up_sync().await;
//! if !outcome.ok {
//!     for err in &outcome.errors {
//!         eprintln!("{err}");
//!     }
//! }
//! ```
//!
//! # CLI Usage
//!
//! ```bash
//! # Create 0001_init_users.up.sql / 0001_init_users.down.sql
//! oxide-stepwise -u sqlite://app.sqlite3 -p migrations create "init users"
//!
//! # Apply pending migrations
//! oxide-stepwise -u sqlite://app.sqlite3 -p migrations up
//!
//! # Roll back the last two migrations
//! oxide-stepwise -u sqlite://app.sqlite3 -p migrations migrate -- -2
//! ```

pub mod driver;
pub mod error;
pub mod file;
pub mod interrupt;
pub mod migrator;
pub mod pipe;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::driver::{ConnectionConfig, Driver, DriverRegistry, Instance, SqliteDriver};
    pub use crate::error::{MigrateError, Result};
    pub use crate::file::{
        Direction, FileStore, FsStore, MemoryStore, MigrationFile, MigrationFilePair,
        MigrationFileSet,
    };
    pub use crate::interrupt::{InterruptHandle, InterruptMode};
    pub use crate::migrator::{Migrator, Operation, Outcome};
    pub use crate::pipe::{Event, PipeReceiver, PipeSender, Verdict};
}
