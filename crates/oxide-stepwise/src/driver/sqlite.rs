//! SQLite driver.
//!
//! The version ledger is the `schema_migrations` table: one row per applied
//! version and migration identity. Each step runs in a single transaction
//! that updates the ledger and executes the script, so a failing script
//! leaves the ledger untouched.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Executor;
use tracing::{debug, info, warn};

use super::{ConnectionConfig, Driver};
use crate::error::{MigrateError, Result};
use crate::file::{Direction, MigrationFile};
use crate::pipe::{Event, PipeSender};

/// SQL to create the version ledger.
pub const CREATE_LEDGER_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    id TEXT NOT NULL,
    version INTEGER NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (id, version)
)
"#;

/// A ledger row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedVersion {
    /// Applied version.
    pub version: u64,
    /// When the version was applied.
    pub applied_at: DateTime<Utc>,
}

/// Driver for `sqlite:` URLs.
#[derive(Debug, Default)]
pub struct SqliteDriver {
    pool: Option<SqlitePool>,
    owns_pool: bool,
}

impl SqliteDriver {
    /// Creates an uninitialized driver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn pool(&self) -> Result<&SqlitePool> {
        self.pool
            .as_ref()
            .ok_or_else(|| MigrateError::Connection("SQLite driver is not initialized".into()))
    }

    /// Lists the applied versions of `id`, oldest first.
    pub async fn history(&self, id: &str) -> Result<Vec<AppliedVersion>> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT version, applied_at FROM schema_migrations WHERE id = ? ORDER BY version",
        )
        .bind(id)
        .fetch_all(self.pool()?)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(version, applied_at)| AppliedVersion {
                version: u64::try_from(version).unwrap_or_default(),
                applied_at: parse_timestamp(&applied_at),
            })
            .collect())
    }
}

/// Runs one script and its ledger update in a single transaction.
///
/// Takes everything by value so the future borrows nothing from the driver.
async fn apply(pool: SqlitePool, id: String, file: MigrationFile) -> Result<()> {
    let version = i64::try_from(file.version)
        .map_err(|_| MigrateError::step(&file.file_name, "version does not fit in INTEGER"))?;
    let content = file.read_content()?;

    let ledger = match file.direction {
        Direction::Up => "INSERT INTO schema_migrations (id, version) VALUES (?, ?)",
        Direction::Down => "DELETE FROM schema_migrations WHERE id = ? AND version = ?",
    };

    let mut tx = pool
        .begin()
        .await
        .map_err(|e| MigrateError::step(&file.file_name, e))?;

    let mut result = sqlx::query(ledger)
        .bind(id)
        .bind(version)
        .execute(&mut *tx)
        .await
        .map(|_| ());
    if result.is_ok() {
        if content.trim().is_empty() {
            debug!(file = %file.file_name, "Empty script, only updating the ledger");
        } else {
            result = (&mut *tx).execute(content.as_str()).await.map(|_| ());
        }
    }

    match result {
        Ok(()) => tx
            .commit()
            .await
            .map_err(|e| MigrateError::step(&file.file_name, e)),
        Err(err) => {
            if let Err(rollback) = tx.rollback().await {
                warn!(file = %file.file_name, error = %rollback, "Rollback failed");
            }
            Err(MigrateError::step(&file.file_name, err))
        }
    }
}

#[async_trait]
impl Driver for SqliteDriver {
    async fn initialize(&mut self, config: &ConnectionConfig) -> Result<()> {
        if let Some(pool) = config.instance_as::<SqlitePool>() {
            self.pool = Some((*pool).clone());
            self.owns_pool = false;
        } else {
            let options = SqliteConnectOptions::from_str(&config.url)
                .map_err(|e| MigrateError::InvalidUrl {
                    url: config.url.clone(),
                    message: e.to_string(),
                })?
                .create_if_missing(true);
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .connect_with(options)
                .await
                .map_err(|e| MigrateError::Connection(e.to_string()))?;
            self.pool = Some(pool);
            self.owns_pool = true;
        }

        sqlx::query(CREATE_LEDGER_TABLE_SQL)
            .execute(self.pool()?)
            .await
            .map_err(|e| MigrateError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        match &self.pool {
            Some(pool) if self.owns_pool => pool.close().await,
            _ => {}
        }
        Ok(())
    }

    fn filename_extension(&self) -> &'static str {
        "sql"
    }

    async fn version(&self, id: &str) -> Result<u64> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT version FROM schema_migrations WHERE id = ? ORDER BY version DESC LIMIT 1",
        )
        .bind(id)
        .fetch_optional(self.pool()?)
        .await
        .map_err(|e| MigrateError::VersionQuery(e.to_string()))?;

        row.map_or(Ok(0), |(version,)| {
            u64::try_from(version)
                .map_err(|_| MigrateError::VersionQuery(format!("negative version {version}")))
        })
    }

    async fn migrate(&self, id: &str, file: MigrationFile, pipe: PipeSender) {
        info!(
            version = file.version,
            direction = %file.direction,
            file = %file.file_name,
            "Running migration"
        );
        // A missing consumer does not stop the step: it is already committed to.
        let _ = pipe.send(Event::File(file.clone())).await;

        let result = match self.pool().cloned() {
            Ok(pool) => apply(pool, id.to_string(), file.clone()).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => debug!(file = %file.file_name, "Migration applied"),
            Err(err) => {
                warn!(file = %file.file_name, error = %err, "Migration failed");
                let _ = pipe.send(Event::Error(err)).await;
            }
        }
    }
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| {
            // SQLite datetime('now') format
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
                .map(|dt| dt.and_utc())
                .unwrap_or_else(|_| Utc::now())
        })
}
