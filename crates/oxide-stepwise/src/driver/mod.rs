//! Storage backends.
//!
//! A driver knows how to run one script against its store and how to keep
//! the version ledger for a migration identity. The orchestrator never
//! touches the ledger itself; it only reads it through [`Driver::version`].

mod sqlite;

pub use sqlite::{AppliedVersion, SqliteDriver, CREATE_LEDGER_TABLE_SQL};

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::error::{MigrateError, Result};
use crate::file::MigrationFile;
use crate::pipe::PipeSender;

/// A live connection owned by the caller, e.g. an `sqlx::SqlitePool`.
///
/// Drivers handed an instance use it as is and never close it.
pub type Instance = Arc<dyn Any + Send + Sync>;

/// Where a driver connects to.
#[derive(Clone, Default)]
pub struct ConnectionConfig {
    /// Backend URL; the scheme selects the driver.
    pub url: String,
    /// Externally owned connection to use instead of opening one.
    pub instance: Option<Instance>,
}

impl ConnectionConfig {
    /// Creates a config for `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            instance: None,
        }
    }

    /// Uses an existing connection.
    #[must_use]
    pub fn with_instance(mut self, instance: Instance) -> Self {
        self.instance = Some(instance);
        self
    }

    /// The URL scheme, e.g. `sqlite` for `sqlite://db.sqlite3`.
    pub fn scheme(&self) -> Result<&str> {
        let invalid = |message: &str| MigrateError::InvalidUrl {
            url: self.url.clone(),
            message: message.to_string(),
        };
        let (scheme, _) = self.url.split_once(':').ok_or_else(|| invalid("missing scheme"))?;
        let valid = scheme
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic())
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
        if valid {
            Ok(scheme)
        } else {
            Err(invalid("malformed scheme"))
        }
    }

    /// The instance, if one was given and it has type `T`.
    #[must_use]
    pub fn instance_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.instance.clone()?.downcast::<T>().ok()
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("url", &self.url)
            .field("instance", &self.instance.as_ref().map(|_| ".."))
            .finish()
    }
}

/// Contract every storage backend implements.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Opens (or adopts) the connection and makes sure the version ledger
    /// exists. Must be idempotent with respect to the ledger.
    async fn initialize(&mut self, config: &ConnectionConfig) -> Result<()>;

    /// Releases resources the driver opened itself. A no-op for connections
    /// supplied through [`ConnectionConfig::instance`].
    async fn close(&self) -> Result<()>;

    /// Extension of the scripts this backend runs, without the dot.
    fn filename_extension(&self) -> &'static str;

    /// Highest version applied for `id`, 0 if none.
    async fn version(&self, id: &str) -> Result<u64>;

    /// Applies one script and reports on `pipe`.
    ///
    /// The file must be sent first, followed by any errors. The pipe is
    /// closed by dropping it when done. On failure the ledger must be left
    /// at its value from before the call.
    async fn migrate(&self, id: &str, file: MigrationFile, pipe: PipeSender);
}

/// Builds an uninitialized driver.
pub type DriverConstructor = fn() -> Box<dyn Driver>;

fn sqlite_driver() -> Box<dyn Driver> {
    Box::new(SqliteDriver::new())
}

/// Drivers by URL scheme.
#[derive(Debug, Clone)]
pub struct DriverRegistry {
    constructors: HashMap<String, DriverConstructor>,
}

impl DriverRegistry {
    /// A registry without any driver.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registers (or replaces) the driver for `scheme`.
    #[must_use]
    pub fn with(mut self, scheme: impl Into<String>, constructor: DriverConstructor) -> Self {
        self.register(scheme, constructor);
        self
    }

    /// Registers (or replaces) the driver for `scheme`.
    pub fn register(&mut self, scheme: impl Into<String>, constructor: DriverConstructor) {
        self.constructors.insert(scheme.into(), constructor);
    }

    /// Registered schemes, sorted.
    #[must_use]
    pub fn schemes(&self) -> Vec<&str> {
        let mut schemes: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        schemes.sort_unstable();
        schemes
    }

    /// Creates and initializes the driver for `config`'s scheme.
    pub async fn open(&self, config: &ConnectionConfig) -> Result<Arc<dyn Driver>> {
        let scheme = config.scheme()?;
        let constructor = self
            .constructors
            .get(scheme)
            .ok_or_else(|| MigrateError::UnknownDriver(scheme.to_string()))?;

        let mut driver = constructor();
        driver.initialize(config).await?;
        info!(
            driver = scheme,
            external = config.instance.is_some(),
            "Driver initialized"
        );
        Ok(Arc::from(driver))
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::empty().with("sqlite", sqlite_driver)
    }
}
