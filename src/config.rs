use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connection::ConnectionFactory;
use crate::database::Database;
use crate::error::DbError;
use crate::query_counter::QueryCounter;
use crate::worker::ShutdownPolicy;

fn default_ident() -> char {
    '?'
}

/// Options for opening a [`Database`].
///
/// Loading these from the host's configuration is the host's job; they deserialize from
/// JSON (or any serde format) for convenience:
///
/// ```rust
/// use deferred_sql::{DatabaseOptions, ShutdownPolicy};
///
/// let opts = DatabaseOptions::from_json_str(
///     r#"{ "connection_info": "world.db", "ident": "W", "shutdown_policy": "discard" }"#,
/// )?;
/// assert_eq!(opts.ident, 'W');
/// assert_eq!(opts.shutdown_policy, ShutdownPolicy::Discard);
/// # Ok::<(), deferred_sql::DbError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseOptions {
    /// Opaque string handed to every connection's `initialize`.
    pub connection_info: String,
    /// Identity used when counting queries.
    #[serde(default = "default_ident")]
    pub ident: char,
    /// Append statements run through `execute_logged` to a daily file.
    #[serde(default)]
    pub log_sql: bool,
    /// Directory for the audit files. Audit logging is off without one.
    #[serde(default)]
    pub logs_dir: Option<PathBuf>,
    /// Health-check interval for the host's ping loop. Not enforced here.
    #[serde(default)]
    pub ping_interval_ms: u64,
    #[serde(default)]
    pub shutdown_policy: ShutdownPolicy,
}

impl DatabaseOptions {
    #[must_use]
    pub fn new(connection_info: impl Into<String>) -> Self {
        Self {
            connection_info: connection_info.into(),
            ident: default_ident(),
            log_sql: false,
            logs_dir: None,
            ping_interval_ms: 0,
            shutdown_policy: ShutdownPolicy::default(),
        }
    }

    /// Parse options from a JSON document.
    ///
    /// # Errors
    /// Returns [`DbError::ConfigError`] if the document does not describe valid options.
    pub fn from_json_str(json: &str) -> Result<Self, DbError> {
        let opts: Self = serde_json::from_str(json)?;
        if opts.connection_info.trim().is_empty() {
            return Err(DbError::ConfigError("connection_info is empty".into()));
        }
        Ok(opts)
    }

    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// The audit log directory, if audit logging is enabled.
    #[must_use]
    pub fn audit_dir(&self) -> Option<&PathBuf> {
        if self.log_sql { self.logs_dir.as_ref() } else { None }
    }
}

/// Fluent builder for [`DatabaseOptions`] that also opens the [`Database`].
///
/// ```rust,no_run
/// use deferred_sql::prelude::*;
/// use deferred_sql::sqlite::SqliteFactory;
///
/// # fn demo() -> Result<(), DbError> {
/// let db = DatabaseBuilder::new("world.db")
///     .ident('W')
///     .ping_interval_ms(30_000)
///     .connect(SqliteFactory)?;
/// db.execute("CREATE TABLE IF NOT EXISTS t (id INTEGER)")?;
/// # Ok(()) }
/// ```
pub struct DatabaseBuilder {
    opts: DatabaseOptions,
    counter: Option<Arc<QueryCounter>>,
}

impl DatabaseBuilder {
    #[must_use]
    pub fn new(connection_info: impl Into<String>) -> Self {
        Self::from_options(DatabaseOptions::new(connection_info))
    }

    #[must_use]
    pub fn from_options(opts: DatabaseOptions) -> Self {
        Self {
            opts,
            counter: None,
        }
    }

    #[must_use]
    pub fn ident(mut self, ident: char) -> Self {
        self.opts.ident = ident;
        self
    }

    /// Enable audit logging into `dir`.
    #[must_use]
    pub fn log_sql(mut self, dir: impl Into<PathBuf>) -> Self {
        self.opts.log_sql = true;
        self.opts.logs_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn ping_interval_ms(mut self, ms: u64) -> Self {
        self.opts.ping_interval_ms = ms;
        self
    }

    #[must_use]
    pub fn shutdown_policy(mut self, policy: ShutdownPolicy) -> Self {
        self.opts.shutdown_policy = policy;
        self
    }

    /// Count every statement this database runs into `counter`.
    #[must_use]
    pub fn query_counter(mut self, counter: Arc<QueryCounter>) -> Self {
        self.counter = Some(counter);
        self
    }

    #[must_use]
    pub fn finish(self) -> DatabaseOptions {
        self.opts
    }

    /// Open both connections and start the worker.
    ///
    /// # Errors
    /// Returns [`DbError::ConnectionError`] if either connection fails to initialize or the
    /// worker thread cannot be spawned.
    pub fn connect(self, factory: impl ConnectionFactory) -> Result<Database, DbError> {
        Database::open(self.opts, &factory, self.counter)
    }
}
