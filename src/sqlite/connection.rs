use std::fmt;
use std::time::Duration;

use crate::connection::{ConnectionFactory, SqlConnection};
use crate::error::DbError;
use crate::results::ResultSet;
use crate::types::Statement;

use super::params::Params;
use super::query::build_result_set;

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// `SQLite` session for a [`Database`](crate::Database). The connection info is the
/// database path (or `:memory:`).
///
/// Both connections of a facade open the same file, so writers on one wait up to the
/// busy timeout for the other.
pub struct SqliteConnection {
    conn: Option<rusqlite::Connection>,
    busy_timeout: Duration,
}

impl SqliteConnection {
    #[must_use]
    pub fn new() -> Self {
        Self {
            conn: None,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    fn conn(&mut self) -> Result<&mut rusqlite::Connection, DbError> {
        self.conn
            .as_mut()
            .ok_or_else(|| DbError::ConnectionError("SQLite connection not initialized".into()))
    }
}

impl Default for SqliteConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SqliteConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteConnection")
            .field("open", &self.conn.is_some())
            .field("busy_timeout", &self.busy_timeout)
            .finish()
    }
}

impl SqlConnection for SqliteConnection {
    fn initialize(&mut self, info: &str) -> Result<(), DbError> {
        let conn = rusqlite::Connection::open(info).map_err(|e| {
            DbError::ConnectionError(format!("Failed to open SQLite database {info}: {e}"))
        })?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
        ",
        )?;
        self.conn = Some(conn);
        Ok(())
    }

    fn query(&mut self, statement: &Statement) -> Result<ResultSet, DbError> {
        let conn = self.conn()?;
        let params = Params::convert(statement.params());
        let mut stmt = conn.prepare_cached(statement.sql())?;
        build_result_set(&mut stmt, params.as_values())
    }

    fn execute(&mut self, statement: &Statement) -> Result<usize, DbError> {
        let conn = self.conn()?;
        if statement.params().is_empty() {
            // May hold several `;`-separated statements.
            conn.execute_batch(statement.sql())?;
            return Ok(usize::try_from(conn.changes()).unwrap_or(usize::MAX));
        }
        let params = Params::convert(statement.params());
        let mut stmt = conn.prepare_cached(statement.sql())?;
        Ok(stmt.execute(&params.as_refs()[..])?)
    }

    fn escape_string(&self, raw: &str) -> String {
        raw.replace('\'', "''")
    }

    fn begin_transaction(&mut self) -> Result<(), DbError> {
        Ok(self.conn()?.execute_batch("BEGIN")?)
    }

    fn commit_transaction(&mut self) -> Result<(), DbError> {
        Ok(self.conn()?.execute_batch("COMMIT")?)
    }

    fn rollback_transaction(&mut self) -> Result<(), DbError> {
        Ok(self.conn()?.execute_batch("ROLLBACK")?)
    }
}

/// Factory producing [`SqliteConnection`]s with the default busy timeout.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteFactory;

impl ConnectionFactory for SqliteFactory {
    fn create_connection(&self) -> Box<dyn SqlConnection> {
        Box::new(SqliteConnection::new())
    }
}
