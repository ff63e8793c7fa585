//! Per-statement invocation counts, persisted periodically through a [`Database`].
//!
//! A [`QueryCounter`] is an ordinary value: build it, hand an `Arc` of it to every
//! [`DatabaseBuilder`](crate::DatabaseBuilder) whose statements should be counted, and
//! wire the database that receives the flushed rows with [`QueryCounter::set_database`].
//!
//! Rows land in a `query_counter (starttime, ident, query, count)` table. Flushing
//! deletes the rows of the current run (same `starttime`) and re-inserts the table,
//! all inside one transaction on the wired database.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::database::Database;
use crate::error::DbError;
use crate::types::{RowValues, Statement};

const DELETE_RUN_SQL: &str = "DELETE FROM query_counter WHERE starttime = ?1";
const INSERT_COUNT_SQL: &str = "INSERT INTO query_counter VALUES (?1, ?2, ?3, ?4)";

/// Whether a successful flush clears the in-memory table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CounterFlushMode {
    /// Keep counting from the persisted totals; each flush rewrites the run's rows.
    #[default]
    Cumulative,
    /// Start from zero after every successful flush.
    Reset,
}

type CountStore = BTreeMap<char, BTreeMap<String, u64>>;

pub struct QueryCounter {
    enabled: AtomicBool,
    start_time: i64,
    flush_mode: Mutex<CounterFlushMode>,
    database: Mutex<Weak<Database>>,
    store: Mutex<CountStore>,
}

impl QueryCounter {
    /// A disabled counter keyed on `start_time` (seconds since the epoch of the run start).
    #[must_use]
    pub fn new(start_time: i64) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            start_time,
            flush_mode: Mutex::new(CounterFlushMode::default()),
            database: Mutex::new(Weak::new()),
            store: Mutex::new(CountStore::new()),
        }
    }

    /// A disabled counter keyed on the current wall-clock time.
    #[must_use]
    pub fn starting_now() -> Self {
        Self::new(chrono::Utc::now().timestamp())
    }

    #[must_use]
    pub fn start_time(&self) -> i64 {
        self.start_time
    }

    /// Wire the database flushed rows are written to. Only a weak reference is kept.
    pub fn set_database(&self, db: &Arc<Database>) {
        *lock(&self.database) = Arc::downgrade(db);
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_flush_mode(&self, mode: CounterFlushMode) {
        *lock(&self.flush_mode) = mode;
    }

    #[must_use]
    pub fn flush_mode(&self) -> CounterFlushMode {
        *lock(&self.flush_mode)
    }

    /// Count one execution of `sql` on the connection identified by `ident`.
    pub fn count_query(&self, ident: char, sql: &str) {
        if !self.is_enabled() {
            return;
        }
        let mut store = lock(&self.store);
        *store
            .entry(ident)
            .or_default()
            .entry(sql.to_owned())
            .or_insert(0) += 1;
    }

    #[must_use]
    pub fn count(&self, ident: char, sql: &str) -> u64 {
        lock(&self.store)
            .get(&ident)
            .and_then(|queries| queries.get(sql))
            .copied()
            .unwrap_or(0)
    }

    /// Every `(ident, statement, count)` entry, ordered by ident then statement text.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(char, String, u64)> {
        lock(&self.store)
            .iter()
            .flat_map(|(ident, queries)| {
                queries
                    .iter()
                    .map(move |(sql, count)| (*ident, sql.clone(), *count))
            })
            .collect()
    }

    /// Persist the table through the wired database and return the number of rows written.
    ///
    /// Holding the store lock for the whole flush serializes concurrent callers. The rows
    /// are committed asynchronously on the database's worker.
    ///
    /// # Errors
    /// [`DbError::NotConfigured`] if no database is wired (or it was dropped); otherwise any
    /// error from opening, staging or committing the transaction. Errors are also logged.
    pub fn save_data(&self) -> Result<usize, DbError> {
        if !self.is_enabled() {
            return Ok(0);
        }
        let Some(db) = lock(&self.database).upgrade() else {
            tracing::error!("QueryCounter: no database wired for saving");
            return Err(DbError::NotConfigured(
                "query counter has no persistence database".into(),
            ));
        };

        let mut store = lock(&self.store);
        tracing::debug!(idents = store.len(), "QueryCounter: saving queries");

        let outcome = db.begin_transaction().and_then(|()| {
            let rows = self.stage_rows(&db, &store)?;
            db.commit_transaction()?;
            Ok(rows)
        });
        match outcome {
            Ok(rows) => {
                if self.flush_mode() == CounterFlushMode::Reset {
                    store.clear();
                }
                Ok(rows)
            }
            Err(err) => {
                if !matches!(err, DbError::TransactionAlreadyOpen) {
                    db.rollback_transaction();
                }
                tracing::error!("QueryCounter: saving failed: {err}");
                Err(err)
            }
        }
    }

    fn stage_rows(&self, db: &Database, store: &CountStore) -> Result<usize, DbError> {
        db.async_execute_statement(Statement::with_params(
            DELETE_RUN_SQL,
            vec![RowValues::Int(self.start_time)],
        ))?;
        let mut rows = 0;
        for (ident, queries) in store {
            for (sql, count) in queries {
                db.async_execute_statement(Statement::with_params(
                    INSERT_COUNT_SQL,
                    vec![
                        RowValues::Int(self.start_time),
                        RowValues::Int(i64::from(u32::from(*ident))),
                        RowValues::Text(sql.clone()),
                        RowValues::Int(i64::try_from(*count).unwrap_or(i64::MAX)),
                    ],
                ))?;
                rows += 1;
            }
        }
        Ok(rows)
    }
}

impl std::fmt::Debug for QueryCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCounter")
            .field("enabled", &self.is_enabled())
            .field("start_time", &self.start_time)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The counting hook a database and its worker share.
#[derive(Clone, Default)]
pub(crate) struct QueryTally {
    counter: Option<Arc<QueryCounter>>,
    ident: char,
}

impl QueryTally {
    pub(crate) fn new(counter: Option<Arc<QueryCounter>>, ident: char) -> Self {
        Self { counter, ident }
    }

    pub(crate) fn record(&self, sql: &str) {
        if let Some(counter) = &self.counter {
            counter.count_query(self.ident, sql);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_counter_records_nothing() {
        let counter = QueryCounter::new(100);
        counter.count_query('A', "SELECT 1");
        assert_eq!(counter.count('A', "SELECT 1"), 0);

        counter.enable();
        counter.count_query('A', "SELECT 1");
        counter.count_query('A', "SELECT 1");
        counter.disable();
        counter.count_query('A', "SELECT 1");
        assert_eq!(counter.count('A', "SELECT 1"), 2);
    }

    #[test]
    fn snapshot_groups_by_ident() {
        let counter = QueryCounter::new(0);
        counter.enable();
        counter.count_query('W', "SELECT 2");
        counter.count_query('L', "SELECT 1");
        counter.count_query('W', "SELECT 2");
        assert_eq!(
            counter.snapshot(),
            vec![
                ('L', "SELECT 1".to_owned(), 1),
                ('W', "SELECT 2".to_owned(), 2),
            ]
        );
    }

    #[test]
    fn save_without_database_is_not_configured() {
        let counter = QueryCounter::new(0);
        assert_eq!(counter.save_data().unwrap(), 0);
        counter.enable();
        assert!(matches!(counter.save_data(), Err(DbError::NotConfigured(_))));
    }

    #[test]
    fn tally_without_counter_is_inert() {
        QueryTally::default().record("SELECT 1");
        let counter = Arc::new(QueryCounter::new(0));
        counter.enable();
        QueryTally::new(Some(Arc::clone(&counter)), 'Z').record("SELECT 1");
        assert_eq!(counter.count('Z', "SELECT 1"), 1);
    }
}
