//! Scriptable in-memory connections for exercising a [`Database`](crate::Database)
//! without a real backing store.
//!
//! Every connection made by one [`MemoryStore`]'s factory shares its journal, so tests
//! can see which connection (and which thread) ran each statement and in what order.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::connection::{ConnectionFactory, SqlConnection};
use crate::error::DbError;
use crate::results::ResultSet;
use crate::types::{RowValues, Statement};

/// Index of the synchronous connection: the factory's first product.
pub const SYNC_CONNECTION: usize = 0;
/// Index of the worker's connection: the factory's second product.
pub const ASYNC_CONNECTION: usize = 1;

/// One statement as a connection saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    pub seq: usize,
    pub connection: usize,
    pub sql: String,
    pub params: Vec<RowValues>,
    pub thread: ThreadId,
}

#[derive(Default)]
struct StoreState {
    next_connection: usize,
    journal: Vec<JournalEntry>,
    visible: Vec<String>,
    failing: HashSet<String>,
    fail_commit: bool,
    fail_initialize: bool,
    delays: HashMap<String, Duration>,
    responses: HashMap<String, Vec<RowValues>>,
    commits: usize,
    rollbacks: usize,
}

/// Shared state behind every [`MemoryConnection`] made by [`MemoryStore::factory`].
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn factory(&self) -> MemoryFactory {
        MemoryFactory {
            store: self.clone(),
        }
    }

    /// Make every execution of `sql` fail.
    pub fn fail_on(&self, sql: &str) {
        self.state().failing.insert(sql.to_owned());
    }

    pub fn fail_commits(&self, fail: bool) {
        self.state().fail_commit = fail;
    }

    pub fn fail_initialize(&self, fail: bool) {
        self.state().fail_initialize = fail;
    }

    /// Sleep for `delay` whenever `sql` runs, outside the store lock.
    pub fn delay(&self, sql: &str, delay: Duration) {
        self.state().delays.insert(sql.to_owned(), delay);
    }

    /// Answer queries for `sql` with one row per value, in a column named `value`.
    pub fn respond(&self, sql: &str, values: Vec<RowValues>) {
        self.state().responses.insert(sql.to_owned(), values);
    }

    #[must_use]
    pub fn journal(&self) -> Vec<JournalEntry> {
        self.state().journal.clone()
    }

    /// Statement texts run on `connection`, in order.
    #[must_use]
    pub fn executed_on(&self, connection: usize) -> Vec<String> {
        self.state()
            .journal
            .iter()
            .filter(|entry| entry.connection == connection)
            .map(|entry| entry.sql.clone())
            .collect()
    }

    /// Statements whose effects landed: run outside a transaction, or committed.
    #[must_use]
    pub fn visible(&self) -> Vec<String> {
        self.state().visible.clone()
    }

    #[must_use]
    pub fn commits(&self) -> usize {
        self.state().commits
    }

    #[must_use]
    pub fn rollbacks(&self) -> usize {
        self.state().rollbacks
    }
}

/// Creates [`MemoryConnection`]s numbered in creation order.
#[derive(Clone)]
pub struct MemoryFactory {
    store: MemoryStore,
}

impl ConnectionFactory for MemoryFactory {
    fn create_connection(&self) -> Box<dyn SqlConnection> {
        let id = {
            let mut state = self.store.state();
            let id = state.next_connection;
            state.next_connection += 1;
            id
        };
        Box::new(MemoryConnection {
            id,
            store: self.store.clone(),
            in_transaction: false,
            pending: Vec::new(),
        })
    }
}

pub struct MemoryConnection {
    id: usize,
    store: MemoryStore,
    in_transaction: bool,
    pending: Vec<String>,
}

impl MemoryConnection {
    fn run(&mut self, statement: &Statement) -> Result<(), DbError> {
        let delay = self.store.state().delays.get(statement.sql()).copied();
        if let Some(delay) = delay {
            thread::sleep(delay);
        }

        let mut state = self.store.state();
        let seq = state.journal.len();
        state.journal.push(JournalEntry {
            seq,
            connection: self.id,
            sql: statement.sql().to_owned(),
            params: statement.params().to_vec(),
            thread: thread::current().id(),
        });
        if state.failing.contains(statement.sql()) {
            return Err(DbError::ExecutionError(format!(
                "scripted failure: {}",
                statement.sql()
            )));
        }
        if self.in_transaction {
            self.pending.push(statement.sql().to_owned());
        } else {
            state.visible.push(statement.sql().to_owned());
        }
        Ok(())
    }
}

impl SqlConnection for MemoryConnection {
    fn initialize(&mut self, info: &str) -> Result<(), DbError> {
        if self.store.state().fail_initialize {
            return Err(DbError::ConnectionError(format!("cannot reach {info}")));
        }
        Ok(())
    }

    fn query(&mut self, statement: &Statement) -> Result<ResultSet, DbError> {
        self.run(statement)?;
        let values = self
            .store
            .state()
            .responses
            .get(statement.sql())
            .cloned()
            .unwrap_or_default();
        let mut rs = ResultSet::with_capacity(values.len());
        rs.set_column_names(Arc::new(vec!["value".to_owned()]));
        for value in values {
            rs.add_row_values(vec![value]);
        }
        Ok(rs)
    }

    fn execute(&mut self, statement: &Statement) -> Result<usize, DbError> {
        self.run(statement)?;
        Ok(1)
    }

    fn escape_string(&self, raw: &str) -> String {
        raw.replace('\'', "\\'")
    }

    fn begin_transaction(&mut self) -> Result<(), DbError> {
        self.in_transaction = true;
        self.pending.clear();
        Ok(())
    }

    fn commit_transaction(&mut self) -> Result<(), DbError> {
        let mut state = self.store.state();
        if state.fail_commit {
            return Err(DbError::ExecutionError("scripted commit failure".into()));
        }
        state.visible.append(&mut self.pending);
        state.commits += 1;
        self.in_transaction = false;
        Ok(())
    }

    fn rollback_transaction(&mut self) -> Result<(), DbError> {
        self.pending.clear();
        self.in_transaction = false;
        self.store.state().rollbacks += 1;
        Ok(())
    }
}

/// Poll `cond` until it holds or `timeout` passes. Returns the final answer.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
}
