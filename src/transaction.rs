use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};

use crate::error::DbError;
use crate::types::Statement;

/// Statements staged by one thread between begin and commit.
///
/// Staging never touches a connection; the whole list runs later as one unit.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SqlTransaction {
    statements: Vec<Statement>,
}

impl SqlTransaction {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, statement: Statement) {
        self.statements.push(statement);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.statements.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    #[must_use]
    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }
}

impl FromIterator<Statement> for SqlTransaction {
    fn from_iter<I: IntoIterator<Item = Statement>>(iter: I) -> Self {
        Self {
            statements: iter.into_iter().collect(),
        }
    }
}

type SlotMap = Mutex<HashMap<ThreadId, SqlTransaction>>;

thread_local! {
    static REAPER: SlotReaper = SlotReaper {
        id: thread::current().id(),
        stores: RefCell::new(Vec::new()),
    };
}

/// Removes this thread's slots from every store it opened a transaction in once the
/// thread's locals are destroyed.
struct SlotReaper {
    id: ThreadId,
    stores: RefCell<Vec<Weak<SlotMap>>>,
}

impl SlotReaper {
    fn watch(&self, slots: &Arc<SlotMap>) {
        let mut stores = self.stores.borrow_mut();
        stores.retain(|store| store.strong_count() > 0);
        if !stores.iter().any(|store| store.as_ptr() == Arc::as_ptr(slots)) {
            stores.push(Arc::downgrade(slots));
        }
    }
}

impl Drop for SlotReaper {
    fn drop(&mut self) {
        for store in self.stores.get_mut().drain(..) {
            let Some(slots) = store.upgrade() else {
                continue;
            };
            let abandoned = slots
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.id);
            if let Some(trans) = abandoned.filter(|trans| !trans.is_empty()) {
                tracing::warn!(
                    thread = ?self.id,
                    discarded = trans.len(),
                    "thread exited with an uncommitted transaction"
                );
            }
        }
    }
}

/// One accumulator slot per calling thread. A missing entry means "absent".
///
/// A thread that exits with its slot still open loses the staged statements.
#[derive(Debug, Default)]
pub(crate) struct TransactionStore {
    slots: Arc<SlotMap>,
}

impl TransactionStore {
    fn slots(&self) -> Result<MutexGuard<'_, HashMap<ThreadId, SqlTransaction>>, DbError> {
        self.slots
            .lock()
            .map_err(|err| DbError::Other(format!("transaction store mutex poisoned: {err}")))
    }

    /// Open the calling thread's accumulator. An already open one is left untouched.
    pub(crate) fn begin(&self) -> Result<(), DbError> {
        {
            let mut slots = self.slots()?;
            let id = thread::current().id();
            if slots.contains_key(&id) {
                return Err(DbError::TransactionAlreadyOpen);
            }
            slots.insert(id, SqlTransaction::new());
        }
        // Fails only while this thread is already tearing down its locals.
        if REAPER.try_with(|reaper| reaper.watch(&self.slots)).is_err() {
            tracing::debug!("transaction opened during thread teardown is not reaped");
        }
        Ok(())
    }

    /// Append to the calling thread's accumulator. Hands the statement back when none is open.
    pub(crate) fn stage(&self, statement: Statement) -> Result<Option<Statement>, DbError> {
        let mut slots = self.slots()?;
        match slots.get_mut(&thread::current().id()) {
            Some(trans) => {
                trans.push(statement);
                Ok(None)
            }
            None => Ok(Some(statement)),
        }
    }

    /// Detach the calling thread's accumulator, returning the slot to absent.
    pub(crate) fn take(&self) -> Result<Option<SqlTransaction>, DbError> {
        Ok(self.slots()?.remove(&thread::current().id()))
    }

    pub(crate) fn is_open(&self) -> bool {
        self.slots()
            .map(|slots| slots.contains_key(&thread::current().id()))
            .unwrap_or(false)
    }

    pub(crate) fn staged_len(&self) -> usize {
        self.slots()
            .ok()
            .and_then(|slots| slots.get(&thread::current().id()).map(SqlTransaction::len))
            .unwrap_or(0)
    }

    /// Open accumulators across all threads.
    pub(crate) fn open_count(&self) -> usize {
        self.slots().map(|slots| slots.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_begin_keeps_first_accumulator() {
        let store = TransactionStore::default();
        store.begin().unwrap();
        assert!(store.stage(Statement::new("A")).unwrap().is_none());
        assert!(matches!(store.begin(), Err(DbError::TransactionAlreadyOpen)));
        assert_eq!(store.staged_len(), 1);

        let trans = store.take().unwrap().unwrap();
        assert_eq!(trans.statements(), &[Statement::new("A")]);
        assert!(!store.is_open());
    }

    #[test]
    fn stage_without_begin_returns_statement() {
        let store = TransactionStore::default();
        let back = store.stage(Statement::new("B")).unwrap();
        assert_eq!(back, Some(Statement::new("B")));
        assert!(store.take().unwrap().is_none());
    }

    #[test]
    fn slots_are_per_thread() {
        let store = std::sync::Arc::new(TransactionStore::default());
        store.begin().unwrap();
        store.stage(Statement::new("main")).unwrap();

        let other = std::sync::Arc::clone(&store);
        thread::spawn(move || {
            assert!(!other.is_open());
            other.begin().unwrap();
            other.stage(Statement::new("worker")).unwrap();
            let mine = other.take().unwrap().unwrap();
            assert_eq!(mine.statements(), &[Statement::new("worker")]);
        })
        .join()
        .unwrap();

        let mine = store.take().unwrap().unwrap();
        assert_eq!(mine.statements(), &[Statement::new("main")]);
    }

    #[test]
    fn exited_threads_leave_no_slot_behind() {
        let store = std::sync::Arc::new(TransactionStore::default());
        let workers: Vec<_> = (0..4)
            .map(|n| {
                let store = std::sync::Arc::clone(&store);
                thread::spawn(move || {
                    store.begin().unwrap();
                    store.stage(Statement::new(format!("UPDATE t SET v = {n}"))).unwrap();
                    assert!(store.is_open());
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(store.open_count(), 0);
    }

    #[test]
    fn reaping_skips_dropped_stores() {
        let kept = std::sync::Arc::new(TransactionStore::default());
        let other = std::sync::Arc::clone(&kept);
        thread::spawn(move || {
            let short_lived = TransactionStore::default();
            short_lived.begin().unwrap();
            drop(short_lived);
            other.begin().unwrap();
            other.begin().unwrap_err();
        })
        .join()
        .unwrap();

        assert_eq!(kept.open_count(), 0);
    }
}
