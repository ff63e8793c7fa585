use std::cell::{RefCell, RefMut};
use std::fmt;

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use crate::error::DbError;
use crate::results::ResultSet;
use crate::types::Statement;

/// A single session against a backing store.
///
/// Implementations are not expected to be reentrant; [`Database`](crate::Database)
/// only ever calls them while holding the connection's guard.
pub trait SqlConnection: Send {
    /// Open the session described by `info` (driver specific, e.g. a file path).
    ///
    /// # Errors
    /// Returns [`DbError::ConnectionError`] (or a driver error) if the session cannot be opened.
    fn initialize(&mut self, info: &str) -> Result<(), DbError>;

    /// Run a statement that returns rows.
    ///
    /// # Errors
    /// Returns a driver error if the statement fails.
    fn query(&mut self, statement: &Statement) -> Result<ResultSet, DbError>;

    /// Run a statement for its side effects and return the affected row count.
    ///
    /// # Errors
    /// Returns a driver error if the statement fails.
    fn execute(&mut self, statement: &Statement) -> Result<usize, DbError>;

    /// Escape untrusted text for inclusion in a string literal.
    fn escape_string(&self, raw: &str) -> String {
        raw.to_owned()
    }

    // Stores without transaction support treat these as successful no-ops.

    /// # Errors
    /// Returns a driver error if the store rejects the transaction start.
    fn begin_transaction(&mut self) -> Result<(), DbError> {
        Ok(())
    }

    /// # Errors
    /// Returns a driver error if the commit fails.
    fn commit_transaction(&mut self) -> Result<(), DbError> {
        Ok(())
    }

    /// # Errors
    /// Returns a driver error if the rollback fails.
    fn rollback_transaction(&mut self) -> Result<(), DbError> {
        Ok(())
    }
}

/// Creates the connections a [`Database`](crate::Database) owns.
///
/// Called exactly twice per facade: once for the synchronous connection and once for
/// the worker's connection.
pub trait ConnectionFactory: Send + Sync {
    fn create_connection(&self) -> Box<dyn SqlConnection>;
}

impl<F> ConnectionFactory for F
where
    F: Fn() -> Box<dyn SqlConnection> + Send + Sync,
{
    fn create_connection(&self) -> Box<dyn SqlConnection> {
        self()
    }
}

/// Which of the facade's two connections a [`LockedConnection`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionRole {
    Sync,
    Async,
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionRole::Sync => f.write_str("sync"),
            ConnectionRole::Async => f.write_str("async"),
        }
    }
}

/// A connection behind a recursive lock: the holding thread may lock again,
/// no other thread may interleave.
pub(crate) struct LockedConnection {
    role: ConnectionRole,
    inner: ReentrantMutex<RefCell<Box<dyn SqlConnection>>>,
}

impl LockedConnection {
    pub(crate) fn new(role: ConnectionRole, conn: Box<dyn SqlConnection>) -> Self {
        Self {
            role,
            inner: ReentrantMutex::new(RefCell::new(conn)),
        }
    }

    pub(crate) fn role(&self) -> ConnectionRole {
        self.role
    }

    /// Block until this thread holds the connection.
    pub(crate) fn lock(&self) -> ConnectionGuard<'_> {
        ConnectionGuard {
            role: self.role,
            guard: self.inner.lock(),
        }
    }
}

impl fmt::Debug for LockedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockedConnection")
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

/// Exclusive access to a connection. Each call borrows the driver only for its own
/// duration, so nested guards on the same thread compose.
pub(crate) struct ConnectionGuard<'a> {
    role: ConnectionRole,
    guard: ReentrantMutexGuard<'a, RefCell<Box<dyn SqlConnection>>>,
}

impl ConnectionGuard<'_> {
    fn conn(&self) -> Result<RefMut<'_, Box<dyn SqlConnection>>, DbError> {
        self.guard.try_borrow_mut().map_err(|_| {
            DbError::ConnectionError(format!("{} connection is already in use", self.role))
        })
    }

    pub(crate) fn initialize(&self, info: &str) -> Result<(), DbError> {
        self.conn()?.initialize(info)
    }

    pub(crate) fn query(&self, statement: &Statement) -> Result<ResultSet, DbError> {
        self.conn()?.query(statement)
    }

    pub(crate) fn execute(&self, statement: &Statement) -> Result<usize, DbError> {
        self.conn()?.execute(statement)
    }

    pub(crate) fn escape_string(&self, raw: &str) -> Result<String, DbError> {
        Ok(self.conn()?.escape_string(raw))
    }

    pub(crate) fn begin_transaction(&self) -> Result<(), DbError> {
        self.conn()?.begin_transaction()
    }

    pub(crate) fn commit_transaction(&self) -> Result<(), DbError> {
        self.conn()?.commit_transaction()
    }

    pub(crate) fn rollback_transaction(&self) -> Result<(), DbError> {
        self.conn()?.rollback_transaction()
    }

    /// Run `body` between begin and commit. Any failure, including the commit itself,
    /// rolls the transaction back and is returned.
    pub(crate) fn in_transaction<T>(
        &self,
        body: impl FnOnce(&Self) -> Result<T, DbError>,
    ) -> Result<T, DbError> {
        self.begin_transaction()?;
        let outcome = body(self).and_then(|value| self.commit_transaction().map(|()| value));
        if outcome.is_err()
            && let Err(rollback_err) = self.rollback_transaction()
        {
            tracing::error!(role = %self.role, "rollback failed: {rollback_err}");
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    impl SqlConnection for Noop {
        fn initialize(&mut self, _info: &str) -> Result<(), DbError> {
            Ok(())
        }

        fn query(&mut self, _statement: &Statement) -> Result<ResultSet, DbError> {
            Ok(ResultSet::default())
        }

        fn execute(&mut self, statement: &Statement) -> Result<usize, DbError> {
            if statement.sql() == "fail" {
                Err(DbError::ExecutionError("fail".into()))
            } else {
                Ok(1)
            }
        }
    }

    #[test]
    fn guard_is_reentrant_on_one_thread() {
        let locked = LockedConnection::new(ConnectionRole::Sync, Box::new(Noop));
        let outer = locked.lock();
        let inner = locked.lock();
        assert_eq!(inner.execute(&Statement::new("x")).unwrap(), 1);
        assert_eq!(outer.execute(&Statement::new("y")).unwrap(), 1);
    }

    #[test]
    fn default_transaction_hooks_succeed() {
        let locked = LockedConnection::new(ConnectionRole::Async, Box::new(Noop));
        let guard = locked.lock();
        let rows = guard
            .in_transaction(|g| g.execute(&Statement::new("ok")))
            .unwrap();
        assert_eq!(rows, 1);
        assert!(guard.in_transaction(|g| g.execute(&Statement::new("fail"))).is_err());
        assert_eq!(guard.escape_string("it's").unwrap(), "it's");
    }

    #[test]
    fn closures_act_as_factories() {
        let factory = || Box::new(Noop) as Box<dyn SqlConnection>;
        let mut conn = ConnectionFactory::create_connection(&factory);
        assert!(conn.initialize("anything").is_ok());
    }
}
