use std::fmt;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;

use crate::audit::AuditLog;
use crate::config::DatabaseOptions;
use crate::connection::{ConnectionFactory, ConnectionRole, LockedConnection};
use crate::error::DbError;
use crate::holder::QueryHolder;
use crate::query_counter::{QueryCounter, QueryTally};
use crate::result_queue::ResultQueue;
use crate::results::ResultSet;
use crate::transaction::TransactionStore;
use crate::types::Statement;
use crate::worker::{DelayWorker, DelayedOperation, WorkerState};

static IDENTIFIER: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$"));

/// Database facade: blocking access on one connection, queued access on another.
///
/// - `query*`/`execute*` run on the caller's thread against the synchronous connection.
/// - `async_*`, `commit_transaction` and `delay_query_holder` enqueue work for the worker
///   thread, which runs it in submission order against its own connection.
/// - Results of queued queries wait in a result queue until some thread calls
///   [`Database::process_result_queue`]; the callbacks run on that thread.
///
/// Transactions are staged per calling thread: between [`Database::begin_transaction`] and
/// a commit, `async_execute*` calls from that thread are collected instead of enqueued.
///
/// ```rust,no_run
/// use deferred_sql::prelude::*;
/// use deferred_sql::sqlite::SqliteFactory;
///
/// # fn demo() -> Result<(), DbError> {
/// let db = Database::initialize(DatabaseOptions::new("realm.db"), SqliteFactory)?;
/// db.execute("CREATE TABLE IF NOT EXISTS account (id INTEGER, name TEXT)")?;
///
/// db.begin_transaction()?;
/// db.async_execute("INSERT INTO account VALUES (1, 'alice')")?;
/// db.async_execute("INSERT INTO account VALUES (2, 'bob')")?;
/// db.commit_transaction()?;
///
/// db.async_query("SELECT COUNT(*) FROM account", |result| {
///     if let Ok(rows) = result {
///         println!("accounts: {:?}", rows.scalar());
///     }
/// })?;
///
/// // Once per tick of the owning thread's loop:
/// db.process_result_queue();
/// # Ok(()) }
/// ```
pub struct Database {
    opts: DatabaseOptions,
    sync_conn: LockedConnection,
    async_conn: Arc<LockedConnection>,
    transactions: TransactionStore,
    results: Arc<ResultQueue>,
    worker: DelayWorker,
    tally: QueryTally,
    audit: Option<AuditLog>,
}

impl Database {
    /// Open the synchronous and asynchronous connections and start the worker.
    ///
    /// # Errors
    /// Returns [`DbError::ConnectionError`] if either connection cannot be initialized or the
    /// worker thread cannot be spawned.
    pub fn initialize(
        opts: DatabaseOptions,
        factory: impl ConnectionFactory,
    ) -> Result<Self, DbError> {
        Self::open(opts, &factory, None)
    }

    pub(crate) fn open(
        opts: DatabaseOptions,
        factory: &dyn ConnectionFactory,
        counter: Option<Arc<QueryCounter>>,
    ) -> Result<Self, DbError> {
        let sync_conn = connect(ConnectionRole::Sync, factory, &opts.connection_info)?;
        let async_conn = Arc::new(connect(
            ConnectionRole::Async,
            factory,
            &opts.connection_info,
        )?);
        let results = Arc::new(ResultQueue::default());
        let tally = QueryTally::new(counter, opts.ident);
        let worker = DelayWorker::spawn(
            opts.ident,
            Arc::clone(&async_conn),
            Arc::clone(&results),
            tally.clone(),
            opts.shutdown_policy,
        )?;
        let audit = opts.audit_dir().map(AuditLog::new);

        tracing::info!(ident = %opts.ident, "database connections established");
        Ok(Self {
            opts,
            sync_conn,
            async_conn,
            transactions: TransactionStore::default(),
            results,
            worker,
            tally,
            audit,
        })
    }

    // ----- synchronous access -----

    /// Run a query on the synchronous connection, blocking until it completes.
    ///
    /// # Errors
    /// Returns the driver's error if the query fails.
    pub fn query(&self, sql: &str) -> Result<ResultSet, DbError> {
        self.query_statement(&Statement::new(sql))
    }

    /// [`Database::query`] with text built from `format_args!`.
    ///
    /// # Errors
    /// Returns the driver's error if the query fails.
    pub fn query_formatted(&self, args: fmt::Arguments<'_>) -> Result<ResultSet, DbError> {
        self.query(&args.to_string())
    }

    /// # Errors
    /// Returns the driver's error if the query fails.
    pub fn query_statement(&self, statement: &Statement) -> Result<ResultSet, DbError> {
        self.tally.record(statement.sql());
        self.sync_conn.lock().query(statement)
    }

    /// Run a statement on the synchronous connection and return the affected row count.
    ///
    /// Never staged into an open transaction.
    ///
    /// # Errors
    /// Returns the driver's error if the statement fails.
    pub fn execute(&self, sql: &str) -> Result<usize, DbError> {
        self.execute_statement(&Statement::new(sql))
    }

    /// # Errors
    /// Returns the driver's error if the statement fails.
    pub fn execute_formatted(&self, args: fmt::Arguments<'_>) -> Result<usize, DbError> {
        self.execute(&args.to_string())
    }

    /// # Errors
    /// Returns the driver's error if the statement fails.
    pub fn execute_statement(&self, statement: &Statement) -> Result<usize, DbError> {
        self.tally.record(statement.sql());
        self.sync_conn.lock().execute(statement)
    }

    /// Synchronous execute that also appends the statement to the audit log when enabled.
    /// Audit failures are logged and otherwise ignored.
    ///
    /// # Errors
    /// Returns the driver's error if the statement fails.
    pub fn execute_logged(&self, args: fmt::Arguments<'_>) -> Result<usize, DbError> {
        let sql = args.to_string();
        if let Some(audit) = &self.audit
            && let Err(err) = audit.append(&sql)
        {
            tracing::warn!(dir = ?self.opts.logs_dir, "SQL audit log write failed: {err}");
        }
        self.execute(&sql)
    }

    // ----- queued access -----

    /// Queue a query; `callback` receives the result during a later
    /// [`Database::process_result_queue`] on whichever thread drains.
    ///
    /// # Errors
    /// Returns [`DbError::EnqueueRejected`] once the database is shutting down.
    pub fn async_query<F>(&self, sql: &str, callback: F) -> Result<(), DbError>
    where
        F: FnOnce(Result<ResultSet, DbError>) + Send + 'static,
    {
        self.async_query_statement(Statement::new(sql), callback)
    }

    /// # Errors
    /// Returns [`DbError::EnqueueRejected`] once the database is shutting down.
    pub fn async_query_formatted<F>(
        &self,
        args: fmt::Arguments<'_>,
        callback: F,
    ) -> Result<(), DbError>
    where
        F: FnOnce(Result<ResultSet, DbError>) + Send + 'static,
    {
        self.async_query_statement(Statement::new(args.to_string()), callback)
    }

    /// # Errors
    /// Returns [`DbError::EnqueueRejected`] once the database is shutting down.
    pub fn async_query_statement<F>(&self, statement: Statement, callback: F) -> Result<(), DbError>
    where
        F: FnOnce(Result<ResultSet, DbError>) + Send + 'static,
    {
        self.worker.enqueue(DelayedOperation::Query {
            statement,
            callback: Box::new(callback),
        })
    }

    /// Queue a statement without a result. While this thread has an open transaction the
    /// statement joins it instead.
    ///
    /// # Errors
    /// Returns [`DbError::EnqueueRejected`] once the database is shutting down.
    pub fn async_execute(&self, sql: &str) -> Result<(), DbError> {
        self.async_execute_statement(Statement::new(sql))
    }

    /// # Errors
    /// Returns [`DbError::EnqueueRejected`] once the database is shutting down.
    pub fn async_execute_formatted(&self, args: fmt::Arguments<'_>) -> Result<(), DbError> {
        self.async_execute_statement(Statement::new(args.to_string()))
    }

    /// # Errors
    /// Returns [`DbError::EnqueueRejected`] once the database is shutting down.
    pub fn async_execute_statement(&self, statement: Statement) -> Result<(), DbError> {
        match self.transactions.stage(statement)? {
            None => Ok(()),
            Some(statement) => self.worker.enqueue(DelayedOperation::Execute(statement)),
        }
    }

    /// Queue every slot of `holder`; `callback` receives the populated holder during a later
    /// [`Database::process_result_queue`].
    ///
    /// # Errors
    /// Returns [`DbError::EnqueueRejected`] once the database is shutting down.
    pub fn delay_query_holder<F>(&self, holder: QueryHolder, callback: F) -> Result<(), DbError>
    where
        F: FnOnce(QueryHolder) + Send + 'static,
    {
        self.worker.enqueue(DelayedOperation::Holder {
            holder,
            callback: Box::new(callback),
        })
    }

    /// Run every completed callback waiting in the result queue on the calling thread, in
    /// completion order. Returns how many ran; never waits for new results.
    pub fn process_result_queue(&self) -> usize {
        self.results.drain()
    }

    #[must_use]
    pub fn pending_results(&self) -> usize {
        self.results.len()
    }

    // ----- transactions -----

    /// Open the calling thread's transaction.
    ///
    /// # Errors
    /// Returns [`DbError::TransactionAlreadyOpen`] if one is already open; it is left intact.
    pub fn begin_transaction(&self) -> Result<(), DbError> {
        self.transactions.begin().inspect_err(|err| {
            tracing::debug!("begin_transaction refused: {err}");
        })
    }

    /// Queue the calling thread's staged statements as one transaction. Committing with no
    /// open transaction, or an empty one, does nothing.
    ///
    /// # Errors
    /// Returns [`DbError::EnqueueRejected`] once the database is shutting down; the staged
    /// statements are dropped.
    pub fn commit_transaction(&self) -> Result<(), DbError> {
        let Some(trans) = self.transactions.take()? else {
            tracing::debug!("commit_transaction without an open transaction");
            return Ok(());
        };
        if trans.is_empty() {
            return Ok(());
        }
        self.worker.enqueue(DelayedOperation::Transaction(trans))
    }

    /// Run the calling thread's staged statements now, on the worker's connection, and
    /// report the outcome. A failure rolls the whole transaction back.
    ///
    /// # Errors
    /// Returns the first statement error, or the commit error.
    pub fn commit_transaction_direct(&self) -> Result<(), DbError> {
        let Some(trans) = self.transactions.take()? else {
            return Ok(());
        };
        if trans.is_empty() {
            return Ok(());
        }
        let guard = self.async_conn.lock();
        guard.in_transaction(|conn| {
            for statement in trans.statements() {
                self.tally.record(statement.sql());
                conn.execute(statement)?;
            }
            Ok(())
        })
    }

    /// Drop the calling thread's staged statements. Returns whether a transaction was open.
    pub fn rollback_transaction(&self) -> bool {
        self.transactions.take().is_ok_and(|trans| trans.is_some())
    }

    #[must_use]
    pub fn has_open_transaction(&self) -> bool {
        self.transactions.is_open()
    }

    /// Number of statements staged in the calling thread's open transaction.
    #[must_use]
    pub fn staged_statements(&self) -> usize {
        self.transactions.staged_len()
    }

    /// Release the calling thread's transaction slot before the thread goes away.
    /// Returns how many staged statements were discarded.
    ///
    /// Threads that exit without calling this are reaped when their locals are destroyed.
    pub fn thread_end(&self) -> usize {
        match self.transactions.take() {
            Ok(Some(trans)) if !trans.is_empty() => {
                tracing::warn!(
                    ident = %self.opts.ident,
                    discarded = trans.len(),
                    "thread ended with an uncommitted transaction"
                );
                trans.len()
            }
            Ok(_) => 0,
            Err(err) => {
                tracing::warn!("thread_end could not release the transaction slot: {err}");
                0
            }
        }
    }

    /// Transactions currently open on any thread.
    #[must_use]
    pub fn open_transactions(&self) -> usize {
        self.transactions.open_count()
    }

    // ----- maintenance -----

    /// Keep both connections alive with a cheap query. Results are discarded.
    pub fn ping(&self, sql: &str) {
        let statement = Statement::new(sql);
        for conn in [self.async_conn.as_ref(), &self.sync_conn] {
            if let Err(err) = conn.lock().query(&statement) {
                tracing::warn!(role = %conn.role(), "ping failed: {err}");
            }
        }
    }

    /// Escape untrusted text for inclusion in a string literal, using the driver's rules.
    ///
    /// # Errors
    /// Returns [`DbError::ConnectionError`] if the connection is unusable.
    pub fn escape_string(&self, raw: &str) -> Result<String, DbError> {
        self.sync_conn.lock().escape_string(raw)
    }

    /// Whether `table` has a column named `field`.
    ///
    /// # Errors
    /// Returns [`DbError::ParameterError`] if either name is not a plain identifier.
    pub fn check_required_field(&self, table: &str, field: &str) -> Result<bool, DbError> {
        validate_identifier(table)?;
        validate_identifier(field)?;
        match self.query_formatted(format_args!("SELECT {field} FROM {table} LIMIT 1")) {
            Ok(_) => Ok(true),
            Err(err) => {
                tracing::error!(table, field, "required field check failed: {err}");
                Ok(false)
            }
        }
    }

    /// Both connections are open and the worker still accepts work.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.worker.is_accepting()
    }

    #[must_use]
    pub fn worker_state(&self) -> WorkerState {
        self.worker.state()
    }

    #[must_use]
    pub fn ident(&self) -> char {
        self.opts.ident
    }

    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        self.opts.ping_interval()
    }

    #[must_use]
    pub fn options(&self) -> &DatabaseOptions {
        &self.opts
    }

    /// Stop accepting queued work and wait for the worker to finish under the configured
    /// shutdown policy. Synchronous access keeps working. Idempotent; also runs on drop.
    pub fn halt(&self) {
        self.worker.halt();
        tracing::info!(ident = %self.opts.ident, "database worker halted");
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("ident", &self.opts.ident)
            .field("worker_state", &self.worker_state())
            .field("pending_results", &self.pending_results())
            .finish_non_exhaustive()
    }
}

fn connect(
    role: ConnectionRole,
    factory: &dyn ConnectionFactory,
    info: &str,
) -> Result<LockedConnection, DbError> {
    let conn = LockedConnection::new(role, factory.create_connection());
    let outcome = conn.lock().initialize(info);
    outcome.map_err(|err| DbError::ConnectionError(format!("{role} connection failed: {err}")))?;
    Ok(conn)
}

fn validate_identifier(name: &str) -> Result<(), DbError> {
    let pattern = IDENTIFIER
        .as_ref()
        .map_err(|err| DbError::Other(format!("identifier pattern: {err}")))?;
    if pattern.is_match(name) {
        Ok(())
    } else {
        Err(DbError::ParameterError(format!(
            "`{name}` is not a valid SQL identifier"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_must_be_plain_words() {
        assert!(validate_identifier("character_stats").is_ok());
        assert!(validate_identifier("_x1").is_ok());
        assert!(validate_identifier("1abc").is_err());
        assert!(validate_identifier("name; DROP TABLE t").is_err());
        assert!(validate_identifier("").is_err());
    }
}
