use crate::error::DbError;
use crate::holder::QueryHolder;
use crate::results::ResultSet;
use crate::transaction::SqlTransaction;
use crate::types::Statement;

/// Callback bound at enqueue time for an async query. Runs on the draining thread.
pub type QueryCallback = Box<dyn FnOnce(Result<ResultSet, DbError>) + Send>;

/// Callback receiving a populated [`QueryHolder`]. Runs on the draining thread.
pub type HolderCallback = Box<dyn FnOnce(QueryHolder) + Send>;

pub(crate) enum DelayedOperation {
    Execute(Statement),
    Query {
        statement: Statement,
        callback: QueryCallback,
    },
    Transaction(SqlTransaction),
    Holder {
        holder: QueryHolder,
        callback: HolderCallback,
    },
}

impl DelayedOperation {
    /// Short label for logs.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            DelayedOperation::Execute(_) => "execute",
            DelayedOperation::Query { .. } => "query",
            DelayedOperation::Transaction(_) => "transaction",
            DelayedOperation::Holder { .. } => "holder",
        }
    }
}
