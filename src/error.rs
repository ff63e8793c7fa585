use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[cfg(feature = "sqlite")]
    #[error(transparent)]
    SqliteError(#[from] rusqlite::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("No connection configured: {0}")]
    NotConfigured(String),

    #[error("Parameter error: {0}")]
    ParameterError(String),

    #[error("SQL execution error: {0}")]
    ExecutionError(String),

    #[error("A transaction is already open on this thread")]
    TransactionAlreadyOpen,

    #[error("Database is shutting down; operation rejected")]
    EnqueueRejected,

    #[error("Other database error: {0}")]
    Other(String),
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::ConfigError(format!("invalid database options: {err}"))
    }
}

impl DbError {
    /// Whether this error means the statement never reached a connection.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            DbError::EnqueueRejected | DbError::TransactionAlreadyOpen | DbError::NotConfigured(_)
        )
    }
}
