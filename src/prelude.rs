//! Convenient imports for common functionality.
//!
//! This module re-exports the most commonly used types
//! to make it easier to get started with the library.

pub use crate::config::{DatabaseBuilder, DatabaseOptions};
pub use crate::connection::{ConnectionFactory, SqlConnection};
pub use crate::database::Database;
pub use crate::error::DbError;
pub use crate::holder::QueryHolder;
pub use crate::query_counter::{CounterFlushMode, QueryCounter};
pub use crate::results::{CustomDbRow, ResultSet};
pub use crate::types::{RowValues, Statement};
pub use crate::worker::ShutdownPolicy;

#[cfg(feature = "sqlite")]
pub use crate::sqlite::{SqliteConnection, SqliteFactory};
