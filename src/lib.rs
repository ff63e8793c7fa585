//! Deferred SQL access for a long-running host process.
//!
//! A [`Database`] holds two connections to the same store. The synchronous one serves
//! blocking calls on the caller's thread; the asynchronous one belongs to a dedicated
//! worker thread that drains a FIFO of delayed operations. Results of delayed queries
//! are parked in a result queue and handed to their callbacks only when the host calls
//! [`Database::process_result_queue`], so callbacks run on a thread the host chooses.
//!
//! Drivers plug in through [`SqlConnection`] and [`ConnectionFactory`]; a `SQLite`
//! driver ships behind the `sqlite` feature.

mod audit;
pub mod config;
pub mod connection;
pub mod database;
pub mod error;
pub mod holder;
pub mod prelude;
pub mod query_counter;
mod result_queue;
pub mod results;
pub mod transaction;
pub mod types;
pub mod worker;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::{DatabaseBuilder, DatabaseOptions};
pub use connection::{ConnectionFactory, SqlConnection};
pub use database::Database;
pub use error::DbError;
pub use holder::{QueryHolder, SlotResult};
pub use query_counter::{CounterFlushMode, QueryCounter};
pub use results::{CustomDbRow, ResultSet};
pub use transaction::SqlTransaction;
pub use types::{RowValues, Statement};
pub use worker::{HolderCallback, QueryCallback, ShutdownPolicy, WorkerState};
