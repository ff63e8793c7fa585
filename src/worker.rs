//! The delayed-operation queue and the single thread that drains it.
//!
//! Every [`Database`](crate::Database) owns one worker. Operations are executed
//! strictly in the order they were enqueued, against the worker's own connection.

mod channel;
mod dispatcher;
mod manager;

pub use channel::{HolderCallback, QueryCallback};
pub(crate) use channel::DelayedOperation;
pub(crate) use manager::DelayWorker;

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// What happens to queued work when the facade shuts down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownPolicy {
    /// Run everything already queued before stopping.
    #[default]
    Drain,
    /// Drop whatever has not started yet.
    Discard,
}

/// Observable state of the worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Executing,
    Draining,
    Stopped,
}

impl WorkerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => WorkerState::Idle,
            1 => WorkerState::Executing,
            2 => WorkerState::Draining,
            _ => WorkerState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            WorkerState::Idle => 0,
            WorkerState::Executing => 1,
            WorkerState::Draining => 2,
            WorkerState::Stopped => 3,
        }
    }
}

/// Flags shared between the facade and its worker thread.
#[derive(Debug, Default)]
pub(crate) struct WorkerStatus {
    state: AtomicU8,
    stopping: AtomicBool,
}

impl WorkerStatus {
    pub(crate) fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    fn request_stop(&self) {
        self.stopping.store(true, Ordering::Release);
    }
}
