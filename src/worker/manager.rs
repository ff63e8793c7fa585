use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crate::connection::LockedConnection;
use crate::error::DbError;
use crate::query_counter::QueryTally;
use crate::result_queue::ResultQueue;

use super::channel::DelayedOperation;
use super::dispatcher::{WorkerContext, run_delay_worker};
use super::{ShutdownPolicy, WorkerState, WorkerStatus};

/// Owner of the worker thread. `None` in `sender` means halted: the channel closes when
/// the last sender is gone, so nothing can be accepted after the worker's final `recv`.
pub(crate) struct DelayWorker {
    sender: Mutex<Option<Sender<DelayedOperation>>>,
    status: Arc<WorkerStatus>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DelayWorker {
    pub(crate) fn spawn(
        ident: char,
        conn: Arc<LockedConnection>,
        results: Arc<ResultQueue>,
        tally: QueryTally,
        policy: ShutdownPolicy,
    ) -> Result<Self, DbError> {
        let (sender, receiver) = mpsc::channel::<DelayedOperation>();
        let status = Arc::new(WorkerStatus::default());
        let ctx = WorkerContext {
            conn,
            results,
            tally,
            status: Arc::clone(&status),
            policy,
        };
        let handle = thread::Builder::new()
            .name(format!("sql-delay-{ident}"))
            .spawn(move || run_delay_worker(&ctx, &receiver))
            .map_err(|err| {
                DbError::ConnectionError(format!("failed to spawn SQL delay worker thread: {err}"))
            })?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            status,
            handle: Mutex::new(Some(handle)),
        })
    }

    fn sender(&self) -> MutexGuard<'_, Option<Sender<DelayedOperation>>> {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand `op` to the worker. Accepted operations are sent before `halt` can close the
    /// channel, so the worker sees them.
    pub(crate) fn enqueue(&self, op: DelayedOperation) -> Result<(), DbError> {
        let sender = self.sender();
        let Some(sender) = sender.as_ref() else {
            tracing::debug!(kind = op.kind(), "enqueue rejected during shutdown");
            return Err(DbError::EnqueueRejected);
        };
        sender.send(op).map_err(|_| DbError::EnqueueRejected)
    }

    pub(crate) fn is_accepting(&self) -> bool {
        self.sender().is_some()
    }

    pub(crate) fn state(&self) -> WorkerState {
        self.status.state()
    }

    /// Stop accepting work, let the worker apply its shutdown policy and wait for it.
    pub(crate) fn halt(&self) {
        {
            let mut sender = self.sender();
            if sender.is_none() {
                return;
            }
            self.status.request_stop();
            sender.take();
        }

        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            // Joining ourselves would deadlock if a callback dropped the last facade handle on
            // the worker thread.
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!("SQL delay worker panicked");
            }
        }
    }
}

impl Drop for DelayWorker {
    fn drop(&mut self) {
        self.halt();
    }
}
