use std::sync::Arc;
use std::sync::mpsc::Receiver;

use crate::connection::{ConnectionGuard, LockedConnection};
use crate::error::DbError;
use crate::holder::QueryHolder;
use crate::query_counter::QueryTally;
use crate::result_queue::{ResultQueue, ResultRecord};

use super::channel::DelayedOperation;
use super::{ShutdownPolicy, WorkerState, WorkerStatus};

pub(super) struct WorkerContext {
    pub(super) conn: Arc<LockedConnection>,
    pub(super) results: Arc<ResultQueue>,
    pub(super) tally: QueryTally,
    pub(super) status: Arc<WorkerStatus>,
    pub(super) policy: ShutdownPolicy,
}

pub(super) fn run_delay_worker(ctx: &WorkerContext, receiver: &Receiver<DelayedOperation>) {
    ctx.status.set_state(WorkerState::Idle);
    let mut discarded = 0usize;

    // Ends once the facade drops its sender and everything sent before that is consumed.
    while let Ok(op) = receiver.recv() {
        dispatch(ctx, op, &mut discarded);
    }

    if discarded > 0 {
        tracing::warn!(discarded, "delayed operations dropped at shutdown");
    }
    ctx.status.set_state(WorkerState::Stopped);
}

fn dispatch(ctx: &WorkerContext, op: DelayedOperation, discarded: &mut usize) {
    let stopping = ctx.status.is_stopping();
    if stopping && ctx.policy == ShutdownPolicy::Discard {
        tracing::debug!(kind = op.kind(), "discarding delayed operation");
        *discarded += 1;
        return;
    }
    ctx.status.set_state(if stopping {
        WorkerState::Draining
    } else {
        WorkerState::Executing
    });
    execute_operation(ctx, op);
    if !stopping {
        ctx.status.set_state(WorkerState::Idle);
    }
}

fn execute_operation(ctx: &WorkerContext, op: DelayedOperation) {
    match op {
        DelayedOperation::Execute(statement) => {
            ctx.tally.record(statement.sql());
            let outcome = ctx.conn.lock().execute(&statement);
            if let Err(err) = outcome {
                tracing::error!(sql = statement.sql(), "delayed execute failed: {err}");
            }
        }
        DelayedOperation::Query {
            statement,
            callback,
        } => {
            ctx.tally.record(statement.sql());
            let outcome = ctx.conn.lock().query(&statement);
            if let Err(err) = &outcome {
                tracing::error!(sql = statement.sql(), "delayed query failed: {err}");
            }
            ctx.results.push(ResultRecord::new(outcome, callback));
        }
        DelayedOperation::Transaction(trans) => {
            let outcome = {
                let guard = ctx.conn.lock();
                guard.in_transaction(|conn| {
                    for statement in trans.statements() {
                        ctx.tally.record(statement.sql());
                        conn.execute(statement)?;
                    }
                    Ok(())
                })
            };
            if let Err(err) = outcome {
                tracing::error!(
                    statements = trans.len(),
                    "delayed transaction rolled back: {err}"
                );
            }
        }
        DelayedOperation::Holder {
            mut holder,
            callback,
        } => {
            {
                let guard = ctx.conn.lock();
                run_holder(&guard, &mut holder, &ctx.tally);
            }
            ctx.results.push(ResultRecord::new(holder, callback));
        }
    }
}

/// Run every filled slot of `holder` in index order and store the per-slot results.
fn run_holder(conn: &ConnectionGuard<'_>, holder: &mut QueryHolder, tally: &QueryTally) {
    if !holder.is_transactional() {
        let outcomes: Vec<_> = holder
            .filled_slots()
            .map(|(index, statement)| {
                tally.record(statement.sql());
                let outcome = conn.query(statement);
                if let Err(err) = &outcome {
                    tracing::error!(index, sql = statement.sql(), "holder slot failed: {err}");
                }
                (index, outcome)
            })
            .collect();
        for (index, outcome) in outcomes {
            holder.store_result(index, outcome);
        }
        return;
    }

    let outcome = conn.in_transaction(|conn| {
        let mut rows = Vec::with_capacity(holder.len());
        for (index, statement) in holder.filled_slots() {
            tally.record(statement.sql());
            rows.push((index, conn.query(statement)?));
        }
        Ok(rows)
    });
    match outcome {
        Ok(rows) => {
            for (index, result_set) in rows {
                holder.store_result(index, Ok(result_set));
            }
        }
        Err(err) => {
            tracing::error!(slots = holder.len(), "holder transaction rolled back: {err}");
            let message = err.to_string();
            let indices: Vec<usize> = holder.filled_slots().map(|(index, _)| index).collect();
            for index in indices {
                holder.store_result(
                    index,
                    Err(DbError::ExecutionError(format!(
                        "holder transaction rolled back: {message}"
                    ))),
                );
            }
        }
    }
}
