use std::collections::VecDeque;
use std::mem;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A finished async result already bound to the callback that consumes it.
pub(crate) struct ResultRecord {
    completion: Box<dyn FnOnce() + Send>,
}

impl ResultRecord {
    pub(crate) fn new<T, F>(value: T, callback: F) -> Self
    where
        T: Send + 'static,
        F: FnOnce(T) + Send + 'static,
    {
        Self {
            completion: Box::new(move || callback(value)),
        }
    }

    fn invoke(self) {
        (self.completion)();
    }
}

/// Completed results waiting for their owner to drain them.
///
/// Producers (the worker) append; whichever thread calls [`ResultQueue::drain`]
/// runs the callbacks, in push order, after the lock is released.
#[derive(Default)]
pub(crate) struct ResultQueue {
    pending: Mutex<VecDeque<ResultRecord>>,
}

impl ResultQueue {
    fn pending(&self) -> MutexGuard<'_, VecDeque<ResultRecord>> {
        // A panicking callback never holds this lock, so poisoning leaves the list intact.
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn push(&self, record: ResultRecord) {
        self.pending().push_back(record);
    }

    /// Swap out the whole backlog and run it on the calling thread. Never waits for new items.
    ///
    /// If a callback panics, the records behind it go back to the front of the queue for
    /// the next drain; the panicking record is consumed.
    pub(crate) fn drain(&self) -> usize {
        let taken = mem::take(&mut *self.pending());
        let mut batch = Unfinished {
            queue: self,
            rest: taken,
        };
        let mut count = 0;
        while let Some(record) = batch.rest.pop_front() {
            record.invoke();
            count += 1;
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.pending().len()
    }
}

/// Records of a drain still to run. Dropped non-empty only while unwinding.
struct Unfinished<'a> {
    queue: &'a ResultQueue,
    rest: VecDeque<ResultRecord>,
}

impl Drop for Unfinished<'_> {
    fn drop(&mut self) {
        if self.rest.is_empty() {
            return;
        }
        let mut pending = self.queue.pending();
        let arrived = mem::replace(&mut *pending, mem::take(&mut self.rest));
        pending.extend(arrived);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn drain_runs_in_push_order() {
        let queue = ResultQueue::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let seen = Arc::clone(&seen);
            queue.push(ResultRecord::new(n, move |v| seen.lock().unwrap().push(v)));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.drain(), 3);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(queue.drain(), 0);
    }

    #[test]
    fn callbacks_may_push_while_draining() {
        let queue = Arc::new(ResultQueue::default());
        let hits = Arc::new(AtomicUsize::new(0));
        let (q, h) = (Arc::clone(&queue), Arc::clone(&hits));
        queue.push(ResultRecord::new((), move |()| {
            h.fetch_add(1, Ordering::SeqCst);
            let h2 = Arc::clone(&h);
            q.push(ResultRecord::new((), move |()| {
                h2.fetch_add(1, Ordering::SeqCst);
            }));
        }));

        assert_eq!(queue.drain(), 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.drain(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_callback_keeps_the_rest_queued() {
        let queue = ResultQueue::default();
        let hits = Arc::new(AtomicUsize::new(0));
        queue.push(ResultRecord::new((), |()| panic!("callback failed")));
        let h = Arc::clone(&hits);
        queue.push(ResultRecord::new((), move |()| {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| queue.drain()));
        assert!(outcome.is_err());
        assert_eq!(queue.len(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        assert_eq!(queue.drain(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
