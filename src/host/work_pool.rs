//! Worker dispatch for blocking native calls.
//!
//! Blocking native calls run on the tokio blocking pool; their continuation
//! is sent back to the host thread as a [`Completion`]. The bookkeeping
//! record for each in-flight call comes from a bounded [`WorkRequestPool`] so
//! the steady stream of sends and acks reuses records instead of allocating.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use super::{LoopHandle, Wakeup, guarded};
use crate::error::{BridgeError, BridgeResult, ListenerResult, LockResultExt, panic_message};

/// Bookkeeping for one in-flight work item.
#[derive(Debug)]
pub(crate) struct WorkRequest {
    id: u64,
    label: &'static str,
    queued_at: Instant,
}

/// Counters describing pool reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkPoolStats {
    /// Records allocated because the pool was empty
    pub allocated: usize,
    /// Records handed out from the pool
    pub reused: usize,
    /// Records currently idle in the pool
    pub idle: usize,
}

/// Bounded free list of [`WorkRequest`] records.
pub(crate) struct WorkRequestPool {
    free: Mutex<Vec<Box<WorkRequest>>>,
    capacity: usize,
    next_id: AtomicU64,
    allocated: AtomicUsize,
    reused: AtomicUsize,
}

impl WorkRequestPool {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            next_id: AtomicU64::new(1),
            allocated: AtomicUsize::new(0),
            reused: AtomicUsize::new(0),
        }
    }

    /// Pop an idle record or allocate a new one.
    pub(crate) fn get(&self, label: &'static str) -> Box<WorkRequest> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let recycled = self.free.lock().recover_poison("WorkRequestPool::get").pop();
        match recycled {
            Some(mut request) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                request.id = id;
                request.label = label;
                request.queued_at = Instant::now();
                request
            }
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                Box::new(WorkRequest {
                    id,
                    label,
                    queued_at: Instant::now(),
                })
            }
        }
    }

    /// Return a record; dropped if the pool is already at capacity.
    pub(crate) fn put(&self, request: Box<WorkRequest>) {
        let mut free = self.free.lock().recover_poison("WorkRequestPool::put");
        if free.len() < self.capacity {
            free.push(request);
        }
    }

    pub(crate) fn stats(&self) -> WorkPoolStats {
        WorkPoolStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            idle: self.free.lock().recover_poison("WorkRequestPool::stats").len(),
        }
    }
}

/// Host-side continuation of a finished work item.
pub(crate) struct Completion {
    request: Box<WorkRequest>,
    run: Box<dyn FnOnce() + Send>,
}

impl LoopHandle {
    /// Run `work` on a worker thread and `complete` on the host thread.
    ///
    /// A panic inside `work` is converted into [`BridgeError::Worker`].
    pub(crate) fn queue_work<T, W, C>(&self, label: &'static str, work: W, complete: C)
    where
        T: Send + 'static,
        W: FnOnce() -> T + Send + 'static,
        C: FnOnce(BridgeResult<T>) + Send + 'static,
    {
        let request = self.shared.requests.get(label);
        self.shared.pending_work.fetch_add(1, Ordering::AcqRel);
        log::trace!(
            target: "fabric_bridge::host",
            "Queued work #{} ({})",
            request.id,
            label
        );

        let host = self.clone();
        self.shared.workers.spawn_blocking(move || {
            let outcome = catch_unwind(AssertUnwindSafe(work))
                .map_err(|payload| BridgeError::Worker(panic_message(payload.as_ref())));
            let completion = Completion {
                request,
                run: Box::new(move || complete(outcome)),
            };
            if !host.send(Wakeup::Completion(completion)) {
                log::debug!(
                    target: "fabric_bridge::host",
                    "Host loop gone before {} completed",
                    label
                );
            }
        });
    }

    /// Run a completion on the host thread and recycle its record.
    pub(crate) fn finish_work(&self, completion: Completion) {
        let Completion { request, run } = completion;
        log::trace!(
            target: "fabric_bridge::host",
            "Completing work #{} ({}) after {:?}",
            request.id,
            request.label,
            request.queued_at.elapsed()
        );
        run();
        self.shared.requests.put(request);
        self.shared.pending_work.fetch_sub(1, Ordering::AcqRel);
    }
}

type WorkFn<R> = Box<dyn FnOnce() -> R + Send>;
type FinishFn<R, T> = Box<dyn FnOnce(R) -> BridgeResult<T> + Send>;

/// One native operation: a blocking worker body plus its host-side finish.
///
/// The asynchronous and blocking variants of every public operation build
/// the same `Operation`; [`spawn`](Self::spawn) runs the body on a worker and
/// hands the result to a callback on the host thread, while
/// [`run_blocking`](Self::run_blocking) runs both halves inline.
pub(crate) struct Operation<R, T> {
    label: &'static str,
    work: WorkFn<R>,
    finish: FinishFn<R, T>,
}

impl<R, T> Operation<R, T>
where
    R: Send + 'static,
    T: Send + 'static,
{
    pub(crate) fn new(
        label: &'static str,
        work: impl FnOnce() -> R + Send + 'static,
        finish: impl FnOnce(R) -> BridgeResult<T> + Send + 'static,
    ) -> Self {
        Self {
            label,
            work: Box::new(work),
            finish: Box::new(finish),
        }
    }

    /// Run the worker body on the calling thread.
    pub(crate) fn run_blocking(self) -> BridgeResult<T> {
        let Operation { work, finish, .. } = self;
        let raw = catch_unwind(AssertUnwindSafe(work))
            .map_err(|payload| BridgeError::Worker(panic_message(payload.as_ref())))?;
        finish(raw)
    }

    /// Run the worker body on the pool; deliver the result to `callback` on
    /// the host thread.
    pub(crate) fn spawn<C>(self, host: &LoopHandle, entity: &'static str, callback: C)
    where
        C: FnOnce(BridgeResult<T>) -> ListenerResult + Send + 'static,
    {
        let Operation {
            label,
            work,
            finish,
        } = self;
        let callback_host = host.clone();
        host.queue_work(label, work, move |raw| {
            let result = raw.and_then(finish);
            guarded(&callback_host, entity, label, || callback(result));
        });
    }
}
