//! Asynchronous operation dispatcher.
//!
//! Every stream, container and manager operation has a `start_*` form that
//! returns immediately and delivers its terminal status to a completion
//! callback. The dispatcher runs those operations on a fixed pool of worker
//! threads. Normal priority work runs before low priority work; within one
//! priority, operations run in submission order.
//!
//! An operation that has to wait on something outside the pool (the last
//! handle to a stream being dropped) is started with `start_continued`: it
//! receives a `Continuation`, returns its worker, and whoever finishes the
//! wait completes the continuation later.

use crate::error::{LogError, LogResult};
use crate::sync::Completion;
use crate::types::WritePriority;
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error};

/// Cancellation flag shared between an operation and its handle.
///
/// Operations poll it before committing to I/O. Once an operation has
/// committed, cancellation is ignored.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create an uncancelled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::Release);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::Acquire)
    }

    /// Fail with `Cancelled` if cancellation was requested
    pub fn check(&self) -> LogResult<()> {
        if self.is_cancelled() {
            Err(LogError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Handle to an operation started through the dispatcher
#[derive(Debug, Clone)]
pub struct OperationHandle {
    cancel: CancelToken,
    done: Completion<()>,
}

impl OperationHandle {
    /// Request cancellation of the operation
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the completion callback has run
    pub fn is_complete(&self) -> bool {
        self.done.is_complete()
    }

    /// Block until the completion callback has run.
    ///
    /// Returns false on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        if self.done.is_complete() {
            return true;
        }
        self.done.wait(Some(timeout));
        self.done.is_complete()
    }
}

/// Deferred completion of an operation started with
/// `Dispatcher::start_continued`.
///
/// Completing it runs the operation's callback. Dropping it without
/// completing reports `ShutdownPending`.
pub struct Continuation<T> {
    finish: Option<Box<dyn FnOnce(LogResult<T>) + Send>>,
}

impl<T> Continuation<T> {
    fn new<F>(finish: F) -> Self
    where
        F: FnOnce(LogResult<T>) + Send + 'static,
    {
        Continuation {
            finish: Some(Box::new(finish)),
        }
    }

    /// Deliver the operation's result
    pub fn complete(mut self, result: LogResult<T>) {
        if let Some(finish) = self.finish.take() {
            finish(result);
        }
    }
}

impl<T> Drop for Continuation<T> {
    fn drop(&mut self) {
        if let Some(finish) = self.finish.take() {
            finish(Err(LogError::ShutdownPending));
        }
    }
}

impl<T> std::fmt::Debug for Continuation<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Continuation")
            .field("pending", &self.finish.is_some())
            .finish()
    }
}

/// Dispatcher metrics snapshot
#[derive(Debug, Clone)]
pub struct DispatcherStats {
    /// Operations waiting in the queue
    pub queue_depth: usize,
    /// Operations currently executing
    pub active: usize,
    /// Operations completed since creation
    pub completed: u64,
    /// Number of worker threads
    pub worker_count: usize,
}

struct Envelope {
    priority: WritePriority,
    sequence: u64,
    work: Box<dyn FnOnce() + Send>,
}

fn rank(priority: WritePriority) -> u8 {
    match priority {
        WritePriority::Low => 0,
        WritePriority::Normal => 1,
    }
}

impl Eq for Envelope {}

impl PartialEq for Envelope {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

// Higher priority first, then lower sequence (older) first
impl Ord for Envelope {
    fn cmp(&self, other: &Self) -> Ordering {
        rank(self.priority)
            .cmp(&rank(other.priority))
            .then(other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for Envelope {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct DispatcherInner {
    queue: Mutex<BinaryHeap<Envelope>>,
    work_ready: Condvar,
    drain_cond: Condvar,
    shutdown: AtomicBool,
    sequence: AtomicU64,
    queue_depth: AtomicUsize,
    active: AtomicUsize,
    completed: AtomicU64,
}

/// Worker pool executing `start_*` operations
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    num_threads: usize,
}

impl Dispatcher {
    /// Create a dispatcher with the given number of worker threads.
    ///
    /// Workers are named `ktlog-dispatch-0`, `ktlog-dispatch-1`, etc.
    pub fn new(num_threads: usize) -> LogResult<Self> {
        let num_threads = num_threads.max(1);
        let inner = Arc::new(DispatcherInner {
            queue: Mutex::new(BinaryHeap::new()),
            work_ready: Condvar::new(),
            drain_cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            queue_depth: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
        });

        let mut workers = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let inner_clone = Arc::clone(&inner);
            let handle = std::thread::Builder::new()
                .name(format!("ktlog-dispatch-{}", i))
                .spawn(move || worker_loop(&inner_clone))?;
            workers.push(handle);
        }

        Ok(Self {
            inner,
            workers: Mutex::new(workers),
            num_threads,
        })
    }

    /// Start an operation.
    ///
    /// `op` runs on a worker thread and receives the operation's cancel
    /// token; `callback` receives its result. If the dispatcher is shut down
    /// the callback runs immediately on the calling thread with
    /// `ShutdownPending`.
    pub fn start<T, F, C>(&self, priority: WritePriority, op: F, callback: C) -> OperationHandle
    where
        T: Send + 'static,
        F: FnOnce(&CancelToken) -> LogResult<T> + Send + 'static,
        C: FnOnce(LogResult<T>) + Send + 'static,
    {
        self.start_continued(priority, move |cancel, done| done.complete(op(cancel)), callback)
    }

    /// Start an operation that finishes later.
    ///
    /// `op` runs on a worker thread and is handed the operation's
    /// `Continuation`. It may complete it before returning or pass it on;
    /// the worker is released either way. The handle completes once the
    /// continuation has been completed and `callback` has run.
    pub fn start_continued<T, F, C>(&self, priority: WritePriority, op: F, callback: C) -> OperationHandle
    where
        T: Send + 'static,
        F: FnOnce(&CancelToken, Continuation<T>) + Send + 'static,
        C: FnOnce(LogResult<T>) + Send + 'static,
    {
        let cancel = CancelToken::new();
        let done = Completion::new();
        let handle = OperationHandle {
            cancel: cancel.clone(),
            done: done.clone(),
        };
        let continuation = Continuation::new(move |result| {
            callback(result);
            done.complete(());
        });

        if self.inner.shutdown.load(AtomicOrdering::Acquire) {
            continuation.complete(Err(LogError::ShutdownPending));
            return handle;
        }

        let work = move || match cancel.check() {
            Ok(()) => op(&cancel, continuation),
            Err(e) => continuation.complete(Err(e)),
        };

        let sequence = self.inner.sequence.fetch_add(1, AtomicOrdering::Relaxed);
        {
            let mut queue = self.inner.queue.lock();
            queue.push(Envelope {
                priority,
                sequence,
                work: Box::new(work),
            });
            self.inner.queue_depth.fetch_add(1, AtomicOrdering::Release);
        }
        self.inner.work_ready.notify_one();
        handle
    }

    /// Block until all queued and in-flight operations have completed.
    pub fn drain(&self) {
        let mut queue = self.inner.queue.lock();
        while self.inner.queue_depth.load(AtomicOrdering::Acquire) > 0
            || self.inner.active.load(AtomicOrdering::Acquire) > 0
        {
            self.inner.drain_cond.wait(&mut queue);
        }
    }

    /// Stop accepting work, run what is queued, and join the workers.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, AtomicOrdering::Release);
        {
            let _queue = self.inner.queue.lock();
            self.inner.work_ready.notify_all();
        }

        // The last owner may be dropped on one of our own workers
        let current = std::thread::current().id();
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        debug!(target: "ktlog::dispatch", "Dispatcher shut down");
    }

    /// Current metrics
    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            queue_depth: self.inner.queue_depth.load(AtomicOrdering::Relaxed),
            active: self.inner.active.load(AtomicOrdering::Relaxed),
            completed: self.inner.completed.load(AtomicOrdering::Relaxed),
            worker_count: self.num_threads,
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inner: &DispatcherInner) {
    loop {
        let envelope = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(envelope) = queue.pop() {
                    inner.queue_depth.fetch_sub(1, AtomicOrdering::Release);
                    inner.active.fetch_add(1, AtomicOrdering::Release);
                    break envelope;
                }
                if inner.shutdown.load(AtomicOrdering::Acquire) {
                    return;
                }
                inner.work_ready.wait(&mut queue);
            }
        };

        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(envelope.work)).is_err() {
            error!(target: "ktlog::dispatch", "Dispatched operation panicked");
        }

        inner.completed.fetch_add(1, AtomicOrdering::Relaxed);
        let _queue = inner.queue.lock();
        inner.active.fetch_sub(1, AtomicOrdering::Release);
        inner.drain_cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    #[test]
    fn test_callback_receives_result() {
        let dispatcher = Dispatcher::new(2).unwrap();
        let result = Arc::new(PlMutex::new(None));
        let sink = Arc::clone(&result);

        let handle = dispatcher.start(
            WritePriority::Normal,
            |_| Ok(41 + 1),
            move |r: LogResult<i32>| *sink.lock() = Some(r.unwrap()),
        );
        assert!(handle.wait(Duration::from_secs(5)));
        assert_eq!(*result.lock(), Some(42));
    }

    #[test]
    fn test_cancel_before_start_reports_cancelled() {
        let dispatcher = Dispatcher::new(1).unwrap();
        let gate = Arc::new(PlMutex::new(()));
        let blocker = gate.lock();

        // Occupy the only worker
        let hold = Arc::clone(&gate);
        dispatcher.start(
            WritePriority::Normal,
            move |_| {
                let _g = hold.lock();
                Ok(())
            },
            |_: LogResult<()>| {},
        );

        let outcome = Arc::new(PlMutex::new(None));
        let sink = Arc::clone(&outcome);
        let handle = dispatcher.start(
            WritePriority::Normal,
            |_| Ok(()),
            move |r: LogResult<()>| *sink.lock() = Some(matches!(r, Err(LogError::Cancelled))),
        );
        handle.cancel();
        drop(blocker);

        assert!(handle.wait(Duration::from_secs(5)));
        assert_eq!(*outcome.lock(), Some(true));
    }

    #[test]
    fn test_normal_priority_runs_before_low() {
        let dispatcher = Dispatcher::new(1).unwrap();
        let gate = Arc::new(PlMutex::new(()));
        let blocker = gate.lock();
        let hold = Arc::clone(&gate);
        dispatcher.start(
            WritePriority::Normal,
            move |_| {
                let _g = hold.lock();
                Ok(())
            },
            |_: LogResult<()>| {},
        );

        let order = Arc::new(PlMutex::new(Vec::new()));
        for (priority, tag) in [
            (WritePriority::Low, "low"),
            (WritePriority::Normal, "normal"),
        ] {
            let order = Arc::clone(&order);
            dispatcher.start(
                priority,
                move |_| Ok(tag),
                move |r: LogResult<&'static str>| order.lock().push(r.unwrap()),
            );
        }
        drop(blocker);
        dispatcher.drain();
        assert_eq!(*order.lock(), vec!["normal", "low"]);
    }

    #[test]
    fn test_start_after_shutdown_fails_inline() {
        let dispatcher = Dispatcher::new(1).unwrap();
        dispatcher.shutdown();
        let outcome = Arc::new(PlMutex::new(false));
        let sink = Arc::clone(&outcome);
        let handle = dispatcher.start(
            WritePriority::Normal,
            |_| Ok(()),
            move |r: LogResult<()>| *sink.lock() = matches!(r, Err(LogError::ShutdownPending)),
        );
        assert!(handle.is_complete());
        assert!(*outcome.lock());
    }

    #[test]
    fn test_continued_operation_releases_its_worker() {
        let dispatcher = Arc::new(Dispatcher::new(1).unwrap());
        let parked = Arc::new(PlMutex::new(None));
        let slot = Arc::clone(&parked);
        let outcome = Arc::new(PlMutex::new(None));
        let sink = Arc::clone(&outcome);
        let continued = dispatcher.start_continued(
            WritePriority::Normal,
            move |_, done| *slot.lock() = Some(done),
            move |r: LogResult<u32>| *sink.lock() = Some(r.unwrap()),
        );

        // The only worker is free for other work meanwhile
        let other = dispatcher.start(WritePriority::Normal, |_| Ok(()), |_: LogResult<()>| {});
        assert!(other.wait(Duration::from_secs(5)));
        assert!(!continued.is_complete());

        let done = parked.lock().take().unwrap();
        done.complete(Ok(7));
        assert!(continued.wait(Duration::from_secs(5)));
        assert_eq!(*outcome.lock(), Some(7));
    }

    #[test]
    fn test_dropped_continuation_reports_shutdown() {
        let dispatcher = Dispatcher::new(1).unwrap();
        let outcome = Arc::new(PlMutex::new(false));
        let sink = Arc::clone(&outcome);
        let handle = dispatcher.start_continued(
            WritePriority::Normal,
            |_, done: Continuation<()>| drop(done),
            move |r: LogResult<()>| *sink.lock() = matches!(r, Err(LogError::ShutdownPending)),
        );
        assert!(handle.wait(Duration::from_secs(5)));
        assert!(*outcome.lock());
    }

    #[test]
    fn test_stats_track_completions() {
        let dispatcher = Dispatcher::new(2).unwrap();
        for _ in 0..10 {
            dispatcher.start(WritePriority::Normal, |_| Ok(()), |_: LogResult<()>| {});
        }
        dispatcher.drain();
        let stats = dispatcher.stats();
        assert_eq!(stats.completed, 10);
        assert_eq!(stats.queue_depth, 0);
        assert_eq!(stats.worker_count, 2);
    }
}
