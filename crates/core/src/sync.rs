//! Synchronization primitives shared by the physical and overlay layers
//!
//! - `Event`: manual-reset notification event (shutdown, truncation completion)
//! - `ActivityGate`: counted-completion gate; teardown waits for the count to
//!   drain, or registers a continuation run when it does
//! - `Completion`: one-shot result cell a waiter can block on

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Manual-reset event.
///
/// Clones share state, so a collaborator can hold a clone and wait while the
/// owner signals.
#[derive(Debug, Clone, Default)]
pub struct Event {
    inner: Arc<EventInner>,
}

#[derive(Debug, Default)]
struct EventInner {
    signalled: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    /// Create an unsignalled event
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal the event and wake all waiters
    pub fn set(&self) {
        let mut signalled = self.inner.signalled.lock();
        *signalled = true;
        self.inner.cond.notify_all();
    }

    /// Return to the unsignalled state
    pub fn reset(&self) {
        *self.inner.signalled.lock() = false;
    }

    /// Whether the event is signalled
    pub fn is_set(&self) -> bool {
        *self.inner.signalled.lock()
    }

    /// Block until signalled
    pub fn wait_signalled(&self) {
        let mut signalled = self.inner.signalled.lock();
        while !*signalled {
            self.inner.cond.wait(&mut signalled);
        }
    }

    /// Block until signalled or until `timeout` expires.
    ///
    /// Returns true if the event was signalled.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut signalled = self.inner.signalled.lock();
        while !*signalled {
            if self
                .inner
                .cond
                .wait_until(&mut signalled, deadline)
                .timed_out()
            {
                return *signalled;
            }
        }
        true
    }
}

/// Counted-completion gate.
///
/// Each handle and each in-flight operation holds an `ActivityGuard`. The
/// owner closes the gate to refuse new interest and then waits for the count
/// to drain to zero before tearing the object down.
#[derive(Debug, Clone, Default)]
pub struct ActivityGate {
    inner: Arc<GateInner>,
}

#[derive(Debug, Default)]
struct GateInner {
    state: Mutex<GateState>,
    drained: Condvar,
}

/// Continuation run once a gate's count reaches zero
type DrainCallback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct GateState {
    count: usize,
    closed: bool,
    on_drained: Vec<DrainCallback>,
}

impl fmt::Debug for GateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GateState")
            .field("count", &self.count)
            .field("closed", &self.closed)
            .field("on_drained", &self.on_drained.len())
            .finish()
    }
}

impl ActivityGate {
    /// Create an open gate with no activity
    pub fn new() -> Self {
        Self::default()
    }

    /// Register new interest. Returns None once the gate is closed.
    pub fn try_acquire(&self) -> Option<ActivityGuard> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return None;
        }
        state.count += 1;
        Some(ActivityGuard {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Refuse further `try_acquire` calls. Existing guards stay valid.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        if state.count == 0 {
            self.inner.drained.notify_all();
        }
    }

    /// Accept new interest again
    pub fn reopen(&self) {
        self.inner.state.lock().closed = false;
    }

    /// Whether the gate refuses new interest
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Number of live guards
    pub fn active(&self) -> usize {
        self.inner.state.lock().count
    }

    /// Block until no guard is live.
    ///
    /// With `None` waits indefinitely. Returns false on timeout.
    pub fn wait_drained(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.inner.state.lock();
        while state.count > 0 {
            match deadline {
                Some(deadline) => {
                    if self
                        .inner
                        .drained
                        .wait_until(&mut state, deadline)
                        .timed_out()
                    {
                        return state.count == 0;
                    }
                }
                None => self.inner.drained.wait(&mut state),
            }
        }
        true
    }

    /// Run `callback` once no guard is live.
    ///
    /// Runs on the calling thread if the gate is already drained, otherwise
    /// on the thread that drops the last guard. The callback must not block;
    /// hand real work to a dispatcher.
    pub fn on_drained<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        if state.count > 0 {
            state.on_drained.push(Box::new(callback));
            return;
        }
        drop(state);
        callback();
    }
}

/// One unit of interest in an `ActivityGate`, released on drop.
#[derive(Debug)]
pub struct ActivityGuard {
    inner: Arc<GateInner>,
}

impl Clone for ActivityGuard {
    /// A clone extends existing interest, so it is granted even when the
    /// gate has been closed.
    fn clone(&self) -> Self {
        self.inner.state.lock().count += 1;
        ActivityGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        let callbacks = {
            let mut state = self.inner.state.lock();
            assert!(state.count > 0, "activity gate released more than acquired");
            state.count -= 1;
            if state.count > 0 {
                return;
            }
            self.inner.drained.notify_all();
            std::mem::take(&mut state.on_drained)
        };
        for callback in callbacks {
            callback();
        }
    }
}

/// One-shot result cell.
///
/// The first `complete` wins; later calls are ignored. A single consumer
/// takes the value with `wait`.
#[derive(Debug)]
pub struct Completion<T> {
    inner: Arc<CompletionInner<T>>,
}

#[derive(Debug)]
struct CompletionInner<T> {
    slot: Mutex<CompletionSlot<T>>,
    cond: Condvar,
}

#[derive(Debug)]
struct CompletionSlot<T> {
    value: Option<T>,
    completed: bool,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Completion {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Completion<T> {
    /// Create an incomplete cell
    pub fn new() -> Self {
        Completion {
            inner: Arc::new(CompletionInner {
                slot: Mutex::new(CompletionSlot {
                    value: None,
                    completed: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Store the result. Returns false if already completed.
    pub fn complete(&self, value: T) -> bool {
        let mut slot = self.inner.slot.lock();
        if slot.completed {
            return false;
        }
        slot.completed = true;
        slot.value = Some(value);
        self.inner.cond.notify_all();
        true
    }

    /// Whether a result has been stored
    pub fn is_complete(&self) -> bool {
        self.inner.slot.lock().completed
    }

    /// Block until completed and take the value.
    ///
    /// Returns None on timeout or if another consumer already took it.
    pub fn wait(&self, timeout: Option<Duration>) -> Option<T> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut slot = self.inner.slot.lock();
        while !slot.completed {
            match deadline {
                Some(deadline) => {
                    if self.inner.cond.wait_until(&mut slot, deadline).timed_out() {
                        break;
                    }
                }
                None => self.inner.cond.wait(&mut slot),
            }
        }
        slot.value.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_event_set_and_wait() {
        let event = Event::new();
        assert!(!event.is_set());
        assert!(!event.wait(Duration::from_millis(10)));

        let signaller = event.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            signaller.set();
        });
        assert!(event.wait(Duration::from_secs(5)));
        handle.join().unwrap();

        event.reset();
        assert!(!event.is_set());
    }

    #[test]
    fn test_gate_counts_guards() {
        let gate = ActivityGate::new();
        let a = gate.try_acquire().unwrap();
        let b = a.clone();
        assert_eq!(gate.active(), 2);
        drop(a);
        assert_eq!(gate.active(), 1);
        drop(b);
        assert_eq!(gate.active(), 0);
        assert!(gate.wait_drained(Some(Duration::ZERO)));
    }

    #[test]
    fn test_closed_gate_refuses_new_interest() {
        let gate = ActivityGate::new();
        let guard = gate.try_acquire().unwrap();
        gate.close();
        assert!(gate.try_acquire().is_none());

        // Existing interest may still be extended
        let extended = guard.clone();
        assert_eq!(gate.active(), 2);
        drop(extended);
        drop(guard);

        gate.reopen();
        assert!(gate.try_acquire().is_some());
    }

    #[test]
    fn test_gate_wait_drained_blocks_until_release() {
        let gate = ActivityGate::new();
        let guard = gate.try_acquire().unwrap();
        assert!(!gate.wait_drained(Some(Duration::from_millis(10))));

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            drop(guard);
        });
        assert!(gate.wait_drained(None));
        handle.join().unwrap();
    }

    #[test]
    fn test_drain_callback_runs_on_last_release() {
        let gate = ActivityGate::new();
        let guard = gate.try_acquire().unwrap();
        let extra = guard.clone();
        gate.close();

        let fired = Event::new();
        let signal = fired.clone();
        gate.on_drained(move || signal.set());
        drop(guard);
        assert!(!fired.is_set());
        drop(extra);
        assert!(fired.is_set());

        // A drained gate runs the callback at once
        let again = Event::new();
        let signal = again.clone();
        gate.on_drained(move || signal.set());
        assert!(again.is_set());
    }

    #[test]
    fn test_event_wait_signalled() {
        let event = Event::new();
        let signaller = event.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            signaller.set();
        });
        event.wait_signalled();
        assert!(event.is_set());
        handle.join().unwrap();
    }

    #[test]
    fn test_completion_first_result_wins() {
        let completion = Completion::new();
        assert!(completion.complete(1));
        assert!(!completion.complete(2));
        assert_eq!(completion.wait(None), Some(1));
        assert_eq!(completion.wait(Some(Duration::ZERO)), None);
    }

    #[test]
    fn test_completion_wait_times_out() {
        let completion: Completion<u32> = Completion::new();
        assert_eq!(completion.wait(Some(Duration::from_millis(5))), None);
        assert!(!completion.is_complete());
    }

    #[test]
    fn test_completion_cross_thread() {
        let completion = Completion::new();
        let producer = completion.clone();
        let handle = thread::spawn(move || producer.complete("done"));
        assert_eq!(completion.wait(Some(Duration::from_secs(5))), Some("done"));
        assert!(handle.join().unwrap());
    }
}
