//! Periodic flush timer.
//!
//! One background thread (`ktlog-flush-timer`) per overlay manager wakes up
//! every `periodic_timer_interval` and asks each registered stream whether
//! its coalesced appends are old enough to flush. Streams are held weakly,
//! a stream that went away is dropped from the list on the next tick.
//!
//! The thread stops when the timer is dropped or `shutdown` is called.

use ktlog_core::LogResult;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace};

/// Something the timer checks on every tick.
pub trait PeriodicTarget: Send + Sync {
    /// Flush if buffered work is due
    fn on_tick(&self);
}

struct TimerShared {
    interval: Mutex<Duration>,
    targets: Mutex<Vec<Weak<dyn PeriodicTarget>>>,
    wake: Condvar,
    wake_lock: Mutex<bool>,
    shutdown: AtomicBool,
    ticks: AtomicU64,
}

impl TimerShared {
    fn run(&self) {
        loop {
            {
                let interval = *self.interval.lock();
                let mut signaled = self.wake_lock.lock();
                if !*signaled {
                    self.wake.wait_for(&mut signaled, interval);
                }
                *signaled = false;
            }
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            self.tick();
        }
        debug!(target: "ktlog::timer", "Flush timer stopped");
    }

    fn tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        let live: Vec<Arc<dyn PeriodicTarget>> = {
            let mut targets = self.targets.lock();
            targets.retain(|t| t.strong_count() > 0);
            targets.iter().filter_map(Weak::upgrade).collect()
        };
        trace!(target: "ktlog::timer", targets = live.len(), "Timer tick");
        for target in live {
            target.on_tick();
        }
    }

    fn signal(&self) {
        *self.wake_lock.lock() = true;
        self.wake.notify_one();
    }
}

/// Background timer driving periodic coalescer flushes.
pub struct FlushTimer {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for FlushTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushTimer")
            .field("interval", &*self.shared.interval.lock())
            .field("targets", &self.shared.targets.lock().len())
            .finish()
    }
}

impl FlushTimer {
    /// Start the timer thread.
    pub fn start(interval: Duration) -> LogResult<Self> {
        let shared = Arc::new(TimerShared {
            interval: Mutex::new(interval),
            targets: Mutex::new(Vec::new()),
            wake: Condvar::new(),
            wake_lock: Mutex::new(false),
            shutdown: AtomicBool::new(false),
            ticks: AtomicU64::new(0),
        });
        let runner = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("ktlog-flush-timer".into())
            .spawn(move || runner.run())?;
        debug!(target: "ktlog::timer", ?interval, "Flush timer started");
        Ok(FlushTimer {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Add a target, checked from the next tick on
    pub fn register(&self, target: Weak<dyn PeriodicTarget>) {
        self.shared.targets.lock().push(target);
    }

    /// Change the tick interval. Takes effect after the current wait.
    pub fn set_interval(&self, interval: Duration) {
        *self.shared.interval.lock() = interval;
        self.shared.signal();
    }

    /// Current tick interval
    pub fn interval(&self) -> Duration {
        *self.shared.interval.lock()
    }

    /// Ticks run so far
    pub fn ticks(&self) -> u64 {
        self.shared.ticks.load(Ordering::Relaxed)
    }

    /// Registered targets that are still alive
    pub fn live_targets(&self) -> usize {
        self.shared
            .targets
            .lock()
            .iter()
            .filter(|t| t.strong_count() > 0)
            .count()
    }

    /// Run one tick immediately on the timer thread
    pub fn kick(&self) {
        self.shared.signal();
    }

    /// Stop the thread and wait for it, unless called from the timer
    /// thread itself.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.signal();
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for FlushTimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl PeriodicTarget for Counter {
        fn on_tick(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn wait_until(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_ticks_reach_registered_targets() {
        let timer = FlushTimer::start(Duration::from_millis(10)).unwrap();
        let counter = Arc::new(Counter::default());
        let weak: Weak<dyn PeriodicTarget> = Arc::downgrade(&(Arc::clone(&counter) as Arc<dyn PeriodicTarget>));
        timer.register(weak);
        assert!(wait_until(|| counter.0.load(Ordering::SeqCst) >= 2));
    }

    #[test]
    fn test_dropped_targets_are_pruned() {
        let timer = FlushTimer::start(Duration::from_secs(60)).unwrap();
        let counter: Arc<dyn PeriodicTarget> = Arc::new(Counter::default());
        timer.register(Arc::downgrade(&counter));
        assert_eq!(timer.live_targets(), 1);
        drop(counter);
        assert_eq!(timer.live_targets(), 0);
        timer.kick();
        assert!(wait_until(|| timer.ticks() >= 1));
    }

    #[test]
    fn test_kick_and_shutdown() {
        let timer = FlushTimer::start(Duration::from_secs(60)).unwrap();
        timer.kick();
        assert!(wait_until(|| timer.ticks() == 1));
        timer.set_interval(Duration::from_secs(30));
        assert_eq!(timer.interval(), Duration::from_secs(30));
        timer.shutdown();
        // A second shutdown is a no-op
        timer.shutdown();
    }
}
