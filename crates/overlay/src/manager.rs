//! Overlay log manager.
//!
//! The manager is the composition root of the overlay layer. It owns:
//! - the physical manager every shared and dedicated container lives in
//! - the write buffer pool all streams draw from
//! - the per-disk open gates
//! - the flush timer
//! - the container and stream tables
//!
//! Construct one per storage root and pass it by reference; the physical
//! manager refuses a second instance over the same root.

use crate::config::{ConfigError, MemoryThrottleLimits, OverlayConfig};
use crate::counters::PerfCounters;
use crate::gate::GateRegistry;
use crate::log::{delete_dedicated_container, LogKey, LogShared, LogSlot, OverlayLog, StreamKey};
use crate::stream::StreamSlot;
use crate::tables::GlobalTable;
use crate::throttle::ThrottleAllocator;
use crate::timer::FlushTimer;
use ktlog_core::{
    DiskId, LogError, LogId, LogResult, OperationHandle, StreamType, WritePriority,
};
use ktlog_physical::{
    DeviceProvider, LogCreateOptions, PhysicalLog, PhysicalLogManager, RecordVerifier,
};
use parking_lot::RwLock;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// State shared by the manager, its containers and their streams.
pub(crate) struct ManagerShared {
    pub physical: PhysicalLogManager,
    pub allocator: Arc<ThrottleAllocator>,
    pub limits: RwLock<MemoryThrottleLimits>,
    pub config: OverlayConfig,
    pub gates: GateRegistry,
    pub timer: FlushTimer,
    pub streams: Arc<GlobalTable<StreamKey, StreamSlot>>,
    pub logs: Arc<GlobalTable<LogKey, LogSlot>>,
}

impl fmt::Debug for ManagerShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerShared")
            .field("logs", &self.logs.len())
            .field("streams", &self.streams.len())
            .finish()
    }
}

/// Pool settings and usage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryThrottleUsage {
    /// Limits currently configured
    pub configured: MemoryThrottleLimits,
    /// Bytes currently granted to in-flight writes
    pub current_allocations: u64,
    /// Current pool limit (None: unlimited)
    pub total_allocation_limit: Option<u64>,
    /// Whether writes are waiting for pool space
    pub is_under_memory_pressure: bool,
    /// Writes waiting for pool space
    pub waiting: usize,
}

/// Manager of overlay logs on one storage root.
///
/// Cheap to clone; clones share the same instance.
#[derive(Clone)]
pub struct OverlayManager {
    shared: Arc<ManagerShared>,
}

impl fmt::Debug for OverlayManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverlayManager")
            .field("physical", &self.shared.physical)
            .field("logs", &self.shared.logs.len())
            .finish()
    }
}

impl OverlayManager {
    /// Create a manager over `provider`.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` for an invalid configuration, `SharingViolation`
    /// if another manager holds the root.
    pub fn new(provider: Arc<dyn DeviceProvider>, config: OverlayConfig) -> LogResult<Self> {
        config.validate()?;
        let physical = PhysicalLogManager::new(provider, config.physical.clone())?;
        let limits = config.throttle.clone();
        let allocator = ThrottleAllocator::new(
            limits.write_buffer_pool_min,
            limits.write_buffer_pool_max,
            limits.write_buffer_pool_per_stream,
        );
        let timer = FlushTimer::start(limits.periodic_timer_interval)?;
        info!(
            target: "ktlog::overlay",
            pool_min = ?limits.write_buffer_pool_min,
            pool_max = ?limits.write_buffer_pool_max,
            open_gate_quota = config.open_gate_quota,
            "Overlay manager started"
        );
        Ok(OverlayManager {
            shared: Arc::new(ManagerShared {
                physical,
                allocator,
                limits: RwLock::new(limits),
                gates: GateRegistry::new(config.open_gate_quota),
                config,
                timer,
                streams: GlobalTable::new("streams"),
                logs: GlobalTable::new("logs"),
            }),
        })
    }

    /// Create a manager storing containers as files below `root`.
    pub fn open_root(root: impl Into<PathBuf>, config: OverlayConfig) -> LogResult<Self> {
        let provider = ktlog_physical::FileDeviceProvider::new(root)?;
        Self::new(Arc::new(provider), config)
    }

    /// Configuration the manager was built with
    pub fn config(&self) -> &OverlayConfig {
        &self.shared.config
    }

    /// Physical manager holding every shared and dedicated container
    pub fn physical(&self) -> &PhysicalLogManager {
        &self.shared.physical
    }

    /// Create a shared container and open it.
    ///
    /// # Errors
    ///
    /// `NameCollision` if the container exists, `InvalidParameter` for bad
    /// sizes, `ShutdownPending` after `deactivate`.
    pub fn create_log(
        &self,
        disk_id: DiskId,
        log_id: LogId,
        log_type: StreamType,
        options: &LogCreateOptions,
    ) -> LogResult<OverlayLog> {
        self.acquire_log(disk_id, log_id, |physical| {
            physical.create_log(disk_id, log_id, log_type, options)
        }, true)
    }

    /// Open a shared container. An open container is reused.
    pub fn open_log(&self, disk_id: DiskId, log_id: LogId) -> LogResult<OverlayLog> {
        self.acquire_log(disk_id, log_id, |physical| physical.open_log(disk_id, log_id), false)
    }

    fn acquire_log<F>(&self, disk: DiskId, log: LogId, open: F, create: bool) -> LogResult<OverlayLog>
    where
        F: FnOnce(&PhysicalLogManager) -> LogResult<PhysicalLog>,
    {
        let key = LogKey { disk, log };
        let (lease, created) = self.shared.logs.acquire(key, LogSlot::default);
        let lease = Arc::new(lease);
        let shared = {
            let mut slot = lease.value().shared.lock();
            match slot.as_ref() {
                Some(_) if create => {
                    return Err(LogError::collision(format!("log {} on disk {}", log, disk)));
                }
                Some(shared) => Arc::clone(shared),
                None => {
                    let physical = open(&self.shared.physical)?;
                    let shared = Arc::new(LogShared::new(key, physical, Arc::clone(&self.shared)));
                    *slot = Some(Arc::clone(&shared));
                    shared
                }
            }
        };
        debug!(target: "ktlog::overlay", log = %key, reused = !created, "Acquired overlay log");
        Ok(OverlayLog::new(shared, lease))
    }

    /// Delete a shared container together with the dedicated containers of
    /// its streams.
    ///
    /// # Errors
    ///
    /// `NotFound`, or `SharingViolation` while a handle to the log is open.
    pub fn delete_log(&self, disk_id: DiskId, log_id: LogId) -> LogResult<()> {
        let key = LogKey {
            disk: disk_id,
            log: log_id,
        };
        if self.shared.logs.get(key).is_some() {
            return Err(LogError::SharingViolation(format!("log {} is open", key)));
        }

        let streams = {
            let log = self.shared.physical.open_log(disk_id, log_id)?;
            log.get_streams()
        };
        for stream in &streams {
            delete_dedicated_container(&self.shared, disk_id, *stream)?;
        }
        self.shared.physical.delete_log(disk_id, log_id)?;
        info!(
            target: "ktlog::overlay",
            log = %key,
            streams = streams.len(),
            "Deleted overlay log"
        );
        Ok(())
    }

    /// Ids of every shared container on `disk_id`
    pub fn enumerate_logs(&self, disk_id: DiskId) -> LogResult<Vec<LogId>> {
        self.shared.physical.enumerate_logs(disk_id)
    }

    /// Accept new operations again after `deactivate`
    pub fn activate(&self) {
        self.shared.physical.activate();
    }

    /// Refuse new container operations with `ShutdownPending`. Open
    /// handles keep working.
    pub fn deactivate(&self) {
        self.shared.physical.deactivate();
    }

    /// Whether the manager accepts new operations
    pub fn is_active(&self) -> bool {
        self.shared.physical.is_active()
    }

    /// Wait for every container handle to be released. Returns false on
    /// timeout.
    pub fn wait_deactivated(&self, timeout: Option<Duration>) -> bool {
        self.shared.physical.wait_deactivated(timeout)
    }

    /// Register the verifier for records of `stream_type`
    pub fn register_verification_callback(
        &self,
        stream_type: StreamType,
        verifier: RecordVerifier,
    ) -> LogResult<()> {
        self.shared
            .physical
            .register_verification_callback(stream_type, verifier)
    }

    /// Remove the verifier for `stream_type`
    pub fn unregister_verification_callback(&self, stream_type: StreamType) -> LogResult<RecordVerifier> {
        self.shared
            .physical
            .unregister_verification_callback(stream_type)
    }

    /// Replace the pool limits and flush timer settings.
    ///
    /// Streams already open keep their dedicated backlog limit.
    pub fn configure_memory_throttle_limits(&self, limits: MemoryThrottleLimits) -> Result<(), ConfigError> {
        limits.validate()?;
        self.shared.allocator.set_limits(
            limits.write_buffer_pool_min,
            limits.write_buffer_pool_max,
            limits.write_buffer_pool_per_stream,
        );
        self.shared.timer.set_interval(limits.periodic_timer_interval);
        info!(
            target: "ktlog::overlay",
            pool_min = ?limits.write_buffer_pool_min,
            pool_max = ?limits.write_buffer_pool_max,
            flush_time_s = limits.periodic_flush_time.as_secs(),
            "Memory throttle limits configured"
        );
        *self.shared.limits.write() = limits;
        Ok(())
    }

    /// Current pool limits and usage
    pub fn query_memory_throttle_usage(&self) -> MemoryThrottleUsage {
        let usage = self.shared.allocator.usage();
        MemoryThrottleUsage {
            configured: self.shared.limits.read().clone(),
            current_allocations: usage.current_allocations,
            total_allocation_limit: usage.total_allocation_limit,
            is_under_memory_pressure: usage.is_under_memory_pressure,
            waiting: usage.waiting,
        }
    }

    /// Counters summed over every open overlay log
    pub fn query_perf_counters(&self) -> PerfCounters {
        self.shared
            .logs
            .values()
            .into_iter()
            .filter_map(|slot| slot.shared.lock().clone())
            .map(|log| log.perf_counters())
            .sum()
    }

    /// Overlay logs currently open
    pub fn open_logs(&self) -> usize {
        self.shared.logs.len()
    }

    /// Overlay streams currently open
    pub fn open_streams(&self) -> usize {
        self.shared.streams.len()
    }

    /// Asynchronous `create_log`
    pub fn start_create_log<C>(
        &self,
        disk_id: DiskId,
        log_id: LogId,
        log_type: StreamType,
        options: LogCreateOptions,
        callback: C,
    ) -> OperationHandle
    where
        C: FnOnce(LogResult<OverlayLog>) + Send + 'static,
    {
        let manager = self.clone();
        self.shared.physical.dispatcher().start(
            WritePriority::Normal,
            move |_| manager.create_log(disk_id, log_id, log_type, &options),
            callback,
        )
    }

    /// Asynchronous `open_log`
    pub fn start_open_log<C>(&self, disk_id: DiskId, log_id: LogId, callback: C) -> OperationHandle
    where
        C: FnOnce(LogResult<OverlayLog>) + Send + 'static,
    {
        let manager = self.clone();
        self.shared.physical.dispatcher().start(
            WritePriority::Normal,
            move |_| manager.open_log(disk_id, log_id),
            callback,
        )
    }

    /// Asynchronous `delete_log`
    pub fn start_delete_log<C>(&self, disk_id: DiskId, log_id: LogId, callback: C) -> OperationHandle
    where
        C: FnOnce(LogResult<()>) + Send + 'static,
    {
        let manager = self.clone();
        self.shared.physical.dispatcher().start(
            WritePriority::Normal,
            move |_| manager.delete_log(disk_id, log_id),
            callback,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ktlog_physical::MemoryDeviceProvider;

    fn manager() -> OverlayManager {
        OverlayManager::new(Arc::new(MemoryDeviceProvider::new()), OverlayConfig::for_testing()).unwrap()
    }

    #[test]
    fn test_second_manager_on_root_is_refused() {
        let provider = Arc::new(MemoryDeviceProvider::new());
        let _first = OverlayManager::new(provider.clone(), OverlayConfig::for_testing()).unwrap();
        let second = OverlayManager::new(provider, OverlayConfig::for_testing());
        assert!(matches!(second, Err(LogError::SharingViolation(_))));
    }

    #[test]
    fn test_open_log_reuses_instance() {
        let manager = manager();
        let disk = DiskId::new();
        let log_id = LogId::new();
        let log = manager
            .create_log(disk, log_id, StreamType::nil(), &LogCreateOptions::for_testing())
            .unwrap();
        let again = manager.open_log(disk, log_id).unwrap();
        assert_eq!(manager.open_logs(), 1);
        assert_eq!(again.log_id(), log.log_id());

        let dup = manager.create_log(disk, log_id, StreamType::nil(), &LogCreateOptions::for_testing());
        assert!(matches!(dup, Err(LogError::NameCollision(_))));

        drop(log);
        drop(again);
        assert_eq!(manager.open_logs(), 0);
    }

    #[test]
    fn test_delete_open_log_is_refused() {
        let manager = manager();
        let disk = DiskId::new();
        let log_id = LogId::new();
        let log = manager
            .create_log(disk, log_id, StreamType::nil(), &LogCreateOptions::for_testing())
            .unwrap();
        assert!(matches!(
            manager.delete_log(disk, log_id),
            Err(LogError::SharingViolation(_))
        ));
        drop(log);
        manager.delete_log(disk, log_id).unwrap();
        assert!(manager.enumerate_logs(disk).unwrap().is_empty());
        assert!(matches!(
            manager.delete_log(disk, log_id),
            Err(LogError::NotFound(_))
        ));
    }

    #[test]
    fn test_configure_memory_throttle_limits() {
        let manager = manager();
        let limits = MemoryThrottleLimits::for_testing()
            .with_write_buffer_pool(Some(32 * 1024 * 1024), Some(128 * 1024 * 1024));
        manager.configure_memory_throttle_limits(limits.clone()).unwrap();
        let usage = manager.query_memory_throttle_usage();
        assert_eq!(usage.configured, limits);
        assert_eq!(usage.total_allocation_limit, Some(32 * 1024 * 1024));
        assert_eq!(usage.current_allocations, 0);
        assert!(!usage.is_under_memory_pressure);

        let bad = MemoryThrottleLimits::for_testing().with_write_buffer_pool(Some(1), None);
        assert!(manager.configure_memory_throttle_limits(bad).is_err());
    }

    #[test]
    fn test_deactivate_refuses_new_logs() {
        let manager = manager();
        manager.deactivate();
        assert!(!manager.is_active());
        let err = manager.create_log(
            DiskId::new(),
            LogId::new(),
            StreamType::nil(),
            &LogCreateOptions::for_testing(),
        );
        assert!(matches!(err, Err(LogError::ShutdownPending)));
        assert!(manager.wait_deactivated(Some(Duration::from_secs(1))));
        manager.activate();
        assert!(manager.is_active());
    }
}
