//! Physical log manager.
//!
//! The manager owns every open container on one storage root. It takes the
//! root's exclusive claim at construction, so a second manager on the same
//! root fails `SharingViolation` instead of interleaving LSNs.
//!
//! Open containers are tracked as weak references keyed by `(DiskId, LogId)`:
//! opening a container that is already open returns another handle to the
//! same instance, and the instance shuts down when its last handle drops.
//! While a container is being created, recovered or deleted its key holds a
//! busy placeholder instead. Callers for the same key wait on it; callers
//! for other keys never wait behind that I/O.

use crate::config::{LogCreateOptions, PhysicalConfig};
use crate::catalog::Catalog;
use crate::device::{DeviceProvider, FileDeviceProvider};
use crate::format::{ContainerHeader, CONTAINER_HEADER_SIZE};
use crate::log::{LogShared, PhysicalLog};
use crate::recovery::{recover, Recovered, RecoveryStats};
use ktlog_core::{
    ActivityGate, DiskId, Dispatcher, Event, LogError, LogId, LogResult, OperationHandle,
    StreamType, WritePriority,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Verification callback run against `(metadata, data)` of every record read
/// from a stream of the registered type. Returning false fails the read with
/// `DataError`.
pub type RecordVerifier = Arc<dyn Fn(&[u8], &[u8]) -> bool + Send + Sync>;

pub(crate) struct ManagerInner {
    pub(crate) provider: Arc<dyn DeviceProvider>,
    pub(crate) config: PhysicalConfig,
    pub(crate) dispatcher: Arc<Dispatcher>,
    logs: Mutex<HashMap<LogKey, LogSlot>>,
    verifiers: RwLock<HashMap<StreamType, RecordVerifier>>,
    active: AtomicBool,
    gate: ActivityGate,
}

type LogKey = (DiskId, LogId);

/// Entry of the open-container table
enum LogSlot {
    /// Set once the caller creating, recovering or deleting the container
    /// is done
    Busy(Event),
    Open(Weak<LogShared>),
}

/// Outcome of claiming a table key
enum Claim<'a> {
    /// The container is already open
    Open(Arc<LogShared>),
    /// The key now holds this caller's placeholder
    Reserved(Reservation<'a>),
}

/// Busy placeholder owned by one caller.
///
/// Dropping it publishes the container set by `publish`, or removes the
/// placeholder, and wakes the callers waiting on the key.
struct Reservation<'a> {
    inner: &'a ManagerInner,
    key: LogKey,
    event: Event,
    published: Option<Weak<LogShared>>,
}

impl Reservation<'_> {
    fn publish(&mut self, shared: &Arc<LogShared>) {
        self.published = Some(Arc::downgrade(shared));
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        let mut logs = self.inner.logs.lock();
        match self.published.take() {
            Some(weak) => {
                logs.insert(self.key, LogSlot::Open(weak));
            }
            None => {
                logs.remove(&self.key);
            }
        }
        drop(logs);
        self.event.set();
    }
}

impl ManagerInner {
    pub(crate) fn verifier(&self, stream_type: StreamType) -> Option<RecordVerifier> {
        self.verifiers.read().get(&stream_type).cloned()
    }

    /// Return the open container for `key`, or take the key's placeholder,
    /// waiting out any other caller's placeholder first
    fn claim(&self, key: LogKey) -> Claim<'_> {
        loop {
            let mut logs = self.logs.lock();
            let busy = match logs.get(&key) {
                Some(LogSlot::Busy(event)) => Some(event.clone()),
                Some(LogSlot::Open(weak)) => match weak.upgrade() {
                    Some(shared) => return Claim::Open(shared),
                    None => None,
                },
                None => None,
            };
            match busy {
                Some(event) => {
                    drop(logs);
                    event.wait_signalled();
                }
                None => {
                    logs.retain(|_, slot| match slot {
                        LogSlot::Open(weak) => weak.strong_count() > 0,
                        LogSlot::Busy(_) => true,
                    });
                    let event = Event::new();
                    logs.insert(key, LogSlot::Busy(event.clone()));
                    return Claim::Reserved(Reservation {
                        inner: self,
                        key,
                        event,
                        published: None,
                    });
                }
            }
        }
    }

    #[cfg(test)]
    fn tracked_logs(&self) -> usize {
        self.logs.lock().len()
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.provider.release();
        debug!(target: "ktlog::manager", "Released storage root");
    }
}

/// Manager of the physical log containers on one storage root.
///
/// Cheap to clone; clones share the same instance.
#[derive(Clone)]
pub struct PhysicalLogManager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for PhysicalLogManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalLogManager")
            .field("provider", &self.inner.provider)
            .field("active", &self.is_active())
            .finish()
    }
}

impl PhysicalLogManager {
    /// Create a manager over `provider`.
    ///
    /// # Errors
    ///
    /// `SharingViolation` if another manager holds the root, or
    /// `InvalidParameter` for an invalid configuration.
    pub fn new(provider: Arc<dyn DeviceProvider>, config: PhysicalConfig) -> LogResult<Self> {
        config.validate()?;
        provider.claim()?;
        let dispatcher = match Dispatcher::new(config.dispatcher_threads) {
            Ok(d) => Arc::new(d),
            Err(e) => {
                provider.release();
                return Err(e);
            }
        };
        info!(target: "ktlog::manager", provider = ?provider, "Physical log manager started");
        Ok(PhysicalLogManager {
            inner: Arc::new(ManagerInner {
                provider,
                config,
                dispatcher,
                logs: Mutex::new(HashMap::new()),
                verifiers: RwLock::new(HashMap::new()),
                active: AtomicBool::new(true),
                gate: ActivityGate::new(),
            }),
        })
    }

    /// Create a manager storing containers as files below `root`.
    pub fn open_root(root: impl Into<PathBuf>, config: PhysicalConfig) -> LogResult<Self> {
        let provider = FileDeviceProvider::new(root)?;
        Self::new(Arc::new(provider), config)
    }

    /// Configuration the manager was built with
    pub fn config(&self) -> &PhysicalConfig {
        &self.inner.config
    }

    /// Dispatcher running `start_*` operations of this manager and its logs
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.inner.dispatcher
    }

    fn admit(&self) -> LogResult<ktlog_core::ActivityGuard> {
        if !self.inner.active.load(Ordering::Acquire) {
            return Err(LogError::ShutdownPending);
        }
        self.inner
            .gate
            .try_acquire()
            .ok_or(LogError::ShutdownPending)
    }

    /// Create a container.
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
    ) -> LogResult<PhysicalLog> {
        let interest = self.admit()?;
        options.validate()?;

        let mut reservation = match self.inner.claim((disk_id, log_id)) {
            Claim::Reserved(reservation) => reservation,
            Claim::Open(_) => {
                return Err(LogError::collision(format!(
                    "log {} on disk {}",
                    log_id, disk_id
                )))
            }
        };
        let header = ContainerHeader {
            log_id,
            log_type,
            log_size: options.log_size,
            max_streams: options.max_streams,
            max_record_size: options.max_record_size,
            flags: options.flags,
        };
        let device = self.inner.provider.create(disk_id, log_id)?;
        let written = device
            .append(&header.to_bytes())
            .and_then(|_| device.sync());
        if let Err(e) = written {
            if let Err(cleanup) = self.inner.provider.remove(disk_id, log_id) {
                warn!(target: "ktlog::manager", log = %log_id, error = %cleanup, "Failed to remove partial container");
            }
            return Err(e);
        }

        let recovered = Recovered {
            header,
            catalog: Catalog::new(CONTAINER_HEADER_SIZE as u64),
            stats: RecoveryStats::default(),
        };
        let shared = Arc::new(LogShared::new(
            disk_id,
            device,
            recovered,
            Arc::clone(&self.inner),
        ));
        reservation.publish(&shared);
        drop(reservation);
        info!(
            target: "ktlog::manager",
            disk = %disk_id,
            log = %log_id,
            size = options.log_size,
            "Created log container"
        );
        Ok(PhysicalLog::new(shared, interest))
    }

    /// Open a container, recovering it if it is not already open.
    ///
    /// # Errors
    ///
    /// `NotFound`, `CrcError` for a corrupted header or frame,
    /// `StructureFault` or `InvalidLogId` for an inconsistent container.
    pub fn open_log(&self, disk_id: DiskId, log_id: LogId) -> LogResult<PhysicalLog> {
        let interest = self.admit()?;

        // Concurrent openers of the same container wait and share one recovery
        let mut reservation = match self.inner.claim((disk_id, log_id)) {
            Claim::Reserved(reservation) => reservation,
            Claim::Open(shared) => {
                debug!(target: "ktlog::manager", log = %log_id, "Returning open log container");
                return Ok(PhysicalLog::new(shared, interest));
            }
        };

        let device = self.inner.provider.open(disk_id, log_id)?;
        let recovered = recover(device.as_ref(), log_id)?;
        let shared = Arc::new(LogShared::new(
            disk_id,
            device,
            recovered,
            Arc::clone(&self.inner),
        ));
        reservation.publish(&shared);
        drop(reservation);
        info!(target: "ktlog::manager", disk = %disk_id, log = %log_id, "Opened log container");
        Ok(PhysicalLog::new(shared, interest))
    }

    /// Delete a closed container.
    ///
    /// # Errors
    ///
    /// `NotFound`, or `SharingViolation` while any handle to it is open.
    pub fn delete_log(&self, disk_id: DiskId, log_id: LogId) -> LogResult<()> {
        let _interest = self.admit()?;
        let _reservation = match self.inner.claim((disk_id, log_id)) {
            Claim::Reserved(reservation) => reservation,
            Claim::Open(_) => {
                return Err(LogError::SharingViolation(format!(
                    "log {} on disk {} is open",
                    log_id, disk_id
                )))
            }
        };
        self.inner.provider.remove(disk_id, log_id)?;
        info!(target: "ktlog::manager", disk = %disk_id, log = %log_id, "Deleted log container");
        Ok(())
    }

    /// Ids of every container on `disk_id`
    pub fn enumerate_logs(&self, disk_id: DiskId) -> LogResult<Vec<LogId>> {
        let _interest = self.admit()?;
        self.inner.provider.list(disk_id)
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
        C: FnOnce(LogResult<PhysicalLog>) + Send + 'static,
    {
        let manager = self.clone();
        self.dispatcher().start(
            WritePriority::Normal,
            move |_| manager.create_log(disk_id, log_id, log_type, &options),
            callback,
        )
    }

    /// Asynchronous `open_log`
    pub fn start_open_log<C>(&self, disk_id: DiskId, log_id: LogId, callback: C) -> OperationHandle
    where
        C: FnOnce(LogResult<PhysicalLog>) + Send + 'static,
    {
        let manager = self.clone();
        self.dispatcher().start(
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
        self.dispatcher().start(
            WritePriority::Normal,
            move |_| manager.delete_log(disk_id, log_id),
            callback,
        )
    }

    /// Accept new operations again after `deactivate`
    pub fn activate(&self) {
        self.inner.gate.reopen();
        self.inner.active.store(true, Ordering::Release);
        info!(target: "ktlog::manager", "Physical log manager activated");
    }

    /// Refuse new operations with `ShutdownPending`.
    ///
    /// Open handles keep working. Deactivation completes when the last log
    /// handle is released; see `wait_deactivated`.
    pub fn deactivate(&self) {
        self.inner.active.store(false, Ordering::Release);
        self.inner.gate.close();
        info!(
            target: "ktlog::manager",
            open_handles = self.inner.gate.active(),
            "Physical log manager deactivating"
        );
    }

    /// Whether the manager accepts new operations
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Wait for every log handle to be released. Returns false on timeout.
    pub fn wait_deactivated(&self, timeout: Option<Duration>) -> bool {
        self.inner.gate.wait_drained(timeout)
    }

    /// Register the verifier for records of `stream_type`.
    ///
    /// # Errors
    ///
    /// `NameCollision` if a verifier is already registered for the type.
    pub fn register_verification_callback(
        &self,
        stream_type: StreamType,
        verifier: RecordVerifier,
    ) -> LogResult<()> {
        let mut verifiers = self.inner.verifiers.write();
        if verifiers.contains_key(&stream_type) {
            return Err(LogError::collision(format!(
                "verifier for stream type {}",
                stream_type
            )));
        }
        verifiers.insert(stream_type, verifier);
        Ok(())
    }

    /// Remove the verifier for `stream_type`, returning it.
    pub fn unregister_verification_callback(
        &self,
        stream_type: StreamType,
    ) -> LogResult<RecordVerifier> {
        self.inner
            .verifiers
            .write()
            .remove(&stream_type)
            .ok_or_else(|| LogError::not_found(format!("verifier for stream type {}", stream_type)))
    }

    /// Verifier registered for `stream_type`
    pub fn query_verification_callback(&self, stream_type: StreamType) -> Option<RecordVerifier> {
        self.inner.verifier(stream_type)
    }
}
