//! Block storage consumed by log containers.
//!
//! A container is one append-only byte device. `DeviceProvider` maps
//! `(DiskId, LogId)` to devices below a storage root and hands out the
//! exclusive claim that makes a manager the only one on that root.
//!
//! Two providers are included:
//! - `FileDeviceProvider`: one file per container under `<root>/<disk>/`
//! - `MemoryDeviceProvider`: in-memory devices with fault injection for tests

use fs2::FileExt;
use ktlog_core::{DiskId, LogError, LogId, LogResult};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// File extension of container files
pub const CONTAINER_EXTENSION: &str = "ktl";

/// Name of the claim file at the storage root
pub const CLAIM_FILE_NAME: &str = ".ktlog.lock";

/// Append-only byte device holding one container.
pub trait BlockDevice: Send + Sync + fmt::Debug {
    /// Current device length in bytes
    fn size(&self) -> LogResult<u64>;

    /// Fill `buf` from `offset`. Short reads are errors.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> LogResult<()>;

    /// Append bytes at the end of the device
    fn append(&self, data: &[u8]) -> LogResult<()>;

    /// Make appended bytes durable
    fn sync(&self) -> LogResult<()>;

    /// Cut the device to `len` bytes
    fn truncate(&self, len: u64) -> LogResult<()>;
}

/// Storage root holding the devices of many containers.
pub trait DeviceProvider: Send + Sync + fmt::Debug {
    /// Take the exclusive claim on the root.
    ///
    /// Fails `SharingViolation` if another manager holds it.
    fn claim(&self) -> LogResult<()>;

    /// Give up the claim
    fn release(&self);

    /// Create an empty device. Fails `NameCollision` if it exists.
    fn create(&self, disk: DiskId, log: LogId) -> LogResult<Arc<dyn BlockDevice>>;

    /// Open an existing device. Fails `NotFound`.
    fn open(&self, disk: DiskId, log: LogId) -> LogResult<Arc<dyn BlockDevice>>;

    /// Remove a device. Fails `NotFound`.
    fn remove(&self, disk: DiskId, log: LogId) -> LogResult<()>;

    /// Ids of all devices on a disk
    fn list(&self, disk: DiskId) -> LogResult<Vec<LogId>>;

    /// Atomically replace a device's contents with `image` and return the
    /// new device. Readers holding the old device keep seeing old contents.
    fn replace(&self, disk: DiskId, log: LogId, image: &[u8]) -> LogResult<Arc<dyn BlockDevice>>;
}

// ============================================================================
// File devices
// ============================================================================

/// Container stored in a regular file.
#[derive(Debug)]
pub struct FileDevice {
    file: Mutex<File>,
    path: PathBuf,
}

impl FileDevice {
    fn new(file: File, path: PathBuf) -> Self {
        FileDevice {
            file: Mutex::new(file),
            path,
        }
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockDevice for FileDevice {
    fn size(&self) -> LogResult<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> LogResult<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn append(&self, data: &[u8]) -> LogResult<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::End(0))?;
        file.write_all(data)?;
        Ok(())
    }

    fn sync(&self) -> LogResult<()> {
        self.file.lock().sync_data()?;
        Ok(())
    }

    fn truncate(&self, len: u64) -> LogResult<()> {
        let file = self.file.lock();
        file.set_len(len)?;
        file.sync_all()?;
        Ok(())
    }
}

/// Devices stored as files below a root directory.
///
/// Layout: `<root>/<disk-id>/<log-id>.ktl`, plus the claim file
/// `<root>/.ktlog.lock` locked exclusively while a manager is active.
#[derive(Debug)]
pub struct FileDeviceProvider {
    root: PathBuf,
    claim: Mutex<Option<File>>,
}

impl FileDeviceProvider {
    /// Create a provider rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> LogResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(FileDeviceProvider {
            root,
            claim: Mutex::new(None),
        })
    }

    /// Storage root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn disk_dir(&self, disk: DiskId) -> PathBuf {
        self.root.join(disk.to_string())
    }

    /// Path of the file backing `(disk, log)`
    pub fn container_path(&self, disk: DiskId, log: LogId) -> PathBuf {
        self.disk_dir(disk)
            .join(format!("{}.{}", log, CONTAINER_EXTENSION))
    }

    fn map_not_found(e: io::Error, disk: DiskId, log: LogId) -> LogError {
        if e.kind() == io::ErrorKind::NotFound {
            LogError::not_found(format!("log {} on disk {}", log, disk))
        } else {
            LogError::Io(e)
        }
    }
}

impl DeviceProvider for FileDeviceProvider {
    fn claim(&self) -> LogResult<()> {
        let mut claim = self.claim.lock();
        if claim.is_some() {
            return Err(LogError::SharingViolation(format!(
                "storage root '{}' is already claimed",
                self.root.display()
            )));
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(self.root.join(CLAIM_FILE_NAME))?;
        file.try_lock_exclusive().map_err(|_| {
            LogError::SharingViolation(format!(
                "storage root '{}' is in use by another manager",
                self.root.display()
            ))
        })?;
        *claim = Some(file);
        debug!(target: "ktlog::device", root = %self.root.display(), "Claimed storage root");
        Ok(())
    }

    fn release(&self) {
        if let Some(file) = self.claim.lock().take() {
            let _ = FileExt::unlock(&file);
        }
    }

    fn create(&self, disk: DiskId, log: LogId) -> LogResult<Arc<dyn BlockDevice>> {
        fs::create_dir_all(self.disk_dir(disk))?;
        let path = self.container_path(disk, log);
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == io::ErrorKind::AlreadyExists {
                    LogError::collision(format!("log {} on disk {}", log, disk))
                } else {
                    LogError::Io(e)
                }
            })?;
        Ok(Arc::new(FileDevice::new(file, path)))
    }

    fn open(&self, disk: DiskId, log: LogId) -> LogResult<Arc<dyn BlockDevice>> {
        let path = self.container_path(disk, log);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| Self::map_not_found(e, disk, log))?;
        Ok(Arc::new(FileDevice::new(file, path)))
    }

    fn remove(&self, disk: DiskId, log: LogId) -> LogResult<()> {
        fs::remove_file(self.container_path(disk, log))
            .map_err(|e| Self::map_not_found(e, disk, log))
    }

    fn list(&self, disk: DiskId) -> LogResult<Vec<LogId>> {
        let dir = self.disk_dir(disk);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut logs = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CONTAINER_EXTENSION) {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(LogId::from_string)
            {
                logs.push(id);
            }
        }
        logs.sort();
        Ok(logs)
    }

    fn replace(&self, disk: DiskId, log: LogId, image: &[u8]) -> LogResult<Arc<dyn BlockDevice>> {
        let final_path = self.container_path(disk, log);
        let temp_path = self.disk_dir(disk).join(format!(".{}.compact.tmp", log));

        // Write to a temporary file, fsync, rename over, fsync the directory
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&temp_path)?;
        file.write_all(image)?;
        file.sync_all()?;
        fs::rename(&temp_path, &final_path)?;
        File::open(self.disk_dir(disk))?.sync_all()?;

        info!(target: "ktlog::device", log = %log, bytes = image.len(), "Replaced container image");
        Ok(Arc::new(FileDevice::new(file, final_path)))
    }
}

// ============================================================================
// Memory devices
// ============================================================================

/// Fault a `MemoryDevice` injects into its next matching operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFault {
    /// The next append fails without writing anything
    FailAppend,
    /// The next append writes half its bytes and then fails
    TornAppend,
    /// The next sync fails
    FailSync,
}

/// In-memory container with fault injection.
#[derive(Debug, Default)]
pub struct MemoryDevice {
    data: Mutex<Vec<u8>>,
    faults: Mutex<VecDeque<DeviceFault>>,
}

impl MemoryDevice {
    /// Create an empty device
    pub fn new() -> Self {
        Self::default()
    }

    fn with_contents(data: Vec<u8>, faults: VecDeque<DeviceFault>) -> Self {
        MemoryDevice {
            data: Mutex::new(data),
            faults: Mutex::new(faults),
        }
    }

    /// Queue a one-shot fault
    pub fn inject_fault(&self, fault: DeviceFault) {
        self.faults.lock().push_back(fault);
    }

    /// XOR the byte at `offset` with `mask`
    pub fn corrupt(&self, offset: u64, mask: u8) {
        if let Some(byte) = self.data.lock().get_mut(offset as usize) {
            *byte ^= mask;
        }
    }

    /// Copy of the current contents
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    fn take_fault(&self, wanted: &[DeviceFault]) -> Option<DeviceFault> {
        let mut faults = self.faults.lock();
        let pos = faults.iter().position(|f| wanted.contains(f))?;
        faults.remove(pos)
    }

    fn injected(what: &str) -> LogError {
        LogError::Io(io::Error::new(
            io::ErrorKind::Other,
            format!("injected {} failure", what),
        ))
    }
}

impl BlockDevice for MemoryDevice {
    fn size(&self) -> LogResult<u64> {
        Ok(self.data.lock().len() as u64)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> LogResult<()> {
        let data = self.data.lock();
        let start = offset as usize;
        let end = start
            .checked_add(buf.len())
            .filter(|end| *end <= data.len())
            .ok_or_else(|| {
                LogError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "read past end of device",
                ))
            })?;
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn append(&self, bytes: &[u8]) -> LogResult<()> {
        match self.take_fault(&[DeviceFault::FailAppend, DeviceFault::TornAppend]) {
            Some(DeviceFault::FailAppend) => Err(Self::injected("append")),
            Some(DeviceFault::TornAppend) => {
                self.data
                    .lock()
                    .extend_from_slice(&bytes[..bytes.len() / 2]);
                Err(Self::injected("torn append"))
            }
            _ => {
                self.data.lock().extend_from_slice(bytes);
                Ok(())
            }
        }
    }

    fn sync(&self) -> LogResult<()> {
        match self.take_fault(&[DeviceFault::FailSync]) {
            Some(_) => Err(Self::injected("sync")),
            None => Ok(()),
        }
    }

    fn truncate(&self, len: u64) -> LogResult<()> {
        self.data.lock().truncate(len as usize);
        Ok(())
    }
}

/// In-memory storage root.
#[derive(Debug, Default)]
pub struct MemoryDeviceProvider {
    devices: Mutex<HashMap<(DiskId, LogId), Arc<MemoryDevice>>>,
    claimed: AtomicBool,
}

impl MemoryDeviceProvider {
    /// Create an empty root
    pub fn new() -> Self {
        Self::default()
    }

    /// The device currently backing `(disk, log)`, for fault injection
    pub fn device(&self, disk: DiskId, log: LogId) -> Option<Arc<MemoryDevice>> {
        self.devices.lock().get(&(disk, log)).cloned()
    }
}

impl DeviceProvider for MemoryDeviceProvider {
    fn claim(&self) -> LogResult<()> {
        if self.claimed.swap(true, Ordering::AcqRel) {
            return Err(LogError::SharingViolation(
                "memory storage root is already claimed".to_string(),
            ));
        }
        Ok(())
    }

    fn release(&self) {
        self.claimed.store(false, Ordering::Release);
    }

    fn create(&self, disk: DiskId, log: LogId) -> LogResult<Arc<dyn BlockDevice>> {
        let mut devices = self.devices.lock();
        if devices.contains_key(&(disk, log)) {
            return Err(LogError::collision(format!("log {} on disk {}", log, disk)));
        }
        let device = Arc::new(MemoryDevice::new());
        devices.insert((disk, log), Arc::clone(&device));
        Ok(device)
    }

    fn open(&self, disk: DiskId, log: LogId) -> LogResult<Arc<dyn BlockDevice>> {
        self.devices
            .lock()
            .get(&(disk, log))
            .cloned()
            .map(|d| d as Arc<dyn BlockDevice>)
            .ok_or_else(|| LogError::not_found(format!("log {} on disk {}", log, disk)))
    }

    fn remove(&self, disk: DiskId, log: LogId) -> LogResult<()> {
        self.devices
            .lock()
            .remove(&(disk, log))
            .map(|_| ())
            .ok_or_else(|| LogError::not_found(format!("log {} on disk {}", log, disk)))
    }

    fn list(&self, disk: DiskId) -> LogResult<Vec<LogId>> {
        let mut logs: Vec<LogId> = self
            .devices
            .lock()
            .keys()
            .filter(|(d, _)| *d == disk)
            .map(|(_, l)| *l)
            .collect();
        logs.sort();
        Ok(logs)
    }

    fn replace(&self, disk: DiskId, log: LogId, image: &[u8]) -> LogResult<Arc<dyn BlockDevice>> {
        let mut devices = self.devices.lock();
        let old = devices
            .get(&(disk, log))
            .ok_or_else(|| LogError::not_found(format!("log {} on disk {}", log, disk)))?;
        // Pending faults follow the container onto its new device
        let faults = std::mem::take(&mut *old.faults.lock());
        let device = Arc::new(MemoryDevice::with_contents(image.to_vec(), faults));
        devices.insert((disk, log), Arc::clone(&device));
        Ok(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_memory_device_append_and_read() {
        let device = MemoryDevice::new();
        device.append(b"hello").unwrap();
        device.append(b" world").unwrap();
        assert_eq!(device.size().unwrap(), 11);

        let mut buf = [0u8; 5];
        device.read_at(6, &mut buf).unwrap();
        assert_eq!(&buf, b"world");

        let mut past_end = [0u8; 4];
        assert!(device.read_at(9, &mut past_end).is_err());
    }

    #[test]
    fn test_memory_device_faults_are_one_shot() {
        let device = MemoryDevice::new();
        device.inject_fault(DeviceFault::FailAppend);
        assert!(device.append(b"abcd").is_err());
        assert_eq!(device.size().unwrap(), 0);
        device.append(b"abcd").unwrap();
        assert_eq!(device.size().unwrap(), 4);

        device.inject_fault(DeviceFault::TornAppend);
        assert!(device.append(b"12345678").is_err());
        assert_eq!(device.size().unwrap(), 8);

        device.inject_fault(DeviceFault::FailSync);
        assert!(device.sync().is_err());
        assert!(device.sync().is_ok());
    }

    #[test]
    fn test_memory_provider_lifecycle() {
        let provider = MemoryDeviceProvider::new();
        let disk = DiskId::new();
        let log = LogId::new();

        provider.create(disk, log).unwrap();
        assert!(matches!(
            provider.create(disk, log),
            Err(LogError::NameCollision(_))
        ));
        assert_eq!(provider.list(disk).unwrap(), vec![log]);
        assert!(provider.list(DiskId::new()).unwrap().is_empty());

        provider.remove(disk, log).unwrap();
        assert!(matches!(provider.open(disk, log), Err(LogError::NotFound(_))));
    }

    #[test]
    fn test_memory_provider_single_claim() {
        let provider = MemoryDeviceProvider::new();
        provider.claim().unwrap();
        assert!(matches!(
            provider.claim(),
            Err(LogError::SharingViolation(_))
        ));
        provider.release();
        provider.claim().unwrap();
    }

    #[test]
    fn test_memory_replace_keeps_old_readers() {
        let provider = MemoryDeviceProvider::new();
        let disk = DiskId::new();
        let log = LogId::new();
        let old = provider.create(disk, log).unwrap();
        old.append(b"old contents").unwrap();

        let new = provider.replace(disk, log, b"new").unwrap();
        assert_eq!(new.size().unwrap(), 3);
        assert_eq!(old.size().unwrap(), 12);
        assert_eq!(provider.device(disk, log).unwrap().contents(), b"new");
    }

    #[test]
    fn test_file_provider_round_trip() {
        let dir = tempdir().unwrap();
        let provider = FileDeviceProvider::new(dir.path()).unwrap();
        let disk = DiskId::new();
        let log = LogId::new();

        let device = provider.create(disk, log).unwrap();
        device.append(b"frame").unwrap();
        device.sync().unwrap();
        drop(device);

        let device = provider.open(disk, log).unwrap();
        let mut buf = [0u8; 5];
        device.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"frame");
        assert_eq!(provider.list(disk).unwrap(), vec![log]);

        let replaced = provider.replace(disk, log, b"xy").unwrap();
        assert_eq!(replaced.size().unwrap(), 2);
        assert!(!dir
            .path()
            .join(disk.to_string())
            .join(format!(".{}.compact.tmp", log))
            .exists());

        provider.remove(disk, log).unwrap();
        assert!(matches!(provider.open(disk, log), Err(LogError::NotFound(_))));
        assert!(matches!(provider.remove(disk, log), Err(LogError::NotFound(_))));
    }

    #[test]
    fn test_file_provider_claim_is_exclusive() {
        let dir = tempdir().unwrap();
        let first = FileDeviceProvider::new(dir.path()).unwrap();
        let second = FileDeviceProvider::new(dir.path()).unwrap();

        first.claim().unwrap();
        assert!(matches!(
            second.claim(),
            Err(LogError::SharingViolation(_))
        ));
        first.release();
        second.claim().unwrap();
        second.release();
    }
}
