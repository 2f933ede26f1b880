//! File-backed drives
//!
//! Regular files standing in for block devices. Used for dry runs and by
//! the test suite, which can also make a drive vanish mid-write, fail
//! writes, refuse writes or stall reads.

use std::collections::{BTreeMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{Drive, DriveBackend, RawDevice, RestoreStatus};
use crate::config;
use crate::error::DriveError;
use crate::log_info;

const MODULE: &str = "devices::file";

/// Bytes zeroed at the start of a drive on restore (partition table area)
const RESTORE_WIPE_BYTES: u64 = 1024 * 1024;

struct FileDrive {
    drive: Drive,
    path: PathBuf,
    present: bool,
    read_only: bool,
    /// Writes still to fail with an I/O error
    write_faults: u32,
    /// Detach once this many bytes have been written
    remove_after: Option<u64>,
    /// Flip the byte at this offset when reading back
    corrupt_read_at: Option<u64>,
    stall_reads: Option<Duration>,
    fail_lock: bool,
    fail_restore: bool,
}

#[derive(Default)]
struct State {
    drives: BTreeMap<String, FileDrive>,
    locked: HashSet<String>,
    unavailable: Option<String>,
}

/// Backend whose drives are plain files
#[derive(Clone)]
pub struct FileBackend {
    state: Arc<Mutex<State>>,
    changes: broadcast::Sender<()>,
}

impl Default for FileBackend {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(config::devices::EVENT_CAPACITY);
        Self {
            state: Arc::default(),
            changes,
        }
    }
}

impl FileBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tell watchers that the drive set changed
    fn notify(&self) {
        let _ = self.changes.send(());
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_drive<T>(&self, id: &str, f: impl FnOnce(&mut FileDrive) -> T) -> Option<T> {
        self.state().drives.get_mut(id).map(f)
    }

    /// Attach a drive of `capacity` bytes stored in `path`
    pub fn add_drive(
        &self,
        id: &str,
        label: &str,
        path: PathBuf,
        capacity: u64,
        contains_live: bool,
    ) -> io::Result<Drive> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        file.set_len(capacity)?;

        let drive = Drive {
            id: id.to_string(),
            device: path.display().to_string(),
            label: label.to_string(),
            capacity,
            removable: true,
            restore_status: if contains_live {
                RestoreStatus::ContainsLive
            } else {
                RestoreStatus::Clean
            },
            locked: false,
        };

        self.state().drives.insert(
            id.to_string(),
            FileDrive {
                drive: drive.clone(),
                path,
                present: true,
                read_only: false,
                write_faults: 0,
                remove_after: None,
                corrupt_read_at: None,
                stall_reads: None,
                fail_lock: false,
                fail_restore: false,
            },
        );
        self.notify();
        Ok(drive)
    }

    /// Detach a drive, as if unplugged
    pub fn remove_drive(&self, id: &str) {
        self.with_drive(id, |d| d.present = false);
        self.notify();
    }

    /// Detach the drive once `bytes` have been written to it
    pub fn remove_after_bytes(&self, id: &str, bytes: u64) {
        self.with_drive(id, |d| d.remove_after = Some(bytes));
    }

    /// Fail the next `count` writes with an I/O error
    pub fn inject_write_faults(&self, id: &str, count: u32) {
        self.with_drive(id, |d| d.write_faults = count);
    }

    pub fn set_read_only(&self, id: &str, read_only: bool) {
        self.with_drive(id, |d| d.read_only = read_only);
    }

    pub fn corrupt_read_at(&self, id: &str, offset: u64) {
        self.with_drive(id, |d| d.corrupt_read_at = Some(offset));
    }

    pub fn stall_reads(&self, id: &str, delay: Duration) {
        self.with_drive(id, |d| d.stall_reads = Some(delay));
    }

    pub fn fail_lock(&self, id: &str) {
        self.with_drive(id, |d| d.fail_lock = true);
    }

    pub fn fail_restore(&self, id: &str) {
        self.with_drive(id, |d| d.fail_restore = true);
    }

    /// Make enumeration fail as if the platform service were missing
    pub fn set_unavailable(&self, reason: Option<&str>) {
        self.state().unavailable = reason.map(str::to_string);
        self.notify();
    }

    pub fn is_locked(&self, id: &str) -> bool {
        self.state().locked.contains(id)
    }

    /// Contents of the drive file
    pub fn read_contents(&self, id: &str) -> io::Result<Vec<u8>> {
        let path = self
            .with_drive(id, |d| d.path.clone())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, id.to_string()))?;
        std::fs::read(path)
    }

    fn present_drive(&self, drive: &Drive) -> Result<(PathBuf, bool), DriveError> {
        self.with_drive(&drive.id, |d| (d.present, d.path.clone(), d.read_only))
            .and_then(|(present, path, read_only)| present.then_some((path, read_only)))
            .ok_or_else(|| DriveError::NotFound(drive.id.clone()))
    }

    fn open(&self, drive: &Drive, write: bool) -> Result<Box<dyn RawDevice>, DriveError> {
        let (path, read_only) = self.present_drive(drive)?;
        if write && read_only {
            return Err(DriveError::NotWritable {
                drive: drive.id.clone(),
                reason: "medium is write protected".to_string(),
            });
        }

        let file = OpenOptions::new()
            .read(true)
            .write(write)
            .open(&path)
            .map_err(|e| DriveError::CouldNotOpen {
                drive: drive.id.clone(),
                reason: e.to_string(),
            })?;

        Ok(Box::new(FileDevice {
            file,
            id: drive.id.clone(),
            capacity: drive.capacity,
            written: 0,
            backend: self.clone(),
        }))
    }
}

#[async_trait]
impl DriveBackend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn subscribe_changes(&self) -> Option<broadcast::Receiver<()>> {
        Some(self.changes.subscribe())
    }

    async fn enumerate(&self) -> Result<Vec<Drive>, DriveError> {
        let state = self.state();
        if let Some(reason) = &state.unavailable {
            return Err(DriveError::ServiceUnavailable(reason.clone()));
        }
        Ok(state
            .drives
            .values()
            .filter(|d| d.present)
            .map(|d| d.drive.clone())
            .collect())
    }

    async fn lock(&self, drive: &Drive) -> Result<(), DriveError> {
        let mut state = self.state();
        let fail = match state.drives.get(&drive.id) {
            Some(d) if d.present => d.fail_lock,
            _ => return Err(DriveError::NotFound(drive.id.clone())),
        };
        if fail || !state.locked.insert(drive.id.clone()) {
            return Err(DriveError::CouldNotLock {
                drive: drive.id.clone(),
                reason: "device is busy".to_string(),
            });
        }
        Ok(())
    }

    async fn unlock(&self, drive: &Drive) -> Result<(), DriveError> {
        self.state().locked.remove(&drive.id);
        Ok(())
    }

    async fn open_for_raw_write(&self, drive: &Drive) -> Result<Box<dyn RawDevice>, DriveError> {
        self.open(drive, true)
    }

    async fn open_for_read(&self, drive: &Drive) -> Result<Box<dyn RawDevice>, DriveError> {
        self.open(drive, false)
    }

    async fn eject(&self, drive: &Drive) -> Result<(), DriveError> {
        self.remove_drive(&drive.id);
        Ok(())
    }

    async fn restore(&self, drive: &Drive) -> Result<(), DriveError> {
        let restore_failed = |reason: String| DriveError::RestoreFailed {
            drive: drive.id.clone(),
            reason,
        };

        let (path, fail) = self
            .with_drive(&drive.id, |d| (d.path.clone(), d.fail_restore))
            .ok_or_else(|| DriveError::NotFound(drive.id.clone()))?;
        if fail {
            return Err(restore_failed("partition table could not be created".to_string()));
        }

        let mut file = OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|e| restore_failed(e.to_string()))?;
        let wipe = RESTORE_WIPE_BYTES.min(drive.capacity) as usize;
        file.write_all(&vec![0u8; wipe])
            .and_then(|_| file.sync_all())
            .map_err(|e| restore_failed(e.to_string()))?;

        self.with_drive(&drive.id, |d| d.drive.restore_status = RestoreStatus::Clean);
        log_info!(MODULE, "Restored {}", drive.id);
        Ok(())
    }

    fn is_present(&self, drive: &Drive) -> bool {
        self.with_drive(&drive.id, |d| d.present).unwrap_or(false)
    }
}

/// Open handle on a file-backed drive
struct FileDevice {
    file: File,
    id: String,
    capacity: u64,
    written: u64,
    backend: FileBackend,
}

fn device_gone() -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, "no such device")
}

impl Write for FileDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.written;
        let mut detached = false;
        let fault = self
            .backend
            .with_drive(&self.id, |d| {
                if !d.present {
                    return Err(device_gone());
                }
                if d.remove_after.is_some_and(|limit| written >= limit) {
                    d.present = false;
                    detached = true;
                    return Err(device_gone());
                }
                if d.write_faults > 0 {
                    d.write_faults -= 1;
                    return Err(io::Error::new(io::ErrorKind::Other, "input/output error"));
                }
                Ok(d.remove_after)
            })
            .unwrap_or_else(|| Err(device_gone()));
        if detached {
            self.backend.notify();
        }
        let remove_after = fault?;

        let position = self.file.stream_position()?;
        if position >= self.capacity {
            return Ok(0);
        }
        let mut len = buf.len().min((self.capacity - position) as usize);
        if let Some(limit) = remove_after {
            // Stop exactly at the removal point
            len = len.min(limit.saturating_sub(written).max(1) as usize);
        }

        let n = self.file.write(&buf[..len])?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Read for FileDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let (present, corrupt_at, stall) = self
            .backend
            .with_drive(&self.id, |d| (d.present, d.corrupt_read_at, d.stall_reads))
            .unwrap_or((false, None, None));
        if !present {
            return Err(device_gone());
        }
        if let Some(delay) = stall {
            std::thread::sleep(delay);
        }

        let position = self.file.stream_position()?;
        let n = self.file.read(buf)?;
        if let Some(offset) = corrupt_at {
            if offset >= position && offset < position + n as u64 {
                buf[(offset - position) as usize] ^= 0xff;
            }
        }
        Ok(n)
    }
}

impl Seek for FileDevice {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl RawDevice for FileDevice {
    fn sync(&mut self) -> io::Result<()> {
        if !self.backend.with_drive(&self.id, |d| d.present).unwrap_or(false) {
            return Err(device_gone());
        }
        self.file.flush()?;
        self.file.sync_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_beyond_capacity_returns_zero() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new();
        let drive = backend.add_drive("d", "D", dir.path().join("d.img"), 16, false).unwrap();

        let mut device = backend.open_for_raw_write(&drive).await.unwrap();
        let err = device.write_all(&[1u8; 32]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }

    #[tokio::test]
    async fn test_removal_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new();
        let drive = backend.add_drive("d", "D", dir.path().join("d.img"), 1024, false).unwrap();
        backend.remove_after_bytes("d", 100);

        let mut device = backend.open_for_raw_write(&drive).await.unwrap();
        assert!(device.write_all(&[1u8; 200]).is_err());
        assert!(!backend.is_present(&drive));
        assert!(backend.enumerate().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_only_drive_rejects_open() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new();
        let drive = backend.add_drive("d", "D", dir.path().join("d.img"), 1024, false).unwrap();
        backend.set_read_only("d", true);

        let err = backend.open_for_raw_write(&drive).await.err().unwrap();
        assert!(matches!(err, DriveError::NotWritable { .. }));
    }
}
