//! Device management module
//!
//! One capability contract ([`DriveBackend`]) with a backend per platform,
//! plus the [`DriveManager`] that keeps the live drive list, reports
//! attach/detach and hands out exclusive reservations.

mod file;
#[cfg(target_os = "linux")]
mod linux;
mod types;
#[cfg(target_os = "windows")]
mod windows;

pub use file::FileBackend;
pub use types::{Drive, RestoreStatus};

use std::collections::{HashMap, HashSet};
use std::io::{Read, Seek, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config;
use crate::error::DriveError;
use crate::{log_debug, log_error, log_info, log_warn};

const MODULE: &str = "devices";

/// Raw handle to a drive
pub trait RawDevice: Read + Write + Seek + Send {
    /// Flush everything down to the media
    fn sync(&mut self) -> std::io::Result<()>;
}

impl RawDevice for std::fs::File {
    fn sync(&mut self) -> std::io::Result<()> {
        self.flush()?;
        self.sync_all()
    }
}

/// Platform capability set
#[async_trait]
pub trait DriveBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Removable drives currently attached
    async fn enumerate(&self) -> Result<Vec<Drive>, DriveError>;

    /// Keep the host from mounting or writing the drive
    async fn lock(&self, drive: &Drive) -> Result<(), DriveError>;

    async fn unlock(&self, drive: &Drive) -> Result<(), DriveError>;

    async fn open_for_raw_write(&self, drive: &Drive) -> Result<Box<dyn RawDevice>, DriveError>;

    async fn open_for_read(&self, drive: &Drive) -> Result<Box<dyn RawDevice>, DriveError>;

    async fn eject(&self, drive: &Drive) -> Result<(), DriveError>;

    /// Reinitialize the drive with a single empty FAT partition
    async fn restore(&self, drive: &Drive) -> Result<(), DriveError>;

    /// Whether the drive is still attached. Cheap, callable from blocking code.
    fn is_present(&self, drive: &Drive) -> bool;

    /// Fires when drives may have come or gone. `None` means the backend
    /// can only be polled.
    async fn subscribe_changes(&self) -> Option<broadcast::Receiver<()>> {
        None
    }
}

/// Backend for platforms without raw device support
pub struct UnsupportedBackend;

#[async_trait]
impl DriveBackend for UnsupportedBackend {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    async fn enumerate(&self) -> Result<Vec<Drive>, DriveError> {
        Err(DriveError::ServiceUnavailable(format!(
            "no drive backend for {}",
            std::env::consts::OS
        )))
    }

    async fn lock(&self, _drive: &Drive) -> Result<(), DriveError> {
        Err(DriveError::ServiceUnavailable("unsupported platform".into()))
    }

    async fn unlock(&self, _drive: &Drive) -> Result<(), DriveError> {
        Ok(())
    }

    async fn open_for_raw_write(&self, _drive: &Drive) -> Result<Box<dyn RawDevice>, DriveError> {
        Err(DriveError::ServiceUnavailable("unsupported platform".into()))
    }

    async fn open_for_read(&self, _drive: &Drive) -> Result<Box<dyn RawDevice>, DriveError> {
        Err(DriveError::ServiceUnavailable("unsupported platform".into()))
    }

    async fn eject(&self, _drive: &Drive) -> Result<(), DriveError> {
        Err(DriveError::ServiceUnavailable("unsupported platform".into()))
    }

    async fn restore(&self, _drive: &Drive) -> Result<(), DriveError> {
        Err(DriveError::ServiceUnavailable("unsupported platform".into()))
    }

    fn is_present(&self, _drive: &Drive) -> bool {
        false
    }
}

/// Backend for the host platform
pub fn platform_backend() -> Arc<dyn DriveBackend> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(linux::UDisksBackend::new())
    }
    #[cfg(target_os = "windows")]
    {
        Arc::new(windows::WindowsBackend::new())
    }
    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        Arc::new(UnsupportedBackend)
    }
}

/// Find a drive by id through the backend
pub async fn find_drive(backend: &dyn DriveBackend, id: &str) -> Result<Drive, DriveError> {
    backend
        .enumerate()
        .await?
        .into_iter()
        .find(|d| d.id == id)
        .ok_or_else(|| DriveError::NotFound(id.to_string()))
}

/// Backend lock held for the duration of a job.
///
/// Call [`BackendLock::unlock`] on every normal exit. If the guard is dropped
/// instead (panic, aborted task) the unlock is spawned on the runtime.
pub struct BackendLock {
    backend: Arc<dyn DriveBackend>,
    drive: Drive,
    held: bool,
}

impl BackendLock {
    pub async fn acquire(backend: Arc<dyn DriveBackend>, drive: &Drive) -> Result<Self, DriveError> {
        backend.lock(drive).await?;
        log_debug!(MODULE, "Locked {}", drive.id);
        Ok(Self {
            backend,
            drive: drive.clone(),
            held: true,
        })
    }

    pub async fn unlock(mut self) -> Result<(), DriveError> {
        self.held = false;
        let result = self.backend.unlock(&self.drive).await;
        match &result {
            Ok(()) => log_debug!(MODULE, "Unlocked {}", self.drive.id),
            Err(e) => log_error!(MODULE, "Failed to unlock {}: {}", self.drive.id, e),
        }
        result
    }
}

impl Drop for BackendLock {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        log_warn!(MODULE, "Lock on {} dropped without unlock", self.drive.id);
        let backend = self.backend.clone();
        let drive = self.drive.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = backend.unlock(&drive).await {
                    log_error!(MODULE, "Deferred unlock of {} failed: {}", drive.id, e);
                }
            });
        }
    }
}

/// Whether the platform service behind the backend works
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Available,
    Broken(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveEvent {
    Attached(Drive),
    Detached(Drive),
    AvailabilityChanged(Availability),
}

struct Registry {
    drives: Vec<Drive>,
    availability: Availability,
    /// Drives reserved by a job
    reserved: HashSet<String>,
    /// Restore states set during this session, cleared on detach
    restore_marks: HashMap<String, RestoreStatus>,
    last_restorable: Option<String>,
}

/// Live view of the attached drives
#[derive(Clone)]
pub struct DriveManager {
    backend: Arc<dyn DriveBackend>,
    registry: Arc<Mutex<Registry>>,
    events: broadcast::Sender<DriveEvent>,
    poll_interval: Duration,
}

impl DriveManager {
    pub fn new(backend: Arc<dyn DriveBackend>, poll_interval: Duration) -> Self {
        let (events, _) = broadcast::channel(config::devices::EVENT_CAPACITY);
        Self {
            backend,
            registry: Arc::new(Mutex::new(Registry {
                drives: Vec::new(),
                availability: Availability::Available,
                reserved: HashSet::new(),
                restore_marks: HashMap::new(),
                last_restorable: None,
            })),
            events,
            poll_interval,
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        // A poisoned registry still holds consistent plain data
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn backend(&self) -> Arc<dyn DriveBackend> {
        self.backend.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DriveEvent> {
        self.events.subscribe()
    }

    /// Drives sorted by capacity
    pub fn drives(&self) -> Vec<Drive> {
        self.registry().drives.clone()
    }

    pub fn drive(&self, id: &str) -> Option<Drive> {
        self.registry().drives.iter().find(|d| d.id == id).cloned()
    }

    pub fn availability(&self) -> Availability {
        self.registry().availability.clone()
    }

    /// Most recently attached drive that holds a live system
    pub fn last_restorable(&self) -> Option<Drive> {
        let registry = self.registry();
        let id = registry.last_restorable.as_ref()?;
        registry
            .drives
            .iter()
            .find(|d| &d.id == id && d.contains_live())
            .cloned()
    }

    fn set_availability(&self, availability: Availability) {
        let changed = {
            let mut registry = self.registry();
            let changed = registry.availability != availability;
            registry.availability = availability.clone();
            changed
        };
        if changed {
            let _ = self.events.send(DriveEvent::AvailabilityChanged(availability));
        }
    }

    /// Enumerate once, update the list and emit attach/detach events
    pub async fn refresh(&self) -> Vec<Drive> {
        let found = match self.backend.enumerate().await {
            Ok(drives) => drives,
            Err(DriveError::ServiceUnavailable(reason)) => {
                log_warn!(MODULE, "Drive service unavailable: {}", reason);
                self.set_availability(Availability::Broken(reason));
                let detached = std::mem::take(&mut self.registry().drives);
                for drive in detached {
                    let _ = self.events.send(DriveEvent::Detached(drive));
                }
                return Vec::new();
            }
            Err(e) => {
                log_error!(MODULE, "Drive enumeration failed: {}", e);
                return self.drives();
            }
        };
        self.set_availability(Availability::Available);

        let mut attached = Vec::new();
        let mut detached = Vec::new();
        let drives = {
            let mut registry = self.registry();
            let mut drives: Vec<Drive> = found
                .into_iter()
                .map(|mut drive| {
                    if let Some(mark) = registry.restore_marks.get(&drive.id) {
                        drive.restore_status = *mark;
                    }
                    drive.locked = registry.reserved.contains(&drive.id);
                    drive
                })
                .collect();
            drives.sort_by(|a, b| a.capacity.cmp(&b.capacity).then_with(|| a.id.cmp(&b.id)));

            for drive in &drives {
                if !registry.drives.iter().any(|d| d.id == drive.id) {
                    attached.push(drive.clone());
                }
            }
            for drive in &registry.drives {
                if !drives.iter().any(|d| d.id == drive.id) {
                    detached.push(drive.clone());
                }
            }

            for drive in &detached {
                registry.restore_marks.remove(&drive.id);
                if registry.last_restorable.as_deref() == Some(drive.id.as_str()) {
                    registry.last_restorable = None;
                }
            }
            if let Some(live) = attached.iter().rev().find(|d| d.contains_live()) {
                registry.last_restorable = Some(live.id.clone());
            }

            registry.drives = drives.clone();
            drives
        };

        for drive in detached {
            log_info!(MODULE, "Drive detached: {}", drive.display_name());
            let _ = self.events.send(DriveEvent::Detached(drive));
        }
        for drive in attached {
            log_info!(MODULE, "Drive attached: {}", drive.display_name());
            let _ = self.events.send(DriveEvent::Attached(drive));
        }

        drives
    }

    /// Keep refreshing in the background until the returned handle is dropped.
    ///
    /// Refreshes on every change the backend reports, and on a timer as well
    /// in case a notification is missed.
    pub fn watch(&self) -> DriveWatcher {
        let manager = self.clone();
        let task = tokio::spawn(async move {
            let mut changes = manager.backend.subscribe_changes().await;
            if changes.is_none() {
                log_debug!(MODULE, "{} reports no changes, polling", manager.backend.name());
            }
            let mut ticker = tokio::time::interval(manager.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                let woke = match changes.as_mut() {
                    Some(rx) => tokio::select! {
                        _ = ticker.tick() => Ok(()),
                        change = rx.recv() => {
                            // One refresh covers a burst
                            while rx.try_recv().is_ok() {}
                            change
                        }
                    },
                    None => {
                        ticker.tick().await;
                        Ok(())
                    }
                };
                if let Err(broadcast::error::RecvError::Closed) = woke {
                    log_warn!(MODULE, "Drive change notifications ended, polling only");
                    changes = None;
                }
                manager.refresh().await;
            }
        });
        DriveWatcher { task }
    }

    /// Reserve `drive` for a job. Only one job may hold a drive at a time.
    pub fn reserve(&self, drive: &Drive) -> Result<DriveLease, DriveError> {
        let mut registry = self.registry();
        if !registry.reserved.insert(drive.id.clone()) {
            return Err(DriveError::CouldNotLock {
                drive: drive.id.clone(),
                reason: "drive is in use by another job".to_string(),
            });
        }
        set_locked(&mut registry, &drive.id, true);
        Ok(DriveLease {
            drive: drive.clone(),
            registry: self.registry.clone(),
        })
    }

    /// Eject `drive` so it can be unplugged. Drives held by a job stay put.
    pub async fn eject(&self, drive: &Drive) -> Result<(), DriveError> {
        if self.is_reserved(&drive.id) {
            return Err(DriveError::Eject {
                drive: drive.id.clone(),
                reason: "drive is in use by another job".to_string(),
            });
        }
        self.backend.eject(drive).await?;
        log_info!(MODULE, "Ejected {}", drive.display_name());
        self.refresh().await;
        Ok(())
    }

    /// Whether a job holds `drive`
    pub fn is_reserved(&self, id: &str) -> bool {
        self.registry().reserved.contains(id)
    }

    /// Record a restore state for `drive`; kept until it is detached
    pub fn set_restore_status(&self, id: &str, status: RestoreStatus) {
        let mut registry = self.registry();
        registry.restore_marks.insert(id.to_string(), status);
        if let Some(drive) = registry.drives.iter_mut().find(|d| d.id == id) {
            drive.restore_status = status;
        }
        if status == RestoreStatus::ContainsLive {
            registry.last_restorable = Some(id.to_string());
        } else if registry.last_restorable.as_deref() == Some(id) {
            registry.last_restorable = None;
        }
    }
}

fn set_locked(registry: &mut Registry, id: &str, locked: bool) {
    if let Some(drive) = registry.drives.iter_mut().find(|d| d.id == id) {
        drive.locked = locked;
    }
}

/// Background enumeration; stops when dropped
pub struct DriveWatcher {
    task: JoinHandle<()>,
}

impl Drop for DriveWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Exclusive reservation of a drive, released on drop
pub struct DriveLease {
    drive: Drive,
    registry: Arc<Mutex<Registry>>,
}

impl Drop for DriveLease {
    fn drop(&mut self) {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        registry.reserved.remove(&self.drive.id);
        set_locked(&mut registry, &self.drive.id, false);
        log_debug!(MODULE, "Released {}", self.drive.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(backend: &Arc<FileBackend>) -> DriveManager {
        DriveManager::new(backend.clone(), Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_refresh_sorts_and_reports_attach_detach() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FileBackend::new());
        backend.add_drive("big", "Big", dir.path().join("big.img"), 8 << 20, false).unwrap();
        backend.add_drive("small", "Small", dir.path().join("small.img"), 1 << 20, false).unwrap();

        let manager = manager(&backend);
        let mut events = manager.subscribe();
        let drives = manager.refresh().await;
        assert_eq!(drives.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(), ["small", "big"]);
        assert!(matches!(events.recv().await.unwrap(), DriveEvent::Attached(_)));
        assert!(matches!(events.recv().await.unwrap(), DriveEvent::Attached(_)));

        backend.remove_drive("big");
        manager.refresh().await;
        match events.recv().await.unwrap() {
            DriveEvent::Detached(drive) => assert_eq!(drive.id, "big"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unavailable_service_degrades_to_no_drives() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FileBackend::new());
        backend.add_drive("a", "A", dir.path().join("a.img"), 1 << 20, false).unwrap();
        let manager = manager(&backend);
        manager.refresh().await;

        backend.set_unavailable(Some("udisks2 is not running"));
        assert!(manager.refresh().await.is_empty());
        assert!(matches!(manager.availability(), Availability::Broken(_)));

        backend.set_unavailable(None);
        assert_eq!(manager.refresh().await.len(), 1);
        assert_eq!(manager.availability(), Availability::Available);
    }

    #[tokio::test]
    async fn test_reservation_is_exclusive_and_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FileBackend::new());
        backend.add_drive("a", "A", dir.path().join("a.img"), 1 << 20, false).unwrap();
        backend.add_drive("b", "B", dir.path().join("b.img"), 1 << 20, false).unwrap();
        let manager = manager(&backend);
        let drives = manager.refresh().await;

        let lease = manager.reserve(&drives[0]).unwrap();
        assert!(manager.reserve(&drives[0]).is_err());
        let other = manager.reserve(&drives[1]).unwrap();
        assert!(manager.drive(&drives[0].id).unwrap().locked);

        drop(lease);
        drop(other);
        assert!(!manager.is_reserved(&drives[0].id));
        assert!(manager.reserve(&drives[0]).is_ok());
    }

    #[tokio::test]
    async fn test_watch_reacts_to_changes_before_next_poll() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FileBackend::new());
        let manager = DriveManager::new(backend.clone(), Duration::from_secs(3600));
        let mut events = manager.subscribe();
        let _watcher = manager.watch();
        // The first tick fires immediately; let it pass
        tokio::time::sleep(Duration::from_millis(50)).await;

        backend.add_drive("a", "A", dir.path().join("a.img"), 1 << 20, false).unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv()).await.unwrap();
        assert!(matches!(event.unwrap(), DriveEvent::Attached(d) if d.id == "a"));

        backend.remove_drive("a");
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv()).await.unwrap();
        assert!(matches!(event.unwrap(), DriveEvent::Detached(d) if d.id == "a"));
    }

    #[tokio::test]
    async fn test_eject_detaches_unless_reserved() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FileBackend::new());
        backend.add_drive("a", "A", dir.path().join("a.img"), 1 << 20, false).unwrap();
        let manager = manager(&backend);
        let drive = manager.refresh().await.remove(0);

        let lease = manager.reserve(&drive).unwrap();
        assert!(matches!(manager.eject(&drive).await, Err(DriveError::Eject { .. })));
        assert!(backend.is_present(&drive));
        drop(lease);

        let mut events = manager.subscribe();
        manager.eject(&drive).await.unwrap();
        assert!(manager.drive("a").is_none());
        match events.recv().await.unwrap() {
            DriveEvent::Detached(d) => assert_eq!(d.id, "a"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_restore_marks_survive_refresh_until_detach() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FileBackend::new());
        backend.add_drive("live", "Live", dir.path().join("live.img"), 4 << 20, true).unwrap();
        let manager = manager(&backend);
        manager.refresh().await;
        assert_eq!(manager.last_restorable().unwrap().id, "live");

        manager.set_restore_status("live", RestoreStatus::Restored);
        manager.refresh().await;
        assert_eq!(manager.drive("live").unwrap().restore_status, RestoreStatus::Restored);
        assert!(manager.last_restorable().is_none());

        backend.remove_drive("live");
        manager.refresh().await;
        assert!(manager.drive("live").is_none());
    }
}
