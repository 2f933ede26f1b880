//! Linux drive backend
//!
//! Talks to UDisks2 over D-Bus. Access to the raw device is granted by
//! polkit through `OpenDevice`, so the process itself needs no privileges.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::{broadcast, OnceCell};
use zbus::fdo::{InterfacesAddedStream, InterfacesRemovedStream};
use zbus::zvariant::OwnedObjectPath;

use super::{Drive, DriveBackend, RawDevice, RestoreStatus};
use crate::config;
use crate::error::DriveError;
use crate::{log_debug, log_info, log_warn};

const MODULE: &str = "devices::linux";

const BLOCK_DEVICES_PREFIX: &str = "/org/freedesktop/UDisks2/block_devices/";
const DRIVES_PREFIX: &str = "/org/freedesktop/UDisks2/drives/";
const PARTITION_INTERFACE: &str = "org.freedesktop.UDisks2.Partition";
const FILESYSTEM_INTERFACE: &str = "org.freedesktop.UDisks2.Filesystem";
/// FAT32 (LBA) MBR partition type
const FAT32_LBA_PARTITION_TYPE: &str = "0x0c";

type ManagedObjects = HashMap<
    OwnedObjectPath,
    HashMap<zbus::names::OwnedInterfaceName, HashMap<String, zbus::zvariant::OwnedValue>>,
>;

/// Backend using the UDisks2 daemon
pub struct UDisksBackend {
    client: OnceCell<udisks2::Client>,
    changes: broadcast::Sender<()>,
    /// Set once the signal listener runs
    listening: OnceCell<()>,
}

impl UDisksBackend {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(config::devices::EVENT_CAPACITY);
        Self {
            client: OnceCell::new(),
            changes,
            listening: OnceCell::new(),
        }
    }

    /// Subscribe to InterfacesAdded/InterfacesRemoved on the UDisks2 object
    /// manager and forward the ones about disks
    async fn listen(&self) -> Result<(), DriveError> {
        let client = self.client().await?;
        let manager = client.object_manager();
        let signal_failed = |e: zbus::Error| DriveError::ServiceUnavailable(format!("UDisks2 signals: {}", e));
        let added = manager.receive_interfaces_added().await.map_err(signal_failed)?;
        let removed = manager.receive_interfaces_removed().await.map_err(signal_failed)?;
        tokio::spawn(forward_changes(added, removed, self.changes.clone()));
        log_debug!(MODULE, "Listening for UDisks2 object changes");
        Ok(())
    }

    async fn client(&self) -> Result<&udisks2::Client, DriveError> {
        self.client
            .get_or_try_init(|| async {
                udisks2::Client::new()
                    .await
                    .map_err(|e| DriveError::ServiceUnavailable(format!("UDisks2: {}", e)))
            })
            .await
    }

    async fn managed_objects(&self) -> Result<ManagedObjects, DriveError> {
        let client = self.client().await?;
        client
            .object_manager()
            .get_managed_objects()
            .await
            .map_err(|e| DriveError::ServiceUnavailable(format!("UDisks2: {}", e)))
    }

    /// Build a Drive from a whole-disk block object, if it qualifies
    async fn probe(&self, path: &OwnedObjectPath) -> Result<Option<Drive>, String> {
        let client = self.client().await.map_err(|e| e.to_string())?;
        let object = client.object(path.clone()).map_err(|e| e.to_string())?;
        let block = object.block().await.map_err(|e| e.to_string())?;

        let drive_path = block.drive().await.map_err(|e| e.to_string())?;
        if drive_path.as_str() == "/" {
            return Ok(None);
        }
        let drive = client
            .object(drive_path)
            .map_err(|e| e.to_string())?
            .drive()
            .await
            .map_err(|e| e.to_string())?;

        let removable = drive.removable().await.unwrap_or(false);
        let usb = drive.connection_bus().await.unwrap_or_default() == "usb";
        let media = drive.media_available().await.unwrap_or(false);
        let optical = drive.optical().await.unwrap_or(false);
        if !(removable || usb) || !media || optical {
            return Ok(None);
        }

        let capacity = block.size().await.map_err(|e| e.to_string())?;
        if capacity == 0 {
            return Ok(None);
        }

        let device = block
            .preferred_device()
            .await
            .map(|bytes| {
                String::from_utf8_lossy(&bytes)
                    .trim_end_matches('\0')
                    .to_string()
            })
            .map_err(|e| e.to_string())?;

        let vendor = drive.vendor().await.unwrap_or_default();
        let model = drive.model().await.unwrap_or_default();
        let label = format!("{} {}", vendor.trim(), model.trim()).trim().to_string();
        let label = if label.is_empty() { device.clone() } else { label };

        // A hybrid ISO written to the whole disk shows up as iso9660
        let live = block.id_type().await.unwrap_or_default() == "iso9660";

        Ok(Some(Drive {
            id: path.to_string(),
            device,
            label,
            capacity,
            removable: true,
            restore_status: if live {
                RestoreStatus::ContainsLive
            } else {
                RestoreStatus::Clean
            },
            locked: false,
        }))
    }

    /// Object paths of `drive` and all partitions on it that carry a filesystem
    async fn filesystems_on(&self, drive: &Drive) -> Result<Vec<OwnedObjectPath>, DriveError> {
        let objects = self.managed_objects().await?;
        let client = self.client().await?;
        let mut paths = Vec::new();

        for (path, interfaces) in objects {
            let has = |name: &str| interfaces.keys().any(|k| k.as_str() == name);
            if !has(FILESYSTEM_INTERFACE) {
                continue;
            }

            let belongs = if path.as_str() == drive.id {
                true
            } else if has(PARTITION_INTERFACE) {
                match client.object(path.clone()) {
                    Ok(object) => match object.partition().await {
                        Ok(partition) => partition
                            .table()
                            .await
                            .map(|table| table.as_str() == drive.id)
                            .unwrap_or(false),
                        Err(_) => false,
                    },
                    Err(_) => false,
                }
            } else {
                false
            };

            if belongs {
                paths.push(path);
            }
        }
        Ok(paths)
    }

    async fn open_device(&self, drive: &Drive, mode: &str) -> Result<Box<dyn RawDevice>, DriveError> {
        let could_not_open = |reason: String| DriveError::CouldNotOpen {
            drive: drive.id.clone(),
            reason,
        };

        let client = self.client().await?;
        let block = client
            .object(drive.id.as_str())
            .map_err(|e| could_not_open(e.to_string()))?
            .block()
            .await
            .map_err(|e| could_not_open(e.to_string()))?;

        if mode == "rw" && block.read_only().await.unwrap_or(false) {
            return Err(DriveError::NotWritable {
                drive: drive.id.clone(),
                reason: "device is read-only".to_string(),
            });
        }

        let fd = block
            .open_device(mode, HashMap::new())
            .await
            .map_err(|e| could_not_open(e.to_string()))?;
        let fd: std::os::fd::OwnedFd = fd.into();
        log_debug!(MODULE, "Opened {} ({})", drive.device, mode);
        Ok(Box::new(File::from(fd)))
    }
}

/// Objects whose arrival or removal can change the drive list
fn is_disk_object(path: &str) -> bool {
    path.starts_with(BLOCK_DEVICES_PREFIX) || path.starts_with(DRIVES_PREFIX)
}

async fn forward_changes(
    added: InterfacesAddedStream,
    removed: InterfacesRemovedStream,
    changes: broadcast::Sender<()>,
) {
    let added = added.map(|signal| signal.args().map(|args| args.object_path().to_string()));
    let removed = removed.map(|signal| signal.args().map(|args| args.object_path().to_string()));
    let mut signals = std::pin::pin!(futures_util::stream::select(added, removed));

    while let Some(path) = signals.next().await {
        match path {
            Ok(path) if is_disk_object(&path) => {
                log_debug!(MODULE, "UDisks2 object changed: {}", path);
                let _ = changes.send(());
            }
            Ok(_) => {}
            Err(e) => log_debug!(MODULE, "Unreadable UDisks2 signal: {}", e),
        }
    }
    log_warn!(MODULE, "UDisks2 signal stream ended");
}

#[async_trait]
impl DriveBackend for UDisksBackend {
    fn name(&self) -> &'static str {
        "udisks2"
    }

    async fn subscribe_changes(&self) -> Option<broadcast::Receiver<()>> {
        let receiver = self.changes.subscribe();
        match self.listening.get_or_try_init(|| self.listen()).await {
            Ok(_) => Some(receiver),
            Err(e) => {
                log_warn!(MODULE, "No change notifications: {}", e);
                None
            }
        }
    }

    async fn enumerate(&self) -> Result<Vec<Drive>, DriveError> {
        let objects = self.managed_objects().await?;
        let mut drives = Vec::new();

        for (path, interfaces) in &objects {
            if !path.as_str().starts_with(BLOCK_DEVICES_PREFIX) {
                continue;
            }
            if interfaces.keys().any(|k| k.as_str() == PARTITION_INTERFACE) {
                continue;
            }

            match self.probe(path).await {
                Ok(Some(drive)) => drives.push(drive),
                Ok(None) => {}
                Err(e) => log_debug!(MODULE, "Skipping {}: {}", path.as_str(), e),
            }
        }

        Ok(drives)
    }

    async fn lock(&self, drive: &Drive) -> Result<(), DriveError> {
        let could_not_lock = |reason: String| DriveError::CouldNotLock {
            drive: drive.id.clone(),
            reason,
        };
        let client = self.client().await?;

        for path in self.filesystems_on(drive).await? {
            let filesystem = client
                .object(path.clone())
                .map_err(|e| could_not_lock(e.to_string()))?
                .filesystem()
                .await
                .map_err(|e| could_not_lock(e.to_string()))?;

            let mounted = filesystem
                .mount_points()
                .await
                .map(|points| !points.is_empty())
                .unwrap_or(false);
            if mounted {
                log_info!(MODULE, "Unmounting {}", path.as_str());
                filesystem
                    .unmount(HashMap::new())
                    .await
                    .map_err(|e| could_not_lock(e.to_string()))?;
            }
        }
        Ok(())
    }

    async fn unlock(&self, drive: &Drive) -> Result<(), DriveError> {
        // Let the kernel and UDisks pick up the new partition table
        let client = self.client().await?;
        let block = client
            .object(drive.id.as_str())
            .map_err(|e| DriveError::CouldNotUnlock {
                drive: drive.id.clone(),
                reason: e.to_string(),
            })?
            .block()
            .await
            .map_err(|e| DriveError::CouldNotUnlock {
                drive: drive.id.clone(),
                reason: e.to_string(),
            })?;

        if let Err(e) = block.rescan(HashMap::new()).await {
            if self.is_present(drive) {
                return Err(DriveError::CouldNotUnlock {
                    drive: drive.id.clone(),
                    reason: e.to_string(),
                });
            }
            log_warn!(MODULE, "Rescan of removed drive {} failed: {}", drive.device, e);
        }
        Ok(())
    }

    async fn open_for_raw_write(&self, drive: &Drive) -> Result<Box<dyn RawDevice>, DriveError> {
        self.open_device(drive, "rw").await
    }

    async fn open_for_read(&self, drive: &Drive) -> Result<Box<dyn RawDevice>, DriveError> {
        self.open_device(drive, "r").await
    }

    async fn eject(&self, drive: &Drive) -> Result<(), DriveError> {
        let eject_failed = |reason: String| DriveError::Eject {
            drive: drive.id.clone(),
            reason,
        };
        let client = self.client().await?;
        let block = client
            .object(drive.id.as_str())
            .map_err(|e| eject_failed(e.to_string()))?
            .block()
            .await
            .map_err(|e| eject_failed(e.to_string()))?;
        let drive_path = block.drive().await.map_err(|e| eject_failed(e.to_string()))?;

        client
            .object(drive_path)
            .map_err(|e| eject_failed(e.to_string()))?
            .drive()
            .await
            .map_err(|e| eject_failed(e.to_string()))?
            .eject(HashMap::new())
            .await
            .map_err(|e| eject_failed(e.to_string()))
    }

    async fn restore(&self, drive: &Drive) -> Result<(), DriveError> {
        let restore_failed = |reason: String| DriveError::RestoreFailed {
            drive: drive.id.clone(),
            reason,
        };
        let client = self.client().await?;
        let object = client
            .object(drive.id.as_str())
            .map_err(|e| restore_failed(e.to_string()))?;

        log_info!(MODULE, "Creating a new partition table on {}", drive.device);
        object
            .block()
            .await
            .map_err(|e| restore_failed(e.to_string()))?
            .format("dos", HashMap::new())
            .await
            .map_err(|e| restore_failed(e.to_string()))?;

        log_info!(MODULE, "Creating a FAT partition on {}", drive.device);
        object
            .partition_table()
            .await
            .map_err(|e| restore_failed(e.to_string()))?
            .create_partition_and_format(
                0,
                0,
                FAT32_LBA_PARTITION_TYPE,
                "",
                HashMap::new(),
                "vfat",
                HashMap::new(),
            )
            .await
            .map_err(|e| restore_failed(e.to_string()))?;

        Ok(())
    }

    fn is_present(&self, drive: &Drive) -> bool {
        Path::new(&drive.device).exists()
    }
}
