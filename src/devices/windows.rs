//! Windows drive backend using native Win32 APIs

use std::collections::HashMap;
use std::ffi::c_void;
use std::fs::File;
use std::mem;
use std::os::windows::io::FromRawHandle;
use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use windows_sys::Win32::{
    Foundation::{CloseHandle, GetLastError, GENERIC_READ, GENERIC_WRITE, HANDLE, INVALID_HANDLE_VALUE},
    Storage::FileSystem::{
        CreateFileW, GetLogicalDrives, FILE_FLAG_WRITE_THROUGH, FILE_SHARE_READ, FILE_SHARE_WRITE,
        OPEN_EXISTING,
    },
    System::Ioctl::{
        FSCTL_DISMOUNT_VOLUME, FSCTL_LOCK_VOLUME, FSCTL_UNLOCK_VOLUME,
        IOCTL_DISK_GET_DRIVE_GEOMETRY_EX, IOCTL_STORAGE_EJECT_MEDIA,
    },
    System::IO::DeviceIoControl,
};

use super::{Drive, DriveBackend, RawDevice, RestoreStatus};
use crate::error::DriveError;
use crate::{log_debug, log_error, log_info, log_warn};

const MODULE: &str = "devices::windows";

const IOCTL_VOLUME_GET_VOLUME_DISK_EXTENTS: u32 = 0x00560000;
const IOCTL_STORAGE_QUERY_PROPERTY: u32 = 0x002D1400;
const STORAGE_DEVICE_PROPERTY: u32 = 0;
const PROPERTY_STANDARD_QUERY: u32 = 0;

const PHYSICAL_DRIVE_PREFIX: &str = r"\\.\PhysicalDrive";
const MAX_DISKS: u32 = 32;
/// Stop probing after this many missing disk numbers in a row
const MAX_CONSECUTIVE_MISSING: usize = 4;

#[repr(C)]
struct StoragePropertyQuery {
    property_id: u32,
    query_type: u32,
    additional_parameters: [u8; 1],
}

#[repr(C)]
struct DiskGeometry {
    cylinders: i64,
    media_type: u32,
    tracks_per_cylinder: u32,
    sectors_per_track: u32,
    bytes_per_sector: u32,
}

#[repr(C)]
struct DiskGeometryEx {
    geometry: DiskGeometry,
    disk_size: u64,
    data: [u8; 1],
}

#[repr(C)]
struct VolumeDiskExtent {
    disk_number: u32,
    starting_offset: u64,
    extent_length: u64,
}

#[repr(C)]
struct VolumeDiskExtents {
    number_of_extents: u32,
    extents: [VolumeDiskExtent; 1],
}

/// Converts a path to a UTF-16 null-terminated vector for Win32 APIs
fn to_utf16(path: &str) -> Vec<u16> {
    path.encode_utf16().chain(std::iter::once(0)).collect()
}

fn open_handle(path: &str, access: u32, flags: u32) -> Result<HANDLE, u32> {
    let path = to_utf16(path);
    let handle = unsafe {
        CreateFileW(
            path.as_ptr(),
            access,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            std::ptr::null(),
            OPEN_EXISTING,
            flags,
            std::ptr::null_mut(),
        )
    };

    if handle == INVALID_HANDLE_VALUE {
        Err(unsafe { GetLastError() })
    } else {
        Ok(handle)
    }
}

/// IOCTL without input, returning the Win32 error code on failure
fn ioctl(handle: HANDLE, code: u32, output: &mut [u8]) -> Result<u32, u32> {
    let mut bytes_returned = 0u32;
    let (ptr, len) = if output.is_empty() {
        (std::ptr::null_mut(), 0)
    } else {
        (output.as_mut_ptr() as *mut c_void, output.len() as u32)
    };
    let ok = unsafe {
        DeviceIoControl(
            handle,
            code,
            std::ptr::null(),
            0,
            ptr,
            len,
            &mut bytes_returned,
            std::ptr::null_mut(),
        )
    };
    if ok == 0 {
        Err(unsafe { GetLastError() })
    } else {
        Ok(bytes_returned)
    }
}

fn disk_number(drive: &Drive) -> Option<u32> {
    drive.device.strip_prefix(PHYSICAL_DRIVE_PREFIX)?.parse().ok()
}

/// Model name and whether the bus is USB or SD
fn query_device_properties(device: &str) -> (String, bool) {
    const MIN_DESCRIPTOR_SIZE: u32 = 33;
    const PRODUCT_ID_OFFSET: usize = 16;
    const BUS_TYPE_OFFSET: usize = 28;
    const BUS_USB: u8 = 0x07;
    const BUS_SD: u8 = 0x0C;

    let fallback = || ("Physical Drive".to_string(), false);
    let Ok(handle) = open_handle(device, GENERIC_READ, 0) else {
        return fallback();
    };

    let query = StoragePropertyQuery {
        property_id: STORAGE_DEVICE_PROPERTY,
        query_type: PROPERTY_STANDARD_QUERY,
        additional_parameters: [0],
    };
    let mut buffer = [0u8; 2048];
    let mut bytes_returned = 0u32;
    let ok = unsafe {
        DeviceIoControl(
            handle,
            IOCTL_STORAGE_QUERY_PROPERTY,
            &query as *const _ as *const c_void,
            mem::size_of::<StoragePropertyQuery>() as u32,
            buffer.as_mut_ptr() as *mut c_void,
            buffer.len() as u32,
            &mut bytes_returned,
            std::ptr::null_mut(),
        )
    };
    unsafe { CloseHandle(handle) };

    if ok == 0 || bytes_returned < MIN_DESCRIPTOR_SIZE {
        return fallback();
    }

    let bus = buffer[BUS_TYPE_OFFSET];
    let mut offset_bytes = [0u8; 4];
    offset_bytes.copy_from_slice(&buffer[PRODUCT_ID_OFFSET..PRODUCT_ID_OFFSET + 4]);
    let offset = u32::from_le_bytes(offset_bytes) as usize;

    let model = if offset == 0 || offset >= buffer.len() {
        String::new()
    } else {
        let end = buffer[offset..]
            .iter()
            .position(|&b| b == 0)
            .map_or(buffer.len(), |pos| offset + pos);
        String::from_utf8_lossy(&buffer[offset..end]).trim().to_string()
    };
    let model = if model.is_empty() {
        "Physical Drive".to_string()
    } else {
        model
    };

    (model, bus == BUS_USB || bus == BUS_SD)
}

/// Drive letters with a volume on `disk_number`
fn drive_letters_for_disk(disk_number: u32) -> Vec<char> {
    let mask = unsafe { GetLogicalDrives() };
    if mask == 0 {
        log_error!(MODULE, "GetLogicalDrives failed: {}", unsafe { GetLastError() });
        return Vec::new();
    }

    let mut letters = Vec::new();
    for i in 0..26u8 {
        if mask & (1 << i) == 0 {
            continue;
        }
        let letter = (b'A' + i) as char;
        let Ok(handle) = open_handle(&format!(r"\\.\{}:", letter), GENERIC_READ, 0) else {
            continue;
        };

        let mut extents = [0u8; 1024];
        let result = ioctl(handle, IOCTL_VOLUME_GET_VOLUME_DISK_EXTENTS, &mut extents);
        unsafe { CloseHandle(handle) };

        if result.is_ok() {
            let extents = unsafe { &*(extents.as_ptr() as *const VolumeDiskExtents) };
            let list = unsafe {
                std::slice::from_raw_parts(
                    extents.extents.as_ptr(),
                    extents.number_of_extents as usize,
                )
            };
            if list.iter().any(|e| e.disk_number == disk_number) {
                letters.push(letter);
            }
        }
    }
    letters
}

fn disk_size(device: &str) -> Result<u64, u32> {
    let handle = open_handle(device, GENERIC_READ, 0)?;
    let mut geometry = [0u8; 256];
    let result = ioctl(handle, IOCTL_DISK_GET_DRIVE_GEOMETRY_EX, &mut geometry);
    unsafe { CloseHandle(handle) };
    result?;
    let geometry = unsafe { &*(geometry.as_ptr() as *const DiskGeometryEx) };
    Ok(geometry.disk_size)
}

/// Backend using physical drive handles and volume IOCTLs
pub struct WindowsBackend {
    /// Locked volume handles per drive id, stored as integers so the map is Send
    locked: Mutex<HashMap<String, Vec<isize>>>,
}

impl WindowsBackend {
    pub fn new() -> Self {
        Self {
            locked: Mutex::new(HashMap::new()),
        }
    }

    fn enumerate_blocking() -> Vec<Drive> {
        let mut drives = Vec::new();
        let mut missing = 0;

        for number in 0..MAX_DISKS {
            let device = format!("{}{}", PHYSICAL_DRIVE_PREFIX, number);
            let capacity = match disk_size(&device) {
                Ok(size) => {
                    missing = 0;
                    size
                }
                Err(1 | 2 | 5 | 21) => {
                    missing += 1;
                    if missing >= MAX_CONSECUTIVE_MISSING {
                        break;
                    }
                    continue;
                }
                Err(err) => {
                    log_debug!(MODULE, "Skipping {}: error {}", device, err);
                    continue;
                }
            };
            if capacity == 0 {
                continue;
            }

            let (model, removable) = query_device_properties(&device);
            let letters = drive_letters_for_disk(number);
            // Never offer the system disk
            if !removable || letters.contains(&'C') {
                continue;
            }

            drives.push(Drive {
                id: device.clone(),
                device,
                label: model,
                capacity,
                removable,
                restore_status: RestoreStatus::Clean,
                locked: false,
            });
        }
        drives
    }
}

#[async_trait]
impl DriveBackend for WindowsBackend {
    fn name(&self) -> &'static str {
        "win32"
    }

    async fn enumerate(&self) -> Result<Vec<Drive>, DriveError> {
        tokio::task::spawn_blocking(Self::enumerate_blocking)
            .await
            .map_err(|e| DriveError::ServiceUnavailable(e.to_string()))
    }

    async fn lock(&self, drive: &Drive) -> Result<(), DriveError> {
        let number = disk_number(drive).ok_or_else(|| DriveError::NotFound(drive.id.clone()))?;
        let mut handles = Vec::new();

        for letter in drive_letters_for_disk(number) {
            let volume = format!(r"\\.\{}:", letter);
            let handle = match open_handle(&volume, GENERIC_READ | GENERIC_WRITE, 0) {
                Ok(handle) => handle,
                Err(err) => {
                    release(&handles);
                    return Err(DriveError::CouldNotLock {
                        drive: drive.id.clone(),
                        reason: format!("cannot open {}: error {}", volume, err),
                    });
                }
            };
            handles.push(handle as isize);

            if let Err(err) = ioctl(handle, FSCTL_LOCK_VOLUME, &mut []) {
                release(&handles);
                return Err(DriveError::CouldNotLock {
                    drive: drive.id.clone(),
                    reason: format!("{} is in use: error {}", volume, err),
                });
            }
            if let Err(err) = ioctl(handle, FSCTL_DISMOUNT_VOLUME, &mut []) {
                log_warn!(MODULE, "Dismount of {} failed: error {}", volume, err);
            } else {
                log_info!(MODULE, "Dismounted {}", volume);
            }
        }

        self.locked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(drive.id.clone(), handles);
        Ok(())
    }

    async fn unlock(&self, drive: &Drive) -> Result<(), DriveError> {
        let handles = self
            .locked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&drive.id)
            .unwrap_or_default();
        release(&handles);
        Ok(())
    }

    async fn open_for_raw_write(&self, drive: &Drive) -> Result<Box<dyn RawDevice>, DriveError> {
        match open_handle(
            &drive.device,
            GENERIC_READ | GENERIC_WRITE,
            FILE_FLAG_WRITE_THROUGH,
        ) {
            Ok(handle) => Ok(Box::new(unsafe { File::from_raw_handle(handle) })),
            // ERROR_WRITE_PROTECT
            Err(19) => Err(DriveError::NotWritable {
                drive: drive.id.clone(),
                reason: "media is write protected".to_string(),
            }),
            Err(err) => Err(DriveError::CouldNotOpen {
                drive: drive.id.clone(),
                reason: format!("error {}", err),
            }),
        }
    }

    async fn open_for_read(&self, drive: &Drive) -> Result<Box<dyn RawDevice>, DriveError> {
        open_handle(&drive.device, GENERIC_READ, 0)
            .map(|handle| Box::new(unsafe { File::from_raw_handle(handle) }) as Box<dyn RawDevice>)
            .map_err(|err| DriveError::CouldNotOpen {
                drive: drive.id.clone(),
                reason: format!("error {}", err),
            })
    }

    async fn eject(&self, drive: &Drive) -> Result<(), DriveError> {
        let eject_failed = |err: u32| DriveError::Eject {
            drive: drive.id.clone(),
            reason: format!("error {}", err),
        };
        let handle = open_handle(&drive.device, GENERIC_READ, 0).map_err(eject_failed)?;
        let result = ioctl(handle, IOCTL_STORAGE_EJECT_MEDIA, &mut []);
        unsafe { CloseHandle(handle) };
        result.map(|_| ()).map_err(eject_failed)
    }

    async fn restore(&self, drive: &Drive) -> Result<(), DriveError> {
        let restore_failed = |reason: String| DriveError::RestoreFailed {
            drive: drive.id.clone(),
            reason,
        };
        let number = disk_number(drive)
            .ok_or_else(|| restore_failed(format!("unexpected device {}", drive.device)))?;

        let script = format!(
            "select disk {}\nclean\ncreate partition primary\nformat fs=fat32 quick\nassign\nexit\n",
            number
        );

        log_info!(MODULE, "Running diskpart on disk {}", number);
        let mut child = tokio::process::Command::new("diskpart")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| restore_failed(format!("cannot start diskpart: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(script.as_bytes())
                .await
                .map_err(|e| restore_failed(e.to_string()))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| restore_failed(e.to_string()))?;
        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            return Err(restore_failed(format!(
                "diskpart exited with {}: {}",
                output.status,
                stdout.trim()
            )));
        }
        Ok(())
    }

    fn is_present(&self, drive: &Drive) -> bool {
        match open_handle(&drive.device, GENERIC_READ, 0) {
            Ok(handle) => {
                unsafe { CloseHandle(handle) };
                true
            }
            Err(_) => false,
        }
    }
}

/// Unlock and close volume handles taken by `lock`
fn release(handles: &[isize]) {
    for &handle in handles {
        let handle = handle as HANDLE;
        if let Err(err) = ioctl(handle, FSCTL_UNLOCK_VOLUME, &mut []) {
            log_debug!(MODULE, "Volume unlock failed: error {}", err);
        }
        unsafe { CloseHandle(handle) };
    }
}
