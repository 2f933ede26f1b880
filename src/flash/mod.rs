//! Flash module
//!
//! Streams a decoded image onto a raw device, flushes it and optionally
//! reads it back. Everything here is blocking and runs on a worker thread;
//! the caller observes progress through a callback and stops the job through
//! [`FlashState`].

mod verify;

pub use verify::verify_device;

use std::io::{self, SeekFrom};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config;
use crate::decompress::ImageStream;
use crate::devices::{Drive, RawDevice};
use crate::error::{DecompressError, DriveError, WriteError};
use crate::utils::{ProgressThrottle, ProgressTracker};
use crate::{log_debug, log_error, log_info, log_warn};

const MODULE: &str = "flash";

/// EROFS
const READ_ONLY_FS: i32 = 30;
/// ENOSPC
const NO_SPACE: i32 = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WritePhase {
    Writing,
    Flushing,
    Verifying,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteProgress {
    pub phase: WritePhase,
    pub bytes_written: u64,
    /// 0 when the decoded size is unknown
    pub total_bytes: u64,
}

/// Shared state of a running write, readable from any thread
#[derive(Debug, Default)]
pub struct FlashState {
    pub total_bytes: AtomicU64,
    pub written_bytes: AtomicU64,
    pub is_cancelled: AtomicBool,
}

impl FlashState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.is_cancelled.store(true, Ordering::SeqCst);
    }

    pub fn cancelled(&self) -> bool {
        self.is_cancelled.load(Ordering::SeqCst)
    }

    pub fn written(&self) -> u64 {
        self.written_bytes.load(Ordering::SeqCst)
    }
}

/// Result of a completed write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub bytes_written: u64,
    /// SHA-256 of everything written, hex encoded
    pub digest: String,
}

/// Refuse drives that cannot hold the image, before anything is locked
pub fn preflight(drive: &Drive, image_size: Option<u64>) -> Result<(), DriveError> {
    match image_size {
        Some(required) if required > drive.capacity => {
            log_error!(
                MODULE,
                "Image needs {} bytes, {} holds {}",
                required,
                drive.id,
                drive.capacity
            );
            Err(DriveError::TooSmall {
                drive: drive.id.clone(),
                capacity: drive.capacity,
                required,
            })
        }
        _ => Ok(()),
    }
}

/// Everything a write needs besides the data and the device
pub struct WriteJob<'a> {
    pub drive: &'a Drive,
    /// Decoded size if known up front
    pub total_bytes: Option<u64>,
    pub state: &'a FlashState,
    /// Presence probe, polled between chunks
    pub is_present: &'a (dyn Fn() -> bool + Sync),
    pub progress_interval: Duration,
}

impl WriteJob<'_> {
    fn too_small(&self, required: u64) -> WriteError {
        WriteError::Drive(DriveError::TooSmall {
            drive: self.drive.id.clone(),
            capacity: self.drive.capacity,
            required,
        })
    }

    fn stopped(&self, stream: &ImageStream, bytes_written: u64) -> WriteError {
        stream.cancel();
        log_info!(MODULE, "Write stopped after {} bytes", bytes_written);
        WriteError::Cancelled { bytes_written }
    }

    /// Write the whole stream to `device` and flush it.
    ///
    /// A write fault is retried from the start of the failed chunk; after
    /// [`config::flash::MAX_CONSECUTIVE_WRITE_FAULTS`] faults in a row the
    /// drive is considered damaged.
    pub fn run(
        &self,
        stream: &mut ImageStream,
        device: &mut dyn RawDevice,
        on_progress: &mut dyn FnMut(WriteProgress),
    ) -> Result<WriteOutcome, WriteError> {
        let total = self.total_bytes.unwrap_or(0);
        self.state.total_bytes.store(total, Ordering::SeqCst);
        self.state.written_bytes.store(0, Ordering::SeqCst);

        log_info!(
            MODULE,
            "Writing {} image to {} ({} bytes)",
            stream.container(),
            self.drive.device,
            total
        );

        let mut hasher = Sha256::new();
        let mut written = 0u64;
        let mut tracker =
            ProgressTracker::new("Write", MODULE, total, config::logging::FLASH_LOG_INTERVAL_MB);
        let mut throttle = ProgressThrottle::new(self.progress_interval);

        on_progress(WriteProgress {
            phase: WritePhase::Writing,
            bytes_written: 0,
            total_bytes: total,
        });

        device
            .seek(SeekFrom::Start(0))
            .map_err(|e| self.seek_failed(e, 0))?;

        loop {
            if self.state.cancelled() {
                return Err(self.stopped(stream, written));
            }

            let chunk = match stream.next_chunk() {
                None => break,
                Some(Ok(chunk)) => chunk,
                Some(Err(DecompressError::Cancelled)) => return Err(self.stopped(stream, written)),
                Some(Err(e)) => {
                    log_error!(MODULE, "Decoding failed after {} bytes: {}", written, e);
                    return Err(e.into());
                }
            };

            if !(self.is_present)() {
                log_error!(MODULE, "{} disappeared after {} bytes", self.drive.id, written);
                return Err(WriteError::DriveRemoved {
                    bytes_written: written,
                });
            }
            let end = written + chunk.len() as u64;
            if end > self.drive.capacity {
                return Err(self.too_small(self.total_bytes.unwrap_or(end).max(end)));
            }

            let mut faults = 0u32;
            while let Err(e) = device.write_all(&chunk) {
                faults = self.classify(e, written, faults)?;
                if self.state.cancelled() {
                    return Err(self.stopped(stream, written));
                }
                device
                    .seek(SeekFrom::Start(written))
                    .map_err(|e| self.seek_failed(e, written))?;
            }

            hasher.update(&chunk);
            written = end;
            self.state.written_bytes.store(written, Ordering::SeqCst);
            tracker.update(chunk.len() as u64);

            if throttle.should_emit() {
                on_progress(WriteProgress {
                    phase: WritePhase::Writing,
                    bytes_written: written,
                    total_bytes: total,
                });
            }
        }

        on_progress(WriteProgress {
            phase: WritePhase::Writing,
            bytes_written: written,
            total_bytes: total,
        });
        tracker.finish();

        on_progress(WriteProgress {
            phase: WritePhase::Flushing,
            bytes_written: written,
            total_bytes: total,
        });
        log_info!(MODULE, "Flushing {}", self.drive.device);
        if let Err(e) = device.sync() {
            log_error!(MODULE, "Flush of {} failed: {}", self.drive.device, e);
            if !(self.is_present)() {
                return Err(WriteError::DriveRemoved {
                    bytes_written: written,
                });
            }
            return Err(WriteError::ProbablyDamaged {
                faults: 1,
                last_error: e.to_string(),
            });
        }

        Ok(WriteOutcome {
            bytes_written: written,
            digest: hex::encode(hasher.finalize()),
        })
    }

    fn seek_failed(&self, e: io::Error, offset: u64) -> WriteError {
        if !(self.is_present)() {
            return WriteError::DriveRemoved {
                bytes_written: offset,
            };
        }
        WriteError::ProbablyDamaged {
            faults: 1,
            last_error: format!("seek to {} failed: {}", offset, e),
        }
    }

    /// Turn a device error into a terminal failure, or the new fault count
    /// if the chunk may be retried
    fn classify(&self, e: io::Error, offset: u64, faults: u32) -> Result<u32, WriteError> {
        if !(self.is_present)() {
            log_error!(MODULE, "{} removed at offset {}: {}", self.drive.id, offset, e);
            return Err(WriteError::DriveRemoved {
                bytes_written: offset,
            });
        }

        match (e.kind(), e.raw_os_error()) {
            (io::ErrorKind::PermissionDenied, _) | (_, Some(READ_ONLY_FS)) => {
                return Err(WriteError::Drive(DriveError::NotWritable {
                    drive: self.drive.id.clone(),
                    reason: e.to_string(),
                }));
            }
            (io::ErrorKind::WriteZero, _) | (_, Some(NO_SPACE)) => {
                return Err(self.too_small(self.total_bytes.unwrap_or(offset).max(offset)));
            }
            _ => {}
        }

        let faults = faults + 1;
        if faults >= config::flash::MAX_CONSECUTIVE_WRITE_FAULTS {
            log_error!(MODULE, "Giving up on {} after {} faults: {}", self.drive.id, faults, e);
            return Err(WriteError::ProbablyDamaged {
                faults,
                last_error: e.to_string(),
            });
        }
        log_warn!(
            MODULE,
            "Write fault {} at offset {}: {}, retrying",
            faults,
            offset,
            e
        );
        Ok(faults)
    }
}

/// Read the drive back and compare it against the digest of what was written.
///
/// A write that produced a different number of bytes than the image declared
/// fails before anything is read back.
pub fn verify_written(
    job: &WriteJob<'_>,
    device: Box<dyn RawDevice>,
    outcome: &WriteOutcome,
    io_timeout: Duration,
    on_progress: &mut dyn FnMut(WriteProgress),
) -> Result<(), WriteError> {
    if let Some(expected) = job.total_bytes {
        if expected != outcome.bytes_written {
            log_error!(
                MODULE,
                "Image declared {} bytes but {} were written to {}",
                expected,
                outcome.bytes_written,
                job.drive.id
            );
            return Err(WriteError::SizeMismatch {
                expected,
                written: outcome.bytes_written,
            });
        }
    }

    log_debug!(MODULE, "Verifying {} bytes on {}", outcome.bytes_written, job.drive.device);
    verify_device(
        device,
        outcome,
        job.state,
        io_timeout,
        job.progress_interval,
        on_progress,
    )
}
