//! Read-back verification
//!
//! Reads are done on a separate thread so that a drive which stops answering
//! turns into an error after a timeout instead of hanging the job.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use super::{FlashState, WriteOutcome, WritePhase, WriteProgress};
use crate::config;
use crate::devices::RawDevice;
use crate::error::WriteError;
use crate::utils::{ProgressThrottle, ProgressTracker};
use crate::{log_error, log_info};

const MODULE: &str = "flash::verify";

/// How often a blocked wait checks for cancellation
const CANCEL_POLL: Duration = Duration::from_millis(100);

/// Read `outcome.bytes_written` bytes from the start of `device` and compare
/// their SHA-256 with `outcome.digest`
pub fn verify_device(
    mut device: Box<dyn RawDevice>,
    outcome: &WriteOutcome,
    state: &FlashState,
    io_timeout: Duration,
    progress_interval: Duration,
    on_progress: &mut dyn FnMut(WriteProgress),
) -> Result<(), WriteError> {
    let total = outcome.bytes_written;
    log_info!(MODULE, "Verifying {} bytes", total);

    let (tx, rx) = sync_channel::<io::Result<Vec<u8>>>(config::decompress::QUEUE_DEPTH);
    let stop = Arc::new(AtomicBool::new(false));
    let reader_stop = stop.clone();

    std::thread::Builder::new()
        .name("verify-reader".into())
        .spawn(move || {
            if let Err(e) = device.seek(SeekFrom::Start(0)) {
                let _ = tx.send(Err(e));
                return;
            }
            let mut remaining = total;
            while remaining > 0 && !reader_stop.load(Ordering::SeqCst) {
                let len = remaining.min(config::flash::VERIFY_CHUNK_SIZE as u64) as usize;
                let mut buf = vec![0u8; len];
                let result = device.read_exact(&mut buf).map(|_| buf);
                let failed = result.is_err();
                if tx.send(result).is_err() || failed {
                    return;
                }
                remaining -= len as u64;
            }
        })
        .map_err(|e| WriteError::MediaCheck(format!("cannot start reader: {}", e)))?;

    let mut hasher = Sha256::new();
    let mut verified = 0u64;
    let mut tracker =
        ProgressTracker::new("Verify", MODULE, total, config::logging::VERIFY_LOG_INTERVAL_MB);
    let mut throttle = ProgressThrottle::new(progress_interval);

    on_progress(WriteProgress {
        phase: WritePhase::Verifying,
        bytes_written: 0,
        total_bytes: total,
    });

    let result = loop {
        if verified >= total {
            break Ok(());
        }

        let deadline = Instant::now() + io_timeout;
        let received = loop {
            if state.cancelled() {
                break Err(WriteError::Cancelled {
                    bytes_written: total,
                });
            }
            let wait = deadline.saturating_duration_since(Instant::now());
            if wait.is_zero() {
                break Err(WriteError::MediaCheck(format!(
                    "drive stopped responding after {} bytes",
                    verified
                )));
            }
            match rx.recv_timeout(wait.min(CANCEL_POLL)) {
                Ok(received) => break Ok(received),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    break Err(WriteError::MediaCheck("reader stopped unexpectedly".into()))
                }
            }
        };

        let chunk = match received {
            Ok(Ok(chunk)) => chunk,
            Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                break Err(WriteError::MediaCheck(format!(
                    "drive ended after {} of {} bytes",
                    verified, total
                )))
            }
            Ok(Err(e)) => {
                break Err(WriteError::MediaCheck(format!(
                    "read failed at offset {}: {}",
                    verified, e
                )))
            }
            Err(e) => break Err(e),
        };

        hasher.update(&chunk);
        verified += chunk.len() as u64;
        tracker.update(chunk.len() as u64);
        if throttle.should_emit() {
            on_progress(WriteProgress {
                phase: WritePhase::Verifying,
                bytes_written: verified,
                total_bytes: total,
            });
        }
    };

    // Lets the reader exit at its next chunk
    stop.store(true, Ordering::SeqCst);
    drop(rx);

    if let Err(e) = result {
        if !e.is_cancelled() {
            log_error!(MODULE, "Verification failed: {}", e);
        }
        return Err(e);
    }

    on_progress(WriteProgress {
        phase: WritePhase::Verifying,
        bytes_written: verified,
        total_bytes: total,
    });
    tracker.finish();

    let actual = hex::encode(hasher.finalize());
    if actual != outcome.digest {
        log_error!(
            MODULE,
            "Read back digest {} does not match written {}",
            actual,
            outcome.digest
        );
        return Err(WriteError::Corrupted {
            expected: outcome.digest.clone(),
            actual,
        });
    }

    log_info!(MODULE, "Verification passed");
    Ok(())
}
