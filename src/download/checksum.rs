//! Checksum computation
//!
//! Hashes downloaded files against the digest declared in the catalog.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use sha2::{Digest, Sha256, Sha512};

use crate::catalog::{Checksum, ChecksumAlgorithm};
use crate::config;
use crate::error::DownloadError;
use crate::utils::ProgressTracker;
use crate::{log_debug, log_error, log_info};

const MODULE: &str = "checksum";

fn hash_file<D: Digest>(path: &Path, cancelled: &AtomicBool) -> Result<String, DownloadError> {
    let unreadable = |source| DownloadError::UnreadableFile {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::open(path).map_err(unreadable)?;
    let total = file.metadata().map(|m| m.len()).unwrap_or(0);
    let mut tracker = ProgressTracker::new("Checksum", MODULE, total, config::logging::VERIFY_LOG_INTERVAL_MB);
    let mut hasher = D::new();
    let mut buffer = vec![0u8; config::download::HASH_BUFFER_SIZE];

    loop {
        if cancelled.load(Ordering::SeqCst) {
            log_info!(MODULE, "Checksum calculation cancelled");
            return Err(DownloadError::Cancelled);
        }

        let bytes_read = file.read(&mut buffer).map_err(unreadable)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
        tracker.update(bytes_read as u64);
    }

    tracker.finish();
    Ok(hex::encode(hasher.finalize()))
}

/// Hex digest of the file at `path`
pub fn compute_digest(
    path: &Path,
    algorithm: ChecksumAlgorithm,
    cancelled: &AtomicBool,
) -> Result<String, DownloadError> {
    log_debug!(MODULE, "Calculating {:?} of {}", algorithm, path.display());
    match algorithm {
        ChecksumAlgorithm::Sha256 => hash_file::<Sha256>(path, cancelled),
        ChecksumAlgorithm::Sha512 => hash_file::<Sha512>(path, cancelled),
    }
}

/// Compare the file against `expected`
pub fn verify_file(
    path: &Path,
    expected: &Checksum,
    cancelled: &AtomicBool,
) -> Result<(), DownloadError> {
    let actual = compute_digest(path, expected.algorithm, cancelled)?;

    if actual == expected.digest {
        log_info!(MODULE, "Checksum verification PASSED");
        Ok(())
    } else {
        log_error!(
            MODULE,
            "Checksum verification FAILED! Expected: {}, Got: {}",
            expected.digest,
            actual
        );
        Err(DownloadError::Corrupted {
            expected: expected.digest.clone(),
            actual,
        })
    }
}
