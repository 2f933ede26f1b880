//! Shared fixtures: an in-memory byte source, image builders and a harness
//! wiring file-backed drives to an orchestrator.

#![allow(dead_code)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use media_writer::catalog::{
    Architecture, Channel, Checksum, ChecksumAlgorithm, ContainerType, Variant, VariantSource,
};
use media_writer::config::Settings;
use media_writer::devices::{Drive, DriveManager, FileBackend};
use media_writer::download::{
    ByteSource, DownloadEngine, DownloadSettings, SourceError, SourceResponse,
};
use media_writer::helper::{HelperLauncher, WorkerSettings};
use media_writer::orchestrator::Orchestrator;

pub const URL: &str = "https://images.example.org/dl/board/image.img.xz";

const BODY_CHUNK: usize = 64 * 1024;

#[derive(Default)]
struct SourceState {
    /// Each offset drops the connection once
    drops: Vec<u64>,
    /// Every response stops here until cleared
    always_drop_at: Option<u64>,
    ignore_range: bool,
    refuse: Option<SourceError>,
    status: Option<u16>,
    fetches: Vec<u64>,
}

/// Serves one blob over the [`ByteSource`] contract
pub struct MemorySource {
    data: Bytes,
    state: Mutex<SourceState>,
}

impl MemorySource {
    pub fn new(data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            data: Bytes::from(data),
            state: Mutex::new(SourceState::default()),
        })
    }

    pub fn drop_at(&self, offset: u64) {
        self.state.lock().unwrap().drops.push(offset);
    }

    pub fn always_drop_at(&self, offset: Option<u64>) {
        self.state.lock().unwrap().always_drop_at = offset;
    }

    /// Answer ranged requests with the full body and a 200
    pub fn ignore_range(&self) {
        self.state.lock().unwrap().ignore_range = true;
    }

    pub fn refuse(&self, error: SourceError) {
        self.state.lock().unwrap().refuse = Some(error);
    }

    pub fn respond_with(&self, status: u16) {
        self.state.lock().unwrap().status = Some(status);
    }

    /// Offsets requested so far
    pub fn fetches(&self) -> Vec<u64> {
        self.state.lock().unwrap().fetches.clone()
    }
}

#[async_trait]
impl ByteSource for MemorySource {
    async fn fetch(&self, _url: &str, offset: u64) -> Result<SourceResponse, SourceError> {
        let len = self.data.len() as u64;
        let mut state = self.state.lock().unwrap();
        state.fetches.push(offset);

        if let Some(error) = state.refuse.clone() {
            return Err(error);
        }
        if let Some(status) = state.status {
            return Ok(SourceResponse {
                status,
                content_length: None,
                body: futures_util::stream::empty().boxed(),
            });
        }
        if offset >= len && offset > 0 && !state.ignore_range {
            return Ok(SourceResponse {
                status: 416,
                content_length: None,
                body: futures_util::stream::empty().boxed(),
            });
        }

        let (status, start) = if offset == 0 || state.ignore_range {
            (200, 0)
        } else {
            (206, offset)
        };

        let mut end = len;
        let mut dropped = false;
        if let Some(i) = state
            .drops
            .iter()
            .enumerate()
            .filter(|(_, d)| **d > start && **d < len)
            .min_by_key(|(_, d)| **d)
            .map(|(i, _)| i)
        {
            end = state.drops.remove(i);
            dropped = true;
        }
        if let Some(at) = state.always_drop_at {
            if at >= start && at < end {
                end = at;
                dropped = true;
            }
        }

        let mut items: Vec<Result<Bytes, SourceError>> = Vec::new();
        let mut pos = start as usize;
        while pos < end as usize {
            let next = (pos + BODY_CHUNK).min(end as usize);
            items.push(Ok(self.data.slice(pos..next)));
            pos = next;
        }
        if dropped {
            items.push(Err(SourceError::Connection("connection reset by peer".to_string())));
        }

        Ok(SourceResponse {
            status,
            content_length: Some(len - start),
            body: futures_util::stream::iter(items).boxed(),
        })
    }
}

/// Deterministic, non-repeating-ish test payload
pub fn pattern(len: usize) -> Vec<u8> {
    let mut state = 0x2545_f491u32;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 24) as u8
        })
        .collect()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn checksum_of(data: &[u8]) -> Checksum {
    Checksum::new(ChecksumAlgorithm::Sha256, &sha256_hex(data)).unwrap()
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

pub fn xz(data: &[u8]) -> Vec<u8> {
    let mut encoder = xz2::write::XzEncoder::new(Vec::new(), 1);
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Tar archive holding `data` as `name`
pub fn tar(name: &str, data: &[u8]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, data).unwrap();
    builder.into_inner().unwrap()
}

pub fn test_settings(dir: &Path) -> Settings {
    Settings {
        downloads_dir: Some(dir.join("downloads")),
        max_resume_attempts: 3,
        resume_delay_ms: 10,
        stall_timeout_secs: 2,
        verify_io_timeout_secs: 5,
        progress_interval_ms: 0,
        drive_poll_interval_ms: 20,
        ..Settings::default()
    }
}

pub fn remote_variant(url: &str, payload: &[u8], container: ContainerType, image_size: Option<u64>) -> Variant {
    Variant {
        id: "board-stable".to_string(),
        name: "Test OS".to_string(),
        version: "1.0".to_string(),
        channel: Channel::Stable,
        arch: Architecture::Aarch64,
        board: "board".to_string(),
        source: VariantSource::Remote { url: url.to_string() },
        size: payload.len() as u64,
        image_size,
        checksum: Some(checksum_of(payload)),
        container,
        live: true,
    }
}

/// File-backed drives, in-process helper and an in-memory server
pub struct Harness {
    pub dir: TempDir,
    pub backend: Arc<FileBackend>,
    pub drives: DriveManager,
    pub source: Arc<MemorySource>,
    pub settings: Settings,
}

impl Harness {
    pub fn new(payload: Vec<u8>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        let backend = Arc::new(FileBackend::new());
        let drives = DriveManager::new(backend.clone(), settings.drive_poll_interval());
        Self {
            dir,
            backend,
            drives,
            source: MemorySource::new(payload),
            settings,
        }
    }

    pub fn downloads(&self) -> PathBuf {
        self.settings.downloads_dir()
    }

    pub fn engine(&self) -> DownloadEngine {
        DownloadEngine::new(self.source.clone(), DownloadSettings::from(&self.settings))
    }

    pub fn launcher(&self) -> HelperLauncher {
        HelperLauncher::InProcess {
            backend: self.backend.clone(),
            settings: WorkerSettings::from(&self.settings),
        }
    }

    pub fn orchestrator(&self, variant: Variant) -> Orchestrator {
        Orchestrator::new(
            variant,
            self.engine(),
            self.drives.clone(),
            self.launcher(),
            &self.settings,
        )
    }

    /// Attach a drive and let the manager see it
    pub async fn add_drive(&self, id: &str, capacity: u64) -> Drive {
        let path = self.dir.path().join(format!("{}.img", id));
        self.backend.add_drive(id, id, path, capacity, false).unwrap();
        self.drives.refresh().await;
        self.drives.drive(id).unwrap()
    }
}

/// Wait until `check` holds, polling briefly
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
