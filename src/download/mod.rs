//! Download module
//!
//! Resumable, integrity-checked transfer of images into the downloads
//! directory. Bytes go to `<name>.part`; an interrupted transfer is picked
//! up again with a ranged request from the size of that file, and the file
//! is renamed into place only once it is complete.

mod checksum;
mod source;

pub use checksum::{compute_digest, verify_file};
pub use source::{ByteSource, HttpSource, SourceError, SourceResponse};

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::catalog::Checksum;
use crate::config::{self, Settings};
use crate::error::DownloadError;
use crate::utils::{bytes_to_mb, part_path, ProgressThrottle, ProgressTracker};
use crate::{log_debug, log_error, log_info, log_warn};

const MODULE: &str = "download";

/// Free space probe, replaceable for tests
pub type SpaceProbe = Arc<dyn Fn(&Path) -> Option<u64> + Send + Sync>;

/// What to fetch and where to put it
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub destination: PathBuf,
    /// Declared size, 0 if unknown
    pub expected_size: u64,
    pub checksum: Option<Checksum>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadEvent {
    Started { offset: u64, total: u64 },
    Progress { received: u64, total: u64 },
    /// The connection dropped; the transfer continues from `offset`
    Resuming { offset: u64, attempt: u32 },
    Paused,
    Resumed,
    /// All bytes are in place, the checksum is being computed
    Checking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Paused,
    Checking,
    Completed,
    Failed,
    Cancelled,
}

/// Snapshot of one transfer
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub url: String,
    pub destination: PathBuf,
    pub bytes_received: u64,
    /// Offset the next request would resume from
    pub resume_offset: u64,
    pub total_bytes: u64,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Run,
    Pause,
    Cancel,
}

/// Shared counters of a running transfer
struct DownloadState {
    received: AtomicU64,
    resume_offset: AtomicU64,
    total: AtomicU64,
    checking: AtomicBool,
    finished: std::sync::Mutex<Option<TaskStatus>>,
    /// Mirrors `Control::Cancel` for blocking hash loops
    cancelled: AtomicBool,
}

impl DownloadState {
    fn new() -> Self {
        Self {
            received: AtomicU64::new(0),
            resume_offset: AtomicU64::new(0),
            total: AtomicU64::new(0),
            checking: AtomicBool::new(false),
            finished: std::sync::Mutex::new(None),
            cancelled: AtomicBool::new(false),
        }
    }

    fn set_finished(&self, status: TaskStatus) {
        if let Ok(mut finished) = self.finished.lock() {
            *finished = Some(status);
        }
    }
}

/// Tuning knobs taken from [`Settings`]
#[derive(Debug, Clone)]
pub struct DownloadSettings {
    pub max_resume_attempts: u32,
    pub resume_delay: Duration,
    pub stall_timeout: Duration,
    pub progress_interval: Duration,
}

impl From<&Settings> for DownloadSettings {
    fn from(settings: &Settings) -> Self {
        Self {
            max_resume_attempts: settings.max_resume_attempts,
            resume_delay: settings.resume_delay(),
            stall_timeout: settings.stall_timeout(),
            progress_interval: settings.progress_interval(),
        }
    }
}

/// Starts transfers from a [`ByteSource`]
#[derive(Clone)]
pub struct DownloadEngine {
    source: Arc<dyn ByteSource>,
    settings: DownloadSettings,
    space_probe: SpaceProbe,
}

impl DownloadEngine {
    pub fn new(source: Arc<dyn ByteSource>, settings: DownloadSettings) -> Self {
        Self {
            source,
            settings,
            space_probe: Arc::new(crate::utils::available_space),
        }
    }

    /// Engine using HTTP with the timeouts from `settings`
    pub fn http(settings: &Settings) -> Result<Self, reqwest::Error> {
        let source = HttpSource::new(settings.connect_timeout())?;
        Ok(Self::new(Arc::new(source), settings.into()))
    }

    pub fn with_space_probe(mut self, probe: SpaceProbe) -> Self {
        self.space_probe = probe;
        self
    }

    /// Begin a transfer. Events go to `events` until the task ends.
    pub fn start(
        &self,
        request: DownloadRequest,
        events: mpsc::UnboundedSender<DownloadEvent>,
    ) -> DownloadHandle {
        let (control_tx, control_rx) = watch::channel(Control::Run);
        let state = Arc::new(DownloadState::new());
        let transfer = Transfer {
            source: self.source.clone(),
            settings: self.settings.clone(),
            space_probe: self.space_probe.clone(),
            request: request.clone(),
            events,
            control: control_rx,
            state: state.clone(),
        };

        let task = tokio::spawn(async move {
            let result = transfer.run().await;
            let status = match &result {
                Ok(_) => TaskStatus::Completed,
                Err(DownloadError::Cancelled) => TaskStatus::Cancelled,
                Err(_) => TaskStatus::Failed,
            };
            transfer.state.set_finished(status);
            result
        });

        DownloadHandle {
            control: DownloadControl {
                url: request.url,
                destination: request.destination,
                sender: Arc::new(control_tx),
                state,
            },
            task,
        }
    }
}

/// Pause/resume/cancel side of a transfer, cheap to clone
#[derive(Clone)]
pub struct DownloadControl {
    url: String,
    destination: PathBuf,
    sender: Arc<watch::Sender<Control>>,
    state: Arc<DownloadState>,
}

impl DownloadControl {
    pub fn pause(&self) {
        self.sender.send_if_modified(|c| {
            let changed = *c == Control::Run;
            if changed {
                *c = Control::Pause;
            }
            changed
        });
    }

    pub fn resume(&self) {
        self.sender.send_if_modified(|c| {
            let changed = *c == Control::Pause;
            if changed {
                *c = Control::Run;
            }
            changed
        });
    }

    /// Stop the transfer and discard the partial file
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
        self.sender.send_replace(Control::Cancel);
    }

    pub fn is_paused(&self) -> bool {
        *self.sender.borrow() == Control::Pause
    }

    pub fn task(&self) -> DownloadTask {
        let status = self
            .state
            .finished
            .lock()
            .ok()
            .and_then(|f| *f)
            .unwrap_or_else(|| {
                if self.state.checking.load(Ordering::SeqCst) {
                    TaskStatus::Checking
                } else if self.is_paused() {
                    TaskStatus::Paused
                } else {
                    TaskStatus::Running
                }
            });

        DownloadTask {
            url: self.url.clone(),
            destination: self.destination.clone(),
            bytes_received: self.state.received.load(Ordering::SeqCst),
            resume_offset: self.state.resume_offset.load(Ordering::SeqCst),
            total_bytes: self.state.total.load(Ordering::SeqCst),
            status,
        }
    }
}

/// A running transfer
pub struct DownloadHandle {
    control: DownloadControl,
    task: JoinHandle<Result<PathBuf, DownloadError>>,
}

impl DownloadHandle {
    pub fn control(&self) -> DownloadControl {
        self.control.clone()
    }

    pub fn pause(&self) {
        self.control.pause();
    }

    pub fn resume(&self) {
        self.control.resume();
    }

    pub fn cancel(&self) {
        self.control.cancel();
    }

    pub fn task(&self) -> DownloadTask {
        self.control.task()
    }

    /// Wait for the transfer to end
    pub async fn join(self) -> Result<PathBuf, DownloadError> {
        let _control = self.control;
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                log_error!(MODULE, "Download task failed: {}", e);
                Err(DownloadError::ConnectionFailed {
                    attempts: 0,
                    last_error: e.to_string(),
                })
            }
        }
    }
}

/// How a streaming attempt ended
enum Attempt {
    Complete,
    Interrupted(String),
    Paused,
}

struct Transfer {
    source: Arc<dyn ByteSource>,
    settings: DownloadSettings,
    space_probe: SpaceProbe,
    request: DownloadRequest,
    events: mpsc::UnboundedSender<DownloadEvent>,
    control: watch::Receiver<Control>,
    state: Arc<DownloadState>,
}

impl Transfer {
    fn emit(&self, event: DownloadEvent) {
        let _ = self.events.send(event);
    }

    fn current(&self) -> Control {
        *self.control.borrow()
    }

    async fn run(&self) -> Result<PathBuf, DownloadError> {
        let destination = &self.request.destination;
        let part = part_path(destination);
        log_info!(MODULE, "Download requested: {}", self.request.url);
        log_debug!(MODULE, "Output path: {}", destination.display());

        let result = self.transfer(&part).await;
        match result {
            Ok(()) => {}
            Err(DownloadError::Cancelled) => {
                log_info!(MODULE, "Download cancelled by user");
                let _ = std::fs::remove_file(&part);
                return Err(DownloadError::Cancelled);
            }
            Err(e) => {
                log_error!(MODULE, "Download failed: {}", e);
                return Err(e);
            }
        }

        std::fs::rename(&part, destination).map_err(|source| {
            log_error!(MODULE, "Failed to rename {}: {}", part.display(), source);
            DownloadError::RenameFailed {
                from: part.clone(),
                source,
            }
        })?;

        self.state.checking.store(true, Ordering::SeqCst);
        self.emit(DownloadEvent::Checking);
        self.check(destination).await?;

        log_info!(MODULE, "Image ready: {}", destination.display());
        Ok(destination.clone())
    }

    async fn check(&self, path: &Path) -> Result<(), DownloadError> {
        let Some(expected) = self.request.checksum.clone() else {
            log_warn!(MODULE, "No checksum declared, skipping verification");
            return Ok(());
        };

        let path_buf = path.to_path_buf();
        let state = self.state.clone();
        let result = tokio::task::spawn_blocking(move || {
            verify_file(&path_buf, &expected, &state.cancelled)
        })
        .await
        .map_err(|e| DownloadError::UnreadableFile {
            path: path.to_path_buf(),
            source: std::io::Error::other(e.to_string()),
        })?;

        if let Err(ref e) = result {
            if !matches!(e, DownloadError::Cancelled) {
                // A corrupted or unreadable image has to be fetched again
                let _ = std::fs::remove_file(path);
            }
        }
        result
    }

    /// Open the part file, returning it with the offset to resume from
    fn open_part(&self, part: &Path) -> Result<(File, u64), DownloadError> {
        let not_writable = |source| DownloadError::NotWritable {
            path: part.to_path_buf(),
            source,
        };

        if let Some(dir) = part.parent() {
            std::fs::create_dir_all(dir).map_err(not_writable)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(part)
            .map_err(not_writable)?;

        let mut offset = file.metadata().map_err(not_writable)?.len();
        let expected = self.request.expected_size;
        if expected > 0 && offset > expected {
            log_warn!(MODULE, "Partial file is larger than the image, starting over");
            file.set_len(0).map_err(not_writable)?;
            offset = 0;
        }
        file.seek(SeekFrom::Start(offset)).map_err(not_writable)?;

        if expected > 0 {
            let required = expected - offset;
            if let Some(available) = (self.space_probe)(part) {
                if available < required {
                    return Err(DownloadError::OutOfSpace {
                        path: part.to_path_buf(),
                        required,
                        available,
                    });
                }
            }
        }

        Ok((file, offset))
    }

    fn write_error(&self, part: &Path, source: std::io::Error) -> DownloadError {
        let available = (self.space_probe)(part);
        if available.is_some_and(|a| a < config::download::MIN_FREE_SPACE) {
            DownloadError::OutOfSpace {
                path: part.to_path_buf(),
                required: config::download::MIN_FREE_SPACE,
                available: available.unwrap_or(0),
            }
        } else {
            DownloadError::NotWritable {
                path: part.to_path_buf(),
                source,
            }
        }
    }

    async fn transfer(&self, part: &Path) -> Result<(), DownloadError> {
        let (mut file, mut offset) = self.open_part(part)?;
        let expected = self.request.expected_size;
        if offset > 0 {
            log_info!(MODULE, "Resuming from {:.1} MB", bytes_to_mb(offset));
        }
        if expected > 0 && offset == expected {
            log_info!(MODULE, "Partial file already complete");
            return Ok(());
        }

        self.state.total.store(expected, Ordering::SeqCst);
        self.emit(DownloadEvent::Started {
            offset,
            total: expected,
        });

        let mut tracker = ProgressTracker::new(
            "Download",
            MODULE,
            expected,
            config::logging::DOWNLOAD_LOG_INTERVAL_MB,
        )
        .with_offset(offset);
        let mut throttle = ProgressThrottle::new(self.settings.progress_interval);
        let mut control = self.control.clone();
        let mut failures = 0u32;

        loop {
            if self.current() == Control::Pause {
                self.wait_while_paused(&mut control).await?;
            }
            if self.current() == Control::Cancel {
                return Err(DownloadError::Cancelled);
            }

            self.state.resume_offset.store(offset, Ordering::SeqCst);
            let attempt = match self.source.fetch(&self.request.url, offset).await {
                Ok(response) => {
                    self.stream_response(
                        response,
                        part,
                        &mut file,
                        &mut offset,
                        &mut tracker,
                        &mut throttle,
                        &mut control,
                        &mut failures,
                    )
                    .await?
                }
                Err(SourceError::Timeout(e)) => {
                    return Err(DownloadError::ConnectionTimedOut(e));
                }
                Err(SourceError::Connection(e)) => Attempt::Interrupted(e),
            };

            match attempt {
                Attempt::Complete => break,
                Attempt::Paused => continue,
                Attempt::Interrupted(reason) => {
                    failures += 1;
                    if failures > self.settings.max_resume_attempts {
                        return Err(DownloadError::ConnectionFailed {
                            attempts: failures - 1,
                            last_error: reason,
                        });
                    }
                    log_warn!(
                        MODULE,
                        "Connection interrupted at {} bytes ({}), resuming (attempt {})",
                        offset,
                        reason,
                        failures
                    );
                    self.emit(DownloadEvent::Resuming {
                        offset,
                        attempt: failures,
                    });
                    self.sleep_or_cancel(&mut control).await?;
                }
            }
        }

        file.flush().map_err(|e| self.write_error(part, e))?;
        file.sync_all().map_err(|e| self.write_error(part, e))?;
        tracker.finish();

        let total = self.state.total.load(Ordering::SeqCst);
        self.emit(DownloadEvent::Progress {
            received: offset,
            total,
        });
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn stream_response(
        &self,
        response: SourceResponse,
        part: &Path,
        file: &mut File,
        offset: &mut u64,
        tracker: &mut ProgressTracker,
        throttle: &mut ProgressThrottle,
        control: &mut watch::Receiver<Control>,
        failures: &mut u32,
    ) -> Result<Attempt, DownloadError> {
        let expected = self.request.expected_size;

        match response.status {
            206 => {}
            200 => {
                if *offset > 0 {
                    log_warn!(MODULE, "Server ignored the range request, starting over");
                    file.set_len(0).map_err(|e| self.write_error(part, e))?;
                    file.seek(SeekFrom::Start(0))
                        .map_err(|e| self.write_error(part, e))?;
                    *offset = 0;
                    *tracker = ProgressTracker::new(
                        "Download",
                        MODULE,
                        expected,
                        config::logging::DOWNLOAD_LOG_INTERVAL_MB,
                    );
                }
            }
            416 if *offset > 0 && (expected == 0 || *offset == expected) => {
                log_debug!(MODULE, "Range not satisfiable at {}, file is complete", offset);
                return Ok(Attempt::Complete);
            }
            status => {
                log_error!(MODULE, "Download failed with status: {}", status);
                return Err(DownloadError::ServerRejected(status));
            }
        }

        let total = if expected > 0 {
            expected
        } else {
            response.content_length.map(|len| len + *offset).unwrap_or(0)
        };
        self.state.total.store(total, Ordering::SeqCst);

        let mut body = response.body;
        loop {
            let next = tokio::select! {
                changed = control.changed() => {
                    if changed.is_err() {
                        return Err(DownloadError::Cancelled);
                    }
                    match *control.borrow_and_update() {
                        Control::Cancel => return Err(DownloadError::Cancelled),
                        Control::Pause => return Ok(Attempt::Paused),
                        Control::Run => continue,
                    }
                }
                next = tokio::time::timeout(self.settings.stall_timeout, body.next()) => next,
            };

            let chunk = match next {
                Err(_) => return Ok(Attempt::Interrupted("transfer stalled".to_string())),
                Ok(None) => {
                    if total > 0 && *offset < total {
                        return Ok(Attempt::Interrupted(format!(
                            "connection closed at {} of {} bytes",
                            offset, total
                        )));
                    }
                    return Ok(Attempt::Complete);
                }
                Ok(Some(Err(e))) => return Ok(Attempt::Interrupted(e.to_string())),
                Ok(Some(Ok(chunk))) => chunk,
            };

            file.write_all(&chunk)
                .map_err(|e| self.write_error(part, e))?;
            *offset += chunk.len() as u64;
            *failures = 0;
            self.state.received.store(*offset, Ordering::SeqCst);
            tracker.update(chunk.len() as u64);

            if throttle.should_emit() {
                self.emit(DownloadEvent::Progress {
                    received: *offset,
                    total,
                });
            }
        }
    }

    async fn wait_while_paused(
        &self,
        control: &mut watch::Receiver<Control>,
    ) -> Result<(), DownloadError> {
        log_info!(MODULE, "Download paused");
        self.emit(DownloadEvent::Paused);
        loop {
            match *control.borrow_and_update() {
                Control::Pause => {}
                Control::Cancel => return Err(DownloadError::Cancelled),
                Control::Run => break,
            }
            if control.changed().await.is_err() {
                return Err(DownloadError::Cancelled);
            }
        }
        log_info!(MODULE, "Download resumed");
        self.emit(DownloadEvent::Resumed);
        Ok(())
    }

    async fn sleep_or_cancel(
        &self,
        control: &mut watch::Receiver<Control>,
    ) -> Result<(), DownloadError> {
        let sleep = tokio::time::sleep(self.settings.resume_delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return Ok(()),
                changed = control.changed() => {
                    if changed.is_err() || *control.borrow_and_update() == Control::Cancel {
                        return Err(DownloadError::Cancelled);
                    }
                }
            }
        }
    }
}
