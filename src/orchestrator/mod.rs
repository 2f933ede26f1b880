//! Orchestrator
//!
//! One [`Orchestrator`] per variant drives it from download to a verified
//! drive. It owns the variant's status, hands the download to the
//! [`DownloadEngine`] and the write to a helper, and is the only place that
//! changes the status. Observers subscribe to [`OrchestratorEvent`]s or poll
//! [`Orchestrator::snapshot`].

mod state;

pub use state::{StatusSnapshot, VariantStatus};

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{broadcast, mpsc};

use crate::catalog::Variant;
use crate::config::Settings;
use crate::devices::{Availability, Drive, DriveEvent, DriveManager, RestoreStatus};
use crate::download::{self, DownloadControl, DownloadEngine, DownloadEvent, DownloadRequest};
use crate::error::{DownloadError, Failure, FailureKind, OrchestratorError, RetryScope};
use crate::flash::{self, WritePhase};
use crate::helper::{Event, HelperClient, HelperControl, HelperLauncher, Request, SourceDescriptor};
use crate::utils::{is_within, part_path};
use crate::{log_debug, log_error, log_info, log_warn};

const MODULE: &str = "orchestrator";

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorEvent {
    StatusChanged {
        from: VariantStatus,
        to: VariantStatus,
    },
    Progress {
        done: u64,
        total: u64,
    },
    Phase(WritePhase),
    /// The connection dropped and the download continues from `offset`
    Resuming {
        offset: u64,
        attempt: u32,
    },
    Paused,
    Resumed,
    /// Writing was stopped by the user before it finished; the drive holds a
    /// partial image
    WriteStopped {
        bytes_written: u64,
    },
}

/// The job currently attached to the variant
enum Job {
    Idle,
    Download(DownloadControl),
    Check(Arc<AtomicBool>),
    Write(HelperControl),
}

struct Shared {
    status: VariantStatus,
    progress: u64,
    total: u64,
    paused: bool,
    failure: Option<Failure>,
    delayed_write: Option<Drive>,
    last_drive: Option<Drive>,
    job: Job,
}

struct Inner {
    variant: Variant,
    downloads_dir: PathBuf,
    engine: DownloadEngine,
    drives: DriveManager,
    launcher: HelperLauncher,
    verify: bool,
    shared: Mutex<Shared>,
    events: broadcast::Sender<OrchestratorEvent>,
}

/// How a write job ended without failing
enum WriteEnd {
    Finished,
    Stopped(u64),
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        variant: Variant,
        engine: DownloadEngine,
        drives: DriveManager,
        launcher: HelperLauncher,
        settings: &Settings,
    ) -> Self {
        // A local image needs no download
        let status = if variant.is_local() {
            VariantStatus::ReadyToWrite
        } else {
            VariantStatus::Preparing
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                variant,
                downloads_dir: settings.downloads_dir(),
                engine,
                drives,
                launcher,
                verify: settings.verify_writes,
                shared: Mutex::new(Shared {
                    status,
                    progress: 0,
                    total: 0,
                    paused: false,
                    failure: None,
                    delayed_write: None,
                    last_drive: None,
                    job: Job::Idle,
                }),
                events,
            }),
        }
    }

    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.inner.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn variant(&self) -> &Variant {
        &self.inner.variant
    }

    pub fn status(&self) -> VariantStatus {
        self.shared().status
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let shared = self.shared();
        StatusSnapshot {
            status: shared.status,
            progress: shared.progress,
            total: shared.total,
            paused: shared.paused,
            failure: shared.failure.clone(),
            delayed_write: shared.delayed_write.as_ref().map(|d| d.id.clone()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.inner.events.subscribe()
    }

    /// Where the image lives, or will live once downloaded
    pub fn image_path(&self) -> PathBuf {
        self.inner.variant.file_path(&self.inner.downloads_dir)
    }

    /// Whether a write could start right now
    pub fn can_write_now(&self) -> bool {
        let writable = match self.status() {
            VariantStatus::ReadyToWrite | VariantStatus::Finished => true,
            VariantStatus::WriteFailed => self.image_reusable(),
            _ => false,
        };
        writable
            && self.inner.variant.container.can_write()
            && self.inner.drives.availability() == Availability::Available
    }

    /// After a failed write, the image on disk can go to another drive
    /// unless the failure blamed the image itself
    fn image_reusable(&self) -> bool {
        let scope = self.shared().failure.as_ref().map(|f| f.retry_scope());
        scope != Some(RetryScope::Download) && self.image_path().is_file()
    }

    fn emit(&self, event: OrchestratorEvent) {
        let _ = self.inner.events.send(event);
    }

    fn transition(&self, to: VariantStatus) -> Result<(), OrchestratorError> {
        let from = {
            let mut shared = self.shared();
            let from = shared.status;
            if !from.can_transition_to(to) {
                log_error!(MODULE, "Refusing transition {:?} -> {:?}", from, to);
                return Err(OrchestratorError::InvalidTransition { from, to });
            }
            shared.status = to;
            if !to.is_failed() {
                shared.failure = None;
            }
            shared.progress = 0;
            shared.total = 0;
            shared.paused = false;
            from
        };

        log_info!(MODULE, "{}: {:?} -> {:?}", self.inner.variant.id, from, to);
        self.emit(OrchestratorEvent::StatusChanged { from, to });
        Ok(())
    }

    /// Enter a failed status and hand back the error for the caller
    fn fail(&self, to: VariantStatus, failure: Failure) -> OrchestratorError {
        log_error!(MODULE, "{}: {}", self.inner.variant.id, failure);
        self.shared().failure = Some(failure.clone());
        if let Err(e) = self.transition(to) {
            return e;
        }
        OrchestratorError::Failed(failure)
    }

    fn set_progress(&self, done: u64, total: u64) {
        {
            let mut shared = self.shared();
            shared.progress = done;
            shared.total = total;
        }
        self.emit(OrchestratorEvent::Progress { done, total });
    }

    fn set_job(&self, job: Job) {
        self.shared().job = job;
    }

    fn enter_ready(&self) -> Result<(), OrchestratorError> {
        self.transition(VariantStatus::ReadyToWrite)?;
        self.start_delayed_write();
        Ok(())
    }

    /// Fetch the image, or check the one already on disk
    pub async fn download(&self) -> Result<(), OrchestratorError> {
        let status = self.status();
        if status != VariantStatus::Preparing {
            return Err(OrchestratorError::NotReady(status));
        }

        let path = self.image_path();
        if path.is_file() {
            log_info!(MODULE, "{} is already downloaded", path.display());
            self.transition(VariantStatus::CheckingDownload)?;
            return self.check_existing(path).await;
        }

        let Some(url) = self.inner.variant.url() else {
            self.transition(VariantStatus::CheckingDownload)?;
            return Err(self.fail(
                VariantStatus::DownloadFailed,
                Failure::new(
                    FailureKind::UnreadableFile,
                    format!("{} no longer exists", path.display()),
                ),
            ));
        };

        let request = DownloadRequest {
            url: url.to_string(),
            destination: path,
            expected_size: self.inner.variant.size,
            checksum: self.inner.variant.checksum.clone(),
        };

        self.transition(VariantStatus::Downloading)?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = self.inner.engine.start(request, tx);
        self.set_job(Job::Download(handle.control()));

        let forward = {
            let this = self.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    this.on_download_event(event);
                }
            })
        };
        let result = handle.join().await;
        let _ = forward.await;
        self.set_job(Job::Idle);

        match result {
            Ok(path) => {
                log_info!(MODULE, "Downloaded {}", path.display());
                self.enter_ready()
            }
            Err(DownloadError::Cancelled) => {
                self.transition(VariantStatus::Preparing)?;
                Err(OrchestratorError::Cancelled)
            }
            Err(e) => Err(self.fail(VariantStatus::DownloadFailed, download_failure(&e))),
        }
    }

    fn on_download_event(&self, event: DownloadEvent) {
        match event {
            DownloadEvent::Started { offset, total } | DownloadEvent::Progress { received: offset, total } => {
                self.set_progress(offset, total)
            }
            DownloadEvent::Resuming { offset, attempt } => {
                log_warn!(MODULE, "Connection lost, resuming at {} (attempt {})", offset, attempt);
                self.emit(OrchestratorEvent::Resuming { offset, attempt });
            }
            DownloadEvent::Paused => {
                self.shared().paused = true;
                self.emit(OrchestratorEvent::Paused);
            }
            DownloadEvent::Resumed => {
                self.shared().paused = false;
                self.emit(OrchestratorEvent::Resumed);
            }
            DownloadEvent::Checking => {
                if let Err(e) = self.transition(VariantStatus::CheckingDownload) {
                    log_debug!(MODULE, "{}", e);
                }
            }
        }
    }

    async fn check_existing(&self, path: PathBuf) -> Result<(), OrchestratorError> {
        let Some(checksum) = self.inner.variant.checksum.clone() else {
            return self.enter_ready();
        };

        let cancel = Arc::new(AtomicBool::new(false));
        self.set_job(Job::Check(cancel.clone()));
        let target = path.clone();
        let result =
            tokio::task::spawn_blocking(move || download::verify_file(&target, &checksum, &cancel)).await;
        self.set_job(Job::Idle);

        match result {
            Ok(Ok(())) => self.enter_ready(),
            Ok(Err(DownloadError::Cancelled)) => {
                self.transition(VariantStatus::Preparing)?;
                Err(OrchestratorError::Cancelled)
            }
            Ok(Err(e)) => {
                if matches!(e, DownloadError::Corrupted { .. }) && !self.inner.variant.is_local() {
                    if let Err(remove) = std::fs::remove_file(&path) {
                        log_warn!(MODULE, "Failed to remove {}: {}", path.display(), remove);
                    }
                }
                Err(self.fail(VariantStatus::DownloadFailed, download_failure(&e)))
            }
            Err(e) => Err(self.fail(
                VariantStatus::DownloadFailed,
                Failure::new(FailureKind::UnreadableFile, e.to_string()),
            )),
        }
    }

    /// Write the image to `drive`, verifying it unless disabled in settings
    pub async fn write(&self, drive: &Drive) -> Result<(), OrchestratorError> {
        match self.status() {
            VariantStatus::ReadyToWrite => {}
            VariantStatus::Finished => self.transition(VariantStatus::ReadyToWrite)?,
            VariantStatus::WriteFailed if self.image_reusable() => {
                self.transition(VariantStatus::ReadyToWrite)?
            }
            status => return Err(OrchestratorError::NotReady(status)),
        }

        let variant = &self.inner.variant;
        if !variant.container.can_write() {
            log_warn!(MODULE, "{} images cannot be written", variant.container);
            return Err(OrchestratorError::WritingNotPossible(variant.container));
        }
        self.shared().last_drive = Some(drive.clone());

        if let Err(e) = flash::preflight(drive, variant.image_size) {
            return Err(self.fail(VariantStatus::WriteFailed, Failure::new(e.kind(), e.to_string())));
        }
        let lease = match self.inner.drives.reserve(drive) {
            Ok(lease) => lease,
            Err(e) => {
                return Err(self.fail(VariantStatus::WriteFailed, Failure::new(e.kind(), e.to_string())))
            }
        };
        let mut client = match self.inner.launcher.launch().await {
            Ok(client) => client,
            Err(e) => {
                return Err(self.fail(VariantStatus::WriteFailed, Failure::new(e.kind(), e.to_string())))
            }
        };

        let mut drive_events = self.inner.drives.subscribe();
        self.transition(VariantStatus::Writing)?;
        self.set_job(Job::Write(client.control()));

        let request = Request::StartWrite {
            source: SourceDescriptor {
                path: self.image_path(),
                container: variant.container,
                expected_size: variant.image_size,
            },
            drive_id: drive.id.clone(),
            verify: self.inner.verify,
        };
        let result = match client.send(request) {
            Ok(()) => self.follow_write(&mut client, &mut drive_events, drive).await,
            Err(e) => Err(Failure::new(e.kind(), e.to_string())),
        };

        self.set_job(Job::Idle);
        client.shutdown().await;
        drop(lease);

        match result {
            Ok(WriteEnd::Finished) => {
                self.transition(VariantStatus::Finished)?;
                if variant.live {
                    self.inner
                        .drives
                        .set_restore_status(&drive.id, RestoreStatus::ContainsLive);
                }
                Ok(())
            }
            Ok(WriteEnd::Stopped(bytes_written)) => {
                log_info!(
                    MODULE,
                    "Writing to {} stopped before it finished ({} bytes written)",
                    drive.id,
                    bytes_written
                );
                self.emit(OrchestratorEvent::WriteStopped { bytes_written });
                self.transition(VariantStatus::Preparing)?;
                Err(OrchestratorError::Cancelled)
            }
            Err(failure) => Err(self.fail(VariantStatus::WriteFailed, failure)),
        }
    }

    /// Relay helper events until the job ends, watching for the drive to vanish
    async fn follow_write(
        &self,
        client: &mut HelperClient,
        drive_events: &mut broadcast::Receiver<DriveEvent>,
        drive: &Drive,
    ) -> Result<WriteEnd, Failure> {
        let control = client.control();
        let mut removed = false;
        let mut phase = None;

        loop {
            let event = tokio::select! {
                event = client.next_event() => event,
                drive_event = drive_events.recv() => {
                    if let Ok(DriveEvent::Detached(gone)) = drive_event {
                        if gone.id == drive.id && !removed {
                            log_error!(MODULE, "{} was removed during the write", drive.id);
                            removed = true;
                            control.cancel();
                        }
                    }
                    continue;
                }
            };

            let removed_failure =
                |detail: String| Failure::new(FailureKind::DriveRemovedDuringWrite, detail);

            match event {
                Ok(Event::Progress {
                    bytes_written,
                    total_bytes,
                    phase: current,
                }) => {
                    if phase != Some(current) {
                        phase = Some(current);
                        if current == WritePhase::Verifying && self.status() == VariantStatus::Writing {
                            self.transition(VariantStatus::CheckingWrittenData)
                                .map_err(|e| Failure::new(FailureKind::HelperCrashed, e.to_string()))?;
                        }
                        self.emit(OrchestratorEvent::Phase(current));
                    }
                    self.set_progress(bytes_written, total_bytes);
                }
                Ok(Event::Finished) => return Ok(WriteEnd::Finished),
                Ok(Event::Stopped { bytes_written }) if removed => {
                    return Err(removed_failure(format!(
                        "the drive was removed after {} bytes",
                        bytes_written
                    )))
                }
                Ok(Event::Stopped { bytes_written }) => return Ok(WriteEnd::Stopped(bytes_written)),
                Ok(Event::Error { detail, .. }) if removed => return Err(removed_failure(detail)),
                Ok(Event::Error { kind, detail }) => return Err(Failure::new(kind, detail)),
                Ok(other) => log_debug!(MODULE, "Ignoring helper event {:?}", other),
                Err(e) if removed => return Err(removed_failure(e.to_string())),
                Err(e) => return Err(Failure::new(e.kind(), e.to_string())),
            }
        }
    }

    /// Stop whatever runs. The running operation returns the variant to
    /// `Preparing`.
    pub fn cancel(&self) {
        let idle_ready = {
            let mut shared = self.shared();
            shared.delayed_write = None;
            match &shared.job {
                Job::Download(control) => control.cancel(),
                Job::Check(flag) => flag.store(true, Ordering::SeqCst),
                Job::Write(control) => control.cancel(),
                Job::Idle => {}
            }
            matches!(shared.job, Job::Idle) && shared.status == VariantStatus::ReadyToWrite
        };

        if idle_ready {
            if let Err(e) = self.transition(VariantStatus::Preparing) {
                log_debug!(MODULE, "{}", e);
            }
        }
    }

    pub fn pause(&self) -> Result<(), OrchestratorError> {
        let shared = self.shared();
        match &shared.job {
            Job::Download(control) => {
                control.pause();
                Ok(())
            }
            _ => Err(OrchestratorError::NotReady(shared.status)),
        }
    }

    pub fn resume(&self) -> Result<(), OrchestratorError> {
        let shared = self.shared();
        match &shared.job {
            Job::Download(control) => {
                control.resume();
                Ok(())
            }
            _ => Err(OrchestratorError::NotReady(shared.status)),
        }
    }

    /// Run the phase the last failure asks for again
    pub async fn retry(&self) -> Result<(), OrchestratorError> {
        let (status, failure, last_drive) = {
            let shared = self.shared();
            (shared.status, shared.failure.clone(), shared.last_drive.clone())
        };
        let Some(failure) = failure.filter(|_| status.is_failed()) else {
            return Err(OrchestratorError::NotReady(status));
        };

        match failure.retry_scope() {
            RetryScope::Write if status == VariantStatus::WriteFailed && self.image_path().is_file() => {
                self.transition(VariantStatus::ReadyToWrite)?;
                match last_drive.and_then(|d| self.inner.drives.drive(&d.id)) {
                    Some(drive) => self.write(&drive).await,
                    None => {
                        log_info!(MODULE, "Drive is gone, waiting for a new one");
                        Ok(())
                    }
                }
            }
            RetryScope::Write | RetryScope::Download => {
                if status == VariantStatus::WriteFailed && failure.retry_scope() == RetryScope::Download {
                    self.discard_image();
                }
                self.transition(VariantStatus::Preparing)?;
                self.download().await
            }
            RetryScope::Restore | RetryScope::None => Err(OrchestratorError::NotReady(status)),
        }
    }

    /// Delete a downloaded image that turned out unusable
    fn discard_image(&self) {
        let path = self.image_path();
        if self.inner.variant.is_local() || !is_within(&self.inner.downloads_dir, &path) {
            return;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => log_info!(MODULE, "Removed {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log_warn!(MODULE, "Failed to remove {}: {}", path.display(), e),
        }
    }

    /// Queue a write to start as soon as the image is ready; `None` clears it
    pub fn set_delayed_write(&self, drive: Option<Drive>) {
        let start = {
            let mut shared = self.shared();
            shared.delayed_write = drive;
            shared.delayed_write.is_some() && shared.status == VariantStatus::ReadyToWrite
        };
        if start {
            self.start_delayed_write();
        }
    }

    fn start_delayed_write(&self) {
        let Some(drive) = self.shared().delayed_write.take() else {
            return;
        };
        log_info!(MODULE, "Starting queued write to {}", drive.display_name());
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.write(&drive).await {
                log_warn!(MODULE, "Queued write to {} ended: {}", drive.id, e);
            }
        });
    }

    /// Delete the downloaded image and start over
    pub fn erase_download(&self) -> Result<(), OrchestratorError> {
        let status = self.status();
        if status.is_busy() {
            return Err(OrchestratorError::NotReady(status));
        }

        let path = self.image_path();
        if self.inner.variant.is_local() || !is_within(&self.inner.downloads_dir, &path) {
            return Err(OrchestratorError::OutsideDownloads(path));
        }

        for file in [part_path(&path), path] {
            match std::fs::remove_file(&file) {
                Ok(()) => log_info!(MODULE, "Deleted {}", file.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(OrchestratorError::Erase { path: file, source }),
            }
        }

        if status != VariantStatus::Preparing {
            self.transition(VariantStatus::Preparing)?;
        }
        Ok(())
    }

    /// Restore a drive through this variant's helper
    pub async fn restore(&self, drive: &Drive) -> Result<(), Failure> {
        restore_drive(&self.inner.drives, &self.inner.launcher, drive).await
    }
}

fn download_failure(e: &DownloadError) -> Failure {
    Failure::new(
        e.kind().unwrap_or(FailureKind::ConnectionFailed),
        e.to_string(),
    )
}

/// Reinitialize `drive` with an empty FAT partition through a helper
pub async fn restore_drive(
    drives: &DriveManager,
    launcher: &HelperLauncher,
    drive: &Drive,
) -> Result<(), Failure> {
    let lease = drives
        .reserve(drive)
        .map_err(|e| Failure::new(FailureKind::RestoreFailed, e.to_string()))?;
    log_info!(MODULE, "Restoring {}", drive.display_name());
    drives.set_restore_status(&drive.id, RestoreStatus::Restoring);

    let result = async {
        let mut client = launcher
            .launch()
            .await
            .map_err(|e| Failure::new(e.kind(), e.to_string()))?;
        client
            .send(Request::Restore {
                drive_id: drive.id.clone(),
            })
            .map_err(|e| Failure::new(FailureKind::RestoreFailed, e.to_string()))?;

        let outcome = loop {
            match client.next_event().await {
                Ok(Event::Restored) => break Ok(()),
                Ok(Event::Error { kind, detail }) => break Err(Failure::new(kind, detail)),
                Ok(other) => log_debug!(MODULE, "Ignoring helper event {:?}", other),
                Err(e) => break Err(Failure::new(FailureKind::RestoreFailed, e.to_string())),
            }
        };
        client.shutdown().await;
        outcome
    }
    .await;
    drop(lease);

    match &result {
        Ok(()) => {
            log_info!(MODULE, "Restored {}", drive.id);
            drives.set_restore_status(&drive.id, RestoreStatus::Restored);
        }
        Err(failure) => {
            log_error!(MODULE, "Restore of {} failed: {}", drive.id, failure);
            drives.set_restore_status(&drive.id, RestoreStatus::Failed);
        }
    }
    result
}
