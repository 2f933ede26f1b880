//! Helper worker
//!
//! Owns the raw device for the duration of a job. Requests come in, events go
//! out; nothing else is shared with the orchestrator.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::protocol::{negotiate, Event, Request, SourceDescriptor};
use crate::config::Settings;
use crate::decompress::open_stream;
use crate::devices::{find_drive, BackendLock, Drive, DriveBackend};
use crate::error::{DriveError, FailureKind, WriteError};
use crate::flash::{self, FlashState, WriteJob, WriteProgress};
use crate::{log_debug, log_error, log_info, log_warn};

const MODULE: &str = "helper::worker";

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub progress_interval: Duration,
    pub verify_io_timeout: Duration,
}

impl From<&Settings> for WorkerSettings {
    fn from(settings: &Settings) -> Self {
        Self {
            progress_interval: settings.progress_interval(),
            verify_io_timeout: settings.verify_io_timeout(),
        }
    }
}

enum Wake {
    Finished(Result<Event, tokio::task::JoinError>),
    Request(Option<Request>),
}

struct RunningJob {
    state: Arc<FlashState>,
    task: JoinHandle<Event>,
}

/// Serve one orchestrator until its request channel closes
pub async fn serve(
    backend: Arc<dyn DriveBackend>,
    settings: WorkerSettings,
    mut requests: mpsc::UnboundedReceiver<Request>,
    events: mpsc::UnboundedSender<Event>,
) {
    match requests.recv().await {
        Some(Request::Hello { version }) => match negotiate(version) {
            Ok(agreed) => {
                log_debug!(MODULE, "Speaking protocol {}", agreed);
                let _ = events.send(Event::Hello { version: agreed });
            }
            Err(e) => {
                log_error!(MODULE, "{}", e);
                let _ = events.send(Event::error(e.kind(), e));
                return;
            }
        },
        Some(other) => {
            let _ = events.send(Event::error(
                FailureKind::HelperProtocolMismatch,
                format!("expected hello, got {:?}", other),
            ));
            return;
        }
        None => return,
    }

    let mut job: Option<RunningJob> = None;
    loop {
        let wake = match job.as_mut() {
            Some(running) => tokio::select! {
                result = &mut running.task => Wake::Finished(result),
                request = requests.recv() => Wake::Request(request),
            },
            None => Wake::Request(requests.recv().await),
        };

        let request = match wake {
            Wake::Finished(result) => {
                job = None;
                let event = result.unwrap_or_else(|e| {
                    log_error!(MODULE, "Job panicked: {}", e);
                    Event::error(FailureKind::HelperCrashed, e)
                });
                let _ = events.send(event);
                continue;
            }
            Wake::Request(Some(request)) => request,
            Wake::Request(None) => {
                if let Some(running) = job.take() {
                    log_warn!(MODULE, "Orchestrator went away, stopping job");
                    running.state.cancel();
                    let _ = running.task.await;
                }
                return;
            }
        };

        match request {
            Request::Cancel => match &job {
                Some(running) => {
                    log_info!(MODULE, "Cancel requested");
                    running.state.cancel();
                }
                None => log_debug!(MODULE, "Cancel without a running job"),
            },
            Request::Hello { .. } => log_debug!(MODULE, "Ignoring repeated hello"),
            _ if job.is_some() => {
                let _ = events.send(Event::error(
                    FailureKind::CouldNotLockDrive,
                    "the helper is already running a job",
                ));
            }
            Request::StartWrite {
                source,
                drive_id,
                verify,
            } => {
                let state = Arc::new(FlashState::new());
                let task = tokio::spawn(run_write(
                    backend.clone(),
                    settings,
                    source,
                    drive_id,
                    verify,
                    state.clone(),
                    events.clone(),
                ));
                job = Some(RunningJob { state, task });
            }
            Request::Restore { drive_id } => {
                let state = Arc::new(FlashState::new());
                let task = tokio::spawn(run_restore(backend.clone(), drive_id));
                job = Some(RunningJob { state, task });
            }
        }
    }
}

fn write_error_event(e: WriteError, state: &FlashState) -> Event {
    match e.kind() {
        Some(kind) => Event::error(kind, e),
        None => Event::Stopped {
            bytes_written: state.written(),
        },
    }
}

async fn run_write(
    backend: Arc<dyn DriveBackend>,
    settings: WorkerSettings,
    source: SourceDescriptor,
    drive_id: String,
    verify: bool,
    state: Arc<FlashState>,
    events: mpsc::UnboundedSender<Event>,
) -> Event {
    let drive = match find_drive(backend.as_ref(), &drive_id).await {
        Ok(drive) => drive,
        Err(e) => return Event::error(e.kind(), e),
    };
    log_info!(
        MODULE,
        "Write of {} to {} requested",
        source.path.display(),
        drive.display_name()
    );

    let path = source.path.clone();
    let container = source.container;
    let opened = tokio::task::spawn_blocking(move || {
        let mut stream = open_stream(&path, container)?;
        let hint = stream.decoded_size();
        Ok::<_, WriteError>((stream, hint))
    })
    .await;
    let (stream, hint) = match opened {
        Ok(Ok(opened)) => opened,
        Ok(Err(e)) => return write_error_event(e, &state),
        Err(e) => return Event::error(FailureKind::HelperCrashed, e),
    };

    let total = source.expected_size.or(hint);
    if let Err(e) = flash::preflight(&drive, total) {
        return Event::error(e.kind(), e);
    }

    let lock = match BackendLock::acquire(backend.clone(), &drive).await {
        Ok(lock) => lock,
        Err(e) => return Event::error(e.kind(), e),
    };

    let result = write_locked(&backend, settings, &drive, stream, total, verify, &state, &events).await;
    let unlocked = lock.unlock().await;

    match (result, unlocked) {
        (Ok(()), Ok(())) => {
            log_info!(MODULE, "Write to {} finished", drive.id);
            Event::Finished
        }
        (Ok(()), Err(e)) => Event::error(FailureKind::CouldNotUnlockDrive, e),
        (Err(e), _) => write_error_event(e, &state),
    }
}

#[allow(clippy::too_many_arguments)]
async fn write_locked(
    backend: &Arc<dyn DriveBackend>,
    settings: WorkerSettings,
    drive: &Drive,
    mut stream: crate::decompress::ImageStream,
    total: Option<u64>,
    verify: bool,
    state: &Arc<FlashState>,
    events: &mpsc::UnboundedSender<Event>,
) -> Result<(), WriteError> {
    let mut device = backend.open_for_raw_write(drive).await?;

    let outcome = {
        let backend = backend.clone();
        let drive = drive.clone();
        let state = state.clone();
        let events = events.clone();
        tokio::task::spawn_blocking(move || {
            let probe = || backend.is_present(&drive);
            let job = WriteJob {
                drive: &drive,
                total_bytes: total,
                state: &state,
                is_present: &probe,
                progress_interval: settings.progress_interval,
            };
            job.run(&mut stream, device.as_mut(), &mut progress_sender(&events))
        })
        .await
        .map_err(|e| WriteError::MediaCheck(format!("write task failed: {}", e)))??
    };

    if !verify {
        return Ok(());
    }

    let reader = backend.open_for_read(drive).await?;
    let backend = backend.clone();
    let drive = drive.clone();
    let state = state.clone();
    let events = events.clone();
    tokio::task::spawn_blocking(move || {
        let probe = || backend.is_present(&drive);
        let job = WriteJob {
            drive: &drive,
            total_bytes: Some(outcome.bytes_written),
            state: &state,
            is_present: &probe,
            progress_interval: settings.progress_interval,
        };
        flash::verify_written(
            &job,
            reader,
            &outcome,
            settings.verify_io_timeout,
            &mut progress_sender(&events),
        )
    })
    .await
    .map_err(|e| WriteError::MediaCheck(format!("verify task failed: {}", e)))?
}

fn progress_sender(events: &mpsc::UnboundedSender<Event>) -> impl FnMut(WriteProgress) + '_ {
    move |progress| {
        let _ = events.send(Event::Progress {
            bytes_written: progress.bytes_written,
            total_bytes: progress.total_bytes,
            phase: progress.phase,
        });
    }
}

async fn run_restore(backend: Arc<dyn DriveBackend>, drive_id: String) -> Event {
    let result = async {
        let drive = find_drive(backend.as_ref(), &drive_id).await?;
        log_info!(MODULE, "Restoring {}", drive.display_name());
        let lock = BackendLock::acquire(backend.clone(), &drive).await?;
        let restored = backend.restore(&drive).await;
        let unlocked = lock.unlock().await;
        restored?;
        unlocked
    }
    .await;

    match result {
        Ok(()) => Event::Restored,
        Err(e) => {
            log_error!(MODULE, "Restore of {} failed: {}", drive_id, e);
            let e = match e {
                DriveError::RestoreFailed { .. } => e,
                other => DriveError::RestoreFailed {
                    drive: drive_id,
                    reason: other.to_string(),
                },
            };
            Event::error(e.kind(), e)
        }
    }
}
