//! Helper transports
//!
//! The worker runs either as a task in this process or as a child process
//! speaking the line protocol over stdio. The orchestrator sees the same
//! [`HelperClient`] either way.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use super::protocol::{self, Event, Request, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};
use super::worker::{self, WorkerSettings};
use crate::config::{self, Settings};
use crate::devices::DriveBackend;
use crate::error::{DriveError, FailureKind, HelperError};
use crate::{log_debug, log_error, log_info, log_warn};

const MODULE: &str = "helper::transport";

/// Find the helper executable: environment override, then settings, then
/// this very binary
pub fn locate_helper(settings: &Settings) -> Result<PathBuf, DriveError> {
    let configured = std::env::var_os(config::app::HELPER_ENV)
        .map(PathBuf::from)
        .or_else(|| settings.helper_path.clone());

    let path = match configured {
        Some(path) => path,
        None => std::env::current_exe()
            .map_err(|_| DriveError::HelperBinaryMissing(PathBuf::from(config::app::NAME)))?,
    };

    if !path.is_file() {
        log_error!(MODULE, "Helper binary not found at {}", path.display());
        return Err(DriveError::HelperBinaryMissing(path));
    }
    log_debug!(MODULE, "Using helper {}", path.display());
    Ok(path)
}

/// How to start a helper for a job
#[derive(Clone)]
pub enum HelperLauncher {
    /// Worker task inside this process, using the given backend
    InProcess {
        backend: Arc<dyn DriveBackend>,
        settings: WorkerSettings,
    },
    /// `<helper> helper` as a child process
    Process { settings: Settings },
}

impl HelperLauncher {
    /// Start a helper and complete the version handshake
    pub async fn launch(&self) -> Result<HelperClient, HelperError> {
        let mut client = match self {
            Self::InProcess { backend, settings } => HelperClient::in_process(backend.clone(), *settings),
            Self::Process { settings } => {
                let path = locate_helper(settings)?;
                HelperClient::spawn(&path)?
            }
        };
        client.handshake().await?;
        Ok(client)
    }
}

/// Cloneable handle for sending requests, used to cancel from elsewhere
#[derive(Clone)]
pub struct HelperControl {
    requests: mpsc::UnboundedSender<Request>,
}

impl HelperControl {
    pub fn send(&self, request: Request) -> Result<(), HelperError> {
        self.requests.send(request).map_err(|_| HelperError::Disconnected)
    }

    pub fn cancel(&self) {
        if self.send(Request::Cancel).is_err() {
            log_debug!(MODULE, "Cancel after the helper went away");
        }
    }
}

/// Orchestrator side of a helper connection
pub struct HelperClient {
    control: HelperControl,
    events: mpsc::UnboundedReceiver<Result<Event, HelperError>>,
    version: u32,
    child: Option<Child>,
}

impl HelperClient {
    pub fn in_process(backend: Arc<dyn DriveBackend>, settings: WorkerSettings) -> Self {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (client_tx, client_rx) = mpsc::unbounded_channel();

        tokio::spawn(worker::serve(backend, settings, request_rx, event_tx));
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                if client_tx.send(Ok(event)).is_err() {
                    return;
                }
            }
            let _ = client_tx.send(Err(HelperError::Disconnected));
        });

        Self {
            control: HelperControl { requests: request_tx },
            events: client_rx,
            version: 0,
            child: None,
        }
    }

    /// Run `path helper` and talk to it over its stdio
    pub fn spawn(path: &Path) -> Result<Self, HelperError> {
        log_info!(MODULE, "Starting helper {}", path.display());
        let mut child = Command::new(path)
            .arg("helper")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take().ok_or(HelperError::Disconnected)?;
        let stdout = child.stdout.take().ok_or(HelperError::Disconnected)?;

        let mut client = Self::over_stream(stdout, stdin);
        client.child = Some(child);
        Ok(client)
    }

    /// Speak the line protocol to a helper on the other end of `reader` and
    /// `writer`. The handshake has not happened yet.
    pub fn over_stream<R, W>(reader: R, mut writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (request_tx, mut request_rx) = mpsc::unbounded_channel::<Request>();
        let (client_tx, client_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(request) = request_rx.recv().await {
                let line = match protocol::encode(&request) {
                    Ok(line) => line,
                    Err(e) => {
                        log_error!(MODULE, "{}", e);
                        continue;
                    }
                };
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    log_warn!(MODULE, "Helper input closed: {}", e);
                    return;
                }
                let _ = writer.flush().await;
            }
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                let message = match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => protocol::decode::<Event>(&line),
                    Ok(None) => Err(HelperError::Disconnected),
                    Err(e) => Err(HelperError::Io(e)),
                };
                let fatal = message.is_err();
                if client_tx.send(message).is_err() || fatal {
                    return;
                }
            }
        });

        Self {
            control: HelperControl { requests: request_tx },
            events: client_rx,
            version: 0,
            child: None,
        }
    }

    /// Exchange protocol versions; must precede any job request
    pub async fn handshake(&mut self) -> Result<(), HelperError> {
        self.send(Request::Hello {
            version: PROTOCOL_VERSION,
        })?;
        match self.next_event().await? {
            Event::Hello { version } if version >= MIN_PROTOCOL_VERSION && version <= PROTOCOL_VERSION => {
                self.version = version;
                log_debug!(MODULE, "Helper speaks protocol {}", version);
                Ok(())
            }
            Event::Hello { version } => Err(HelperError::VersionMismatch {
                ours: PROTOCOL_VERSION,
                theirs: version,
            }),
            Event::Error {
                kind: FailureKind::HelperProtocolMismatch,
                detail,
            } => Err(HelperError::Protocol(detail)),
            other => Err(HelperError::Protocol(format!("unexpected handshake reply {:?}", other))),
        }
    }

    /// Negotiated protocol version
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn control(&self) -> HelperControl {
        self.control.clone()
    }

    pub fn send(&self, request: Request) -> Result<(), HelperError> {
        self.control.send(request)
    }

    /// Next event; a vanished helper is [`HelperError::Disconnected`]
    pub async fn next_event(&mut self) -> Result<Event, HelperError> {
        match self.events.recv().await {
            Some(message) => message,
            None => Err(HelperError::Disconnected),
        }
    }

    /// Close the request side and reap a child helper
    pub async fn shutdown(mut self) {
        drop(self.control);
        if let Some(mut child) = self.child.take() {
            match child.wait().await {
                Ok(status) => log_debug!(MODULE, "Helper exited with {}", status),
                Err(e) => log_warn!(MODULE, "Failed to reap helper: {}", e),
            }
        }
    }
}

/// Helper side of the child-process transport: serve requests from stdin
/// and write events to stdout
pub async fn serve_stdio(backend: Arc<dyn DriveBackend>, settings: WorkerSettings) -> Result<(), HelperError> {
    log_info!(
        MODULE,
        "Helper serving on stdio with the {} backend (elevated: {})",
        backend.name(),
        crate::utils::is_elevated()
    );
    serve_io(backend, settings, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Serve requests read from `input`, one JSON line each, and write events to
/// `output` until `input` ends and the worker has finished
pub async fn serve_io<R, W>(
    backend: Arc<dyn DriveBackend>,
    settings: WorkerSettings,
    input: R,
    mut output: W,
) -> Result<(), HelperError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();

    let worker = tokio::spawn(worker::serve(backend, settings, request_rx, event_tx));

    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(input).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match protocol::decode::<Request>(&line) {
                Ok(request) => {
                    if request_tx.send(request).is_err() {
                        return;
                    }
                }
                Err(e) => log_warn!(MODULE, "Dropping request: {}", e),
            }
        }
        log_debug!(MODULE, "Request stream ended");
    });

    while let Some(event) = event_rx.recv().await {
        let line = protocol::encode(&event)?;
        output.write_all(line.as_bytes()).await?;
        output.flush().await?;
    }

    reader.abort();
    let _ = worker.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_configured_helper() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            helper_path: Some(dir.path().join("no-such-helper")),
            ..Settings::default()
        };
        if std::env::var_os(config::app::HELPER_ENV).is_some() {
            return;
        }
        let err = locate_helper(&settings).unwrap_err();
        assert_eq!(err.kind(), FailureKind::HelperBinaryMissing);
    }

    #[test]
    fn test_default_helper_is_current_exe() {
        if std::env::var_os(config::app::HELPER_ENV).is_some() {
            return;
        }
        let path = locate_helper(&Settings::default()).unwrap();
        assert_eq!(path, std::env::current_exe().unwrap());
    }

    #[tokio::test]
    async fn test_in_process_handshake() {
        let backend = Arc::new(crate::devices::FileBackend::new());
        let settings = WorkerSettings::from(&Settings::default());
        let client = HelperLauncher::InProcess { backend, settings }.launch().await.unwrap();
        assert_eq!(client.version(), PROTOCOL_VERSION);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_write_over_line_protocol() {
        use crate::catalog::ContainerType;
        use crate::flash::WritePhase;
        use crate::helper::SourceDescriptor;

        let dir = tempfile::tempdir().unwrap();
        let image: Vec<u8> = (0..(1u32 << 20)).map(|i| (i % 251) as u8).collect();
        let image_path = dir.path().join("disk.img");
        std::fs::write(&image_path, &image).unwrap();
        let backend = Arc::new(crate::devices::FileBackend::new());
        backend.add_drive("sdb", "SDB", dir.path().join("sdb.img"), 2 << 20, false).unwrap();

        let (client_requests, helper_requests) = tokio::io::duplex(64 * 1024);
        let (helper_events, client_events) = tokio::io::duplex(64 * 1024);
        let settings = WorkerSettings::from(&Settings::default());
        let server = tokio::spawn(serve_io(backend.clone(), settings, helper_requests, helper_events));

        let mut client = HelperClient::over_stream(client_events, client_requests);
        client.handshake().await.unwrap();
        assert_eq!(client.version(), PROTOCOL_VERSION);

        client
            .send(Request::StartWrite {
                source: SourceDescriptor {
                    path: image_path,
                    container: ContainerType::Raw,
                    expected_size: Some(image.len() as u64),
                },
                drive_id: "sdb".into(),
                verify: true,
            })
            .unwrap();

        let mut phases = Vec::new();
        let last = loop {
            match client.next_event().await.unwrap() {
                Event::Progress { phase, .. } => {
                    if phases.last() != Some(&phase) {
                        phases.push(phase);
                    }
                }
                event => break event,
            }
        };
        assert_eq!(last, Event::Finished);
        assert_eq!(phases, [WritePhase::Writing, WritePhase::Flushing, WritePhase::Verifying]);
        assert_eq!(&backend.read_contents("sdb").unwrap()[..image.len()], &image[..]);
        assert!(!backend.is_locked("sdb"));

        client.shutdown().await;
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_vanished_helper_is_disconnected() {
        let (client_requests, helper_requests) = tokio::io::duplex(1024);
        let (helper_events, client_events) = tokio::io::duplex(1024);
        drop(helper_requests);
        drop(helper_events);

        let mut client = HelperClient::over_stream(client_events, client_requests);
        let err = client.handshake().await.unwrap_err();
        assert!(matches!(err, HelperError::Disconnected));
        assert_eq!(err.kind(), FailureKind::HelperCrashed);
    }

    #[tokio::test]
    async fn test_garbage_from_helper_is_protocol_error() {
        let (client_requests, _helper_requests) = tokio::io::duplex(1024);
        let (mut helper_events, client_events) = tokio::io::duplex(1024);
        helper_events.write_all(b"not json\n").await.unwrap();

        let mut client = HelperClient::over_stream(client_events, client_requests);
        assert!(client.handshake().await.is_err());
    }
}
