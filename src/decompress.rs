//! Decompression module
//!
//! Streams the payload of an image file through its codec (raw, gzip, xz)
//! and optional tar framing. Decoding runs on its own thread and hands
//! chunks over a bounded channel, so a slow consumer blocks the decoder
//! instead of growing memory.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;

use flate2::read::MultiGzDecoder;
use thiserror::Error;
use xz2::read::XzDecoder;
use xz2::stream::{Stream, CONCATENATED};

use crate::catalog::{Codec, ContainerType};
use crate::config;
use crate::error::DecompressError;
use crate::utils::ProgressTracker;
use crate::{log_debug, log_error, log_info};

const MODULE: &str = "decompress";

/// Marks I/O errors that came from the image file rather than the codec
#[derive(Debug, Error)]
#[error("{0}")]
struct SourceFault(io::Error);

struct SourceReader {
    inner: File,
}

impl Read for SourceReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner
            .read(buf)
            .map_err(|e| io::Error::new(e.kind(), SourceFault(e)))
    }
}

#[derive(Debug)]
enum Message {
    /// Decoded size, once the decoder knows it
    Size(u64),
    Chunk(Vec<u8>),
    Error(DecompressError),
}

/// First error of type `T` behind `e`. The tar reader wraps codec errors in
/// its own error type, so the payload of each `io::Error` is followed as well
/// as `source()`.
fn find_cause<T: std::error::Error + 'static>(e: &io::Error) -> Option<&T> {
    let mut current: Option<&(dyn std::error::Error + 'static)> =
        e.get_ref().map(|inner| inner as &(dyn std::error::Error + 'static));
    while let Some(err) = current {
        if let Some(found) = err.downcast_ref::<T>() {
            return Some(found);
        }
        current = match err.downcast_ref::<io::Error>() {
            Some(wrapped) => wrapped
                .get_ref()
                .map(|inner| inner as &(dyn std::error::Error + 'static)),
            None => err.source(),
        };
    }
    None
}

/// Map a decoder error to its failure class
fn classify(e: io::Error, path: &Path, in_tar: bool) -> DecompressError {
    let kind = e.kind();

    if e.get_ref().is_some_and(|inner| inner.is::<SourceFault>()) {
        let source = match e.into_inner().map(|inner| inner.downcast::<SourceFault>()) {
            Some(Ok(fault)) => fault.0,
            _ => io::Error::new(kind, "read failed"),
        };
        return DecompressError::SourceNotReadable {
            path: path.to_path_buf(),
            source,
        };
    }
    if let Some(fault) = find_cause::<SourceFault>(&e) {
        return DecompressError::SourceNotReadable {
            path: path.to_path_buf(),
            source: io::Error::new(fault.0.kind(), fault.0.to_string()),
        };
    }

    if let Some(xz) = find_cause::<xz2::stream::Error>(&e) {
        return match xz {
            xz2::stream::Error::Mem | xz2::stream::Error::MemLimit => {
                DecompressError::OutOfMemory(xz.to_string())
            }
            xz2::stream::Error::Options => DecompressError::UnsupportedOptions(xz.to_string()),
            xz2::stream::Error::Data | xz2::stream::Error::Format => {
                DecompressError::Corrupted(xz.to_string())
            }
            _ => DecompressError::Unknown(xz.to_string()),
        };
    }

    match kind {
        io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => {
            DecompressError::Corrupted(e.to_string())
        }
        io::ErrorKind::OutOfMemory => DecompressError::OutOfMemory(e.to_string()),
        // Malformed tar headers surface as plain errors
        io::ErrorKind::Other if in_tar => DecompressError::Corrupted(e.to_string()),
        _ => DecompressError::Unknown(e.to_string()),
    }
}

fn codec_reader(file: File, codec: Codec) -> Result<Box<dyn Read + Send>, DecompressError> {
    let source = BufReader::with_capacity(
        config::decompress::READ_BUFFER_SIZE,
        SourceReader { inner: file },
    );

    Ok(match codec {
        Codec::None => Box::new(source),
        Codec::Gzip => Box::new(MultiGzDecoder::new(source)),
        Codec::Xz => {
            let stream = Stream::new_stream_decoder(config::decompress::XZ_MEMORY_LIMIT, CONCATENATED)
                .map_err(|e| match e {
                    xz2::stream::Error::Mem | xz2::stream::Error::MemLimit => {
                        DecompressError::OutOfMemory(e.to_string())
                    }
                    _ => DecompressError::Unknown(e.to_string()),
                })?;
            Box::new(XzDecoder::new_stream(source, stream))
        }
    })
}

/// Read until `buf` is full or the reader is exhausted
fn fill<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Pump decoded chunks into `tx`. Returns the number of bytes produced.
fn pump<R: Read + ?Sized>(
    reader: &mut R,
    tx: &SyncSender<Message>,
    cancelled: &AtomicBool,
    path: &Path,
    in_tar: bool,
    tracker: &mut ProgressTracker,
) -> Result<u64, DecompressError> {
    let mut produced = 0u64;
    loop {
        if cancelled.load(Ordering::SeqCst) {
            return Err(DecompressError::Cancelled);
        }

        let mut chunk = vec![0u8; config::decompress::CHUNK_SIZE];
        let n = fill(reader, &mut chunk).map_err(|e| classify(e, path, in_tar))?;
        if n == 0 {
            return Ok(produced);
        }
        chunk.truncate(n);
        produced += n as u64;
        tracker.update(n as u64);

        if tx.send(Message::Chunk(chunk)).is_err() {
            // Consumer went away
            return Err(DecompressError::Cancelled);
        }
    }
}

fn decode_tar(
    reader: Box<dyn Read + Send>,
    tx: &SyncSender<Message>,
    cancelled: &AtomicBool,
    path: &Path,
    tracker: &mut ProgressTracker,
) -> Result<(), DecompressError> {
    let mut archive = tar::Archive::new(reader);
    let entries = archive.entries().map_err(|e| classify(e, path, true))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| classify(e, path, true))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let size = entry.size();
        log_debug!(
            MODULE,
            "Streaming archive member {} ({} bytes)",
            entry.path().map(|p| p.display().to_string()).unwrap_or_default(),
            size
        );
        let _ = tx.send(Message::Size(size));

        let produced = pump(&mut entry, tx, cancelled, path, true, tracker)?;
        if produced < size {
            return Err(DecompressError::Corrupted(format!(
                "archive member truncated: {} of {} bytes",
                produced, size
            )));
        }
        return Ok(());
    }

    Err(DecompressError::Corrupted("archive contains no image".to_string()))
}

/// Lazy, finite, non-restartable sequence of decoded chunks
#[derive(Debug)]
pub struct ImageStream {
    rx: Receiver<Message>,
    cancelled: Arc<AtomicBool>,
    container: ContainerType,
    size: Option<u64>,
    pending: Option<Message>,
    finished: bool,
}

impl ImageStream {
    pub fn container(&self) -> ContainerType {
        self.container
    }

    /// Decoded size when it is known without decoding everything: raw
    /// images and tar members. Compressed raw images return `None`.
    pub fn decoded_size(&mut self) -> Option<u64> {
        if self.size.is_none() && self.container.is_tar() && self.pending.is_none() && !self.finished {
            match self.rx.recv() {
                Ok(Message::Size(size)) => self.size = Some(size),
                Ok(other) => self.pending = Some(other),
                Err(_) => self.finished = true,
            }
        }
        self.size
    }

    /// Stop decoding at the next chunk boundary
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn next_chunk(&mut self) -> Option<Result<Vec<u8>, DecompressError>> {
        loop {
            if self.finished {
                return None;
            }

            let message = match self.pending.take() {
                Some(message) => message,
                None => match self.rx.recv() {
                    Ok(message) => message,
                    Err(_) => {
                        self.finished = true;
                        return None;
                    }
                },
            };

            match message {
                Message::Size(size) => self.size = Some(size),
                Message::Chunk(chunk) => return Some(Ok(chunk)),
                Message::Error(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

impl Iterator for ImageStream {
    type Item = Result<Vec<u8>, DecompressError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk()
    }
}

impl Drop for ImageStream {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// Open `path` as a `container` image and start decoding it
pub fn open_stream(path: &Path, container: ContainerType) -> Result<ImageStream, DecompressError> {
    if !container.can_write() {
        return Err(DecompressError::UnsupportedContainer(container));
    }

    let file = File::open(path).map_err(|source| DecompressError::SourceNotReadable {
        path: path.to_path_buf(),
        source,
    })?;
    let file_size = file.metadata().map(|m| m.len()).unwrap_or(0);
    let reader = codec_reader(file, container.codec())?;

    log_info!(
        MODULE,
        "Streaming {} ({})",
        path.display(),
        container.display_name()
    );

    let (tx, rx) = sync_channel(config::decompress::QUEUE_DEPTH);
    let cancelled = Arc::new(AtomicBool::new(false));
    let worker_cancelled = cancelled.clone();
    let worker_path: PathBuf = path.to_path_buf();

    std::thread::Builder::new()
        .name("decompress".to_string())
        .spawn(move || decode(reader, container, tx, worker_cancelled, worker_path))
        .map_err(|e| DecompressError::Unknown(format!("failed to start decoder: {}", e)))?;

    let size = (container == ContainerType::Raw).then_some(file_size);
    Ok(ImageStream {
        rx,
        cancelled,
        container,
        size,
        pending: None,
        finished: false,
    })
}

fn decode(
    mut reader: Box<dyn Read + Send>,
    container: ContainerType,
    tx: SyncSender<Message>,
    cancelled: Arc<AtomicBool>,
    path: PathBuf,
) {
    let mut tracker = ProgressTracker::new("Decompress", MODULE, 0, config::logging::FLASH_LOG_INTERVAL_MB);

    let result = if container.is_tar() {
        decode_tar(reader, &tx, &cancelled, &path, &mut tracker)
    } else {
        pump(reader.as_mut(), &tx, &cancelled, &path, false, &mut tracker).map(|_| ())
    };

    match result {
        Ok(()) => tracker.finish(),
        Err(DecompressError::Cancelled) => log_debug!(MODULE, "Decoder stopped"),
        Err(e) => {
            log_error!(MODULE, "Decompression failed: {}", e);
            let _ = tx.send(Message::Error(e));
        }
    }
}
