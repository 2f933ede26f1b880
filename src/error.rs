//! Error taxonomy
//!
//! Each pipeline phase has its own error enum. All of them collapse into
//! [`FailureKind`], the serializable classification that crosses the helper
//! boundary and that the state machine keeps for display and retry decisions.

use std::fmt;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::ContainerType;
use crate::orchestrator::VariantStatus;

/// Flat classification of every terminal condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    // Download
    NotWritable,
    OutOfSpace,
    ConnectionTimedOut,
    ConnectionFailed,
    ServerRejected,
    RenameFailed,
    DownloadedImageCorrupted,
    UnreadableFile,
    // Decompression
    OutOfMemory,
    CorruptedCompressedFile,
    UnsupportedCompressionOptions,
    UnknownDecompressionError,
    // Drive access
    HelperBinaryMissing,
    DriveUnavailableService,
    CouldNotLockDrive,
    CouldNotOpenDriveForWriting,
    DestinationNotWritable,
    DriveTooSmall,
    CouldNotUnlockDrive,
    // Write / verify
    SourceNotReadable,
    DriveRemovedDuringWrite,
    DriveProbablyDamaged,
    UnexpectedMediaCheckError,
    WrittenDataCorrupted,
    UnsupportedContainer,
    // Helper
    HelperProtocolMismatch,
    HelperCrashed,
    // Restore
    RestoreFailed,
}

/// Which phase has to run again to recover
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryScope {
    Download,
    Write,
    Restore,
    None,
}

/// The single action a terminal state offers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryAction {
    Retry,
    Close,
    Restore,
}

impl FailureKind {
    pub fn retry_scope(self) -> RetryScope {
        use FailureKind::*;
        match self {
            ConnectionTimedOut
            | ConnectionFailed
            | ServerRejected
            | RenameFailed
            | DownloadedImageCorrupted
            | UnreadableFile
            | CorruptedCompressedFile
            | SourceNotReadable => RetryScope::Download,
            CouldNotLockDrive
            | CouldNotOpenDriveForWriting
            | DriveRemovedDuringWrite
            | UnexpectedMediaCheckError
            | WrittenDataCorrupted
            | UnknownDecompressionError
            | HelperCrashed => RetryScope::Write,
            RestoreFailed => RetryScope::Restore,
            NotWritable
            | OutOfSpace
            | OutOfMemory
            | UnsupportedCompressionOptions
            | HelperBinaryMissing
            | DriveUnavailableService
            | DestinationNotWritable
            | DriveTooSmall
            | CouldNotUnlockDrive
            | DriveProbablyDamaged
            | UnsupportedContainer
            | HelperProtocolMismatch => RetryScope::None,
        }
    }

    pub fn primary_action(self) -> PrimaryAction {
        match self.retry_scope() {
            RetryScope::Download | RetryScope::Write => PrimaryAction::Retry,
            RetryScope::Restore => PrimaryAction::Restore,
            RetryScope::None => PrimaryAction::Close,
        }
    }

    /// Human readable summary, shown next to the detail string
    pub fn message(self) -> &'static str {
        use FailureKind::*;
        match self {
            NotWritable => "The downloaded file is not writable.",
            OutOfSpace => "You ran out of space in your Downloads folder.",
            ConnectionTimedOut => "The connection timed out.",
            ConnectionFailed => "The connection was lost and could not be resumed.",
            ServerRejected => "The server refused to send the image.",
            RenameFailed => "Unable to rename the temporary file.",
            DownloadedImageCorrupted => "The downloaded image is corrupted.",
            UnreadableFile => "Failed to read from file while verifying.",
            OutOfMemory => "There is not enough memory to decompress the file.",
            CorruptedCompressedFile => "The downloaded compressed file is corrupted.",
            UnsupportedCompressionOptions => "Unsupported compression options.",
            UnknownDecompressionError => "Unknown decompression error.",
            HelperBinaryMissing => "Could not find the helper binary. Check your installation.",
            DriveUnavailableService => "The drive service seems to be unavailable on your system.",
            CouldNotLockDrive => "Could not lock the drive.",
            CouldNotOpenDriveForWriting => "Could not open the drive for writing.",
            DestinationNotWritable => "Destination drive is not writable.",
            DriveTooSmall => "The drive is too small for this image.",
            CouldNotUnlockDrive => "Could not unlock the drive.",
            SourceNotReadable => "Source image is not readable.",
            DriveRemovedDuringWrite => "The drive was removed while it was written to.",
            DriveProbablyDamaged => "The drive is probably damaged.",
            UnexpectedMediaCheckError => "Unexpected error while checking the written data.",
            WrittenDataCorrupted => "The written data is corrupted. The download was fine, try writing again.",
            UnsupportedContainer => "This image type cannot be written to a drive.",
            HelperProtocolMismatch => "The helper binary does not match this version.",
            HelperCrashed => "The helper process stopped unexpectedly.",
            RestoreFailed => "Restoring the drive failed. Please use your system tools to reformat it.",
        }
    }
}

/// A classified failure with its detail text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub detail: String,
}

impl Failure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn retry_scope(&self) -> RetryScope {
        self.kind.retry_scope()
    }

    pub fn primary_action(&self) -> PrimaryAction {
        self.kind.primary_action()
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.kind.message(), self.detail)
    }
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Cannot write to {}: {source}", .path.display())]
    NotWritable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Not enough free space in {}: {available} bytes available, {required} required", .path.display())]
    OutOfSpace {
        path: PathBuf,
        required: u64,
        available: u64,
    },
    #[error("Connection timed out: {0}")]
    ConnectionTimedOut(String),
    #[error("Download failed after {attempts} resume attempts: {last_error}")]
    ConnectionFailed { attempts: u32, last_error: String },
    #[error("Server responded with status {0}")]
    ServerRejected(u16),
    #[error("Unable to rename {}: {source}", .from.display())]
    RenameFailed {
        from: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    Corrupted { expected: String, actual: String },
    #[error("Failed to read {}: {source}", .path.display())]
    UnreadableFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Download cancelled")]
    Cancelled,
}

impl DownloadError {
    /// Classification, `None` for cancellation which is not a failure
    pub fn kind(&self) -> Option<FailureKind> {
        Some(match self {
            Self::NotWritable { .. } => FailureKind::NotWritable,
            Self::OutOfSpace { .. } => FailureKind::OutOfSpace,
            Self::ConnectionTimedOut(_) => FailureKind::ConnectionTimedOut,
            Self::ConnectionFailed { .. } => FailureKind::ConnectionFailed,
            Self::ServerRejected(_) => FailureKind::ServerRejected,
            Self::RenameFailed { .. } => FailureKind::RenameFailed,
            Self::Corrupted { .. } => FailureKind::DownloadedImageCorrupted,
            Self::UnreadableFile { .. } => FailureKind::UnreadableFile,
            Self::Cancelled => return None,
        })
    }
}

#[derive(Debug, Error)]
pub enum DecompressError {
    #[error("Not enough memory to decompress: {0}")]
    OutOfMemory(String),
    #[error("Corrupted compressed stream: {0}")]
    Corrupted(String),
    #[error("Unsupported compression options: {0}")]
    UnsupportedOptions(String),
    #[error("Unknown decompression error: {0}")]
    Unknown(String),
    #[error("Source image {} is not readable: {source}", .path.display())]
    SourceNotReadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Cannot stream a {0} image to a drive")]
    UnsupportedContainer(ContainerType),
    #[error("Decompression cancelled")]
    Cancelled,
}

impl DecompressError {
    pub fn kind(&self) -> Option<FailureKind> {
        Some(match self {
            Self::OutOfMemory(_) => FailureKind::OutOfMemory,
            Self::Corrupted(_) => FailureKind::CorruptedCompressedFile,
            Self::UnsupportedOptions(_) => FailureKind::UnsupportedCompressionOptions,
            Self::Unknown(_) => FailureKind::UnknownDecompressionError,
            Self::SourceNotReadable { .. } => FailureKind::SourceNotReadable,
            Self::UnsupportedContainer(_) => FailureKind::UnsupportedContainer,
            Self::Cancelled => return None,
        })
    }
}

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("Helper binary not found at {}", .0.display())]
    HelperBinaryMissing(PathBuf),
    #[error("Drive service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("Drive {0} not found")]
    NotFound(String),
    #[error("Could not lock {drive}: {reason}")]
    CouldNotLock { drive: String, reason: String },
    #[error("Could not unlock {drive}: {reason}")]
    CouldNotUnlock { drive: String, reason: String },
    #[error("Could not open {drive} for writing: {reason}")]
    CouldNotOpen { drive: String, reason: String },
    #[error("{drive} does not accept writes: {reason}")]
    NotWritable { drive: String, reason: String },
    #[error("{drive} holds {capacity} bytes but the image needs {required}")]
    TooSmall {
        drive: String,
        capacity: u64,
        required: u64,
    },
    #[error("Could not eject {drive}: {reason}")]
    Eject { drive: String, reason: String },
    #[error("Restoring {drive} failed: {reason}")]
    RestoreFailed { drive: String, reason: String },
}

impl DriveError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::HelperBinaryMissing(_) => FailureKind::HelperBinaryMissing,
            Self::ServiceUnavailable(_) => FailureKind::DriveUnavailableService,
            Self::NotFound(_) | Self::CouldNotOpen { .. } => FailureKind::CouldNotOpenDriveForWriting,
            Self::CouldNotLock { .. } => FailureKind::CouldNotLockDrive,
            Self::CouldNotUnlock { .. } | Self::Eject { .. } => FailureKind::CouldNotUnlockDrive,
            Self::NotWritable { .. } => FailureKind::DestinationNotWritable,
            Self::TooSmall { .. } => FailureKind::DriveTooSmall,
            Self::RestoreFailed { .. } => FailureKind::RestoreFailed,
        }
    }
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error(transparent)]
    Drive(#[from] DriveError),
    #[error(transparent)]
    Decompress(#[from] DecompressError),
    #[error("The drive was removed after {bytes_written} bytes were written")]
    DriveRemoved { bytes_written: u64 },
    #[error("{faults} consecutive write faults, last: {last_error}")]
    ProbablyDamaged { faults: u32, last_error: String },
    #[error("Media check failed: {0}")]
    MediaCheck(String),
    #[error("Written data does not match: expected {expected}, read back {actual}")]
    Corrupted { expected: String, actual: String },
    #[error("Image declared {expected} bytes but {written} were written")]
    SizeMismatch { expected: u64, written: u64 },
    #[error("Write stopped after {bytes_written} bytes")]
    Cancelled { bytes_written: u64 },
}

impl WriteError {
    pub fn kind(&self) -> Option<FailureKind> {
        Some(match self {
            Self::Drive(e) => e.kind(),
            Self::Decompress(e) => return e.kind(),
            Self::DriveRemoved { .. } => FailureKind::DriveRemovedDuringWrite,
            Self::ProbablyDamaged { .. } => FailureKind::DriveProbablyDamaged,
            Self::MediaCheck(_) => FailureKind::UnexpectedMediaCheckError,
            Self::Corrupted { .. } | Self::SizeMismatch { .. } => {
                FailureKind::WrittenDataCorrupted
            }
            Self::Cancelled { .. } => return None,
        })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Cancelled { .. } | Self::Decompress(DecompressError::Cancelled)
        )
    }
}

#[derive(Debug, Error)]
pub enum HelperError {
    #[error(transparent)]
    Drive(#[from] DriveError),
    #[error("Helper I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("Malformed helper message: {0}")]
    Protocol(String),
    #[error("Helper speaks protocol {theirs}, we need {ours}")]
    VersionMismatch { ours: u32, theirs: u32 },
    #[error("Helper disconnected")]
    Disconnected,
}

impl HelperError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Drive(e) => e.kind(),
            Self::VersionMismatch { .. } | Self::Protocol(_) => FailureKind::HelperProtocolMismatch,
            Self::Io(_) | Self::Disconnected => FailureKind::HelperCrashed,
        }
    }
}

/// Commands the orchestrator refuses, and failures of the phase it ran
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Not possible while the variant is {0:?}")]
    NotReady(VariantStatus),
    #[error("Writing a {0} image is not possible")]
    WritingNotPossible(ContainerType),
    #[error("Invalid status transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: VariantStatus,
        to: VariantStatus,
    },
    #[error("Refusing to delete {} outside the downloads directory", .0.display())]
    OutsideDownloads(PathBuf),
    #[error("Failed to delete {}: {source}", .path.display())]
    Erase {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{0}")]
    Failed(Failure),
    #[error("Cancelled")]
    Cancelled,
}

impl OrchestratorError {
    /// Classification for display, if the error is one
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            Self::WritingNotPossible(_) => Some(FailureKind::UnsupportedContainer),
            Self::Failed(failure) => Some(failure.kind),
            _ => None,
        }
    }
}
