//! Variant status and the transitions between them

use serde::{Deserialize, Serialize};

use crate::error::Failure;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantStatus {
    Preparing,
    Downloading,
    CheckingDownload,
    ReadyToWrite,
    Writing,
    CheckingWrittenData,
    Finished,
    DownloadFailed,
    WriteFailed,
}

impl VariantStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::DownloadFailed | Self::WriteFailed)
    }

    pub fn is_failed(self) -> bool {
        matches!(self, Self::DownloadFailed | Self::WriteFailed)
    }

    /// A download or write job is attached
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            Self::Downloading | Self::CheckingDownload | Self::Writing | Self::CheckingWrittenData
        )
    }

    pub fn can_transition_to(self, to: VariantStatus) -> bool {
        use VariantStatus::*;
        matches!(
            (self, to),
            (Preparing, Downloading)
                | (Preparing, CheckingDownload)
                | (Downloading, CheckingDownload)
                | (Downloading, DownloadFailed)
                | (CheckingDownload, ReadyToWrite)
                | (CheckingDownload, DownloadFailed)
                | (ReadyToWrite, Writing)
                | (ReadyToWrite, WriteFailed)
                | (Writing, CheckingWrittenData)
                | (Writing, WriteFailed)
                | (Writing, Finished)
                | (CheckingWrittenData, Finished)
                | (CheckingWrittenData, WriteFailed)
                | (DownloadFailed, Preparing)
                | (WriteFailed, ReadyToWrite)
                | (WriteFailed, Preparing)
                | (Finished, ReadyToWrite)
                | (Finished, Preparing)
        ) || (to == Preparing && !self.is_terminal() && self != Preparing)
    }
}

/// Everything a UI needs to render one variant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub status: VariantStatus,
    /// Bytes done in the current phase
    pub progress: u64,
    /// 0 when unknown
    pub total: u64,
    pub paused: bool,
    /// Why the variant is in a failed state
    pub failure: Option<Failure>,
    /// Drive a write is queued for
    pub delayed_write: Option<String>,
}
