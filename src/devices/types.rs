//! Drive types

use serde::{Deserialize, Serialize};

use crate::utils::format_size;

/// Restore state of a drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStatus {
    /// Nothing to restore
    Clean,
    /// A live system was written to it
    ContainsLive,
    Restoring,
    /// Restored to factory layout during this session
    Restored,
    Failed,
}

/// A removable drive as seen by the platform backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Drive {
    /// Platform identifier (UDisks object path, `\\.\PhysicalDriveN`, ...)
    pub id: String,
    /// Device node used for raw access
    pub device: String,
    pub label: String,
    pub capacity: u64,
    pub removable: bool,
    pub restore_status: RestoreStatus,
    /// Reserved by a write or restore job
    pub locked: bool,
}

impl Drive {
    pub fn contains_live(&self) -> bool {
        self.restore_status == RestoreStatus::ContainsLive
    }

    pub fn display_name(&self) -> String {
        format!("{} ({})", self.label, format_size(self.capacity))
    }
}
