//! Application configuration
//!
//! Compile-time constants grouped by subsystem, plus the runtime
//! [`Settings`] read from `settings.json`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{log_debug, log_warn};

const MODULE: &str = "config";

pub mod app {
    pub const NAME: &str = "media-writer";
    pub const USER_AGENT: &str = concat!("media-writer/", env!("CARGO_PKG_VERSION"));
    pub const SETTINGS_FILE: &str = "settings.json";
    /// Environment override for the helper binary location
    pub const HELPER_ENV: &str = "MEDIA_WRITER_HELPER";
}

pub mod download {
    /// Suffix of the temporary file a transfer writes into
    pub const PART_SUFFIX: &str = ".part";
    pub const MAX_RESUME_ATTEMPTS: u32 = 5;
    pub const RESUME_DELAY_MS: u64 = 1000;
    pub const CONNECT_TIMEOUT_SECS: u64 = 30;
    pub const STALL_TIMEOUT_SECS: u64 = 60;
    /// Below this much free space a failed write is reported as OutOfSpace
    pub const MIN_FREE_SPACE: u64 = 5 * 1024 * 1024;
    pub const HASH_BUFFER_SIZE: usize = 64 * 1024;
}

pub mod decompress {
    pub const CHUNK_SIZE: usize = 1024 * 1024;
    pub const READ_BUFFER_SIZE: usize = 4 * 1024 * 1024;
    /// Decoded chunks in flight between the decoder thread and the writer
    pub const QUEUE_DEPTH: usize = 4;
    /// 256MB memory limit for the xz decoder
    pub const XZ_MEMORY_LIMIT: u64 = 256 * 1024 * 1024;
}

pub mod flash {
    pub const MAX_CONSECUTIVE_WRITE_FAULTS: u32 = 3;
    pub const VERIFY_CHUNK_SIZE: usize = 1024 * 1024;
    pub const VERIFY_IO_TIMEOUT_SECS: u64 = 60;
}

pub mod devices {
    pub const POLL_INTERVAL_MS: u64 = 2500;
    pub const EVENT_CAPACITY: usize = 64;
}

pub mod progress {
    pub const EVENT_INTERVAL_MS: u64 = 100;
}

pub mod logging {
    pub const DOWNLOAD_LOG_INTERVAL_MB: u64 = 50;
    pub const FLASH_LOG_INTERVAL_MB: u64 = 100;
    pub const VERIFY_LOG_INTERVAL_MB: u64 = 100;
}

/// User-tunable settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub developer_mode: bool,
    pub downloads_dir: Option<PathBuf>,
    pub max_resume_attempts: u32,
    pub resume_delay_ms: u64,
    pub connect_timeout_secs: u64,
    pub stall_timeout_secs: u64,
    pub verify_io_timeout_secs: u64,
    pub progress_interval_ms: u64,
    pub drive_poll_interval_ms: u64,
    pub helper_path: Option<PathBuf>,
    pub verify_writes: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            developer_mode: false,
            downloads_dir: None,
            max_resume_attempts: download::MAX_RESUME_ATTEMPTS,
            resume_delay_ms: download::RESUME_DELAY_MS,
            connect_timeout_secs: download::CONNECT_TIMEOUT_SECS,
            stall_timeout_secs: download::STALL_TIMEOUT_SECS,
            verify_io_timeout_secs: flash::VERIFY_IO_TIMEOUT_SECS,
            progress_interval_ms: progress::EVENT_INTERVAL_MS,
            drive_poll_interval_ms: devices::POLL_INTERVAL_MS,
            helper_path: None,
            verify_writes: true,
        }
    }
}

impl Settings {
    /// Default location of the settings file
    pub fn default_path() -> PathBuf {
        crate::utils::get_config_dir(app::NAME).join(app::SETTINGS_FILE)
    }

    /// Load settings from the default location
    pub fn load_default() -> Self {
        Self::load(&Self::default_path())
    }

    /// Load settings from `path`. A missing file yields defaults, a malformed
    /// one is logged and ignored.
    pub fn load(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                log_debug!(MODULE, "No settings at {}: {}", path.display(), e);
                return Self::default();
            }
        };

        match serde_json::from_str(&content) {
            Ok(settings) => settings,
            Err(e) => {
                log_warn!(
                    MODULE,
                    "Ignoring malformed settings file {}: {}",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Directory downloaded images are stored in
    pub fn downloads_dir(&self) -> PathBuf {
        self.downloads_dir
            .clone()
            .unwrap_or_else(crate::utils::get_downloads_dir)
    }

    pub fn resume_delay(&self) -> Duration {
        Duration::from_millis(self.resume_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn verify_io_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_io_timeout_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn drive_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drive_poll_interval_ms)
    }
}
