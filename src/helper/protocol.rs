//! Helper wire protocol
//!
//! JSON lines: one message per line, tagged by `type`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::catalog::ContainerType;
use crate::error::{FailureKind, HelperError};
use crate::flash::WritePhase;

pub const PROTOCOL_VERSION: u32 = 1;
/// Oldest peer version this build still talks to
pub const MIN_PROTOCOL_VERSION: u32 = 1;

/// What to write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub path: PathBuf,
    pub container: ContainerType,
    /// Decoded size, when the caller knows it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_size: Option<u64>,
}

/// Orchestrator to helper
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Hello {
        version: u32,
    },
    StartWrite {
        source: SourceDescriptor,
        drive_id: String,
        verify: bool,
    },
    Restore {
        drive_id: String,
    },
    Cancel,
}

/// Helper to orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Hello {
        version: u32,
    },
    Progress {
        bytes_written: u64,
        total_bytes: u64,
        phase: WritePhase,
    },
    Error {
        kind: FailureKind,
        detail: String,
    },
    Finished,
    Stopped {
        bytes_written: u64,
    },
    Restored,
}

impl Event {
    pub fn error(kind: FailureKind, detail: impl ToString) -> Self {
        Self::Error {
            kind,
            detail: detail.to_string(),
        }
    }

    /// Whether the job this event belongs to is over
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Error { .. } | Self::Finished | Self::Stopped { .. } | Self::Restored
        )
    }
}

/// Version both sides speak, or a mismatch if the peer is too old
pub fn negotiate(peer: u32) -> Result<u32, HelperError> {
    let version = peer.min(PROTOCOL_VERSION);
    if version < MIN_PROTOCOL_VERSION {
        return Err(HelperError::VersionMismatch {
            ours: PROTOCOL_VERSION,
            theirs: peer,
        });
    }
    Ok(version)
}

pub fn encode<T: Serialize>(message: &T) -> Result<String, HelperError> {
    let mut line = serde_json::to_string(message).map_err(|e| HelperError::Protocol(e.to_string()))?;
    line.push('\n');
    Ok(line)
}

pub fn decode<'a, T: Deserialize<'a>>(line: &'a str) -> Result<T, HelperError> {
    serde_json::from_str(line.trim_end()).map_err(|e| HelperError::Protocol(format!("{}: {}", e, line.trim_end())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_write_wire_format() {
        let request = Request::StartWrite {
            source: SourceDescriptor {
                path: PathBuf::from("/tmp/a.img.xz"),
                container: ContainerType::RawXz,
                expected_size: Some(42),
            },
            drive_id: "sdb".into(),
            verify: true,
        };
        let line = encode(&request).unwrap();
        assert!(line.ends_with('\n'));

        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "start_write");
        assert_eq!(value["source"]["container"], "xz-raw");
        assert_eq!(value["drive_id"], "sdb");

        assert_eq!(decode::<Request>(&line).unwrap(), request);
    }

    #[test]
    fn test_event_wire_format() {
        let line = encode(&Event::Progress {
            bytes_written: 10,
            total_bytes: 20,
            phase: WritePhase::Flushing,
        })
        .unwrap();
        assert_eq!(
            line.trim_end(),
            r#"{"type":"progress","bytes_written":10,"total_bytes":20,"phase":"flushing"}"#
        );

        let error: Event = decode(r#"{"type":"error","kind":"drive_too_small","detail":"x"}"#).unwrap();
        assert_eq!(error, Event::error(FailureKind::DriveTooSmall, "x"));
        assert!(error.is_terminal());
    }

    #[test]
    fn test_negotiation_takes_lower_version() {
        assert_eq!(negotiate(PROTOCOL_VERSION + 3).unwrap(), PROTOCOL_VERSION);
        assert_eq!(negotiate(PROTOCOL_VERSION).unwrap(), PROTOCOL_VERSION);
        assert!(matches!(
            negotiate(MIN_PROTOCOL_VERSION - 1),
            Err(HelperError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_garbage_is_protocol_error() {
        let err = decode::<Request>("not json").unwrap_err();
        assert_eq!(err.kind(), FailureKind::HelperProtocolMismatch);
    }
}
