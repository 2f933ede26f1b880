//! Media Writer - download OS images and write them to USB drives and SD cards
//!
//! The library holds the whole pipeline: catalog, resumable download,
//! streaming decompression, drive management, the privileged write helper
//! and the per-variant orchestrator. `main.rs` is a thin command-line front
//! end over it.

pub mod catalog;
pub mod config;
pub mod decompress;
pub mod devices;
pub mod download;
pub mod error;
pub mod flash;
pub mod helper;
pub mod logging;
pub mod orchestrator;
pub mod utils;
