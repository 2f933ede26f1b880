//! Privileged helper
//!
//! Raw device access happens in a worker that only talks to the orchestrator
//! through versioned messages.

pub mod protocol;
mod transport;
mod worker;

pub use protocol::{Event, Request, SourceDescriptor, PROTOCOL_VERSION};
pub use transport::{
    locate_helper, serve_io, serve_stdio, HelperClient, HelperControl, HelperLauncher,
};
pub use worker::{serve, WorkerSettings};
