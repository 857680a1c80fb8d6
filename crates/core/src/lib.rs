//! Core crate for the drawanim render service: the render-host scheduler, the
//! gateway status sessions, and the envelope protocol between them.

pub mod config;
pub mod envelope;
pub mod logging;
pub mod rpc;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod workspace;
