//! LSP backend plumbing
//!
//! - JSON-RPC 2.0 protocol types and Content-Length framing
//! - Extension → backend registry
//! - Backend instances with atomic request IDs and a reader task each
//! - Manager sharing one process per command line
//! - Document sessions and the diagnostics collector feeding them

pub mod client;
pub mod collector;
pub mod document;
pub mod launcher;
pub mod manager;
pub mod protocol;
pub mod registry;
pub mod transport;

#[cfg(test)]
pub(crate) mod fake;

pub use client::{BackendInstance, BackendState};
pub use collector::{DiagnosticCollector, DiagnosticWaiter};
pub use document::{DocumentSession, DocumentState};
pub use launcher::{BackendIo, BackendLauncher, ProcessLauncher};
pub use manager::BackendManager;
pub use registry::{BackendConfig, BackendKey, BackendRegistry};
