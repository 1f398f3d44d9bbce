//! Infrastructure layer for langcheck
//!
//! Contains low-level implementations and external integrations.

pub mod lsp;
pub mod retry;
pub mod sandbox;

pub use sandbox::PathSandbox;
