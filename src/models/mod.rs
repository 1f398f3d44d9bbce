//! Data models for langcheck
//!
//! Contains core type definitions used throughout the application.

pub mod config;
pub mod diagnostic;
pub mod lsp;

// Re-export commonly used types
pub use config::{BackendEntry, ValidatorConfig};
pub use diagnostic::{Diagnostic, DiagnosticSeverity, ValidationResult};
pub use lsp::{Position, Range};
