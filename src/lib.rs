//! langcheck - LSP-backed file validation library
//!
//! Authorizes a path, routes it by extension to a long-lived language
//! server, and collects the diagnostics that server publishes.

pub mod app;
pub mod cli;
pub mod config;
pub mod error;
pub mod infra;
pub mod models;
pub mod server;
pub mod services;

pub use error::{LspError, SandboxError, ValidatorError, ValidatorResult};
