//! Error types for langcheck

use std::path::PathBuf;

use thiserror::Error;

pub type ValidatorResult<T> = std::result::Result<T, ValidatorError>;

#[derive(Debug, Error)]
pub enum ValidatorError {
    #[error("{0}")]
    Sandbox(#[from] SandboxError),

    #[error("{0}")]
    Lsp(#[from] LspError),

    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Path not in allowed directories: {}", .0.display())]
    NotAllowed(PathBuf),

    #[error("File does not exist: {}", .0.display())]
    NotFound(PathBuf),

    #[error("No allowed directories configured")]
    NoAllowedDirectories,
}

#[derive(Debug, Error)]
pub enum LspError {
    #[error("Unsupported file type: {0}")]
    UnsupportedExtension(String),

    #[error("Failed to start backend: {0}")]
    ServerStart(String),

    #[error("Backend '{command}' is unresponsive after {attempts} start attempt(s)")]
    Unresponsive { command: String, attempts: u32 },

    #[error("Backend not connected")]
    NotConnected,

    #[error("Backend '{command}' terminated unexpectedly")]
    ServerTerminated { command: String },

    #[error("{0}")]
    Timeout(String),

    #[error("Request cancelled")]
    RequestCancelled,

    #[error("Backend error [{code}]: {message}")]
    ServerError { code: i32, message: String },

    #[error("Malformed backend message: {0}")]
    Malformed(String),

    #[error("Backend reported invalid diagnostic severity {0} (expected 1-4)")]
    InvalidSeverity(i64),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("File too large ({size_mb}MB > {limit_mb}MB limit): {path}")]
    FileTooLarge {
        path: String,
        size_mb: u64,
        limit_mb: u64,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl LspError {
    const CANCELLED_ERROR_CODE: i32 = -32800;

    pub fn error_code(&self) -> i32 {
        match self {
            Self::ServerError { code, .. } => *code,
            Self::ServerTerminated { .. } => -32099,
            Self::Unresponsive { .. } => -32098,
            Self::Timeout(_) => -32001,
            Self::NotConnected => -32003,
            Self::RequestCancelled => Self::CANCELLED_ERROR_CODE,
            _ => -32000,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::RequestCancelled)
            || matches!(self, Self::ServerError { code, .. } if *code == Self::CANCELLED_ERROR_CODE)
    }

    /// Errors worth another attempt against a freshly started backend.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ServerTerminated { .. }
                | Self::NotConnected
                | Self::Timeout(_)
                | Self::Malformed(_)
                | Self::RequestCancelled
        ) || self.is_cancelled()
    }

    /// Errors meaning the backend process itself is gone or unusable.
    pub fn needs_restart(&self) -> bool {
        matches!(
            self,
            Self::ServerTerminated { .. } | Self::NotConnected | Self::Malformed(_)
        ) || self.is_server_shutdown()
    }

    fn is_server_shutdown(&self) -> bool {
        matches!(self, Self::ServerError { message, .. }
            if message.to_lowercase().contains("shutdown")
               || message.to_lowercase().contains("server stopped"))
    }

    pub fn server_error_friendly(code: i32, message: String) -> Self {
        let friendly_message = match code {
            -32601 => format!("Method not supported by backend: {}", message),
            -32002 => "Backend still initializing. Try again in a moment.".to_string(),
            _ => message,
        };

        Self::ServerError {
            code,
            message: friendly_message,
        }
    }
}

impl From<crate::infra::lsp::protocol::ResponseError> for LspError {
    fn from(err: crate::infra::lsp::protocol::ResponseError) -> Self {
        LspError::server_error_friendly(err.code, err.message)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config parse error: {0}")]
    Parse(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Invalid value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
