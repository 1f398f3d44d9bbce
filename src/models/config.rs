//! Configuration model for langcheck

use serde::{Deserialize, Serialize};

/// langcheck configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ValidatorConfig {
    #[serde(default)]
    pub lsp: LspConfig,

    #[serde(default)]
    pub server: ServerSettings,

    /// Extra or overriding backend table entries
    #[serde(default)]
    pub backends: Vec<BackendEntry>,
}

/// LSP session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LspConfig {
    /// Base request timeout; scaled per method
    #[serde(default = "defaults::timeout_secs")]
    pub timeout_secs: u64,

    /// How long to wait for a publishDiagnostics after opening a document
    #[serde(default = "defaults::diagnostics_timeout_ms")]
    pub diagnostics_timeout_ms: u64,

    /// Quiet period after a publish before the snapshot is considered final
    #[serde(default = "defaults::settle_ms")]
    pub settle_ms: u64,

    /// Treat a backend that never publishes as "no issues"
    #[serde(default = "defaults::silence_is_clean")]
    pub silence_is_clean: bool,

    /// Restarts attempted after the first failed start before giving up
    #[serde(default = "defaults::max_restarts")]
    pub max_restarts: u32,

    /// How long publishes for unawaited documents are kept
    #[serde(default = "defaults::retention_secs")]
    pub retention_secs: u64,

    #[serde(default = "defaults::max_file_size_mb")]
    pub max_file_size_mb: u32,

    #[serde(default = "defaults::auto_restart")]
    pub auto_restart: bool,
}

impl Default for LspConfig {
    fn default() -> Self {
        Self {
            timeout_secs: defaults::timeout_secs(),
            diagnostics_timeout_ms: defaults::diagnostics_timeout_ms(),
            settle_ms: defaults::settle_ms(),
            silence_is_clean: defaults::silence_is_clean(),
            max_restarts: defaults::max_restarts(),
            retention_secs: defaults::retention_secs(),
            max_file_size_mb: defaults::max_file_size_mb(),
            auto_restart: defaults::auto_restart(),
        }
    }
}

impl LspConfig {
    pub fn max_file_size_bytes(&self) -> u64 {
        if self.max_file_size_mb == 0 {
            u64::MAX
        } else {
            self.max_file_size_mb as u64 * 1024 * 1024
        }
    }
}

/// Tool server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "defaults::max_concurrent")]
    pub max_concurrent: usize,

    /// Stop backends unused for this long (0 disables)
    #[serde(default = "defaults::idle_timeout_mins")]
    pub idle_timeout_mins: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            max_concurrent: defaults::max_concurrent(),
            idle_timeout_mins: defaults::idle_timeout_mins(),
        }
    }
}

/// One row of the extension → backend table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendEntry {
    /// Extension this row is looked up by, including the leading dot
    pub extension: String,
    pub command: Vec<String>,
    /// Extensions the backend handles; defaults to `[extension]`
    #[serde(default)]
    pub extensions: Vec<String>,
    pub language_id: String,
}

mod defaults {
    // LSP
    pub fn timeout_secs() -> u64 {
        30
    }
    pub fn diagnostics_timeout_ms() -> u64 {
        5000
    }
    pub fn settle_ms() -> u64 {
        150
    }
    pub fn silence_is_clean() -> bool {
        true
    }
    pub fn max_restarts() -> u32 {
        2
    }
    pub fn retention_secs() -> u64 {
        30
    }
    pub fn max_file_size_mb() -> u32 {
        10
    }
    pub fn auto_restart() -> bool {
        true
    }

    // Server
    pub fn max_concurrent() -> usize {
        16
    }
    pub fn idle_timeout_mins() -> u64 {
        30
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ValidatorConfig::default();
        assert_eq!(config.lsp.timeout_secs, 30);
        assert_eq!(config.lsp.diagnostics_timeout_ms, 5000);
        assert!(config.lsp.silence_is_clean);
        assert_eq!(config.lsp.max_restarts, 2);
        assert_eq!(config.server.max_concurrent, 16);
        assert!(config.backends.is_empty());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: ValidatorConfig = toml::from_str(
            r#"
            [lsp]
            diagnostics_timeout_ms = 1500
            silence_is_clean = false

            [[backends]]
            extension = ".rs"
            command = ["rust-analyzer"]
            language_id = "rust"
            "#,
        )
        .unwrap();

        assert_eq!(config.lsp.diagnostics_timeout_ms, 1500);
        assert!(!config.lsp.silence_is_clean);
        assert_eq!(config.lsp.timeout_secs, 30);
        assert_eq!(config.backends.len(), 1);
        assert_eq!(config.backends[0].command, vec!["rust-analyzer"]);
        assert!(config.backends[0].extensions.is_empty());
    }

    #[test]
    fn test_unlimited_file_size() {
        let lsp = LspConfig {
            max_file_size_mb: 0,
            ..Default::default()
        };
        assert_eq!(lsp.max_file_size_bytes(), u64::MAX);
    }
}
