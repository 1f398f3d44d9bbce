//! Runtime configuration derived from the loaded config file

use std::time::Duration;

use crate::infra::retry::RetryConfig;
use crate::models::config::ValidatorConfig;

/// Allowance for stopping a backend whose start attempt failed
const STOP_ALLOWANCE: Duration = Duration::from_secs(7);
/// Slack between the last backend deadline and the tool-call deadline
const RESPONSE_MARGIN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    Request,
    Initialization,
    Shutdown,
}

impl OperationType {
    pub fn from_method(method: &str) -> Self {
        match method {
            "initialize" => Self::Initialization,
            "shutdown" => Self::Shutdown,
            _ => Self::Request,
        }
    }

    fn base_multiplier(self) -> f64 {
        match self {
            Self::Request => 1.0,
            Self::Initialization => 2.0,
            Self::Shutdown => 0.5,
        }
    }
}

/// Immutable timeouts and policies shared by the LSP layer
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub base_timeout: Duration,
    pub diagnostics_timeout: Duration,
    pub settle: Duration,
    pub silence_is_clean: bool,
    pub max_restarts: u32,
    pub retention: Duration,
    pub max_file_size_bytes: u64,
    pub auto_restart: bool,
    pub restart_backoff: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from(&ValidatorConfig::default())
    }
}

impl From<&ValidatorConfig> for RuntimeConfig {
    fn from(config: &ValidatorConfig) -> Self {
        Self {
            base_timeout: Duration::from_secs(config.lsp.timeout_secs),
            diagnostics_timeout: Duration::from_millis(config.lsp.diagnostics_timeout_ms),
            settle: Duration::from_millis(config.lsp.settle_ms),
            silence_is_clean: config.lsp.silence_is_clean,
            max_restarts: config.lsp.max_restarts,
            retention: Duration::from_secs(config.lsp.retention_secs),
            max_file_size_bytes: config.lsp.max_file_size_bytes(),
            auto_restart: config.lsp.auto_restart,
            restart_backoff: Duration::from_millis(200),
        }
    }
}

impl RuntimeConfig {
    pub fn timeout_for(&self, method: &str) -> Duration {
        let multiplier = OperationType::from_method(method).base_multiplier();
        Duration::try_from_secs_f64(self.base_timeout.as_secs_f64() * multiplier)
            .unwrap_or(Duration::MAX)
    }

    /// Worst case for one `ensure_ready`: every start attempt runs into the
    /// initialize timeout and is then stopped.
    pub fn start_budget(&self) -> Duration {
        let attempts = self.start_attempts();
        self.timeout_for("initialize")
            .saturating_add(STOP_ALLOWANCE)
            .saturating_mul(attempts)
            .saturating_add(RetryConfig::for_backend_start(self).total_backoff())
    }

    /// Upper bound for a whole validation, including restarts after a
    /// backend dies mid-session. Tool calls are cut off after this.
    pub fn validation_budget(&self) -> Duration {
        let session = self
            .diagnostics_timeout
            .saturating_add(self.timeout_for("textDocument/didOpen"))
            .saturating_add(self.restart_backoff);
        self.start_budget()
            .saturating_add(session)
            .saturating_mul(self.start_attempts())
            .saturating_add(RESPONSE_MARGIN)
    }

    /// Total start attempts for a backend that has not failed before
    pub fn start_attempts(&self) -> u32 {
        if self.auto_restart {
            self.max_restarts.saturating_add(1)
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_calculation() {
        let config = RuntimeConfig::default();
        assert_eq!(
            config.timeout_for("textDocument/diagnostic"),
            Duration::from_secs(30)
        );
        assert_eq!(config.timeout_for("initialize"), Duration::from_secs(60));
        assert_eq!(config.timeout_for("shutdown"), Duration::from_secs(15));
    }

    #[test]
    fn test_operation_type_parsing() {
        assert_eq!(
            OperationType::from_method("textDocument/didOpen"),
            OperationType::Request
        );
        assert_eq!(
            OperationType::from_method("initialize"),
            OperationType::Initialization
        );
        assert_eq!(
            OperationType::from_method("shutdown"),
            OperationType::Shutdown
        );
    }

    #[test]
    fn test_start_attempts_respects_auto_restart() {
        let mut config = RuntimeConfig::default();
        assert_eq!(config.start_attempts(), 3);
        config.auto_restart = false;
        assert_eq!(config.start_attempts(), 1);
    }

    #[test]
    fn test_huge_timeouts_saturate() {
        let config = RuntimeConfig {
            base_timeout: Duration::from_secs(u64::MAX),
            diagnostics_timeout: Duration::from_millis(u64::MAX),
            ..RuntimeConfig::default()
        };
        assert_eq!(config.timeout_for("initialize"), Duration::MAX);
        assert_eq!(config.validation_budget(), Duration::MAX);
    }

    #[test]
    fn test_validation_budget_covers_every_start_attempt() {
        let config = RuntimeConfig::default();
        let initialize = config.timeout_for("initialize");
        assert!(config.start_budget() >= initialize * config.start_attempts());
        assert!(
            config.validation_budget()
                > config.start_budget() + config.diagnostics_timeout
        );

        let single = RuntimeConfig {
            auto_restart: false,
            ..RuntimeConfig::default()
        };
        assert!(single.start_budget() < config.start_budget());
    }

    #[test]
    fn test_from_validator_config() {
        let mut file = ValidatorConfig::default();
        file.lsp.diagnostics_timeout_ms = 250;
        file.lsp.silence_is_clean = false;
        let runtime = RuntimeConfig::from(&file);
        assert_eq!(runtime.diagnostics_timeout, Duration::from_millis(250));
        assert!(!runtime.silence_is_clean);
    }
}
