//! Configuration service for langcheck

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::ConfigError;
use crate::models::config::ValidatorConfig;

#[async_trait]
pub trait ConfigService: Send + Sync {
    async fn load(&self) -> Result<ValidatorConfig, ConfigError>;
    fn config_path(&self) -> PathBuf;
}

pub struct DefaultConfigService {
    global: PathBuf,
    explicit: Option<PathBuf>,
}

impl DefaultConfigService {
    /// Global config plus an optional `--config` overlay
    pub fn new(explicit: Option<&Path>) -> Self {
        Self {
            global: Self::global_config_path(),
            explicit: explicit.map(Path::to_path_buf),
        }
    }

    pub fn with_global_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.global = path.into();
        self
    }

    fn global_config_path() -> PathBuf {
        // XDG standard: ~/.config/langcheck/config.toml
        std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .ok()
            .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("langcheck")
            .join("config.toml")
    }

    async fn load_from_path(path: &Path) -> Result<ValidatorConfig, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        toml::from_str(&content)
            .map_err(|e| ConfigError::Parse(format!("{}: {}", path.display(), e)))
    }
}

#[async_trait]
impl ConfigService for DefaultConfigService {
    async fn load(&self) -> Result<ValidatorConfig, ConfigError> {
        let mut config = if self.global.exists() {
            Self::load_from_path(&self.global).await?
        } else {
            ValidatorConfig::default()
        };

        if let Some(path) = &self.explicit {
            if !path.exists() {
                return Err(ConfigError::NotFound(format!(
                    "Config file does not exist: {}",
                    path.display()
                )));
            }
            let overlay = Self::load_from_path(path).await?;
            config = merge_config(config, overlay);
        }

        Ok(apply_env_overrides(config, |key| std::env::var(key).ok()))
    }

    fn config_path(&self) -> PathBuf {
        self.explicit.clone().unwrap_or_else(|| self.global.clone())
    }
}

fn merge_config(base: ValidatorConfig, overlay: ValidatorConfig) -> ValidatorConfig {
    let mut backends = base.backends;
    backends.extend(overlay.backends);
    ValidatorConfig {
        lsp: overlay.lsp,
        server: overlay.server,
        backends,
    }
}

fn apply_env_overrides(
    mut config: ValidatorConfig,
    var: impl Fn(&str) -> Option<String>,
) -> ValidatorConfig {
    if let Some(val) = var("LANGCHECK_LSP_TIMEOUT")
        && let Ok(timeout) = val.parse()
    {
        config.lsp.timeout_secs = timeout;
    }
    if let Some(val) = var("LANGCHECK_DIAGNOSTICS_TIMEOUT_MS")
        && let Ok(ms) = val.parse()
    {
        config.lsp.diagnostics_timeout_ms = ms;
    }
    if let Some(val) = var("LANGCHECK_SILENCE_IS_CLEAN") {
        match val.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => config.lsp.silence_is_clean = true,
            "0" | "false" | "no" => config.lsp.silence_is_clean = false,
            other => tracing::warn!("Ignoring LANGCHECK_SILENCE_IS_CLEAN={}", other),
        }
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test]
    async fn test_missing_global_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let service =
            DefaultConfigService::new(None).with_global_path(dir.path().join("none.toml"));
        let config = service.load().await.unwrap();
        assert_eq!(config.lsp.diagnostics_timeout_ms, 5000);
        assert!(config.backends.is_empty());
    }

    #[tokio::test]
    async fn test_explicit_overlays_global() {
        let dir = TempDir::new().unwrap();
        let global = write(
            &dir,
            "global.toml",
            r#"
            [[backends]]
            extension = ".rs"
            command = ["rust-analyzer"]
            language_id = "rust"
            "#,
        );
        let explicit = write(
            &dir,
            "local.toml",
            r#"
            [lsp]
            settle_ms = 40

            [[backends]]
            extension = ".go"
            command = ["gopls"]
            language_id = "go"
            "#,
        );

        let service = DefaultConfigService::new(Some(&explicit)).with_global_path(global);
        let config = service.load().await.unwrap();
        assert_eq!(config.lsp.settle_ms, 40);
        let extensions: Vec<_> = config.backends.iter().map(|b| b.extension.as_str()).collect();
        assert_eq!(extensions, vec![".rs", ".go"]);
        assert_eq!(service.config_path(), explicit);
    }

    #[tokio::test]
    async fn test_missing_explicit_is_an_error() {
        let dir = TempDir::new().unwrap();
        let service = DefaultConfigService::new(Some(&dir.path().join("absent.toml")))
            .with_global_path(dir.path().join("none.toml"));
        assert!(matches!(service.load().await, Err(ConfigError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_malformed_file_reports_path() {
        let dir = TempDir::new().unwrap();
        let global = write(&dir, "bad.toml", "[lsp\n");
        let service = DefaultConfigService::new(None).with_global_path(&global);
        match service.load().await {
            Err(ConfigError::Parse(message)) => assert!(message.contains("bad.toml")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_env_overrides() {
        let config = apply_env_overrides(ValidatorConfig::default(), |key| match key {
            "LANGCHECK_LSP_TIMEOUT" => Some("7".to_string()),
            "LANGCHECK_DIAGNOSTICS_TIMEOUT_MS" => Some("250".to_string()),
            "LANGCHECK_SILENCE_IS_CLEAN" => Some("false".to_string()),
            _ => None,
        });
        assert_eq!(config.lsp.timeout_secs, 7);
        assert_eq!(config.lsp.diagnostics_timeout_ms, 250);
        assert!(!config.lsp.silence_is_clean);
    }

    #[test]
    fn test_unparsable_env_values_are_ignored() {
        let config = apply_env_overrides(ValidatorConfig::default(), |key| match key {
            "LANGCHECK_LSP_TIMEOUT" => Some("soon".to_string()),
            "LANGCHECK_SILENCE_IS_CLEAN" => Some("maybe".to_string()),
            _ => None,
        });
        assert_eq!(config.lsp.timeout_secs, 30);
        assert!(config.lsp.silence_is_clean);
    }
}
