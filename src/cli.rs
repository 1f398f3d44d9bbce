//! Command-line interface
//!
//! langcheck is launched by a tool-calling agent with the directories it may
//! validate files in; the tool protocol itself runs over stdin/stdout.

use std::path::PathBuf;

use clap::Parser;

use crate::models::config::ValidatorConfig;

const LONG_ABOUT: &str = r#"
langcheck - LSP-backed file validation for AI coding agents

Serves a single `validate` tool over newline-delimited JSON-RPC on stdio.
Each call opens the file in the language server registered for its
extension and returns the diagnostics that server publishes.

EXAMPLES:
  langcheck ~/work/project
  langcheck ~/work/api ~/work/web --diagnostics-timeout-ms 8000
  RUST_LOG=langcheck=trace langcheck . --config ./langcheck.toml

Logs go to stderr; stdout carries only protocol messages.
"#;

/// langcheck - LSP-backed file validation for AI coding agents
#[derive(Parser, Debug)]
#[command(name = "langcheck")]
#[command(author, version, about, long_about = LONG_ABOUT)]
pub struct Cli {
    /// Directories whose files may be validated
    #[arg(required = true, num_args = 1.., value_name = "ALLOWED_DIR")]
    pub allowed_dirs: Vec<PathBuf>,

    /// Config file layered over the global one
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// How long to wait for a backend to publish diagnostics
    #[arg(long, value_name = "MS")]
    pub diagnostics_timeout_ms: Option<u64>,

    /// Verbose output (debug logging)
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Apply flags that override the loaded configuration
    pub fn apply(&self, config: &mut ValidatorConfig) {
        if let Some(ms) = self.diagnostics_timeout_ms {
            config.lsp.diagnostics_timeout_ms = ms;
        }
    }

    pub fn log_filter(&self) -> &'static str {
        if self.verbose {
            "langcheck=debug"
        } else {
            "langcheck=info"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dirs_and_flags() {
        let cli = Cli::try_parse_from([
            "langcheck",
            "/repo",
            "/other",
            "--diagnostics-timeout-ms",
            "900",
            "-v",
        ])
        .unwrap();
        assert_eq!(
            cli.allowed_dirs,
            vec![PathBuf::from("/repo"), PathBuf::from("/other")]
        );
        assert!(cli.verbose);
        assert_eq!(cli.log_filter(), "langcheck=debug");

        let mut config = ValidatorConfig::default();
        cli.apply(&mut config);
        assert_eq!(config.lsp.diagnostics_timeout_ms, 900);
    }

    #[test]
    fn test_allowed_dir_is_required() {
        assert!(Cli::try_parse_from(["langcheck"]).is_err());
    }

    #[test]
    fn test_without_override_keeps_config() {
        let cli = Cli::try_parse_from(["langcheck", "/repo"]).unwrap();
        let mut config = ValidatorConfig::default();
        config.lsp.diagnostics_timeout_ms = 1234;
        cli.apply(&mut config);
        assert_eq!(config.lsp.diagnostics_timeout_ms, 1234);
        assert!(cli.config.is_none());
    }
}
