//! Validation Orchestrator
//!
//! authorize → lookup → ensure ready → open → await → close → result.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::RuntimeConfig;
use crate::error::{LspError, ValidatorError};
use crate::infra::lsp::protocol::LspDiagnostic;
use crate::infra::lsp::{BackendInstance, BackendManager, BackendRegistry, DocumentSession};
use crate::infra::sandbox::PathSandbox;
use crate::models::diagnostic::{Diagnostic, ValidationResult};

#[async_trait]
pub trait Validator: Send + Sync {
    /// Validate one file; failures are reported inside the result
    async fn validate(&self, file_path: &str) -> ValidationResult;

    /// Stop backends unused for longer than `idle`
    async fn reap_idle(&self, _idle: std::time::Duration) -> usize {
        0
    }

    async fn shutdown(&self) {}
}

pub struct ValidationService {
    sandbox: PathSandbox,
    registry: BackendRegistry,
    manager: Arc<BackendManager>,
}

impl ValidationService {
    pub fn new(
        sandbox: PathSandbox,
        registry: BackendRegistry,
        manager: Arc<BackendManager>,
    ) -> Self {
        Self {
            sandbox,
            registry,
            manager,
        }
    }

    pub fn manager(&self) -> &Arc<BackendManager> {
        &self.manager
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Same pipeline as [`Validator::validate`], with the error kept typed
    pub async fn try_validate(&self, file_path: &str) -> Result<Vec<Diagnostic>, ValidatorError> {
        let path = self.sandbox.authorize(Path::new(file_path))?;
        let config = self.registry.lookup_path(&path)?;
        let runtime = self.manager.runtime();

        let published = self
            .manager
            .execute_with_retry(config, |instance| {
                run_session(instance, &path, &config.language_id, runtime)
            })
            .await?;

        let diagnostics = published
            .into_iter()
            .map(Diagnostic::from_lsp)
            .collect::<Result<Vec<_>, LspError>>()?;
        Ok(diagnostics)
    }
}

/// One open → wait → close round on `instance`; close runs on every path
async fn run_session(
    instance: Arc<BackendInstance>,
    path: &Path,
    language_id: &str,
    runtime: &RuntimeConfig,
) -> Result<Vec<LspDiagnostic>, LspError> {
    let mut session =
        DocumentSession::open(instance, path, language_id, runtime.max_file_size_bytes).await?;
    let outcome = session
        .wait(runtime.diagnostics_timeout, runtime.settle)
        .await;
    let state = session.close().await;

    match outcome {
        Err(LspError::Timeout(_)) if runtime.silence_is_clean => {
            tracing::debug!(
                "No diagnostics for {} v{} within {:?}, treating as clean",
                state.uri,
                state.version,
                runtime.diagnostics_timeout
            );
            Ok(Vec::new())
        }
        other => other,
    }
}

#[async_trait]
impl Validator for ValidationService {
    async fn validate(&self, file_path: &str) -> ValidationResult {
        match self.try_validate(file_path).await {
            Ok(diagnostics) => {
                tracing::info!("{}: {} diagnostic(s)", file_path, diagnostics.len());
                ValidationResult::success(file_path, diagnostics)
            }
            Err(e) => {
                match &e {
                    ValidatorError::Sandbox(_) => tracing::info!("{}: {}", file_path, e),
                    _ => tracing::warn!("{}: {}", file_path, e),
                }
                ValidationResult::failure(file_path, e.to_string())
            }
        }
    }

    async fn reap_idle(&self, idle: std::time::Duration) -> usize {
        self.manager.cleanup_idle(idle).await
    }

    async fn shutdown(&self) {
        self.manager.shutdown_all().await;
    }
}
