//! Application container for langcheck

use std::path::PathBuf;
use std::sync::Arc;

use crate::cli::Cli;
use crate::config::RuntimeConfig;
use crate::infra::lsp::{BackendLauncher, BackendManager, BackendRegistry, ProcessLauncher};
use crate::infra::sandbox::PathSandbox;
use crate::models::config::ValidatorConfig;
use crate::server::{ServerConfig, ToolServer};
use crate::services::config::{ConfigService, DefaultConfigService};
use crate::services::validation::ValidationService;

pub struct App {
    pub(crate) config: ValidatorConfig,
    pub(crate) validation: Arc<ValidationService>,
    pub(crate) server: ServerConfig,
}

impl App {
    pub async fn from_cli(cli: &Cli) -> anyhow::Result<Self> {
        let config_service = DefaultConfigService::new(cli.config.as_deref());
        let mut config = config_service.load().await?;
        cli.apply(&mut config);
        tracing::debug!("Configuration loaded from {:?}", config_service.config_path());

        Self::with_config(config, &cli.allowed_dirs, Arc::new(ProcessLauncher))
    }

    pub fn with_config(
        config: ValidatorConfig,
        allowed_dirs: &[PathBuf],
        launcher: Arc<dyn BackendLauncher>,
    ) -> anyhow::Result<Self> {
        let sandbox = PathSandbox::new(allowed_dirs)?;
        let registry = BackendRegistry::with_entries(&config.backends)?;
        let runtime = RuntimeConfig::from(&config);
        let server = ServerConfig::new(&config.server, &runtime);

        let roots = sandbox.allowed_dirs().to_vec();
        let manager = Arc::new(BackendManager::new(launcher, runtime, roots));
        let validation = Arc::new(ValidationService::new(sandbox, registry, manager));

        tracing::info!(
            "langcheck initialized ({} allowed dir(s), {} extension(s))",
            allowed_dirs.len(),
            validation.registry().extensions().len()
        );

        Ok(Self {
            config,
            validation,
            server,
        })
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Serve the tool protocol on stdin/stdout until stdin closes
    pub async fn serve_stdio(self) -> anyhow::Result<()> {
        let server = ToolServer::new(self.validation, self.server);
        server.run(tokio::io::stdin(), tokio::io::stdout()).await?;
        Ok(())
    }
}
