//! Backend process launching
//!
//! The manager never spawns processes directly; it asks a [`BackendLauncher`]
//! for a connected byte stream.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use super::registry::BackendConfig;
use super::transport::{BoxedReader, BoxedWriter};
use crate::error::LspError;

/// Connected stdio of a freshly launched backend
pub struct BackendIo {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    /// Owning handle, when the backend is a real child process
    pub child: Option<Child>,
}

#[async_trait]
pub trait BackendLauncher: Send + Sync {
    async fn launch(
        &self,
        config: &BackendConfig,
        workdir: Option<&Path>,
    ) -> Result<BackendIo, LspError>;
}

/// Spawns the backend command as a child process
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

#[async_trait]
impl BackendLauncher for ProcessLauncher {
    async fn launch(
        &self,
        config: &BackendConfig,
        workdir: Option<&Path>,
    ) -> Result<BackendIo, LspError> {
        let program = config
            .program()
            .ok_or_else(|| LspError::ServerStart("empty command".to_string()))?;

        tracing::info!("Starting backend: {}", config.display_command());

        let mut command = Command::new(program);
        command
            .args(config.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = workdir
            && dir.is_dir()
        {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| LspError::ServerStart(format!("{}: {}", config.display_command(), e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LspError::ServerStart("Failed to get stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LspError::ServerStart("Failed to get stdout".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            let name = config.display_command();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!("{} stderr: {}", name, line);
                }
            });
        }

        Ok(BackendIo {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            child: Some(child),
        })
    }
}
