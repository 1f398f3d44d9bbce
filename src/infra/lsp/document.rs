//! Document Session
//!
//! Open / wait / close lifecycle of one validated file on one backend.
//! A session that is dropped without [`DocumentSession::close`] closes the
//! document on a spawned task, so cancelled callers never leave it open.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;

use super::client::BackendInstance;
use super::collector::DiagnosticWaiter;
use super::protocol::LspDiagnostic;
use crate::error::LspError;
use crate::models::lsp::path_to_uri;

/// Bytes inspected for NUL when rejecting binary files
const BINARY_PROBE_LEN: usize = 8192;

#[derive(Debug, Clone, Default)]
pub struct DocumentState {
    pub uri: String,
    pub language_id: String,
    pub version: i32,
    /// Last snapshot received for this version, if any
    pub diagnostics: Option<Vec<LspDiagnostic>>,
}

pub struct DocumentSession {
    instance: Arc<BackendInstance>,
    state: DocumentState,
    waiter: DiagnosticWaiter,
    closed: bool,
}

impl DocumentSession {
    /// Read `path` and announce it to the backend.
    pub async fn open(
        instance: Arc<BackendInstance>,
        path: &Path,
        language_id: &str,
        max_bytes: u64,
    ) -> Result<Self, LspError> {
        let text = read_document(path, max_bytes).await?;
        let uri = path_to_uri(path);

        let opened = instance.open_document(&uri, language_id, &text).await?;
        tracing::debug!(
            "Opened {} v{} on {}",
            uri,
            opened.version,
            instance.command()
        );

        Ok(Self {
            instance,
            state: DocumentState {
                uri,
                language_id: language_id.to_string(),
                version: opened.version,
                diagnostics: None,
            },
            waiter: opened.waiter,
            closed: false,
        })
    }

    pub fn state(&self) -> &DocumentState {
        &self.state
    }

    /// Wait for this version's diagnostics
    pub async fn wait(
        &mut self,
        timeout: Duration,
        settle: Duration,
    ) -> Result<Vec<LspDiagnostic>, LspError> {
        let diagnostics = self.waiter.wait(timeout, settle).await?;
        self.state.diagnostics = Some(diagnostics.clone());
        Ok(diagnostics)
    }

    /// Send didClose (if this was the last reference) and drop bookkeeping
    pub async fn close(mut self) -> DocumentState {
        self.closed = true;
        self.instance.close_document(&self.state.uri).await;
        std::mem::take(&mut self.state)
    }
}

impl Drop for DocumentSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let uri = std::mem::take(&mut self.state.uri);
        let instance = Arc::clone(&self.instance);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    instance.close_document(&uri).await;
                });
            }
            Err(_) => tracing::warn!("Session for {} dropped outside runtime", uri),
        }
    }
}

/// Read a file for didOpen, rejecting oversized and binary content
pub async fn read_document(path: &Path, max_bytes: u64) -> Result<String, LspError> {
    let mut f = tokio::fs::File::open(path).await?;
    let file_size = f.metadata().await?.len();

    if max_bytes != u64::MAX && file_size > max_bytes {
        return Err(LspError::FileTooLarge {
            path: path.display().to_string(),
            size_mb: file_size / 1024 / 1024,
            limit_mb: max_bytes / 1024 / 1024,
        });
    }

    let mut bytes = Vec::with_capacity(file_size as usize);
    f.read_to_end(&mut bytes).await?;

    // NUL in the first 8KB means binary
    let probe = bytes.len().min(BINARY_PROBE_LEN);
    if bytes[..probe].contains(&0) {
        return Err(LspError::Protocol(format!(
            "Cannot validate binary file: {}",
            path.display()
        )));
    }

    String::from_utf8(bytes)
        .map_err(|_| LspError::Protocol(format!("File is not UTF-8: {}", path.display())))
}
