//! Backend Process Manager
//!
//! One live backend per distinct command line, with race-safe start,
//! bounded restarts and idle reaping.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::{Mutex, Notify, RwLock};

use super::client::{BackendInstance, BackendState};
use super::launcher::BackendLauncher;
use super::registry::{BackendConfig, BackendKey};
use crate::config::RuntimeConfig;
use crate::error::LspError;
use crate::infra::retry::{RetryConfig, with_retry};

enum Slot {
    Initializing(Arc<Notify>),
    Ready {
        instance: Arc<BackendInstance>,
        last_used: Instant,
    },
}

impl Slot {
    fn ready(instance: Arc<BackendInstance>) -> Self {
        Self::Ready {
            instance,
            last_used: Instant::now(),
        }
    }

    fn touch(&mut self) {
        if let Self::Ready { last_used, .. } = self {
            *last_used = Instant::now();
        }
    }

    fn idle_duration(&self) -> Duration {
        match self {
            Self::Ready { last_used, .. } => last_used.elapsed(),
            Self::Initializing(_) => Duration::ZERO,
        }
    }

    fn instance(&self) -> Option<Arc<BackendInstance>> {
        match self {
            Self::Ready { instance, .. } => Some(Arc::clone(instance)),
            Self::Initializing(_) => None,
        }
    }
}

type Slots = Arc<RwLock<HashMap<BackendKey, Slot>>>;

/// Clears an `Initializing` slot if the start task dies before finishing
struct StartGuard {
    slots: Slots,
    key: BackendKey,
    notify: Arc<Notify>,
    armed: bool,
}

impl StartGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StartGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let slots = Arc::clone(&self.slots);
        let key = self.key.clone();
        let notify = Arc::clone(&self.notify);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let mut slots = slots.write().await;
                if matches!(slots.get(&key), Some(Slot::Initializing(n)) if Arc::ptr_eq(n, &notify))
                {
                    slots.remove(&key);
                }
                notify.notify_waiters();
            });
        }
    }
}

/// Commands whose restart budget ran out; next start is a single attempt
type Unavailable = Arc<Mutex<HashSet<BackendKey>>>;

/// Everything one start needs, owned so it can run on its own task
struct StartJob {
    launcher: Arc<dyn BackendLauncher>,
    runtime: RuntimeConfig,
    roots: Vec<PathBuf>,
    slots: Slots,
    unavailable: Unavailable,
    config: BackendConfig,
    key: BackendKey,
    notify: Arc<Notify>,
}

impl StartJob {
    async fn run(self) -> Result<Arc<BackendInstance>, LspError> {
        let guard = StartGuard {
            slots: Arc::clone(&self.slots),
            key: self.key.clone(),
            notify: Arc::clone(&self.notify),
            armed: true,
        };

        let retry = if self.unavailable.lock().await.remove(&self.key) {
            RetryConfig::no_retry()
        } else {
            RetryConfig::for_backend_start(&self.runtime)
        };

        let command = self.config.display_command();
        let result = match with_retry(&retry, || self.spawn_once()).await {
            Ok(instance) => Ok(instance),
            Err(e) if e.is_recoverable() => {
                tracing::error!(
                    "{} unresponsive after {} attempt(s): {}",
                    command,
                    retry.max_attempts,
                    e
                );
                self.unavailable.lock().await.insert(self.key.clone());
                Err(LspError::Unresponsive {
                    command,
                    attempts: retry.max_attempts,
                })
            }
            Err(e) => Err(e),
        };

        {
            let mut slots = self.slots.write().await;
            match &result {
                Ok(instance) => {
                    slots.insert(self.key.clone(), Slot::ready(Arc::clone(instance)));
                }
                Err(_) => {
                    slots.remove(&self.key);
                }
            }
        }
        guard.disarm();
        self.notify.notify_waiters();

        result
    }

    async fn spawn_once(&self) -> Result<Arc<BackendInstance>, LspError> {
        let workdir = self.roots.first().map(PathBuf::as_path);
        let io = self.launcher.launch(&self.config, workdir).await?;

        let instance = BackendInstance::new(
            self.config.clone(),
            self.runtime.clone(),
            self.roots.clone(),
        );
        match instance.start(io).await {
            Ok(()) => Ok(instance),
            Err(e) => {
                instance.shutdown().await;
                Err(e)
            }
        }
    }
}

pub struct BackendManager {
    launcher: Arc<dyn BackendLauncher>,
    runtime: RuntimeConfig,
    roots: Vec<PathBuf>,
    slots: Slots,
    unavailable: Unavailable,
}

impl BackendManager {
    pub fn new(
        launcher: Arc<dyn BackendLauncher>,
        runtime: RuntimeConfig,
        roots: Vec<PathBuf>,
    ) -> Self {
        Self {
            launcher,
            runtime,
            roots,
            slots: Arc::new(RwLock::new(HashMap::new())),
            unavailable: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn runtime(&self) -> &RuntimeConfig {
        &self.runtime
    }

    /// Get or start the backend for `config` (race-safe, deadlock-free)
    pub async fn ensure_ready(
        &self,
        config: &BackendConfig,
    ) -> Result<Arc<BackendInstance>, LspError> {
        let key = config.key();
        loop {
            // Phase 1: Get instance or notify under lock, release immediately
            let (instance_opt, notify_opt) = {
                let slots = self.slots.read().await;
                match slots.get(&key) {
                    Some(Slot::Ready { instance, .. }) => (Some(Arc::clone(instance)), None),
                    Some(Slot::Initializing(notify)) => (None, Some(Arc::clone(notify))),
                    None => (None, None),
                }
            };

            // Phase 2: Check health outside lock
            if let Some(instance) = instance_opt {
                if instance.is_healthy().await {
                    if let Some(slot) = self.slots.write().await.get_mut(&key) {
                        slot.touch();
                    }
                    return Ok(instance);
                }
                tracing::info!(
                    "{} is {}, replacing",
                    instance.command(),
                    instance.state()
                );
                self.retire(&key, &instance).await;
                continue;
            }

            // Phase 3: Wait for an in-flight start
            if let Some(notify) = notify_opt {
                let notified = notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                let still_starting = matches!(
                    self.slots.read().await.get(&key),
                    Some(Slot::Initializing(n)) if Arc::ptr_eq(n, &notify)
                );
                if still_starting {
                    notified.await;
                }
                continue;
            }

            // Phase 4: Start new instance
            let notify = Arc::new(Notify::new());
            {
                let mut slots = self.slots.write().await;
                if slots.contains_key(&key) {
                    continue; // Race: another task started, retry
                }
                slots.insert(key.clone(), Slot::Initializing(Arc::clone(&notify)));
            }

            // The start runs detached so a cancelled caller cannot cut the
            // restart bookkeeping short
            let job = StartJob {
                launcher: Arc::clone(&self.launcher),
                runtime: self.runtime.clone(),
                roots: self.roots.clone(),
                slots: Arc::clone(&self.slots),
                unavailable: Arc::clone(&self.unavailable),
                config: config.clone(),
                key,
                notify,
            };
            return tokio::spawn(job.run()).await.unwrap_or_else(|e| {
                Err(LspError::ServerStart(format!(
                    "{}: start task failed: {}",
                    config.display_command(),
                    e
                )))
            });
        }
    }

    /// Remove `instance` from its slot (if still there) and stop it
    async fn retire(&self, key: &BackendKey, instance: &Arc<BackendInstance>) {
        {
            let mut slots = self.slots.write().await;
            if matches!(
                slots.get(key),
                Some(Slot::Ready { instance: current, .. }) if Arc::ptr_eq(current, instance)
            ) {
                slots.remove(key);
            }
        }
        instance.shutdown().await;
    }

    /// Run `op` against a ready backend, restarting it when the backend
    /// dies mid-operation, within the restart budget.
    pub async fn execute_with_retry<F, T, Fut>(
        &self,
        config: &BackendConfig,
        op: F,
    ) -> Result<T, LspError>
    where
        F: Fn(Arc<BackendInstance>) -> Fut,
        Fut: Future<Output = Result<T, LspError>>,
    {
        let attempts = self.runtime.start_attempts();
        let mut attempt = 1;
        loop {
            let instance = self.ensure_ready(config).await?;
            match op(Arc::clone(&instance)).await {
                Err(e) if e.needs_restart() && attempt < attempts => {
                    tracing::warn!(
                        "{} failed mid-request, restarting ({}/{}): {}",
                        instance.command(),
                        attempt,
                        attempts,
                        e
                    );
                    self.retire(&config.key(), &instance).await;
                    tokio::time::sleep(self.runtime.restart_backoff).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    pub async fn shutdown_backend(&self, key: &BackendKey) {
        let instance = {
            let mut slots = self.slots.write().await;
            slots.remove(key).and_then(|s| s.instance())
        };

        if let Some(instance) = instance {
            instance.shutdown().await;
        }
    }

    pub async fn shutdown_all(&self) {
        let instances: Vec<Arc<BackendInstance>> = {
            let mut slots = self.slots.write().await;
            slots.drain().filter_map(|(_, slot)| slot.instance()).collect()
        };

        if instances.is_empty() {
            return;
        }
        tracing::info!("Stopping {} backend(s)", instances.len());
        join_all(instances.iter().map(|i| i.shutdown())).await;
    }

    /// Stop backends unused for longer than `timeout`.
    ///
    /// A backend with documents still open is in use and is kept.
    pub async fn cleanup_idle(&self, timeout: Duration) -> usize {
        let idle: Vec<Arc<BackendInstance>> = {
            let mut slots = self.slots.write().await;
            let mut keys = Vec::new();
            for (key, slot) in slots.iter() {
                if let Some(instance) = slot.instance()
                    && slot.idle_duration() > timeout
                    && instance.open_document_count().await == 0
                {
                    keys.push(key.clone());
                }
            }
            keys.iter()
                .filter_map(|key| slots.remove(key))
                .filter_map(|slot| slot.instance())
                .collect()
        };

        join_all(idle.iter().map(|instance| async move {
            instance.shutdown().await;
            tracing::info!("{} stopped (idle)", instance.command());
        }))
        .await;
        idle.len()
    }

    /// Per-command lifecycle state, sorted by command
    pub async fn status(&self) -> Vec<(BackendKey, BackendState)> {
        let slots = self.slots.read().await;
        let mut status: Vec<(BackendKey, BackendState)> = slots
            .iter()
            .map(|(key, slot)| {
                let state = match slot {
                    Slot::Ready { instance, .. } => instance.state(),
                    Slot::Initializing(_) => BackendState::Starting,
                };
                (key.clone(), state)
            })
            .collect();
        status.sort_by(|a, b| a.0.cmp(&b.0));
        status
    }

    pub async fn running_backends(&self) -> Vec<BackendKey> {
        let candidates: Vec<(BackendKey, Arc<BackendInstance>)> = {
            let slots = self.slots.read().await;
            slots
                .iter()
                .filter_map(|(key, slot)| slot.instance().map(|i| (key.clone(), i)))
                .collect()
        };

        let mut running = Vec::new();
        for (key, instance) in candidates {
            if instance.is_healthy().await {
                running.push(key);
            }
        }
        running.sort();
        running
    }
}
