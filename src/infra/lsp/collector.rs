//! Diagnostic Collector
//!
//! Turns `textDocument/publishDiagnostics` pushes into an awaitable
//! per-document result. Each publish is a full snapshot and replaces the
//! previous one. Publishes for documents nobody awaits are kept for a short
//! retention window, then dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, timeout_at};

use super::protocol::{LspDiagnostic, PublishDiagnosticsParams};
use crate::error::LspError;
use crate::models::lsp::normalize_uri;

const MAX_UNCLAIMED: usize = 200;

/// Stand-in deadline for timeouts too large to add to `Instant::now()`
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

#[derive(Debug, Clone, Default)]
enum Snapshot {
    #[default]
    Pending,
    Published(Vec<LspDiagnostic>),
    /// The backend published something that could not be decoded
    Unreadable(String),
}

struct Subscription {
    id: u64,
    tx: watch::Sender<Snapshot>,
    /// Latest document version registered for this URI
    version: i32,
    waiters: usize,
}

impl Subscription {
    fn is_stale(&self, version: Option<i32>) -> bool {
        version.is_some_and(|v| v < self.version)
    }
}

struct Unclaimed {
    version: Option<i32>,
    diagnostics: Vec<LspDiagnostic>,
    received: Instant,
}

#[derive(Default)]
struct CollectorState {
    subscriptions: HashMap<String, Subscription>,
    unclaimed: HashMap<String, Unclaimed>,
    next_subscription: u64,
}

impl CollectorState {
    fn prune(&mut self, retention: Duration) {
        self.unclaimed.retain(|_, u| u.received.elapsed() < retention);
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .unclaimed
            .iter()
            .min_by_key(|(_, u)| u.received)
            .map(|(uri, _)| uri.clone());
        if let Some(uri) = oldest {
            self.unclaimed.remove(&uri);
            tracing::trace!("Evicted unclaimed diagnostics for {}", uri);
        }
    }

    fn release(&mut self, uri: &str, subscription: u64) {
        if let Some(sub) = self.subscriptions.get_mut(uri)
            && sub.id == subscription
        {
            sub.waiters = sub.waiters.saturating_sub(1);
            if sub.waiters == 0 {
                self.subscriptions.remove(uri);
            }
        }
    }
}

type SharedState = Arc<Mutex<CollectorState>>;

// The lock is never held across an await, so a plain mutex is enough and
// lets `DiagnosticWaiter` release itself on drop.
fn lock(state: &Mutex<CollectorState>) -> MutexGuard<'_, CollectorState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct DiagnosticCollector {
    state: SharedState,
    retention: Duration,
}

impl DiagnosticCollector {
    pub fn new(retention: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(CollectorState::default())),
            retention,
        }
    }

    /// Register interest in `uri` right before a didOpen at `version`.
    ///
    /// The document was closed before, so the registered version starts
    /// over even if waiters from the previous open are still draining.
    pub fn register_open(&self, uri: &str, version: i32) -> DiagnosticWaiter {
        self.register(uri, version, true)
    }

    /// Register interest in `uri` right before a didChange to `version`.
    ///
    /// Clears the current snapshot for every waiter on the URI.
    pub fn register_change(&self, uri: &str, version: i32) -> DiagnosticWaiter {
        self.register(uri, version, false)
    }

    // Must run before the notification for `version` is sent, so a fast
    // backend cannot publish before anyone listens.
    fn register(&self, uri: &str, version: i32, opened: bool) -> DiagnosticWaiter {
        let mut state = lock(&self.state);
        state.prune(self.retention);

        // Only a buffered publish that provably covers this version is reusable
        let seeded = state
            .unclaimed
            .remove(uri)
            .filter(|u| u.version.is_some_and(|v| v >= version))
            .map_or(Snapshot::Pending, |u| Snapshot::Published(u.diagnostics));

        let (subscription, rx) = match state.subscriptions.get_mut(uri) {
            Some(sub) => {
                sub.version = if opened {
                    version
                } else {
                    sub.version.max(version)
                };
                sub.waiters += 1;
                sub.tx.send_replace(seeded);
                (sub.id, sub.tx.subscribe())
            }
            None => {
                let id = state.next_subscription;
                state.next_subscription += 1;
                let (tx, rx) = watch::channel(seeded);
                state.subscriptions.insert(
                    uri.to_string(),
                    Subscription {
                        id,
                        tx,
                        version,
                        waiters: 1,
                    },
                );
                (id, rx)
            }
        };

        DiagnosticWaiter {
            uri: uri.to_string(),
            version,
            subscription,
            rx,
            state: Arc::clone(&self.state),
        }
    }

    /// Feed one publishDiagnostics notification
    pub fn publish(&self, params: PublishDiagnosticsParams) {
        let uri = normalize_uri(&params.uri);
        let count = params.diagnostics.len();
        let mut state = lock(&self.state);

        if let Some(sub) = state.subscriptions.get(&uri) {
            if sub.is_stale(params.version) {
                tracing::trace!(
                    "Ignoring stale diagnostics for {} (v{:?} < v{})",
                    uri,
                    params.version,
                    sub.version
                );
                return;
            }
            sub.tx.send_replace(Snapshot::Published(params.diagnostics));
            tracing::debug!("Received {} diagnostics for {}", count, uri);
            return;
        }

        state.prune(self.retention);
        if state.unclaimed.len() >= MAX_UNCLAIMED && !state.unclaimed.contains_key(&uri) {
            state.evict_oldest();
        }
        state.unclaimed.insert(
            uri.clone(),
            Unclaimed {
                version: params.version,
                diagnostics: params.diagnostics,
                received: Instant::now(),
            },
        );
        tracing::trace!("Buffered {} unclaimed diagnostics for {}", count, uri);
    }

    /// Feed a publishDiagnostics whose payload could not be decoded.
    ///
    /// Waiters on `uri` fail instead of timing out into a clean result.
    /// Returns whether anyone was waiting.
    pub fn reject(&self, uri: &str, version: Option<i32>, reason: &str) -> bool {
        let uri = normalize_uri(uri);
        let mut state = lock(&self.state);
        // An older buffered snapshot must not stand in for the rejected one
        state.unclaimed.remove(&uri);

        match state.subscriptions.get(&uri) {
            Some(sub) if !sub.is_stale(version) => {
                sub.tx.send_replace(Snapshot::Unreadable(reason.to_string()));
                true
            }
            _ => false,
        }
    }

    /// Fail every outstanding waiter; used when the backend goes away
    pub fn disconnect(&self) {
        let mut state = lock(&self.state);
        if !state.subscriptions.is_empty() {
            tracing::debug!(
                "Dropping {} diagnostic subscription(s)",
                state.subscriptions.len()
            );
        }
        state.subscriptions.clear();
        state.unclaimed.clear();
    }

    pub fn is_awaited(&self, uri: &str) -> bool {
        lock(&self.state).subscriptions.contains_key(uri)
    }

    pub fn unclaimed_len(&self) -> usize {
        let mut state = lock(&self.state);
        state.prune(self.retention);
        state.unclaimed.len()
    }
}

/// Handle returned by the collector's `register_*` methods.
///
/// Dropping it releases the registration, whether or not the wait ran.
pub struct DiagnosticWaiter {
    uri: String,
    version: i32,
    subscription: u64,
    rx: watch::Receiver<Snapshot>,
    state: SharedState,
}

impl DiagnosticWaiter {
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    /// Wait for a snapshot, then for `settle` of quiet, bounded by `timeout`.
    ///
    /// Returns `LspError::Timeout` if nothing was published in time and
    /// `LspError::Protocol` if the latest publish was unreadable.
    pub async fn wait(
        &mut self,
        timeout: Duration,
        settle: Duration,
    ) -> Result<Vec<LspDiagnostic>, LspError> {
        let deadline = deadline_after(timeout);

        loop {
            match timeout_at(
                deadline,
                self.rx.wait_for(|s| !matches!(s, Snapshot::Pending)),
            )
            .await
            .map(|r| r.map(|_| ()))
            {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(LspError::NotConnected),
                Err(_) => {
                    return Err(LspError::Timeout(format!(
                        "No diagnostics published for {} within {:?}",
                        self.uri, timeout
                    )));
                }
            }

            if settle.is_zero() {
                break;
            }

            let quiet_until = deadline_after(settle).min(deadline);
            match timeout_at(quiet_until, self.rx.changed()).await {
                // A newer snapshot (or a reset) arrived; start over
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(LspError::NotConnected),
                Err(_) => break,
            }
        }

        match self.rx.borrow_and_update().clone() {
            Snapshot::Published(diagnostics) => Ok(diagnostics),
            Snapshot::Pending => Ok(Vec::new()),
            Snapshot::Unreadable(reason) => Err(LspError::Protocol(format!(
                "Backend sent unreadable diagnostics for {}: {}",
                self.uri, reason
            ))),
        }
    }
}

impl Drop for DiagnosticWaiter {
    fn drop(&mut self) {
        lock(&self.state).release(&self.uri, self.subscription);
    }
}

fn deadline_after(duration: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(duration).unwrap_or(now + FAR_FUTURE)
}
