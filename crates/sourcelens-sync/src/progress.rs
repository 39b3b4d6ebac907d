use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use sourcelens_core::key::SessionKey;
use tokio::sync::watch;
use tokio::time::{Duration, timeout};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub text: String,
    pub complete: bool,
    pub failed: bool,
}

/// Output of one repository's latest synchronization: one writer, any number
/// of readers, readers never block the writer.
#[derive(Debug, Clone)]
pub struct BuildProgressLog {
    tx: Arc<watch::Sender<ProgressSnapshot>>,
}

impl Default for BuildProgressLog {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildProgressLog {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ProgressSnapshot::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn reset(&self) {
        self.tx.send_replace(ProgressSnapshot::default());
    }

    pub fn append(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.tx.send_modify(|snapshot| snapshot.text.push_str(text));
    }

    pub fn finish(&self, failed: bool) {
        self.tx.send_modify(|snapshot| {
            snapshot.complete = true;
            snapshot.failed = failed;
        });
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.tx.borrow().clone()
    }

    /// Returns immediately when the log is complete; otherwise waits up to
    /// `max_wait` for the next change.
    pub async fn wait_for_update(&self, max_wait: Duration) -> ProgressSnapshot {
        let mut rx = self.tx.subscribe();
        if rx.borrow_and_update().complete {
            return self.snapshot();
        }
        let _ = timeout(max_wait, rx.changed()).await;
        self.snapshot()
    }
}

/// One [`BuildProgressLog`] per repository, plus which synchronization
/// started most recently.
#[derive(Debug, Default)]
pub struct ProgressBoard {
    inner: Mutex<BoardState>,
}

#[derive(Debug, Default)]
struct BoardState {
    logs: HashMap<SessionKey, BuildProgressLog>,
    latest: Option<SessionKey>,
    latest_by_resource: HashMap<String, SessionKey>,
}

impl ProgressBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears `key`'s log for a new synchronization and marks it latest.
    /// Pollers already waiting on the log are woken by the reset.
    pub fn begin(&self, key: &SessionKey) -> BuildProgressLog {
        let mut state = self.lock();
        let log = state.logs.entry(key.clone()).or_default().clone();
        state.latest = Some(key.clone());
        state
            .latest_by_resource
            .insert(key.resource().to_string(), key.clone());
        drop(state);
        log.reset();
        log
    }

    /// The log for `key`, created empty when the repository never synced.
    pub fn log(&self, key: &SessionKey) -> BuildProgressLog {
        self.lock().logs.entry(key.clone()).or_default().clone()
    }

    /// Log of the most recently started synchronization, optionally limited
    /// to one code host.
    pub fn latest(&self, resource: Option<&str>) -> Option<BuildProgressLog> {
        let resource = resource
            .map(|r| SessionKey::new(r, "").resource().to_string())
            .filter(|r| !r.is_empty());
        let state = self.lock();
        let key = match &resource {
            Some(resource) => state.latest_by_resource.get(resource),
            None => state.latest.as_ref(),
        }?;
        state.logs.get(key).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, BoardState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
