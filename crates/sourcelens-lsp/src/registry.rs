use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sourcelens_core::config::ResolvedServerConfig;
use sourcelens_core::key::SessionKey;
use tracing::info;

use crate::launcher::ServerLauncher;
use crate::session::{AnalysisSession, SessionOptions, SessionState};

#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub checkout_root: PathBuf,
    pub server: ResolvedServerConfig,
    pub default_command: String,
}

/// Owns at most one [`AnalysisSession`] per repository.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionKey, Arc<AnalysisSession>>>,
    launcher: Arc<dyn ServerLauncher>,
    options: RegistryOptions,
}

impl SessionRegistry {
    pub fn new(launcher: Arc<dyn ServerLauncher>, options: RegistryOptions) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            launcher,
            options,
        }
    }

    /// Returns the live session for `key`, creating one (without launching
    /// anything) when there is none or the previous one has closed.
    pub fn get(&self, key: &SessionKey) -> Arc<AnalysisSession> {
        let mut sessions = self.lock();
        if let Some(existing) = sessions.get(key)
            && existing.state() != SessionState::Closed
        {
            return existing.clone();
        }

        let session = Arc::new(AnalysisSession::new(
            key.clone(),
            SessionOptions {
                checkout_path: key.checkout_path(&self.options.checkout_root),
                server: self.options.server.clone(),
                default_command: self.options.default_command.clone(),
            },
            self.launcher.clone(),
        ));
        sessions.insert(key.clone(), session.clone());
        session
    }

    /// Returns the existing session for `key` without creating one.
    pub fn find(&self, key: &SessionKey) -> Option<Arc<AnalysisSession>> {
        self.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Removes the session for `key` and shuts it down. Returns whether a
    /// session was present.
    pub async fn remove(&self, key: &SessionKey) -> bool {
        let removed = self.lock().remove(key);
        let Some(session) = removed else {
            return false;
        };
        info!(%key, "evicting language server session");
        session.close().await;
        true
    }

    pub async fn remove_all(&self) {
        let drained: Vec<_> = self.lock().drain().map(|(_, session)| session).collect();
        if drained.is_empty() {
            return;
        }
        info!(count = drained.len(), "closing all language server sessions");

        let mut closing = tokio::task::JoinSet::new();
        for session in drained {
            closing.spawn(async move { session.close().await });
        }
        while closing.join_next().await.is_some() {}
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionKey, Arc<AnalysisSession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
