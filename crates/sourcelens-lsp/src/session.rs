use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, PoisonError};

use serde_json::Value;
use sourcelens_core::config::ResolvedServerConfig;
use sourcelens_core::context::SessionContext;
use sourcelens_core::hashing::sha256_hex;
use sourcelens_core::key::SessionKey;
use sourcelens_core::position::LspPosition;
use tokio::process::Child;
use tokio::sync::{Mutex, watch};
use tokio::time::{Duration, timeout};
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::launcher::{LaunchSpec, ServerLauncher};
use crate::lsp::{LspClient, LspClientOptions, path_to_uri, uri_to_path};
use crate::symbol::{
    HighlightEntry, LocationEntry, SymbolEntry, hover_text, parse_document_symbols,
    parse_highlights, parse_locations, to_location_entry,
};

const DEFINITION_PREVIEW_LINES: usize = 10;
const REFERENCE_PREVIEW_LINES: usize = 1;
const CLOSE_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Lifecycle of a session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Created,
    Initializing,
    Running,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Created => "created",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Closed => "closed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitializeOutcome {
    /// This call launched the server and completed the handshake.
    Started,
    AlreadyInitializing,
    AlreadyRunning,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub checkout_path: PathBuf,
    pub server: ResolvedServerConfig,
    /// Used when neither the context nor the config names a server command.
    pub default_command: String,
}

#[derive(Debug, Clone)]
struct OpenDocument {
    version: i32,
    sha256: String,
}

/// Open-document state for one URI. Held across the notification write so
/// notifications for that URI stay ordered.
type DocumentSlot = Arc<Mutex<Option<OpenDocument>>>;

/// One language server bound to one repository checkout.
pub struct AnalysisSession {
    key: SessionKey,
    options: SessionOptions,
    launcher: Arc<dyn ServerLauncher>,
    state: watch::Sender<SessionState>,
    client: OnceLock<LspClient>,
    child: Mutex<Option<Child>>,
    initialized_sent: AtomicBool,
    documents: std::sync::Mutex<HashMap<String, DocumentSlot>>,
}

impl AnalysisSession {
    pub fn new(key: SessionKey, options: SessionOptions, launcher: Arc<dyn ServerLauncher>) -> Self {
        let (state, _) = watch::channel(SessionState::Created);
        Self {
            key,
            options,
            launcher,
            state,
            client: OnceLock::new(),
            child: Mutex::new(None),
            initialized_sent: AtomicBool::new(false),
            documents: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn checkout_path(&self) -> &Path {
        &self.options.checkout_path
    }

    pub fn state(&self) -> SessionState {
        if let Some(client) = self.client.get()
            && client.is_closed()
        {
            self.state.send_if_modified(|state| {
                if *state == SessionState::Running {
                    *state = SessionState::Closed;
                    true
                } else {
                    false
                }
            });
        }
        *self.state.borrow()
    }

    /// Launches the server and performs the `initialize` handshake. Calls made
    /// while a handshake is in flight or after it succeeded return at once
    /// without launching anything.
    pub async fn initialize(
        self: &Arc<Self>,
        ctx: &SessionContext,
    ) -> Result<InitializeOutcome, SessionError> {
        let started = self.state.send_if_modified(|state| {
            if *state == SessionState::Created {
                *state = SessionState::Initializing;
                true
            } else {
                false
            }
        });
        if !started {
            return match self.state() {
                SessionState::Initializing => Ok(InitializeOutcome::AlreadyInitializing),
                SessionState::Running => Ok(InitializeOutcome::AlreadyRunning),
                SessionState::Created | SessionState::Closed => Err(SessionError::Closed),
            };
        }

        info!(key = %self.key, "starting language server session");

        // The handshake runs on its own task so a dropped caller cannot strand
        // the session in `Initializing`.
        let session = Arc::clone(self);
        let ctx = ctx.clone();
        let handshake = tokio::spawn(async move { session.handshake(&ctx).await });
        match handshake.await {
            Ok(result) => result.map(|()| InitializeOutcome::Started),
            Err(err) => {
                self.state.send_replace(SessionState::Closed);
                self.terminate().await;
                Err(SessionError::Launch {
                    command: self.options.default_command.clone(),
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Waits for an in-flight handshake to finish. Succeeds only when the
    /// session ends up running.
    pub async fn ready(&self) -> Result<(), SessionError> {
        let mut rx = self.state.subscribe();
        let settled = rx
            .wait_for(|state| *state != SessionState::Initializing)
            .await
            .map(|state| *state)
            .unwrap_or(SessionState::Closed);
        match settled {
            SessionState::Running => match self.state() {
                SessionState::Running => Ok(()),
                _ => Err(SessionError::Closed),
            },
            SessionState::Closed => Err(SessionError::Closed),
            other => Err(SessionError::NotRunning(other)),
        }
    }

    /// Sends `initialized` the first time it is called on a running session.
    pub async fn initialized(&self) -> Result<(), SessionError> {
        let client = self.running_client()?;
        if self.initialized_sent.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        client.initialized().await
    }

    /// Opens `path` (relative to the checkout). Re-opening with different
    /// text sends a full-text `didChange`; identical text is a no-op.
    pub async fn did_open(&self, path: &str, text: &str) -> Result<(), SessionError> {
        let client = self.running_client()?;
        let file = self.document_file(path)?;
        let uri = path_to_uri(&file)?;
        let sha256 = sha256_hex(text.as_bytes());

        let slot = self.document_slot(&uri);
        let mut document = slot.lock().await;
        match document.as_mut() {
            Some(open) if open.sha256 == sha256 => {
                debug!(%uri, "document already open with identical text");
                Ok(())
            }
            Some(open) => {
                let version = open.version + 1;
                client.did_change(&uri, version, text).await?;
                open.version = version;
                open.sha256 = sha256;
                Ok(())
            }
            None => {
                client
                    .did_open(&uri, language_id_for_path(&file), 1, text)
                    .await?;
                *document = Some(OpenDocument { version: 1, sha256 });
                Ok(())
            }
        }
    }

    pub async fn document_symbols(&self, path: &str) -> Result<Vec<SymbolEntry>, SessionError> {
        let client = self.running_client()?;
        let uri = self.document_uri(path)?;
        let value = client.document_symbols(&uri).await?;
        parse_document_symbols(value)
    }

    pub async fn hover(&self, path: &str, position: LspPosition) -> Result<String, SessionError> {
        let client = self.running_client()?;
        let uri = self.document_uri(path)?;
        let value = client.hover(&uri, position).await?;
        Ok(hover_text(&value))
    }

    pub async fn definition(
        &self,
        path: &str,
        position: LspPosition,
    ) -> Result<Vec<LocationEntry>, SessionError> {
        let client = self.running_client()?;
        let uri = self.document_uri(path)?;
        let value = client.definition(&uri, position).await?;
        self.resolve_locations(value, "textDocument/definition", DEFINITION_PREVIEW_LINES, false)
            .await
    }

    pub async fn references(
        &self,
        path: &str,
        position: LspPosition,
    ) -> Result<Vec<LocationEntry>, SessionError> {
        let client = self.running_client()?;
        let uri = self.document_uri(path)?;
        let value = client.references(&uri, position, false).await?;
        self.resolve_locations(value, "textDocument/references", REFERENCE_PREVIEW_LINES, true)
            .await
    }

    pub async fn document_highlights(
        &self,
        path: &str,
        position: LspPosition,
    ) -> Result<Vec<HighlightEntry>, SessionError> {
        let client = self.running_client()?;
        let uri = self.document_uri(path)?;
        let value = client.document_highlight(&uri, position).await?;
        parse_highlights(value)
    }

    pub async fn shutdown(&self) -> Result<(), SessionError> {
        let client = self.running_client()?;
        client.shutdown(None).await
    }

    /// Sends `exit`, reaps the subprocess and moves to `Closed`. Safe to call
    /// in any state.
    pub async fn exit(&self) {
        let previous = self.state.send_replace(SessionState::Closed);
        if let Some(client) = self.client.get()
            && !client.is_closed()
            && let Err(err) = client.exit().await
        {
            debug!(key = %self.key, "exit notification failed: {err}");
        }
        self.terminate().await;
        if previous != SessionState::Closed {
            info!(key = %self.key, "language server session closed");
        }
    }

    /// Graceful teardown used on eviction: `shutdown` (bounded) then `exit`.
    pub async fn close(&self) {
        if self.state() == SessionState::Running
            && let Some(client) = self.client.get()
            && let Err(err) = client.shutdown(Some(CLOSE_SHUTDOWN_TIMEOUT)).await
        {
            debug!(key = %self.key, "shutdown before exit failed: {err}");
        }
        self.exit().await;
    }

    async fn handshake(&self, ctx: &SessionContext) -> Result<(), SessionError> {
        match self.launch_and_initialize(ctx).await {
            Ok(()) => {
                let promoted = self.state.send_if_modified(|state| {
                    if *state == SessionState::Initializing {
                        *state = SessionState::Running;
                        true
                    } else {
                        false
                    }
                });
                if promoted {
                    info!(key = %self.key, "language server session running");
                    Ok(())
                } else {
                    // Exited while the handshake was in flight.
                    self.terminate().await;
                    Err(SessionError::Closed)
                }
            }
            Err(err) => {
                warn!(key = %self.key, "language server handshake failed: {err}");
                self.state.send_replace(SessionState::Closed);
                self.terminate().await;
                Err(err)
            }
        }
    }

    async fn launch_and_initialize(&self, ctx: &SessionContext) -> Result<(), SessionError> {
        let spec = LaunchSpec::new(
            ctx,
            &self.options.server,
            &self.options.default_command,
            &self.options.checkout_path,
        );
        let io = self.launcher.launch(&spec).await?;
        *self.child.lock().await = io.child;

        let client = LspClient::start(
            io.reader,
            io.writer,
            LspClientOptions {
                root: self.options.checkout_path.clone(),
                request_timeout: self.options.server.request_timeout_ms.map(Duration::from_millis),
            },
        )?;
        let client = self.client.get_or_init(|| client);

        let initialize_timeout = self
            .options
            .server
            .initialize_timeout_ms
            .map(Duration::from_millis);
        client.initialize(initialize_timeout).await?;
        Ok(())
    }

    async fn terminate(&self) {
        let child = self.child.lock().await.take();
        let Some(mut child) = child else {
            return;
        };
        if timeout(EXIT_GRACE, child.wait()).await.is_err() {
            debug!(key = %self.key, "language server did not exit, killing it");
            if let Err(err) = child.kill().await {
                warn!(key = %self.key, "failed to kill language server: {err}");
            }
        }
    }

    fn running_client(&self) -> Result<&LspClient, SessionError> {
        match self.state() {
            SessionState::Running => self.client.get().ok_or(SessionError::Closed),
            SessionState::Closed => Err(SessionError::Closed),
            other => Err(SessionError::NotRunning(other)),
        }
    }

    fn document_slot(&self, uri: &str) -> DocumentSlot {
        let mut documents = self.documents.lock().unwrap_or_else(PoisonError::into_inner);
        documents.entry(uri.to_string()).or_default().clone()
    }

    fn document_file(&self, path: &str) -> Result<PathBuf, SessionError> {
        let relative = Path::new(path.trim_start_matches('/'));
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if relative.as_os_str().is_empty() || escapes {
            return Err(SessionError::InvalidPath(path.to_string()));
        }
        Ok(self.options.checkout_path.join(relative))
    }

    fn document_uri(&self, path: &str) -> Result<String, SessionError> {
        path_to_uri(&self.document_file(path)?)
    }

    async fn resolve_locations(
        &self,
        value: Value,
        method: &str,
        max_lines: usize,
        trim: bool,
    ) -> Result<Vec<LocationEntry>, SessionError> {
        let locations = parse_locations(value, method)?;
        let roots = self.checkout_roots();

        let mut sources: HashMap<String, Option<String>> = HashMap::new();
        let mut out = Vec::with_capacity(locations.len());
        for location in &locations {
            if !sources.contains_key(&location.uri) {
                let source = match uri_to_path(&location.uri) {
                    Some(path) => tokio::fs::read_to_string(&path).await.ok(),
                    None => None,
                };
                sources.insert(location.uri.clone(), source);
            }
            let source = sources.get(&location.uri).and_then(|s| s.as_deref());
            out.push(to_location_entry(location, &roots, source, max_lines, trim));
        }
        Ok(out)
    }

    fn checkout_roots(&self) -> Vec<PathBuf> {
        let configured = self.options.checkout_path.clone();
        let mut roots = vec![configured.clone()];
        if let Ok(canonical) = std::fs::canonicalize(&configured)
            && canonical != configured
        {
            roots.push(canonical);
        }
        roots
    }
}

pub(crate) fn language_id_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "swift" | "swiftinterface" => "swift",
        "m" => "objective-c",
        "mm" => "objective-cpp",
        "c" | "h" => "c",
        "cc" | "cpp" | "cxx" | "hpp" | "hh" => "cpp",
        "rs" => "rust",
        "py" => "python",
        "go" => "go",
        "ts" => "typescript",
        "js" => "javascript",
        _ => "plaintext",
    }
}
