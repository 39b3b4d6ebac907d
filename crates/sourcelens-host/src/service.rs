use std::sync::Arc;

use async_trait::async_trait;
use chrono::SecondsFormat;
use serde::Serialize;
use serde_json::{Value, json};
use sourcelens_core::config::DEFAULT_PROGRESS_POLL_MS;
use sourcelens_core::key::{RepositoryUrl, SessionKey};
use sourcelens_lsp::{
    AnalysisSession, LocationEntry, SessionError, SessionRegistry, SessionState,
};
use sourcelens_sync::{ProgressSnapshot, SessionInvalidator, SyncAction, SyncEngine};
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::envelope::Envelope;
use crate::request::{
    DocumentArgs, InboundMessage, OpenArgs, PageArgs, PositionArgs, ProgressArgs, RepositoryArgs,
    Request, SessionArgs,
};
use crate::settings::{SdkLocator, Settings, SettingsStore, SettingsUpdate, XcrunSdkLocator};

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Upper bound for one `buildProgress` long-poll.
    pub progress_poll: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            progress_poll: Duration::from_millis(DEFAULT_PROGRESS_POLL_MS),
        }
    }
}

/// Evicts a repository's session when its checkout changes.
pub struct RegistryInvalidator {
    registry: Arc<SessionRegistry>,
}

impl RegistryInvalidator {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl SessionInvalidator for RegistryInvalidator {
    async fn invalidate(&self, key: &SessionKey) {
        if self.registry.remove(key).await {
            info!(%key, "checkout changed, previous session evicted");
        }
    }
}

/// Answers extension requests using the session registry, the sync engine
/// and the settings store.
pub struct BridgeService {
    registry: Arc<SessionRegistry>,
    sync: Arc<SyncEngine>,
    settings: Arc<dyn SettingsStore>,
    sdk: Arc<dyn SdkLocator>,
    options: ServiceOptions,
}

impl BridgeService {
    pub fn new(
        registry: Arc<SessionRegistry>,
        sync: Arc<SyncEngine>,
        settings: Arc<dyn SettingsStore>,
        options: ServiceOptions,
    ) -> Self {
        Self {
            registry,
            sync,
            settings,
            sdk: Arc::new(XcrunSdkLocator),
            options,
        }
    }

    pub fn with_sdk_locator(mut self, sdk: Arc<dyn SdkLocator>) -> Self {
        self.sdk = sdk;
        self
    }

    pub async fn handle(&self, message: &InboundMessage) -> Envelope {
        let name = message.message_name.as_str();
        let envelope = match message.request() {
            Ok(request) => {
                debug!(request = name, "handling request");
                self.dispatch(name, request).await
            }
            Err(err) => {
                warn!(request = name, "rejected request: {err}");
                Envelope::error(name, err)
            }
        };
        envelope.addressed(message.tab_id.clone(), message.reply_user_info())
    }

    /// Exits every session.
    pub async fn close_all(&self) {
        self.registry.remove_all().await;
    }

    async fn dispatch(&self, name: &str, request: Request) -> Envelope {
        match request {
            Request::Initialize(args) => self.initialize(name, args).await,
            Request::DidOpen(args) => self.did_open(name, args).await,
            Request::DocumentSymbol(args) => self.document_symbol(name, args).await,
            Request::Hover(args) => self.hover(name, args).await,
            Request::Definition(args) => self.definition(name, args).await,
            Request::References(args) => self.references(name, args).await,
            Request::DocumentHighlight(args) => self.document_highlight(name, args).await,
            Request::Shutdown(args) => self.shutdown(name, args).await,
            Request::Exit(args) => self.exit(name, args).await,
            Request::Settings => self.current_settings(name).await,
            Request::UpdateSettings(update) => self.update_settings(name, update).await,
            Request::Repository(args) => self.repository(name, args).await,
            Request::CheckoutRepository(args) => self.checkout_repository(name, args).await,
            Request::DeleteRepository(args) => self.delete_repository(name, args).await,
            Request::BuildProgress(args) => self.build_progress(name, args).await,
            Request::Reset => {
                self.close_all().await;
                Envelope::success(name, None)
            }
        }
    }

    async fn initialize(&self, name: &str, args: PageArgs) -> Envelope {
        let settings = self.load_settings().await;
        if !settings.auto_checkout {
            return Envelope::skip(name);
        }

        let repo = match RepositoryUrl::from_page(&args.resource, &args.href) {
            Ok(repo) => repo,
            Err(err) => return Envelope::error(name, err),
        };

        match self
            .sync
            .synchronize(repo.as_str(), false, settings.access_token())
            .await
        {
            Ok(outcome) if outcome.action == SyncAction::Skipped => Envelope::skip(name),
            Ok(outcome) => Envelope::success(
                name,
                Some(json!({
                    "localCheckoutDirectory": outcome.local_path.display().to_string(),
                    "action": outcome.action,
                    "built": outcome.built,
                })),
            ),
            Err(err) => Envelope::failure(name, err),
        }
    }

    async fn did_open(&self, name: &str, args: OpenArgs) -> Envelope {
        let settings = self.load_settings().await;
        let document = &args.document;
        let session = self.registry.get(&document.session.key());

        let result: Result<_, SessionError> = async {
            session.initialize(&settings.context()).await?;
            session.ready().await?;
            session.initialized().await?;
            session.did_open(&document.filepath, &args.text).await?;
            session.document_symbols(&document.filepath).await
        }
        .await;

        match result {
            Ok(symbols) => Envelope::success("documentSymbol", Some(to_json(&symbols))),
            Err(err) => Envelope::error(name, err),
        }
    }

    async fn document_symbol(&self, name: &str, args: DocumentArgs) -> Envelope {
        let result = match self.running_session(&args.session) {
            Ok(session) => session.document_symbols(&args.filepath).await,
            Err(err) => Err(err),
        };
        reply(name, result.map(|symbols| to_json(&symbols)))
    }

    async fn hover(&self, name: &str, args: PositionArgs) -> Envelope {
        let result = match self.running_session(&args.document.session) {
            Ok(session) => session.hover(&args.document.filepath, args.position()).await,
            Err(err) => Err(err),
        };
        reply(name, result.map(Value::String)).with_echo(args.echo())
    }

    async fn definition(&self, name: &str, args: PositionArgs) -> Envelope {
        let result = match self.running_session(&args.document.session) {
            Ok(session) => session.definition(&args.document.filepath, args.position()).await,
            Err(err) => Err(err),
        };
        reply(name, result.map(|locations| locations_value(&locations))).with_echo(args.echo())
    }

    async fn references(&self, name: &str, args: PositionArgs) -> Envelope {
        let result = match self.running_session(&args.document.session) {
            Ok(session) => session.references(&args.document.filepath, args.position()).await,
            Err(err) => Err(err),
        };
        reply(name, result.map(|locations| locations_value(&locations))).with_echo(args.echo())
    }

    async fn document_highlight(&self, name: &str, args: PositionArgs) -> Envelope {
        let result = match self.running_session(&args.document.session) {
            Ok(session) => {
                session
                    .document_highlights(&args.document.filepath, args.position())
                    .await
            }
            Err(err) => Err(err),
        };
        reply(
            name,
            result.map(|highlights| json!({ "documentHighlights": to_json(&highlights) })),
        )
        .with_echo(args.echo())
    }

    async fn shutdown(&self, name: &str, args: SessionArgs) -> Envelope {
        let result = match self.running_session(&args) {
            Ok(session) => session.shutdown().await,
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => Envelope::success(name, None),
            Err(err) => Envelope::error(name, err),
        }
    }

    async fn exit(&self, name: &str, args: SessionArgs) -> Envelope {
        let removed = self.registry.remove(&args.key()).await;
        Envelope::success(name, Some(json!({ "removed": removed })))
    }

    async fn current_settings(&self, name: &str) -> Envelope {
        match self.settings.load().await {
            Ok(settings) => Envelope::success(name, Some(settings_value(&settings))),
            Err(err) => Envelope::error(name, format!("{err:#}")),
        }
    }

    async fn update_settings(&self, name: &str, update: SettingsUpdate) -> Envelope {
        let mut settings = match self.settings.load().await {
            Ok(settings) => settings,
            Err(err) => return Envelope::error(name, format!("{err:#}")),
        };

        let sdk_changed = update.sdk.is_some() && update.sdk_path.is_none();
        settings.apply(update);
        if sdk_changed {
            match self.sdk.sdk_path(&settings.sdk).await {
                Some(path) => settings.sdk_path = path,
                None => debug!(sdk = %settings.sdk, "sdk path not found, keeping previous value"),
            }
        }

        match self.settings.save(&settings).await {
            Ok(()) => Envelope::success(name, None),
            Err(err) => Envelope::error(name, format!("{err:#}")),
        }
    }

    async fn repository(&self, name: &str, args: RepositoryArgs) -> Envelope {
        self.checkout_reply(name, &args.url).await
    }

    async fn checkout_repository(&self, name: &str, args: RepositoryArgs) -> Envelope {
        let settings = self.load_settings().await;
        if let Err(err) = self
            .sync
            .synchronize(&args.url, true, settings.access_token())
            .await
        {
            return Envelope::failure(name, err);
        }
        self.checkout_reply(name, &args.url).await
    }

    async fn delete_repository(&self, name: &str, args: RepositoryArgs) -> Envelope {
        match self.sync.delete_checkout(&args.url).await {
            Ok(path) => Envelope::success(
                name,
                Some(json!({ "localCheckoutDirectory": path.display().to_string() })),
            ),
            Err(err) => Envelope::error(name, err),
        }
    }

    async fn build_progress(&self, name: &str, args: ProgressArgs) -> Envelope {
        let progress = self.sync.progress();
        let log = match args.key() {
            Some(key) => Some(progress.log(&key)),
            None => progress.latest(args.resource.as_deref()),
        };
        let snapshot = match log {
            Some(log) => log.wait_for_update(self.options.progress_poll).await,
            None => {
                debug!(resource = ?args.resource, "no synchronization to report");
                ProgressSnapshot::default()
            }
        };
        Envelope::success(name, Some(to_json(&snapshot)))
    }

    async fn checkout_reply(&self, name: &str, url: &str) -> Envelope {
        match self.sync.checkout_info(url).await {
            Ok(info) => Envelope::success(
                name,
                Some(json!({
                    "localCheckoutDirectory": info.local_path.display().to_string(),
                    "lastUpdate": info.last_update.to_rfc3339_opts(SecondsFormat::Secs, true),
                })),
            ),
            Err(err) => Envelope::error(name, err),
        }
    }

    /// Post-handshake requests never create or launch a session.
    fn running_session(&self, args: &SessionArgs) -> Result<Arc<AnalysisSession>, SessionError> {
        self.registry
            .find(&args.key())
            .ok_or(SessionError::NotRunning(SessionState::Created))
    }

    async fn load_settings(&self) -> Settings {
        match self.settings.load().await {
            Ok(settings) => settings,
            Err(err) => {
                warn!("failed to load settings, using defaults: {err:#}");
                Settings::default()
            }
        }
    }
}

fn reply(name: &str, result: Result<Value, SessionError>) -> Envelope {
    match result {
        Ok(value) => Envelope::success(name, Some(value)),
        Err(err) => Envelope::error(name, err),
    }
}

fn to_json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn locations_value(locations: &[LocationEntry]) -> Value {
    let locations: Vec<Value> = locations
        .iter()
        .map(|location| {
            let mut value = to_json(location);
            if let Some(obj) = value.as_object_mut() {
                obj.insert(
                    "lineNumber".to_string(),
                    json!(u64::from(location.start.line) + 1),
                );
            }
            value
        })
        .collect();
    json!({ "locations": locations })
}

fn settings_value(settings: &Settings) -> Value {
    let mut value = to_json(settings);
    if let Some(obj) = value.as_object_mut() {
        obj.insert("version".to_string(), json!(env!("CARGO_PKG_VERSION")));
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use sourcelens_core::position::LspPosition;

    #[test]
    fn locations_carry_one_based_line_numbers() {
        let value = locations_value(&[LocationEntry {
            uri: "Sources/NIO/Channel.swift".to_string(),
            filename: "Channel.swift".to_string(),
            start: LspPosition::new(41, 4),
            end: LspPosition::new(41, 9),
            content: "func flush()".to_string(),
        }]);
        assert_eq!(value["locations"][0]["lineNumber"], json!(42));
        assert_eq!(value["locations"][0]["uri"], json!("Sources/NIO/Channel.swift"));
        assert_eq!(value["locations"][0]["start"], json!({ "line": 41, "character": 4 }));
    }

    #[test]
    fn settings_reply_includes_version() {
        let value = settings_value(&Settings::default());
        assert_eq!(value["auto_checkout"], json!(true));
        assert_eq!(value["server"], json!("default"));
        assert!(value["version"].is_string());
    }
}
