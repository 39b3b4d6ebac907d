use std::sync::Arc;

use anyhow::{Result, anyhow};
use sourcelens_core::config::{LoadedConfig, UserDirs, resolved_host, resolved_server, resolved_sync};
use sourcelens_lsp::{RegistryOptions, ServerLauncher, SessionRegistry};
use sourcelens_sync::{CommandRunner, SyncEngine, SyncOptions};
use tokio::time::Duration;

mod envelope;
mod request;
mod service;
mod settings;
mod transport;

pub use envelope::{Envelope, Outcome, PositionEcho};
pub use request::{InboundMessage, Request, RequestError};
pub use service::{BridgeService, RegistryInvalidator, ServiceOptions};
pub use settings::{
    FileSettingsStore, Flag, SdkLocator, ServerChoice, Settings, SettingsStore, SettingsUpdate,
    XcrunSdkLocator,
};
pub use transport::serve;

/// Wires a [`BridgeService`] from loaded configuration: one registry, one
/// sync engine that evicts sessions from it, and the settings file.
pub fn build_service(
    loaded: &LoadedConfig,
    dirs: &UserDirs,
    launcher: Arc<dyn ServerLauncher>,
    runner: Arc<dyn CommandRunner>,
    default_command: String,
) -> Result<BridgeService> {
    let sync_config = resolved_sync(&loaded.config);
    let host_config = resolved_host(&loaded.config, dirs);

    let registry = Arc::new(SessionRegistry::new(
        launcher,
        RegistryOptions {
            checkout_root: loaded.checkout_root.clone(),
            server: resolved_server(&loaded.config),
            default_command,
        },
    ));
    let sync = Arc::new(SyncEngine::new(
        SyncOptions {
            checkout_root: loaded.checkout_root.clone(),
            git_command: sync_config.git_command,
            build_command: sync_config.build_command,
            command_timeout: sync_config.command_timeout_ms.map(Duration::from_millis),
        },
        runner,
        Arc::new(RegistryInvalidator::new(registry.clone())),
    ));

    let settings_path = host_config
        .settings_path
        .ok_or_else(|| anyhow!("cannot determine settings path: set host.settings_path"))?;
    let settings = FileSettingsStore::new(settings_path).with_defaults(Settings {
        auto_checkout: sync_config.auto_checkout,
        ..Settings::default()
    });

    Ok(BridgeService::new(
        registry,
        sync,
        Arc::new(settings),
        ServiceOptions {
            progress_poll: Duration::from_millis(host_config.progress_poll_ms),
        },
    ))
}

/// Serves the native messaging protocol on stdin/stdout.
pub async fn run_stdio(service: Arc<BridgeService>) -> Result<()> {
    serve(service, tokio::io::stdin(), tokio::io::stdout()).await
}
