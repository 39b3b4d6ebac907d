use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sourcelens_core::context::{self, SessionContext};
use tokio::process::Command;
use tracing::debug;

/// Which language server binary sessions launch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerChoice {
    #[default]
    Default,
    /// Use `server_path`.
    Custom,
}

/// User preferences edited from the extension's options page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerChoice,
    pub server_path: String,
    pub sdk: String,
    pub sdk_path: String,
    pub target: String,
    pub toolchain: String,
    pub auto_checkout: bool,
    pub access_token_github: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerChoice::Default,
            server_path: String::new(),
            sdk: "macosx".to_string(),
            sdk_path: String::new(),
            target: String::new(),
            toolchain: String::new(),
            auto_checkout: true,
            access_token_github: String::new(),
        }
    }
}

impl Settings {
    pub fn context(&self) -> SessionContext {
        let mut ctx = SessionContext::new();
        if self.server == ServerChoice::Custom {
            ctx.insert(context::SERVER_PATH, &self.server_path);
        }
        ctx.insert(context::SDK_PATH, &self.sdk_path);
        ctx.insert(context::TARGET, &self.target);
        ctx.insert(context::TOOLCHAIN, &self.toolchain);
        ctx.insert(context::ACCESS_TOKEN, &self.access_token_github);
        ctx
    }

    pub fn access_token(&self) -> Option<&str> {
        let token = self.access_token_github.trim();
        (!token.is_empty()).then_some(token)
    }

    pub fn apply(&mut self, update: SettingsUpdate) {
        if let Some(server) = update.server {
            self.server = server;
        }
        if let Some(server_path) = update.server_path {
            self.server_path = server_path;
        }
        if let Some(sdk) = update.sdk {
            self.sdk = sdk;
        }
        if let Some(sdk_path) = update.sdk_path {
            self.sdk_path = sdk_path;
        }
        if let Some(target) = update.target {
            self.target = target;
        }
        if let Some(toolchain) = update.toolchain {
            self.toolchain = toolchain;
        }
        if let Some(auto_checkout) = update.auto_checkout {
            self.auto_checkout = auto_checkout.into();
        }
        if let Some(token) = update.access_token_github {
            self.access_token_github = token;
        }
    }
}

/// Partial settings from an `updateSettings` request. Absent fields keep
/// their stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SettingsUpdate {
    pub server: Option<ServerChoice>,
    pub server_path: Option<String>,
    pub sdk: Option<String>,
    pub sdk_path: Option<String>,
    pub target: Option<String>,
    pub toolchain: Option<String>,
    pub auto_checkout: Option<Flag>,
    pub access_token_github: Option<String>,
}

/// The options page sends checkboxes as `0`/`1`; newer callers send booleans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Flag {
    Bool(bool),
    Int(i64),
}

impl From<Flag> for bool {
    fn from(flag: Flag) -> Self {
        match flag {
            Flag::Bool(value) => value,
            Flag::Int(value) => value != 0,
        }
    }
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn load(&self) -> Result<Settings>;
    async fn save(&self, settings: &Settings) -> Result<()>;
}

/// Settings persisted as one JSON file. A missing file reads as the store's
/// defaults.
#[derive(Debug, Clone)]
pub struct FileSettingsStore {
    path: PathBuf,
    defaults: Settings,
}

impl FileSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            defaults: Settings::default(),
        }
    }

    pub fn with_defaults(mut self, defaults: Settings) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SettingsStore for FileSettingsStore {
    async fn load(&self) -> Result<Settings> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(self.defaults.clone());
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read settings: {}", self.path.display()));
            }
        };
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse settings: {}", self.path.display()))
    }

    async fn save(&self, settings: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let body = serde_json::to_vec_pretty(settings).context("failed to encode settings")?;
        let staging = self.path.with_extension("json.tmp");
        tokio::fs::write(&staging, body)
            .await
            .with_context(|| format!("failed to write {}", staging.display()))?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))
    }
}

/// Finds the on-disk SDK for a platform name such as `iphonesimulator`.
#[async_trait]
pub trait SdkLocator: Send + Sync {
    async fn sdk_path(&self, sdk: &str) -> Option<String>;
}

/// Asks `xcrun --show-sdk-path`.
#[derive(Debug, Clone, Copy, Default)]
pub struct XcrunSdkLocator;

#[async_trait]
impl SdkLocator for XcrunSdkLocator {
    async fn sdk_path(&self, sdk: &str) -> Option<String> {
        let output = Command::new("xcrun")
            .args(["--show-sdk-path", "--sdk", sdk])
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            debug!(sdk, status = ?output.status.code(), "xcrun could not locate sdk");
            return None;
        }
        let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!path.is_empty()).then_some(path)
    }
}
