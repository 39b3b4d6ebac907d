use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

pub const APP_DIR: &str = "sourcelens";
pub const DEFAULT_GIT_COMMAND: &str = "git";
pub const DEFAULT_PROGRESS_POLL_MS: u64 = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub struct SourcelensConfig {
    /// Directory holding `resource/owner/name` checkouts.
    #[serde(default)]
    #[serde(alias = "checkoutRoot")]
    pub checkout_root: Option<PathBuf>,
    #[serde(default)]
    pub server: Option<ServerConfig>,
    #[serde(default)]
    pub sync: Option<SyncConfig>,
    #[serde(default)]
    pub host: Option<HostConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub struct ServerConfig {
    /// Command to start the language server. The `serverPath` setting wins
    /// over this when present.
    #[serde(default)]
    pub command: Option<String>,
    /// Extra arguments passed before the SDK and target flags.
    #[serde(default)]
    pub args: Option<Vec<String>>,
    #[serde(default)]
    #[serde(alias = "initializeTimeoutMs")]
    pub initialize_timeout_ms: Option<u64>,
    /// Unset means requests wait for the server indefinitely.
    #[serde(default)]
    #[serde(alias = "requestTimeoutMs")]
    pub request_timeout_ms: Option<u64>,
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub struct SyncConfig {
    #[serde(default)]
    #[serde(alias = "gitCommand")]
    pub git_command: Option<String>,
    /// Program and arguments run in the checkout after a successful clone or
    /// update, e.g. `["swift", "build"]`.
    #[serde(default)]
    #[serde(alias = "buildCommand")]
    pub build_command: Option<Vec<String>>,
    /// Default for the `auto_checkout` setting when no settings file exists.
    #[serde(default)]
    #[serde(alias = "autoCheckout")]
    pub auto_checkout: Option<bool>,
    /// Limit for each git or build command. Unset or `0` waits indefinitely.
    #[serde(default)]
    #[serde(alias = "commandTimeoutMs")]
    pub command_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub struct HostConfig {
    /// Upper bound for a `buildProgress` long-poll.
    #[serde(default)]
    #[serde(alias = "progressPollMs")]
    pub progress_poll_ms: Option<u64>,
    #[serde(default)]
    #[serde(alias = "settingsPath")]
    pub settings_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: SourcelensConfig,
    pub checkout_root: PathBuf,
    pub source: ConfigSource,
}

#[derive(Debug, Clone)]
pub enum ConfigSource {
    None,
    Path(PathBuf),
    Env(PathBuf),
    User(PathBuf),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedServerConfig {
    pub command: Option<String>,
    pub args: Vec<String>,
    pub initialize_timeout_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSyncConfig {
    pub git_command: String,
    /// Empty when no build step is configured.
    pub build_command: Vec<String>,
    pub auto_checkout: bool,
    pub command_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedHostConfig {
    pub progress_poll_ms: u64,
    pub settings_path: Option<PathBuf>,
}

pub fn load_config(
    cli_config_path: Option<&Path>,
    cli_checkout_root: Option<&Path>,
) -> Result<LoadedConfig> {
    load_config_with_env(
        cli_config_path,
        cli_checkout_root,
        std::env::var("SOURCELENS_CONFIG_PATH").ok(),
        &UserDirs::from_env(),
    )
}

/// Base directories consulted for defaults.
#[derive(Debug, Clone, Default)]
pub struct UserDirs {
    pub xdg_config_home: Option<PathBuf>,
    pub xdg_data_home: Option<PathBuf>,
    pub home: Option<PathBuf>,
}

impl UserDirs {
    pub fn from_env() -> Self {
        Self {
            xdg_config_home: non_empty_env("XDG_CONFIG_HOME").map(PathBuf::from),
            xdg_data_home: non_empty_env("XDG_DATA_HOME").map(PathBuf::from),
            home: dirs::home_dir(),
        }
    }

    pub fn config_dir(&self) -> Option<PathBuf> {
        self.xdg_config_home
            .clone()
            .or_else(|| self.home.as_ref().map(|home| home.join(".config")))
            .map(|dir| dir.join(APP_DIR))
    }

    pub fn data_dir(&self) -> Option<PathBuf> {
        self.xdg_data_home
            .clone()
            .or_else(|| self.home.as_ref().map(|home| home.join(".local/share")))
            .map(|dir| dir.join(APP_DIR))
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn load_config_with_env(
    cli_config_path: Option<&Path>,
    cli_checkout_root: Option<&Path>,
    env_config_path: Option<String>,
    dirs: &UserDirs,
) -> Result<LoadedConfig> {
    let (config, source) = if let Some(path) = cli_config_path {
        (read_config_file(path)?, ConfigSource::Path(path.to_path_buf()))
    } else if let Some(path) = env_config_path.filter(|p| !p.trim().is_empty()) {
        let path = PathBuf::from(path);
        (read_config_file(&path)?, ConfigSource::Env(path))
    } else {
        match user_config_candidates(dirs)
            .into_iter()
            .find(|candidate| candidate.exists())
        {
            Some(candidate) => (read_config_file(&candidate)?, ConfigSource::User(candidate)),
            None => (SourcelensConfig::default(), ConfigSource::None),
        }
    };

    let checkout_root =
        resolve_checkout_root(cli_checkout_root, config.checkout_root.as_deref(), dirs)?;
    Ok(LoadedConfig {
        config,
        checkout_root,
        source,
    })
}

fn resolve_checkout_root(
    cli: Option<&Path>,
    from_config: Option<&Path>,
    dirs: &UserDirs,
) -> Result<PathBuf> {
    if let Some(cli) = cli {
        return Ok(cli.to_path_buf());
    }
    if let Some(cfg) = from_config {
        return Ok(cfg.to_path_buf());
    }
    dirs.data_dir()
        .map(|dir| dir.join("checkouts"))
        .ok_or_else(|| anyhow!("cannot determine checkout root: neither XDG_DATA_HOME nor a home directory is available"))
}

/// Creates the checkout root if needed and returns its canonical form, so
/// paths reported by language servers can be compared against it.
pub fn ensure_checkout_root(root: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(root)
        .with_context(|| format!("failed to create checkout root: {root:?}"))?;
    root.canonicalize()
        .with_context(|| format!("failed to canonicalize checkout root: {root:?}"))
}

fn user_config_candidates(dirs: &UserDirs) -> Vec<PathBuf> {
    let Some(dir) = dirs.config_dir() else {
        return Vec::new();
    };
    vec![dir.join("config.toml"), dir.join("config.json")]
}

fn read_config_file(path: &Path) -> Result<SourcelensConfig> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read config file: {path:?}"))?;
    let ext = path.extension().and_then(OsStr::to_str).unwrap_or("");

    if ext.eq_ignore_ascii_case("toml") {
        let s = String::from_utf8(bytes).context("config file is not valid UTF-8")?;
        let cfg: SourcelensConfig = toml::from_str(&s).context("failed to parse TOML config")?;
        return Ok(cfg);
    }
    if ext.eq_ignore_ascii_case("json") {
        let cfg: SourcelensConfig =
            serde_json::from_slice(&bytes).context("failed to parse JSON config")?;
        return Ok(cfg);
    }

    Err(anyhow!(
        "unsupported config extension (expected .toml or .json): {path:?}"
    ))
}

pub fn resolved_server(config: &SourcelensConfig) -> ResolvedServerConfig {
    let Some(server) = config.server.as_ref() else {
        return ResolvedServerConfig::default();
    };
    ResolvedServerConfig {
        command: server
            .command
            .as_ref()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty()),
        args: server.args.clone().unwrap_or_default(),
        initialize_timeout_ms: server.initialize_timeout_ms,
        request_timeout_ms: server.request_timeout_ms.filter(|ms| *ms > 0),
        env: server.env.clone().unwrap_or_default(),
    }
}

pub fn resolved_sync(config: &SourcelensConfig) -> ResolvedSyncConfig {
    let sync = config.sync.clone().unwrap_or_default();
    ResolvedSyncConfig {
        git_command: sync
            .git_command
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_GIT_COMMAND.to_string()),
        build_command: sync
            .build_command
            .unwrap_or_default()
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect(),
        auto_checkout: sync.auto_checkout.unwrap_or(true),
        command_timeout_ms: sync.command_timeout_ms.filter(|ms| *ms > 0),
    }
}

pub fn resolved_host(config: &SourcelensConfig, dirs: &UserDirs) -> ResolvedHostConfig {
    let host = config.host.clone().unwrap_or_default();
    ResolvedHostConfig {
        progress_poll_ms: host
            .progress_poll_ms
            .filter(|ms| *ms > 0)
            .unwrap_or(DEFAULT_PROGRESS_POLL_MS),
        settings_path: host
            .settings_path
            .or_else(|| dirs.config_dir().map(|dir| dir.join("settings.json"))),
    }
}
