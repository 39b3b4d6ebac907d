use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sourcelens_core::config::{
    LoadedConfig, UserDirs, ensure_checkout_root, load_config, resolved_host, resolved_server,
    resolved_sync,
};
use sourcelens_core::key::RepositoryUrl;
use sourcelens_lsp::{ProcessLauncher, preflight_server, resolve_server_command};
use sourcelens_sync::{NoopInvalidator, ProcessRunner, SyncEngine, SyncOptions};
use tokio::process::Command as TokioCommand;
use tokio::time::Duration;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "sourcelens")]
#[command(version)]
struct Args {
    /// Optional path to a config file (.toml or .json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Override the directory holding repository checkouts
    #[arg(long, global = true, env = "SOURCELENS_CHECKOUT_ROOT")]
    checkout_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,

    /// Caller origin appended by the browser when it launches a native
    /// messaging host.
    #[arg(hide = true)]
    origin: Vec<String>,
    #[arg(long, hide = true)]
    parent_window: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the extension protocol over stdio (the default)
    Serve,
    /// Clone or update one repository checkout
    Sync {
        /// Repository URL, e.g. https://github.com/apple/swift-nio
        url: String,
        /// Update an existing checkout instead of leaving it as is
        #[arg(long)]
        force: bool,
        /// Access token embedded in the clone URL
        #[arg(long, env = "SOURCELENS_ACCESS_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },
    /// Print environment/config diagnostics
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the framed protocol.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let args = Args::parse();
    let mut loaded = load_config(args.config.as_deref(), args.checkout_root.as_deref())?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            if !args.origin.is_empty() {
                info!(origin = ?args.origin, parent_window = ?args.parent_window, "launched by browser");
            }
            loaded.checkout_root = ensure_checkout_root(&loaded.checkout_root)?;
            serve(loaded).await
        }
        Command::Sync { url, force, token } => {
            loaded.checkout_root = ensure_checkout_root(&loaded.checkout_root)?;
            sync(&loaded, &url, force, token.as_deref()).await
        }
        Command::Doctor => doctor(&loaded).await,
    }
}

async fn serve(loaded: LoadedConfig) -> Result<()> {
    let default_command = resolve_server_command().await;
    info!(
        checkout_root = %loaded.checkout_root.display(),
        config_source = ?loaded.source,
        server = %default_command,
        "starting sourcelens host"
    );

    let service = sourcelens_host::build_service(
        &loaded,
        &UserDirs::from_env(),
        Arc::new(ProcessLauncher),
        Arc::new(ProcessRunner),
        default_command,
    )?;
    sourcelens_host::run_stdio(Arc::new(service)).await
}

async fn sync(loaded: &LoadedConfig, url: &str, force: bool, token: Option<&str>) -> Result<()> {
    let sync_config = resolved_sync(&loaded.config);
    let engine = SyncEngine::new(
        SyncOptions {
            checkout_root: loaded.checkout_root.clone(),
            git_command: sync_config.git_command,
            build_command: sync_config.build_command,
            command_timeout: sync_config.command_timeout_ms.map(Duration::from_millis),
        },
        Arc::new(ProcessRunner),
        Arc::new(NoopInvalidator),
    );

    match engine.synchronize(url, force, token).await {
        Ok(outcome) => {
            println!("key: {}", outcome.key);
            println!("local_path: {}", outcome.local_path.display());
            println!("action: {:?}", outcome.action);
            println!("built: {}", outcome.built);
            Ok(())
        }
        Err(err) => {
            if let Ok(repo) = RepositoryUrl::parse(url) {
                eprint!("{}", engine.progress().log(repo.key()).snapshot().text);
            }
            Err(err).with_context(|| format!("failed to synchronize {url}"))
        }
    }
}

async fn doctor(loaded: &LoadedConfig) -> Result<()> {
    let dirs = UserDirs::from_env();
    let server = resolved_server(&loaded.config);
    let sync = resolved_sync(&loaded.config);
    let host = resolved_host(&loaded.config, &dirs);

    println!("config_source: {:?}", loaded.source);
    println!("checkout_root: {}", loaded.checkout_root.display());
    println!(
        "checkout_root.exists: {}",
        tokio::fs::try_exists(&loaded.checkout_root)
            .await
            .unwrap_or(false)
    );
    match &host.settings_path {
        Some(path) => println!("settings_path: {}", path.display()),
        None => println!("settings_path: <undetermined>"),
    }
    println!("host.progress_poll_ms: {}", host.progress_poll_ms);
    println!(
        "server.timeouts_ms: initialize={:?} request={:?}",
        server.initialize_timeout_ms, server.request_timeout_ms
    );
    println!("sync.build_command: {:?}", sync.build_command);
    println!("sync.auto_checkout: {}", sync.auto_checkout);
    println!("sync.command_timeout_ms: {:?}", sync.command_timeout_ms);

    let mut failures = Vec::<String>::new();

    let command = match server.command.clone() {
        Some(command) => command,
        None => resolve_server_command().await,
    };
    println!("server.command: {command}");
    match preflight_server(&command).await {
        Ok(banner) => println!("server_preflight: ok {banner:?}"),
        Err(err) => {
            eprintln!("doctor_error: server error={err}");
            eprintln!(
                "doctor_hint: Install a Swift toolchain, set server.command, or set SOURCELENS_SERVER_COMMAND."
            );
            failures.push(format!("server: {err}"));
        }
    }

    println!("git.command: {}", sync.git_command);
    match TokioCommand::new(&sync.git_command).arg("--version").output().await {
        Ok(output) if output.status.success() => {
            println!(
                "git_preflight: ok {:?}",
                String::from_utf8_lossy(&output.stdout).trim()
            );
        }
        Ok(output) => {
            eprintln!("doctor_error: git status={}", output.status);
            failures.push(format!("git: exited with {}", output.status));
        }
        Err(err) => {
            eprintln!("doctor_error: git error={err}");
            eprintln!("doctor_hint: Install git or set sync.git_command.");
            failures.push(format!("git: {err}"));
        }
    }

    if failures.is_empty() {
        println!("doctor: ok");
        Ok(())
    } else {
        anyhow::bail!("doctor found {} problem(s): {}", failures.len(), failures.join("; "))
    }
}
