use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use sourcelens_core::config::ResolvedServerConfig;
use sourcelens_core::context::SessionContext;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, info};

use crate::error::SessionError;

pub const DEFAULT_SERVER_COMMAND: &str = "sourcekit-lsp";

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The byte streams of a started language server.
pub struct ServerIo {
    /// Server stdout.
    pub reader: BoxedReader,
    /// Server stdin.
    pub writer: BoxedWriter,
    /// The subprocess, when there is one.
    pub child: Option<Child>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: PathBuf,
}

impl LaunchSpec {
    /// Command precedence: `serverPath` from the context, then the configured
    /// command, then `default_command`.
    pub fn new(
        ctx: &SessionContext,
        server: &ResolvedServerConfig,
        default_command: &str,
        cwd: &Path,
    ) -> Self {
        let command = ctx
            .server_path()
            .map(str::to_string)
            .or_else(|| server.command.clone())
            .unwrap_or_else(|| default_command.to_string());

        let mut args = server.args.clone();
        if let Some(sdk) = ctx.sdk_path() {
            args.extend(swiftc_flag("-sdk", sdk));
        }
        if let Some(target) = ctx.target() {
            args.extend(swiftc_flag("-target", target));
        }

        let mut env: BTreeMap<String, String> = server
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Some(toolchain) = ctx.toolchain() {
            env.insert("SOURCEKIT_TOOLCHAIN_PATH".to_string(), toolchain.to_string());
        }

        Self {
            command,
            args,
            env,
            cwd: cwd.to_path_buf(),
        }
    }
}

fn swiftc_flag(flag: &str, value: &str) -> [String; 4] {
    [
        "-Xswiftc".to_string(),
        flag.to_string(),
        "-Xswiftc".to_string(),
        value.to_string(),
    ]
}

#[async_trait]
pub trait ServerLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<ServerIo, SessionError>;
}

/// Starts the language server as a child process speaking LSP over stdio.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLauncher;

#[async_trait]
impl ServerLauncher for ProcessLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<ServerIo, SessionError> {
        info!(command = %spec.command, args = ?spec.args, cwd = ?spec.cwd, "launching language server");

        let mut child = Command::new(&spec.command)
            .args(&spec.args)
            .envs(&spec.env)
            .current_dir(&spec.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| launch_error(spec, err))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| launch_error(spec, "failed to capture stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| launch_error(spec, "failed to capture stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_logger(stderr);
        }

        Ok(ServerIo {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            child: Some(child),
        })
    }
}

fn launch_error(spec: &LaunchSpec, reason: impl ToString) -> SessionError {
    SessionError::Launch {
        command: spec.command.clone(),
        reason: reason.to_string(),
    }
}

fn spawn_stderr_logger(stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        loop {
            let mut line = String::new();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => debug!(target: "lsp.stderr", "{}", line.trim_end()),
                Err(_) => break,
            }
        }
    });
}

pub async fn resolve_server_command() -> String {
    if let Ok(value) = std::env::var("SOURCELENS_SERVER_COMMAND")
        && !value.trim().is_empty()
    {
        return value;
    }

    // On macOS the toolchain's server is only reachable through xcrun.
    let output = Command::new("xcrun")
        .args(["--find", DEFAULT_SERVER_COMMAND])
        .stdin(Stdio::null())
        .output()
        .await;

    if let Ok(output) = output
        && output.status.success()
    {
        let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !path.is_empty() {
            return path;
        }
    }

    DEFAULT_SERVER_COMMAND.to_string()
}

/// Runs `command --help` and returns the first line of its output.
pub async fn preflight_server(command: &str) -> Result<String, SessionError> {
    let output = Command::new(command)
        .arg("--help")
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|err| SessionError::Launch {
            command: command.to_string(),
            reason: err.to_string(),
        })?;

    if output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        return Ok(stdout.lines().next().unwrap_or_default().trim().to_string());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(SessionError::Launch {
        command: command.to_string(),
        reason: format!("`{command} --help` failed (status={} stderr={:?})", output.status, stderr.trim()),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use sourcelens_core::context::{SDK_PATH, SERVER_PATH, TARGET, TOOLCHAIN};

    #[test]
    fn defaults_without_context() {
        let spec = LaunchSpec::new(
            &SessionContext::new(),
            &ResolvedServerConfig::default(),
            DEFAULT_SERVER_COMMAND,
            Path::new("/w"),
        );
        assert_eq!(spec.command, "sourcekit-lsp");
        assert!(spec.args.is_empty());
        assert!(spec.env.is_empty());
        assert_eq!(spec.cwd, PathBuf::from("/w"));
    }

    #[test]
    fn context_supplies_command_flags_and_toolchain() {
        let ctx = SessionContext::new()
            .with(SERVER_PATH, "/opt/bin/sourcekit-lsp")
            .with(SDK_PATH, "/sdk/MacOSX.sdk")
            .with(TARGET, "x86_64-apple-macosx10.15")
            .with(TOOLCHAIN, "/toolchains/swift-5.2");
        let server = ResolvedServerConfig {
            command: Some("configured-lsp".to_string()),
            args: vec!["--log-level".to_string(), "info".to_string()],
            env: HashMap::from([("A".to_string(), "1".to_string())]),
            ..ResolvedServerConfig::default()
        };

        let spec = LaunchSpec::new(&ctx, &server, DEFAULT_SERVER_COMMAND, Path::new("/w"));
        assert_eq!(spec.command, "/opt/bin/sourcekit-lsp");
        assert_eq!(
            spec.args,
            vec![
                "--log-level",
                "info",
                "-Xswiftc",
                "-sdk",
                "-Xswiftc",
                "/sdk/MacOSX.sdk",
                "-Xswiftc",
                "-target",
                "-Xswiftc",
                "x86_64-apple-macosx10.15",
            ]
        );
        assert_eq!(
            spec.env.get("SOURCEKIT_TOOLCHAIN_PATH").map(String::as_str),
            Some("/toolchains/swift-5.2")
        );
        assert_eq!(spec.env.get("A").map(String::as_str), Some("1"));
    }

    #[test]
    fn configured_command_beats_default() {
        let server = ResolvedServerConfig {
            command: Some("configured-lsp".to_string()),
            ..ResolvedServerConfig::default()
        };
        let spec = LaunchSpec::new(&SessionContext::new(), &server, "fallback", Path::new("/w"));
        assert_eq!(spec.command, "configured-lsp");
    }

    #[tokio::test]
    async fn launching_a_missing_binary_fails() {
        let spec = LaunchSpec {
            command: "/nonexistent/sourcelens-test-server".to_string(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: std::env::temp_dir(),
        };
        assert!(matches!(
            ProcessLauncher.launch(&spec).await,
            Err(SessionError::Launch { .. })
        ));
    }
}
