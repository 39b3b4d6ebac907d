use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sourcelens_core::key::{RepositoryUrl, SessionKey};
use tokio::time::{Duration, timeout};
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::locks::{Exclusive, PathLocks};
use crate::progress::{BuildProgressLog, ProgressBoard};
use crate::runner::{CommandRunner, CommandSpec};

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub checkout_root: PathBuf,
    pub git_command: String,
    /// Program and arguments; empty disables the build step.
    pub build_command: Vec<String>,
    /// Limit for each git or build command; `None` waits indefinitely.
    pub command_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    /// The checkout already existed and no work was requested.
    Skipped,
    Cloned,
    Updated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub key: SessionKey,
    pub local_path: PathBuf,
    pub action: SyncAction,
    pub built: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutInfo {
    pub local_path: PathBuf,
    pub last_update: DateTime<Utc>,
}

/// Told about every repository whose checkout changed on disk.
#[async_trait]
pub trait SessionInvalidator: Send + Sync {
    async fn invalidate(&self, key: &SessionKey);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopInvalidator;

#[async_trait]
impl SessionInvalidator for NoopInvalidator {
    async fn invalidate(&self, _key: &SessionKey) {}
}

type SyncResult = Result<SyncOutcome, SyncError>;

pub struct SyncEngine {
    options: SyncOptions,
    runner: Arc<dyn CommandRunner>,
    invalidator: Arc<dyn SessionInvalidator>,
    locks: PathLocks<SyncResult>,
    progress: ProgressBoard,
}

impl SyncEngine {
    pub fn new(
        options: SyncOptions,
        runner: Arc<dyn CommandRunner>,
        invalidator: Arc<dyn SessionInvalidator>,
    ) -> Self {
        Self {
            options,
            runner,
            invalidator,
            locks: PathLocks::new(),
            progress: ProgressBoard::new(),
        }
    }

    pub fn progress(&self) -> &ProgressBoard {
        &self.progress
    }

    /// Clones `url` or, with `force`, updates an existing checkout. A
    /// non-forced call for an existing checkout returns `Skipped` without
    /// running anything, unless another call is still working on that
    /// checkout; it then waits and shares that call's outcome.
    pub async fn synchronize(
        &self,
        url: &str,
        force: bool,
        credentials: Option<&str>,
    ) -> SyncResult {
        let repo = parse_repository(url)?;
        let local_path = repo.key().checkout_path(&self.options.checkout_root);

        // `git clone` creates the directory before it finishes, so a held
        // slot means the checkout may still be incomplete.
        if !force && exists(&local_path).await && !self.locks.is_held(&local_path) {
            debug!(path = ?local_path, "checkout present, skipping synchronization");
            return Ok(skipped(&repo, local_path));
        }

        let slot = self.locks.slot(&local_path);
        let outcome = slot
            .run_exclusive(|| self.synchronize_locked(&repo, &local_path, force, credentials))
            .await;
        match outcome {
            Exclusive::Ran(result) => result,
            Exclusive::Joined(result) => {
                debug!(path = ?local_path, "joined a concurrent synchronization");
                result
            }
        }
    }

    async fn synchronize_locked(
        &self,
        repo: &RepositoryUrl,
        local_path: &Path,
        force: bool,
        credentials: Option<&str>,
    ) -> SyncResult {
        let present = exists(local_path).await;
        if present && !force {
            return Ok(skipped(repo, local_path.to_path_buf()));
        }

        let log = self.progress.begin(repo.key());
        let (action, command) = if present {
            (SyncAction::Updated, self.pull_command(local_path))
        } else {
            if let Some(parent) = local_path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|err| fail(&log, SyncError::io("failed to create", parent, err)))?;
            }
            (SyncAction::Cloned, self.clone_command(repo, local_path, credentials))
        };

        info!(key = %repo.key(), ?action, "synchronizing repository");
        self.run_checked(&command, &log, false).await?;

        let built = match self.build_command(local_path) {
            Some(build) => {
                log.append(&format!("\n$ {build}\n"));
                self.run_checked(&build, &log, true).await?;
                true
            }
            None => false,
        };

        log.finish(false);
        self.invalidator.invalidate(repo.key()).await;

        Ok(SyncOutcome {
            key: repo.key().clone(),
            local_path: local_path.to_path_buf(),
            action,
            built,
        })
    }

    async fn run_checked(
        &self,
        command: &CommandSpec,
        log: &BuildProgressLog,
        is_build: bool,
    ) -> Result<(), SyncError> {
        let run = self.runner.run(command, log);
        let result = match self.options.command_timeout {
            // Dropping the run kills a spawned child.
            Some(limit) => match timeout(limit, run).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(command = %command, ?limit, "command timed out");
                    let status = format!("no exit within {}ms", limit.as_millis());
                    return Err(fail(log, SyncError::CommandFailed {
                        command: command.to_string(),
                        status,
                    }));
                }
            },
            None => run.await,
        };
        let status = result.map_err(|err| {
            fail(log, SyncError::CommandFailed {
                command: command.to_string(),
                status: err.to_string(),
            })
        })?;

        if status.is_success() {
            return Ok(());
        }

        warn!(command = %command, %status, "command failed");
        let command = command.to_string();
        let status = status.to_string();
        Err(fail(log, if is_build {
            SyncError::BuildFailed { command, status }
        } else {
            SyncError::CommandFailed { command, status }
        }))
    }

    fn pull_command(&self, local_path: &Path) -> CommandSpec {
        CommandSpec::new(&self.options.git_command)
            .args(["pull", "--rebase", "origin", "HEAD"])
            .current_dir(local_path)
    }

    fn clone_command(
        &self,
        repo: &RepositoryUrl,
        local_path: &Path,
        credentials: Option<&str>,
    ) -> CommandSpec {
        let token = credentials.map(str::trim).filter(|t| !t.is_empty());
        let remote = match token {
            Some(token) => repo.with_credentials(token).to_string(),
            None => repo.as_str().to_string(),
        };

        let mut command = CommandSpec::new(&self.options.git_command)
            .args(["clone", "--depth", "1", "--recursive"])
            .arg(remote)
            .arg(local_path.to_string_lossy());
        if let Some(parent) = local_path.parent() {
            command = command.current_dir(parent);
        }
        if let Some(token) = token {
            command = command.secret(token);
        }
        command
    }

    fn build_command(&self, local_path: &Path) -> Option<CommandSpec> {
        let (program, args) = self.options.build_command.split_first()?;
        Some(
            CommandSpec::new(program)
                .args(args.iter().cloned())
                .current_dir(local_path),
        )
    }

    pub async fn checkout_info(&self, url: &str) -> Result<CheckoutInfo, SyncError> {
        let repo = parse_repository(url)?;
        let local_path = repo.key().checkout_path(&self.options.checkout_root);

        let metadata = match tokio::fs::metadata(&local_path).await {
            Ok(metadata) if metadata.is_dir() => metadata,
            _ => return Err(SyncError::NotCheckedOut(local_path)),
        };
        let modified = metadata
            .modified()
            .map_err(|err| SyncError::io("failed to read modification time of", &local_path, err))?;

        Ok(CheckoutInfo {
            local_path,
            last_update: DateTime::<Utc>::from(modified),
        })
    }

    /// Removes the checkout under its path lock and invalidates the session.
    pub async fn delete_checkout(&self, url: &str) -> Result<PathBuf, SyncError> {
        let repo = parse_repository(url)?;
        let local_path = repo.key().checkout_path(&self.options.checkout_root);

        let slot = self.locks.slot(&local_path);
        slot.with_lock(|| async {
            if !exists(&local_path).await {
                return Err(SyncError::NotCheckedOut(local_path.clone()));
            }
            tokio::fs::remove_dir_all(&local_path)
                .await
                .map_err(|err| SyncError::io("failed to remove", &local_path, err))
        })
        .await?;

        info!(key = %repo.key(), path = ?local_path, "removed checkout");
        self.invalidator.invalidate(repo.key()).await;
        Ok(local_path)
    }
}

fn fail(log: &BuildProgressLog, err: SyncError) -> SyncError {
    log.append(&format!("{err}\n"));
    log.finish(true);
    err
}

fn parse_repository(url: &str) -> Result<RepositoryUrl, SyncError> {
    RepositoryUrl::parse(url).map_err(|err| SyncError::InvalidUrl(err.to_string()))
}

fn skipped(repo: &RepositoryUrl, local_path: PathBuf) -> SyncOutcome {
    SyncOutcome {
        key: repo.key().clone(),
        local_path,
        action: SyncAction::Skipped,
        built: false,
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}
