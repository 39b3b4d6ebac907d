//! Recording command runner and invalidator for tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use sourcelens_core::key::SessionKey;
use tokio::sync::Barrier;
use tokio::time::{Duration, sleep};

use crate::engine::SessionInvalidator;
use crate::progress::BuildProgressLog;
use crate::runner::{CommandRunner, CommandSpec, CommandStatus};

/// Runner that records every command instead of spawning it. A successful
/// `git clone` creates its target directory so later calls see a checkout.
#[derive(Default)]
pub struct RecordingRunner {
    invocations: Mutex<Vec<CommandSpec>>,
    delay: Option<Duration>,
    rendezvous: Option<Arc<Barrier>>,
    output: Option<String>,
    failures: HashMap<String, i32>,
    matching_delays: Vec<(String, Duration)>,
    matching_failures: Vec<(String, i32)>,
    eager_checkout: bool,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every run waits until `parties` runs are in flight at once.
    pub fn with_rendezvous(mut self, parties: usize) -> Self {
        self.rendezvous = Some(Arc::new(Barrier::new(parties)));
        self
    }

    /// Text written to the log by every run, redacted like real output.
    pub fn with_output(mut self, output: &str) -> Self {
        self.output = Some(output.to_string());
        self
    }

    pub fn failing_program(mut self, program: &str, code: i32) -> Self {
        self.failures.insert(program.to_string(), code);
        self
    }

    /// Extra delay for commands whose display form contains `needle`.
    pub fn slow_when(mut self, needle: &str, delay: Duration) -> Self {
        self.matching_delays.push((needle.to_string(), delay));
        self
    }

    /// Exit code for commands whose display form contains `needle`.
    pub fn failing_when(mut self, needle: &str, code: i32) -> Self {
        self.matching_failures.push((needle.to_string(), code));
        self
    }

    /// Creates the clone target as soon as the clone starts, the way
    /// `git clone` does, instead of after it succeeds.
    pub fn with_eager_checkout(mut self) -> Self {
        self.eager_checkout = true;
        self
    }

    pub fn invocations(&self) -> Vec<CommandSpec> {
        lock(&self.invocations).clone()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, command: &CommandSpec, log: &BuildProgressLog) -> std::io::Result<CommandStatus> {
        lock(&self.invocations).push(command.clone());
        let display = command.to_string();
        let clone_target = (command.args.first().map(String::as_str) == Some("clone"))
            .then(|| command.args.last())
            .flatten();

        if self.eager_checkout
            && let Some(target) = clone_target
        {
            tokio::fs::create_dir_all(target).await?;
        }
        if let Some(barrier) = &self.rendezvous {
            barrier.wait().await;
        }
        if let Some(delay) = self.delay {
            sleep(delay).await;
        }
        for (needle, delay) in &self.matching_delays {
            if display.contains(needle.as_str()) {
                sleep(*delay).await;
            }
        }
        if let Some(output) = &self.output {
            log.append(&command.redact(output));
        }

        let failure = self.failures.get(&command.program).copied().or_else(|| {
            self.matching_failures
                .iter()
                .find(|(needle, _)| display.contains(needle.as_str()))
                .map(|(_, code)| *code)
        });
        if let Some(code) = failure {
            return Ok(CommandStatus { code: Some(code) });
        }

        if let Some(target) = clone_target {
            tokio::fs::create_dir_all(target).await?;
        }
        Ok(CommandStatus::success())
    }
}

#[derive(Debug, Default)]
pub struct RecordingInvalidator {
    keys: Mutex<Vec<SessionKey>>,
}

impl RecordingInvalidator {
    pub fn keys(&self) -> Vec<SessionKey> {
        lock(&self.keys).clone()
    }
}

#[async_trait]
impl SessionInvalidator for RecordingInvalidator {
    async fn invalidate(&self, key: &SessionKey) {
        lock(&self.keys).push(key.clone());
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
