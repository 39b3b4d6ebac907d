//! Scripted in-memory language server for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncWriteExt, BufReader, DuplexStream, duplex};
use tokio::sync::watch;
use tokio::time::{Duration, sleep};

use crate::error::SessionError;
use crate::launcher::{LaunchSpec, ServerIo, ServerLauncher};
use crate::lsp::read_lsp_message;

#[derive(Debug, Clone, Default)]
struct Script {
    responses: HashMap<String, Value>,
    errors: HashMap<String, (i64, String)>,
    initialize_delay: Option<Duration>,
    fail_initialize: bool,
}

/// Launcher whose "server" is a task on the other end of two duplex pipes.
/// It records every message it receives and answers requests from a script.
pub struct FakeLauncher {
    script: Script,
    launches: AtomicUsize,
    last_spec: Mutex<Option<LaunchSpec>>,
    received: Arc<Mutex<Vec<(String, Value)>>>,
    crash: watch::Sender<bool>,
}

impl Default for FakeLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeLauncher {
    pub fn new() -> Self {
        let (crash, _) = watch::channel(false);
        Self {
            script: Script::default(),
            launches: AtomicUsize::new(0),
            last_spec: Mutex::new(None),
            received: Arc::new(Mutex::new(Vec::new())),
            crash,
        }
    }

    pub fn with_response(mut self, method: &str, result: Value) -> Self {
        self.script.responses.insert(method.to_string(), result);
        self
    }

    pub fn with_error(mut self, method: &str, code: i64, message: &str) -> Self {
        self.script
            .errors
            .insert(method.to_string(), (code, message.to_string()));
        self
    }

    pub fn with_initialize_delay(mut self, delay: Duration) -> Self {
        self.script.initialize_delay = Some(delay);
        self
    }

    pub fn failing_initialize(mut self) -> Self {
        self.script.fail_initialize = true;
        self
    }

    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn last_spec(&self) -> Option<LaunchSpec> {
        lock(&self.last_spec).clone()
    }

    pub fn received_methods(&self) -> Vec<String> {
        lock(&self.received)
            .iter()
            .map(|(method, _)| method.clone())
            .collect()
    }

    /// Params of the most recent message with `method`.
    pub fn received_params(&self, method: &str) -> Option<Value> {
        lock(&self.received)
            .iter()
            .rev()
            .find(|(m, _)| m == method)
            .map(|(_, params)| params.clone())
    }

    /// Polls until a message with `method` has been received (at most 2 s).
    pub async fn wait_for_method(&self, method: &str) -> bool {
        for _ in 0..400 {
            if lock(&self.received).iter().any(|(m, _)| m == method) {
                return true;
            }
            sleep(Duration::from_millis(5)).await;
        }
        false
    }

    /// Makes every running fake server drop its pipes, as if it crashed.
    pub fn crash_all(&self) {
        self.crash.send_replace(true);
    }
}

#[async_trait]
impl ServerLauncher for FakeLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<ServerIo, SessionError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        *lock(&self.last_spec) = Some(spec.clone());

        let (client_writer, server_reader) = duplex(256 * 1024);
        let (server_writer, client_reader) = duplex(256 * 1024);
        tokio::spawn(serve(
            Arc::new(self.script.clone()),
            server_reader,
            server_writer,
            self.received.clone(),
            self.crash.subscribe(),
        ));

        Ok(ServerIo {
            reader: Box::new(client_reader),
            writer: Box::new(client_writer),
            child: None,
        })
    }
}

async fn serve(
    script: Arc<Script>,
    reader: DuplexStream,
    mut writer: DuplexStream,
    received: Arc<Mutex<Vec<(String, Value)>>>,
    mut crash: watch::Receiver<bool>,
) {
    let mut reader = BufReader::new(reader);
    loop {
        let message = tokio::select! {
            read = read_lsp_message(&mut reader) => match read {
                Ok(Some(message)) => message,
                _ => break,
            },
            Ok(()) = crash.changed() => break,
        };

        let Some(method) = message.get("method").and_then(Value::as_str) else {
            continue;
        };
        let params = message.get("params").cloned().unwrap_or(Value::Null);
        lock(&received).push((method.to_string(), params));

        if method == "exit" {
            break;
        }
        let Some(id) = message.get("id").cloned() else {
            continue;
        };

        if method == "initialize"
            && let Some(delay) = script.initialize_delay
        {
            sleep(delay).await;
        }

        let error = if method == "initialize" && script.fail_initialize {
            Some((-32603, "initialize rejected".to_string()))
        } else {
            script.errors.get(method).cloned()
        };
        let reply = match error {
            Some((code, message)) => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": code, "message": message }
            }),
            None => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": script
                    .responses
                    .get(method)
                    .cloned()
                    .unwrap_or_else(|| default_result(method)),
            }),
        };

        if write_frame(&mut writer, &reply).await.is_err() {
            break;
        }
    }
}

fn default_result(method: &str) -> Value {
    match method {
        "initialize" => json!({ "capabilities": { "hoverProvider": true, "definitionProvider": true } }),
        "textDocument/documentSymbol"
        | "textDocument/references"
        | "textDocument/documentHighlight" => json!([]),
        _ => Value::Null,
    }
}

async fn write_frame(writer: &mut DuplexStream, value: &Value) -> std::io::Result<()> {
    let body = serde_json::to_vec(value)?;
    writer
        .write_all(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes())
        .await?;
    writer.write_all(&body).await?;
    writer.flush().await
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
