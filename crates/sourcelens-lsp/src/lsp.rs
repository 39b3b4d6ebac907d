use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sourcelens_core::position::LspPosition;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, oneshot};
use tokio::time::{Duration, timeout};
use tracing::{debug, warn};
use url::Url;

use crate::error::SessionError;
use crate::launcher::{BoxedReader, BoxedWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LspRange {
    pub start: LspPosition,
    pub end: LspPosition,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LspLocation {
    pub uri: String,
    pub range: LspRange,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LspLocationLink {
    #[serde(rename = "targetUri")]
    pub target_uri: String,
    #[serde(rename = "targetRange")]
    pub target_range: LspRange,
    #[serde(rename = "targetSelectionRange")]
    pub target_selection_range: LspRange,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LspTextDocumentItem {
    pub uri: String,
    pub language_id: String,
    pub version: i32,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LspTextDocumentIdentifier {
    pub uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LspDidOpenTextDocumentParams {
    pub text_document: LspTextDocumentItem,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LspVersionedTextDocumentIdentifier {
    pub uri: String,
    pub version: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LspTextDocumentContentChangeEvent {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LspDidChangeTextDocumentParams {
    pub text_document: LspVersionedTextDocumentIdentifier,
    pub content_changes: Vec<LspTextDocumentContentChangeEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LspTextDocumentPositionParams {
    pub text_document: LspTextDocumentIdentifier,
    pub position: LspPosition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LspReferenceContext {
    pub include_declaration: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LspReferencesParams {
    pub text_document: LspTextDocumentIdentifier,
    pub position: LspPosition,
    pub context: LspReferenceContext,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LspDocumentSymbolParams {
    pub text_document: LspTextDocumentIdentifier,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LspSymbolInformation {
    pub name: String,
    pub kind: u32,
    pub location: LspLocation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LspDocumentSymbol {
    pub name: String,
    pub kind: u32,
    pub range: LspRange,
    pub selection_range: LspRange,
    #[serde(default)]
    pub children: Vec<LspDocumentSymbol>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LspDocumentHighlight {
    pub range: LspRange,
    #[serde(default)]
    pub kind: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct LspClientOptions {
    pub root: PathBuf,
    /// Applied to every request without an explicit timeout. `None` waits
    /// for the server indefinitely.
    pub request_timeout: Option<Duration>,
}

#[derive(Debug)]
struct LspState {
    next_id: i64,
    pending: HashMap<i64, oneshot::Sender<Value>>,
    closed: bool,
}

pub struct LspClient {
    writer: Arc<Mutex<BoxedWriter>>,
    state: Arc<std::sync::Mutex<LspState>>,
    closed: Arc<AtomicBool>,
    root_uri: String,
    root_name: String,
    default_request_timeout: Option<Duration>,
}

impl LspClient {
    /// Wires the client to the server's stdout (`reader`) and stdin
    /// (`writer`) and starts the reader task. No message is sent.
    pub fn start(
        reader: BoxedReader,
        writer: BoxedWriter,
        options: LspClientOptions,
    ) -> Result<Self, SessionError> {
        let root_uri = Url::from_directory_path(&options.root)
            .map_err(|_| SessionError::InvalidPath(options.root.display().to_string()))?
            .to_string();
        let root_name = options
            .root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "workspace".to_string());

        let client = Self {
            writer: Arc::new(Mutex::new(writer)),
            state: Arc::new(std::sync::Mutex::new(LspState {
                next_id: 1,
                pending: HashMap::new(),
                closed: false,
            })),
            closed: Arc::new(AtomicBool::new(false)),
            root_uri,
            root_name,
            default_request_timeout: options.request_timeout,
        };

        client.spawn_reader(reader);
        Ok(client)
    }

    /// True once the server's output stream ended.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn initialize(&self, initialize_timeout: Option<Duration>) -> Result<Value, SessionError> {
        let params = json!({
            "processId": std::process::id(),
            "rootUri": self.root_uri,
            "capabilities": {
                "textDocument": {
                    "documentSymbol": {
                        "hierarchicalDocumentSymbolSupport": true
                    },
                    "hover": {
                        "contentFormat": ["markdown", "plaintext"]
                    },
                    "definition": {
                        "linkSupport": true
                    },
                    "synchronization": {
                        "didSave": false
                    }
                },
                "workspace": {
                    "configuration": true,
                    "workspaceFolders": true
                }
            },
            "workspaceFolders": [
                { "uri": self.root_uri, "name": self.root_name }
            ]
        });

        self.send_request_with_timeout("initialize", &params, initialize_timeout)
            .await
    }

    pub async fn initialized(&self) -> Result<(), SessionError> {
        self.send_notification("initialized", &json!({})).await
    }

    pub async fn did_open(
        &self,
        uri: &str,
        language_id: &str,
        version: i32,
        text: &str,
    ) -> Result<(), SessionError> {
        let params = LspDidOpenTextDocumentParams {
            text_document: LspTextDocumentItem {
                uri: uri.to_string(),
                language_id: language_id.to_string(),
                version,
                text: text.to_string(),
            },
        };
        self.send_notification("textDocument/didOpen", &params)
            .await
    }

    pub async fn did_change(&self, uri: &str, version: i32, text: &str) -> Result<(), SessionError> {
        let params = LspDidChangeTextDocumentParams {
            text_document: LspVersionedTextDocumentIdentifier {
                uri: uri.to_string(),
                version,
            },
            content_changes: vec![LspTextDocumentContentChangeEvent {
                text: text.to_string(),
            }],
        };
        self.send_notification("textDocument/didChange", &params)
            .await
    }

    pub async fn document_symbols(&self, uri: &str) -> Result<Value, SessionError> {
        let params = LspDocumentSymbolParams {
            text_document: LspTextDocumentIdentifier {
                uri: uri.to_string(),
            },
        };
        self.send_request("textDocument/documentSymbol", &params)
            .await
    }

    pub async fn hover(&self, uri: &str, position: LspPosition) -> Result<Value, SessionError> {
        self.send_request("textDocument/hover", &position_params(uri, position))
            .await
    }

    pub async fn definition(&self, uri: &str, position: LspPosition) -> Result<Value, SessionError> {
        self.send_request("textDocument/definition", &position_params(uri, position))
            .await
    }

    pub async fn references(
        &self,
        uri: &str,
        position: LspPosition,
        include_declaration: bool,
    ) -> Result<Value, SessionError> {
        let params = LspReferencesParams {
            text_document: LspTextDocumentIdentifier {
                uri: uri.to_string(),
            },
            position,
            context: LspReferenceContext {
                include_declaration,
            },
        };
        self.send_request("textDocument/references", &params)
            .await
    }

    pub async fn document_highlight(
        &self,
        uri: &str,
        position: LspPosition,
    ) -> Result<Value, SessionError> {
        self.send_request(
            "textDocument/documentHighlight",
            &position_params(uri, position),
        )
        .await
    }

    pub async fn shutdown(&self, request_timeout: Option<Duration>) -> Result<(), SessionError> {
        self.send_request_with_timeout("shutdown", &Value::Null, request_timeout)
            .await
            .map(|_| ())
    }

    pub async fn exit(&self) -> Result<(), SessionError> {
        self.send_notification("exit", &Value::Null).await
    }

    pub async fn send_request<T: Serialize>(
        &self,
        method: &str,
        params: &T,
    ) -> Result<Value, SessionError> {
        self.send_request_with_timeout(method, params, self.default_request_timeout)
            .await
    }

    pub async fn send_request_with_timeout<T: Serialize>(
        &self,
        method: &str,
        params: &T,
        request_timeout: Option<Duration>,
    ) -> Result<Value, SessionError> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut state = lock_state(&self.state);
            if state.closed {
                return Err(SessionError::Closed);
            }
            let id = state.next_id;
            state.next_id += 1;
            state.pending.insert(id, tx);
            id
        };
        let _pending = PendingGuard {
            state: &self.state,
            id,
        };

        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        debug!(id, method, "lsp request");
        write_message(&self.writer, &request).await?;

        let response = match request_timeout {
            Some(wait) => match timeout(wait, rx).await {
                Ok(received) => received,
                Err(_) => {
                    return Err(SessionError::Timeout {
                        method: method.to_string(),
                        timeout_ms: wait.as_millis() as u64,
                    });
                }
            },
            None => rx.await,
        };
        let response = response.map_err(|_| SessionError::Closed)?;

        if let Some(error) = response.get("error") {
            return Err(SessionError::Protocol {
                method: method.to_string(),
                code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            });
        }

        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    pub async fn send_notification<T: Serialize>(
        &self,
        method: &str,
        params: &T,
    ) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let notification = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        debug!(method, "lsp notification");
        write_message(&self.writer, &notification).await
    }

    fn spawn_reader(&self, reader: BoxedReader) {
        let state = self.state.clone();
        let writer = self.writer.clone();
        let closed = self.closed.clone();
        let root_uri = self.root_uri.clone();
        let root_name = self.root_name.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            loop {
                match read_lsp_message(&mut reader).await {
                    Ok(Some(message)) => {
                        handle_lsp_message(message, &state, &writer, &root_uri, &root_name).await;
                    }
                    Ok(None) => {
                        debug!("language server closed its output");
                        break;
                    }
                    Err(err) => {
                        warn!("failed to read LSP message: {err}");
                        break;
                    }
                }
            }

            let abandoned = {
                let mut guard = lock_state(&state);
                guard.closed = true;
                std::mem::take(&mut guard.pending)
            };
            closed.store(true, Ordering::Release);
            if !abandoned.is_empty() {
                debug!(count = abandoned.len(), "failing pending requests");
            }
        });
    }
}

fn position_params(uri: &str, position: LspPosition) -> LspTextDocumentPositionParams {
    LspTextDocumentPositionParams {
        text_document: LspTextDocumentIdentifier {
            uri: uri.to_string(),
        },
        position,
    }
}

async fn write_message(writer: &Mutex<BoxedWriter>, value: &Value) -> Result<(), SessionError> {
    let body = serde_json::to_vec(value)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    let mut writer = writer.lock().await;
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

fn lock_state(state: &std::sync::Mutex<LspState>) -> MutexGuard<'_, LspState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Forgets a request's pending entry when its caller stops waiting, whether
/// it finished, timed out or was dropped mid-flight.
struct PendingGuard<'a> {
    state: &'a std::sync::Mutex<LspState>,
    id: i64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock_state(self.state).pending.remove(&self.id);
    }
}

async fn handle_lsp_message(
    message: Value,
    state: &std::sync::Mutex<LspState>,
    writer: &Mutex<BoxedWriter>,
    root_uri: &str,
    root_name: &str,
) {
    let method = message.get("method").and_then(Value::as_str);
    let id = message.get("id").filter(|id| !id.is_null());

    match (method, id) {
        (Some(method), Some(id)) => {
            let response = match server_request_result(method, message.get("params"), root_uri, root_name) {
                Some(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
                None => {
                    debug!(method, "unsupported server request");
                    json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": { "code": -32601, "message": format!("method not found: {method}") }
                    })
                }
            };
            if let Err(err) = write_message(writer, &response).await {
                warn!(method, "failed to answer server request: {err}");
            }
        }
        (Some(method), None) => {
            debug!(method, params = ?message.get("params"), "lsp notification from server");
        }
        (None, Some(id)) => {
            let id = match id {
                Value::Number(n) => n.as_i64(),
                Value::String(s) => s.parse::<i64>().ok(),
                _ => None,
            };
            let Some(id) = id else {
                debug!("response with unsupported id type");
                return;
            };
            let tx = lock_state(state).pending.remove(&id);
            match tx {
                Some(tx) => {
                    let _ = tx.send(message);
                }
                None => debug!("received response for unknown id: {id}"),
            }
        }
        (None, None) => debug!("ignoring message without id or method"),
    }
}

/// Benign answers to server-initiated requests so servers do not stall
/// waiting on client features this bridge does not offer.
fn server_request_result(
    method: &str,
    params: Option<&Value>,
    root_uri: &str,
    root_name: &str,
) -> Option<Value> {
    match method {
        "workspace/configuration" => {
            let items = params
                .and_then(|p| p.get("items"))
                .and_then(Value::as_array)
                .map(Vec::len)
                .unwrap_or(0);
            Some(Value::Array(vec![Value::Null; items]))
        }
        "workspace/workspaceFolders" => Some(json!([{ "uri": root_uri, "name": root_name }])),
        "window/workDoneProgress/create"
        | "client/registerCapability"
        | "client/unregisterCapability"
        | "window/showMessageRequest" => Some(Value::Null),
        _ => None,
    }
}

pub(crate) async fn read_lsp_message<R>(reader: &mut R) -> io::Result<Option<Value>>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let line_trimmed = line.trim_end_matches(['\r', '\n']);
        if line_trimmed.is_empty() {
            break;
        }

        if let Some((name, value)) = line_trimmed.split_once(':')
            && name.trim().eq_ignore_ascii_case("content-length")
        {
            content_length = value.trim().parse::<usize>().ok();
        }
    }

    let Some(len) = content_length else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "missing Content-Length header",
        ));
    };

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    let value: Value = serde_json::from_slice(&buf)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    Ok(Some(value))
}

pub fn path_to_uri(path: &Path) -> Result<String, SessionError> {
    Url::from_file_path(path)
        .map_err(|_| SessionError::InvalidPath(path.display().to_string()))
        .map(|u| u.to_string())
}

pub fn uri_to_path(uri: &str) -> Option<PathBuf> {
    let url = Url::parse(uri).ok()?;
    if url.scheme() != "file" {
        return None;
    }
    url.to_file_path().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{DuplexStream, duplex};

    async fn write_raw(stream: &mut DuplexStream, value: &Value) {
        let body = serde_json::to_vec(value).unwrap();
        stream
            .write_all(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes())
            .await
            .unwrap();
        stream.write_all(&body).await.unwrap();
    }

    fn client_pair(request_timeout: Option<Duration>) -> (LspClient, BufReader<DuplexStream>, DuplexStream) {
        let (client_out, server_in) = duplex(64 * 1024);
        let (server_out, client_in) = duplex(64 * 1024);
        let client = LspClient::start(
            Box::new(client_in),
            Box::new(client_out),
            LspClientOptions {
                root: std::env::temp_dir(),
                request_timeout,
            },
        )
        .unwrap();
        (client, BufReader::new(server_in), server_out)
    }

    #[tokio::test]
    async fn reads_header_and_body() {
        let (mut a, b) = duplex(1024);
        write_raw(&mut a, &json!({"jsonrpc": "2.0", "id": 1, "result": null})).await;
        drop(a);

        let mut reader = BufReader::new(b);
        let message = read_lsp_message(&mut reader).await.unwrap().unwrap();
        assert_eq!(message["id"], 1);
        assert!(read_lsp_message(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_content_length_is_an_error() {
        let (mut a, b) = duplex(1024);
        a.write_all(b"Content-Type: json\r\n\r\n{}").await.unwrap();
        let mut reader = BufReader::new(b);
        assert!(read_lsp_message(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn responses_are_matched_by_id_out_of_order() {
        let (client, mut server_in, mut server_out) = client_pair(None);
        let client = Arc::new(client);

        let first = {
            let client = client.clone();
            tokio::spawn(async move { client.send_request("test/first", &json!({})).await })
        };
        let r1 = read_lsp_message(&mut server_in).await.unwrap().unwrap();
        let second = {
            let client = client.clone();
            tokio::spawn(async move { client.send_request("test/second", &json!({})).await })
        };
        let r2 = read_lsp_message(&mut server_in).await.unwrap().unwrap();
        assert_ne!(r1["id"], r2["id"]);

        write_raw(&mut server_out, &json!({"jsonrpc": "2.0", "id": r2["id"], "result": "two"})).await;
        write_raw(&mut server_out, &json!({"jsonrpc": "2.0", "id": r1["id"], "result": "one"})).await;

        assert_eq!(first.await.unwrap().unwrap(), json!("one"));
        assert_eq!(second.await.unwrap().unwrap(), json!("two"));
    }

    #[tokio::test]
    async fn error_response_becomes_protocol_error() {
        let (client, mut server_in, mut server_out) = client_pair(None);
        let pending = tokio::spawn(async move { client.send_request("textDocument/hover", &json!({})).await });

        let request = read_lsp_message(&mut server_in).await.unwrap().unwrap();
        write_raw(
            &mut server_out,
            &json!({"jsonrpc": "2.0", "id": request["id"], "error": {"code": -32603, "message": "boom"}}),
        )
        .await;

        match pending.await.unwrap() {
            Err(SessionError::Protocol { method, code, message }) => {
                assert_eq!(method, "textDocument/hover");
                assert_eq!(code, -32603);
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_exit_fails_pending_and_later_requests() {
        let (client, mut server_in, server_out) = client_pair(None);
        let client = Arc::new(client);
        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.send_request("textDocument/definition", &json!({})).await })
        };
        let _ = read_lsp_message(&mut server_in).await.unwrap().unwrap();
        drop(server_out);

        assert!(matches!(pending.await.unwrap(), Err(SessionError::Closed)));
        assert!(client.is_closed());
        assert!(matches!(
            client.send_request("textDocument/hover", &json!({})).await,
            Err(SessionError::Closed)
        ));
        assert!(matches!(client.exit().await, Err(SessionError::Closed)));
    }

    #[tokio::test]
    async fn request_timeout_is_reported() {
        let (client, mut server_in, _server_out) = client_pair(Some(Duration::from_millis(20)));
        let pending = tokio::spawn(async move { client.send_request("textDocument/references", &json!({})).await });
        let _ = read_lsp_message(&mut server_in).await.unwrap().unwrap();

        match pending.await.unwrap() {
            Err(SessionError::Timeout { method, timeout_ms }) => {
                assert_eq!(method, "textDocument/references");
                assert_eq!(timeout_ms, 20);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn timed_out_request_leaves_nothing_pending() {
        let (client, mut server_in, _server_out) = client_pair(Some(Duration::from_millis(20)));
        let result = {
            let params = json!({});
            let request = client.send_request("textDocument/hover", &params);
            let (result, _) = tokio::join!(request, read_lsp_message(&mut server_in));
            result
        };
        assert!(matches!(result, Err(SessionError::Timeout { .. })));
        assert!(lock_state(&client.state).pending.is_empty());
    }

    #[tokio::test]
    async fn dropped_request_forgets_its_pending_entry() {
        let (client, mut server_in, _server_out) = client_pair(None);
        let client = Arc::new(client);
        let request = {
            let client = client.clone();
            tokio::spawn(async move { client.send_request("textDocument/hover", &json!({})).await })
        };
        let _ = read_lsp_message(&mut server_in).await.unwrap().unwrap();
        assert_eq!(lock_state(&client.state).pending.len(), 1);

        request.abort();
        assert!(request.await.unwrap_err().is_cancelled());
        assert!(lock_state(&client.state).pending.is_empty());
    }

    #[tokio::test]
    async fn answers_server_requests() {
        let (_client, mut server_in, mut server_out) = client_pair(None);
        write_raw(
            &mut server_out,
            &json!({"jsonrpc": "2.0", "id": 7, "method": "workspace/configuration", "params": {"items": [{}, {}]}}),
        )
        .await;
        let reply = read_lsp_message(&mut server_in).await.unwrap().unwrap();
        assert_eq!(reply["id"], 7);
        assert_eq!(reply["result"], json!([null, null]));

        write_raw(
            &mut server_out,
            &json!({"jsonrpc": "2.0", "id": "x", "method": "custom/unknown"}),
        )
        .await;
        let reply = read_lsp_message(&mut server_in).await.unwrap().unwrap();
        assert_eq!(reply["id"], "x");
        assert_eq!(reply["error"]["code"], -32601);
    }

    #[test]
    fn uri_round_trip_and_non_file_scheme() {
        let path = std::env::temp_dir().join("a b").join("c.swift");
        let uri = path_to_uri(&path).unwrap();
        assert!(uri.starts_with("file://"));
        assert_eq!(uri_to_path(&uri), Some(path));
        assert_eq!(uri_to_path("https://example.com/x"), None);
    }
}
