use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use sourcelens_core::framing::encode_frame;
use sourcelens_core::key::SessionKey;
use sourcelens_host::{
    BridgeService, FileSettingsStore, RegistryInvalidator, SdkLocator, ServiceOptions, serve,
};
use sourcelens_lsp::testing::FakeLauncher;
use sourcelens_lsp::{RegistryOptions, SessionRegistry};
use sourcelens_sync::testing::RecordingRunner;
use sourcelens_sync::{SyncEngine, SyncOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};
use tokio::task::JoinHandle;
use tokio::time::{Duration, timeout};

struct FixedSdk;

#[async_trait]
impl SdkLocator for FixedSdk {
    async fn sdk_path(&self, sdk: &str) -> Option<String> {
        Some(format!("/Applications/Xcode.app/SDKs/{sdk}.sdk"))
    }
}

struct Harness {
    _tmp: tempfile::TempDir,
    root: PathBuf,
    launcher: Arc<FakeLauncher>,
    runner: Arc<RecordingRunner>,
    registry: Arc<SessionRegistry>,
    input: Option<DuplexStream>,
    output: DuplexStream,
    server: JoinHandle<anyhow::Result<()>>,
}

fn scratch() -> (tempfile::TempDir, PathBuf) {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().canonicalize().unwrap().join("checkouts");
    std::fs::create_dir_all(&root).unwrap();
    (tmp, root)
}

impl Harness {
    fn new(launcher: FakeLauncher, runner: RecordingRunner, build: &[&str]) -> Self {
        let (tmp, root) = scratch();
        Self::in_dir(tmp, root, launcher, runner, build)
    }

    fn in_dir(
        tmp: tempfile::TempDir,
        root: PathBuf,
        launcher: FakeLauncher,
        runner: RecordingRunner,
        build: &[&str],
    ) -> Self {
        let launcher = Arc::new(launcher);
        let runner = Arc::new(runner);
        let registry = Arc::new(SessionRegistry::new(
            launcher.clone(),
            RegistryOptions {
                checkout_root: root.clone(),
                server: Default::default(),
                default_command: "fake-lsp".to_string(),
            },
        ));
        let sync = Arc::new(SyncEngine::new(
            SyncOptions {
                checkout_root: root.clone(),
                git_command: "git".to_string(),
                build_command: build.iter().map(|s| s.to_string()).collect(),
                command_timeout: None,
            },
            runner.clone(),
            Arc::new(RegistryInvalidator::new(registry.clone())),
        ));
        let settings = FileSettingsStore::new(tmp.path().join("settings.json"));
        let service = BridgeService::new(
            registry.clone(),
            sync,
            Arc::new(settings),
            ServiceOptions {
                progress_poll: Duration::from_millis(200),
            },
        )
        .with_sdk_locator(Arc::new(FixedSdk));

        let (input, server_reader) = duplex(1024 * 1024);
        let (server_writer, output) = duplex(1024 * 1024);
        let server = tokio::spawn(serve(Arc::new(service), server_reader, server_writer));

        Self {
            _tmp: tmp,
            root,
            launcher,
            runner,
            registry,
            input: Some(input),
            output,
            server,
        }
    }

    fn checkout(&self, slug: &str) -> PathBuf {
        SessionKey::new("github.com", slug).checkout_path(&self.root)
    }

    async fn send(&mut self, name: &str, user_info: Value) {
        let frame = encode_frame(&json!({
            "messageName": name,
            "tabId": 7,
            "userInfo": user_info,
        }))
        .unwrap();
        let input = self.input.as_mut().unwrap();
        input.write_all(&frame).await.unwrap();
        input.flush().await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        timeout(Duration::from_secs(10), async {
            let mut prefix = [0u8; 4];
            self.output.read_exact(&mut prefix).await.unwrap();
            let mut body = vec![0u8; u32::from_le_bytes(prefix) as usize];
            self.output.read_exact(&mut body).await.unwrap();
            serde_json::from_slice(&body).unwrap()
        })
        .await
        .expect("no reply within 10s")
    }

    async fn call(&mut self, name: &str, user_info: Value) -> Value {
        self.send(name, user_info).await;
        self.recv().await
    }

    async fn close_input(&mut self) -> anyhow::Result<()> {
        drop(self.input.take());
        (&mut self.server).await.unwrap()
    }
}

fn document(filepath: &str) -> Value {
    json!({ "resource": "github.com", "slug": "apple/swift-nio", "filepath": filepath })
}

fn open(filepath: &str, text: &str) -> Value {
    let mut args = document(filepath);
    args["text"] = json!(text);
    args
}

fn position(filepath: &str, line: u32, character: u32, text: &str) -> Value {
    let mut args = document(filepath);
    args["line"] = json!(line);
    args["character"] = json!(character);
    args["text"] = json!(text);
    args
}

fn symbols_response() -> Value {
    json!([{
        "name": "Channel",
        "kind": 11,
        "range": { "start": { "line": 2, "character": 0 }, "end": { "line": 9, "character": 1 } },
        "selectionRange": { "start": { "line": 2, "character": 16 }, "end": { "line": 2, "character": 23 } },
        "children": [{
            "name": "flush()",
            "kind": 6,
            "range": { "start": { "line": 4, "character": 4 }, "end": { "line": 4, "character": 16 } },
            "selectionRange": { "start": { "line": 4, "character": 9 }, "end": { "line": 4, "character": 14 } }
        }]
    }])
}

#[tokio::test]
async fn did_open_replies_with_document_symbols() {
    let mut h = Harness::new(
        FakeLauncher::new().with_response("textDocument/documentSymbol", symbols_response()),
        RecordingRunner::new(),
        &[],
    );

    let reply = h
        .call("didOpen", open("Sources/NIO/Channel.swift", "import Foundation\n"))
        .await;
    assert_eq!(reply["request"], "documentSymbol");
    assert_eq!(reply["result"], "success");
    assert_eq!(reply["tabId"], 7);
    assert_eq!(reply["userInfo"]["filepath"], "Sources/NIO/Channel.swift");
    assert_eq!(reply["value"][0]["name"], "Channel");
    assert_eq!(reply["value"][0]["kind"], "interface");
    assert_eq!(reply["value"][1]["name"], "flush()");
    assert_eq!(reply["value"][1]["kind"], "method");
    assert_eq!(reply["value"][1]["indent"], 1);

    assert_eq!(
        h.launcher.received_methods(),
        vec![
            "initialize",
            "initialized",
            "textDocument/didOpen",
            "textDocument/documentSymbol"
        ]
    );
    assert_eq!(h.launcher.launch_count(), 1);

    let reply = h
        .call("didOpen", open("Sources/NIO/Channel.swift", "import Foundation\n"))
        .await;
    assert_eq!(reply["result"], "success");
    assert_eq!(h.launcher.launch_count(), 1);
}

#[tokio::test]
async fn hover_adjusts_character_and_echoes_position() {
    let mut h = Harness::new(
        FakeLauncher::new().with_response(
            "textDocument/hover",
            json!({ "contents": { "kind": "markdown", "value": "```swift\nfunc flush()\n```" } }),
        ),
        RecordingRunner::new(),
        &[],
    );
    h.call("didOpen", open("Sources/NIO/Channel.swift", "x")).await;

    let reply = h
        .call("hover", position("Sources/NIO/Channel.swift", 4, 8, " .flush"))
        .await;
    assert_eq!(reply["request"], "hover");
    assert_eq!(reply["result"], "success");
    assert_eq!(reply["value"], "```swift\nfunc flush()\n```");
    assert_eq!(reply["line"], 4);
    assert_eq!(reply["character"], 8);
    assert_eq!(reply["text"], " .flush");

    let params = h.launcher.received_params("textDocument/hover").unwrap();
    assert_eq!(params["position"], json!({ "line": 4, "character": 10 }));
}

#[tokio::test]
async fn definition_and_references_carry_line_numbers() {
    let (tmp, root) = scratch();
    let checkout = SessionKey::new("github.com", "apple/swift-nio").checkout_path(&root);
    std::fs::create_dir_all(checkout.join("Sources")).unwrap();
    let target = checkout.join("Sources").join("Lib.swift");
    std::fs::write(&target, "import Foundation\n  public func flush() {}\n").unwrap();

    let location = json!([{
        "uri": sourcelens_lsp::path_to_uri(&target).unwrap(),
        "range": { "start": { "line": 1, "character": 14 }, "end": { "line": 1, "character": 19 } }
    }]);
    let mut h = Harness::in_dir(
        tmp,
        root,
        FakeLauncher::new()
            .with_response("textDocument/definition", location.clone())
            .with_response("textDocument/references", location),
        RecordingRunner::new(),
        &[],
    );
    h.call("didOpen", open("Sources/Main.swift", "flush()")).await;

    let reply = h
        .call("definition", position("Sources/Main.swift", 0, 0, "flush"))
        .await;
    assert_eq!(reply["result"], "success");
    let location = &reply["value"]["locations"][0];
    assert_eq!(location["uri"], "Sources/Lib.swift");
    assert_eq!(location["filename"], "Lib.swift");
    assert_eq!(location["lineNumber"], 2);
    assert_eq!(location["content"], "  public func flush() {}\n");

    let reply = h
        .call("references", position("Sources/Main.swift", 0, 0, "flush"))
        .await;
    assert_eq!(reply["result"], "success");
    let location = &reply["value"]["locations"][0];
    assert_eq!(location["lineNumber"], 2);
    assert_eq!(location["content"], "public func flush() {}");
}

#[tokio::test]
async fn requests_before_did_open_fail_without_launching() {
    let mut h = Harness::new(FakeLauncher::new(), RecordingRunner::new(), &[]);

    let reply = h
        .call("hover", position("Sources/NIO/Channel.swift", 1, 1, "x"))
        .await;
    assert_eq!(reply["request"], "hover");
    assert_eq!(reply["result"], "error");
    assert!(reply["message"].as_str().unwrap().contains("not running"));

    let reply = h
        .call("definition", json!({ "resource": "github.com", "slug": "apple/swift-nio" }))
        .await;
    assert_eq!(reply["result"], "error");

    let reply = h.call("rename", json!({})).await;
    assert_eq!(reply["request"], "rename");
    assert_eq!(reply["result"], "error");

    assert_eq!(h.launcher.launch_count(), 0);
    assert!(h.registry.is_empty());
}

#[tokio::test]
async fn initialize_clones_once_then_skips() {
    let mut h = Harness::new(FakeLauncher::new(), RecordingRunner::new(), &[]);
    let page = json!({
        "resource": "github.com",
        "href": "https://github.com/apple/swift-nio/blob/main/Sources/NIO/Channel.swift"
    });

    let reply = h.call("initialize", page.clone()).await;
    assert_eq!(reply["request"], "initialize");
    assert_eq!(reply["result"], "success");
    assert!(h.checkout("apple/swift-nio").is_dir());

    let reply = h.call("initialize", page).await;
    assert_eq!(reply["result"], "skip");

    let invocations = h.runner.invocations();
    assert_eq!(invocations.len(), 1);
    assert_eq!(invocations[0].args[4], "https://github.com/apple/swift-nio.git");
}

#[tokio::test]
async fn initialize_reports_failure_and_skips_when_disabled() {
    let mut h = Harness::new(
        FakeLauncher::new(),
        RecordingRunner::new().failing_program("git", 128),
        &[],
    );
    let page = json!({ "resource": "github.com", "href": "https://github.com/o/r" });

    let reply = h.call("initialize", page.clone()).await;
    assert_eq!(reply["result"], "failure");
    assert!(reply["message"].as_str().unwrap().contains("exit code 128"));

    let reply = h.call("updateSettings", json!({ "auto_checkout": 0 })).await;
    assert_eq!(reply["result"], "success");
    let reply = h.call("initialize", page).await;
    assert_eq!(reply["result"], "skip");
    assert_eq!(h.runner.invocations().len(), 1);
}

#[tokio::test]
async fn initialize_rejects_non_repository_pages() {
    let mut h = Harness::new(FakeLauncher::new(), RecordingRunner::new(), &[]);

    for href in ["https://github.com/trending", "https://gitlab.com/o/r"] {
        let reply = h
            .call("initialize", json!({ "resource": "github.com", "href": href }))
            .await;
        assert_eq!(reply["result"], "error", "{href}");
    }
    assert!(h.runner.invocations().is_empty());
}

#[tokio::test]
async fn successful_build_closes_and_evicts_previous_session() {
    let mut h = Harness::new(FakeLauncher::new(), RecordingRunner::new(), &["swift", "build"]);
    std::fs::create_dir_all(h.checkout("apple/swift-nio")).unwrap();
    let key = SessionKey::new("github.com", "apple/swift-nio");

    h.call("didOpen", open("Package.swift", "// swift-tools-version:5.1\n"))
        .await;
    assert!(h.registry.contains(&key));

    let reply = h
        .call(
            "checkoutRepository",
            json!({ "url": "https://github.com/apple/swift-nio.git" }),
        )
        .await;
    assert_eq!(reply["result"], "success");
    assert!(reply["value"]["lastUpdate"].as_str().unwrap().ends_with('Z'));

    let invocations = h.runner.invocations();
    assert_eq!(invocations.len(), 2);
    assert_eq!(invocations[0].args[0], "pull");
    assert_eq!(invocations[1].program, "swift");

    assert!(!h.registry.contains(&key));
    let methods = h.launcher.received_methods();
    assert!(methods.contains(&"shutdown".to_string()));
    assert!(methods.contains(&"exit".to_string()));

    let reply = h
        .call("didOpen", open("Package.swift", "// swift-tools-version:5.1\n"))
        .await;
    assert_eq!(reply["result"], "success");
    assert_eq!(h.launcher.launch_count(), 2);

    let reply = h.call("buildProgress", json!({ "resource": "github.com" })).await;
    assert_eq!(reply["value"]["complete"], true);
    assert_eq!(reply["value"]["failed"], false);
    assert!(reply["value"]["text"].as_str().unwrap().contains("$ swift build"));
}

#[tokio::test]
async fn build_progress_is_reported_per_repository() {
    let mut h = Harness::new(
        FakeLauncher::new(),
        RecordingRunner::new()
            .with_output("Receiving objects\n")
            .failing_when("o/broken", 1),
        &[],
    );

    let reply = h
        .call("checkoutRepository", json!({ "url": "https://github.com/o/broken" }))
        .await;
    assert_eq!(reply["result"], "failure");
    let reply = h
        .call("checkoutRepository", json!({ "url": "https://github.com/o/works" }))
        .await;
    assert_eq!(reply["result"], "success");

    let reply = h
        .call("buildProgress", json!({ "resource": "github.com", "slug": "o/broken" }))
        .await;
    assert_eq!(reply["value"]["complete"], true);
    assert_eq!(reply["value"]["failed"], true);
    assert!(reply["value"]["text"].as_str().unwrap().contains("exit code 1"));

    let reply = h
        .call("buildProgress", json!({ "resource": "github.com", "slug": "o/works" }))
        .await;
    assert_eq!(reply["value"]["complete"], true);
    assert_eq!(reply["value"]["failed"], false);
    assert!(!reply["value"]["text"].as_str().unwrap().contains("exit code"));

    let reply = h.call("buildProgress", json!({ "resource": "github.com" })).await;
    assert_eq!(reply["value"]["failed"], false);

    let reply = h.call("buildProgress", json!({ "resource": "gitlab.com" })).await;
    assert_eq!(reply["result"], "success");
    assert_eq!(reply["value"], json!({ "text": "", "complete": false, "failed": false }));
}

#[tokio::test]
async fn repository_info_and_delete() {
    let mut h = Harness::new(FakeLauncher::new(), RecordingRunner::new(), &[]);
    let url = json!({ "url": "https://github.com/o/r" });

    let reply = h.call("repository", url.clone()).await;
    assert_eq!(reply["result"], "error");

    std::fs::create_dir_all(h.checkout("o/r")).unwrap();
    let reply = h.call("repository", url.clone()).await;
    assert_eq!(reply["result"], "success");
    assert_eq!(
        reply["value"]["localCheckoutDirectory"],
        h.checkout("o/r").display().to_string()
    );

    let reply = h.call("deleteRepository", url.clone()).await;
    assert_eq!(reply["result"], "success");
    assert!(!h.checkout("o/r").exists());
    assert!(h.runner.invocations().is_empty());
}

#[tokio::test]
async fn settings_round_trip_resolves_sdk_path() {
    let mut h = Harness::new(FakeLauncher::new(), RecordingRunner::new(), &[]);

    let reply = h.call("settings", Value::Null).await;
    assert_eq!(reply["result"], "success");
    assert_eq!(reply["value"]["auto_checkout"], true);

    let reply = h
        .call(
            "updateSettings",
            json!({
                "server": "custom",
                "server_path": "/opt/lsp/sourcekit-lsp",
                "sdk": "iphonesimulator",
                "target": "x86_64-apple-ios13.0-simulator",
                "toolchain": "",
                "auto_checkout": 1,
                "access_token_github": ""
            }),
        )
        .await;
    assert_eq!(reply["result"], "success");

    let reply = h.call("settings", Value::Null).await;
    assert_eq!(reply["value"]["server"], "custom");
    assert_eq!(
        reply["value"]["sdk_path"],
        "/Applications/Xcode.app/SDKs/iphonesimulator.sdk"
    );

    h.call("didOpen", open("a.swift", "x")).await;
    let spec = h.launcher.last_spec().unwrap();
    assert_eq!(spec.command, "/opt/lsp/sourcekit-lsp");
    assert!(spec.args.contains(&"x86_64-apple-ios13.0-simulator".to_string()));
}

#[tokio::test]
async fn end_of_input_exits_every_session() {
    let mut h = Harness::new(FakeLauncher::new(), RecordingRunner::new(), &[]);
    h.call("didOpen", open("a.swift", "x")).await;
    assert_eq!(h.registry.len(), 1);

    h.close_input().await.unwrap();
    assert!(h.registry.is_empty());
    assert!(h.launcher.wait_for_method("exit").await);
}

#[tokio::test]
async fn reset_closes_sessions() {
    let mut h = Harness::new(FakeLauncher::new(), RecordingRunner::new(), &[]);
    h.call("didOpen", open("a.swift", "x")).await;

    let reply = h.call("reset", json!({})).await;
    assert_eq!(reply["result"], "success");
    assert!(h.registry.is_empty());

    let reply = h.call("exit", json!({ "resource": "github.com", "slug": "apple/swift-nio" })).await;
    assert_eq!(reply["result"], "success");
    assert_eq!(reply["value"]["removed"], false);
}
