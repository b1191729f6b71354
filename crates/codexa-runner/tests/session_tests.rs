//! End-to-end session scenarios over a real WebSocket.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use codexa_files::storage::LocalStore;
use codexa_runner::{AppConfig, AppState, serve};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    state: AppState,
    workspace: TempDir,
    storage: TempDir,
    _shutdown: oneshot::Sender<()>,
}

impl TestServer {
    async fn start() -> Self {
        let workspace = TempDir::new().unwrap();
        let storage = TempDir::new().unwrap();
        std::fs::write(workspace.path().join("readme.md"), "# demo").unwrap();

        let mut config = AppConfig::default();
        config.workspace.root = workspace.path().to_path_buf();
        config.terminal.shell = "sh".to_string();
        config.terminal.args = Vec::new();
        config.terminal.banner = false;
        config.terminal.grace_period_ms = 300;

        let state = AppState::new(config, Arc::new(LocalStore::new(storage.path())));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let server_state = state.clone();
        tokio::spawn(async move {
            serve(listener, server_state, async move {
                let _ = rx.await;
            })
            .await
            .unwrap();
        });

        Self {
            addr,
            state,
            workspace,
            storage,
            _shutdown: tx,
        }
    }

    async fn connect_as(&self, host: &'static str) -> Result<Client, WsError> {
        let mut request = format!("ws://{}/ws", self.addr).into_client_request()?;
        request
            .headers_mut()
            .insert("host", HeaderValue::from_static(host));
        connect_async(request).await.map(|(ws, _)| ws)
    }

    /// Connect as workspace `demo` and consume the initial `loaded` push.
    async fn connect(&self) -> (Client, Value) {
        let mut ws = self.connect_as("demo.localhost").await.unwrap();
        let loaded = next_json(&mut ws).await;
        assert_eq!(loaded["event"], "loaded");
        (ws, loaded)
    }
}

async fn next_json(ws: &mut Client) -> Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let msg = tokio::time::timeout_at(deadline, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn send(ws: &mut Client, frame: Value) {
    ws.send(Message::Text(frame.to_string().into())).await.unwrap();
}

/// Send a request and wait for its ack, skipping unrelated frames.
async fn request(ws: &mut Client, id: u64, event: &str, data: Value) -> Value {
    send(ws, json!({ "event": event, "id": id, "data": data })).await;
    loop {
        let frame = next_json(ws).await;
        if frame["event"] == "ack" && frame["id"] == id {
            return frame["data"].clone();
        }
    }
}

async fn wait_for_terminal(ws: &mut Client, needle: &str) -> String {
    let mut seen = String::new();
    loop {
        let frame = next_json(ws).await;
        if frame["event"] == "terminal" {
            seen.push_str(frame["data"]["data"].as_str().unwrap_or_default());
            if seen.contains(needle) {
                return seen;
            }
        }
    }
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

fn stored(storage: &Path, key: &str) -> Option<String> {
    std::fs::read_to_string(storage.join(key)).ok()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_initial_push_lists_workspace() {
    let server = TestServer::start().await;
    let (_ws, loaded) = server.connect().await;

    let nodes = loaded["data"]["rootContent"].as_array().unwrap();
    let readme = nodes.iter().find(|n| n["name"] == "readme.md").unwrap();
    assert_eq!(readme["type"], "file");
    assert_eq!(readme["path"], "readme.md");
    assert_eq!(readme["content"], "");
    assert_eq!(server.state.sessions.count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_folder_file_list_and_fetch() {
    let server = TestServer::start().await;
    let (mut ws, _) = server.connect().await;

    let created = request(&mut ws, 1, "createFolder", json!({ "path": "src/lib" })).await;
    assert_eq!(created["success"], true);
    let created = request(
        &mut ws,
        2,
        "createFile",
        json!({ "path": "src/lib/a.txt", "content": "hi" }),
    )
    .await;
    assert_eq!(created["success"], true);

    let src = request(&mut ws, 3, "fetchDir", json!("src")).await;
    let src = src.as_array().unwrap();
    assert_eq!(src.len(), 1);
    assert_eq!(src[0]["name"], "lib");
    assert_eq!(src[0]["type"], "dir");

    let lib = request(&mut ws, 4, "fetchDir", json!("src/lib")).await;
    let lib = lib.as_array().unwrap();
    assert_eq!(lib.len(), 1);
    assert_eq!(lib[0]["name"], "a.txt");
    assert!(lib[0].get("content").is_none());

    let content = request(&mut ws, 5, "fetchContent", json!({ "path": "src/lib/a.txt" })).await;
    assert_eq!(content, "hi");

    assert_eq!(
        stored(server.storage.path(), "code/demo/src/lib/a.txt").as_deref(),
        Some("hi")
    );
    assert!(server.storage.path().join("code/demo/src/lib").is_dir());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rename_move_and_delete_sync() {
    let server = TestServer::start().await;
    let (mut ws, _) = server.connect().await;
    let storage = server.storage.path();

    request(&mut ws, 1, "createFile", json!({ "path": "old.txt", "content": "x" })).await;
    let renamed = request(
        &mut ws,
        2,
        "renameFile",
        json!({ "oldPath": "old.txt", "newPath": "new.txt" }),
    )
    .await;
    assert_eq!(renamed["success"], true);
    assert!(server.workspace.path().join("new.txt").exists());
    assert_eq!(stored(storage, "code/demo/new.txt").as_deref(), Some("x"));
    assert!(stored(storage, "code/demo/old.txt").is_none());

    let moved = request(
        &mut ws,
        3,
        "moveFile",
        json!({ "sourcePath": "new.txt", "targetPath": "docs/new.txt" }),
    )
    .await;
    assert_eq!(moved["success"], true);
    assert_eq!(stored(storage, "code/demo/docs/new.txt").as_deref(), Some("x"));

    let deleted = request(&mut ws, 4, "deleteFile", json!({ "path": "docs" })).await;
    assert_eq!(deleted["success"], true);
    assert!(!server.workspace.path().join("docs").exists());
    assert!(stored(storage, "code/demo/docs/new.txt").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_traversal_is_rejected_without_touching_disk() {
    let server = TestServer::start().await;
    let (mut ws, _) = server.connect().await;

    for (id, path) in [(1, "../escape.txt"), (2, "/etc/passwd"), (3, "a/../../b")] {
        let result = request(&mut ws, id, "createFile", json!({ "path": path, "content": "x" })).await;
        assert_eq!(result["success"], false, "{path} should be rejected");
        assert!(result["error"].as_str().is_some());
    }
    let parent = server.workspace.path().parent().unwrap();
    assert!(!parent.join("escape.txt").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_update_content_acks_only_with_id() {
    let server = TestServer::start().await;
    let (mut ws, _) = server.connect().await;

    send(
        &mut ws,
        json!({ "event": "updateContent", "data": { "path": "draft.txt", "content": "one" } }),
    )
    .await;
    let updated = request(
        &mut ws,
        7,
        "updateContent",
        json!({ "path": "notes.txt", "content": "two" }),
    )
    .await;
    assert_eq!(updated["success"], true);

    let content = request(&mut ws, 8, "fetchContent", json!({ "path": "notes.txt" })).await;
    assert_eq!(content, "two");

    let draft = server.workspace.path().join("draft.txt");
    assert!(eventually(|| std::fs::read_to_string(&draft).is_ok_and(|c| c == "one")).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rapid_updates_apply_in_order() {
    let server = TestServer::start().await;
    let (mut ws, _) = server.connect().await;
    let storage = server.storage.path();

    for round in 0..10u64 {
        for i in 0..40 {
            let body = format!("{}-{}\n{}", round, i, "x".repeat(32 * 1024));
            send(
                &mut ws,
                json!({ "event": "updateContent", "data": { "path": "race.txt", "content": body } }),
            )
            .await;
        }
        let last = format!("final-{}", round);
        let acked = request(
            &mut ws,
            round + 1,
            "updateContent",
            json!({ "path": "race.txt", "content": last }),
        )
        .await;
        assert_eq!(acked["success"], true);

        let on_disk = std::fs::read_to_string(server.workspace.path().join("race.txt")).unwrap();
        assert_eq!(on_disk, last, "round {}", round);
        assert!(
            eventually(|| stored(storage, "code/demo/race.txt").as_deref() == Some(last.as_str()))
                .await,
            "round {}",
            round
        );
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_terminal_round_trip_and_teardown() {
    let server = TestServer::start().await;
    let (mut ws, _) = server.connect().await;

    send(&mut ws, json!({ "event": "requestTerminal" })).await;
    send(
        &mut ws,
        json!({ "event": "terminalData", "data": { "data": "echo ready-$((6*7))\n" } }),
    )
    .await;
    let output = wait_for_terminal(&mut ws, "ready-42").await;
    assert!(!output.contains("ended unexpectedly"));
    assert_eq!(server.state.terminals.count(), 1);

    // A second request replaces the shell rather than adding one.
    send(&mut ws, json!({ "event": "requestTerminal", "data": { "cols": 100, "rows": 30 } })).await;
    send(
        &mut ws,
        json!({ "event": "terminalData", "data": { "data": "echo again-$((1+1))\n" } }),
    )
    .await;
    wait_for_terminal(&mut ws, "again-2").await;
    assert_eq!(server.state.terminals.count(), 1);

    ws.close(None).await.unwrap();
    let state = server.state.clone();
    assert!(eventually(|| state.sessions.count() == 0).await);
    assert!(eventually(|| state.terminals.count() == 0).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_check_port_polarity() {
    let server = TestServer::start().await;
    let (mut ws, _) = server.connect().await;

    let port = {
        let probe = std::net::TcpListener::bind(("0.0.0.0", 0)).unwrap();
        probe.local_addr().unwrap().port()
    };
    let free = request(&mut ws, 1, "checkPort", json!({ "port": port })).await;
    assert_eq!(free, json!({ "available": true, "port": port }));

    let _listener = std::net::TcpListener::bind(("0.0.0.0", port)).unwrap();
    let busy = request(&mut ws, 2, "checkPort", json!({ "port": port })).await;
    assert_eq!(busy, json!({ "available": false, "port": port }));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_forward_and_stop_port() {
    let server = TestServer::start().await;
    let (mut ws, _) = server.connect().await;

    let rejected = request(&mut ws, 1, "forwardPort", json!({ "port": 9 })).await;
    assert_eq!(rejected["success"], false);
    assert!(
        rejected["error"]
            .as_str()
            .unwrap()
            .starts_with("Port 9 is not supported. Supported ports: 3000")
    );

    let stopped = request(&mut ws, 2, "stopPortForward", json!({ "port": 3000 })).await;
    assert_eq!(stopped, json!({ "success": true, "port": 3000 }));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_protocol_errors_keep_session_open() {
    let server = TestServer::start().await;
    let (mut ws, _) = server.connect().await;

    send(&mut ws, json!({ "event": "launchMissiles", "id": 1 })).await;
    let error = next_json(&mut ws).await;
    assert_eq!(error["event"], "error");
    assert_eq!(error["data"]["event"], "launchMissiles");

    ws.send(Message::Text("not json".to_string().into())).await.unwrap();
    let error = next_json(&mut ws).await;
    assert_eq!(error["event"], "error");

    let failed = request(&mut ws, 2, "renameFile", json!({ "oldPath": 5 })).await;
    assert_eq!(failed["success"], false);

    ws.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();
    let error = next_json(&mut ws).await;
    assert_eq!(error["event"], "error");

    let content = request(&mut ws, 3, "fetchContent", json!({ "path": "readme.md" })).await;
    assert_eq!(content, "# demo");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_host_without_workspace_is_refused() {
    let server = TestServer::start().await;

    match server.connect_as("bad!host").await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 400),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("connection should have been refused"),
    }
    assert_eq!(server.state.sessions.count(), 0);
}
