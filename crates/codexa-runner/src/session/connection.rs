//! One WebSocket connection, from upgrade to teardown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use codexa_files::{GatewayError, WorkspaceFs, WorkspaceWatcher};
use codexa_protocol::events::names;
use codexa_protocol::{ClientEvent, ClientFrame, FileNode, FrameError, OpResult, ServerFrame};
use futures::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::registry::SessionInfo;
use crate::api::AppState;
use crate::terminal::OutputSink;

/// Workspace id from a `Host` value: the first DNS label, port stripped.
///
/// `demo.codexa.dev:443` yields `demo`. Labels outside `[A-Za-z0-9_-]` are refused.
pub fn workspace_id_from_host(host: &str) -> Option<String> {
    let host = host.trim();
    let without_port = match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    };
    let label = without_port.split('.').next()?;
    let valid = !label.is_empty()
        && label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    valid.then(|| label.to_string())
}

enum Outbound {
    Frame(ServerFrame),
    Ping,
}

/// Filesystem mutations run one at a time, in arrival order.
type MutationQueue = mpsc::UnboundedSender<(ClientEvent, Option<u64>)>;

/// Per-connection state shared by the receive loop and dispatched handlers.
struct Session {
    state: AppState,
    info: Arc<SessionInfo>,
    fs: WorkspaceFs,
    outbound: mpsc::UnboundedSender<Outbound>,
    watcher: Mutex<Option<WorkspaceWatcher>>,
    closed: AtomicBool,
}

impl Session {
    fn connection_id(&self) -> &str {
        &self.info.connection_id
    }

    fn send(&self, frame: ServerFrame) {
        if self.outbound.send(Outbound::Frame(frame)).is_err() {
            debug!("Dropping frame for closed session {}", self.connection_id());
        }
    }

    fn reply(&self, id: Option<u64>, data: impl serde::Serialize) {
        if let Some(id) = id {
            self.send(ServerFrame::ack(id, data));
        }
    }

    /// Ack a mutation, or push an error when the client did not ask for an ack.
    fn reply_op(&self, event: &str, id: Option<u64>, result: Result<(), GatewayError>) {
        match (result, id) {
            (Ok(()), id) => self.reply(id, OpResult::ok()),
            (Err(e), Some(id)) => {
                debug!("{} failed: {}", event, e);
                self.send(ServerFrame::ack(id, OpResult::failed(e.to_string())));
            }
            (Err(e), None) => {
                warn!("{} failed: {}", event, e);
                self.send(ServerFrame::error(e.to_string(), Some(event.to_string()), None));
            }
        }
    }

    fn terminal_sink(&self) -> OutputSink {
        let outbound = self.outbound.clone();
        Arc::new(move |text: String| {
            let _ = outbound.send(Outbound::Frame(ServerFrame::terminal(text)));
        })
    }

    /// Release everything the session owns. Runs once.
    async fn teardown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(watcher) = self.watcher.lock().await.take() {
            watcher.shutdown().await;
        }
        self.state.terminals.destroy(self.connection_id());
        self.state.sessions.unregister(self.connection_id());
    }
}

/// Drive a connection for `workspace_id` until the client goes away.
pub async fn handle_socket(socket: WebSocket, state: AppState, workspace_id: String) {
    let connection_id = Uuid::new_v4().to_string();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();

    let writer_id = connection_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(item) = outbound_rx.recv().await {
            let message = match item {
                Outbound::Frame(frame) => Message::Text(frame.to_json().into()),
                Outbound::Ping => Message::Ping(Bytes::new()),
            };
            if ws_sender.send(message).await.is_err() {
                debug!("Writer for {} stopped: socket closed", writer_id);
                break;
            }
        }
    });

    let info = Arc::new(SessionInfo::new(connection_id.clone(), workspace_id.clone()));
    state.sessions.register(info.clone());

    let fs = state.workspace_fs(&workspace_id);
    let watcher = start_watcher(&state, &fs);
    let session = Arc::new(Session {
        state: state.clone(),
        info,
        fs,
        outbound,
        watcher: Mutex::new(watcher),
        closed: AtomicBool::new(false),
    });

    let root_content = match session.fs.snapshot().await {
        Ok(nodes) => nodes,
        Err(e) => {
            warn!("Initial listing for {} failed: {}", workspace_id, e);
            Vec::new()
        }
    };
    session.send(ServerFrame::loaded(root_content));

    let (mutations, mut mutation_rx): (MutationQueue, _) = mpsc::unbounded_channel();
    let mutator = {
        let session = session.clone();
        tokio::spawn(async move {
            while let Some((event, id)) = mutation_rx.recv().await {
                dispatch(&session, event, id).await;
            }
        })
    };

    let period = Duration::from_secs(state.config.server.ping_interval_secs.max(1));
    let mut ping = tokio::time::interval_at(Instant::now() + period, period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                let Some(msg) = msg else { break };
                session.info.touch();
                match msg {
                    Ok(Message::Text(text)) => handle_text(&session, &mutations, text.as_str()).await,
                    Ok(Message::Binary(_)) => {
                        session.send(ServerFrame::error("Binary frames are not supported", None, None));
                    }
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        debug!("WebSocket error on {}: {}", connection_id, e);
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                if session.outbound.send(Outbound::Ping).is_err() {
                    break;
                }
            }
        }
    }

    drop(mutations);
    if let Err(e) = mutator.await {
        warn!("Mutation queue for {} failed: {}", connection_id, e);
    }
    session.teardown().await;
    writer.abort();
    info!("Connection {} closed", connection_id);
}

fn start_watcher(state: &AppState, fs: &WorkspaceFs) -> Option<WorkspaceWatcher> {
    if !state.config.watcher.enabled {
        return None;
    }
    if !fs.root().is_dir() {
        warn!("Workspace root {} does not exist; not watching", fs.root().display());
        return None;
    }
    match WorkspaceWatcher::start(fs.root(), fs.sync().clone(), state.config.watcher.options()) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!("Failed to watch {}: {}", fs.root().display(), e);
            None
        }
    }
}

async fn handle_text(session: &Arc<Session>, mutations: &MutationQueue, text: &str) {
    let frame = match ClientFrame::parse(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!("Malformed frame on {}: {}", session.connection_id(), e);
            session.send(ServerFrame::error(e.to_string(), None, None));
            return;
        }
    };

    let id = frame.id;
    let event = match frame.decode() {
        Ok(event) => event,
        Err(e) => {
            reject(session, &frame, e);
            return;
        }
    };

    match event {
        // Terminal traffic stays on the receive loop so keystrokes keep their order.
        ClientEvent::RequestTerminal(request) => {
            let size = request.cols.zip(request.rows);
            if let Err(e) = session
                .state
                .terminals
                .open(session.connection_id(), size, session.terminal_sink())
                .await
            {
                debug!("Terminal request on {} failed: {}", session.connection_id(), e);
            }
        }
        ClientEvent::TerminalData(input) => {
            session
                .state
                .terminals
                .write(session.connection_id(), input.data.as_bytes());
        }
        ClientEvent::ResizeTerminal(size) => {
            if let Err(e) =
                session
                    .state
                    .terminals
                    .resize(session.connection_id(), size.cols, size.rows)
            {
                debug!("Resize on {} ignored: {}", session.connection_id(), e);
            }
        }
        mutation if mutation.is_mutation() => {
            if mutations.send((mutation, id)).is_err() {
                debug!("Mutation queue closed on {}", session.connection_id());
            }
        }
        other => {
            let session = session.clone();
            tokio::spawn(async move { dispatch(&session, other, id).await });
        }
    }
}

fn reject(session: &Session, frame: &ClientFrame, error: FrameError) {
    debug!("Rejected {} on {}: {}", frame.event, session.connection_id(), error);
    let message = error.to_string();
    let event = match error {
        FrameError::Malformed(_) => None,
        _ => Some(frame.event.clone()),
    };
    if let Some(id) = frame.id
        && names::is_mutation(&frame.event)
    {
        session.send(ServerFrame::ack(id, OpResult::failed(message.clone())));
    }
    session.send(ServerFrame::error(message, event, frame.id));
}

async fn dispatch(session: &Session, event: ClientEvent, id: Option<u64>) {
    let fs = &session.fs;
    match event {
        ClientEvent::FetchDir(dir) => {
            let nodes: Vec<FileNode> = match fs.list(&dir).await {
                Ok(nodes) => nodes,
                Err(e) => {
                    debug!("fetchDir {:?} failed: {}", dir, e);
                    session.send(ServerFrame::error(
                        e.to_string(),
                        Some(names::FETCH_DIR.to_string()),
                        id,
                    ));
                    Vec::new()
                }
            };
            session.reply(id, nodes);
        }
        ClientEvent::FetchContent(payload) => {
            let content = match fs.read(&payload.path).await {
                Ok(content) => content,
                Err(e) => {
                    debug!("fetchContent {:?} failed: {}", payload.path, e);
                    String::new()
                }
            };
            session.reply(id, content);
        }
        ClientEvent::UpdateContent(payload) => {
            let result = fs.write(&payload.path, &payload.content).await;
            session.reply_op(names::UPDATE_CONTENT, id, result);
        }
        ClientEvent::CreateFile(payload) => {
            let result = fs
                .create_file(&payload.path, payload.content.as_deref())
                .await;
            session.reply_op(names::CREATE_FILE, id, result);
        }
        ClientEvent::CreateFolder(payload) => {
            let result = fs.create_folder(&payload.path).await;
            session.reply_op(names::CREATE_FOLDER, id, result);
        }
        ClientEvent::RenameFile(payload) => {
            let result = fs.rename(&payload.old_path, &payload.new_path).await;
            session.reply_op(names::RENAME_FILE, id, result);
        }
        ClientEvent::DeleteFile(payload) => {
            let result = fs.delete(&payload.path).await;
            session.reply_op(names::DELETE_FILE, id, result);
        }
        ClientEvent::MoveFile(payload) => {
            let result = fs
                .move_entry(&payload.source_path, &payload.target_path)
                .await;
            session.reply_op(names::MOVE_FILE, id, result);
        }
        ClientEvent::CheckPort(payload) => {
            let check = session.state.ports.check(payload.port).await;
            session.reply(id, check);
        }
        ClientEvent::ForwardPort(payload) => {
            let result = session
                .state
                .ports
                .forward(&session.info.workspace_id, payload.port)
                .await;
            if result.success {
                session.info.expose_port(payload.port);
            }
            session.reply(id, result);
        }
        ClientEvent::StopPortForward(payload) => {
            session.info.unexpose_port(payload.port);
            session.reply(id, session.state.ports.stop(payload.port));
        }
        ClientEvent::KillPort(payload) => {
            let result = session.state.ports.kill(payload.port).await;
            session.reply(id, result);
        }
        ClientEvent::RequestTerminal(_)
        | ClientEvent::TerminalData(_)
        | ClientEvent::ResizeTerminal(_) => {
            debug!("Terminal event reached the dispatcher; ignoring");
        }
    }
}
