//! Frame envelopes and event dispatch.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::payloads::*;
use crate::tree::FileNode;

// ============================================================================
// Event names
// ============================================================================

pub mod names {
    // Server pushes
    pub const LOADED: &str = "loaded";
    pub const TERMINAL: &str = "terminal";
    pub const ACK: &str = "ack";
    pub const ERROR: &str = "error";

    // Filesystem
    pub const FETCH_DIR: &str = "fetchDir";
    pub const FETCH_CONTENT: &str = "fetchContent";
    pub const UPDATE_CONTENT: &str = "updateContent";
    pub const CREATE_FILE: &str = "createFile";
    pub const CREATE_FOLDER: &str = "createFolder";
    pub const RENAME_FILE: &str = "renameFile";
    pub const DELETE_FILE: &str = "deleteFile";
    pub const MOVE_FILE: &str = "moveFile";

    // Terminal
    pub const REQUEST_TERMINAL: &str = "requestTerminal";
    pub const TERMINAL_DATA: &str = "terminalData";
    pub const RESIZE_TERMINAL: &str = "resizeTerminal";

    // Ports
    pub const CHECK_PORT: &str = "checkPort";
    pub const FORWARD_PORT: &str = "forwardPort";
    pub const STOP_PORT_FORWARD: &str = "stopPortForward";
    pub const KILL_PORT: &str = "killPort";

    /// Events answered with `{ success, error? }`.
    pub const MUTATIONS: &[&str] = &[
        UPDATE_CONTENT,
        CREATE_FILE,
        CREATE_FOLDER,
        RENAME_FILE,
        DELETE_FILE,
        MOVE_FILE,
    ];

    pub fn is_mutation(event: &str) -> bool {
        MUTATIONS.contains(&event)
    }
}

// ============================================================================
// Client -> server
// ============================================================================

/// Raw inbound envelope. `data` is decoded per event by [`ClientFrame::decode`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFrame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default)]
    pub data: Value,
}

/// A decoded client event.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Relative directory to list; empty for the workspace root.
    FetchDir(String),
    FetchContent(PathPayload),
    UpdateContent(UpdateContent),
    CreateFile(CreateFile),
    CreateFolder(PathPayload),
    RenameFile(RenamePayload),
    DeleteFile(PathPayload),
    MoveFile(MovePayload),
    RequestTerminal(TerminalRequest),
    TerminalData(TerminalData),
    ResizeTerminal(TerminalSize),
    CheckPort(PortPayload),
    ForwardPort(PortPayload),
    StopPortForward(PortPayload),
    KillPort(PortPayload),
}

impl ClientEvent {
    /// Filesystem mutations answer with an [`OpResult`].
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            ClientEvent::UpdateContent(_)
                | ClientEvent::CreateFile(_)
                | ClientEvent::CreateFolder(_)
                | ClientEvent::RenameFile(_)
                | ClientEvent::DeleteFile(_)
                | ClientEvent::MoveFile(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("unknown event: {0}")]
    UnknownEvent(String),

    #[error("invalid payload for {event}: {source}")]
    InvalidPayload {
        event: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        serde_json::from_str(text).map_err(FrameError::Malformed)
    }

    pub fn decode(&self) -> Result<ClientEvent, FrameError> {
        use names::*;

        let event = match self.event.as_str() {
            FETCH_DIR => ClientEvent::FetchDir(match &self.data {
                Value::Null => String::new(),
                Value::String(dir) => dir.clone(),
                // Accept `{ "path": ... }` as well as the bare string form.
                _ => self.payload::<PathPayload>()?.path,
            }),
            FETCH_CONTENT => ClientEvent::FetchContent(self.payload()?),
            UPDATE_CONTENT => ClientEvent::UpdateContent(self.payload()?),
            CREATE_FILE => ClientEvent::CreateFile(self.payload()?),
            CREATE_FOLDER => ClientEvent::CreateFolder(self.payload()?),
            RENAME_FILE => ClientEvent::RenameFile(self.payload()?),
            DELETE_FILE => ClientEvent::DeleteFile(self.payload()?),
            MOVE_FILE => ClientEvent::MoveFile(self.payload()?),
            REQUEST_TERMINAL => ClientEvent::RequestTerminal(if self.data.is_null() {
                TerminalRequest::default()
            } else {
                self.payload()?
            }),
            TERMINAL_DATA => ClientEvent::TerminalData(match &self.data {
                Value::String(data) => TerminalData { data: data.clone() },
                _ => self.payload()?,
            }),
            RESIZE_TERMINAL => ClientEvent::ResizeTerminal(self.payload()?),
            CHECK_PORT => ClientEvent::CheckPort(self.payload()?),
            FORWARD_PORT => ClientEvent::ForwardPort(self.payload()?),
            STOP_PORT_FORWARD => ClientEvent::StopPortForward(self.payload()?),
            KILL_PORT => ClientEvent::KillPort(self.payload()?),
            other => return Err(FrameError::UnknownEvent(other.to_string())),
        };
        Ok(event)
    }

    fn payload<T: DeserializeOwned>(&self) -> Result<T, FrameError> {
        serde_json::from_value(self.data.clone()).map_err(|source| FrameError::InvalidPayload {
            event: self.event.clone(),
            source,
        })
    }
}

// ============================================================================
// Server -> client
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerFrame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub data: Value,
}

impl ServerFrame {
    pub fn push(event: &str, data: impl Serialize) -> Self {
        Self {
            event: event.to_string(),
            id: None,
            data: serde_json::to_value(data).unwrap_or(Value::Null),
        }
    }

    pub fn ack(id: u64, data: impl Serialize) -> Self {
        Self {
            event: names::ACK.to_string(),
            id: Some(id),
            data: serde_json::to_value(data).unwrap_or(Value::Null),
        }
    }

    pub fn loaded(root_content: Vec<FileNode>) -> Self {
        Self::push(names::LOADED, LoadedPayload { root_content })
    }

    pub fn terminal(data: impl Into<String>) -> Self {
        Self::push(names::TERMINAL, TerminalData { data: data.into() })
    }

    pub fn error(message: impl Into<String>, event: Option<String>, id: Option<u64>) -> Self {
        Self::push(
            names::ERROR,
            ErrorPayload {
                message: message.into(),
                event,
                id,
            },
        )
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(text: &str) -> Result<ClientEvent, FrameError> {
        ClientFrame::parse(text)?.decode()
    }

    #[test]
    fn fetch_dir_accepts_bare_string_and_null() {
        match decode(r#"{"event":"fetchDir","id":1,"data":"src"}"#).unwrap() {
            ClientEvent::FetchDir(dir) => assert_eq!(dir, "src"),
            other => panic!("unexpected {:?}", other),
        }
        match decode(r#"{"event":"fetchDir"}"#).unwrap() {
            ClientEvent::FetchDir(dir) => assert!(dir.is_empty()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn move_payload_uses_camel_case() {
        let event =
            decode(r#"{"event":"moveFile","data":{"sourcePath":"a.txt","targetPath":"b/a.txt"}}"#)
                .unwrap();
        match event {
            ClientEvent::MoveFile(m) => {
                assert_eq!(m.source_path, "a.txt");
                assert_eq!(m.target_path, "b/a.txt");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn create_file_content_is_optional() {
        match decode(r#"{"event":"createFile","data":{"path":"x"}}"#).unwrap() {
            ClientEvent::CreateFile(c) => assert!(c.content.is_none()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn request_terminal_without_data() {
        assert!(matches!(
            decode(r#"{"event":"requestTerminal"}"#),
            Ok(ClientEvent::RequestTerminal(_))
        ));
    }

    #[test]
    fn unknown_and_invalid_events_are_errors() {
        assert!(matches!(
            decode(r#"{"event":"launchMissiles"}"#),
            Err(FrameError::UnknownEvent(_))
        ));
        assert!(matches!(
            decode(r#"{"event":"checkPort","data":{"port":"abc"}}"#),
            Err(FrameError::InvalidPayload { .. })
        ));
        assert!(matches!(decode("not json"), Err(FrameError::Malformed(_))));
    }

    #[test]
    fn frame_errors_render_and_chain_their_cause() {
        use std::error::Error as _;

        let err = decode(r#"{"event":"launchMissiles"}"#).unwrap_err();
        assert_eq!(err.to_string(), "unknown event: launchMissiles");
        assert!(err.source().is_none());

        let err = decode(r#"{"event":"checkPort","data":{"port":"abc"}}"#).unwrap_err();
        assert!(err.to_string().starts_with("invalid payload for checkPort: "));
        assert!(err.source().is_some());

        let err = decode("not json").unwrap_err();
        assert!(err.to_string().starts_with("malformed frame: "));
        assert!(err.source().is_some());
    }

    #[test]
    fn mutation_names_match_decoded_events() {
        let frame = ClientFrame::parse(r#"{"event":"deleteFile","data":{"path":"a"}}"#).unwrap();
        assert!(names::is_mutation(&frame.event));
        assert!(frame.decode().unwrap().is_mutation());
        assert!(!names::is_mutation(names::FETCH_CONTENT));
    }

    #[test]
    fn ack_frame_carries_id() {
        let frame = ServerFrame::ack(9, OpResult::ok());
        let json: Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(json["event"], "ack");
        assert_eq!(json["id"], 9);
        assert_eq!(json["data"]["success"], true);
        assert!(json["data"].get("error").is_none());
    }

    #[test]
    fn pushes_have_no_id() {
        let json: Value = serde_json::from_str(&ServerFrame::terminal("hi").to_json()).unwrap();
        assert_eq!(json["event"], "terminal");
        assert_eq!(json["data"]["data"], "hi");
        assert!(json.get("id").is_none());
    }
}
