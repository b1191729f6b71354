//! Wire types for the Codexa workspace session protocol.
//!
//! A client holds one WebSocket per workspace session. Every text frame is a JSON
//! envelope naming an event:
//!
//! ```text
//! client -> server   { "event": "createFile", "id": 7, "data": { "path": "a.txt" } }
//! server -> client   { "event": "ack", "id": 7, "data": { "success": true } }
//! server -> client   { "event": "terminal", "data": { "data": "$ " } }
//! ```
//!
//! Frames carrying an `id` are answered with exactly one `ack` frame. Server pushes
//! (`loaded`, `terminal`, `error`) never carry an `id`.

pub mod events;
pub mod payloads;
pub mod tree;

pub use events::{ClientEvent, ClientFrame, FrameError, ServerFrame};
pub use payloads::*;
pub use tree::{FileNode, NodeKind, ROOT_NODE_ID};
