//! Session manager.
//!
//! A session lives exactly as long as its WebSocket. It owns a filesystem
//! gateway scoped to its workspace, a watcher, and at most one terminal.

mod connection;
mod registry;

pub use connection::{handle_socket, workspace_id_from_host};
pub use registry::{SessionInfo, SessionRegistry};
