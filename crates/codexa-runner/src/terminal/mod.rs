//! Pseudo-terminal sessions.
//!
//! One interactive shell per connection, keyed by connection id. The manager
//! guarantees that a key never maps to more than one live process.

mod decoder;
mod manager;

use thiserror::Error;

pub use decoder::Utf8Decoder;
pub use manager::{
    OutputSink, TerminalManager, TerminalOptions, TerminalStatus, UNEXPECTED_EXIT_NOTICE,
};

#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("failed to open pty: {0}")]
    Open(String),

    #[error("failed to spawn {shell}: {reason}")]
    Spawn { shell: String, reason: String },

    #[error("pty io error: {0}")]
    Io(String),

    #[error("no terminal for session {0}")]
    NotFound(String),
}

pub type TerminalResult<T> = Result<T, TerminalError>;
