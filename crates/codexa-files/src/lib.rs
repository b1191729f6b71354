//! Workspace filesystem access for the Codexa runner.
//!
//! The local workspace directory is the source of truth while a session is live.
//! Every mutation made through [`WorkspaceFs`] is mirrored to object storage by the
//! [`SyncAdapter`], and [`WorkspaceWatcher`] catches writes made behind the
//! gateway's back (compilers, package managers, the terminal).

pub mod error;
pub mod gateway;
pub mod ignore;
pub mod paths;
pub mod storage;
pub mod sync;
pub mod watcher;

pub use error::{GatewayError, GatewayResult};
pub use gateway::WorkspaceFs;
pub use ignore::{IgnoreRules, default_ignored_dirs};
pub use storage::{ObjectStore, StorageConfig, StorageError, StorageResult, create_store};
pub use sync::SyncAdapter;
pub use watcher::{WatcherOptions, WorkspaceWatcher};
