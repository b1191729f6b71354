//! Application state shared across handlers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use codexa_files::{ObjectStore, SyncAdapter, WorkspaceFs};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::AppConfig;
use crate::ports::PortService;
use crate::session::SessionRegistry;
use crate::terminal::{TerminalManager, TerminalOptions};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn ObjectStore>,
    pub terminals: TerminalManager,
    pub ports: Arc<PortService>,
    pub sessions: Arc<SessionRegistry>,
    pub started_at: Instant,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("workspace_root", &self.config.workspace.root)
            .field("store", &self.store.name())
            .field("sessions", &self.sessions.count())
            .finish()
    }
}

impl AppState {
    pub fn new(config: AppConfig, store: Arc<dyn ObjectStore>) -> Self {
        let terminals = TerminalManager::new(TerminalOptions::from_config(
            &config.terminal,
            config.workspace.root.clone(),
        ));
        let ports = Arc::new(PortService::from_config(&config.ports));
        Self {
            config: Arc::new(config),
            store,
            terminals,
            ports,
            sessions: Arc::new(SessionRegistry::new()),
            started_at: Instant::now(),
        }
    }

    /// Filesystem gateway for one workspace, syncing under `<prefix>/<workspace_id>`.
    pub fn workspace_fs(&self, workspace_id: &str) -> WorkspaceFs {
        let sync = SyncAdapter::for_workspace(
            self.store.clone(),
            &self.config.storage.prefix,
            workspace_id,
        );
        WorkspaceFs::new(self.config.workspace.root.clone(), sync)
            .with_ignore(self.config.watcher.ignore_rules())
            .with_snapshot_depth(self.config.workspace.snapshot_depth)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Periodically flag idle sessions until `cancel` fires.
    pub fn spawn_idle_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let sessions = self.sessions.clone();
        let every = Duration::from_secs(self.config.server.idle_sweep_secs.max(1));
        let threshold = Duration::from_secs(self.config.server.idle_threshold_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let flagged = sessions.sweep_idle(threshold);
                        if flagged > 0 {
                            debug!("Flagged {} idle session(s)", flagged);
                        }
                    }
                }
            }
        })
    }
}
