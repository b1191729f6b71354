//! Background watcher for out-of-band workspace changes.
//!
//! Catches files written behind the gateway's back (build output, `git
//! checkout`, editors in the terminal) and mirrors them through the
//! [`SyncAdapter`]. Events are debounced per path: every event for a path resets
//! that path's deadline, and the path is synced once it has been quiet for the
//! debounce window.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ignore::IgnoreRules;
use crate::paths;
use crate::sync::SyncAdapter;

const EVENT_BUFFER: usize = 256;
/// Idle wake-up when no path is pending.
const IDLE_TICK: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct WatcherOptions {
    pub debounce: Duration,
    /// Files larger than this are not synced by the watcher.
    pub max_file_bytes: u64,
    pub ignore: IgnoreRules,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(1000),
            max_file_bytes: 10 * 1024 * 1024,
            ignore: IgnoreRules::default(),
        }
    }
}

/// Handle to a running watcher. Dropping it cancels the watch and every pending
/// debounce timer.
pub struct WorkspaceWatcher {
    root: PathBuf,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for WorkspaceWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceWatcher")
            .field("root", &self.root)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl WorkspaceWatcher {
    /// Start watching `root` recursively. Must be called inside a tokio runtime.
    pub fn start(
        root: impl Into<PathBuf>,
        sync: SyncAdapter,
        options: WatcherOptions,
    ) -> notify::Result<Self> {
        let root = root.into();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if tx.blocking_send(res).is_err() {
                debug!("File watch channel closed");
            }
        })?;
        watcher.watch(&root, RecursiveMode::Recursive)?;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            watcher,
            rx,
            root.clone(),
            sync,
            options,
            cancel.clone(),
        ));
        info!("Watching {}", root.display());

        Ok(Self {
            root,
            cancel,
            task: Some(task),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Cancel the watch without waiting for the loop to exit.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel and wait until the notify watcher has been dropped.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!("Watcher task for {} ended abnormally: {}", self.root.display(), e);
        }
    }
}

impl Drop for WorkspaceWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run<W: Watcher + Send + 'static>(
    watcher: W,
    mut rx: mpsc::Receiver<notify::Result<Event>>,
    root: PathBuf,
    sync: SyncAdapter,
    options: WatcherOptions,
    cancel: CancellationToken,
) {
    // Dropped together with this future, which stops the OS-level watch.
    let _watcher = watcher;
    let mut pending: HashMap<String, Instant> = HashMap::new();

    loop {
        let next_deadline = pending.values().min().copied();
        let wake_at = next_deadline.unwrap_or_else(|| Instant::now() + IDLE_TICK);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            incoming = rx.recv() => {
                match incoming {
                    Some(Ok(event)) => {
                        if matches!(event.kind, EventKind::Access(_)) {
                            continue;
                        }
                        for path in event.paths {
                            let Some(rel) = paths::relative_to(&root, &path) else {
                                continue;
                            };
                            if rel.is_empty() || options.ignore.is_ignored(&rel) {
                                continue;
                            }
                            pending.insert(rel, Instant::now() + options.debounce);
                        }
                    }
                    Some(Err(err)) => {
                        warn!("Watcher error: {:?}", err);
                    }
                    None => break,
                }
            }
            _ = sleep_until(wake_at), if next_deadline.is_some() => {
                let now = Instant::now();
                let due: Vec<String> = pending
                    .iter()
                    .filter(|(_, deadline)| **deadline <= now)
                    .map(|(rel, _)| rel.clone())
                    .collect();
                for rel in due {
                    pending.remove(&rel);
                    // Detached so an in-flight upload survives session teardown.
                    tokio::spawn(sync_path(
                        root.clone(),
                        rel,
                        sync.clone(),
                        options.max_file_bytes,
                    ));
                }
            }
        }
    }

    if !pending.is_empty() {
        debug!("Dropping {} pending watcher paths", pending.len());
    }
    debug!("Watcher for {} stopped", root.display());
}

/// Re-read one path and mirror its current state.
async fn sync_path(root: PathBuf, rel: String, sync: SyncAdapter, max_file_bytes: u64) {
    let mut abs = root;
    abs.extend(rel.split('/'));

    let result = match tokio::fs::symlink_metadata(&abs).await {
        Ok(meta) if meta.is_dir() => sync.push_folder(&rel).await,
        Ok(meta) if meta.is_file() => {
            if meta.len() > max_file_bytes {
                debug!("Not syncing {}: {} bytes exceeds limit", rel, meta.len());
                return;
            }
            match tokio::fs::read(&abs).await {
                Ok(content) => sync.push_file(&rel, Bytes::from(content)).await.map(|_| ()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    sync.remove_tree(&rel).await.map(|_| ())
                }
                Err(e) => {
                    warn!("Watcher could not read {}: {}", rel, e);
                    return;
                }
            }
        }
        Ok(_) => return,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            sync.remove_tree(&rel).await.map(|_| ())
        }
        Err(e) => {
            warn!("Watcher could not stat {}: {}", rel, e);
            return;
        }
    };

    if let Err(e) = result {
        warn!("Watcher sync failed for {}/{}: {}", sync.prefix(), rel, e);
    }
}
