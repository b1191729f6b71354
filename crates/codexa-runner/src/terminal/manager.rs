use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use portable_pty::{CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{TerminalError, TerminalResult, Utf8Decoder};
use crate::config::TerminalConfig;

/// Written to the client when the shell dies without being asked to.
pub const UNEXPECTED_EXIT_NOTICE: &str =
    "\r\n\x1b[31mTerminal session ended unexpectedly. Reconnecting...\x1b[0m\r\n";

const READ_BUFFER: usize = 8192;
const PROMPT: &str =
    r"\[\033[01;32m\]\u@\h\[\033[00m\]:\[\033[01;34m\]\w\[\033[00m\]\$ ";

/// Receives decoded terminal output.
pub type OutputSink = Arc<dyn Fn(String) + Send + Sync>;

/// Everything needed to spawn a shell.
#[derive(Debug, Clone)]
pub struct TerminalOptions {
    pub shell: String,
    pub args: Vec<String>,
    pub cols: u16,
    pub rows: u16,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub grace_period: Duration,
    pub banner: bool,
    pub banner_delay: Duration,
}

impl TerminalOptions {
    pub fn from_config(config: &TerminalConfig, workspace_root: PathBuf) -> Self {
        let home = workspace_root.to_string_lossy().into_owned();
        let mut env: Vec<(String, String)> = [
            ("TERM", "xterm-256color"),
            ("COLORTERM", "truecolor"),
            ("PS1", PROMPT),
            ("HOME", home.as_str()),
            ("USER", config.user.as_str()),
            ("SHELL", config.shell.as_str()),
            ("FORCE_COLOR", "1"),
            ("NPM_CONFIG_COLOR", "always"),
            ("CLICOLOR", "1"),
            ("CLICOLOR_FORCE", "1"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        env.extend(config.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        Self {
            shell: config.shell.clone(),
            args: config.args.clone(),
            cols: config.cols,
            rows: config.rows,
            cwd: workspace_root,
            env,
            grace_period: Duration::from_millis(config.grace_period_ms),
            banner: config.banner,
            banner_delay: Duration::from_millis(config.banner_delay_ms),
        }
    }

    fn banner_text(&self) -> String {
        format!(
            "\r\n\x1b[32mTerminal ready! Interactive mode enabled.\x1b[0m\r\n\x1b[36mWorkspace: {}\x1b[0m\r\n",
            self.cwd.display()
        )
    }
}

/// Snapshot of a terminal for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalStatus {
    pub pid: Option<u32>,
    pub generation: u64,
    pub running: bool,
    pub exit_code: Option<u32>,
}

#[derive(Debug)]
struct ExitState {
    terminating: AtomicBool,
    exit_code: Mutex<Option<u32>>,
    exited: watch::Sender<bool>,
}

impl ExitState {
    fn new() -> Self {
        let (exited, _) = watch::channel(false);
        Self {
            terminating: AtomicBool::new(false),
            exit_code: Mutex::new(None),
            exited,
        }
    }

    fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }

    fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }
}

struct TerminalHandle {
    generation: u64,
    pid: Option<u32>,
    input: mpsc::UnboundedSender<Bytes>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    state: Arc<ExitState>,
}

/// Owns every live shell, at most one per key.
///
/// Must be used from within a Tokio runtime.
#[derive(Clone)]
pub struct TerminalManager {
    terminals: Arc<DashMap<String, Arc<TerminalHandle>>>,
    next_generation: Arc<AtomicU64>,
    options: Arc<TerminalOptions>,
}

impl std::fmt::Debug for TerminalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalManager")
            .field("terminals", &self.terminals.len())
            .field("shell", &self.options.shell)
            .finish()
    }
}

impl TerminalManager {
    pub fn new(options: TerminalOptions) -> Self {
        Self {
            terminals: Arc::new(DashMap::new()),
            next_generation: Arc::new(AtomicU64::new(1)),
            options: Arc::new(options),
        }
    }

    pub fn options(&self) -> &TerminalOptions {
        &self.options
    }

    /// Number of live terminals.
    pub fn count(&self) -> usize {
        self.terminals.len()
    }

    /// Spawn a fresh shell for `key`, replacing any existing one.
    ///
    /// Output is delivered through `sink`. A spawn failure is reported both as
    /// an error and as a red line on the sink.
    pub fn create(
        &self,
        key: &str,
        size: Option<(u16, u16)>,
        sink: OutputSink,
    ) -> TerminalResult<u64> {
        if let Some((_, previous)) = self.terminals.remove(key) {
            debug!(
                "Replacing terminal for {} (generation {})",
                key, previous.generation
            );
            self.terminate(previous);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let handle = match self.spawn(key, generation, size, sink.clone()) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Failed to start terminal for {}: {}", key, e);
                sink(format!(
                    "\r\n\x1b[31mFailed to start terminal: {}\x1b[0m\r\n",
                    e
                ));
                return Err(e);
            }
        };

        if self.options.banner {
            let state = handle.state.clone();
            let delay = self.options.banner_delay;
            let banner = self.options.banner_text();
            let sink = sink.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if !state.is_terminating() && !state.has_exited() {
                    sink(banner);
                }
            });
        }

        info!(
            "Terminal started for {} (pid {:?}, generation {})",
            key, handle.pid, generation
        );
        if let Some(displaced) = self.terminals.insert(key.to_string(), handle) {
            self.terminate(displaced);
        }
        Ok(generation)
    }

    /// [`create`](Self::create) on the blocking pool, for callers on an async task.
    pub async fn open(
        &self,
        key: &str,
        size: Option<(u16, u16)>,
        sink: OutputSink,
    ) -> TerminalResult<u64> {
        let manager = self.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || manager.create(&key, size, sink))
            .await
            .map_err(|e| TerminalError::Io(format!("terminal spawn task failed: {}", e)))?
    }

    fn spawn(
        &self,
        key: &str,
        generation: u64,
        size: Option<(u16, u16)>,
        sink: OutputSink,
    ) -> TerminalResult<Arc<TerminalHandle>> {
        let (cols, rows) = size.unwrap_or((self.options.cols, self.options.rows));
        let pair = native_pty_system()
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TerminalError::Open(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&self.options.shell);
        cmd.args(&self.options.args);
        cmd.cwd(&self.options.cwd);
        for (name, value) in &self.options.env {
            cmd.env(name, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TerminalError::Spawn {
                shell: self.options.shell.clone(),
                reason: e.to_string(),
            })?;
        drop(pair.slave);
        let pid = child.process_id();

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| TerminalError::Io(e.to_string()))?;
        let mut writer = pair
            .master
            .take_writer()
            .map_err(|e| TerminalError::Io(e.to_string()))?;

        let state = Arc::new(ExitState::new());
        let (input, mut input_rx) = mpsc::unbounded_channel::<Bytes>();

        // PTY -> client
        let read_state = state.clone();
        let read_sink = sink.clone();
        thread::spawn(move || {
            let mut decoder = Utf8Decoder::new();
            let mut buf = [0u8; READ_BUFFER];
            loop {
                let n = match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let text = decoder.decode(&buf[..n]);
                if !text.is_empty() && !read_state.is_terminating() {
                    read_sink(text);
                }
            }
            let tail = decoder.finish();
            if !tail.is_empty() && !read_state.is_terminating() {
                read_sink(tail);
            }
        });

        // client -> PTY
        thread::spawn(move || {
            while let Some(chunk) = input_rx.blocking_recv() {
                if writer.write_all(&chunk).and_then(|_| writer.flush()).is_err() {
                    break;
                }
            }
        });

        let wait_state = state.clone();
        let terminals = self.terminals.clone();
        let wait_key = key.to_string();
        thread::spawn(move || {
            let status = child.wait();
            let (code, success) = match &status {
                Ok(status) => (Some(status.exit_code()), status.success()),
                Err(_) => (None, false),
            };
            if let Ok(mut exit_code) = wait_state.exit_code.lock() {
                *exit_code = code;
            }
            wait_state.exited.send_replace(true);
            terminals.remove_if(&wait_key, |_, handle| handle.generation == generation);

            if wait_state.is_terminating() {
                debug!("Terminal for {} exited after termination", wait_key);
            } else if success {
                info!("Terminal for {} exited", wait_key);
            } else {
                warn!("Terminal for {} exited unexpectedly ({:?})", wait_key, code);
                sink(UNEXPECTED_EXIT_NOTICE.to_string());
            }
        });

        Ok(Arc::new(TerminalHandle {
            generation,
            pid,
            input,
            master: Mutex::new(pair.master),
            state,
        }))
    }

    /// Forward keystrokes. Unknown keys are ignored.
    pub fn write(&self, key: &str, data: &[u8]) -> bool {
        let Some(handle) = self.terminals.get(key) else {
            debug!("Dropping input for {}: no terminal", key);
            return false;
        };
        handle.input.send(Bytes::copy_from_slice(data)).is_ok()
    }

    pub fn resize(&self, key: &str, cols: u16, rows: u16) -> TerminalResult<()> {
        let handle = self
            .terminals
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TerminalError::NotFound(key.to_string()))?;
        let master = handle
            .master
            .lock()
            .map_err(|_| TerminalError::Io("pty master lock poisoned".to_string()))?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TerminalError::Io(e.to_string()))
    }

    /// Stop the terminal for `key`. Safe to call repeatedly.
    pub fn destroy(&self, key: &str) -> bool {
        match self.terminals.remove(key) {
            Some((_, handle)) => {
                debug!("Destroying terminal for {}", key);
                self.terminate(handle);
                true
            }
            None => false,
        }
    }

    pub fn status(&self, key: &str) -> Option<TerminalStatus> {
        let handle = self.terminals.get(key)?;
        let exit_code = handle.state.exit_code.lock().ok().and_then(|code| *code);
        Some(TerminalStatus {
            pid: handle.pid,
            generation: handle.generation,
            running: !handle.state.has_exited(),
            exit_code,
        })
    }

    /// SIGHUP and SIGTERM to the shell's process group, SIGKILL after the grace period.
    fn terminate(&self, handle: Arc<TerminalHandle>) {
        if handle.state.terminating.swap(true, Ordering::SeqCst) {
            return;
        }
        if handle.state.has_exited() {
            return;
        }
        let Some(pid) = handle.pid else {
            return;
        };

        signal_group(pid, libc::SIGHUP);
        signal_group(pid, libc::SIGTERM);

        let grace = self.options.grace_period;
        tokio::spawn(async move {
            let mut exited = handle.state.exited.subscribe();
            let finished = tokio::time::timeout(grace, exited.wait_for(|done| *done)).await;
            if finished.is_err() {
                warn!("Terminal pid {} ignored SIGTERM, sending SIGKILL", pid);
                signal_group(pid, libc::SIGKILL);
            }
            drop(handle);
        });
    }
}

/// Signal the process group led by `pid`, falling back to the process itself.
fn signal_group(pid: u32, signal: libc::c_int) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    let group = unsafe { libc::kill(-pid, signal) };
    if group != 0 {
        unsafe {
            libc::kill(pid, signal);
        }
    }
}
