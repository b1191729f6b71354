//! Runner configuration.
//!
//! Layered the usual way: built-in defaults, then an optional TOML file, then
//! `CODEXA__SECTION__KEY` environment variables.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use codexa_files::{IgnoreRules, StorageConfig, WatcherOptions, default_ignored_dirs};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

pub const APP_NAME: &str = "codexa";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub workspace: WorkspaceConfig,
    pub terminal: TerminalConfig,
    pub storage: StorageConfig,
    pub watcher: WatcherConfig,
    pub ports: PortsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// HTTP listener and session liveness settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Interval between WebSocket pings.
    pub ping_interval_secs: u64,
    /// Sessions without inbound traffic for this long are flagged idle.
    pub idle_threshold_secs: u64,
    /// How often the idle sweeper runs.
    pub idle_sweep_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            ping_interval_secs: 30,
            idle_threshold_secs: 30 * 60,
            idle_sweep_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Directory the session serves. One container hosts one workspace.
    pub root: PathBuf,
    /// Recursion limit for the initial tree push.
    pub snapshot_depth: usize,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/workspace"),
            snapshot_depth: codexa_files::gateway::DEFAULT_SNAPSHOT_DEPTH,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    pub shell: String,
    pub args: Vec<String>,
    pub cols: u16,
    pub rows: u16,
    /// Time between the graceful signal and SIGKILL.
    pub grace_period_ms: u64,
    /// Print the ready banner after spawning.
    pub banner: bool,
    pub banner_delay_ms: u64,
    /// Value of `USER` inside the shell.
    pub user: String,
    /// Extra environment, applied after the defaults.
    pub env: BTreeMap<String, String>,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            shell: "bash".to_string(),
            args: vec!["--login".to_string(), "-i".to_string()],
            cols: 80,
            rows: 24,
            grace_period_ms: 1000,
            banner: true,
            banner_delay_ms: 500,
            user: "coder".to_string(),
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub enabled: bool,
    pub debounce_ms: u64,
    pub max_file_bytes: u64,
    pub ignored_dirs: Vec<String>,
    pub skip_hidden: bool,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: 1000,
            max_file_bytes: 10 * 1024 * 1024,
            ignored_dirs: default_ignored_dirs(),
            skip_hidden: true,
        }
    }
}

impl WatcherConfig {
    pub fn ignore_rules(&self) -> IgnoreRules {
        IgnoreRules::new(self.ignored_dirs.iter().cloned(), self.skip_hidden)
    }

    pub fn options(&self) -> WatcherOptions {
        WatcherOptions {
            debounce: Duration::from_millis(self.debounce_ms),
            max_file_bytes: self.max_file_bytes,
            ignore: self.ignore_rules(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    /// Ports the ingress layer routes to.
    pub allowed: Vec<u16>,
    pub probe_timeout_ms: u64,
    /// Time between SIGTERM and SIGKILL when killing a port's process.
    pub kill_grace_ms: u64,
    /// Public URL for an exposed port, e.g. `https://{workspace}-{port}.example.dev`.
    pub public_url_template: Option<String>,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            allowed: vec![3000, 5000, 5173, 5174, 8000, 8080, 8081],
            probe_timeout_ms: 500,
            kill_grace_ms: 500,
            public_url_template: None,
        }
    }
}

/// Environment variable prefix, e.g. `CODEXA__SERVER__PORT=4000`.
pub fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Load configuration from `path` (optional) and the environment.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let built = Config::builder()
        .add_source(
            File::from(path)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(
            Environment::with_prefix(env_prefix().as_str())
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("ports.allowed")
                .with_list_parse_key("terminal.args")
                .with_list_parse_key("watcher.ignored_dirs"),
        )
        .build()
        .with_context(|| format!("reading config from {}", path.display()))?;

    let mut config: AppConfig = built
        .try_deserialize()
        .context("deserializing configuration")?;

    config.workspace.root = expand_path(&config.workspace.root)?;
    config.storage.local_root = expand_path(&config.storage.local_root)?;
    Ok(config)
}

/// Render the default configuration as TOML.
pub fn default_config_toml() -> Result<String> {
    let body = toml::to_string_pretty(&AppConfig::default())
        .context("serializing default config to TOML")?;
    Ok(format!(
        "# {} runner configuration\n# Environment overrides: {}__SECTION__KEY\n\n{}",
        APP_NAME,
        env_prefix(),
        body
    ))
}

pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }
    std::fs::write(path, default_config_toml()?)
        .with_context(|| format!("writing config file to {}", path.display()))
}

pub fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::config_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow::anyhow!("unable to determine configuration directory"))
}

pub fn expand_path(path: &Path) -> Result<PathBuf> {
    match path.to_str() {
        Some(text) => {
            let expanded = shellexpand::full(text).context("expanding path")?;
            Ok(PathBuf::from(expanded.to_string()))
        }
        None => Ok(path.to_path_buf()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.port, 3001);
        assert_eq!(config.workspace.root, PathBuf::from("/workspace"));
        assert_eq!(config.terminal.args, vec!["--login", "-i"]);
        assert!(config.ports.allowed.contains(&5173));
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[server]
port = 4100

[storage]
backend = "local"
local_root = "/tmp/mirror"

[ports]
allowed = [9000]
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.server.port, 4100);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.storage.backend, codexa_files::storage::StorageBackend::Local);
        assert_eq!(config.storage.prefix, "code");
        assert_eq!(config.ports.allowed, vec![9000]);
    }

    #[test]
    fn default_file_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/config.toml");
        write_default_config(&path).unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.terminal.shell, "bash");
        assert_eq!(config.watcher.debounce_ms, 1000);
    }

    #[test]
    fn env_prefix_is_uppercase() {
        assert_eq!(env_prefix(), "CODEXA");
    }
}
