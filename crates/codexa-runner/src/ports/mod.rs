//! Dev-server port operations.
//!
//! Availability is probed by binding the port: a successful bind means nothing
//! is listening. Forwarding itself happens in the ingress layer; the runner only
//! validates and reports.

pub mod process;

use std::time::Duration;

use codexa_protocol::{PortCheck, PortForwardResult, PortKillResult, PortStopResult};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::PortsConfig;

#[derive(Debug, Error)]
pub enum PortError {
    #[error("no port introspection tool available: {0}")]
    Introspection(#[source] std::io::Error),
}

pub type PortResult<T> = Result<T, PortError>;

#[derive(Debug, Clone)]
pub struct PortService {
    allowed: Vec<u16>,
    probe_timeout: Duration,
    kill_grace: Duration,
    url_template: Option<String>,
}

impl PortService {
    pub fn from_config(config: &PortsConfig) -> Self {
        Self {
            allowed: config.allowed.clone(),
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
            kill_grace: Duration::from_millis(config.kill_grace_ms),
            url_template: config.public_url_template.clone(),
        }
    }

    pub fn allowed(&self) -> &[u16] {
        &self.allowed
    }

    pub fn is_allowed(&self, port: u16) -> bool {
        self.allowed.contains(&port)
    }

    /// `true` when the port can be bound, i.e. nothing listens on it.
    ///
    /// A probe that errors or times out counts as occupied.
    pub async fn probe(&self, port: u16) -> bool {
        let bind = tokio::task::spawn_blocking(move || {
            std::net::TcpListener::bind(("0.0.0.0", port)).is_ok()
        });
        match tokio::time::timeout(self.probe_timeout, bind).await {
            Ok(Ok(available)) => available,
            Ok(Err(e)) => {
                warn!("Port probe for {} failed: {}", port, e);
                false
            }
            Err(_) => {
                warn!("Port probe for {} timed out", port);
                false
            }
        }
    }

    pub async fn check(&self, port: u16) -> PortCheck {
        PortCheck {
            available: self.probe(port).await,
            port,
        }
    }

    pub fn public_url(&self, workspace_id: &str, port: u16) -> Option<String> {
        self.url_template.as_ref().map(|template| {
            template
                .replace("{workspace}", workspace_id)
                .replace("{port}", &port.to_string())
        })
    }

    /// Validate that `port` may be exposed and has a listener.
    pub async fn forward(&self, workspace_id: &str, port: u16) -> PortForwardResult {
        if !self.is_allowed(port) {
            let supported = self
                .allowed
                .iter()
                .map(u16::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            return PortForwardResult {
                success: false,
                port,
                error: Some(format!(
                    "Port {} is not supported. Supported ports: {}",
                    port, supported
                )),
                url: None,
            };
        }

        if self.probe(port).await {
            return PortForwardResult {
                success: false,
                port,
                error: Some(format!("No service is listening on port {}", port)),
                url: None,
            };
        }

        info!("Exposing port {} for workspace {}", port, workspace_id);
        PortForwardResult {
            success: true,
            port,
            error: None,
            url: self.public_url(workspace_id, port),
        }
    }

    /// Advisory; the caller drops the port from its exposed set.
    pub fn stop(&self, port: u16) -> PortStopResult {
        debug!("Stopped exposing port {}", port);
        PortStopResult {
            success: true,
            port,
        }
    }

    /// Terminate whatever listens on `port`. The runner never signals itself.
    pub async fn kill(&self, port: u16) -> PortKillResult {
        let failed = |error: String| PortKillResult {
            success: false,
            port,
            error: Some(error),
            output: None,
        };

        if port == 0 {
            return failed("Invalid port 0".to_string());
        }

        if self.probe(port).await {
            return PortKillResult {
                success: true,
                port,
                error: None,
                output: Some(format!("No process is listening on port {}", port)),
            };
        }

        let own_pid = std::process::id();
        let pids = match process::find_listening_pids(port).await {
            Ok(pids) => pids,
            Err(e) => return failed(format!("Failed to inspect port {}: {}", port, e)),
        };
        let targets: Vec<u32> = pids.into_iter().filter(|pid| *pid != own_pid).collect();
        if targets.is_empty() {
            debug!("Port {} is busy but no killable owner is visible", port);
            return PortKillResult {
                success: true,
                port,
                error: None,
                output: Some(format!("No killable process found on port {}", port)),
            };
        }

        let mut lines = Vec::new();
        for pid in &targets {
            if process::signal(*pid, libc::SIGTERM) {
                lines.push(format!("Sent SIGTERM to {}", pid));
            } else {
                lines.push(format!("Failed to signal {}", pid));
            }
        }

        tokio::time::sleep(self.kill_grace).await;
        for pid in &targets {
            if process::is_alive(*pid) {
                process::signal(*pid, libc::SIGKILL);
                lines.push(format!("Sent SIGKILL to {}", pid));
            }
        }

        info!("Killed listeners on port {}: {:?}", port, targets);
        PortKillResult {
            success: true,
            port,
            error: None,
            output: Some(lines.join("\n")),
        }
    }
}
