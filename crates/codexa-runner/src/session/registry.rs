//! Live session bookkeeping.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::info;

/// State shared between a connection and the registry.
#[derive(Debug)]
pub struct SessionInfo {
    pub connection_id: String,
    pub workspace_id: String,
    pub connected_at: DateTime<Utc>,
    /// Unix milliseconds of the last inbound frame.
    last_activity_ms: AtomicI64,
    idle: AtomicBool,
    exposed_ports: Mutex<HashSet<u16>>,
}

impl SessionInfo {
    pub fn new(connection_id: impl Into<String>, workspace_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            connection_id: connection_id.into(),
            workspace_id: workspace_id.into(),
            connected_at: now,
            last_activity_ms: AtomicI64::new(now.timestamp_millis()),
            idle: AtomicBool::new(false),
            exposed_ports: Mutex::new(HashSet::new()),
        }
    }

    /// Record inbound activity. Clears the idle flag.
    pub fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        if self.idle.swap(false, Ordering::Relaxed) {
            info!("Session {} is active again", self.connection_id);
        }
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_activity_ms.load(Ordering::Relaxed))
            .unwrap_or(self.connected_at)
    }

    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Relaxed)
    }

    pub fn expose_port(&self, port: u16) {
        if let Ok(mut ports) = self.exposed_ports.lock() {
            ports.insert(port);
        }
    }

    pub fn unexpose_port(&self, port: u16) -> bool {
        self.exposed_ports
            .lock()
            .map(|mut ports| ports.remove(&port))
            .unwrap_or(false)
    }

    pub fn exposed_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self
            .exposed_ports
            .lock()
            .map(|ports| ports.iter().copied().collect())
            .unwrap_or_default();
        ports.sort_unstable();
        ports
    }

    fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_activity()).to_std().unwrap_or_default()
    }
}

/// All sessions on this runner, keyed by connection id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<SessionInfo>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, info: Arc<SessionInfo>) {
        info!(
            "Session {} connected to workspace {}",
            info.connection_id, info.workspace_id
        );
        self.sessions.insert(info.connection_id.clone(), info);
    }

    pub fn unregister(&self, connection_id: &str) -> Option<Arc<SessionInfo>> {
        let removed = self.sessions.remove(connection_id).map(|(_, info)| info);
        if let Some(info) = &removed {
            let lifetime = (Utc::now() - info.connected_at).num_seconds();
            info!(
                "Session {} disconnected after {}s",
                connection_id, lifetime
            );
        }
        removed
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<SessionInfo>> {
        self.sessions.get(connection_id).map(|entry| entry.clone())
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn idle_count(&self) -> usize {
        self.sessions.iter().filter(|entry| entry.is_idle()).count()
    }

    /// Flag sessions inactive for longer than `threshold`. Each idle period is
    /// logged once. Returns the number newly flagged.
    pub fn sweep_idle(&self, threshold: Duration) -> usize {
        let now = Utc::now();
        let mut flagged = 0;
        for entry in self.sessions.iter() {
            let idle_for = entry.idle_for(now);
            if idle_for > threshold && !entry.idle.swap(true, Ordering::Relaxed) {
                info!(
                    "Session {} ({}) idle for {}s",
                    entry.connection_id,
                    entry.workspace_id,
                    idle_for.as_secs()
                );
                flagged += 1;
            }
        }
        flagged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_unregister() {
        let registry = SessionRegistry::new();
        registry.register(Arc::new(SessionInfo::new("c1", "demo")));
        registry.register(Arc::new(SessionInfo::new("c2", "demo")));
        assert_eq!(registry.count(), 2);

        assert!(registry.unregister("c1").is_some());
        assert!(registry.unregister("c1").is_none());
        assert_eq!(registry.count(), 1);
        assert!(registry.get("c2").is_some());
    }

    #[test]
    fn sweep_flags_once_and_touch_clears() {
        let registry = SessionRegistry::new();
        let info = Arc::new(SessionInfo::new("c1", "demo"));
        info.last_activity_ms
            .store(Utc::now().timestamp_millis() - 10_000, Ordering::Relaxed);
        registry.register(info.clone());

        assert_eq!(registry.sweep_idle(Duration::from_secs(60)), 0);
        assert_eq!(registry.sweep_idle(Duration::from_secs(5)), 1);
        assert_eq!(registry.sweep_idle(Duration::from_secs(5)), 0);
        assert_eq!(registry.idle_count(), 1);

        info.touch();
        assert!(!info.is_idle());
        assert_eq!(registry.idle_count(), 0);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn exposed_ports_are_tracked() {
        let info = SessionInfo::new("c1", "demo");
        info.expose_port(5173);
        info.expose_port(3000);
        assert_eq!(info.exposed_ports(), vec![3000, 5173]);
        assert!(info.unexpose_port(3000));
        assert!(!info.unexpose_port(3000));
    }
}
