//! In-memory status table.
//!
//! Two writers, each owning a disjoint half of the table: [`ServiceWriter`]
//! (held by the event monitor) owns profiles, namespace attachments and
//! service connections; [`EngineWriter`] (held by the process supervisor) owns
//! the engine row. Neither writer is `Clone`. Everyone else reads immutable
//! snapshots through [`StateStore`].

use super::backoff::RetryState;
use super::supervisor::EngineState;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// Expected (allow-listed) but the namespace is not attached yet
    Pending,
    /// Known to the engine, no connection reported yet
    Added,
    Connected,
    Reconnecting,
    /// Retries exhausted
    Failed,
    /// Gone from the cluster
    Removed,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Pending => "pending",
            ConnectionStatus::Added => "added",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Failed => "failed",
            ConnectionStatus::Removed => "removed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentStatus {
    Pending,
    Added,
    Failed,
}

impl AttachmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentStatus::Pending => "pending",
            AttachmentStatus::Added => "added",
            AttachmentStatus::Failed => "failed",
        }
    }
}

/// A profile's namespace as attached to the engine.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AttachmentKey {
    pub profile: String,
    pub namespace: String,
}

impl AttachmentKey {
    pub fn new(profile: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            profile: profile.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for AttachmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.profile, self.namespace)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionKey {
    pub profile: String,
    pub namespace: String,
    pub service: String,
}

impl ConnectionKey {
    pub fn new(
        profile: impl Into<String>,
        namespace: impl Into<String>,
        service: impl Into<String>,
    ) -> Self {
        Self {
            profile: profile.into(),
            namespace: namespace.into(),
            service: service.into(),
        }
    }

    pub fn attachment(&self) -> AttachmentKey {
        AttachmentKey::new(&self.profile, &self.namespace)
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.profile, self.namespace, self.service)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub selectors: Vec<String>,
    /// Allow-list copied from the profile; empty admits every service
    pub services: Vec<String>,
    pub status: AttachmentStatus,
    pub last_error: Option<String>,
}

impl Attachment {
    pub fn allows(&self, service: &str) -> bool {
        self.services.is_empty() || self.services.iter().any(|s| s == service)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConnection {
    pub status: ConnectionStatus,
    /// Start of the current connected stretch
    pub connected_since: Option<DateTime<Utc>>,
    /// When the current connected stretch counts as confirmed
    pub confirm_at: Option<Instant>,
    /// Connection drops observed since the daemon started
    pub reconnects: u32,
    pub last_error: Option<String>,
    pub retry: RetryState,
}

impl ServiceConnection {
    pub fn new(status: ConnectionStatus) -> Self {
        Self {
            status,
            connected_since: None,
            confirm_at: None,
            reconnects: 0,
            last_error: None,
            retry: RetryState::new(),
        }
    }

    pub fn uptime_secs(&self, now: DateTime<Utc>) -> Option<u64> {
        if self.status != ConnectionStatus::Connected {
            return None;
        }
        self.connected_since
            .map(|since| (now - since).num_seconds().max(0) as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileEntry {
    pub enabled: bool,
}

/// Section owned by the event monitor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceTables {
    pub profiles: BTreeMap<String, ProfileEntry>,
    pub attachments: BTreeMap<AttachmentKey, Attachment>,
    pub connections: BTreeMap<ConnectionKey, ServiceConnection>,
}

impl ServiceTables {
    /// Attachment that owns events for `namespace`, if one is tracked.
    pub fn owner_of(&self, namespace: &str) -> Option<(&AttachmentKey, &Attachment)> {
        self.attachments
            .iter()
            .find(|(key, _)| key.namespace == namespace)
    }

    pub fn connections_of<'a>(
        &'a self,
        key: &'a AttachmentKey,
    ) -> impl Iterator<Item = (&'a ConnectionKey, &'a ServiceConnection)> + 'a {
        self.connections
            .iter()
            .filter(move |(k, _)| k.profile == key.profile && k.namespace == key.namespace)
    }

    /// Attachments the engine has accepted.
    pub fn observed(&self) -> impl Iterator<Item = (&AttachmentKey, &Attachment)> {
        self.attachments
            .iter()
            .filter(|(_, a)| a.status == AttachmentStatus::Added)
    }
}

/// Section owned by the process supervisor.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineRow {
    pub state: EngineState,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub endpoint: String,
    pub restarts: u32,
    pub last_error: Option<String>,
}

impl Default for EngineRow {
    fn default() -> Self {
        Self {
            state: EngineState::NotStarted,
            pid: None,
            started_at: None,
            endpoint: String::new(),
            restarts: 0,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateTable {
    pub engine: EngineRow,
    pub services: ServiceTables,
}

#[derive(Clone)]
pub struct StateStore {
    inner: Arc<RwLock<StateTable>>,
}

pub struct ServiceWriter {
    inner: Arc<RwLock<StateTable>>,
}

pub struct EngineWriter {
    inner: Arc<RwLock<StateTable>>,
}

impl StateStore {
    /// Create the store along with its two writers.
    pub fn new() -> (StateStore, ServiceWriter, EngineWriter) {
        let inner = Arc::new(RwLock::new(StateTable::default()));
        (
            StateStore {
                inner: Arc::clone(&inner),
            },
            ServiceWriter {
                inner: Arc::clone(&inner),
            },
            EngineWriter { inner },
        )
    }

    pub fn snapshot(&self) -> StateTable {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn engine(&self) -> EngineRow {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .engine
            .clone()
    }

    pub fn services(&self) -> ServiceTables {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .services
            .clone()
    }
}

impl ServiceWriter {
    pub fn modify<R>(&self, f: impl FnOnce(&mut ServiceTables) -> R) -> R {
        let mut table = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut table.services)
    }
}

impl EngineWriter {
    pub fn modify<R>(&self, f: impl FnOnce(&mut EngineRow) -> R) -> R {
        let mut table = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut table.engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writers_touch_only_their_section() {
        let (store, services, engine) = StateStore::new();

        engine.modify(|row| {
            row.state = EngineState::Running;
            row.pid = Some(42);
        });
        services.modify(|t| {
            t.attachments.insert(
                AttachmentKey::new("p", "ns"),
                Attachment {
                    selectors: vec![],
                    services: vec![],
                    status: AttachmentStatus::Added,
                    last_error: None,
                },
            );
        });

        let snap = store.snapshot();
        assert_eq!(snap.engine.pid, Some(42));
        assert_eq!(snap.services.observed().count(), 1);
    }

    #[test]
    fn snapshot_is_detached() {
        let (store, services, _engine) = StateStore::new();
        let before = store.services();
        services.modify(|t| {
            t.profiles
                .insert("p".into(), ProfileEntry { enabled: true });
        });
        assert!(before.profiles.is_empty());
        assert_eq!(store.services().profiles.len(), 1);
    }

    #[test]
    fn uptime_only_while_connected() {
        let now = Utc::now();
        let mut conn = ServiceConnection::new(ConnectionStatus::Connected);
        conn.connected_since = Some(now - chrono::Duration::seconds(90));
        assert_eq!(conn.uptime_secs(now), Some(90));
        conn.status = ConnectionStatus::Reconnecting;
        assert_eq!(conn.uptime_secs(now), None);
    }

    #[test]
    fn connections_filtered_by_attachment() {
        let mut t = ServiceTables::default();
        t.connections.insert(
            ConnectionKey::new("p", "a", "x"),
            ServiceConnection::new(ConnectionStatus::Added),
        );
        t.connections.insert(
            ConnectionKey::new("p", "b", "y"),
            ServiceConnection::new(ConnectionStatus::Added),
        );
        let key = AttachmentKey::new("p", "a");
        let names: Vec<_> = t.connections_of(&key).map(|(k, _)| k.service.clone()).collect();
        assert_eq!(names, vec!["x"]);
    }
}
