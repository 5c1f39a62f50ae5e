//! Engine event stream monitoring.
//!
//! [`EventMonitor`] is the only writer of the service half of the state table.
//! It holds one subscription to the engine's event stream at a time, applies
//! each connection-state event in arrival order, and republishes every status
//! transition on a broadcast channel. Other components never touch the table
//! directly: they send [`StateCommand`]s over an mpsc channel and the monitor
//! applies them between events.
//!
//! When the subscription drops it is reopened under its own backoff, and every
//! (re)subscription starts with a full resync against `list_services()` so
//! events missed during the gap cannot leave stale rows behind. While the
//! engine is not running, its rows are shown degraded rather than connected.

use super::backoff::{BackoffEngine, BackoffStep, RetryPolicy, RetryState};
use super::control::{EngineControl, EventStream, RemoteStatus, ServiceSummary};
use super::shutdown::ShutdownHandle;
use super::state::{
    Attachment, AttachmentKey, AttachmentStatus, ConnectionKey, ConnectionStatus, ProfileEntry,
    ServiceConnection, ServiceTables, ServiceWriter,
};
use super::supervisor::{EngineState, EngineStatus};
use crate::error::{DaemonError, Result};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Upper bound on the work done after shutdown is signalled.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const TICK_INTERVAL: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Connected,
    Disconnected,
    Reconnecting,
    Removed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EngineEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub namespace: String,
    pub service: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
}

pub fn parse_event(payload: &str) -> std::result::Result<EngineEvent, serde_json::Error> {
    serde_json::from_str(payload)
}

/// Incremental `text/event-stream` decoder yielding complete `data` payloads.
#[derive(Debug, Default)]
pub struct SseDecoder {
    line: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes; returns every event payload completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut out = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                let mut line = std::mem::take(&mut self.line);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                self.process_line(&String::from_utf8_lossy(&line), &mut out);
            } else {
                self.line.push(byte);
            }
        }
        out
    }

    fn process_line(&mut self, line: &str, out: &mut Vec<String>) {
        if line.is_empty() {
            if !self.data.is_empty() {
                out.push(self.data.join("\n"));
                self.data.clear();
            }
            return;
        }
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field == "data" {
            self.data.push(value.to_string());
        }
    }
}

// ---------------------------------------------------------------------------
// Commands and notifications
// ---------------------------------------------------------------------------

/// State mutations requested by other components.
#[derive(Debug, Clone)]
pub enum StateCommand {
    /// Replace the profile table (name, enabled)
    SetProfiles(Vec<(String, bool)>),
    /// Start tracking a desired namespace attachment
    Track {
        key: AttachmentKey,
        selectors: Vec<String>,
        services: Vec<String>,
        policy: RetryPolicy,
    },
    /// The engine accepted the attachment
    Attached { key: AttachmentKey },
    /// An attach attempt failed; `terminal` once retries are exhausted
    AttachFailed {
        key: AttachmentKey,
        error: String,
        terminal: bool,
    },
    /// Stop tracking; drops the attachment and its connections
    Untrack { key: AttachmentKey },
    /// The engine restarted idle; every attachment must be re-added
    ResetAttachments,
}

/// A connection status transition.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub key: ConnectionKey,
    pub from: Option<ConnectionStatus>,
    pub to: ConnectionStatus,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

impl std::fmt::Display for StateChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let from = self.from.map(|s| s.as_str()).unwrap_or("-");
        write!(f, "{} {} -> {}", self.key, from, self.to.as_str())?;
        if let Some(err) = &self.error {
            write!(f, " ({err})")?;
        }
        Ok(())
    }
}

/// Monitor-private policy lookup for per-service reconnect attempts.
#[derive(Debug, Default)]
pub struct ReconnectPolicies {
    by_attachment: HashMap<AttachmentKey, BackoffEngine>,
}

impl ReconnectPolicies {
    fn engine_for(&self, key: &AttachmentKey) -> BackoffEngine {
        self.by_attachment
            .get(key)
            .copied()
            .unwrap_or_else(|| BackoffEngine::new(RetryPolicy::default()))
    }
}

// ---------------------------------------------------------------------------
// Table transitions
// ---------------------------------------------------------------------------

fn change(
    key: &ConnectionKey,
    from: Option<ConnectionStatus>,
    conn: &ServiceConnection,
    at: DateTime<Utc>,
) -> Option<StateChange> {
    (from != Some(conn.status)).then(|| StateChange {
        key: key.clone(),
        from,
        to: conn.status,
        error: conn.last_error.clone(),
        at,
    })
}

/// Apply one command to the table.
pub fn apply_command(
    table: &mut ServiceTables,
    policies: &mut ReconnectPolicies,
    command: StateCommand,
    now: DateTime<Utc>,
) -> Vec<StateChange> {
    let mut changes = Vec::new();
    match command {
        StateCommand::SetProfiles(profiles) => {
            table.profiles = profiles
                .into_iter()
                .map(|(name, enabled)| (name, ProfileEntry { enabled }))
                .collect();
        }
        StateCommand::Track {
            key,
            selectors,
            services,
            policy,
        } => {
            policies
                .by_attachment
                .insert(key.clone(), BackoffEngine::new(policy));
            let attachment = table.attachments.entry(key.clone()).or_insert(Attachment {
                selectors: selectors.clone(),
                services: services.clone(),
                status: AttachmentStatus::Pending,
                last_error: None,
            });
            attachment.selectors = selectors;
            attachment.services = services.clone();
            let status = attachment.status;

            // Connections outside a narrowed allow-list no longer belong here.
            if !services.is_empty() {
                let stale: Vec<_> = table
                    .connections_of(&key)
                    .filter(|(k, _)| !services.contains(&k.service))
                    .map(|(k, _)| k.clone())
                    .collect();
                for conn_key in stale {
                    if let Some(conn) = table.connections.remove(&conn_key) {
                        changes.push(StateChange {
                            key: conn_key,
                            from: Some(conn.status),
                            to: ConnectionStatus::Removed,
                            error: None,
                            at: now,
                        });
                    }
                }
            }

            if status != AttachmentStatus::Added {
                for service in services {
                    let conn_key = ConnectionKey::new(&key.profile, &key.namespace, service);
                    if !table.connections.contains_key(&conn_key) {
                        let conn = ServiceConnection::new(ConnectionStatus::Pending);
                        changes.extend(change(&conn_key, None, &conn, now));
                        table.connections.insert(conn_key, conn);
                    }
                }
            }
        }
        StateCommand::Attached { key } => {
            if let Some(attachment) = table.attachments.get_mut(&key) {
                attachment.status = AttachmentStatus::Added;
                attachment.last_error = None;
            }
            for (conn_key, conn) in table.connections.iter_mut() {
                if conn_key.profile == key.profile
                    && conn_key.namespace == key.namespace
                    && matches!(conn.status, ConnectionStatus::Pending | ConnectionStatus::Failed)
                {
                    let from = conn.status;
                    conn.status = ConnectionStatus::Added;
                    changes.extend(change(conn_key, Some(from), conn, now));
                }
            }
        }
        StateCommand::AttachFailed {
            key,
            error,
            terminal,
        } => {
            if let Some(attachment) = table.attachments.get_mut(&key) {
                attachment.last_error = Some(error.clone());
                if terminal {
                    attachment.status = AttachmentStatus::Failed;
                }
            }
            if terminal {
                for (conn_key, conn) in table.connections.iter_mut() {
                    if conn_key.profile == key.profile && conn_key.namespace == key.namespace {
                        let from = conn.status;
                        conn.status = ConnectionStatus::Failed;
                        conn.last_error = Some(error.clone());
                        conn.connected_since = None;
                        conn.confirm_at = None;
                        changes.extend(change(conn_key, Some(from), conn, now));
                    }
                }
            }
        }
        StateCommand::Untrack { key } => {
            policies.by_attachment.remove(&key);
            table.attachments.remove(&key);
            let gone: Vec<_> = table.connections_of(&key).map(|(k, _)| k.clone()).collect();
            for conn_key in gone {
                if let Some(conn) = table.connections.remove(&conn_key) {
                    changes.push(StateChange {
                        key: conn_key,
                        from: Some(conn.status),
                        to: ConnectionStatus::Removed,
                        error: None,
                        at: now,
                    });
                }
            }
        }
        StateCommand::ResetAttachments => {
            for attachment in table.attachments.values_mut() {
                if attachment.status == AttachmentStatus::Added {
                    attachment.status = AttachmentStatus::Pending;
                }
            }
            for (conn_key, conn) in table.connections.iter_mut() {
                if conn.status != ConnectionStatus::Failed {
                    let from = conn.status;
                    conn.status = ConnectionStatus::Pending;
                    conn.connected_since = None;
                    conn.confirm_at = None;
                    changes.extend(change(conn_key, Some(from), conn, now));
                }
            }
        }
    }
    changes
}

/// Apply one engine event. Events for untracked namespaces or services outside
/// the owning profile's allow-list are ignored.
pub fn apply_event(
    table: &mut ServiceTables,
    policies: &ReconnectPolicies,
    event: &EngineEvent,
    now: Instant,
    confirmation_window: Duration,
) -> Option<StateChange> {
    let (attachment_key, attachment) = table.owner_of(&event.namespace)?;
    if !attachment.allows(&event.service) {
        trace!(
            namespace = %event.namespace,
            service = %event.service,
            "Ignoring event for service outside allow-list"
        );
        return None;
    }
    let attachment_key = attachment_key.clone();
    let key = ConnectionKey::new(
        &attachment_key.profile,
        &attachment_key.namespace,
        &event.service,
    );
    let backoff = policies.engine_for(&attachment_key);

    let conn = table
        .connections
        .entry(key.clone())
        .or_insert_with(|| ServiceConnection::new(ConnectionStatus::Added));
    let from = conn.status;

    match event.kind {
        EventKind::Connected => {
            if conn.status != ConnectionStatus::Connected {
                conn.connected_since = Some(event.timestamp);
                conn.confirm_at = Some(now + confirmation_window);
            }
            conn.status = ConnectionStatus::Connected;
        }
        EventKind::Disconnected => {
            if conn.status == ConnectionStatus::Connected {
                conn.reconnects = conn.reconnects.saturating_add(1);
            }
            if let Some(err) = &event.error {
                conn.last_error = Some(err.clone());
            }
            conn.connected_since = None;
            conn.confirm_at = None;
            if conn.status != ConnectionStatus::Failed {
                conn.status = ConnectionStatus::Reconnecting;
            }
        }
        EventKind::Reconnecting | EventKind::Error => {
            if event.kind == EventKind::Error {
                conn.last_error = Some(
                    event
                        .error
                        .clone()
                        .unwrap_or_else(|| "unspecified engine error".to_string()),
                );
            }
            if conn.status == ConnectionStatus::Connected {
                conn.reconnects = conn.reconnects.saturating_add(1);
            }
            conn.connected_since = None;
            conn.confirm_at = None;
            let (step, next) = backoff.next_delay(&conn.retry);
            conn.retry = next;
            match step {
                BackoffStep::Retry(_) => {
                    if conn.status != ConnectionStatus::Failed {
                        conn.status = ConnectionStatus::Reconnecting;
                    }
                }
                BackoffStep::Exhausted => {
                    if conn.status != ConnectionStatus::Failed {
                        let attempts = conn.retry.attempts;
                        let cause = conn.last_error.take().unwrap_or_default();
                        conn.last_error = Some(if cause.is_empty() {
                            format!("reconnect attempts exhausted after {attempts}")
                        } else {
                            format!("reconnect attempts exhausted after {attempts}: {cause}")
                        });
                    }
                    conn.status = ConnectionStatus::Failed;
                }
            }
        }
        EventKind::Removed => {
            conn.status = ConnectionStatus::Removed;
            conn.connected_since = None;
            conn.confirm_at = None;
        }
    }

    change(&key, Some(from), conn, event.timestamp)
}

/// Make the table match a fresh engine listing. Rows under accepted
/// attachments that the engine no longer reports are dropped; reconnect
/// counters of surviving rows are kept.
pub fn apply_snapshot(
    table: &mut ServiceTables,
    summaries: &[ServiceSummary],
    now: Instant,
    wall: DateTime<Utc>,
    confirmation_window: Duration,
) -> Vec<StateChange> {
    let mut changes = Vec::new();
    let mut seen = HashSet::new();

    for summary in summaries {
        let Some((attachment_key, attachment)) = table.owner_of(&summary.namespace) else {
            continue;
        };
        if !attachment.allows(&summary.service) {
            continue;
        }
        let key = ConnectionKey::new(
            &attachment_key.profile,
            &attachment_key.namespace,
            &summary.service,
        );
        seen.insert(key.clone());

        let conn = table
            .connections
            .entry(key.clone())
            .or_insert_with(|| ServiceConnection::new(ConnectionStatus::Added));
        let from = conn.status;

        match summary.status {
            RemoteStatus::Connected => {
                if conn.status != ConnectionStatus::Connected {
                    conn.connected_since = Some(wall);
                    conn.confirm_at = Some(now + confirmation_window);
                }
                conn.status = ConnectionStatus::Connected;
            }
            RemoteStatus::Reconnecting | RemoteStatus::Disconnected | RemoteStatus::Error => {
                conn.connected_since = None;
                conn.confirm_at = None;
                if conn.status != ConnectionStatus::Failed {
                    conn.status = ConnectionStatus::Reconnecting;
                }
            }
            RemoteStatus::Pending => {
                conn.connected_since = None;
                conn.confirm_at = None;
                if conn.status != ConnectionStatus::Failed {
                    conn.status = ConnectionStatus::Added;
                }
            }
        }
        if let Some(err) = &summary.error {
            conn.last_error = Some(err.clone());
        }
        changes.extend(change(&key, Some(from), conn, wall));
    }

    let stale: Vec<ConnectionKey> = table
        .connections
        .keys()
        .filter(|k| !seen.contains(*k))
        .filter(|k| {
            table
                .attachments
                .get(&k.attachment())
                .is_some_and(|a| a.status == AttachmentStatus::Added)
        })
        .cloned()
        .collect();
    for key in stale {
        if let Some(conn) = table.connections.remove(&key) {
            changes.push(StateChange {
                key,
                from: Some(conn.status),
                to: ConnectionStatus::Removed,
                error: None,
                at: wall,
            });
        }
    }

    changes
}

/// Reflect an engine that is no longer running. Live rows move to
/// Reconnecting, or to Failed with the engine's error once the supervisor has
/// given up on it.
pub fn apply_engine_down(
    table: &mut ServiceTables,
    engine: &EngineStatus,
    now: DateTime<Utc>,
) -> Vec<StateChange> {
    let terminal = engine.state == EngineState::Failed;
    let reason = match &engine.last_error {
        Some(err) => format!("engine {}: {err}", engine.state.as_str()),
        None => format!("engine {}", engine.state.as_str()),
    };

    let mut changes = Vec::new();
    for (key, conn) in table.connections.iter_mut() {
        let from = conn.status;
        let next = match from {
            ConnectionStatus::Connected | ConnectionStatus::Added if !terminal => {
                ConnectionStatus::Reconnecting
            }
            ConnectionStatus::Connected
            | ConnectionStatus::Added
            | ConnectionStatus::Pending
            | ConnectionStatus::Reconnecting
                if terminal =>
            {
                ConnectionStatus::Failed
            }
            _ => continue,
        };
        if from == ConnectionStatus::Connected {
            conn.reconnects = conn.reconnects.saturating_add(1);
        }
        conn.status = next;
        conn.last_error = Some(reason.clone());
        conn.connected_since = None;
        conn.confirm_at = None;
        changes.extend(change(key, Some(from), conn, now));
    }
    changes
}

/// Clear retry state of connections that stayed up for the confirmation window.
pub fn confirm_stable(table: &mut ServiceTables, now: Instant) -> usize {
    let mut confirmed = 0;
    for (key, conn) in table.connections.iter_mut() {
        if conn.status != ConnectionStatus::Connected {
            continue;
        }
        if conn.confirm_at.is_some_and(|at| at <= now) {
            conn.confirm_at = None;
            if conn.retry.attempts > 0 || conn.retry.exhausted {
                trace!(service = %key, "Connection confirmed stable, resetting retries");
            }
            conn.retry = RetryState::new();
            confirmed += 1;
        }
    }
    confirmed
}

// ---------------------------------------------------------------------------
// Monitor task
// ---------------------------------------------------------------------------

/// Sending side used by the reconciler (and tests) to request mutations.
#[derive(Clone)]
pub struct StateCommands {
    tx: mpsc::UnboundedSender<StateCommand>,
}

impl StateCommands {
    pub fn send(&self, command: StateCommand) {
        if self.tx.send(command).is_err() {
            debug!("Event monitor gone, dropping state command");
        }
    }
}

pub fn state_command_channel() -> (StateCommands, mpsc::UnboundedReceiver<StateCommand>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (StateCommands { tx }, rx)
}

enum Wake {
    Deadline,
    EngineChanged,
    Shutdown,
}

enum StreamEnd {
    Dropped(DaemonError),
    EngineChanged,
    Shutdown,
}

pub struct EventMonitor {
    control: Arc<dyn EngineControl>,
    writer: ServiceWriter,
    commands: mpsc::UnboundedReceiver<StateCommand>,
    changes: broadcast::Sender<StateChange>,
    engine: watch::Receiver<EngineStatus>,
    shutdown: ShutdownHandle,
    backoff: BackoffEngine,
    policies: ReconnectPolicies,
    confirmation_window: Duration,
}

impl EventMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        control: Arc<dyn EngineControl>,
        writer: ServiceWriter,
        commands: mpsc::UnboundedReceiver<StateCommand>,
        changes: broadcast::Sender<StateChange>,
        engine: watch::Receiver<EngineStatus>,
        shutdown: ShutdownHandle,
        stream_policy: RetryPolicy,
        confirmation_window: Duration,
    ) -> Self {
        Self {
            control,
            writer,
            commands,
            changes,
            engine,
            shutdown,
            backoff: BackoffEngine::new(stream_policy),
            policies: ReconnectPolicies::default(),
            confirmation_window,
        }
    }

    pub async fn run(mut self) {
        info!("Event monitor started");
        let mut retry = RetryState::new();

        loop {
            if !self.wait_for_engine().await {
                break;
            }
            let generation = self.engine.borrow().generation;

            match self.open().await {
                Ok((stream, listed_at)) => {
                    let opened = Instant::now();
                    match self.consume(stream, listed_at).await {
                        StreamEnd::Shutdown => break,
                        StreamEnd::EngineChanged => {
                            retry = self.backoff.reset(&retry);
                            continue;
                        }
                        StreamEnd::Dropped(e) => {
                            warn!(error = %e, "Event stream dropped");
                            if opened.elapsed() >= self.confirmation_window {
                                retry = self.backoff.reset(&retry);
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, kind = e.kind(), "Event subscription failed");
                }
            }

            let (step, next) = self.backoff.schedule(&retry, Instant::now());
            retry = next;
            let deadline = match step {
                BackoffStep::Retry(delay) => {
                    debug!(?delay, attempt = retry.attempts, "Resubscribing to event stream");
                    retry.next_eligible_at
                }
                BackoffStep::Exhausted => {
                    warn!("Event stream retries exhausted; waiting for engine restart");
                    None
                }
            };

            match self.idle_until(deadline).await {
                Wake::Shutdown => break,
                Wake::EngineChanged => {
                    if self.engine.borrow().generation != generation {
                        retry = self.backoff.reset(&retry);
                    }
                }
                Wake::Deadline => {}
            }
        }

        self.drain().await;
        info!("Event monitor stopped");
    }

    /// Subscribe and resync. The subscription opens first so that no event
    /// emitted after the listing is lost; events stamped before the listing
    /// are already reflected in it and are skipped by [`Self::consume`].
    async fn open(&mut self) -> Result<(EventStream, DateTime<Utc>)> {
        let stream = self.control.subscribe().await?;
        let listed_at = Utc::now();
        let summaries = self.control.list_services().await?;
        let changes = self.writer.modify(|t| {
            apply_snapshot(
                t,
                &summaries,
                Instant::now(),
                Utc::now(),
                self.confirmation_window,
            )
        });
        info!(services = summaries.len(), "Event stream resynchronized");
        self.publish(changes);
        Ok((stream, listed_at))
    }

    async fn consume(&mut self, mut stream: EventStream, listed_at: DateTime<Utc>) -> StreamEnd {
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        let generation = self.engine.borrow().generation;
        loop {
            tokio::select! {
                item = stream.next() => match item {
                    Some(Ok(event)) if event.timestamp < listed_at => {
                        trace!(
                            namespace = %event.namespace,
                            service = %event.service,
                            "Skipping event older than resync"
                        );
                    }
                    Some(Ok(event)) => self.handle_event(&event),
                    Some(Err(e)) => return StreamEnd::Dropped(e),
                    None => return StreamEnd::Dropped(DaemonError::StreamDisconnect(
                        "stream closed by engine".to_string(),
                    )),
                },
                Some(command) = self.commands.recv() => self.handle_command(command),
                _ = tick.tick() => self.tick(),
                changed = self.engine.changed() => {
                    if changed.is_err() {
                        return StreamEnd::Shutdown;
                    }
                    let running = self.on_engine_change();
                    if !running || self.engine.borrow().generation != generation {
                        return StreamEnd::EngineChanged;
                    }
                }
                _ = self.shutdown.wait() => return StreamEnd::Shutdown,
            }
        }
    }

    /// Block until the engine reports Running, serving commands meanwhile.
    /// Returns false on shutdown.
    async fn wait_for_engine(&mut self) -> bool {
        loop {
            if self.engine.borrow().state == EngineState::Running {
                return true;
            }
            match self.idle_until(None).await {
                Wake::Shutdown => return false,
                Wake::EngineChanged | Wake::Deadline => {}
            }
        }
    }

    async fn idle_until(&mut self, deadline: Option<Instant>) -> Wake {
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        let sleep = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return Wake::Deadline,
                Some(command) = self.commands.recv() => self.handle_command(command),
                _ = tick.tick() => self.tick(),
                changed = self.engine.changed() => {
                    if changed.is_err() {
                        return Wake::Shutdown;
                    }
                    self.on_engine_change();
                    return Wake::EngineChanged;
                }
                _ = self.shutdown.wait() => return Wake::Shutdown,
            }
        }
    }

    /// Mark rows degraded when the engine left Running. Returns whether it
    /// is running.
    fn on_engine_change(&mut self) -> bool {
        let status = self.engine.borrow().clone();
        if status.state == EngineState::Running {
            return true;
        }
        let changes = self
            .writer
            .modify(|t| apply_engine_down(t, &status, Utc::now()));
        if !changes.is_empty() {
            warn!(
                state = status.state.as_str(),
                services = changes.len(),
                "Engine down, services degraded"
            );
        }
        self.publish(changes);
        false
    }

    fn handle_event(&mut self, event: &EngineEvent) {
        trace!(
            kind = ?event.kind,
            namespace = %event.namespace,
            service = %event.service,
            "Engine event"
        );
        let window = self.confirmation_window;
        let policies = &self.policies;
        let change = self
            .writer
            .modify(|t| apply_event(t, policies, event, Instant::now(), window));
        self.publish(change);
    }

    fn handle_command(&mut self, command: StateCommand) {
        trace!(?command, "State command");
        let policies = &mut self.policies;
        let changes = self
            .writer
            .modify(|t| apply_command(t, policies, command, Utc::now()));
        self.publish(changes);
    }

    fn tick(&mut self) {
        let now = Instant::now();
        self.writer.modify(|t| confirm_stable(t, now));
    }

    fn publish(&self, changes: impl IntoIterator<Item = StateChange>) {
        for change in changes {
            // No receivers is fine; status is still in the table.
            let _ = self.changes.send(change);
        }
    }

    /// Apply commands already queued at shutdown, bounded by [`DRAIN_TIMEOUT`].
    async fn drain(&mut self) {
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while Instant::now() < deadline {
            match self.commands.try_recv() {
                Ok(command) => self.handle_command(command),
                Err(_) => break,
            }
        }
    }
}
