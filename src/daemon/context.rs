//! Shared state behind the control socket.
//!
//! [`AppContext`] answers control requests. It only reads the status table and
//! forwards intent to the reconciler and supervisor; it never mutates state
//! directly.

use super::domain::{DomainAssignment, DomainIsolationResolver};
use super::log_buffer::{LogBuffer, LogSource};
use super::protocol::{
    ArchivedRequest, DaemonStatus, EngineInfo, NamespaceInfo, ProfileInfo, Response, ServiceInfo,
};
use super::reconciler::ReconcilerHandle;
use super::shutdown::ShutdownHandle;
use super::state::{StateStore, StateTable};
use super::supervisor::{EngineState, SupervisorCommand};
use crate::clienv;
use crate::error::Result;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct AppContext {
    pub config_path: PathBuf,
    pub domain: DomainAssignment,
    pub store: StateStore,
    pub log: Arc<LogBuffer>,
    pub shutdown: ShutdownHandle,
    pub reconciler: ReconcilerHandle,
    pub supervisor: mpsc::UnboundedSender<SupervisorCommand>,
    pub started_at: Instant,
    pub version: String,
}

impl AppContext {
    pub async fn handle_request(&self, request: &ArchivedRequest) -> Response {
        match request {
            ArchivedRequest::Ping => {
                debug!("Handling: Ping");
                Response::Pong {
                    uptime_secs: self.started_at.elapsed().as_secs(),
                    version: self.version.clone(),
                }
            }

            ArchivedRequest::Start { profile } => {
                let profile = profile.as_ref().map(|p| p.as_str().to_string());
                info!(profile = ?profile, "Handling: Start");
                respond(self.start(profile).await)
            }

            ArchivedRequest::Stop { profile } => {
                let profile = profile.as_ref().map(|p| p.as_str().to_string());
                info!(profile = ?profile, "Handling: Stop");
                match profile {
                    Some(name) => respond(self.reconciler.set_enabled(Some(name), false).await),
                    None => {
                        self.shutdown.shutdown();
                        Response::Ok
                    }
                }
            }

            ArchivedRequest::Status => {
                debug!("Handling: Status");
                Response::Status {
                    status: self.status(),
                }
            }

            ArchivedRequest::Reload => {
                info!("Handling: Reload");
                respond(self.reload().await)
            }

            ArchivedRequest::Logs { lines } => {
                let n = lines.to_native() as usize;
                debug!(lines = n, "Handling: Logs");
                Response::Logs {
                    lines: self.log.tail(n).iter().map(|l| l.render()).collect(),
                }
            }
        }
    }

    /// Enable one profile, or all of them. Starting everything also re-arms
    /// an engine that exhausted its restart budget.
    async fn start(&self, profile: Option<String>) -> Result<()> {
        let everything = profile.is_none();
        self.reconciler.set_enabled(profile, true).await?;
        if everything && self.store.engine().state == EngineState::Failed {
            info!("Re-arming failed engine");
            self.log.push(LogSource::Daemon, "engine re-armed by start request");
            // A closed channel means the supervisor already stopped.
            let _ = self.supervisor.send(SupervisorCommand::Rearm);
        }
        Ok(())
    }

    /// Re-read the configuration file. A rejected file leaves the running
    /// configuration untouched.
    async fn reload(&self) -> Result<()> {
        let config = clienv::load_config(&self.config_path).inspect_err(|e| {
            warn!(error = %e, "Reload rejected");
        })?;
        DomainIsolationResolver::revalidate(
            &self.domain,
            &config.project_root,
            config.domain_suffix.as_deref(),
        )?;
        self.reconciler.reload(config).await?;
        self.log.push(LogSource::Daemon, "configuration reloaded");
        Ok(())
    }

    pub fn status(&self) -> DaemonStatus {
        build_status(
            &self.store.snapshot(),
            &self.domain,
            &self.version,
            self.started_at.elapsed().as_secs(),
            Utc::now(),
        )
    }
}

fn respond(result: Result<()>) -> Response {
    match result {
        Ok(()) => Response::Ok,
        Err(e) => Response::Error {
            message: e.to_string(),
        },
    }
}

fn build_status(
    table: &StateTable,
    domain: &DomainAssignment,
    version: &str,
    uptime_secs: u64,
    now: DateTime<Utc>,
) -> DaemonStatus {
    let engine = &table.engine;
    let services = &table.services;

    let profiles = services
        .profiles
        .iter()
        .map(|(name, entry)| ProfileInfo {
            name: name.clone(),
            enabled: entry.enabled,
            namespaces: services
                .attachments
                .iter()
                .filter(|(key, _)| &key.profile == name)
                .map(|(key, attachment)| NamespaceInfo {
                    namespace: key.namespace.clone(),
                    status: attachment.status.as_str().to_string(),
                    last_error: attachment.last_error.clone(),
                    services: services
                        .connections_of(key)
                        .map(|(conn_key, conn)| ServiceInfo {
                            name: conn_key.service.clone(),
                            status: conn.status.as_str().to_string(),
                            uptime_secs: conn.uptime_secs(now),
                            reconnects: conn.reconnects,
                            last_error: conn.last_error.clone(),
                        })
                        .collect(),
                })
                .collect(),
        })
        .collect();

    DaemonStatus {
        version: version.to_string(),
        uptime_secs,
        domain_suffix: domain.suffix.clone(),
        domain_source: domain.source.as_str().to_string(),
        engine: EngineInfo {
            state: engine.state.as_str().to_string(),
            pid: engine.pid,
            uptime_secs: engine
                .started_at
                .filter(|_| engine.state == EngineState::Running)
                .map(|since| (now - since).num_seconds().max(0) as u64),
            endpoint: engine.endpoint.clone(),
            restarts: engine.restarts,
            last_error: engine.last_error.clone(),
        },
        profiles,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, CONFIG_FILE_NAME};
    use crate::daemon::backoff::RetryPolicy;
    use crate::daemon::domain::{CollisionCheck, SuffixSource};
    use crate::daemon::events::{state_command_channel, EngineEvent, EventKind, EventMonitor};
    use crate::daemon::protocol::Request;
    use crate::daemon::reconciler::ProfileReconciler;
    use crate::daemon::shutdown::ShutdownCoordinator;
    use crate::daemon::state::{AttachmentKey, ConnectionStatus};
    use crate::daemon::supervisor::EngineStatus;
    use crate::daemon::testing::FakeEngine;
    use std::time::Duration;
    use tokio::sync::{broadcast, watch};

    const CONFIG: &str = r#"
[[profiles]]
name = "shop"
namespaces = ["web"]

[[profiles]]
name = "ops"
enabled = false
namespaces = ["mon"]
"#;

    struct Rig {
        ctx: AppContext,
        engine: Arc<FakeEngine>,
        supervisor_rx: mpsc::UnboundedReceiver<SupervisorCommand>,
        engine_writer: crate::daemon::state::EngineWriter,
        _status: watch::Sender<EngineStatus>,
        coordinator: ShutdownCoordinator,
        dir: tempfile::TempDir,
    }

    fn rig() -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&config_path, CONFIG).unwrap();
        let config = Config::load(&config_path).unwrap();
        let (suffix, source) =
            DomainIsolationResolver::compute(&config.project_root, None).unwrap();

        let engine = Arc::new(FakeEngine::new());
        engine.set_services("web", &["api"]);
        let (store, writer, engine_writer) = StateStore::new();
        let (commands, command_rx) = state_command_channel();
        let (changes, _) = broadcast::channel(64);
        let (status, status_rx) = watch::channel(EngineStatus::running(1));
        let (reconciler, requests) = ReconcilerHandle::channel();
        let (supervisor, supervisor_rx) = mpsc::unbounded_channel();
        let coordinator = ShutdownCoordinator::new();

        tokio::spawn(
            EventMonitor::new(
                engine.clone(),
                writer,
                command_rx,
                changes,
                status_rx.clone(),
                coordinator.handle(),
                RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(50), 2.0),
                Duration::from_secs(30),
            )
            .run(),
        );
        tokio::spawn(
            ProfileReconciler::new(
                config,
                engine.clone(),
                store.clone(),
                commands,
                requests,
                status_rx,
                coordinator.handle(),
            )
            .run(),
        );

        let ctx = AppContext {
            config_path,
            domain: DomainAssignment {
                suffix,
                source,
                collision: CollisionCheck::Clear,
            },
            store,
            log: Arc::new(LogBuffer::new(100)),
            shutdown: coordinator.handle(),
            reconciler,
            supervisor,
            started_at: Instant::now(),
            version: "test".into(),
        };

        Rig {
            ctx,
            engine,
            supervisor_rx,
            engine_writer,
            _status: status,
            coordinator,
            dir,
        }
    }

    async fn call(ctx: &AppContext, request: Request) -> Response {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(&request).unwrap();
        let archived = rkyv::access::<ArchivedRequest, rkyv::rancor::Error>(&bytes).unwrap();
        ctx.handle_request(archived).await
    }

    async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn status_nests_services_under_profiles() {
        let r = rig();
        eventually("web observed", || r.ctx.store.services().observed().count() == 1).await;
        r.engine.wait_for_subscribers(1).await;
        r.engine.emit(EngineEvent {
            kind: EventKind::Connected,
            namespace: "web".into(),
            service: "api".into(),
            timestamp: Utc::now(),
            error: None,
        });
        eventually("api connected", || {
            r.ctx
                .store
                .services()
                .connections
                .values()
                .any(|c| c.status == ConnectionStatus::Connected)
        })
        .await;

        let Response::Status { status } = call(&r.ctx, Request::Status).await else {
            panic!("expected status");
        };
        assert_eq!(status.domain_source, "auto");
        assert!(status.domain_suffix.starts_with("fk-"));
        assert_eq!(status.profiles.len(), 2);

        let ops = status.profiles.iter().find(|p| p.name == "ops").unwrap();
        assert!(!ops.enabled);
        assert!(ops.namespaces.is_empty());

        let shop = status.profiles.iter().find(|p| p.name == "shop").unwrap();
        assert_eq!(shop.namespaces.len(), 1);
        assert_eq!(shop.namespaces[0].status, "added");
        let api = &shop.namespaces[0].services[0];
        assert_eq!(api.name, "api");
        assert_eq!(api.status, "connected");
        assert!(api.uptime_secs.is_some());
        r.coordinator.handle().shutdown();
    }

    #[tokio::test]
    async fn start_and_stop_toggle_one_profile() {
        let r = rig();
        eventually("web attached", || r.engine.attached() == vec!["web"]).await;

        let resp = call(&r.ctx, Request::Start { profile: Some("ops".into()) }).await;
        assert_eq!(resp, Response::Ok);
        eventually("mon attached", || r.engine.attached() == vec!["mon", "web"]).await;

        let resp = call(&r.ctx, Request::Stop { profile: Some("shop".into()) }).await;
        assert_eq!(resp, Response::Ok);
        eventually("web detached", || r.engine.attached() == vec!["mon"]).await;
        assert!(!r.ctx.shutdown.is_shutdown());

        let resp = call(&r.ctx, Request::Start { profile: Some("nope".into()) }).await;
        assert!(matches!(resp, Response::Error { .. }));
        r.coordinator.handle().shutdown();
    }

    #[tokio::test]
    async fn start_all_rearms_failed_engine() {
        let mut r = rig();
        r.engine_writer.modify(|row| row.state = EngineState::Failed);

        assert_eq!(call(&r.ctx, Request::Start { profile: None }).await, Response::Ok);
        assert_eq!(r.supervisor_rx.recv().await, Some(SupervisorCommand::Rearm));
        r.coordinator.handle().shutdown();
    }

    #[tokio::test]
    async fn stop_without_profile_shuts_down() {
        let r = rig();
        assert_eq!(call(&r.ctx, Request::Stop { profile: None }).await, Response::Ok);
        assert!(r.ctx.shutdown.is_shutdown());
    }

    #[tokio::test]
    async fn invalid_reload_keeps_running_config() {
        let r = rig();
        eventually("web attached", || r.engine.attached() == vec!["web"]).await;

        std::fs::write(
            r.dir.path().join(CONFIG_FILE_NAME),
            "[[profiles]]\nname = \"shop\"\nnamespaces = []\n",
        )
        .unwrap();
        let resp = call(&r.ctx, Request::Reload).await;
        assert!(matches!(resp, Response::Error { .. }));

        // A changed suffix is rejected as well.
        std::fs::write(
            r.dir.path().join(CONFIG_FILE_NAME),
            format!("domain_suffix = \"other.local\"\n{CONFIG}"),
        )
        .unwrap();
        let Response::Error { message } = call(&r.ctx, Request::Reload).await else {
            panic!("expected error");
        };
        assert!(message.contains("cannot change"));

        let services = r.ctx.store.services();
        assert!(services
            .attachments
            .contains_key(&AttachmentKey::new("shop", "web")));
        assert_eq!(r.engine.attached(), vec!["web"]);
        r.coordinator.handle().shutdown();
    }

    #[tokio::test]
    async fn valid_reload_applies_new_profiles() {
        let r = rig();
        eventually("web attached", || r.engine.attached() == vec!["web"]).await;

        std::fs::write(
            r.dir.path().join(CONFIG_FILE_NAME),
            "[[profiles]]\nname = \"shop\"\nnamespaces = [\"web\", \"cart\"]\n",
        )
        .unwrap();
        assert_eq!(call(&r.ctx, Request::Reload).await, Response::Ok);
        eventually("cart attached", || r.engine.attached() == vec!["cart", "web"]).await;
        assert!(r
            .ctx
            .log
            .tail(10)
            .iter()
            .any(|l| l.text.contains("reloaded")));
        r.coordinator.handle().shutdown();
    }

    #[tokio::test]
    async fn logs_and_ping() {
        let r = rig();
        r.ctx.log.push(LogSource::Stderr, "forwarding api.web");
        let Response::Logs { lines } = call(&r.ctx, Request::Logs { lines: 5 }).await else {
            panic!("expected logs");
        };
        assert!(lines.last().unwrap().contains("[stderr] forwarding api.web"));

        let Response::Pong { version, .. } = call(&r.ctx, Request::Ping).await else {
            panic!("expected pong");
        };
        assert_eq!(version, "test");
        r.coordinator.handle().shutdown();
    }

    #[test]
    fn engine_uptime_only_while_running() {
        let mut table = StateTable::default();
        let now = Utc::now();
        table.engine.started_at = Some(now - chrono::Duration::seconds(42));
        table.engine.state = EngineState::Running;
        let domain = DomainAssignment {
            suffix: "shop.local".into(),
            source: SuffixSource::Override,
            collision: CollisionCheck::Clear,
        };
        let status = build_status(&table, &domain, "v", 1, now);
        assert_eq!(status.engine.uptime_secs, Some(42));
        assert_eq!(status.domain_source, "override");

        table.engine.state = EngineState::Backoff;
        assert_eq!(build_status(&table, &domain, "v", 1, now).engine.uptime_secs, None);
    }
}
