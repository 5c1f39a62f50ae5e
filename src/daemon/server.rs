use super::context::AppContext;
use super::control::{ControlApiClient, EngineControl};
use super::domain::{CollisionCheck, DomainIsolationResolver, InstanceRegistry};
use super::events::{state_command_channel, EventMonitor, StateChange};
use super::log_buffer::{LogBuffer, LogSource};
use super::pidfile::PidFile;
use super::privilege;
use super::protocol::{ArchivedRequest, MessageFrame, MAX_FRAME_LEN};
use super::reconciler::{ProfileReconciler, ReconcilerHandle};
use super::shutdown::{ShutdownCoordinator, ShutdownHandle, SHUTDOWN_TIMEOUT};
use super::state::StateStore;
use super::supervisor::{EngineLaunch, EngineStatus, ProcessSupervisor, SupervisorTimings};
use crate::clienv;
use crate::config::Config;
use crate::error::{DaemonError, Result};
use rkyv::util::AlignedVec;
use std::net::{Ipv4Addr, TcpListener};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

pub struct ServerConfig {
    pub socket_path: PathBuf,
    pub pid_path: PathBuf,
    pub registry_dir: PathBuf,
    pub config_path: PathBuf,
}

impl ServerConfig {
    /// Paths for the instance owning `suffix`, honouring environment overrides.
    pub fn from_env(config_path: PathBuf, suffix: &str) -> Self {
        Self {
            socket_path: clienv::socket_path(suffix),
            pid_path: clienv::pid_path(suffix),
            registry_dir: clienv::registry_dir(),
            config_path,
        }
    }

    /// Paths for the instance owning `suffix` under `data_dir`.
    pub fn in_data_dir(data_dir: &Path, suffix: &str, config_path: PathBuf) -> Self {
        let instance = clienv::instance_dir_in(data_dir, suffix);
        Self {
            socket_path: instance.join(clienv::SOCKET_FILE),
            pid_path: instance.join(clienv::PID_FILE),
            registry_dir: clienv::registry_dir_in(data_dir),
            config_path,
        }
    }
}

pub struct DaemonServer {
    paths: ServerConfig,
    config: Config,
}

impl DaemonServer {
    pub fn new(paths: ServerConfig, config: Config) -> Self {
        Self { paths, config }
    }

    /// Run until a stop request or signal. Startup failures (domain conflict,
    /// already running, privileges, port in use) return before anything is
    /// spawned.
    pub async fn run(self) -> Result<()> {
        info!("fwdkeeper daemon starting...");
        let Self { paths, config } = self;

        // Claim the suffix before the PID file: a second instance of the same
        // project must fail with DomainConflict.
        let resolver = DomainIsolationResolver::new(InstanceRegistry::new(&paths.registry_dir));
        let (domain, _lease) =
            resolver.resolve(&config.project_root, config.domain_suffix.as_deref())?;
        if domain.collision == CollisionCheck::ReclaimedStale {
            warn!(suffix = %domain.suffix, "Reclaimed domain suffix from a dead instance");
        }

        let mut pid_file = PidFile::new(&paths.pid_path);
        if let Err(pid) = pid_file.acquire()? {
            return Err(DaemonError::AlreadyRunning { pid });
        }
        info!(path = %paths.pid_path.display(), "PID file written");

        let binary = privilege::verify(&config.engine)?;
        let mut engine = config.engine.clone();
        engine.binary = binary.to_string_lossy().into_owned();
        let api_port = engine.api_port_for(&domain.suffix);
        ensure_port_free(api_port)?;
        engine.api_port = Some(api_port);

        if paths.socket_path.exists() {
            std::fs::remove_file(&paths.socket_path)?;
        }
        if let Some(parent) = paths.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = tokio::net::UnixListener::bind(&paths.socket_path)?;
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&paths.socket_path, perms)?;
        }
        info!(socket = %paths.socket_path.display(), "IPC server listening");

        let endpoint = engine.api_base_url(&domain.suffix);
        let control: Arc<dyn EngineControl> = Arc::new(ControlApiClient::new(
            endpoint.clone(),
            config.defaults.request_timeout,
        )?);
        let log = Arc::new(LogBuffer::default());
        let mut coordinator = ShutdownCoordinator::new();

        let (store, service_writer, engine_writer) = StateStore::new();
        let (status_tx, status_rx) = watch::channel(EngineStatus::initial());
        let (supervisor_tx, supervisor_rx) = mpsc::unbounded_channel();
        let (commands, command_rx) = state_command_channel();
        let (changes, changes_rx) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let (reconciler, requests) = ReconcilerHandle::channel();

        let supervisor = ProcessSupervisor::new(
            EngineLaunch::new(&engine, &domain.suffix),
            endpoint,
            Arc::clone(&control),
            engine_writer,
            status_tx,
            supervisor_rx,
            Arc::clone(&log),
            coordinator.handle(),
            config.defaults.process_retry.policy(),
            SupervisorTimings::new(&engine, config.defaults.confirmation_window),
        );
        let monitor = EventMonitor::new(
            Arc::clone(&control),
            service_writer,
            command_rx,
            changes,
            status_rx.clone(),
            coordinator.handle(),
            config.defaults.stream_retry.policy(),
            config.defaults.confirmation_window,
        );
        let profiles = ProfileReconciler::new(
            config,
            Arc::clone(&control),
            store.clone(),
            commands,
            requests,
            status_rx,
            coordinator.handle(),
        );

        let mut tasks: Vec<JoinHandle<()>> = vec![
            tokio::spawn(supervisor.run()),
            tokio::spawn(monitor.run()),
            tokio::spawn(profiles.run()),
            tokio::spawn(record_changes(
                changes_rx,
                Arc::clone(&log),
                coordinator.handle(),
            )),
        ];

        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;
            let handle = coordinator.handle();

            tokio::spawn(async move {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
                handle.shutdown();
            });
        }

        let ctx = Arc::new(AppContext {
            config_path: paths.config_path.clone(),
            domain,
            store,
            log: Arc::clone(&log),
            shutdown: coordinator.handle(),
            reconciler,
            supervisor: supervisor_tx,
            started_at: Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        });
        log.push(LogSource::Daemon, "daemon ready");
        info!(suffix = %ctx.domain.suffix, "fwdkeeper daemon ready");

        loop {
            tokio::select! {
                conn = listener.accept() => {
                    match conn {
                        Ok((stream, _)) => {
                            let ctx = Arc::clone(&ctx);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(&ctx, stream).await {
                                    error!("Connection handler error: {}", e);
                                }
                            });
                        }
                        Err(e) => error!("Accept error: {}", e),
                    }
                }
                _ = coordinator.wait() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        drop(listener);
        if paths.socket_path.exists() {
            std::fs::remove_file(&paths.socket_path)?;
        }

        let joined = tokio::time::timeout(
            SHUTDOWN_TIMEOUT,
            futures::future::join_all(tasks.iter_mut()),
        )
        .await;
        if joined.is_err() {
            warn!(timeout = ?SHUTDOWN_TIMEOUT, "Shutdown timed out; aborting remaining tasks");
            for task in &tasks {
                task.abort();
            }
        }

        pid_file.release();
        info!("fwdkeeper daemon stopped");
        Ok(())
    }
}

/// Fail when something already listens on the engine's API port; its health
/// answers would otherwise be taken for our engine's.
fn ensure_port_free(port: u16) -> Result<()> {
    match TcpListener::bind((Ipv4Addr::LOCALHOST, port)) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            Err(DaemonError::PortInUse { port })
        }
        // Privileged ports are bound by the engine under sudo.
        Err(e) => {
            debug!(port, error = %e, "API port probe inconclusive");
            Ok(())
        }
    }
}

/// Mirror every status transition into the daemon log.
async fn record_changes(
    mut changes: broadcast::Receiver<StateChange>,
    log: Arc<LogBuffer>,
    mut shutdown: ShutdownHandle,
) {
    loop {
        tokio::select! {
            change = changes.recv() => match change {
                Ok(change) => {
                    info!(
                        key = %change.key,
                        from = ?change.from,
                        to = change.to.as_str(),
                        error = ?change.error,
                        "Service status changed"
                    );
                    log.push(LogSource::Daemon, change.to_string());
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Status change log lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.wait() => break,
        }
    }
}

/// Read one length-prefixed request into an aligned buffer.
async fn read_request<S: AsyncRead + Unpin>(stream: &mut S) -> Result<AlignedVec> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = MessageFrame::read_length(&len_buf);
    trace!("Request length: {} bytes", len);
    if len > MAX_FRAME_LEN {
        return Err(DaemonError::Protocol(format!(
            "request of {len} bytes exceeds the frame limit"
        )));
    }

    let mut request_buf = vec![0u8; len];
    stream.read_exact(&mut request_buf).await?;
    Ok(MessageFrame::aligned(&request_buf))
}

async fn handle_connection<S>(ctx: &AppContext, mut stream: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    trace!("New connection accepted");
    let request_buf = read_request(&mut stream).await?;

    let archived = rkyv::access::<ArchivedRequest, rkyv::rancor::Error>(&request_buf)
        .map_err(|e| DaemonError::Protocol(format!("failed to deserialize request: {e}")))?;

    let response = ctx.handle_request(archived).await;

    let response_bytes = MessageFrame::encode_response(&response)
        .map_err(|e| DaemonError::Protocol(format!("failed to encode response: {e}")))?;
    stream.write_all(&response_bytes).await?;
    stream.flush().await?;

    debug!("Response sent");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CONFIG_FILE_NAME;
    use crate::daemon::client::DaemonClient;
    use crate::daemon::protocol::Response;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    #[tokio::test]
    async fn oversized_frame_is_rejected_before_allocation() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let len = (MAX_FRAME_LEN as u32 + 1).to_le_bytes();
        client.write_all(&len).await.unwrap();

        let err = read_request(&mut server).await.unwrap_err();
        assert!(matches!(err, DaemonError::Protocol(_)));
    }

    #[tokio::test]
    async fn truncated_frame_is_an_io_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&10u32.to_le_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);

        let err = read_request(&mut server).await.unwrap_err();
        assert!(matches!(err, DaemonError::Io(_)));
    }

    fn free_port() -> u16 {
        TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    /// A project named after `suffix` under `dir`, sharing `dir/data`.
    fn project(dir: &Path, suffix: &str) -> (ServerConfig, Config) {
        let root = dir.join(suffix);
        std::fs::create_dir_all(&root).unwrap();
        let engine = root.join("engine.sh");
        std::fs::write(&engine, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&engine, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config_path = root.join(CONFIG_FILE_NAME);
        std::fs::write(
            &config_path,
            format!(
                r#"
domain_suffix = "{suffix}"

[engine]
binary = "{}"
api_port = {}
use_sudo = false
startup_timeout = "300ms"
shutdown_grace = "1s"
health_interval = "50ms"

[[profiles]]
name = "shop"
namespaces = ["web"]
"#,
                engine.display(),
                free_port(),
            ),
        )
        .unwrap();

        let paths = ServerConfig::in_data_dir(&dir.join("data"), suffix, config_path.clone());
        (paths, Config::load(&config_path).unwrap())
    }

    fn fixture(dir: &Path) -> (ServerConfig, Config) {
        project(dir, "srv.test")
    }

    async fn wait_until_running(client: &DaemonClient) {
        for _ in 0..200 {
            if client.is_running().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("daemon did not come up at {}", client.socket_path().display());
    }

    #[tokio::test]
    async fn serves_requests_and_stops_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let (paths, config) = fixture(dir.path());
        let socket = paths.socket_path.clone();
        let pid_path = paths.pid_path.clone();

        let server = tokio::spawn(DaemonServer::new(paths, config).run());
        let client = DaemonClient::new(&socket);
        wait_until_running(&client).await;
        assert!(pid_path.exists());
        let mode = std::fs::metadata(&socket).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let mut status = client.status().await.unwrap();
        for _ in 0..100 {
            if !status.profiles.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            status = client.status().await.unwrap();
        }
        assert_eq!(status.domain_suffix, "srv.test");
        assert_eq!(status.domain_source, "override");
        assert_eq!(status.profiles[0].name, "shop");

        // The engine never answers health checks, so it keeps crashing.
        assert!(matches!(
            client.request(crate::daemon::protocol::Request::Logs { lines: 100 }).await,
            Ok(Response::Logs { .. })
        ));

        client.stop(None).await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!socket.exists());
        assert!(!pid_path.exists());
    }

    /// A live process that is not this one, to stand in for another daemon.
    fn other_process() -> std::process::Child {
        std::process::Command::new("sleep").arg("30").spawn().unwrap()
    }

    #[tokio::test]
    async fn second_instance_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let (paths, config) = fixture(dir.path());
        let mut other = other_process();
        std::fs::create_dir_all(paths.pid_path.parent().unwrap()).unwrap();
        std::fs::write(&paths.pid_path, format!("{}\n", other.id())).unwrap();

        let err = DaemonServer::new(paths, config).run().await.unwrap_err();
        other.kill().unwrap();
        other.wait().unwrap();
        assert!(matches!(err, DaemonError::AlreadyRunning { .. }));
    }

    #[tokio::test]
    async fn suffix_held_by_live_instance_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (paths, config) = fixture(dir.path());
        let mut other = other_process();
        std::fs::create_dir_all(&paths.registry_dir).unwrap();
        std::fs::write(
            paths.registry_dir.join("srv.test.pid"),
            format!("{}\n", other.id()),
        )
        .unwrap();
        let pid_path = paths.pid_path.clone();

        let err = DaemonServer::new(paths, config).run().await.unwrap_err();
        other.kill().unwrap();
        other.wait().unwrap();
        assert!(matches!(err, DaemonError::DomainConflict { .. }));
        assert!(!pid_path.exists());
    }

    #[tokio::test]
    async fn projects_sharing_a_data_dir_run_side_by_side() {
        let dir = tempfile::tempdir().unwrap();
        let (paths_a, _) = project(dir.path(), "proj-a");
        let (paths_b, config_b) = project(dir.path(), "proj-b");
        let (paths_c, config_c) = project(dir.path(), "proj-a");
        assert_ne!(paths_a.socket_path, paths_b.socket_path);
        assert_ne!(paths_a.pid_path, paths_b.pid_path);
        assert_eq!(paths_a.registry_dir, paths_b.registry_dir);

        // Project A is live: it holds its suffix and its own PID file.
        let mut a = other_process();
        std::fs::create_dir_all(&paths_a.registry_dir).unwrap();
        std::fs::write(paths_a.registry_dir.join("proj-a.pid"), format!("{}\n", a.id())).unwrap();
        std::fs::create_dir_all(paths_a.pid_path.parent().unwrap()).unwrap();
        std::fs::write(&paths_a.pid_path, format!("{}\n", a.id())).unwrap();

        // Another checkout with A's suffix is a domain conflict.
        let err = DaemonServer::new(paths_c, config_c).run().await.unwrap_err();
        assert!(matches!(err, DaemonError::DomainConflict { ref suffix, .. } if suffix == "proj-a"));

        let socket_b = paths_b.socket_path.clone();
        let server = tokio::spawn(DaemonServer::new(paths_b, config_b).run());
        let client = DaemonClient::new(&socket_b);
        wait_until_running(&client).await;
        assert_eq!(client.status().await.unwrap().domain_suffix, "proj-b");
        assert!(!paths_a.socket_path.exists());

        client.stop(None).await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        a.kill().unwrap();
        a.wait().unwrap();
        assert!(paths_a.pid_path.exists());
    }

    #[test]
    fn busy_api_port_is_fatal() {
        let taken = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = taken.local_addr().unwrap().port();
        assert!(matches!(
            ensure_port_free(port),
            Err(DaemonError::PortInUse { port: p }) if p == port
        ));
        drop(taken);
        ensure_port_free(port).unwrap();
    }
}
