//! Control socket client used by the CLI.

use super::protocol::{DaemonStatus, MessageFrame, Request, Response, MAX_FRAME_LEN};
use crate::clienv;
use crate::error::{DaemonError, Result};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{debug, trace};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const STARTUP_WAIT: Duration = Duration::from_secs(10);

pub struct DaemonClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl DaemonClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: REQUEST_TIMEOUT,
        }
    }

    /// Client for the instance owning `suffix`.
    pub fn for_instance(suffix: &str) -> Self {
        Self::new(clienv::socket_path(suffix))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    pub async fn is_running(&self) -> bool {
        self.ping().await.is_ok()
    }

    /// Send one request and wait for its response.
    pub async fn request(&self, request: Request) -> Result<Response> {
        tokio::time::timeout(self.timeout, self.exchange(&request))
            .await
            .map_err(|_| {
                DaemonError::Protocol(format!("no response within {:?}", self.timeout))
            })?
    }

    async fn exchange(&self, request: &Request) -> Result<Response> {
        trace!(?request, socket = %self.socket_path.display(), "Sending request");
        let mut stream = UnixStream::connect(&self.socket_path).await?;

        let frame = MessageFrame::encode_request(request)
            .map_err(|e| DaemonError::Protocol(format!("failed to encode request: {e}")))?;
        stream.write_all(&frame).await?;
        stream.flush().await?;

        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await?;
        let len = MessageFrame::read_length(&len_buf);
        if len > MAX_FRAME_LEN {
            return Err(DaemonError::Protocol(format!(
                "response of {len} bytes exceeds the frame limit"
            )));
        }
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await?;

        MessageFrame::decode_response(&buf)
            .map_err(|e| DaemonError::Protocol(format!("failed to decode response: {e}")))
    }

    pub async fn ping(&self) -> Result<(u64, String)> {
        match self.request(Request::Ping).await? {
            Response::Pong {
                uptime_secs,
                version,
            } => Ok((uptime_secs, version)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn start(&self, profile: Option<String>) -> Result<()> {
        expect_ok(self.request(Request::Start { profile }).await?)
    }

    pub async fn stop(&self, profile: Option<String>) -> Result<()> {
        expect_ok(self.request(Request::Stop { profile }).await?)
    }

    pub async fn reload(&self) -> Result<()> {
        expect_ok(self.request(Request::Reload).await?)
    }

    pub async fn status(&self) -> Result<DaemonStatus> {
        match self.request(Request::Status).await? {
            Response::Status { status } => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    pub async fn logs(&self, lines: u32) -> Result<Vec<String>> {
        match self.request(Request::Logs { lines }).await? {
            Response::Logs { lines } => Ok(lines),
            other => Err(unexpected(other)),
        }
    }

    /// Start the daemon in the background unless it already answers, then
    /// wait for it to come up. Its output goes to `log_path`.
    pub async fn ensure_running(&self, config_path: &Path, log_path: &Path) -> Result<()> {
        if self.is_running().await {
            return Ok(());
        }

        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;

        let exe = std::env::current_exe()?;
        debug!(exe = %exe.display(), log = %log_path.display(), "Spawning background daemon");
        let mut child = std::process::Command::new(exe)
            .arg("--config")
            .arg(config_path)
            .arg("run")
            .env(clienv::EnvVar::FwdkeeperSocket.as_str(), &self.socket_path)
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log)
            .process_group(0)
            .spawn()?;

        let deadline = tokio::time::Instant::now() + STARTUP_WAIT;
        while tokio::time::Instant::now() < deadline {
            if let Some(status) = child.try_wait()? {
                return Err(DaemonError::Protocol(format!(
                    "daemon exited during startup ({status}); see {}",
                    log_path.display()
                )));
            }
            if self.is_running().await {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Err(DaemonError::Protocol(format!(
            "daemon did not answer within {STARTUP_WAIT:?}; see {}",
            log_path.display()
        )))
    }
}

fn expect_ok(response: Response) -> Result<()> {
    match response {
        Response::Ok => Ok(()),
        other => Err(unexpected(other)),
    }
}

fn unexpected(response: Response) -> DaemonError {
    match response {
        Response::Error { message } => DaemonError::Remote(message),
        other => DaemonError::Protocol(format!("unexpected response: {other:?}")),
    }
}
