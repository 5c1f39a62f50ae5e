use std::path::{Path, PathBuf};

use crate::config::{Config, CONFIG_FILE_NAME};
use crate::daemon::domain::DomainIsolationResolver;
use crate::error::Result;

#[derive(Debug, Clone, Copy)]
pub enum EnvVar {
    FwdkeeperConfig,
    FwdkeeperSocket,
    FwdkeeperPid,
    FwdkeeperDataDir,
    FwdkeeperEngine,
}

impl EnvVar {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvVar::FwdkeeperConfig => "FWDKEEPER_CONFIG",
            EnvVar::FwdkeeperSocket => "FWDKEEPER_SOCKET",
            EnvVar::FwdkeeperPid => "FWDKEEPER_PID",
            EnvVar::FwdkeeperDataDir => "FWDKEEPER_DATA_DIR",
            EnvVar::FwdkeeperEngine => "FWDKEEPER_ENGINE",
        }
    }
}

/// Non-empty value of an environment variable.
fn env_opt(var: EnvVar) -> Option<String> {
    std::env::var(var.as_str()).ok().filter(|v| !v.trim().is_empty())
}

const FALLBACK_DATA_DIR: &str = "~/.local/share";
const SUBDIR: &str = "fwdkeeper";

/// Data directory ($FWDKEEPER_DATA_DIR or ~/.local/share/fwdkeeper)
pub fn data_dir() -> PathBuf {
    let dir = env_opt(EnvVar::FwdkeeperDataDir)
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from(FALLBACK_DATA_DIR))
                .join(SUBDIR)
        });
    tracing::trace!(dir = %dir.display(), "Resolved data directory");
    dir
}

/// Configuration file ($FWDKEEPER_CONFIG or ./.fwdkeeper.toml)
pub fn config_path() -> PathBuf {
    let path = env_opt(EnvVar::FwdkeeperConfig)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
    let path = std::path::absolute(&path).unwrap_or(path);
    tracing::trace!(path = %path.display(), "Config path");
    path
}

const INSTANCES_SUBDIR: &str = "instances";
pub const SOCKET_FILE: &str = "daemon.sock";
pub const PID_FILE: &str = "daemon.pid";
pub const LOG_FILE: &str = "daemon.log";

/// Runtime directory of the instance owning `suffix` (<data>/instances/<suffix>)
pub fn instance_dir_in(data_dir: &Path, suffix: &str) -> PathBuf {
    data_dir.join(INSTANCES_SUBDIR).join(suffix)
}

/// Control socket path ($FWDKEEPER_SOCKET or <data>/instances/<suffix>/daemon.sock)
pub fn socket_path(suffix: &str) -> PathBuf {
    let path = env_opt(EnvVar::FwdkeeperSocket)
        .map(PathBuf::from)
        .unwrap_or_else(|| instance_dir_in(&data_dir(), suffix).join(SOCKET_FILE));
    tracing::trace!(path = %path.display(), "Daemon socket path");
    path
}

/// PID file path ($FWDKEEPER_PID or <data>/instances/<suffix>/daemon.pid)
pub fn pid_path(suffix: &str) -> PathBuf {
    let path = env_opt(EnvVar::FwdkeeperPid)
        .map(PathBuf::from)
        .unwrap_or_else(|| instance_dir_in(&data_dir(), suffix).join(PID_FILE));
    tracing::trace!(path = %path.display(), "Daemon PID path");
    path
}

/// Host-wide registry of claimed domain suffixes, shared by all instances.
pub fn registry_dir_in(data_dir: &Path) -> PathBuf {
    data_dir.join(INSTANCES_SUBDIR)
}

pub fn registry_dir() -> PathBuf {
    let dir = registry_dir_in(&data_dir());
    tracing::trace!(dir = %dir.display(), "Instance registry directory");
    dir
}

/// Engine binary override ($FWDKEEPER_ENGINE)
pub fn engine_binary() -> Option<String> {
    let val = env_opt(EnvVar::FwdkeeperEngine);
    tracing::trace!(value = ?val, "FWDKEEPER_ENGINE env var");
    val
}

/// Load the configuration file and layer environment overrides on top.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config = Config::load(path)?;
    if let Some(binary) = engine_binary() {
        config.engine.binary = binary;
    }
    Ok(config)
}

/// Output of a daemon started in the background (<data>/instances/<suffix>/daemon.log)
pub fn log_path(suffix: &str) -> PathBuf {
    let path = instance_dir_in(&data_dir(), suffix).join(LOG_FILE);
    tracing::trace!(path = %path.display(), "Daemon log path");
    path
}

/// Load the configuration at `path` and compute the suffix that names its
/// instance. The CLI and the daemon both derive runtime paths from it.
pub fn load_instance(path: &Path) -> Result<(Config, String)> {
    let config = load_config(path)?;
    let (suffix, _) =
        DomainIsolationResolver::compute(&config.project_root, config.domain_suffix.as_deref())?;
    Ok((config, suffix))
}
