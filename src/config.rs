//! Parsed daemon configuration.
//!
//! The daemon consumes a [`Config`] value; loading from `.fwdkeeper.toml` is a
//! thin convenience on top of it.

use crate::daemon::backoff::RetryPolicy;
use crate::daemon::domain;
use crate::error::{DaemonError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = ".fwdkeeper.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub defaults: Defaults,
    /// Explicit hostname suffix; derived from the project path when absent.
    #[serde(default)]
    pub domain_suffix: Option<String>,
    #[serde(default)]
    pub profiles: Vec<Profile>,
    /// Directory the configuration was loaded from; the project identity.
    #[serde(skip)]
    pub project_root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Forwarding engine binary (name on PATH or absolute path)
    pub binary: String,
    /// Extra arguments passed before the daemon-managed ones
    pub args: Vec<String>,
    /// Local port the engine's control API listens on; derived from the
    /// domain suffix when unset
    pub api_port: Option<u16>,
    /// Launch through `sudo -n`
    pub use_sudo: bool,
    #[serde(with = "humantime_serde")]
    pub startup_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
    #[serde(with = "humantime_serde")]
    pub health_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: "kubefwd".to_string(),
            args: Vec::new(),
            api_port: None,
            use_sudo: true,
            startup_timeout: Duration::from_secs(15),
            shutdown_grace: Duration::from_secs(10),
            health_interval: Duration::from_millis(250),
        }
    }
}

impl EngineConfig {
    /// Control API port for the instance owning `suffix`.
    pub fn api_port_for(&self, suffix: &str) -> u16 {
        self.api_port.unwrap_or_else(|| domain::derive_api_port(suffix))
    }

    pub fn api_base_url(&self, suffix: &str) -> String {
        format!("http://127.0.0.1:{}", self.api_port_for(suffix))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Defaults {
    /// Per-namespace retry policy for profiles without an override
    pub retry: RetrySettings,
    /// Engine process restart policy
    pub process_retry: RetrySettings,
    /// Event stream resubscription policy
    pub stream_retry: RetrySettings,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// How long a connection (or the engine) must stay up before its retry
    /// state is cleared
    #[serde(with = "humantime_serde")]
    pub confirmation_window: Duration,
    /// Periodic reconciliation interval
    #[serde(with = "humantime_serde")]
    pub reconcile_interval: Duration,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            retry: RetrySettings::default(),
            process_retry: RetrySettings {
                max_attempts: 10,
                ..RetrySettings::default()
            },
            stream_retry: RetrySettings {
                initial_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(30),
                ..RetrySettings::default()
            },
            request_timeout: Duration::from_secs(5),
            confirmation_window: Duration::from_secs(30),
            reconcile_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub multiplier: f64,
    /// 0 = unbounded
    pub max_attempts: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: 0,
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.initial_delay, self.max_delay, self.multiplier)
            .max_attempts(self.max_attempts)
    }

    fn validate(&self, scope: &str) -> Result<()> {
        if !(self.multiplier >= 1.0 && self.multiplier.is_finite()) {
            return Err(DaemonError::ConfigValidation(format!(
                "{scope}: multiplier must be a finite number >= 1.0 (got {})",
                self.multiplier
            )));
        }
        if self.initial_delay > self.max_delay {
            return Err(DaemonError::ConfigValidation(format!(
                "{scope}: initial_delay {:?} exceeds max_delay {:?}",
                self.initial_delay, self.max_delay
            )));
        }
        Ok(())
    }
}

/// Partial retry settings layered over [`Defaults::retry`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryOverride {
    #[serde(with = "humantime_serde")]
    pub initial_delay: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub max_delay: Option<Duration>,
    pub multiplier: Option<f64>,
    pub max_attempts: Option<u32>,
}

impl RetryOverride {
    pub fn apply(&self, base: RetrySettings) -> RetrySettings {
        RetrySettings {
            initial_delay: self.initial_delay.unwrap_or(base.initial_delay),
            max_delay: self.max_delay.unwrap_or(base.max_delay),
            multiplier: self.multiplier.unwrap_or(base.multiplier),
            max_attempts: self.max_attempts.unwrap_or(base.max_attempts),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Profile {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub namespaces: Vec<String>,
    /// Label selectors forwarded to the engine (`app=web`, `tier!=batch`)
    #[serde(default)]
    pub selectors: Vec<String>,
    /// Explicit allow-list of service names; empty forwards everything
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub retry: Option<RetryOverride>,
}

fn default_enabled() -> bool {
    true
}

impl Profile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            namespaces: Vec::new(),
            selectors: Vec::new(),
            services: Vec::new(),
            retry: None,
        }
    }

    pub fn namespaces<I, S>(mut self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.namespaces = namespaces.into_iter().map(Into::into).collect();
        self
    }

    pub fn selectors<I, S>(mut self, selectors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selectors = selectors.into_iter().map(Into::into).collect();
        self
    }

    pub fn services<I, S>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.services = services.into_iter().map(Into::into).collect();
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn retry(mut self, retry: RetryOverride) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Effective retry settings for this profile's namespace operations.
    pub fn retry_settings(&self, defaults: &Defaults) -> RetrySettings {
        match &self.retry {
            Some(over) => over.apply(defaults.retry),
            None => defaults.retry,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            defaults: Defaults::default(),
            domain_suffix: None,
            profiles: Vec::new(),
            project_root: PathBuf::from("."),
        }
    }
}

impl Config {
    /// Read, parse and validate a configuration file. The file's directory
    /// becomes the project root used for domain suffix derivation.
    pub fn load(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "Loading configuration");
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&content)?;
        config.project_root = path
            .parent()
            .map(Path::to_path_buf)
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| PathBuf::from("."));
        tracing::debug!(
            profiles = config.profiles.len(),
            root = %config.project_root.display(),
            "Configuration loaded"
        );
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| DaemonError::ConfigValidation(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.defaults.retry.validate("defaults.retry")?;
        self.defaults.process_retry.validate("defaults.process_retry")?;
        self.defaults.stream_retry.validate("defaults.stream_retry")?;

        for (name, value) in [
            ("defaults.reconcile_interval", self.defaults.reconcile_interval),
            ("defaults.request_timeout", self.defaults.request_timeout),
            ("engine.health_interval", self.engine.health_interval),
        ] {
            if value.is_zero() {
                return Err(DaemonError::ConfigValidation(format!(
                    "{name} must be greater than zero"
                )));
            }
        }

        if let Some(suffix) = &self.domain_suffix {
            domain::validate_suffix(suffix)?;
        }

        let mut names = HashSet::new();
        let mut claimed: HashMap<&str, &str> = HashMap::new();

        for profile in &self.profiles {
            if profile.name.trim().is_empty() {
                return Err(DaemonError::ConfigValidation(
                    "profile name must not be empty".to_string(),
                ));
            }
            if !names.insert(profile.name.as_str()) {
                return Err(DaemonError::ConfigValidation(format!(
                    "duplicate profile '{}'",
                    profile.name
                )));
            }
            if profile.namespaces.is_empty() {
                return Err(DaemonError::ConfigValidation(format!(
                    "profile '{}' lists no namespaces",
                    profile.name
                )));
            }
            if profile.selectors.iter().any(|s| s.trim().is_empty()) {
                return Err(DaemonError::ConfigValidation(format!(
                    "profile '{}' has an empty label selector",
                    profile.name
                )));
            }
            profile
                .retry_settings(&self.defaults)
                .validate(&format!("profile '{}' retry", profile.name))?;

            for ns in &profile.namespaces {
                if let Some(owner) = claimed.insert(ns.as_str(), profile.name.as_str()) {
                    return Err(DaemonError::ConfigValidation(format!(
                        "namespace '{}' is claimed by both '{}' and '{}'",
                        ns, owner, profile.name
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn profile(&self, name: &str) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
domain_suffix = "shop.local"

[engine]
binary = "/usr/local/bin/kubefwd"
api_port = 19000
use_sudo = false
startup_timeout = "5s"

[defaults]
confirmation_window = "10s"

[defaults.retry]
initial_delay = "500ms"
max_delay = "20s"

[[profiles]]
name = "backend"
namespaces = ["api", "jobs"]
selectors = ["app=api"]

[[profiles]]
name = "frontend"
enabled = false
namespaces = ["web"]
services = ["storefront"]
retry = { max_attempts = 4, multiplier = 3.0 }
"#;

    #[test]
    fn parses_full_config() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.domain_suffix.as_deref(), Some("shop.local"));
        assert_eq!(config.engine.api_port, Some(19000));
        assert_eq!(config.engine.api_base_url("shop.local"), "http://127.0.0.1:19000");
        assert!(!config.engine.use_sudo);
        assert_eq!(config.engine.startup_timeout, Duration::from_secs(5));
        assert_eq!(config.defaults.confirmation_window, Duration::from_secs(10));
        assert_eq!(config.profiles.len(), 2);
        assert!(config.profiles[0].enabled);
        assert!(!config.profiles[1].enabled);
    }

    #[test]
    fn profile_override_layers_over_defaults() {
        let config = Config::parse(SAMPLE).unwrap();
        let frontend = config.profile("frontend").unwrap();
        let settings = frontend.retry_settings(&config.defaults);
        assert_eq!(settings.initial_delay, Duration::from_millis(500));
        assert_eq!(settings.max_delay, Duration::from_secs(20));
        assert_eq!(settings.multiplier, 3.0);
        assert_eq!(settings.policy().max_attempts.map(|n| n.get()), Some(4));

        let backend = config.profile("backend").unwrap();
        assert!(backend.retry_settings(&config.defaults).policy().max_attempts.is_none());
    }

    #[test]
    fn api_port_defaults_per_suffix() {
        let engine = EngineConfig::default();
        assert_eq!(engine.api_port, None);
        let a = engine.api_port_for("fk-0a0a0a0a");
        assert_eq!(a, engine.api_port_for("fk-0a0a0a0a"));
        assert_ne!(a, engine.api_port_for("fk-0b0b0b0b"));
    }

    #[test]
    fn rejects_namespace_claimed_twice() {
        let config = Config {
            profiles: vec![
                Profile::new("a").namespaces(["shared"]),
                Profile::new("b").namespaces(["shared"]),
            ],
            ..Config::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, DaemonError::ConfigValidation(_)));
        assert!(err.to_string().contains("shared"));
    }

    #[test]
    fn rejects_duplicate_and_empty_profiles() {
        let dup = Config {
            profiles: vec![
                Profile::new("a").namespaces(["x"]),
                Profile::new("a").namespaces(["y"]),
            ],
            ..Config::default()
        };
        assert!(dup.validate().is_err());

        let empty = Config {
            profiles: vec![Profile::new("a")],
            ..Config::default()
        };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn rejects_shrinking_multiplier() {
        let bad = r#"
[[profiles]]
name = "a"
namespaces = ["x"]
retry = { multiplier = 0.5 }
"#;
        assert!(matches!(
            Config::parse(bad),
            Err(DaemonError::ConfigValidation(_))
        ));
    }

    #[test]
    fn rejects_zero_intervals() {
        let bad = r#"
[engine]
health_interval = "0s"
"#;
        let err = Config::parse(bad).unwrap_err();
        assert!(err.to_string().contains("engine.health_interval"));

        let bad = "[defaults]\nreconcile_interval = \"0ms\"\n";
        assert!(Config::parse(bad).is_err());
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(Config::parse("bogus = 1").is_err());
    }

    #[test]
    fn load_sets_project_root() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, SAMPLE).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.project_root, dir.path());
    }
}
