//! Per-instance hostname suffix.
//!
//! Every daemon instance forwards services under its own suffix so that two
//! projects forwarding `api.default` do not collide. The suffix is either
//! supplied explicitly or derived from a hash of the project path, then claimed
//! in a registry shared by all instances on the host. A claimed suffix held by
//! another live instance is fatal; no alternate value is ever chosen.

use super::pidfile::PidFile;
use crate::error::{DaemonError, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

const AUTO_PREFIX: &str = "fk-";
const AUTO_HASH_LEN: usize = 8;
const MAX_SUFFIX_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;
const API_PORT_BASE: u16 = 18_765;
const API_PORT_SPAN: u16 = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuffixSource {
    /// Derived from the project path
    Auto,
    /// Supplied in configuration
    Override,
}

impl SuffixSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuffixSource::Auto => "auto",
            SuffixSource::Override => "override",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollisionCheck {
    /// No other live instance holds the suffix
    Clear,
    /// A previous owner had died; its claim was taken over
    ReclaimedStale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainAssignment {
    pub suffix: String,
    pub source: SuffixSource,
    pub collision: CollisionCheck,
}

/// Check a suffix is usable as a run of DNS labels.
pub fn validate_suffix(suffix: &str) -> Result<()> {
    let invalid = |why: &str| {
        Err(DaemonError::ConfigValidation(format!(
            "domain suffix '{suffix}' {why}"
        )))
    };

    if suffix.is_empty() {
        return invalid("is empty");
    }
    if suffix.len() > MAX_SUFFIX_LEN {
        return invalid("is too long");
    }
    for label in suffix.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return invalid("has an empty or oversized label");
        }
        if !label
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        {
            return invalid("may only contain lowercase letters, digits, '-' and '.'");
        }
        if label.starts_with('-') || label.ends_with('-') {
            return invalid("has a label starting or ending with '-'");
        }
    }
    Ok(())
}

/// Stable suffix for a project path: `fk-` followed by eight hex digits of the
/// SHA-256 of the canonical path.
pub fn derive_suffix(project_root: &Path) -> String {
    let canonical = project_root
        .canonicalize()
        .unwrap_or_else(|_| project_root.to_path_buf());
    let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
    let hex = hex::encode(digest);
    format!("{AUTO_PREFIX}{}", &hex[..AUTO_HASH_LEN])
}

/// Default control API port for an instance, spread over a fixed range by a
/// hash of its suffix.
pub fn derive_api_port(suffix: &str) -> u16 {
    let digest = Sha256::digest(suffix.as_bytes());
    API_PORT_BASE + u16::from_be_bytes([digest[0], digest[1]]) % API_PORT_SPAN
}

/// Registry of live instances keyed by suffix: one PID file per suffix.
pub struct InstanceRegistry {
    dir: PathBuf,
}

/// Held for the daemon's lifetime; dropping it releases the suffix.
pub struct InstanceLease {
    suffix: String,
    _pid_file: PidFile,
}

impl InstanceLease {
    pub fn suffix(&self) -> &str {
        &self.suffix
    }
}

impl InstanceRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!("{suffix}.pid"))
    }

    pub fn claim(&self, suffix: &str) -> Result<(InstanceLease, CollisionCheck)> {
        let path = self.path_for(suffix);
        let stale = path.exists();
        let mut pid_file = PidFile::new(path);
        match pid_file.acquire()? {
            Ok(()) => {
                let check = if stale {
                    CollisionCheck::ReclaimedStale
                } else {
                    CollisionCheck::Clear
                };
                Ok((
                    InstanceLease {
                        suffix: suffix.to_string(),
                        _pid_file: pid_file,
                    },
                    check,
                ))
            }
            Err(pid) => Err(DaemonError::DomainConflict {
                suffix: suffix.to_string(),
                pid,
            }),
        }
    }
}

pub struct DomainIsolationResolver {
    registry: InstanceRegistry,
}

impl DomainIsolationResolver {
    pub fn new(registry: InstanceRegistry) -> Self {
        Self { registry }
    }

    /// Compute the suffix without claiming it.
    pub fn compute(project_root: &Path, explicit: Option<&str>) -> Result<(String, SuffixSource)> {
        match explicit {
            Some(suffix) => {
                validate_suffix(suffix)?;
                Ok((suffix.to_string(), SuffixSource::Override))
            }
            None => Ok((derive_suffix(project_root), SuffixSource::Auto)),
        }
    }

    /// Compute and claim the suffix for this instance.
    pub fn resolve(
        &self,
        project_root: &Path,
        explicit: Option<&str>,
    ) -> Result<(DomainAssignment, InstanceLease)> {
        let (suffix, source) = Self::compute(project_root, explicit)?;
        let (lease, collision) = self.registry.claim(&suffix)?;
        tracing::info!(
            suffix = %suffix,
            source = source.as_str(),
            "Domain suffix claimed"
        );
        Ok((
            DomainAssignment {
                suffix,
                source,
                collision,
            },
            lease,
        ))
    }

    /// Re-validate on reload: the suffix is fixed for the daemon's lifetime,
    /// so a configuration that would produce a different one is rejected.
    pub fn revalidate(
        assignment: &DomainAssignment,
        project_root: &Path,
        explicit: Option<&str>,
    ) -> Result<()> {
        let (suffix, _) = Self::compute(project_root, explicit)?;
        if suffix != assignment.suffix {
            return Err(DaemonError::ConfigValidation(format!(
                "domain suffix cannot change while running ('{}' -> '{}'); restart the daemon",
                assignment.suffix, suffix
            )));
        }
        Ok(())
    }
}
