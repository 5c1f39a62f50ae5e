//! One-shot startup check that the engine can actually be launched.
//!
//! Failure is fatal: the daemon refuses to start rather than entering a
//! restart loop that could never succeed.

use crate::config::EngineConfig;
use crate::error::{DaemonError, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info};

/// Locate `binary`: a path containing a separator must exist as given,
/// a bare name is searched for on `PATH`.
pub fn resolve_binary(binary: &str) -> Result<PathBuf> {
    let as_path = Path::new(binary);
    if as_path.components().count() > 1 || as_path.is_absolute() {
        return if is_executable(as_path) {
            Ok(as_path.to_path_buf())
        } else {
            Err(DaemonError::PrivilegeCheck(format!(
                "engine binary '{binary}' does not exist or is not executable"
            )))
        };
    }

    let path = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|candidate| is_executable(candidate))
        .ok_or_else(|| {
            DaemonError::PrivilegeCheck(format!("engine binary '{binary}' not found on PATH"))
        })
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

const SUDO: &str = "sudo";

/// `sudo -n -l <binary>`: lists the command only when the caller may run it
/// without a password prompt.
fn sudo_check_command(sudo: &str, binary: &Path) -> Command {
    let mut cmd = Command::new(sudo);
    cmd.args(["-n", "-l"])
        .arg(binary)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    cmd
}

fn check_sudo(sudo: &str, binary: &Path) -> Result<()> {
    let status = sudo_check_command(sudo, binary)
        .status()
        .map_err(|e| DaemonError::PrivilegeCheck(format!("failed to run sudo: {e}")))?;

    if !status.success() {
        return Err(DaemonError::PrivilegeCheck(format!(
            "non-interactive sudo is not permitted for {}; configure NOPASSWD for the engine \
             binary or set engine.use_sudo = false",
            binary.display()
        )));
    }
    Ok(())
}

/// Verify the engine can be launched with the configured privileges.
pub fn verify(engine: &EngineConfig) -> Result<PathBuf> {
    let binary = resolve_binary(&engine.binary)?;
    debug!(binary = %binary.display(), "Engine binary resolved");
    if engine.use_sudo {
        check_sudo(SUDO, &binary)?;
        info!(binary = %binary.display(), "Non-interactive privilege escalation available");
    }
    Ok(binary)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn bare_name_is_found_on_path() {
        let found = resolve_binary("sh").unwrap();
        assert!(found.is_absolute());
    }

    #[test]
    fn missing_binary_is_a_privilege_failure() {
        let err = resolve_binary("definitely-not-a-real-engine-binary").unwrap_err();
        assert!(matches!(err, DaemonError::PrivilegeCheck(_)));
        assert!(!err.is_retryable());

        let err = resolve_binary("/nonexistent/kubefwd").unwrap_err();
        assert!(matches!(err, DaemonError::PrivilegeCheck(_)));
    }

    #[test]
    fn non_executable_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine");
        std::fs::write(&path, "#!/bin/sh\n").unwrap();
        assert!(resolve_binary(path.to_str().unwrap()).is_err());

        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(resolve_binary(path.to_str().unwrap()).unwrap(), path);
    }

    #[test]
    fn verify_without_sudo_only_resolves() {
        let engine = EngineConfig {
            binary: "sh".into(),
            use_sudo: false,
            ..EngineConfig::default()
        };
        verify(&engine).unwrap();
    }

    #[test]
    fn sudo_is_asked_about_the_engine_binary() {
        let cmd = sudo_check_command(SUDO, Path::new("/opt/kubefwd"));
        assert_eq!(cmd.get_program(), "sudo");
        let args: Vec<_> = cmd.get_args().collect();
        assert_eq!(args, ["-n", "-l", "/opt/kubefwd"]);
    }

    #[test]
    fn sudo_rule_scoped_to_engine_passes() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        // Stand-in for a sudoers entry that only admits /opt/kubefwd.
        let sudo = dir.path().join("sudo");
        std::fs::write(
            &sudo,
            "#!/bin/sh\n[ \"$1\" = -n ] && [ \"$2\" = -l ] && [ \"$3\" = /opt/kubefwd ]\n",
        )
        .unwrap();
        std::fs::set_permissions(&sudo, std::fs::Permissions::from_mode(0o755)).unwrap();
        let sudo = sudo.to_str().unwrap();

        check_sudo(sudo, Path::new("/opt/kubefwd")).unwrap();
        let err = check_sudo(sudo, Path::new("/usr/bin/other")).unwrap_err();
        assert!(matches!(err, DaemonError::PrivilegeCheck(_)));
        assert!(err.to_string().contains("/usr/bin/other"));
    }
}
