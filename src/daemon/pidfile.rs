use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::PathBuf;

/// Whether a process with `pid` is alive.
#[cfg(unix)]
pub fn is_process_running(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    // Signal 0 performs the permission/existence check without delivering anything.
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn is_process_running(_pid: u32) -> bool {
    true
}

/// A file holding the PID of the process that owns some resource.
///
/// The file is created exclusively, so two processes racing for the same path
/// cannot both succeed. It is removed on drop once written.
pub struct PidFile {
    path: PathBuf,
    owned: bool,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            owned: false,
        }
    }

    /// PID recorded in the file, if the file exists and parses.
    pub fn read_pid(&self) -> std::io::Result<Option<u32>> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(content.trim().parse().ok()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// PID of a live owner other than this process.
    pub fn is_running(&self) -> std::io::Result<Option<u32>> {
        let own = std::process::id();
        Ok(self
            .read_pid()?
            .filter(|pid| *pid != own && is_process_running(*pid)))
    }

    /// Write our PID, replacing a stale file left by a dead process.
    ///
    /// Returns the PID of the live owner instead when one exists.
    pub fn acquire(&mut self) -> std::io::Result<Result<(), u32>> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        for _ in 0..2 {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)
            {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id())?;
                    file.sync_all()?;
                    self.owned = true;
                    return Ok(Ok(()));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if let Some(pid) = self.is_running()? {
                        return Ok(Err(pid));
                    }
                    tracing::debug!(path = %self.path.display(), "Removing stale PID file");
                    match std::fs::remove_file(&self.path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }

        // Lost a race with another process twice in a row.
        match self.read_pid()? {
            Some(pid) => Ok(Err(pid)),
            None => Err(std::io::Error::new(
                ErrorKind::WouldBlock,
                format!("could not claim {}", self.path.display()),
            )),
        }
    }

    pub fn release(&mut self) {
        if self.owned {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != ErrorKind::NotFound {
                    tracing::warn!(path = %self.path.display(), "Failed to remove PID file: {}", e);
                }
            }
            self.owned = false;
        }
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_and_drop_removes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        {
            let mut pid_file = PidFile::new(&path);
            assert_eq!(pid_file.acquire().unwrap(), Ok(()));
            assert_eq!(pid_file.read_pid().unwrap(), Some(std::process::id()));
        }
        assert!(!path.exists());
    }

    #[test]
    fn stale_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.pid");
        // PIDs are capped well below this on every supported platform.
        std::fs::write(&path, "999999999\n").unwrap();

        let mut pid_file = PidFile::new(&path);
        assert_eq!(pid_file.acquire().unwrap(), Ok(()));
        assert_eq!(pid_file.read_pid().unwrap(), Some(std::process::id()));
    }

    #[cfg(unix)]
    #[test]
    fn live_owner_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taken.pid");
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        std::fs::write(&path, format!("{}\n", child.id())).unwrap();

        let mut pid_file = PidFile::new(&path);
        assert_eq!(pid_file.acquire().unwrap(), Err(child.id()));
        drop(pid_file);
        assert!(path.exists(), "a file we never owned must survive drop");

        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn own_process_is_running() {
        assert!(is_process_running(std::process::id()));
    }
}
