use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// PID file that is removed again when dropped
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write the current process id to `path`.
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&path, format!("{}\n", std::process::id()))?;
        debug!(path = %path.display(), "PID file written");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// PID recorded in `path` if that process is still alive.
    pub fn running_pid(path: &Path) -> Option<i32> {
        let pid: i32 = fs::read_to_string(path).ok()?.trim().parse().ok()?;
        if pid <= 0 || pid as u32 == std::process::id() {
            return None;
        }
        // SAFETY: signal 0 only checks for existence.
        let alive = unsafe { libc::kill(pid, 0) } == 0
            || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
        alive.then_some(pid)
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "PID file removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove PID file"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_written_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("netmand.pid");

        let pid_file = PidFile::create(&path).unwrap();
        let contents = fs::read_to_string(pid_file.path()).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());

        drop(pid_file);
        assert!(!path.exists());
    }

    #[test]
    fn test_running_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("netmand.pid");

        assert_eq!(PidFile::running_pid(&path), None);

        fs::write(&path, "garbage").unwrap();
        assert_eq!(PidFile::running_pid(&path), None);

        // our own pid never counts as another instance
        fs::write(&path, std::process::id().to_string()).unwrap();
        assert_eq!(PidFile::running_pid(&path), None);
    }
}
