use crate::error::AppError;
use log::{error, info, warn};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Absent,
    Stale { pid: Option<u32> },
    Running { pid: u32 },
}

#[derive(Debug, Clone)]
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn inspect(&self) -> LockState {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return LockState::Absent,
            Err(_) => return LockState::Stale { pid: None },
        };
        match text.trim().parse::<u32>() {
            Ok(pid) if pid > 0 && process_is_alive(pid) => LockState::Running { pid },
            Ok(pid) if pid > 0 => LockState::Stale { pid: Some(pid) },
            _ => LockState::Stale { pid: None },
        }
    }

    pub fn ensure_single_instance(&self) -> Result<(), AppError> {
        match self.inspect() {
            LockState::Absent => Ok(()),
            LockState::Running { pid } => {
                error!("Another instance of the application is already running (pid {pid}). Exiting.");
                Err(AppError::AlreadyRunning {
                    pid,
                    lock_path: self.path.clone(),
                })
            }
            LockState::Stale { pid: Some(pid) } => {
                info!("Process {pid} is not running. Removing lock file.");
                self.remove_file();
                Ok(())
            }
            LockState::Stale { pid: None } => {
                warn!(
                    "Error reading lock file {}. Removing lock file.",
                    self.path.display()
                );
                self.remove_file();
                Ok(())
            }
        }
    }

    pub fn write_current(&self) -> io::Result<()> {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let pid = std::process::id();
        let tmp_path = parent.join(format!(".app.lock.tmp.{pid}"));
        fs::write(&tmp_path, pid.to_string())?;
        fs::rename(&tmp_path, &self.path)
    }

    pub fn release(&self) -> bool {
        let ours = fs::read_to_string(&self.path)
            .ok()
            .and_then(|text| text.trim().parse::<u32>().ok())
            == Some(std::process::id());
        if ours {
            self.remove_file();
        }
        ours
    }

    fn remove_file(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!("failed to remove lock file {}: {err}", self.path.display()),
        }
    }
}

pub struct LockGuard {
    lock: InstanceLock,
}

impl LockGuard {
    pub fn new(lock: InstanceLock) -> Self {
        Self { lock }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.lock.release() {
            info!("Removed lock file {}", self.lock.path().display());
        }
    }
}

#[cfg(unix)]
pub fn process_is_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 only runs the existence and permission checks.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    // EPERM: the process exists but belongs to someone else.
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(windows)]
pub fn process_is_alive(pid: u32) -> bool {
    use windows_sys::Win32::Foundation::{CloseHandle, STILL_ACTIVE};
    use windows_sys::Win32::System::Threading::{
        GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
    };

    if pid == 0 {
        return false;
    }
    // SAFETY: the handle is checked for null and closed before returning.
    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle.is_null() {
            return false;
        }
        let mut code: u32 = 0;
        let ok = GetExitCodeProcess(handle, &mut code);
        CloseHandle(handle);
        ok != 0 && code == STILL_ACTIVE as u32
    }
}

#[cfg(not(any(unix, windows)))]
pub fn process_is_alive(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::process::{Command, Stdio};
    use tempfile::tempdir;

    fn exited_pid() -> u32 {
        let mut child = Command::new(env::current_exe().unwrap())
            .arg("--list")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    #[test]
    fn absent_lock_allows_startup() {
        let dir = tempdir().unwrap();
        let lock = InstanceLock::new(dir.path().join("app.lock"));
        assert_eq!(lock.inspect(), LockState::Absent);
        lock.ensure_single_instance().unwrap();
    }

    #[test]
    fn live_pid_refuses_second_instance() {
        let dir = tempdir().unwrap();
        let lock = InstanceLock::new(dir.path().join("app.lock"));
        fs::write(lock.path(), std::process::id().to_string()).unwrap();

        match lock.ensure_single_instance() {
            Err(AppError::AlreadyRunning { pid, .. }) => assert_eq!(pid, std::process::id()),
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }
        assert!(lock.path().exists());
    }

    #[test]
    fn dead_pid_is_stale_and_removed() {
        let dir = tempdir().unwrap();
        let lock = InstanceLock::new(dir.path().join("app.lock"));
        let pid = exited_pid();
        fs::write(lock.path(), pid.to_string()).unwrap();

        assert_eq!(lock.inspect(), LockState::Stale { pid: Some(pid) });
        lock.ensure_single_instance().unwrap();
        assert!(!lock.path().exists());
    }

    #[test]
    fn garbage_lock_is_removed() {
        let dir = tempdir().unwrap();
        let lock = InstanceLock::new(dir.path().join("app.lock"));
        for content in ["not-a-pid", "", "0", "-12"] {
            fs::write(lock.path(), content).unwrap();
            assert_eq!(lock.inspect(), LockState::Stale { pid: None });
            lock.ensure_single_instance().unwrap();
            assert!(!lock.path().exists());
        }
    }

    #[test]
    fn write_current_records_plain_decimal_pid() {
        let dir = tempdir().unwrap();
        let lock = InstanceLock::new(dir.path().join("nested").join("app.lock"));
        lock.write_current().unwrap();
        assert_eq!(
            fs::read_to_string(lock.path()).unwrap(),
            std::process::id().to_string()
        );
        assert_eq!(
            lock.inspect(),
            LockState::Running {
                pid: std::process::id()
            }
        );
    }

    #[test]
    fn release_only_removes_own_lock() {
        let dir = tempdir().unwrap();
        let lock = InstanceLock::new(dir.path().join("app.lock"));
        fs::write(lock.path(), exited_pid().to_string()).unwrap();
        assert!(!lock.release());
        assert!(lock.path().exists());

        lock.write_current().unwrap();
        {
            let _guard = LockGuard::new(lock.clone());
        }
        assert!(!lock.path().exists());
    }

    #[test]
    fn pid_zero_is_never_alive() {
        assert!(!process_is_alive(0));
        assert!(process_is_alive(std::process::id()));
    }
}
