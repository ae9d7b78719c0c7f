//! Process handles for supervised client processes.
//!
//! # Platform Behavior
//! - **Unix**: `waitpid(WNOHANG)` for our own children (which also reaps
//!   them), `kill(pid, 0)` for anything else
//! - **Windows**: a process handle opened once and polled with a zero-timeout
//!   `WaitForSingleObject`

#[allow(unused_imports)]
use tracing::{debug, warn};

/// A process the watchdog can poll for exit.
pub trait ProcessHandle: Send {
    fn pid(&self) -> u32;

    /// Whether the process has exited. Must not block.
    fn has_exited(&mut self) -> bool;
}

/// Whether `pid` can name a single process.
///
/// 0 and anything above `i32::MAX` turn into process-group or "any child"
/// selectors once passed to `kill`/`waitpid`.
pub fn is_valid_pid(pid: u32) -> bool {
    pid != 0 && pid <= i32::MAX as u32
}

/// Check if a process with the given PID is alive.
pub fn is_process_alive(pid: u32) -> bool {
    if !is_valid_pid(pid) {
        return false;
    }

    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        // Signal 0 only checks that the process exists. EPERM means it exists
        // but belongs to someone else.
        match kill(Pid::from_raw(pid as i32), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    #[cfg(windows)]
    {
        let mut handle = OsProcessHandle::open(pid);
        !handle.has_exited()
    }

    #[cfg(not(any(unix, windows)))]
    {
        warn!("Process alive check not implemented for this platform");
        true
    }
}

/// Handle on a real OS process.
#[derive(Debug)]
pub struct OsProcessHandle {
    pid: u32,
    exited: bool,
    #[cfg(windows)]
    handle: usize,
}

impl OsProcessHandle {
    /// Open a handle on `pid`. A process that is already gone yields a
    /// handle that reports it as exited.
    pub fn open(pid: u32) -> Self {
        if !is_valid_pid(pid) {
            warn!("Refusing to supervise invalid pid {}", pid);
            return Self {
                pid,
                exited: true,
                #[cfg(windows)]
                handle: 0,
            };
        }

        #[cfg(windows)]
        {
            use windows_sys::Win32::System::Threading::{
                OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_SYNCHRONIZE,
            };

            // SAFETY: OpenProcess has no preconditions; a null result is
            // checked below.
            #[allow(unsafe_code)]
            let handle = unsafe {
                OpenProcess(PROCESS_SYNCHRONIZE | PROCESS_QUERY_LIMITED_INFORMATION, 0, pid)
            };
            if handle.is_null() {
                debug!("Could not open process {}, treating it as exited", pid);
            }
            Self {
                pid,
                exited: handle.is_null(),
                handle: handle as usize,
            }
        }

        #[cfg(not(windows))]
        {
            Self { pid, exited: false }
        }
    }
}

impl ProcessHandle for OsProcessHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn has_exited(&mut self) -> bool {
        if self.exited {
            return true;
        }

        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
            use nix::unistd::Pid;

            self.exited = match waitpid(Pid::from_raw(self.pid as i32), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => false,
                Ok(status) => {
                    debug!("Process {} reaped: {:?}", self.pid, status);
                    true
                }
                // Not our child.
                Err(Errno::ECHILD) => !is_process_alive(self.pid),
                Err(e) => {
                    warn!("waitpid({}) failed: {}", self.pid, e);
                    !is_process_alive(self.pid)
                }
            };
        }

        #[cfg(windows)]
        {
            use windows_sys::Win32::Foundation::{HANDLE, WAIT_OBJECT_0};
            use windows_sys::Win32::System::Threading::WaitForSingleObject;

            // SAFETY: the handle was returned non-null by OpenProcess and is
            // only closed in Drop.
            #[allow(unsafe_code)]
            let status = unsafe { WaitForSingleObject(self.handle as HANDLE, 0) };
            self.exited = status == WAIT_OBJECT_0;
        }

        #[cfg(not(any(unix, windows)))]
        {
            self.exited = !is_process_alive(self.pid);
        }

        self.exited
    }
}

#[cfg(windows)]
impl Drop for OsProcessHandle {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};

        if self.handle != 0 {
            // SAFETY: the handle is owned by this value and closed once.
            unsafe {
                CloseHandle(self.handle as HANDLE);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_process_alive(std::process::id()));

        let mut handle = OsProcessHandle::open(std::process::id());
        assert_eq!(handle.pid(), std::process::id());
        assert!(!handle.has_exited());
    }

    #[test]
    fn test_nonexistent_process_has_exited() {
        // Far above any default pid_max.
        let mut handle = OsProcessHandle::open(999_999_999);
        assert!(handle.has_exited());
    }

    #[test]
    fn test_invalid_pids_are_rejected() {
        assert!(!is_valid_pid(0));
        assert!(!is_valid_pid(u32::MAX));
        assert!(!is_valid_pid(i32::MAX as u32 + 1));
        assert!(is_valid_pid(1));
        assert!(!is_process_alive(0));
    }

    #[cfg(unix)]
    #[test]
    fn test_invalid_pid_handle_leaves_other_children_alone() {
        let mut child = std::process::Command::new("true").spawn().unwrap();

        for pid in [0, u32::MAX] {
            let mut handle = OsProcessHandle::open(pid);
            assert!(handle.has_exited());
        }

        // The real child is still ours to reap.
        let status = child.wait().unwrap();
        assert!(status.success());
    }

    #[cfg(unix)]
    #[test]
    fn test_exited_child_is_reaped() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let mut handle = OsProcessHandle::open(child.id());

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !handle.has_exited() {
            assert!(std::time::Instant::now() < deadline, "child never exited");
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(handle.has_exited());
        drop(child);
    }
}
