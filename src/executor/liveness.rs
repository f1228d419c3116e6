//! Waiting for the host process to exit.
//!
//! Linux uses a pidfd so the wait is event-driven. Other Unix systems poll
//! `kill(pid, 0)`; Windows waits on a process handle. In every case a PID
//! that cannot be found counts as already exited.

use crate::error::{Result, UpdateError};
use std::time::{Duration, Instant};

/// Blocks until a process has exited.
pub trait ExitWaiter {
    /// Wait for `pid` to exit, up to `timeout`.
    ///
    /// `poll_interval` is used by implementations that have to poll.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::HostDidNotExit`] if the process is still alive
    /// after `timeout`.
    fn wait_for_exit(&self, pid: u32, timeout: Duration, poll_interval: Duration) -> Result<()>;
}

/// [`ExitWaiter`] backed by the operating system's process APIs.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsExitWaiter;

impl ExitWaiter for OsExitWaiter {
    fn wait_for_exit(&self, pid: u32, timeout: Duration, poll_interval: Duration) -> Result<()> {
        tracing::info!(pid, ?timeout, "waiting for host process to exit");
        wait_os(pid, timeout, poll_interval)
    }
}

#[cfg(unix)]
fn wait_os(pid: u32, timeout: Duration, poll_interval: Duration) -> Result<()> {
    #[cfg(target_os = "linux")]
    if let Some(result) = wait_pidfd(pid, timeout) {
        return result;
    }
    poll_until_gone(pid, timeout, poll_interval, process_alive)
}

#[cfg(windows)]
fn wait_os(pid: u32, timeout: Duration, _poll_interval: Duration) -> Result<()> {
    wait_handle(pid, timeout)
}

fn did_not_exit(pid: u32, timeout: Duration) -> UpdateError {
    UpdateError::HostDidNotExit(format!(
        "process {pid} still running after {}s",
        timeout.as_secs()
    ))
}

/// Poll `alive` until it reports the process gone or the deadline passes.
#[cfg_attr(windows, allow(dead_code))]
pub(crate) fn poll_until_gone(
    pid: u32,
    timeout: Duration,
    poll_interval: Duration,
    alive: impl Fn(u32) -> bool,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if !alive(pid) {
            tracing::debug!(pid, "host process gone");
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(did_not_exit(pid, timeout));
        }
        std::thread::sleep(poll_interval.min(deadline - now));
    }
}

/// `kill(pid, 0)`: ESRCH means gone, EPERM means alive but not ours.
#[cfg(unix)]
pub(crate) fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs permission and existence checks only.
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Returns `None` when pidfds are unavailable and the caller should poll.
#[cfg(target_os = "linux")]
fn wait_pidfd(pid: u32, timeout: Duration) -> Option<Result<()>> {
    let raw_pid = libc::pid_t::try_from(pid).ok()?;

    // SAFETY: pidfd_open takes a pid and flags and returns a new fd or -1.
    let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, raw_pid, 0) };
    if fd < 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            tracing::debug!(pid, "host process already gone");
            return Some(Ok(()));
        }
        tracing::debug!(pid, "pidfd_open unavailable ({err}), falling back to polling");
        return None;
    }
    let fd = libc::c_int::try_from(fd).ok()?;

    let deadline = Instant::now() + timeout;
    let outcome = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let millis = libc::c_int::try_from(remaining.as_millis()).unwrap_or(libc::c_int::MAX);
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: pfd is a valid pollfd for the duration of the call.
        let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
        if rc > 0 {
            tracing::debug!(pid, "host process exited");
            break Some(Ok(()));
        }
        if rc == 0 {
            break Some(Err(did_not_exit(pid, timeout)));
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            tracing::debug!(pid, "poll on pidfd failed ({err}), falling back to polling");
            break None;
        }
    };

    // SAFETY: fd was returned by pidfd_open above and is closed once.
    unsafe { libc::close(fd) };
    outcome
}

#[cfg(windows)]
fn wait_handle(pid: u32, timeout: Duration) -> Result<()> {
    use windows::Win32::Foundation::{CloseHandle, WAIT_OBJECT_0, WAIT_TIMEOUT};
    use windows::Win32::System::Threading::{
        OpenProcess, PROCESS_SYNCHRONIZE, WaitForSingleObject,
    };

    // SAFETY: OpenProcess has no preconditions; failure means no such process
    // (or one we may not wait on, which cannot be the host that launched us).
    let handle = match unsafe { OpenProcess(PROCESS_SYNCHRONIZE, false, pid) } {
        Ok(handle) => handle,
        Err(e) => {
            tracing::debug!(pid, "cannot open host process ({e}); treating as exited");
            return Ok(());
        }
    };

    let millis = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX - 1);
    // SAFETY: handle is valid until CloseHandle below.
    let rc = unsafe { WaitForSingleObject(handle, millis) };
    // SAFETY: handle was opened above and is closed once.
    let _ = unsafe { CloseHandle(handle) };

    if rc == WAIT_OBJECT_0 {
        Ok(())
    } else if rc == WAIT_TIMEOUT {
        Err(did_not_exit(pid, timeout))
    } else {
        Err(UpdateError::HostDidNotExit(format!(
            "waiting on process {pid} failed: {:?}",
            rc
        )))
    }
}
