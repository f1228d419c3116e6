//! Starting the application after a swap.

use crate::error::{Result, UpdateError};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Starts the installed application.
pub trait Relauncher {
    /// Start `executable` as a fresh detached process.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::RelaunchFailed`] if the process cannot be
    /// started or exits unsuccessfully within the grace period.
    fn relaunch(&self, executable: &Path) -> Result<()>;
}

/// [`Relauncher`] that spawns a detached OS process and watches it briefly.
#[derive(Debug, Clone)]
pub struct ProcessRelauncher {
    grace: Duration,
}

impl ProcessRelauncher {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }
}

impl Relauncher for ProcessRelauncher {
    fn relaunch(&self, executable: &Path) -> Result<()> {
        let mut command = Command::new(executable);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(dir) = executable.parent() {
            command.current_dir(dir);
        }
        crate::handoff::detach(&mut command);

        let mut child = command.spawn().map_err(|e| {
            UpdateError::RelaunchFailed(format!("cannot start {}: {e}", executable.display()))
        })?;
        let pid = child.id();
        tracing::info!(pid, executable = %executable.display(), "application started");

        // A process that dies right away with a failure status counts as a
        // failed launch. One still running after the grace period is left alone.
        let deadline = Instant::now() + self.grace;
        loop {
            match child.try_wait() {
                Ok(Some(status)) if status.success() => {
                    tracing::debug!(pid, "application exited cleanly during grace period");
                    return Ok(());
                }
                Ok(Some(status)) => {
                    return Err(UpdateError::RelaunchFailed(format!(
                        "{} exited with {status} right after start",
                        executable.display()
                    )));
                }
                Ok(None) if Instant::now() >= deadline => return Ok(()),
                Ok(None) => std::thread::sleep(Duration::from_millis(50)),
                Err(e) => {
                    tracing::debug!(pid, "cannot poll relaunched process: {e}");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn script(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        crate::handoff::set_executable(&path).unwrap();
        path
    }

    #[test]
    fn long_running_process_counts_as_started() {
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "app", "sleep 2");
        ProcessRelauncher::new(Duration::from_millis(200))
            .relaunch(&exe)
            .unwrap();
    }

    #[test]
    fn immediate_failure_is_relaunch_failed() {
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "app", "exit 3");
        let err = ProcessRelauncher::new(Duration::from_secs(5))
            .relaunch(&exe)
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::RelaunchFailed);
    }

    #[test]
    fn missing_executable_is_relaunch_failed() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProcessRelauncher::new(Duration::from_millis(10))
            .relaunch(&dir.path().join("absent"))
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::RelaunchFailed);
    }

    #[test]
    fn non_executable_file_is_relaunch_failed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app");
        std::fs::write(&path, b"\x00\x01garbage").unwrap();
        let err = ProcessRelauncher::new(Duration::from_millis(10))
            .relaunch(&path)
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::RelaunchFailed);
    }
}
