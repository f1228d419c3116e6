//! Swap executor: replaces the installation once the host has exited.
//!
//! Runs as its own short-lived process, started by the host with three
//! positional arguments (artifact path, installation executable path, host
//! PID). It shares nothing with the host beyond those arguments, the
//! filesystem and its exit code.
//!
//! ```text
//! WaitingForExit → BackingUp → Installing → Relaunching → Complete
//!        │              │           │             │
//!     Aborted        Aborted        └─────────────┴──→ RolledBack
//! ```

pub mod backup;
pub mod install;
pub mod liveness;
pub mod relaunch;

pub use backup::{BackupStatus, InstallationBackup};
pub use liveness::{ExitWaiter, OsExitWaiter};
pub use relaunch::{ProcessRelauncher, Relauncher};

use crate::config::SwapConfig;
use crate::error::{Result, UpdateError};
use crate::handoff::HELPER_NAME;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Parsed command line of the swap executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapArgs {
    pub artifact: PathBuf,
    pub installation: PathBuf,
    pub host_pid: u32,
}

impl SwapArgs {
    /// Parse exactly three positional arguments (program name excluded).
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Config`] on a wrong argument count or a PID
    /// that is not a positive integer.
    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
        let [artifact, installation, pid] = <[OsString; 3]>::try_from(args).map_err(|args| {
            UpdateError::Config(format!(
                "expected 3 arguments (artifact, installation, host pid), got {}",
                args.len()
            ))
        })?;

        let host_pid = pid
            .to_str()
            .and_then(|s| s.trim().parse::<u32>().ok())
            .filter(|pid| *pid > 0)
            .ok_or_else(|| UpdateError::Config(format!("invalid host pid {pid:?}")))?;

        Ok(Self {
            artifact: PathBuf::from(artifact),
            installation: PathBuf::from(installation),
            host_pid,
        })
    }
}

/// Executor state machine phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapPhase {
    WaitingForExit,
    BackingUp,
    Installing,
    Relaunching,
    Complete,
    RolledBack,
}

impl std::fmt::Display for SwapPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::WaitingForExit => "waiting for exit",
            Self::BackingUp => "backing up",
            Self::Installing => "installing",
            Self::Relaunching => "relaunching",
            Self::Complete => "complete",
            Self::RolledBack => "rolled back",
        };
        f.write_str(name)
    }
}

/// Result of one swap run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwapOutcome {
    /// New version installed and started. The backup is kept for cleanup.
    Complete { backup: PathBuf },
    /// Install or relaunch failed; the backup was restored.
    RolledBack { backup: PathBuf, cause: UpdateError },
    /// Nothing was changed.
    Aborted(UpdateError),
    /// Restoring the backup failed. The backup is the only intact copy.
    RollbackFailed { backup: PathBuf, cause: UpdateError },
}

impl SwapOutcome {
    /// Process exit code for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Complete { .. } => 0,
            Self::RolledBack { .. } => 2,
            Self::Aborted(_) => 3,
            Self::RollbackFailed { .. } => 4,
        }
    }
}

/// Runs the swap with pluggable liveness and relaunch strategies.
pub struct SwapExecutor<W = OsExitWaiter, R = ProcessRelauncher> {
    config: SwapConfig,
    waiter: W,
    relauncher: R,
}

impl SwapExecutor {
    /// Executor using the operating system's process APIs.
    pub fn new(config: SwapConfig) -> Self {
        let relauncher = ProcessRelauncher::new(config.relaunch_grace());
        Self {
            config,
            waiter: OsExitWaiter,
            relauncher,
        }
    }
}

impl<W: ExitWaiter, R: Relauncher> SwapExecutor<W, R> {
    pub fn with_parts(config: SwapConfig, waiter: W, relauncher: R) -> Self {
        Self {
            config,
            waiter,
            relauncher,
        }
    }

    /// Run the whole swap.
    pub fn run(&self, args: &SwapArgs) -> SwapOutcome {
        tracing::info!(
            artifact = %args.artifact.display(),
            installation = %args.installation.display(),
            host_pid = args.host_pid,
            "swap executor started"
        );

        let install_dir = match validate(args) {
            Ok(dir) => dir,
            Err(e) => return aborted(e),
        };

        enter(SwapPhase::WaitingForExit);
        if let Err(e) = self.waiter.wait_for_exit(
            args.host_pid,
            self.config.exit_wait(),
            self.config.poll_interval(),
        ) {
            return aborted(e);
        }

        enter(SwapPhase::BackingUp);
        let backup = match InstallationBackup::create(&install_dir) {
            Ok(backup) => backup,
            Err(e) => return aborted(e),
        };

        enter(SwapPhase::Installing);
        if let Err(cause) = install::install(&args.artifact, &args.installation) {
            return self.roll_back(&backup, &install_dir, &args.installation, cause);
        }

        enter(SwapPhase::Relaunching);
        if let Err(cause) = self.relauncher.relaunch(&args.installation) {
            return self.roll_back(&backup, &install_dir, &args.installation, cause);
        }

        backup.set_status(BackupStatus::Complete);
        if let Err(e) = std::fs::remove_file(&args.artifact) {
            tracing::warn!(path = %args.artifact.display(), "cannot remove artifact: {e}");
        }
        enter(SwapPhase::Complete);
        tracing::info!(backup = %backup.backup_path().display(), "update installed");

        SwapOutcome::Complete {
            backup: backup.backup_path().to_path_buf(),
        }
    }

    fn roll_back(
        &self,
        backup: &InstallationBackup,
        install_dir: &Path,
        executable: &Path,
        cause: UpdateError,
    ) -> SwapOutcome {
        tracing::error!(kind = %cause.kind(), "swap failed, rolling back: {cause}");
        let backup_path = backup.backup_path().to_path_buf();

        if let Err(e) = backup.restore(install_dir) {
            backup.set_status(BackupStatus::RollbackFailed);
            tracing::error!(
                backup = %backup_path.display(),
                installation = %install_dir.display(),
                "rollback failed; restore manually from the backup: {e}"
            );
            return SwapOutcome::RollbackFailed {
                backup: backup_path,
                cause,
            };
        }

        backup.set_status(BackupStatus::RolledBack);
        enter(SwapPhase::RolledBack);

        if let Err(e) = self.relauncher.relaunch(executable) {
            tracing::error!("prior version restored but could not be started: {e}");
        }

        SwapOutcome::RolledBack {
            backup: backup_path,
            cause,
        }
    }
}

fn enter(phase: SwapPhase) {
    tracing::info!(%phase, "swap phase");
}

fn aborted(e: UpdateError) -> SwapOutcome {
    tracing::error!(kind = %e.kind(), "swap aborted before any change: {e}");
    SwapOutcome::Aborted(e)
}

/// Check the arguments and return the installation directory.
fn validate(args: &SwapArgs) -> Result<PathBuf> {
    if !args.artifact.is_file() {
        return Err(UpdateError::Config(format!(
            "artifact {} does not exist",
            args.artifact.display()
        )));
    }
    let install_dir = args
        .installation
        .parent()
        .filter(|dir| dir.is_dir())
        .ok_or_else(|| {
            UpdateError::Config(format!(
                "installation directory of {} does not exist",
                args.installation.display()
            ))
        })?;
    if args.artifact.starts_with(install_dir) {
        return Err(UpdateError::Config(format!(
            "artifact {} lies inside the installation directory",
            args.artifact.display()
        )));
    }
    Ok(install_dir.to_path_buf())
}

/// Returns `true` when this process was started under the helper name.
pub fn invoked_as_helper() -> bool {
    std::env::args_os()
        .next()
        .map(PathBuf::from)
        .and_then(|p| p.file_stem().map(|s| s.to_os_string()))
        .is_some_and(|stem| stem == HELPER_NAME)
}

/// Entry point shared by both binaries: parse `args` (program name
/// excluded), run the swap and return its outcome.
pub fn run_from_args<I, S>(args: I) -> SwapOutcome
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    let args = match SwapArgs::parse(args) {
        Ok(args) => args,
        Err(e) => return aborted(e),
    };
    let config = match crate::config::UpdaterConfig::load_or_default() {
        Ok(config) => config.swap,
        Err(e) => {
            tracing::warn!("ignoring unreadable config: {e}");
            SwapConfig::default()
        }
    };
    let outcome = SwapExecutor::new(config).run(&args);
    remove_staged_helper();
    outcome
}

/// Remove the temp directory the host staged this helper in (Unix only;
/// a running executable cannot be deleted on Windows).
fn remove_staged_helper() {
    #[cfg(unix)]
    if let Ok(exe) = std::env::current_exe()
        && exe.file_stem().is_some_and(|s| s == HELPER_NAME)
        && let Some(dir) = exe.parent()
        && dir
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("fnb-swap-"))
    {
        let _ = std::fs::remove_dir_all(dir);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::fs;

    struct FakeWaiter(Option<UpdateError>);

    impl ExitWaiter for FakeWaiter {
        fn wait_for_exit(&self, _: u32, _: std::time::Duration, _: std::time::Duration) -> Result<()> {
            match &self.0 {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            }
        }
    }

    #[derive(Default)]
    struct FakeRelauncher {
        results: RefCell<VecDeque<Result<()>>>,
        calls: RefCell<Vec<(PathBuf, Vec<u8>)>>,
    }

    impl FakeRelauncher {
        fn failing_first() -> Self {
            let fake = Self::default();
            fake.results
                .borrow_mut()
                .push_back(Err(UpdateError::RelaunchFailed("exited with 1".to_owned())));
            fake
        }
    }

    impl Relauncher for FakeRelauncher {
        fn relaunch(&self, executable: &Path) -> Result<()> {
            let contents = fs::read(executable).unwrap_or_default();
            self.calls.borrow_mut().push((executable.to_path_buf(), contents));
            self.results.borrow_mut().pop_front().unwrap_or(Ok(()))
        }
    }

    struct Fixture {
        _root: tempfile::TempDir,
        install_dir: PathBuf,
        args: SwapArgs,
    }

    fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let install_dir = root.path().join("fnb-app");
        fs::create_dir(&install_dir).unwrap();
        fs::write(install_dir.join("app"), b"version 1.0.0").unwrap();
        fs::write(install_dir.join("settings.ini"), b"branch=main").unwrap();

        let downloads = root.path().join("downloads");
        fs::create_dir(&downloads).unwrap();
        let artifact = downloads.join("app-1.2.0.exe");
        fs::write(&artifact, b"version 1.2.0").unwrap();

        let args = SwapArgs {
            artifact,
            installation: install_dir.join("app"),
            host_pid: 4242,
        };
        Fixture {
            _root: root,
            install_dir,
            args,
        }
    }

    fn executor(
        waiter: FakeWaiter,
        relauncher: FakeRelauncher,
    ) -> SwapExecutor<FakeWaiter, FakeRelauncher> {
        SwapExecutor::with_parts(SwapConfig::default(), waiter, relauncher)
    }

    #[test]
    fn parses_three_arguments() {
        let args = SwapArgs::parse(["/tmp/a.zip", "/opt/app/app", "1234"]).unwrap();
        assert_eq!(args.artifact, PathBuf::from("/tmp/a.zip"));
        assert_eq!(args.installation, PathBuf::from("/opt/app/app"));
        assert_eq!(args.host_pid, 1234);
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(SwapArgs::parse(["a", "b"]).is_err());
        assert!(SwapArgs::parse(["a", "b", "c", "d"]).is_err());
        assert!(SwapArgs::parse(["a", "b", "pid"]).is_err());
        assert!(SwapArgs::parse(["a", "b", "0"]).is_err());
        assert!(SwapArgs::parse(["a", "b", "-5"]).is_err());
    }

    #[test]
    fn exit_codes() {
        let e = UpdateError::Io("x".to_owned());
        let p = PathBuf::from("/b");
        assert_eq!(SwapOutcome::Complete { backup: p.clone() }.exit_code(), 0);
        assert_eq!(
            SwapOutcome::RolledBack { backup: p.clone(), cause: e.clone() }.exit_code(),
            2
        );
        assert_eq!(SwapOutcome::Aborted(e.clone()).exit_code(), 3);
        assert_eq!(SwapOutcome::RollbackFailed { backup: p, cause: e }.exit_code(), 4);
    }

    #[test]
    fn successful_swap_installs_relaunches_and_keeps_backup() {
        let f = fixture();
        let relauncher = FakeRelauncher::default();
        let exec = executor(FakeWaiter(None), relauncher);

        let outcome = exec.run(&f.args);
        let SwapOutcome::Complete {
            backup: backup_path,
        } = &outcome
        else {
            panic!("unexpected outcome: {outcome:?}");
        };

        assert_eq!(fs::read(&f.args.installation).unwrap(), b"version 1.2.0");
        assert!(!f.args.artifact.exists());
        assert_eq!(
            fs::read(backup_path.join("app")).unwrap(),
            b"version 1.0.0"
        );
        let calls = exec.relauncher.calls.borrow();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, b"version 1.2.0");

        let found = backup::discover(&f.install_dir).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].1, BackupStatus::Complete);
    }

    #[test]
    fn host_that_never_exits_aborts_without_changes() {
        let f = fixture();
        let before = backup::snapshot(&f.install_dir);
        let exec = executor(
            FakeWaiter(Some(UpdateError::HostDidNotExit("still running".to_owned()))),
            FakeRelauncher::default(),
        );

        let outcome = exec.run(&f.args);
        assert_eq!(outcome.exit_code(), 3);
        assert!(matches!(outcome, SwapOutcome::Aborted(UpdateError::HostDidNotExit(_))));
        assert_eq!(backup::snapshot(&f.install_dir), before);
        assert!(backup::discover(&f.install_dir).unwrap().is_empty());
        assert!(exec.relauncher.calls.borrow().is_empty());
        assert!(f.args.artifact.exists());
    }

    #[test]
    fn failed_relaunch_restores_and_starts_prior_version() {
        let f = fixture();
        let before = backup::snapshot(&f.install_dir);
        let exec = executor(FakeWaiter(None), FakeRelauncher::failing_first());

        let outcome = exec.run(&f.args);
        assert_eq!(outcome.exit_code(), 2);
        let SwapOutcome::RolledBack { cause, .. } = &outcome else {
            panic!("unexpected outcome: {outcome:?}");
        };
        assert_eq!(cause.kind(), crate::ErrorKind::RelaunchFailed);

        assert_eq!(backup::snapshot(&f.install_dir), before);
        let calls = exec.relauncher.calls.borrow();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1, b"version 1.2.0");
        assert_eq!(calls[1].1, b"version 1.0.0");
        // Artifact kept for diagnosis.
        assert!(f.args.artifact.exists());

        let found = backup::discover(&f.install_dir).unwrap();
        assert_eq!(found[0].1, BackupStatus::RolledBack);
    }

    #[test]
    fn missing_artifact_aborts() {
        let f = fixture();
        fs::remove_file(&f.args.artifact).unwrap();
        let exec = executor(FakeWaiter(None), FakeRelauncher::default());
        let outcome = exec.run(&f.args);
        assert!(matches!(outcome, SwapOutcome::Aborted(UpdateError::Config(_))));
    }

    #[test]
    fn artifact_inside_installation_is_rejected() {
        let f = fixture();
        let inside = f.install_dir.join("app-1.2.0.exe");
        fs::write(&inside, b"version 1.2.0").unwrap();
        let args = SwapArgs {
            artifact: inside,
            ..f.args.clone()
        };
        let exec = executor(FakeWaiter(None), FakeRelauncher::default());
        assert_eq!(exec.run(&args).exit_code(), 3);
    }

    #[test]
    fn phase_display() {
        assert_eq!(SwapPhase::WaitingForExit.to_string(), "waiting for exit");
        assert_eq!(SwapPhase::RolledBack.to_string(), "rolled back");
    }
}
