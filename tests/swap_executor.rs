//! Swap executor tests: install, rollback and the standalone binary.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use fnb_updater::config::SwapConfig;
use fnb_updater::executor::backup::{self, BackupStatus};
use fnb_updater::executor::{ExitWaiter, OsExitWaiter, Relauncher};
use fnb_updater::{ErrorKind, SwapArgs, SwapExecutor, SwapOutcome};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct AlreadyExited;

impl ExitWaiter for AlreadyExited {
    fn wait_for_exit(&self, _: u32, _: Duration, _: Duration) -> fnb_updater::Result<()> {
        Ok(())
    }
}

/// Records the executable contents at each relaunch.
#[derive(Default, Clone)]
struct RecordingRelauncher {
    launched: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl RecordingRelauncher {
    fn launched(&self) -> Vec<Vec<u8>> {
        self.launched.lock().unwrap().clone()
    }
}

impl Relauncher for RecordingRelauncher {
    fn relaunch(&self, executable: &Path) -> fnb_updater::Result<()> {
        self.launched
            .lock()
            .unwrap()
            .push(std::fs::read(executable).unwrap_or_default());
        Ok(())
    }
}

fn snapshot(dir: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<PathBuf, Vec<u8>>) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(root, &path, out);
            } else {
                let rel = path.strip_prefix(root).unwrap().to_path_buf();
                out.insert(rel, std::fs::read(&path).unwrap());
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(dir, dir, &mut out);
    out
}

fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
    let file = std::fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored);
    for (name, data) in entries {
        zip.start_file(*name, options).unwrap();
        zip.write_all(data).unwrap();
    }
    zip.finish().unwrap();
}

/// Installation with an executable, a nested data file and a config file.
fn installation(root: &Path) -> PathBuf {
    let dir = root.join("fnb-app");
    std::fs::create_dir_all(dir.join("lib")).unwrap();
    std::fs::write(dir.join("fnb-app"), b"fnb-app 1.0.0").unwrap();
    std::fs::write(dir.join("lib").join("second.dat"), b"old second").unwrap();
    std::fs::write(dir.join("branches.toml"), b"[main]\nseats = 40").unwrap();
    dir
}

// ---------------------------------------------------------------------------
// Rollback
// ---------------------------------------------------------------------------

#[test]
fn failure_mid_extraction_restores_installation_byte_for_byte() {
    let root = tempfile::tempdir().unwrap();
    let install_dir = installation(root.path());
    let before = snapshot(&install_dir);

    // The first entry installs fine; the second fails its CRC check after the
    // executable has already been replaced.
    let downloads = root.path().join("downloads");
    std::fs::create_dir(&downloads).unwrap();
    let artifact = downloads.join("app-1.2.0.zip");
    write_zip(
        &artifact,
        &[
            ("fnb-app", b"fnb-app 1.2.0"),
            ("lib/second.dat", b"SECOND-ENTRY-PAYLOAD"),
        ],
    );
    let mut bytes = std::fs::read(&artifact).unwrap();
    let pos = bytes
        .windows(b"SECOND-ENTRY-PAYLOAD".len())
        .position(|w| w == b"SECOND-ENTRY-PAYLOAD")
        .unwrap();
    bytes[pos + 3] ^= 0x20;
    std::fs::write(&artifact, bytes).unwrap();

    let relauncher = RecordingRelauncher::default();
    let executor =
        SwapExecutor::with_parts(SwapConfig::default(), AlreadyExited, relauncher.clone());
    let args = SwapArgs {
        artifact: artifact.clone(),
        installation: install_dir.join("fnb-app"),
        host_pid: 31337,
    };

    let outcome = executor.run(&args);

    let SwapOutcome::RolledBack {
        backup: backup_path,
        cause,
    } = &outcome
    else {
        panic!("unexpected outcome: {outcome:?}");
    };
    assert_eq!(cause.kind(), ErrorKind::InstallFailed);
    assert_eq!(outcome.exit_code(), 2);

    // Byte-identical to the pre-update state, including no leftover staging files.
    assert_eq!(snapshot(&install_dir), before);

    let backups = backup::discover(&install_dir).unwrap();
    assert_eq!(backups.len(), 1);
    assert_eq!(backups[0].0.backup_path(), backup_path.as_path());
    assert_eq!(backups[0].1, BackupStatus::RolledBack);

    // Only the prior version was started; the artifact is kept.
    assert_eq!(relauncher.launched(), vec![b"fnb-app 1.0.0".to_vec()]);
    assert!(artifact.exists());
}

#[test]
fn unreadable_archive_rolls_back_and_relaunches_prior_version() {
    let root = tempfile::tempdir().unwrap();
    let install_dir = installation(root.path());
    let before = snapshot(&install_dir);
    let artifact = root.path().join("broken.zip");
    std::fs::write(&artifact, b"PK not really a zip").unwrap();

    let relauncher = RecordingRelauncher::default();
    let executor =
        SwapExecutor::with_parts(SwapConfig::default(), AlreadyExited, relauncher.clone());
    let outcome = executor.run(&SwapArgs {
        artifact,
        installation: install_dir.join("fnb-app"),
        host_pid: 31337,
    });

    assert_eq!(outcome.exit_code(), 2);
    assert_eq!(snapshot(&install_dir), before);
    assert_eq!(relauncher.launched(), vec![b"fnb-app 1.0.0".to_vec()]);
}

#[test]
fn archive_with_nested_executable_rolls_back() {
    let root = tempfile::tempdir().unwrap();
    let install_dir = installation(root.path());
    let before = snapshot(&install_dir);
    let artifact = root.path().join("app-1.2.0.zip");
    write_zip(
        &artifact,
        &[
            ("app-1.2.0/fnb-app", b"fnb-app 1.2.0"),
            ("app-1.2.0/lib/second.dat", b"new second"),
        ],
    );

    let relauncher = RecordingRelauncher::default();
    let executor =
        SwapExecutor::with_parts(SwapConfig::default(), AlreadyExited, relauncher.clone());
    let outcome = executor.run(&SwapArgs {
        artifact: artifact.clone(),
        installation: install_dir.join("fnb-app"),
        host_pid: 31337,
    });

    match &outcome {
        SwapOutcome::RolledBack { cause, .. } => {
            assert_eq!(cause.kind(), ErrorKind::InstallFailed);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(outcome.exit_code(), 2);
    assert_eq!(snapshot(&install_dir), before);
    assert_eq!(relauncher.launched(), vec![b"fnb-app 1.0.0".to_vec()]);

    let backups = backup::discover(&install_dir).unwrap();
    assert_eq!(backups.len(), 1);
    assert_eq!(backups[0].1, BackupStatus::RolledBack);
    assert!(artifact.exists());
}

/// Fails the relaunch after putting a plain file where the installation
/// directory was, so the restore cannot recreate it.
struct BlockingRelauncher {
    install_dir: PathBuf,
    calls: Arc<Mutex<usize>>,
}

impl Relauncher for BlockingRelauncher {
    fn relaunch(&self, _executable: &Path) -> fnb_updater::Result<()> {
        *self.calls.lock().unwrap() += 1;
        std::fs::remove_dir_all(&self.install_dir).unwrap();
        std::fs::write(&self.install_dir, b"not a directory").unwrap();
        Err(fnb_updater::UpdateError::RelaunchFailed(
            "exited with status 1".to_owned(),
        ))
    }
}

#[test]
fn failed_restore_reports_backup_and_exits_4() {
    let root = tempfile::tempdir().unwrap();
    let install_dir = installation(root.path());
    let artifact = root.path().join("fnb-app-1.2.0");
    std::fs::write(&artifact, b"fnb-app 1.2.0").unwrap();

    let calls = Arc::new(Mutex::new(0));
    let relauncher = BlockingRelauncher {
        install_dir: install_dir.clone(),
        calls: Arc::clone(&calls),
    };
    let executor = SwapExecutor::with_parts(SwapConfig::default(), AlreadyExited, relauncher);
    let outcome = executor.run(&SwapArgs {
        artifact,
        installation: install_dir.join("fnb-app"),
        host_pid: 31337,
    });

    let SwapOutcome::RollbackFailed {
        backup: backup_path,
        cause,
    } = &outcome
    else {
        panic!("unexpected outcome: {outcome:?}");
    };
    assert_eq!(cause.kind(), ErrorKind::RelaunchFailed);
    assert_eq!(outcome.exit_code(), 4);

    // The prior version is not started when nothing could be restored.
    assert_eq!(*calls.lock().unwrap(), 1);

    // The backup is intact and marked for manual recovery.
    assert_eq!(
        std::fs::read(backup_path.join("fnb-app")).unwrap(),
        b"fnb-app 1.0.0"
    );
    let manifest: serde_json::Value = serde_json::from_slice(
        &std::fs::read(backup_path.join(backup::MANIFEST_NAME)).unwrap(),
    )
    .unwrap();
    assert_eq!(manifest["status"], "rollback_failed");
}

#[test]
fn zip_update_replaces_files_and_keeps_untouched_ones() {
    let root = tempfile::tempdir().unwrap();
    let install_dir = installation(root.path());
    let artifact = root.path().join("app-1.2.0.zip");
    write_zip(
        &artifact,
        &[
            ("fnb-app", b"fnb-app 1.2.0"),
            ("lib/second.dat", b"new second"),
            ("lib/reports/daily.tpl", b"template"),
        ],
    );

    let relauncher = RecordingRelauncher::default();
    let executor =
        SwapExecutor::with_parts(SwapConfig::default(), AlreadyExited, relauncher.clone());
    let outcome = executor.run(&SwapArgs {
        artifact: artifact.clone(),
        installation: install_dir.join("fnb-app"),
        host_pid: 31337,
    });

    let SwapOutcome::Complete {
        backup: backup_path,
    } = &outcome
    else {
        panic!("unexpected outcome: {outcome:?}");
    };
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(
        std::fs::read(install_dir.join("fnb-app")).unwrap(),
        b"fnb-app 1.2.0"
    );
    assert_eq!(
        std::fs::read(install_dir.join("lib/reports/daily.tpl")).unwrap(),
        b"template"
    );
    assert_eq!(
        std::fs::read(install_dir.join("branches.toml")).unwrap(),
        b"[main]\nseats = 40"
    );
    assert!(!artifact.exists());
    assert_eq!(relauncher.launched(), vec![b"fnb-app 1.2.0".to_vec()]);
    assert_eq!(
        std::fs::read(backup_path.join("fnb-app")).unwrap(),
        b"fnb-app 1.0.0"
    );

    assert_eq!(backup::cleanup_completed(&install_dir).unwrap(), 1);
    assert!(!backup_path.exists());
}

// ---------------------------------------------------------------------------
// Real processes (Unix)
// ---------------------------------------------------------------------------

#[cfg(unix)]
#[test]
fn waits_for_real_host_process_before_touching_files() {
    let root = tempfile::tempdir().unwrap();
    let install_dir = installation(root.path());
    let artifact = root.path().join("fnb-app-1.2.0");
    std::fs::write(&artifact, b"fnb-app 1.2.0").unwrap();

    let mut host = std::process::Command::new("sleep")
        .arg("0.5")
        .spawn()
        .expect("spawn host stand-in");
    let host_pid = host.id();
    let reaper = std::thread::spawn(move || host.wait());

    let config = SwapConfig {
        exit_wait_secs: 10,
        poll_interval_ms: 20,
        ..SwapConfig::default()
    };
    let executor = SwapExecutor::with_parts(config, OsExitWaiter, RecordingRelauncher::default());
    let outcome = executor.run(&SwapArgs {
        artifact,
        installation: install_dir.join("fnb-app"),
        host_pid,
    });

    assert_eq!(outcome.exit_code(), 0, "{outcome:?}");
    assert!(reaper.join().unwrap().unwrap().success());
    assert_eq!(
        std::fs::read(install_dir.join("fnb-app")).unwrap(),
        b"fnb-app 1.2.0"
    );
}

#[cfg(unix)]
#[test]
fn host_that_keeps_running_aborts_with_code_3() {
    let root = tempfile::tempdir().unwrap();
    let install_dir = installation(root.path());
    let before = snapshot(&install_dir);
    let artifact = root.path().join("fnb-app-1.2.0");
    std::fs::write(&artifact, b"fnb-app 1.2.0").unwrap();

    let mut host = std::process::Command::new("sleep")
        .arg("30")
        .spawn()
        .expect("spawn host stand-in");

    let config = SwapConfig {
        exit_wait_secs: 1,
        poll_interval_ms: 20,
        ..SwapConfig::default()
    };
    let executor = SwapExecutor::with_parts(config, OsExitWaiter, RecordingRelauncher::default());
    let outcome = executor.run(&SwapArgs {
        artifact,
        installation: install_dir.join("fnb-app"),
        host_pid: host.id(),
    });

    host.kill().unwrap();
    host.wait().unwrap();

    match &outcome {
        SwapOutcome::Aborted(e) => assert_eq!(e.kind(), ErrorKind::HostDidNotExit),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(outcome.exit_code(), 3);
    assert_eq!(snapshot(&install_dir), before);
    assert!(backup::discover(&install_dir).unwrap().is_empty());
}

#[cfg(unix)]
#[test]
fn standalone_binary_swaps_and_relaunches() {
    use std::os::unix::fs::PermissionsExt;

    let root = tempfile::tempdir().unwrap();
    let install_dir = root.path().join("fnb-app");
    std::fs::create_dir(&install_dir).unwrap();
    let exe = install_dir.join("fnb-app");
    std::fs::write(&exe, "#!/bin/sh\nexit 1\n").unwrap();
    std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();

    let marker = root.path().join("started");
    let artifact = root.path().join("fnb-app-1.2.0");
    std::fs::write(
        &artifact,
        format!("#!/bin/sh\ntouch '{}'\nexit 0\n", marker.display()),
    )
    .unwrap();

    let status = std::process::Command::new(env!("CARGO_BIN_EXE_swap-executor"))
        .arg(&artifact)
        .arg(&exe)
        // No process has this PID, so the host counts as exited.
        .arg("4194304")
        .env("FNB_UPDATER_DATA_DIR", root.path().join("data"))
        .env("FNB_UPDATER_CONFIG_DIR", root.path().join("config"))
        .status()
        .expect("run swap-executor");

    assert_eq!(status.code(), Some(0));
    assert!(!artifact.exists());
    assert!(
        std::fs::read_to_string(&exe).unwrap().contains("touch"),
        "new executable installed"
    );

    // The relaunched script runs detached; give it a moment.
    for _ in 0..50 {
        if marker.exists() {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    assert!(marker.exists(), "new version was started");

    let backups = backup::discover(&install_dir).unwrap();
    assert_eq!(backups.len(), 1);
    assert_eq!(backups[0].1, BackupStatus::Complete);
    assert!(root.path().join("data").join("logs").is_dir());
}

#[test]
fn standalone_binary_rejects_bad_arguments() {
    let root = tempfile::tempdir().unwrap();
    let status = std::process::Command::new(env!("CARGO_BIN_EXE_swap-executor"))
        .arg("only-one-argument")
        .env("FNB_UPDATER_DATA_DIR", root.path().join("data"))
        .env("FNB_UPDATER_CONFIG_DIR", root.path().join("config"))
        .status()
        .expect("run swap-executor");
    assert_eq!(status.code(), Some(3));
}
