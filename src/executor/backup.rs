//! Installation backups.
//!
//! A backup is a full copy of the installation directory placed next to it as
//! `<dir>.backup-<timestamp>`. Each backup carries a small JSON manifest so a
//! later run can find it and tell whether the swap that created it finished.

use crate::error::{Result, UpdateError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Manifest filename inside every backup directory.
pub const MANIFEST_NAME: &str = ".fnb-swap-manifest.json";

const BACKUP_MARKER: &str = ".backup-";

/// Swap status recorded in a backup manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    /// The swap that created the backup has not finished (or crashed).
    InProgress,
    /// The new version was installed and started.
    Complete,
    /// Installation or relaunch failed and the backup was restored.
    RolledBack,
    /// Restoring the backup failed; it is the only intact copy.
    RollbackFailed,
}

impl std::fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::InProgress => "in progress",
            Self::Complete => "complete",
            Self::RolledBack => "rolled back",
            Self::RollbackFailed => "rollback failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    installation: PathBuf,
    created_at: DateTime<Utc>,
    status: BackupStatus,
}

/// A copy of the installation directory taken before replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallationBackup {
    backup_path: PathBuf,
    created_at: DateTime<Utc>,
}

impl InstallationBackup {
    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Copy `install_dir` to a fresh sibling backup directory.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::BackupFailed`] if any part of the copy fails.
    /// A partially written backup is removed before returning.
    pub fn create(install_dir: &Path) -> Result<Self> {
        let created_at = Utc::now();
        let backup_path = unique_backup_path(install_dir, created_at)?;

        tracing::info!(
            from = %install_dir.display(),
            to = %backup_path.display(),
            "backing up installation"
        );

        let result = fs::create_dir(&backup_path)
            .map_err(|e| e.to_string())
            .and_then(|()| {
                write_manifest(
                    &backup_path,
                    &Manifest {
                        installation: install_dir.to_path_buf(),
                        created_at,
                        status: BackupStatus::InProgress,
                    },
                )
                .map_err(|e| e.to_string())
            })
            .and_then(|()| copy_tree(install_dir, &backup_path).map_err(|e| e.to_string()));

        if let Err(e) = result {
            let _ = fs::remove_dir_all(&backup_path);
            return Err(UpdateError::BackupFailed(format!(
                "cannot back up {} to {}: {e}",
                install_dir.display(),
                backup_path.display()
            )));
        }

        Ok(Self {
            backup_path,
            created_at,
        })
    }

    /// Make `install_dir` byte-identical to this backup.
    ///
    /// Files created since the backup are removed, then every backed-up file
    /// is written back.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::RollbackFailed`] if the directory cannot be
    /// restored. The backup itself is never modified.
    pub fn restore(&self, install_dir: &Path) -> Result<()> {
        tracing::warn!(
            backup = %self.backup_path.display(),
            installation = %install_dir.display(),
            "restoring installation from backup"
        );
        fs::create_dir_all(install_dir)
            .and_then(|()| prune_extra(install_dir, &self.backup_path))
            .and_then(|()| copy_tree(&self.backup_path, install_dir))
            .map_err(|e| {
                UpdateError::RollbackFailed(format!(
                    "cannot restore {} from {}: {e}",
                    install_dir.display(),
                    self.backup_path.display()
                ))
            })
    }

    /// Record the swap status in the manifest (best-effort).
    pub fn set_status(&self, status: BackupStatus) {
        let manifest = read_manifest(&self.backup_path).map(|mut m| {
            m.status = status;
            m
        });
        let result = match manifest {
            Ok(m) => write_manifest(&self.backup_path, &m),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::warn!(
                backup = %self.backup_path.display(),
                %status,
                "cannot update backup manifest: {e}"
            );
        }
    }

    /// Status recorded in the manifest.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest is missing or unreadable.
    pub fn status(&self) -> Result<BackupStatus> {
        read_manifest(&self.backup_path)
            .map(|m| m.status)
            .map_err(|e| UpdateError::Io(format!("cannot read backup manifest: {e}")))
    }
}

/// Find every backup created for `install_dir`, oldest first.
///
/// # Errors
///
/// Returns an error if the parent directory cannot be listed.
pub fn discover(install_dir: &Path) -> Result<Vec<(InstallationBackup, BackupStatus)>> {
    let (parent, prefix) = backup_prefix(install_dir)?;
    let mut found = Vec::new();

    for entry in fs::read_dir(&parent)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(&prefix) || !entry.file_type()?.is_dir() {
            continue;
        }
        let path = entry.path();
        match read_manifest(&path) {
            Ok(manifest) => found.push((
                InstallationBackup {
                    backup_path: path,
                    created_at: manifest.created_at,
                },
                manifest.status,
            )),
            Err(e) => tracing::debug!(path = %path.display(), "skipping backup without manifest: {e}"),
        }
    }

    found.sort_by_key(|(backup, _)| backup.created_at);
    Ok(found)
}

/// Delete backups whose swap completed. Called once the new version has
/// started successfully. Other backups are kept for inspection.
///
/// Returns the number of backups removed.
///
/// # Errors
///
/// Returns an error if the backups cannot be listed.
pub fn cleanup_completed(install_dir: &Path) -> Result<usize> {
    let mut removed = 0;
    for (backup, status) in discover(install_dir)? {
        if status != BackupStatus::Complete {
            continue;
        }
        match fs::remove_dir_all(backup.backup_path()) {
            Ok(()) => {
                tracing::info!(path = %backup.backup_path().display(), "removed completed backup");
                removed += 1;
            }
            Err(e) => tracing::warn!(
                path = %backup.backup_path().display(),
                "cannot remove backup: {e}"
            ),
        }
    }
    Ok(removed)
}

fn backup_prefix(install_dir: &Path) -> Result<(PathBuf, String)> {
    let parent = install_dir.parent().ok_or_else(|| {
        UpdateError::BackupFailed(format!(
            "installation directory {} has no parent",
            install_dir.display()
        ))
    })?;
    let name = install_dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            UpdateError::BackupFailed(format!(
                "installation directory {} has no usable name",
                install_dir.display()
            ))
        })?;
    Ok((parent.to_path_buf(), format!("{name}{BACKUP_MARKER}")))
}

fn unique_backup_path(install_dir: &Path, created_at: DateTime<Utc>) -> Result<PathBuf> {
    let (parent, prefix) = backup_prefix(install_dir)?;
    let stamp = created_at.format("%Y%m%dT%H%M%S");
    let base = parent.join(format!("{prefix}{stamp}"));
    if !base.exists() {
        return Ok(base);
    }
    (1..100)
        .map(|n| parent.join(format!("{prefix}{stamp}-{n}")))
        .find(|p| !p.exists())
        .ok_or_else(|| {
            UpdateError::BackupFailed(format!("no free backup name next to {}", install_dir.display()))
        })
}

fn read_manifest(backup_path: &Path) -> std::io::Result<Manifest> {
    let bytes = fs::read(backup_path.join(MANIFEST_NAME))?;
    serde_json::from_slice(&bytes).map_err(std::io::Error::other)
}

fn write_manifest(backup_path: &Path, manifest: &Manifest) -> std::io::Result<()> {
    let json = serde_json::to_vec_pretty(manifest).map_err(std::io::Error::other)?;
    let tmp = backup_path.join(format!("{MANIFEST_NAME}.tmp"));
    fs::write(&tmp, json)?;
    fs::rename(&tmp, backup_path.join(MANIFEST_NAME))
}

/// Recursively copy `src` into `dst`, skipping the backup manifest.
fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        if entry.file_name() == MANIFEST_NAME {
            continue;
        }
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            copy_tree(&from, &to)?;
        } else if file_type.is_symlink() {
            copy_symlink(&from, &to)?;
        } else {
            fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> std::io::Result<()> {
    let target = fs::read_link(from)?;
    if fs::symlink_metadata(to).is_ok() {
        remove_path(to)?;
    }
    std::os::unix::fs::symlink(target, to)
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> std::io::Result<()> {
    fs::copy(from, to).map(|_| ())
}

/// Remove everything under `target` that has no counterpart in `reference`.
fn prune_extra(target: &Path, reference: &Path) -> std::io::Result<()> {
    for entry in fs::read_dir(target)? {
        let entry = entry?;
        let path = entry.path();
        let counterpart = reference.join(entry.file_name());
        let file_type = entry.file_type()?;

        match fs::symlink_metadata(&counterpart) {
            Err(_) => remove_path(&path)?,
            Ok(meta) if file_type.is_dir() && meta.is_dir() => prune_extra(&path, &counterpart)?,
            // Type changed (file <-> dir); remove so the copy recreates it.
            Ok(meta) if file_type.is_dir() != meta.is_dir() => remove_path(&path)?,
            Ok(_) => {}
        }
    }
    Ok(())
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Recursive listing of relative file paths and contents, for comparisons.
#[cfg(test)]
pub(crate) fn snapshot(dir: &Path) -> std::collections::BTreeMap<PathBuf, Vec<u8>> {
    fn walk(root: &Path, dir: &Path, out: &mut std::collections::BTreeMap<PathBuf, Vec<u8>>) {
        for entry in fs::read_dir(dir).into_iter().flatten().flatten() {
            let path = entry.path();
            if entry.file_name() == MANIFEST_NAME {
                continue;
            }
            if path.is_dir() {
                walk(root, &path, out);
            } else if let Ok(rel) = path.strip_prefix(root) {
                out.insert(rel.to_path_buf(), fs::read(&path).unwrap_or_default());
            }
        }
    }
    let mut out = std::collections::BTreeMap::new();
    walk(dir, dir, &mut out);
    out
}
