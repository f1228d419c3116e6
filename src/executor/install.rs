//! Installing a downloaded artifact over the installation.
//!
//! Every file is written beside its destination and renamed into place, so
//! a destination is either the old file or the complete new one.

use crate::error::{Result, UpdateError};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const STAGING_SUFFIX: &str = ".fnb-new";

/// Kind of artifact, decided from its filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// A single executable that replaces the installation executable.
    Binary,
    /// An archive extracted over the installation directory.
    Zip,
}

impl ArtifactKind {
    pub fn detect(artifact: &Path) -> Self {
        let is_zip = artifact
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("zip"));
        if is_zip { Self::Zip } else { Self::Binary }
    }
}

/// Install `artifact` for the executable at `executable`.
///
/// # Errors
///
/// Returns [`UpdateError::InstallFailed`] on any failure. Files already
/// renamed into place stay there; the caller restores the backup.
pub fn install(artifact: &Path, executable: &Path) -> Result<()> {
    let install_dir = executable.parent().ok_or_else(|| {
        UpdateError::InstallFailed(format!("{} has no parent directory", executable.display()))
    })?;

    match ArtifactKind::detect(artifact) {
        ArtifactKind::Binary => install_binary(artifact, executable),
        ArtifactKind::Zip => {
            // The old executable is still on disk, so check the archive
            // itself before anything is written.
            let file_name = executable.file_name().ok_or_else(|| {
                UpdateError::InstallFailed(format!("{} has no file name", executable.display()))
            })?;
            if !archive_contains(artifact, Path::new(file_name))? {
                return Err(UpdateError::InstallFailed(format!(
                    "archive has no top-level {file_name:?}"
                )));
            }
            extract_zip(artifact, install_dir)?;
            crate::handoff::set_executable(executable)
                .map_err(|e| UpdateError::InstallFailed(e.to_string()))
        }
    }
}

fn install_binary(artifact: &Path, executable: &Path) -> Result<()> {
    tracing::info!(
        artifact = %artifact.display(),
        target = %executable.display(),
        "replacing executable"
    );
    let staged = staging_path(executable);
    let result = fs::copy(artifact, &staged)
        .map_err(|e| format!("cannot stage {}: {e}", staged.display()))
        .and_then(|_| crate::handoff::set_executable(&staged).map_err(|e| e.to_string()))
        .and_then(|()| {
            fs::rename(&staged, executable)
                .map_err(|e| format!("cannot move new executable into place: {e}"))
        });

    result.map_err(|e| {
        let _ = fs::remove_file(&staged);
        UpdateError::InstallFailed(e)
    })
}

/// Whether `archive` has a file entry at `relative` (after zip-slip checks).
///
/// # Errors
///
/// Returns [`UpdateError::InstallFailed`] if the archive cannot be read.
pub fn archive_contains(archive: &Path, relative: &Path) -> Result<bool> {
    let file = fs::File::open(archive)
        .map_err(|e| UpdateError::InstallFailed(format!("cannot open {}: {e}", archive.display())))?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| UpdateError::InstallFailed(format!("cannot read archive: {e}")))?;

    for i in 0..zip.len() {
        let entry = zip
            .by_index(i)
            .map_err(|e| UpdateError::InstallFailed(format!("cannot read archive entry {i}: {e}")))?;
        if !entry.is_dir() && entry.enclosed_name().is_some_and(|name| name == relative) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Extract every entry of `archive` into `install_dir`.
///
/// Entries that would escape `install_dir` abort the extraction.
///
/// # Errors
///
/// Returns [`UpdateError::InstallFailed`] if the archive is unreadable, an
/// entry is corrupt or unsafe, or a file cannot be written.
pub fn extract_zip(archive: &Path, install_dir: &Path) -> Result<()> {
    tracing::info!(
        archive = %archive.display(),
        target = %install_dir.display(),
        "extracting archive"
    );
    let file = fs::File::open(archive)
        .map_err(|e| UpdateError::InstallFailed(format!("cannot open {}: {e}", archive.display())))?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| UpdateError::InstallFailed(format!("cannot read archive: {e}")))?;

    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| UpdateError::InstallFailed(format!("cannot read archive entry {i}: {e}")))?;

        let Some(relative) = entry.enclosed_name() else {
            return Err(UpdateError::InstallFailed(format!(
                "archive entry {:?} escapes the installation directory",
                entry.name()
            )));
        };
        let out_path = install_dir.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path).map_err(|e| {
                UpdateError::InstallFailed(format!("cannot create {}: {e}", out_path.display()))
            })?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                UpdateError::InstallFailed(format!("cannot create {}: {e}", parent.display()))
            })?;
        }

        let staged = staging_path(&out_path);
        let written = write_entry(&mut entry, &staged).and_then(|()| {
            #[cfg(unix)]
            if let Some(mode) = entry.unix_mode() {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&staged, fs::Permissions::from_mode(mode & 0o7777))?;
            }
            fs::rename(&staged, &out_path)
        });

        if let Err(e) = written {
            let _ = fs::remove_file(&staged);
            return Err(UpdateError::InstallFailed(format!(
                "cannot extract {}: {e}",
                entry.name()
            )));
        }
        tracing::debug!(path = %out_path.display(), "extracted");
    }
    Ok(())
}

/// Copy one entry to `staged`. Reading to the end verifies the entry CRC.
fn write_entry(entry: &mut impl std::io::Read, staged: &Path) -> std::io::Result<()> {
    let mut out = fs::File::create(staged)?;
    std::io::copy(entry, &mut out)?;
    out.flush()?;
    out.sync_all()
}

fn staging_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(STAGING_SUFFIX);
    target.with_file_name(name)
}
