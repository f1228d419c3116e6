//! Artifact fetcher: streams a release asset to local temporary storage.
//!
//! The asset is written to a uniquely named file inside the destination
//! directory. The file is only kept once every advertised byte has arrived
//! and been flushed; on any failure (network, short read, disk full,
//! cancellation, timeout) it is removed before the error is returned.

use crate::config::DownloadConfig;
use crate::error::{Result, UpdateError, is_disk_full};
use crate::feed::ReleaseInfo;
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const PROGRESS_THRESHOLD: u64 = 256 * 1024;

/// A fully downloaded release asset.
///
/// Owned by the coordinator until it is handed to the swap executor; the
/// handoff consumes the value.
#[derive(Debug, PartialEq, Eq)]
pub struct DownloadedArtifact {
    local_path: PathBuf,
    size_bytes: u64,
    release: ReleaseInfo,
}

impl DownloadedArtifact {
    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn release(&self) -> &ReleaseInfo {
        &self.release
    }

    /// Give up ownership of the file, returning its path and release.
    pub fn into_parts(self) -> (PathBuf, ReleaseInfo) {
        (self.local_path, self.release)
    }

    /// Delete the downloaded file (best-effort).
    pub fn discard(self) {
        if let Err(e) = std::fs::remove_file(&self.local_path) {
            tracing::warn!(path = %self.local_path.display(), "cannot remove artifact: {e}");
        }
    }
}

/// Download progress for one artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    /// Bytes written so far.
    pub bytes_received: u64,
    /// Total size advertised by the server, if known.
    pub total_bytes: Option<u64>,
}

impl DownloadProgress {
    /// Completion percentage, if the total is known.
    pub fn percent(&self) -> Option<f64> {
        match self.total_bytes {
            Some(0) => Some(100.0),
            Some(total) => Some(self.bytes_received as f64 / total as f64 * 100.0),
            None => None,
        }
    }
}

/// Callback invoked with download progress.
pub type ProgressCallback = Box<dyn Fn(DownloadProgress) + Send + Sync>;

/// Streams release assets to disk.
#[derive(Debug, Clone)]
pub struct ArtifactFetcher {
    client: reqwest::Client,
    config: DownloadConfig,
}

impl ArtifactFetcher {
    /// Create a fetcher.
    ///
    /// Redirects are followed (reqwest's default policy), which release
    /// hosts rely on for asset URLs.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Config`] if the HTTP client cannot be built.
    pub fn new(config: DownloadConfig, user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| UpdateError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// Download the release's asset into `destination_dir`.
    ///
    /// # Errors
    ///
    /// - [`UpdateError::Network`] if the request fails before the body starts.
    /// - [`UpdateError::IncompleteTransfer`] on a short (or long) read, a
    ///   broken stream, or a timeout.
    /// - [`UpdateError::DiskFull`] if the filesystem runs out of space.
    /// - [`UpdateError::Cancelled`] if `cancel` fires.
    ///
    /// In every error case the partial file has already been removed.
    pub async fn download(
        &self,
        release: &ReleaseInfo,
        destination_dir: &Path,
        cancel: &CancellationToken,
        progress: Option<&ProgressCallback>,
    ) -> Result<DownloadedArtifact> {
        let overall = self.config.timeout();
        let transfer = self.download_inner(release, destination_dir, cancel, progress);

        match tokio::time::timeout(overall, transfer).await {
            Ok(result) => result,
            Err(_) => Err(UpdateError::IncompleteTransfer(format!(
                "download of {} exceeded {}s",
                release.asset_name,
                overall.as_secs()
            ))),
        }
    }

    async fn download_inner(
        &self,
        release: &ReleaseInfo,
        destination_dir: &Path,
        cancel: &CancellationToken,
        progress: Option<&ProgressCallback>,
    ) -> Result<DownloadedArtifact> {
        let url = release.asset_url.as_str();
        tracing::info!(%url, dest = %destination_dir.display(), "downloading artifact");

        std::fs::create_dir_all(destination_dir).map_err(|e| {
            tracing::error!(dir = %destination_dir.display(), "cannot create download dir: {e}");
            UpdateError::from(e)
        })?;

        let response = tokio::select! {
            () = cancel.cancelled() => {
                return Err(UpdateError::Cancelled("download cancelled before start".to_owned()));
            }
            sent = self.client.get(url).send() => {
                sent.map_err(|e| UpdateError::Network(format!("download request failed: {e}")))?
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Err(UpdateError::Network(format!(
                "asset download returned HTTP {status}"
            )));
        }

        let expected = response.content_length();
        if let Some(len) = expected {
            let free = available_disk_space(destination_dir)?;
            let needed = len.saturating_add(self.config.min_free_bytes);
            if free < needed {
                return Err(UpdateError::DiskFull(format!(
                    "need {needed} bytes in {}, {free} available",
                    destination_dir.display()
                )));
            }
        }

        // Dropping `temp` removes the file, which covers every early return
        // below as well as a dropped (cancelled) future.
        let (prefix, suffix) = temp_name_parts(&release.asset_name);
        let temp = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(&suffix)
            .tempfile_in(destination_dir)?;
        let mut file = tokio::fs::File::from_std(temp.as_file().try_clone()?);

        let mut stream = response.bytes_stream();
        let inactivity = self.config.inactivity_timeout();
        let mut downloaded: u64 = 0;
        let mut last_reported: Option<u64> = None;

        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!(downloaded, "download cancelled; discarding partial file");
                    return Err(UpdateError::Cancelled(format!(
                        "download cancelled after {downloaded} bytes"
                    )));
                }
                next = tokio::time::timeout(inactivity, stream.next()) => next,
            };

            let chunk = match next {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(Some(Err(e))) => {
                    return Err(UpdateError::IncompleteTransfer(format!(
                        "stream broke after {downloaded} bytes: {e}"
                    )));
                }
                Ok(None) => break,
                Err(_) => {
                    return Err(UpdateError::IncompleteTransfer(format!(
                        "no data for {}s after {downloaded} bytes",
                        inactivity.as_secs()
                    )));
                }
            };

            file.write_all(&chunk).await.map_err(write_error)?;
            downloaded += chunk.len() as u64;

            if let Some(len) = expected
                && downloaded > len
            {
                return Err(UpdateError::IncompleteTransfer(format!(
                    "received more than the advertised {len} bytes"
                )));
            }

            if let Some(cb) = progress {
                let due = match last_reported {
                    None => true,
                    Some(last) => {
                        downloaded - last >= PROGRESS_THRESHOLD || Some(downloaded) == expected
                    }
                };
                if due {
                    cb(DownloadProgress {
                        bytes_received: downloaded,
                        total_bytes: expected,
                    });
                    last_reported = Some(downloaded);
                }
            }
        }

        if let Some(len) = expected
            && downloaded != len
        {
            tracing::warn!(downloaded, expected = len, "short read; discarding partial file");
            return Err(UpdateError::IncompleteTransfer(format!(
                "received {downloaded} of {len} bytes"
            )));
        }

        file.flush().await.map_err(write_error)?;
        file.sync_all().await.map_err(write_error)?;
        drop(file);

        let (handle, local_path) = temp
            .keep()
            .map_err(|e| UpdateError::Io(format!("cannot keep downloaded file: {e}")))?;
        drop(handle);

        tracing::info!(
            path = %local_path.display(),
            bytes = downloaded,
            "artifact downloaded"
        );

        Ok(DownloadedArtifact {
            local_path,
            size_bytes: downloaded,
            release: release.clone(),
        })
    }
}

fn write_error(e: std::io::Error) -> UpdateError {
    if is_disk_full(&e) {
        UpdateError::DiskFull(format!("cannot write artifact: {e}"))
    } else {
        UpdateError::Io(format!("cannot write artifact: {e}"))
    }
}

/// Split an asset name into a temp-file prefix and suffix.
///
/// Only the final path component is used, so a hostile asset name cannot
/// point outside the destination directory.
fn temp_name_parts(asset_name: &str) -> (String, String) {
    let file_name = Path::new(asset_name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_owned());
    let path = Path::new(&file_name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_owned());
    let suffix = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    (format!("{stem}-"), suffix)
}

/// Query available disk space at `path`.
///
/// On Unix this uses `statvfs`; elsewhere it returns `u64::MAX` and the
/// pre-flight check is skipped (write errors still map to disk-full).
///
/// # Errors
///
/// Returns an error if the filesystem stats cannot be retrieved.
#[cfg(unix)]
pub fn available_disk_space(path: &Path) -> Result<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| UpdateError::Io(format!("invalid path for statvfs: {e}")))?;

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };

    if ret != 0 {
        return Err(UpdateError::Io(format!(
            "failed to check disk space at {}: {}",
            path.display(),
            std::io::Error::last_os_error()
        )));
    }

    // f_bavail and f_frsize are narrower than u64 on some targets.
    let bavail: u64 = stat.f_bavail as _;
    let frsize: u64 = stat.f_frsize as _;
    Ok(bavail.wrapping_mul(frsize))
}

#[cfg(not(unix))]
pub fn available_disk_space(_path: &Path) -> Result<u64> {
    Ok(u64::MAX)
}
