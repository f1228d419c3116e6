//! Host-side handoff to the swap executor.
//!
//! The executor is compiled into the application binary. At handoff the
//! running executable is copied to a private temp directory under the name
//! [`HELPER_NAME`], so the file being replaced is never the one executing the
//! swap, and launched detached with three positional arguments.

use crate::error::{Result, UpdateError};
use crate::feed::ReleaseInfo;
use crate::fetcher::DownloadedArtifact;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Program name the staged helper is launched under.
pub const HELPER_NAME: &str = "swap-executor";

/// Everything the swap executor needs, built by consuming the artifact.
///
/// Once a request exists the coordinator no longer holds the artifact and
/// cannot touch the file.
#[derive(Debug)]
pub struct SwapRequest {
    artifact: PathBuf,
    installation: PathBuf,
    host_pid: u32,
    release: ReleaseInfo,
}

impl SwapRequest {
    pub fn new(artifact: DownloadedArtifact, installation: PathBuf, host_pid: u32) -> Self {
        let (artifact, release) = artifact.into_parts();
        Self {
            artifact,
            installation,
            host_pid,
            release,
        }
    }

    pub fn artifact(&self) -> &Path {
        &self.artifact
    }

    pub fn installation(&self) -> &Path {
        &self.installation
    }

    pub fn host_pid(&self) -> u32 {
        self.host_pid
    }

    pub fn release(&self) -> &ReleaseInfo {
        &self.release
    }

    /// Positional arguments: artifact path, installation path, host PID.
    pub fn args(&self) -> [OsString; 3] {
        [
            self.artifact.clone().into_os_string(),
            self.installation.clone().into_os_string(),
            OsString::from(self.host_pid.to_string()),
        ]
    }

    /// Delete the artifact after a failed launch (best-effort).
    pub fn discard_artifact(self) {
        if let Err(e) = std::fs::remove_file(&self.artifact) {
            tracing::warn!(path = %self.artifact.display(), "cannot remove artifact: {e}");
        }
    }
}

/// Starts the swap executor for a request.
pub trait SwapLauncher: Send + Sync {
    /// Launch the executor and return its process id.
    ///
    /// # Errors
    ///
    /// Returns an error if the executor could not be started. The artifact
    /// is left in place for the caller to discard.
    fn launch(&self, request: &SwapRequest) -> Result<u32>;
}

/// Launches the executor as a detached OS process.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    helper_source: PathBuf,
}

impl ProcessLauncher {
    /// Use the currently running executable as the helper source.
    ///
    /// # Errors
    ///
    /// Returns an error if the current executable path cannot be determined.
    pub fn from_current_exe() -> Result<Self> {
        let helper_source = std::env::current_exe().map_err(|e| {
            UpdateError::Io(format!("cannot determine current executable path: {e}"))
        })?;
        Ok(Self { helper_source })
    }

    /// Use an explicit binary (for example a separately shipped
    /// `swap-executor`) as the helper source.
    pub fn with_helper_source(helper_source: PathBuf) -> Self {
        Self { helper_source }
    }

    /// Copy the helper source into a fresh temp directory.
    ///
    /// The directory is removed again when the returned guard drops, unless
    /// the helper was started.
    fn stage_helper(&self) -> Result<StagedHelper> {
        self.stage_helper_in(&std::env::temp_dir())
    }

    fn stage_helper_in(&self, root: &Path) -> Result<StagedHelper> {
        let dir = tempfile::Builder::new()
            .prefix("fnb-swap-")
            .tempdir_in(root)
            .map_err(|e| UpdateError::Io(format!("cannot create helper directory: {e}")))?;

        let path = dir
            .path()
            .join(format!("{HELPER_NAME}{}", std::env::consts::EXE_SUFFIX));
        std::fs::copy(&self.helper_source, &path).map_err(|e| {
            UpdateError::Io(format!(
                "cannot stage swap executor {} -> {}: {e}",
                self.helper_source.display(),
                path.display()
            ))
        })?;
        set_executable(&path)?;

        tracing::debug!(helper = %path.display(), "swap executor staged");
        Ok(StagedHelper { dir, path })
    }
}

/// A staged helper binary and the temp directory holding it.
struct StagedHelper {
    dir: tempfile::TempDir,
    path: PathBuf,
}

impl StagedHelper {
    /// Start the helper detached. On success the directory is left for the
    /// helper to remove; on failure it is deleted here.
    fn spawn(self, args: &[OsString]) -> Result<u32> {
        let mut command = Command::new(&self.path);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        detach(&mut command);

        let child = command.spawn().map_err(|e| {
            UpdateError::Io(format!(
                "cannot start swap executor {}: {e}",
                self.path.display()
            ))
        })?;
        let _ = self.dir.keep();
        Ok(child.id())
    }
}

impl SwapLauncher for ProcessLauncher {
    fn launch(&self, request: &SwapRequest) -> Result<u32> {
        let pid = self.stage_helper()?.spawn(&request.args())?;

        tracing::info!(
            pid,
            artifact = %request.artifact().display(),
            installation = %request.installation().display(),
            host_pid = request.host_pid(),
            "swap executor launched"
        );
        Ok(pid)
    }
}

/// Put the child in its own process group / console so it survives the host.
pub(crate) fn detach(command: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const DETACHED_PROCESS: u32 = 0x0000_0008;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        command.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
    }
}

/// Set executable permission on Unix platforms.
pub(crate) fn set_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).map_err(|e| {
            UpdateError::Io(format!(
                "cannot set executable permission on {}: {e}",
                path.display()
            ))
        })?;
    }
    let _ = path;
    Ok(())
}
