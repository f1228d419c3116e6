//! Error types for the update orchestrator.

/// Fieldless classification of an [`UpdateError`].
///
/// The UI matches on this to decide what to show; the payload of the error
/// itself is only meant for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidVersionFormat,
    NetworkError,
    FeedParseError,
    NoReleasesFound,
    NoInstallableAsset,
    DiskFullError,
    IncompleteTransfer,
    ConcurrentUpdateInProgress,
    HostDidNotExit,
    BackupFailed,
    InstallFailed,
    RelaunchFailed,
    RollbackFailed,
    Cancelled,
    Config,
    Io,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::InvalidVersionFormat => "invalid version format",
            Self::NetworkError => "network error",
            Self::FeedParseError => "feed parse error",
            Self::NoReleasesFound => "no releases found",
            Self::NoInstallableAsset => "no installable asset",
            Self::DiskFullError => "disk full",
            Self::IncompleteTransfer => "incomplete transfer",
            Self::ConcurrentUpdateInProgress => "update already in progress",
            Self::HostDidNotExit => "host did not exit",
            Self::BackupFailed => "backup failed",
            Self::InstallFailed => "install failed",
            Self::RelaunchFailed => "relaunch failed",
            Self::RollbackFailed => "rollback failed",
            Self::Cancelled => "cancelled",
            Self::Config => "configuration error",
            Self::Io => "I/O error",
        };
        f.write_str(name)
    }
}

/// Top-level error type for the update orchestrator and swap executor.
///
/// Every variant carries a human-readable message. The type is `Clone` so it
/// can travel inside [`crate::UpdateOutcome`] and broadcast events.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpdateError {
    /// A version string did not have the `major.minor.patch` shape.
    #[error("invalid version format: {0}")]
    InvalidVersionFormat(String),

    /// Transport failure, timeout or throttling while talking to a server.
    #[error("network error: {0}")]
    Network(String),

    /// The release feed answered but its body could not be decoded.
    #[error("feed parse error: {0}")]
    FeedParse(String),

    /// The release feed has no entries for the repository.
    #[error("no releases found: {0}")]
    NoReleasesFound(String),

    /// The newest release has zero or several installable assets.
    #[error("no installable asset: {0}")]
    NoInstallableAsset(String),

    /// Not enough space on the destination filesystem.
    #[error("disk full: {0}")]
    DiskFull(String),

    /// The download ended with fewer (or more) bytes than advertised.
    #[error("incomplete transfer: {0}")]
    IncompleteTransfer(String),

    /// Another update cycle is already running in this process.
    #[error("an update is already in progress")]
    ConcurrentUpdateInProgress,

    /// The host process was still alive when the wait bound expired.
    #[error("host process did not exit: {0}")]
    HostDidNotExit(String),

    /// The installation could not be backed up; nothing was changed.
    #[error("backup failed: {0}")]
    BackupFailed(String),

    /// The artifact could not be installed; the backup was restored.
    #[error("install failed: {0}")]
    InstallFailed(String),

    /// The new installation could not be started.
    #[error("relaunch failed: {0}")]
    RelaunchFailed(String),

    /// Restoring the backup failed. The only unrecoverable error.
    #[error("rollback failed: {0}")]
    RollbackFailed(String),

    /// The operation was cancelled by the collaborator.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Invalid or missing configuration.
    #[error("config error: {0}")]
    Config(String),

    /// Filesystem error outside the more specific categories.
    #[error("I/O error: {0}")]
    Io(String),
}

impl UpdateError {
    /// Returns the fieldless classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidVersionFormat(_) => ErrorKind::InvalidVersionFormat,
            Self::Network(_) => ErrorKind::NetworkError,
            Self::FeedParse(_) => ErrorKind::FeedParseError,
            Self::NoReleasesFound(_) => ErrorKind::NoReleasesFound,
            Self::NoInstallableAsset(_) => ErrorKind::NoInstallableAsset,
            Self::DiskFull(_) => ErrorKind::DiskFullError,
            Self::IncompleteTransfer(_) => ErrorKind::IncompleteTransfer,
            Self::ConcurrentUpdateInProgress => ErrorKind::ConcurrentUpdateInProgress,
            Self::HostDidNotExit(_) => ErrorKind::HostDidNotExit,
            Self::BackupFailed(_) => ErrorKind::BackupFailed,
            Self::InstallFailed(_) => ErrorKind::InstallFailed,
            Self::RelaunchFailed(_) => ErrorKind::RelaunchFailed,
            Self::RollbackFailed(_) => ErrorKind::RollbackFailed,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Config(_) => ErrorKind::Config,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// Returns `true` if retrying the same request later may succeed.
    ///
    /// Only transport-level failures qualify; a malformed feed or a missing
    /// asset will not fix itself between two attempts.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

impl From<std::io::Error> for UpdateError {
    fn from(e: std::io::Error) -> Self {
        if is_disk_full(&e) {
            Self::DiskFull(e.to_string())
        } else {
            Self::Io(e.to_string())
        }
    }
}

/// Returns `true` if the I/O error means the filesystem ran out of space.
pub(crate) fn is_disk_full(e: &std::io::Error) -> bool {
    if e.kind() == std::io::ErrorKind::StorageFull {
        return true;
    }
    #[cfg(unix)]
    {
        if e.raw_os_error() == Some(libc::ENOSPC) {
            return true;
        }
    }
    #[cfg(windows)]
    {
        // ERROR_DISK_FULL, ERROR_HANDLE_DISK_FULL
        if matches!(e.raw_os_error(), Some(112) | Some(39)) {
            return true;
        }
    }
    false
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, UpdateError>;
