//! fnb-updater: self-update orchestration for the F&B management desktop app.
//!
//! The running application checks a GitHub-compatible release feed, downloads
//! a newer build after the user confirms, then hands off to a separate swap
//! executor process that replaces the installation once the application has
//! exited:
//! Feed → Compare → Confirm → Download → Handoff → (host exits) → Swap → Relaunch
//!
//! # Architecture
//!
//! - **Version comparator** ([`version`]): parses `major.minor.patch` tags
//! - **Release feed client** ([`feed`]): finds the newest release and its asset
//! - **Artifact fetcher** ([`fetcher`]): streams the asset to disk, verified
//! - **Update coordinator** ([`coordinator`]): the host-side state machine
//! - **Swap executor** ([`executor`]): backup, install, relaunch, rollback

pub mod app_dirs;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod feed;
pub mod fetcher;
pub mod handoff;
pub mod logging;
pub mod version;

pub use config::UpdaterConfig;
pub use coordinator::{UpdateCoordinator, UpdateEvent, UpdateOutcome, UpdatePhase};
pub use error::{ErrorKind, Result, UpdateError};
pub use executor::{SwapArgs, SwapExecutor, SwapOutcome};
pub use feed::{FeedClient, ReleaseInfo};
pub use fetcher::{ArtifactFetcher, DownloadProgress, DownloadedArtifact};
pub use handoff::{ProcessLauncher, SwapLauncher, SwapRequest};
pub use version::Version;
