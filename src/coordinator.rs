//! Update coordinator: drives one update cycle end to end.
//!
//! ```text
//! Idle → Checking → UpdateAvailable → Downloading → ReadyToApply → Handoff → Done
//!           │              │                │              │
//!           └──────────────┴────────────────┴──────────────┴──→ Failed / Done
//! ```
//!
//! The coordinator never downloads without confirmation, runs at most one
//! cycle at a time, and reports every transition as an [`UpdateEvent`] on a
//! broadcast channel so any presentation layer can subscribe independently.

use crate::config::{AutoUpdatePreference, UpdaterConfig};
use crate::error::UpdateError;
use crate::feed::{FeedClient, ReleaseInfo};
use crate::fetcher::{ArtifactFetcher, DownloadProgress, ProgressCallback};
use crate::handoff::{SwapLauncher, SwapRequest};
use crate::version::Version;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;

const EVENT_CAPACITY: usize = 64;

/// Terminal result of one update cycle, as reported to the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The feed's newest eligible release is not newer than this build.
    NoUpdateAvailable,
    /// The swap executor has taken over; the host is shutting down.
    UpdateApplied(Version),
    /// The user declined the update or cancelled the download.
    Cancelled,
    /// The cycle failed; update status could not be determined or applied.
    Failed(UpdateError),
}

/// Coordinator state machine phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePhase {
    Idle,
    Checking,
    UpdateAvailable,
    Downloading,
    ReadyToApply,
    Handoff,
    Done,
    Failed,
}

impl std::fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Checking => "checking",
            Self::UpdateAvailable => "update available",
            Self::Downloading => "downloading",
            Self::ReadyToApply => "ready to apply",
            Self::Handoff => "handoff",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Events emitted to subscribers.
#[derive(Debug, Clone)]
pub enum UpdateEvent {
    /// The state machine moved to a new phase.
    PhaseChanged { from: UpdatePhase, to: UpdatePhase },
    /// A newer release is waiting for `confirm_download()` or `cancel()`.
    UpdateAvailable {
        current: Version,
        release: ReleaseInfo,
    },
    /// Bytes received so far for the artifact.
    DownloadProgress(DownloadProgress),
    /// The cycle finished.
    Finished(UpdateOutcome),
}

/// Collaborator's answer to an available update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Confirm,
    Decline,
}

/// RAII holder of the "update in progress" flag.
struct CycleGuard<'a> {
    flag: &'a AtomicBool,
    held_for_process: bool,
}

impl<'a> CycleGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                flag,
                held_for_process: false,
            })
    }

    /// Keep the flag set after drop. Used once the host is shutting down.
    fn hold_for_process(&mut self) {
        self.held_for_process = true;
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        if !self.held_for_process {
            self.flag.store(false, Ordering::Release);
        }
    }
}

/// Orchestrates query → compare → confirm → fetch → handoff → shutdown.
pub struct UpdateCoordinator {
    config: UpdaterConfig,
    current: Version,
    installation: PathBuf,
    feed: FeedClient,
    fetcher: ArtifactFetcher,
    launcher: Arc<dyn SwapLauncher>,
    shutdown: CancellationToken,
    in_progress: AtomicBool,
    phase: Mutex<UpdatePhase>,
    pending_decision: Mutex<Option<oneshot::Sender<Decision>>>,
    active_cancel: Mutex<Option<CancellationToken>>,
    events: broadcast::Sender<UpdateEvent>,
}

impl UpdateCoordinator {
    /// Create a coordinator.
    ///
    /// `installation` is the path of the application executable the swap
    /// executor will replace. `shutdown` is cancelled at handoff to ask the
    /// host application to exit.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Config`] if the HTTP clients cannot be built.
    pub fn new(
        config: UpdaterConfig,
        current: Version,
        installation: PathBuf,
        launcher: Arc<dyn SwapLauncher>,
        shutdown: CancellationToken,
    ) -> crate::Result<Self> {
        let feed = FeedClient::new(config.feed.clone())?;
        let fetcher = ArtifactFetcher::new(config.download.clone(), &config.feed.user_agent)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            config,
            current,
            installation,
            feed,
            fetcher,
            launcher,
            shutdown,
            in_progress: AtomicBool::new(false),
            phase: Mutex::new(UpdatePhase::Idle),
            pending_decision: Mutex::new(None),
            active_cancel: Mutex::new(None),
            events,
        })
    }

    /// Subscribe to state-transition and progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.events.subscribe()
    }

    /// Current phase of the state machine.
    pub fn state(&self) -> UpdatePhase {
        *lock(&self.phase)
    }

    pub fn current_version(&self) -> Version {
        self.current
    }

    /// Returns `true` while a cycle holds the in-progress flag.
    pub fn is_busy(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Run one update cycle.
    ///
    /// Resolves once the cycle is finished. When a newer release exists the
    /// cycle pauses in [`UpdatePhase::UpdateAvailable`] until
    /// [`confirm_download`](Self::confirm_download) or
    /// [`cancel`](Self::cancel) is called (unless the auto-update preference
    /// is `always`).
    ///
    /// A call made while another cycle is in flight returns
    /// `Failed(ConcurrentUpdateInProgress)` immediately and changes nothing.
    pub async fn check_now(&self) -> UpdateOutcome {
        let Some(mut guard) = CycleGuard::acquire(&self.in_progress) else {
            tracing::debug!("update check rejected: another cycle is in flight");
            return UpdateOutcome::Failed(UpdateError::ConcurrentUpdateInProgress);
        };

        let cancel = CancellationToken::new();
        *lock(&self.active_cancel) = Some(cancel.clone());

        let outcome = self.run_cycle(&cancel).await;

        lock(&self.active_cancel).take();
        lock(&self.pending_decision).take();

        match &outcome {
            UpdateOutcome::UpdateApplied(version) => {
                guard.hold_for_process();
                tracing::info!(%version, "update handed off; host shutdown requested");
            }
            UpdateOutcome::Failed(e) => {
                tracing::warn!(kind = %e.kind(), "update cycle failed: {e}");
            }
            UpdateOutcome::NoUpdateAvailable => {
                tracing::info!(current = %self.current, "no update available");
            }
            UpdateOutcome::Cancelled => tracing::info!("update cancelled"),
        }

        self.emit(UpdateEvent::Finished(outcome.clone()));
        drop(guard);
        outcome
    }

    /// Confirm the pending update so the download starts.
    ///
    /// Returns `false` if no update is waiting for confirmation.
    pub fn confirm_download(&self) -> bool {
        self.decide(Decision::Confirm)
    }

    /// Decline a pending update or abort a download in progress.
    ///
    /// Returns `false` if there is nothing to cancel, which includes every
    /// point after the handoff.
    pub fn cancel(&self) -> bool {
        if self.decide(Decision::Decline) {
            return true;
        }
        match lock(&self.active_cancel).as_ref() {
            Some(token) if !token.is_cancelled() => {
                token.cancel();
                true
            }
            _ => false,
        }
    }

    fn decide(&self, decision: Decision) -> bool {
        match lock(&self.pending_decision).take() {
            Some(tx) => tx.send(decision).is_ok(),
            None => false,
        }
    }

    async fn run_cycle(&self, cancel: &CancellationToken) -> UpdateOutcome {
        self.transition(UpdatePhase::Checking);

        let release = match self.query_feed(cancel).await {
            Ok(release) => release,
            Err(UpdateError::Cancelled(_)) => return self.finish(UpdateOutcome::Cancelled),
            Err(e) => return self.fail(e),
        };

        if release.prerelease && !self.config.feed.allow_prerelease {
            tracing::info!(version = %release.version, "newest release is a pre-release; skipping");
            return self.finish(UpdateOutcome::NoUpdateAvailable);
        }

        if release.version <= self.current {
            return self.finish(UpdateOutcome::NoUpdateAvailable);
        }

        // Register the decision channel before announcing the update so a
        // subscriber reacting to the event can confirm immediately.
        let (tx, rx) = oneshot::channel();
        *lock(&self.pending_decision) = Some(tx);

        self.transition(UpdatePhase::UpdateAvailable);
        self.emit(UpdateEvent::UpdateAvailable {
            current: self.current,
            release: release.clone(),
        });
        tracing::info!(current = %self.current, latest = %release.version, "update available");

        let decision = match self.config.schedule.auto_update {
            AutoUpdatePreference::Always => {
                lock(&self.pending_decision).take();
                Decision::Confirm
            }
            AutoUpdatePreference::Ask => tokio::select! {
                () = cancel.cancelled() => Decision::Decline,
                answer = rx => answer.unwrap_or(Decision::Decline),
            },
        };

        if decision == Decision::Decline {
            return self.finish(UpdateOutcome::Cancelled);
        }

        self.transition(UpdatePhase::Downloading);
        let events = self.events.clone();
        let progress: ProgressCallback = Box::new(move |p| {
            let _ = events.send(UpdateEvent::DownloadProgress(p));
        });
        let destination = self.config.download.directory();

        let artifact = match self
            .fetcher
            .download(&release, &destination, cancel, Some(&progress))
            .await
        {
            Ok(artifact) => artifact,
            Err(UpdateError::Cancelled(_)) => return self.finish(UpdateOutcome::Cancelled),
            Err(e) => return self.fail(e),
        };

        self.transition(UpdatePhase::ReadyToApply);

        // Past this point the cycle can no longer be cancelled.
        let token = lock(&self.active_cancel).take();
        if token.is_some_and(|t| t.is_cancelled()) {
            artifact.discard();
            return self.finish(UpdateOutcome::Cancelled);
        }

        let version = artifact.release().version;
        let request = SwapRequest::new(artifact, self.installation.clone(), std::process::id());

        if let Err(e) = self.launcher.launch(&request) {
            request.discard_artifact();
            return self.fail(e);
        }

        self.transition(UpdatePhase::Handoff);
        self.shutdown.cancel();
        self.finish(UpdateOutcome::UpdateApplied(version))
    }

    /// Query the feed, retrying transient network errors with backoff.
    async fn query_feed(&self, cancel: &CancellationToken) -> crate::Result<ReleaseInfo> {
        let feed_config = self.feed.config();
        feed_config.validate_repository()?;

        let attempts = feed_config.retry_attempts.max(1);
        let mut delay = std::time::Duration::from_millis(feed_config.retry_base_delay_ms);
        let mut attempt = 1;

        loop {
            match self.feed.fetch_latest(&feed_config.repository).await {
                Ok(release) => return Ok(release),
                Err(e) if e.is_transient() && attempt < attempts => {
                    tracing::debug!(attempt, attempts, ?delay, "feed query failed, retrying: {e}");
                    tokio::select! {
                        () = cancel.cancelled() => {
                            return Err(UpdateError::Cancelled("check cancelled".to_owned()));
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn transition(&self, to: UpdatePhase) {
        let from = {
            let mut phase = lock(&self.phase);
            std::mem::replace(&mut *phase, to)
        };
        if from != to {
            tracing::info!(%from, %to, "update phase changed");
            self.emit(UpdateEvent::PhaseChanged { from, to });
        }
    }

    fn finish(&self, outcome: UpdateOutcome) -> UpdateOutcome {
        self.transition(UpdatePhase::Done);
        outcome
    }

    fn fail(&self, error: UpdateError) -> UpdateOutcome {
        self.transition(UpdatePhase::Failed);
        UpdateOutcome::Failed(error)
    }

    fn emit(&self, event: UpdateEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Run scheduled checks in the background.
    ///
    /// Waits for the configured startup delay, then checks every interval
    /// until `stop` or the host shutdown token fires, or an update has been
    /// handed off.
    pub fn spawn_scheduled_checks(
        self: &Arc<Self>,
        stop: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let schedule = coordinator.config.schedule.clone();
            let shutdown = coordinator.shutdown.clone();
            let mut wait = schedule.startup_delay();

            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(wait) => {}
                }

                match coordinator.check_now().await {
                    UpdateOutcome::UpdateApplied(_) => break,
                    UpdateOutcome::Failed(UpdateError::ConcurrentUpdateInProgress) => {
                        tracing::debug!("scheduled check skipped: cycle already running");
                    }
                    outcome => tracing::debug!(?outcome, "scheduled check finished"),
                }
                wait = schedule.interval();
            }
            tracing::debug!("scheduled update checks stopped");
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
