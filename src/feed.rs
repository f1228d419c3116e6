//! Release feed client.
//!
//! Queries a GitHub-compatible releases endpoint, takes the newest entry as
//! published by the feed (no re-sorting by version) and picks its single
//! installable asset. The client never retries and never writes to disk;
//! retry policy belongs to the coordinator.

use crate::config::FeedConfig;
use crate::error::{Result, UpdateError};
use crate::version::Version;
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// A published release, reduced to what the updater needs.
///
/// Built once from the feed's newest entry and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseInfo {
    /// Parsed version of the release tag.
    pub version: Version,
    /// Raw tag name (e.g. `"v1.2.0"`).
    pub tag: String,
    /// Release notes, presented verbatim by the UI.
    pub notes: String,
    /// Direct download URL of the installable asset.
    pub asset_url: String,
    /// Filename of the installable asset.
    pub asset_name: String,
    /// Asset size advertised by the feed, if any.
    pub asset_size: Option<u64>,
    /// Whether the feed flags this entry as a pre-release.
    pub prerelease: bool,
    /// Publication time, if the feed reports one.
    pub published_at: Option<DateTime<Utc>>,
}

/// Release entry as returned by the feed API.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedRelease {
    pub tag_name: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub prerelease: bool,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub assets: Vec<FeedAsset>,
}

/// A single downloadable file attached to a release.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedAsset {
    pub name: String,
    pub browser_download_url: String,
    #[serde(default)]
    pub size: Option<u64>,
}

/// Select the one asset whose name ends in an accepted suffix.
///
/// Suffix matching is case-insensitive.
///
/// # Errors
///
/// Returns [`UpdateError::NoInstallableAsset`] when no asset or more than one
/// asset matches; the client never guesses a priority order.
pub fn select_installable_asset<'a>(
    assets: &'a [FeedAsset],
    accepted_suffixes: &[String],
) -> Result<&'a FeedAsset> {
    let suffixes: Vec<String> = accepted_suffixes
        .iter()
        .map(|s| s.to_ascii_lowercase())
        .collect();

    let mut candidates = assets.iter().filter(|asset| {
        let name = asset.name.to_ascii_lowercase();
        suffixes.iter().any(|suffix| name.ends_with(suffix.as_str()))
    });

    match (candidates.next(), candidates.next()) {
        (Some(asset), None) => Ok(asset),
        (None, _) => Err(UpdateError::NoInstallableAsset(format!(
            "none of {} assets ends in {}",
            assets.len(),
            accepted_suffixes.join(" / ")
        ))),
        (Some(first), Some(second)) => Err(UpdateError::NoInstallableAsset(format!(
            "ambiguous installable assets: {} and {} (plus {} more)",
            first.name,
            second.name,
            candidates.count()
        ))),
    }
}

impl FeedRelease {
    /// Convert the raw entry into a [`ReleaseInfo`].
    ///
    /// # Errors
    ///
    /// Fails with [`UpdateError::InvalidVersionFormat`] if the tag is not a
    /// `major.minor.patch` version and with
    /// [`UpdateError::NoInstallableAsset`] if asset selection fails.
    pub fn into_release_info(self, accepted_suffixes: &[String]) -> Result<ReleaseInfo> {
        let version = Version::parse(&self.tag_name)?;
        let asset = select_installable_asset(&self.assets, accepted_suffixes)?;

        Ok(ReleaseInfo {
            version,
            notes: self.body.clone().unwrap_or_default(),
            asset_url: asset.browser_download_url.clone(),
            asset_name: asset.name.clone(),
            asset_size: asset.size,
            prerelease: self.prerelease,
            published_at: self.published_at,
            tag: self.tag_name,
        })
    }
}

/// Stateless client for the release feed.
#[derive(Debug, Clone)]
pub struct FeedClient {
    client: reqwest::Client,
    config: FeedConfig,
}

impl FeedClient {
    /// Create a client from the feed configuration.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Config`] if the HTTP client cannot be built.
    pub fn new(config: FeedConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout())
            .build()
            .map_err(|e| UpdateError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    /// Releases endpoint for a repository.
    pub fn releases_url(&self, repository: &str) -> String {
        format!(
            "{}/repos/{}/releases",
            self.config.api_base.trim_end_matches('/'),
            repository.trim()
        )
    }

    /// Fetch the newest release entry and its installable asset.
    ///
    /// # Errors
    ///
    /// - [`UpdateError::Network`] on transport failures, timeouts, throttling
    ///   (403/429) and server errors.
    /// - [`UpdateError::NoReleasesFound`] on 404 or an empty list.
    /// - [`UpdateError::FeedParse`] if the body is not a release list.
    /// - [`UpdateError::InvalidVersionFormat`] if the newest tag is not a version.
    /// - [`UpdateError::NoInstallableAsset`] if asset selection fails.
    pub async fn fetch_latest(&self, repository: &str) -> Result<ReleaseInfo> {
        let url = self.releases_url(repository);
        tracing::debug!(%url, "querying release feed");

        let response = self
            .client
            .get(&url)
            .query(&[("per_page", "1")])
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| network_error(&url, &e))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(UpdateError::NoReleasesFound(format!(
                "feed for {repository} returned 404"
            )));
        }
        if status == reqwest::StatusCode::FORBIDDEN
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        {
            return Err(UpdateError::Network(format!(
                "release feed throttled the request (HTTP {status})"
            )));
        }
        if !status.is_success() {
            return Err(UpdateError::Network(format!(
                "release feed returned HTTP {status}"
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| network_error(&url, &e))?;

        let releases: Vec<FeedRelease> = serde_json::from_slice(&body)
            .map_err(|e| UpdateError::FeedParse(format!("cannot decode release list: {e}")))?;

        let latest = releases.into_iter().next().ok_or_else(|| {
            UpdateError::NoReleasesFound(format!("{repository} has no published releases"))
        })?;

        let info = latest.into_release_info(&self.config.accepted_suffixes)?;
        tracing::info!(
            version = %info.version,
            asset = %info.asset_name,
            prerelease = info.prerelease,
            "newest release found"
        );
        Ok(info)
    }
}

fn network_error(url: &str, e: &reqwest::Error) -> UpdateError {
    if e.is_timeout() {
        UpdateError::Network(format!("request to {url} timed out"))
    } else if e.is_decode() {
        UpdateError::FeedParse(format!("cannot read response from {url}: {e}"))
    } else {
        UpdateError::Network(format!("request to {url} failed: {e}"))
    }
}
