//! Semantic version parsing and comparison.
//!
//! Only the strict `major.minor.patch` shape is accepted. Anything else is an
//! [`UpdateError::InvalidVersionFormat`], which callers must treat as "cannot
//! determine update status" rather than "update available".

use crate::error::{Result, UpdateError};
use std::cmp::Ordering;

/// An ordered `(major, minor, patch)` triple.
///
/// Field order matters: the derived `Ord` compares lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse a version string such as `"1.2.0"` or `"v1.2.0"`.
    ///
    /// A single leading non-digit character is stripped. Exactly three
    /// dot-separated non-negative integers must follow.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::InvalidVersionFormat`] for any other shape.
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || UpdateError::InvalidVersionFormat(format!("{s:?}"));

        let trimmed = s.trim();
        let body = match trimmed.chars().next() {
            Some(c) if !c.is_ascii_digit() => &trimmed[c.len_utf8()..],
            Some(_) => trimmed,
            None => return Err(invalid()),
        };

        let mut parts = body.split('.');
        let mut next = || -> Result<u64> {
            let part = parts.next().ok_or_else(invalid)?;
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            part.parse().map_err(|_| invalid())
        };

        let major = next()?;
        let minor = next()?;
        let patch = next()?;

        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Self::new(major, minor, patch))
    }

    /// The version of this crate, set at build time.
    ///
    /// # Errors
    ///
    /// Returns an error only if `CARGO_PKG_VERSION` carries pre-release or
    /// build metadata, which the updater cannot compare.
    pub fn current() -> Result<Self> {
        Self::parse(env!("CARGO_PKG_VERSION"))
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl std::str::FromStr for Version {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Compare two version strings.
///
/// # Errors
///
/// Returns [`UpdateError::InvalidVersionFormat`] if either side fails to parse.
pub fn compare(a: &str, b: &str) -> Result<Ordering> {
    Ok(Version::parse(a)?.cmp(&Version::parse(b)?))
}
