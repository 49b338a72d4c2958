//! Semantic Versioning
//!
//! Version parsing, ordering and the compatibility predicate shared by the
//! loader (host API checks), the resolver (versioned dependencies) and the
//! service contract registry.
//!
//! The host API version is generated at build time from
//! `package.metadata.plughost.api_version` in Cargo.toml.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{PluginError, PluginResult};

include!(concat!(env!("OUT_DIR"), "/version_api.rs"));

/// A semantic version: `major.minor.patch` with an optional pre-release tag.
///
/// Build metadata is accepted when parsing but discarded, so it never
/// participates in ordering or equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    inner: semver::Version,
}

impl Version {
    /// Create a release version
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            inner: semver::Version::new(major, minor, patch),
        }
    }

    /// Parse a version string such as `1.2.3` or `2.0.0-rc.1`
    pub fn parse(text: &str) -> PluginResult<Self> {
        let trimmed = text.trim();
        let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
        let mut inner = semver::Version::parse(trimmed).map_err(|e| {
            PluginError::invalid_parameters(format!("Invalid version '{}': {}", text, e))
                .with_context("version", text)
        })?;
        inner.build = semver::BuildMetadata::EMPTY;
        Ok(Self { inner })
    }

    pub fn major(&self) -> u64 {
        self.inner.major
    }

    pub fn minor(&self) -> u64 {
        self.inner.minor
    }

    pub fn patch(&self) -> u64 {
        self.inner.patch
    }

    /// Pre-release tag, if any
    pub fn pre(&self) -> Option<&str> {
        if self.inner.pre.is_empty() {
            None
        } else {
            Some(self.inner.pre.as_str())
        }
    }

    pub fn is_prerelease(&self) -> bool {
        !self.inner.pre.is_empty()
    }

    /// `self` satisfies `required` iff the majors match and `self >= required`.
    pub fn is_compatible_with(&self, required: &Version) -> bool {
        self.major() == required.major() && self >= required
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        // build metadata is stripped on construction, so semver precedence
        // (release > pre-release, pre-release identifiers compared by SemVer precedence)
        // is the whole ordering
        self.inner.cmp(&other.inner)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl FromStr for Version {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Version::parse(s)
    }
}

impl TryFrom<String> for Version {
    type Error = PluginError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Version::parse(&value)
    }
}

impl From<Version> for String {
    fn from(version: Version) -> Self {
        version.to_string()
    }
}

/// The plugin API version exposed by this host build
pub fn host_api_version() -> Version {
    Version::parse(HOST_API_VERSION).unwrap_or_else(|_| Version::new(0, 0, 0))
}

/// Check whether an artifact requiring `required` can run on this host
pub fn is_host_compatible(required: &Version) -> bool {
    host_api_version().is_compatible_with(required)
}
