//! Build identifiers and update ordering.
//!
//! Releases are identified either by a semantic version tag (`v1.1.0`) or by
//! a content identifier such as a commit SHA. Semantic versions are ordered
//! by semver precedence. Anything involving a content identifier is compared
//! by equality only: a revision string has no meaningful order.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BuildVersion {
    /// Semantic version, leading `v` stripped
    Semantic(semver::Version),
    /// Opaque content identifier (commit SHA, build hash)
    Revision(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionParseError {
    #[error("empty version string")]
    Empty,
    #[error("version contains whitespace: {0:?}")]
    Whitespace(String),
}

impl BuildVersion {
    /// Parse a tag or identifier. Tags like `v1.2` are padded to `1.2.0`.
    pub fn parse(raw: &str) -> Result<Self, VersionParseError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(VersionParseError::Empty);
        }
        if trimmed.chars().any(char::is_whitespace) {
            return Err(VersionParseError::Whitespace(trimmed.to_string()));
        }

        let unprefixed = match trimmed.strip_prefix(['v', 'V']) {
            Some(rest) if rest.starts_with(|c: char| c.is_ascii_digit()) => rest,
            _ => trimmed,
        };

        if let Ok(v) = semver::Version::parse(unprefixed) {
            return Ok(BuildVersion::Semantic(v));
        }
        if let Some(v) = parse_short_semver(unprefixed) {
            return Ok(BuildVersion::Semantic(v));
        }

        Ok(BuildVersion::Revision(trimmed.to_string()))
    }

    pub fn is_semantic(&self) -> bool {
        matches!(self, BuildVersion::Semantic(_))
    }
}

/// Accept `1` and `1.2` (with optional pre-release/build suffix) as `1.0.0` / `1.2.0`.
fn parse_short_semver(s: &str) -> Option<semver::Version> {
    let split_at = s.find(['-', '+']).unwrap_or(s.len());
    let (core, suffix) = s.split_at(split_at);
    let parts: Vec<&str> = core.split('.').collect();
    if parts.is_empty()
        || parts.len() > 2
        || !parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
    {
        return None;
    }

    let mut padded = parts.join(".");
    for _ in parts.len()..3 {
        padded.push_str(".0");
    }
    padded.push_str(suffix);
    semver::Version::parse(&padded).ok()
}

impl fmt::Display for BuildVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildVersion::Semantic(v) => write!(f, "{}", v),
            BuildVersion::Revision(r) => f.write_str(r),
        }
    }
}

impl FromStr for BuildVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for BuildVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BuildVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        BuildVersion::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Whether `latest` should replace `current`.
///
/// No recorded version is the minimum element, so a first-run device always
/// reports an update. Two semantic versions compare by precedence, build
/// metadata ignored; any pair involving a content identifier is an update
/// iff the identifiers differ.
pub fn is_update_available(current: Option<&BuildVersion>, latest: &BuildVersion) -> bool {
    match (current, latest) {
        (None, _) => true,
        (Some(BuildVersion::Semantic(cur)), BuildVersion::Semantic(new)) => {
            without_build(new) > without_build(cur)
        }
        (Some(BuildVersion::Revision(cur)), BuildVersion::Revision(new)) => {
            !cur.eq_ignore_ascii_case(new)
        }
        (Some(cur), new) => {
            // Mixed schemes: never coerced into an order
            !cur.to_string().eq_ignore_ascii_case(&new.to_string())
        }
    }
}

/// Build metadata takes no part in semver precedence.
fn without_build(v: &semver::Version) -> semver::Version {
    semver::Version {
        build: semver::BuildMetadata::EMPTY,
        ..v.clone()
    }
}
