use std::{fmt, sync::OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{errors::Error, Result};

fn repository_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.-]+/[A-Za-z0-9_.-]+$").expect("valid regex"))
}

/// Repository identifier in `owner/name` form.
///
/// Only constructed through [`RepositoryId::parse`], so every value in the
/// registry has already passed validation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RepositoryId(String);

impl RepositoryId {
    /// Input is taken as is: surrounding whitespace makes it invalid. `.` and `..`
    /// segments are rejected because they would change the API path.
    pub fn parse(raw: &str) -> Result<Self> {
        let dot_segment = raw.split('/').any(|seg| seg == "." || seg == "..");
        if repository_pattern().is_match(raw) && !dot_segment {
            Ok(Self(raw.to_string()))
        } else {
            Err(Error::InvalidRepository(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Browser link for the repository (used in replies for invalid input too).
    pub fn web_url(raw: &str) -> String {
        format!("https://github.com/{raw}")
    }
}

impl TryFrom<String> for RepositoryId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<RepositoryId> for String {
    fn from(value: RepositoryId) -> Self {
        value.0
    }
}

impl fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Chat id of a delivery target (numeric, Telegram chat ids are signed).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DestinationId(pub i64);

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Commit SHA (opaque).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionHash(pub String);

impl fmt::Display for RevisionHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Summary of the newest revision of a repository.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RevisionInfo {
    pub message: String,
    pub author: String,
    pub hash: RevisionHash,
}

/// A watched repository and the destinations that asked for it, in
/// registration order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchEntry {
    pub repo: RepositoryId,
    pub destinations: Vec<DestinationId>,
}

/// Ordered registry snapshot; the unit of persistence.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WatchSnapshot {
    pub entries: Vec<WatchEntry>,
}

impl WatchSnapshot {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
