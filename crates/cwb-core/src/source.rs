use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{RepositoryId, RevisionInfo};

/// Why the latest revision of a repository could not be fetched.
///
/// Every variant is recoverable: the poll loop reports it to the destinations and
/// tries again on the next cycle.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// Client error other than rate limiting (unknown or private repository, bad auth).
    #[error("repository not found or not accessible (HTTP {status})")]
    NotFound { status: u16 },

    /// The API quota is exhausted until `retry_after`.
    #[error("rate limited until {retry_after}")]
    RateLimited { retry_after: DateTime<Utc> },

    /// Network failure, timeout or upstream server error.
    #[error("transport error: {0}")]
    Transport(String),

    /// The response did not contain a usable revision.
    #[error("malformed response: {0}")]
    Malformed(String),
}

pub type FetchResult = std::result::Result<RevisionInfo, FetchError>;

/// Port for the external revision API.
///
/// One outbound request per call and no sleeping; throttling belongs to the caller.
#[async_trait]
pub trait RevisionSource: Send + Sync {
    async fn fetch_latest(&self, repo: &RepositoryId) -> FetchResult;
}
