//! GitHub adapter (latest commit lookup).
//!
//! Implements the `cwb-core` RevisionSource port over `GET /repos/{repo}/commits`.
//! Status codes and rate-limit headers are mapped into `FetchError`; the client
//! never sleeps or retries on its own.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use reqwest::header::{HeaderMap, ACCEPT};
use serde::Deserialize;
use tracing::debug;

use cwb_core::{
    config::{Config, DEFAULT_GITHUB_API_BASE},
    domain::{RepositoryId, RevisionHash, RevisionInfo},
    errors::Error,
    source::{FetchError, FetchResult, RevisionSource},
    Result,
};

#[derive(Clone, Debug)]
pub struct GitHubConfig {
    pub api_base: String,
    pub token: Option<String>,
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_GITHUB_API_BASE.to_string(),
            token: None,
            timeout: Duration::from_secs(10),
            user_agent: format!("cwb/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl GitHubConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            api_base: cfg.github_api_base.clone(),
            token: cfg.github_token.clone(),
            timeout: cfg.fetch_timeout,
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug)]
pub struct GitHubClient {
    cfg: GitHubConfig,
    http: reqwest::Client,
}

impl GitHubClient {
    pub fn new(cfg: GitHubConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .user_agent(cfg.user_agent.clone())
            .build()
            .map_err(|e| Error::External(format!("http client build error: {e}")))?;
        Ok(Self { cfg, http })
    }

    fn commits_url(&self, repo: &RepositoryId) -> String {
        format!(
            "{}/repos/{}/commits?per_page=1",
            self.cfg.api_base.trim_end_matches('/'),
            repo
        )
    }
}

#[async_trait]
impl RevisionSource for GitHubClient {
    async fn fetch_latest(&self, repo: &RepositoryId) -> FetchResult {
        let mut req = self
            .http
            .get(self.commits_url(repo))
            .header(ACCEPT, "application/vnd.github+json");
        if let Some(token) = &self.cfg.token {
            req = req.bearer_auth(token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| FetchError::Transport(format!("github request error: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            debug!(repo = %repo, status = status.as_u16(), "github returned an error status");
            return Err(classify_failure(status.as_u16(), resp.headers(), Utc::now()));
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| FetchError::Transport(format!("github body error: {e}")))?;
        parse_latest(&body)
    }
}

#[derive(Deserialize)]
struct CommitItem {
    sha: String,
    commit: CommitDetail,
}

#[derive(Deserialize)]
struct CommitDetail {
    message: String,
    author: Option<CommitAuthor>,
}

#[derive(Deserialize)]
struct CommitAuthor {
    name: String,
}

/// Take the newest entry of a commits listing.
pub fn parse_latest(body: &[u8]) -> FetchResult {
    let items: Vec<CommitItem> = serde_json::from_slice(body)
        .map_err(|e| FetchError::Malformed(format!("unexpected commits payload: {e}")))?;
    let Some(first) = items.into_iter().next() else {
        return Err(FetchError::Malformed("commit list is empty".to_string()));
    };
    let Some(author) = first.commit.author else {
        return Err(FetchError::Malformed("commit has no author".to_string()));
    };
    if first.sha.trim().is_empty() {
        return Err(FetchError::Malformed("commit has an empty sha".to_string()));
    }

    Ok(RevisionInfo {
        message: first.commit.message,
        author: author.name,
        hash: RevisionHash(first.sha),
    })
}

/// Map a non-2xx response onto a `FetchError`.
///
/// 429, or 403 carrying rate-limit headers, is `RateLimited`; other 4xx are
/// `NotFound`; anything else is treated as a transient upstream failure.
pub fn classify_failure(status: u16, headers: &HeaderMap, now: DateTime<Utc>) -> FetchError {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim().to_string())
    };
    let remaining = header("x-ratelimit-remaining");
    let reset = header("x-ratelimit-reset").and_then(|s| s.parse::<i64>().ok());
    let retry_after_secs = header("retry-after").and_then(|s| s.parse::<i64>().ok());

    let quota_exhausted = remaining.as_deref() == Some("0") || retry_after_secs.is_some();
    if status == 429 || (status == 403 && quota_exhausted) {
        let retry_after = reset
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .or_else(|| {
                retry_after_secs
                    .filter(|secs| *secs >= 0)
                    .and_then(TimeDelta::try_seconds)
                    .and_then(|delta| now.checked_add_signed(delta))
            })
            .unwrap_or(now);
        return FetchError::RateLimited { retry_after };
    }

    if (400..500).contains(&status) {
        return FetchError::NotFound { status };
    }

    FetchError::Transport(format!("github returned HTTP {status}"))
}
