pub mod github;
pub mod types;

pub use types::{Commit, GitRef, PullRequest, Repository};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("GitHub API request failed: {0}")]
    Api(#[from] reqwest::Error),

    #[error("GitHub GraphQL query failed: {0}")]
    GraphQl(String),

    #[error("Invalid repository: {0}")]
    InvalidRepository(String),

    #[error("GitHub token not found in source, config file or environment")]
    MissingToken,
}

/// Everything the resolver needs to know about a repository's pull requests.
///
/// Implementations must be Send + Sync; the resolver awaits one call at a time.
#[async_trait]
pub trait PullRequestSource: Send + Sync {
    /// Open pull requests updated at or after `since`.
    async fn list_open_pull_requests(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<PullRequest>, SourceError>;

    /// Every file changed by the pull request as a whole.
    async fn changed_files(&self, number: u64) -> Result<Vec<String>, SourceError>;

    /// Files changed by a single commit.
    async fn commit_changed_files(&self, sha: &str) -> Result<Vec<String>, SourceError>;

    /// A single pull request with its full commit history, oldest first.
    async fn pull_request(&self, number: u64, head_sha: &str)
        -> Result<PullRequest, SourceError>;
}

/// Parse a repository slug into owner and name.
///
/// Accepts `owner/name` or `https://github.com/owner/name`.
pub fn parse_repository(slug: &str) -> Result<Repository, SourceError> {
    let invalid = || SourceError::InvalidRepository(slug.to_string());

    let path = match reqwest::Url::parse(slug) {
        Ok(url) => {
            if url.host_str() != Some("github.com") {
                return Err(invalid());
            }
            url.path().to_string()
        }
        Err(_) => slug.to_string(),
    };

    let segments: Vec<_> = path
        .trim_matches('/')
        .trim_end_matches(".git")
        .split('/')
        .collect();

    if segments.len() != 2 || segments.iter().any(|s| s.is_empty()) {
        return Err(invalid());
    }

    Ok(Repository {
        owner: segments[0].to_string(),
        name: segments[1].to_string(),
    })
}
