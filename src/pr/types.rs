use chrono::{DateTime, Utc};

/// An open pull request as reported by a [`super::PullRequestSource`].
///
/// Event flags (`base_ref_changed`, `reopened`, ...) are relative to the
/// watermark the pull request was listed with.
#[derive(Debug, Clone, Default)]
pub struct PullRequest {
    /// PR number (e.g., 42)
    pub number: u64,
    pub title: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub base_ref: GitRef,
    pub head_ref: GitRef,
    /// Commit history, oldest first. Listing only returns the head commit.
    pub commits: Vec<Commit>,
    /// Changed file paths, filled in by the path filter when patterns are configured
    pub files: Vec<String>,
    pub labels: Vec<String>,
    pub approved_review_count: u32,
    /// Head branch lives in a fork
    pub is_cross_repository: bool,
    pub base_ref_changed: bool,
    pub base_ref_force_pushed: bool,
    pub head_ref_force_pushed: bool,
    pub reopened: bool,
    /// A `[ci build]` comment was posted
    pub ci_build_requested: bool,
}

impl PullRequest {
    /// The most recent commit on the head branch, if the source reported any.
    pub fn head_commit(&self) -> Option<&Commit> {
        self.commits.last()
    }
}

/// A branch name and the commit it points at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitRef {
    pub name: String,
    pub oid: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub oid: String,
    pub message: String,
    pub committed_at: DateTime<Utc>,
}

/// Owner and name of a GitHub repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    pub owner: String,
    pub name: String,
}
