use glob::{MatchOptions, Pattern};
use tracing::{debug, instrument};

use super::types::Version;
use super::ResolveError;
use crate::pr::{PullRequest, PullRequestSource};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// A compiled include or ignore pattern.
///
/// Matches a path either as a glob or, when the pattern names a
/// directory, any path beneath it.
#[derive(Debug, Clone)]
pub struct PathPattern {
    glob: Pattern,
    dir_prefix: String,
}

impl PathPattern {
    pub fn new(pattern: &str) -> Result<Self, ResolveError> {
        let glob = Pattern::new(pattern).map_err(|source| ResolveError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self {
            glob,
            dir_prefix: format!("{}/", pattern.trim_end_matches('/')),
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        self.glob.matches_with(path, MATCH_OPTIONS) || path.starts_with(&self.dir_prefix)
    }
}

/// Include and ignore patterns for one check.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    include: Vec<PathPattern>,
    ignore: Vec<PathPattern>,
}

impl PathFilter {
    pub fn new(paths: &[String], ignore_paths: &[String]) -> Result<Self, ResolveError> {
        let compile = |patterns: &[String]| {
            patterns
                .iter()
                .map(|p| PathPattern::new(p))
                .collect::<Result<Vec<_>, _>>()
        };
        Ok(Self {
            include: compile(paths)?,
            ignore: compile(ignore_paths)?,
        })
    }

    /// Include patterns are configured and none of `files` match any of them.
    pub fn excluded_by_paths(&self, files: &[String]) -> bool {
        !self.include.is_empty() && !files.iter().any(|f| matches_any(&self.include, f))
    }

    /// Ignore patterns are configured and every one of `files` matches one.
    ///
    /// An empty file list is never ignored: no files usually means the diff
    /// could not be attributed, not that only ignored files changed.
    pub fn excluded_by_ignore_paths(&self, files: &[String]) -> bool {
        !self.ignore.is_empty()
            && !files.is_empty()
            && files.iter().all(|f| matches_any(&self.ignore, f))
    }
}

fn matches_any(patterns: &[PathPattern], path: &str) -> bool {
    patterns.iter().any(|p| p.matches(path))
}

/// Collect the files a pull request changed since `previous`.
///
/// When `previous` is the sentinel or another pull request, this is the
/// whole pull request's file list. When it is the same pull request, only
/// the commits after `previous.commit` are diffed; if that commit is no
/// longer in the history (rewritten branch) the result is empty.
/// Paths may repeat across commits.
#[instrument(skip_all, fields(pr = pr.number, previous = previous.pr))]
pub async fn changed_files(
    pr: &PullRequest,
    previous: &Version,
    source: &dyn PullRequestSource,
) -> Result<Vec<String>, ResolveError> {
    if previous.is_sentinel() || pr.number != previous.pr {
        debug!("diffing whole pull request");
        return source
            .changed_files(pr.number)
            .await
            .map_err(|source| ResolveError::ChangedFiles { number: pr.number, source });
    }

    let full = source
        .pull_request(pr.number, &pr.head_ref.oid)
        .await
        .map_err(|source| ResolveError::PullRequest { number: pr.number, source })?;

    let Some(position) = full.commits.iter().position(|c| c.oid == previous.commit) else {
        debug!(commit = %previous.commit, "previous commit not in history");
        return Ok(Vec::new());
    };

    let mut files = Vec::new();
    for commit in &full.commits[position + 1..] {
        debug!(commit = %commit.oid, "diffing commit");
        let changed = source
            .commit_changed_files(&commit.oid)
            .await
            .map_err(|source| ResolveError::CommitChangedFiles {
                sha: commit.oid.clone(),
                source,
            })?;
        files.extend(changed);
    }

    Ok(files)
}
