pub mod filters;
pub mod paths;
pub mod types;

pub use types::{CheckRequest, CheckResponse, Source, Version};

use chrono::{DateTime, Months, Utc};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::pr::{PullRequestSource, SourceError};
use paths::PathFilter;

/// How far back the very first check looks for pull requests.
const FIRST_RUN_LOOKBACK: Months = Months::new(36);

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Failed to list open pull requests: {0}")]
    ListPullRequests(#[source] SourceError),

    #[error("Failed to list changed files of pull request #{number}: {source}")]
    ChangedFiles { number: u64, source: SourceError },

    #[error("Failed to list changed files of commit {sha}: {source}")]
    CommitChangedFiles { sha: String, source: SourceError },

    #[error("Failed to fetch pull request #{number}: {source}")]
    PullRequest { number: u64, source: SourceError },

    #[error("Invalid path pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        source: glob::PatternError,
    },
}

/// Resolve which open pull requests are new versions since `request.version`.
///
/// Pull requests are evaluated one at a time in the order the source lists
/// them. Any source failure aborts the whole check.
#[instrument(skip_all, fields(previous = request.version.pr))]
pub async fn check(
    request: &CheckRequest,
    source: &dyn PullRequestSource,
) -> Result<CheckResponse, ResolveError> {
    let path_filter = PathFilter::new(&request.source.paths, &request.source.ignore_paths)?;

    let since = watermark(&request.version, Utc::now());
    let pulls = source
        .list_open_pull_requests(since)
        .await
        .map_err(ResolveError::ListPullRequests)?;
    info!(count = pulls.len(), since = %since, "total pulls found");

    let mut response = CheckResponse::default();
    for mut pr in pulls {
        debug!(
            pr = pr.number,
            url = %pr.url,
            head = %pr.head_ref.name,
            sha = %pr.head_ref.oid,
            updated = %pr.updated_at,
            "evaluating pull request"
        );
        if !filters::is_new_version(request, &pr) {
            continue;
        }

        if request.source.has_path_patterns() {
            pr.files = paths::changed_files(&pr, &request.version, source).await?;
            debug!(pr = pr.number, files = ?pr.files, "changed files found");

            if path_filter.excluded_by_paths(&pr.files) {
                debug!(pr = pr.number, "excluded by paths");
                continue;
            }
            if path_filter.excluded_by_ignore_paths(&pr.files) {
                debug!(pr = pr.number, "excluded by ignore_paths");
                continue;
            }
        }

        response.push(Version::from(&pr));
    }

    response.sort_by_updated();

    if response.is_empty() && !request.version.is_sentinel() {
        info!(version = %request.version, "no new versions, keeping previous");
        response.push(request.version.clone());
    }

    if request.version.is_sentinel() {
        if let Some(latest) = response.0.pop() {
            response = CheckResponse(vec![latest]);
        }
    }

    info!(count = response.len(), "versions resolved");
    for version in response.versions() {
        debug!(version = %version, "resolved version");
    }

    Ok(response)
}

/// The timestamp pull requests must have been updated after.
fn watermark(previous: &Version, now: DateTime<Utc>) -> DateTime<Utc> {
    previous.watermark().unwrap_or_else(|| {
        now.checked_sub_months(FIRST_RUN_LOOKBACK)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    })
}

#[cfg(test)]
mod tests {
    use super::filters::tests::{at, test_pull_request};
    use super::*;
    use crate::pr::{Commit, PullRequest};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory source with canned answers and call counting.
    #[derive(Default)]
    struct FakeSource {
        pulls: Vec<PullRequest>,
        pr_files: HashMap<u64, Vec<String>>,
        commit_files: HashMap<String, Vec<String>>,
        histories: HashMap<u64, Vec<Commit>>,
        fail_list: bool,
        fail_changed_files: bool,
        fail_pull_request: bool,
        /// Commit whose file listing fails
        fail_commit_files: Option<String>,
        calls: Mutex<Calls>,
    }

    #[derive(Debug, Default, Clone)]
    struct Calls {
        list_since: Vec<DateTime<Utc>>,
        changed_files: Vec<u64>,
        commit_changed_files: Vec<String>,
        pull_request: Vec<u64>,
    }

    impl FakeSource {
        fn with_pulls(pulls: Vec<PullRequest>) -> Self {
            Self { pulls, ..Self::default() }
        }

        fn calls(&self) -> Calls {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PullRequestSource for FakeSource {
        async fn list_open_pull_requests(
            &self,
            since: DateTime<Utc>,
        ) -> Result<Vec<PullRequest>, SourceError> {
            self.calls.lock().unwrap().list_since.push(since);
            if self.fail_list {
                return Err(SourceError::GraphQl("rate limited".to_string()));
            }
            Ok(self.pulls.clone())
        }

        async fn changed_files(&self, number: u64) -> Result<Vec<String>, SourceError> {
            self.calls.lock().unwrap().changed_files.push(number);
            if self.fail_changed_files {
                return Err(SourceError::MissingToken);
            }
            Ok(self.pr_files.get(&number).cloned().unwrap_or_default())
        }

        async fn commit_changed_files(&self, sha: &str) -> Result<Vec<String>, SourceError> {
            self.calls.lock().unwrap().commit_changed_files.push(sha.to_string());
            if self.fail_commit_files.as_deref() == Some(sha) {
                return Err(SourceError::GraphQl("commit not found".to_string()));
            }
            Ok(self.commit_files.get(sha).cloned().unwrap_or_default())
        }

        async fn pull_request(
            &self,
            number: u64,
            _head_sha: &str,
        ) -> Result<PullRequest, SourceError> {
            self.calls.lock().unwrap().pull_request.push(number);
            if self.fail_pull_request {
                return Err(SourceError::InvalidRepository("org/gone".to_string()));
            }
            let mut pr = test_pull_request(number, 0);
            pr.commits = self.histories.get(&number).cloned().unwrap_or_default();
            Ok(pr)
        }
    }

    fn previous(pr: u64, commit: &str, hour: u32) -> Version {
        Version { pr, commit: commit.to_string(), updated_date: at(hour) }
    }

    fn request(version: Version) -> CheckRequest {
        CheckRequest { source: Source::default(), version }
    }

    fn commit(oid: &str) -> Commit {
        Commit { oid: oid.to_string(), message: String::new(), committed_at: at(1) }
    }

    fn files(paths: &[&str]) -> Vec<String> {
        paths.iter().map(|p| p.to_string()).collect()
    }

    fn prs(response: &CheckResponse) -> Vec<u64> {
        response.versions().iter().map(|v| v.pr).collect()
    }

    #[tokio::test]
    async fn test_first_run_returns_only_latest() {
        let source = FakeSource::with_pulls(vec![test_pull_request(1, 3), test_pull_request(2, 5)]);
        let response = check(&request(Version::default()), &source).await.unwrap();

        assert_eq!(response.len(), 1);
        assert_eq!(response.versions()[0], Version::from(&test_pull_request(2, 5)));
        assert_eq!(response.versions()[0].commit, "sha-2");
        assert_eq!(source.calls().list_since.len(), 1);
    }

    #[tokio::test]
    async fn test_first_run_looks_back_three_years() {
        let source = FakeSource::default();
        let response = check(&request(Version::default()), &source).await.unwrap();
        assert!(response.is_empty());

        let since = source.calls().list_since[0];
        let lookback = Utc::now() - since;
        assert!(lookback.num_days() >= 365 * 3 - 1);
        assert!(lookback.num_days() <= 365 * 3 + 2);
    }

    #[tokio::test]
    async fn test_watermark_comes_from_previous_version() {
        let source = FakeSource::default();
        check(&request(previous(5, "abc", 4)), &source).await.unwrap();
        assert_eq!(source.calls().list_since, vec![at(4)]);
    }

    #[tokio::test]
    async fn test_nothing_new_echoes_previous() {
        let source = FakeSource::with_pulls(vec![test_pull_request(1, 2)]);
        let prior = previous(5, "abc", 4);
        let response = check(&request(prior.clone()), &source).await.unwrap();
        assert_eq!(response, CheckResponse(vec![prior]));
    }

    #[tokio::test]
    async fn test_new_versions_sorted_by_update_time() {
        let source = FakeSource::with_pulls(vec![
            test_pull_request(3, 9),
            test_pull_request(1, 6),
            test_pull_request(4, 6),
            test_pull_request(2, 7),
            test_pull_request(7, 1),
        ]);
        let response = check(&request(previous(5, "abc", 4)), &source).await.unwrap();
        assert_eq!(prs(&response), vec![1, 4, 2, 3]);
    }

    #[tokio::test]
    async fn test_list_failure_is_fatal() {
        let source = FakeSource { fail_list: true, ..FakeSource::default() };
        let err = check(&request(previous(5, "abc", 4)), &source).await.unwrap_err();
        assert!(matches!(err, ResolveError::ListPullRequests(_)));
    }

    #[tokio::test]
    async fn test_changed_files_failure_is_fatal() {
        let mut source = FakeSource::with_pulls(vec![test_pull_request(1, 6)]);
        source.fail_changed_files = true;
        let mut req = request(previous(5, "abc", 4));
        req.source.paths = files(&["src/**"]);
        let err = check(&req, &source).await.unwrap_err();
        assert!(matches!(err, ResolveError::ChangedFiles { number: 1, .. }));
    }

    #[tokio::test]
    async fn test_pull_request_lookup_failure_is_fatal() {
        let mut source = FakeSource::with_pulls(vec![test_pull_request(5, 6)]);
        source.fail_pull_request = true;
        let mut req = request(previous(5, "c", 4));
        req.source.paths = files(&["src/"]);

        let err = check(&req, &source).await.unwrap_err();
        assert!(matches!(err, ResolveError::PullRequest { number: 5, .. }));
        assert!(source.calls().commit_changed_files.is_empty());
    }

    #[tokio::test]
    async fn test_commit_files_failure_stops_incremental_diff() {
        let mut source = FakeSource::with_pulls(vec![test_pull_request(5, 6)]);
        source.histories.insert(5, vec![commit("c"), commit("d"), commit("e"), commit("f")]);
        source.commit_files.insert("d".to_string(), files(&["src/d.rs"]));
        source.fail_commit_files = Some("e".to_string());
        let mut req = request(previous(5, "c", 4));
        req.source.ignore_paths = files(&["docs/"]);

        let err = check(&req, &source).await.unwrap_err();
        match err {
            ResolveError::CommitChangedFiles { sha, .. } => assert_eq!(sha, "e"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(source.calls().commit_changed_files, vec!["d", "e"]);
    }

    #[tokio::test]
    async fn test_invalid_pattern_fails_before_listing() {
        let source = FakeSource::default();
        let mut req = request(Version::default());
        req.source.ignore_paths = files(&["[oops"]);
        assert!(check(&req, &source).await.is_err());
        assert!(source.calls().list_since.is_empty());
    }

    #[tokio::test]
    async fn test_paths_include_only_matching_pulls() {
        let mut source = FakeSource::with_pulls(vec![test_pull_request(1, 6), test_pull_request(2, 7)]);
        source.pr_files.insert(1, files(&["src/lib.rs", "README.md"]));
        source.pr_files.insert(2, files(&["README.md"]));
        let mut req = request(previous(5, "abc", 4));
        req.source.paths = files(&["src/**"]);

        let response = check(&req, &source).await.unwrap();
        assert_eq!(prs(&response), vec![1]);
        assert_eq!(source.calls().changed_files, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_ignore_paths_need_every_file_to_match() {
        let mut source = FakeSource::with_pulls(vec![
            test_pull_request(1, 6),
            test_pull_request(2, 7),
            test_pull_request(3, 8),
        ]);
        source.pr_files.insert(1, files(&["docs/a.md", "docs/b.md"]));
        source.pr_files.insert(2, files(&["docs/a.md", "docs/b.md", "src/main.rs"]));
        let mut req = request(previous(5, "abc", 4));
        req.source.ignore_paths = files(&["docs/"]);

        let response = check(&req, &source).await.unwrap();
        // #3 has no known changed files and is kept.
        assert_eq!(prs(&response), vec![2, 3]);
    }

    #[tokio::test]
    async fn test_all_excluded_by_paths_echoes_previous() {
        let mut source = FakeSource::with_pulls(vec![test_pull_request(1, 6)]);
        source.pr_files.insert(1, files(&["README.md"]));
        let mut req = request(previous(5, "abc", 4));
        req.source.paths = files(&["src/"]);

        let response = check(&req, &source).await.unwrap();
        assert_eq!(response, CheckResponse(vec![previous(5, "abc", 4)]));
    }

    #[tokio::test]
    async fn test_same_pull_request_diffs_commits_after_previous() {
        let mut pr = test_pull_request(5, 6);
        pr.head_ref.oid = "e".to_string();
        let mut source = FakeSource::with_pulls(vec![pr]);
        source.histories.insert(5, vec![commit("b"), commit("c"), commit("d"), commit("e")]);
        source.commit_files.insert("c".to_string(), files(&["src/c.rs"]));
        source.commit_files.insert("d".to_string(), files(&["docs/d.md"]));
        source.commit_files.insert("e".to_string(), files(&["docs/e.md"]));
        let mut req = request(previous(5, "c", 4));
        req.source.ignore_paths = files(&["docs/"]);

        let response = check(&req, &source).await.unwrap();
        // Only d and e are considered, both ignored.
        assert_eq!(response, CheckResponse(vec![previous(5, "c", 4)]));
        let calls = source.calls();
        assert_eq!(calls.pull_request, vec![5]);
        assert_eq!(calls.commit_changed_files, vec!["d", "e"]);
        assert!(calls.changed_files.is_empty());
    }

    #[tokio::test]
    async fn test_incremental_diff_unions_later_commits() {
        let mut source = FakeSource::default();
        source.histories.insert(5, vec![commit("c"), commit("d"), commit("e")]);
        source.commit_files.insert("c".to_string(), files(&["c.rs"]));
        source.commit_files.insert("d".to_string(), files(&["d.rs", "shared.rs"]));
        source.commit_files.insert("e".to_string(), files(&["e.rs", "shared.rs"]));

        let changed = paths::changed_files(&test_pull_request(5, 6), &previous(5, "c", 4), &source)
            .await
            .unwrap();
        assert_eq!(changed, files(&["d.rs", "shared.rs", "e.rs", "shared.rs"]));
    }

    #[tokio::test]
    async fn test_rewritten_history_yields_no_files() {
        let mut source = FakeSource::default();
        source.histories.insert(5, vec![commit("x"), commit("y")]);

        let changed = paths::changed_files(&test_pull_request(5, 6), &previous(5, "c", 4), &source)
            .await
            .unwrap();
        assert!(changed.is_empty());
        assert!(source.calls().commit_changed_files.is_empty());
    }

    #[tokio::test]
    async fn test_other_pull_request_uses_full_diff() {
        let mut source = FakeSource::default();
        source.pr_files.insert(8, files(&["a.rs"]));

        let changed = paths::changed_files(&test_pull_request(8, 6), &previous(5, "c", 4), &source)
            .await
            .unwrap();
        assert_eq!(changed, files(&["a.rs"]));
        assert!(source.calls().pull_request.is_empty());
    }

    #[tokio::test]
    async fn test_negative_filter_suppresses_new_commits() {
        let mut fork = test_pull_request(1, 6);
        fork.is_cross_repository = true;
        let source = FakeSource::with_pulls(vec![fork, test_pull_request(2, 5)]);
        let mut req = request(previous(5, "abc", 4));
        req.source.disable_forks = true;

        let response = check(&req, &source).await.unwrap();
        assert_eq!(prs(&response), vec![2]);
    }

    #[test]
    fn test_watermark_from_version() {
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap();
        assert_eq!(
            watermark(&Version::default(), now),
            Utc.with_ymd_and_hms(2023, 10, 19, 12, 0, 0).unwrap()
        );
        assert_eq!(watermark(&previous(1, "a", 3), now), at(3));
    }
}
