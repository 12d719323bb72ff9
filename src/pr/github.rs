use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use super::{parse_repository, PullRequestSource, SourceError};
use super::{Commit, GitRef, PullRequest, Repository};
use crate::check::Source;
use crate::config::Config;

pub const DEFAULT_V3_ENDPOINT: &str = "https://api.github.com";
pub const DEFAULT_GRAPHQL_ENDPOINT: &str = "https://api.github.com/graphql";

const USER_AGENT: &str = "pr-version-resolver";
const PER_PAGE: usize = 100;
const CI_BUILD_MARKER: &str = "[ci build]";

const OPEN_PULL_REQUESTS_QUERY: &str = r#"
query($owner: String!, $name: String!, $cursor: String) {
  repository(owner: $owner, name: $name) {
    pullRequests(first: 50, after: $cursor, states: OPEN, orderBy: {field: UPDATED_AT, direction: DESC}) {
      pageInfo { hasNextPage endCursor }
      nodes {
        number
        title
        url
        createdAt
        updatedAt
        isCrossRepository
        baseRefName
        baseRefOid
        headRefName
        headRefOid
        reviews(states: APPROVED) { totalCount }
        labels(first: 100) { nodes { name } }
        commits(last: 1) { nodes { commit { oid message committedDate } } }
        timelineItems(last: 100, itemTypes: [BASE_REF_CHANGED_EVENT, BASE_REF_FORCE_PUSHED_EVENT, HEAD_REF_FORCE_PUSHED_EVENT, REOPENED_EVENT, ISSUE_COMMENT]) {
          nodes {
            __typename
            ... on BaseRefChangedEvent { createdAt }
            ... on BaseRefForcePushedEvent { createdAt }
            ... on HeadRefForcePushedEvent { createdAt }
            ... on ReopenedEvent { createdAt }
            ... on IssueComment { createdAt body }
          }
        }
      }
    }
  }
}
"#;

/// [`PullRequestSource`] backed by the GitHub GraphQL and REST APIs.
pub struct GitHub {
    client: reqwest::Client,
    repository: Repository,
    token: String,
    v3_endpoint: String,
    graphql_endpoint: String,
}

impl GitHub {
    /// Build a client for the repository named in `source`.
    ///
    /// Values in `source` win over the local config file.
    pub fn from_source(source: &Source, config: &Config) -> Result<Self, SourceError> {
        let repository = parse_repository(&source.repository)?;
        let token = source
            .access_token
            .clone()
            .filter(|t| !t.is_empty())
            .or_else(|| config.github_token())
            .ok_or(SourceError::MissingToken)?;

        let v3_endpoint = source
            .v3_endpoint
            .clone()
            .or_else(|| config.github.v3_endpoint.clone())
            .unwrap_or_else(|| DEFAULT_V3_ENDPOINT.to_string());
        let graphql_endpoint = source
            .graphql_endpoint
            .clone()
            .or_else(|| config.github.graphql_endpoint.clone())
            .unwrap_or_else(|| DEFAULT_GRAPHQL_ENDPOINT.to_string());

        Ok(Self {
            client: reqwest::Client::new(),
            repository,
            token,
            v3_endpoint: v3_endpoint.trim_end_matches('/').to_string(),
            graphql_endpoint,
        })
    }

    fn repo_url(&self, path: &str) -> String {
        format!(
            "{}/repos/{}/{}/{}",
            self.v3_endpoint, self.repository.owner, self.repository.name, path
        )
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .get(url)
            .header("User-Agent", USER_AGENT)
            .bearer_auth(&self.token)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, SourceError> {
        let response = self
            .get(url)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<T>().await?)
    }

    /// Page through a file-list endpoint (`pulls/{n}/files` or
    /// `commits/{sha}`) until a short page.
    async fn changed_filenames(&self, path: &str) -> Result<Vec<String>, SourceError> {
        let mut files = Vec::new();
        for page in 1.. {
            let url = self.repo_url(&format!("{path}?per_page={PER_PAGE}&page={page}"));
            let batch = self.get_json::<FilesPage>(&url).await?.into_filenames();
            let last_page = batch.len() < PER_PAGE;
            files.extend(batch);
            if last_page {
                break;
            }
        }
        debug!(files = files.len(), "received changed files");
        Ok(files)
    }

    async fn query<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<T, SourceError> {
        let body = serde_json::json!({ "query": query, "variables": variables });
        let response = self
            .client
            .post(&self.graphql_endpoint)
            .header("User-Agent", USER_AGENT)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json::<GraphQlResponse<T>>()
            .await?;
        response.into_data()
    }
}

#[async_trait]
impl PullRequestSource for GitHub {
    #[instrument(skip(self), fields(owner = %self.repository.owner, repo = %self.repository.name))]
    async fn list_open_pull_requests(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<PullRequest>, SourceError> {
        let mut pulls = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let variables = serde_json::json!({
                "owner": self.repository.owner,
                "name": self.repository.name,
                "cursor": cursor,
            });
            let data: RepositoryData = self.query(OPEN_PULL_REQUESTS_QUERY, variables).await?;
            let page = data
                .repository
                .ok_or_else(|| SourceError::GraphQl("repository not found".to_string()))?
                .pull_requests;
            debug!(page_size = page.nodes.len(), "received pull request page");

            let mut reached_watermark = false;
            for node in page.nodes {
                if node.updated_at < since {
                    reached_watermark = true;
                    break;
                }
                pulls.push(node.into_pull_request(since));
            }

            if reached_watermark || !page.page_info.has_next_page {
                break;
            }
            cursor = page.page_info.end_cursor;
        }

        Ok(pulls)
    }

    #[instrument(skip(self))]
    async fn changed_files(&self, number: u64) -> Result<Vec<String>, SourceError> {
        self.changed_filenames(&format!("pulls/{number}/files")).await
    }

    #[instrument(skip(self))]
    async fn commit_changed_files(&self, sha: &str) -> Result<Vec<String>, SourceError> {
        self.changed_filenames(&format!("commits/{sha}")).await
    }

    #[instrument(skip(self))]
    async fn pull_request(
        &self,
        number: u64,
        head_sha: &str,
    ) -> Result<PullRequest, SourceError> {
        let metadata: RestPullRequest = self.get_json(&self.repo_url(&format!("pulls/{number}"))).await?;
        if metadata.head.sha != head_sha {
            warn!(listed = %head_sha, current = %metadata.head.sha, "head moved since listing");
        }

        let mut commits = Vec::new();
        for page in 1.. {
            let url = self.repo_url(&format!(
                "pulls/{number}/commits?per_page={PER_PAGE}&page={page}"
            ));
            let batch: Vec<RestCommit> = self.get_json(&url).await?;
            let last_page = batch.len() < PER_PAGE;
            commits.extend(batch.into_iter().map(Commit::from));
            if last_page {
                break;
            }
        }
        debug!(commits = commits.len(), "received commit history");

        Ok(metadata.into_pull_request(commits))
    }
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

impl<T> GraphQlResponse<T> {
    fn into_data(self) -> Result<T, SourceError> {
        if !self.errors.is_empty() {
            let messages: Vec<_> = self.errors.into_iter().map(|e| e.message).collect();
            return Err(SourceError::GraphQl(messages.join("; ")));
        }
        self.data
            .ok_or_else(|| SourceError::GraphQl("response carried no data".to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct RepositoryData {
    repository: Option<RepositoryNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepositoryNode {
    pull_requests: Connection<PullRequestNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Connection<T> {
    #[serde(default)]
    page_info: PageInfo,
    #[serde(default = "Vec::new")]
    nodes: Vec<T>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullRequestNode {
    number: u64,
    title: String,
    url: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    is_cross_repository: bool,
    base_ref_name: String,
    base_ref_oid: String,
    head_ref_name: String,
    head_ref_oid: String,
    reviews: Option<TotalCount>,
    labels: Option<Connection<LabelNode>>,
    commits: Connection<CommitNode>,
    timeline_items: Connection<TimelineItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TotalCount {
    total_count: u32,
}

#[derive(Debug, Deserialize)]
struct LabelNode {
    name: String,
}

#[derive(Debug, Deserialize)]
struct CommitNode {
    commit: CommitObject,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommitObject {
    oid: String,
    message: String,
    committed_date: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "__typename")]
enum TimelineItem {
    BaseRefChangedEvent(TimelineEvent),
    BaseRefForcePushedEvent(TimelineEvent),
    HeadRefForcePushedEvent(TimelineEvent),
    ReopenedEvent(TimelineEvent),
    IssueComment(TimelineEvent),
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimelineEvent {
    created_at: DateTime<Utc>,
    #[serde(default)]
    body: String,
}

impl PullRequestNode {
    /// Convert a listed node, setting event flags for events at or after `since`.
    fn into_pull_request(self, since: DateTime<Utc>) -> PullRequest {
        let mut pr = PullRequest {
            number: self.number,
            title: self.title,
            url: self.url,
            created_at: self.created_at,
            updated_at: self.updated_at,
            base_ref: GitRef { name: self.base_ref_name, oid: self.base_ref_oid },
            head_ref: GitRef { name: self.head_ref_name, oid: self.head_ref_oid },
            commits: self
                .commits
                .nodes
                .into_iter()
                .map(|n| Commit {
                    oid: n.commit.oid,
                    message: n.commit.message,
                    committed_at: n.commit.committed_date,
                })
                .collect(),
            labels: self
                .labels
                .map(|l| l.nodes.into_iter().map(|n| n.name).collect())
                .unwrap_or_default(),
            approved_review_count: self.reviews.map(|r| r.total_count).unwrap_or_default(),
            is_cross_repository: self.is_cross_repository,
            ..PullRequest::default()
        };

        for item in self.timeline_items.nodes {
            match item {
                TimelineItem::BaseRefChangedEvent(e) if e.created_at >= since => {
                    pr.base_ref_changed = true
                }
                TimelineItem::BaseRefForcePushedEvent(e) if e.created_at >= since => {
                    pr.base_ref_force_pushed = true
                }
                TimelineItem::HeadRefForcePushedEvent(e) if e.created_at >= since => {
                    pr.head_ref_force_pushed = true
                }
                TimelineItem::ReopenedEvent(e) if e.created_at >= since => pr.reopened = true,
                TimelineItem::IssueComment(e)
                    if e.created_at >= since && e.body.to_lowercase().contains(CI_BUILD_MARKER) =>
                {
                    pr.ci_build_requested = true
                }
                _ => {}
            }
        }

        pr
    }
}

#[derive(Debug, Deserialize)]
struct RestPullRequest {
    number: u64,
    title: String,
    html_url: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    base: RestRef,
    head: RestRef,
    #[serde(default)]
    labels: Vec<LabelNode>,
}

#[derive(Debug, Deserialize)]
struct RestRef {
    #[serde(rename = "ref")]
    name: String,
    sha: String,
}

/// `pulls/{n}/files` answers with a bare list, `commits/{sha}` with a
/// commit object carrying `files`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FilesPage {
    PullRequest(Vec<RestFile>),
    Commit {
        #[serde(default)]
        files: Vec<RestFile>,
    },
}

#[derive(Debug, Deserialize)]
struct RestFile {
    filename: String,
}

impl FilesPage {
    fn into_filenames(self) -> Vec<String> {
        let files = match self {
            FilesPage::PullRequest(files) | FilesPage::Commit { files } => files,
        };
        files.into_iter().map(|f| f.filename).collect()
    }
}

#[derive(Debug, Deserialize)]
struct RestCommit {
    sha: String,
    commit: RestCommitDetail,
}

#[derive(Debug, Deserialize)]
struct RestCommitDetail {
    message: String,
    committer: Option<RestSignature>,
}

#[derive(Debug, Deserialize)]
struct RestSignature {
    date: DateTime<Utc>,
}

impl From<RestCommit> for Commit {
    fn from(c: RestCommit) -> Self {
        Commit {
            oid: c.sha,
            message: c.commit.message,
            committed_at: c.commit.committer.map(|s| s.date).unwrap_or_default(),
        }
    }
}

impl RestPullRequest {
    fn into_pull_request(self, commits: Vec<Commit>) -> PullRequest {
        PullRequest {
            number: self.number,
            title: self.title,
            url: self.html_url,
            created_at: self.created_at,
            updated_at: self.updated_at,
            base_ref: GitRef { name: self.base.name, oid: self.base.sha },
            head_ref: GitRef { name: self.head.name, oid: self.head.sha },
            commits,
            labels: self.labels.into_iter().map(|l| l.name).collect(),
            ..PullRequest::default()
        }
    }
}
