use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::pr::PullRequest;

/// Source configuration as sent by the calling CI system.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Source {
    /// `owner/name` of the watched repository
    pub repository: String,
    pub access_token: Option<String>,
    pub v3_endpoint: Option<String>,
    pub graphql_endpoint: Option<String>,
    /// Only pull requests targeting this branch (empty = any)
    pub base_branch: String,
    pub required_review_approvals: u32,
    /// Pull requests must carry at least one of these (empty = no restriction)
    pub labels: Vec<String>,
    pub disable_ci_skip: bool,
    pub disable_forks: bool,
    /// Include glob patterns
    pub paths: Vec<String>,
    /// Ignore glob patterns
    pub ignore_paths: Vec<String>,
}

impl Source {
    /// Whether any include or ignore pattern is configured.
    pub fn has_path_patterns(&self) -> bool {
        self.paths.len() + self.ignore_paths.len() > 0
    }
}

/// A resolved pull request state: number, head commit and update time.
///
/// `pr == 0` is the sentinel for "nothing resolved yet". A zero
/// `updated_date` is the Unix epoch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    #[serde(default, serialize_with = "pr_to_string", deserialize_with = "pr_from_any")]
    pub pr: u64,
    #[serde(default)]
    pub commit: String,
    #[serde(default)]
    pub updated_date: DateTime<Utc>,
}

impl Version {
    pub fn is_sentinel(&self) -> bool {
        self.pr == 0
    }

    /// The watermark this version carries, or `None` for the zero timestamp.
    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        (self.updated_date != DateTime::<Utc>::default()).then_some(self.updated_date)
    }
}

impl From<&PullRequest> for Version {
    fn from(pr: &PullRequest) -> Self {
        Self {
            pr: pr.number,
            commit: pr.head_ref.oid.clone(),
            updated_date: pr.updated_at,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}@{} ({})", self.pr, self.commit, self.updated_date.to_rfc3339())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckRequest {
    pub source: Source,
    /// `null` on the very first check
    #[serde(default, deserialize_with = "null_as_default")]
    pub version: Version,
}

/// Versions ordered by ascending update time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CheckResponse(pub Vec<Version>);

impl CheckResponse {
    pub fn push(&mut self, version: Version) {
        self.0.push(version);
    }

    /// Stable sort by `updated_date`; ties keep discovery order.
    pub fn sort_by_updated(&mut self) {
        self.0.sort_by_key(|v| v.updated_date);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn versions(&self) -> &[Version] {
        &self.0
    }
}

fn pr_to_string<S: Serializer>(pr: &u64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&pr.to_string())
}

fn pr_from_any<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) if s.is_empty() => Ok(0),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
