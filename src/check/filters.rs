use chrono::{DateTime, Utc};
use std::fmt;
use tracing::debug;

use super::types::CheckRequest;
use crate::pr::PullRequest;

const SKIP_CI_MARKERS: [&str; 2] = ["[ci skip]", "[skip ci]"];

/// A single yes/no question asked about a pull request.
///
/// Negative filters reject a pull request outright; positive filters are
/// reasons to report it. See [`is_new_version`] for how they combine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// Title or head commit carries a skip marker, unless skipping is disabled
    SkipCi { disabled: bool },
    /// Targets a different base branch than the configured one
    BaseBranch(String),
    /// Has fewer approving reviews than required
    ApprovedReviewCount(u32),
    /// Carries none of the configured labels
    Labels(Vec<String>),
    /// Comes from a fork while forks are disabled
    Fork { disabled: bool },

    Created(DateTime<Utc>),
    BaseRefChanged,
    BaseRefForcePushed,
    HeadRefForcePushed,
    Reopened,
    BuildCi,
    NewCommits(DateTime<Utc>),
}

impl Filter {
    pub fn matches(&self, pr: &PullRequest) -> bool {
        match self {
            Filter::SkipCi { disabled } => !disabled && has_skip_ci_marker(pr),
            Filter::BaseBranch(branch) => !branch.is_empty() && pr.base_ref.name != *branch,
            Filter::ApprovedReviewCount(required) => {
                *required > 0 && pr.approved_review_count < *required
            }
            Filter::Labels(labels) => {
                !labels.is_empty() && !pr.labels.iter().any(|label| labels.contains(label))
            }
            Filter::Fork { disabled } => *disabled && pr.is_cross_repository,
            Filter::Created(since) => pr.created_at > *since,
            Filter::BaseRefChanged => pr.base_ref_changed,
            Filter::BaseRefForcePushed => pr.base_ref_force_pushed,
            Filter::HeadRefForcePushed => pr.head_ref_force_pushed,
            Filter::Reopened => pr.reopened,
            Filter::BuildCi => pr.ci_build_requested,
            Filter::NewCommits(since) => match pr.head_commit() {
                Some(commit) => commit.committed_at > *since,
                None => pr.updated_at > *since,
            },
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Filter::SkipCi { .. } => "skip-ci",
            Filter::BaseBranch(_) => "base-branch",
            Filter::ApprovedReviewCount(_) => "approved-review-count",
            Filter::Labels(_) => "labels",
            Filter::Fork { .. } => "fork",
            Filter::Created(_) => "created",
            Filter::BaseRefChanged => "base-ref-changed",
            Filter::BaseRefForcePushed => "base-ref-force-pushed",
            Filter::HeadRefForcePushed => "head-ref-force-pushed",
            Filter::Reopened => "reopened",
            Filter::BuildCi => "build-ci",
            Filter::NewCommits(_) => "new-commits",
        };
        f.write_str(name)
    }
}

/// Hard exclusions, in evaluation order.
pub fn negative_filters(request: &CheckRequest) -> Vec<Filter> {
    let source = &request.source;
    vec![
        Filter::SkipCi { disabled: source.disable_ci_skip },
        Filter::BaseBranch(source.base_branch.clone()),
        Filter::ApprovedReviewCount(source.required_review_approvals),
        Filter::Labels(source.labels.clone()),
        Filter::Fork { disabled: source.disable_forks },
    ]
}

/// Reasons to report, in evaluation order.
pub fn positive_filters(request: &CheckRequest) -> Vec<Filter> {
    let since = request.version.updated_date;
    vec![
        Filter::Created(since),
        Filter::BaseRefChanged,
        Filter::BaseRefForcePushed,
        Filter::HeadRefForcePushed,
        Filter::Reopened,
        Filter::BuildCi,
        Filter::NewCommits(since),
    ]
}

/// Decide whether a pull request is a new, reportable version.
///
/// Negative filters run first and any match rejects; only then is the
/// first matching positive filter looked for. No match either way rejects.
pub fn is_new_version(request: &CheckRequest, pr: &PullRequest) -> bool {
    if let Some(filter) = negative_filters(request).iter().find(|f| f.matches(pr)) {
        debug!(pr = pr.number, filter = %filter, "rejected by negative filter");
        return false;
    }

    match positive_filters(request).iter().find(|f| f.matches(pr)) {
        Some(filter) => {
            debug!(pr = pr.number, filter = %filter, "accepted by positive filter");
            true
        }
        None => {
            debug!(pr = pr.number, "no positive filter matched");
            false
        }
    }
}

fn has_skip_ci_marker(pr: &PullRequest) -> bool {
    let message = pr.head_commit().map(|c| c.message.as_str()).unwrap_or_default();
    [pr.title.as_str(), message].iter().any(|text| {
        let text = text.to_lowercase();
        SKIP_CI_MARKERS.iter().any(|marker| text.contains(marker))
    })
}
