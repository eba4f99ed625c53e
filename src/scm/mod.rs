pub mod github;
pub mod types;

pub use github::GitHub;
pub use types::{PrUrl, Pull, PublishTarget, Published};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, info_span, instrument, Instrument};

use crate::report::{self, Report};

#[derive(Debug, Error)]
pub enum ScmError {
    #[error("API request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API error: {0}")]
    Api(String),

    #[error("API unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid PR URL: {0}")]
    InvalidUrl(String),

    #[error("GitHub token not found in config or environment")]
    MissingToken,
}

/// Source-control provider operations needed to report diff coverage.
/// Check and comment identifiers are opaque strings.
#[async_trait]
pub trait ScmClient: Send + Sync {
    /// Pull requests that contain the given commit. Empty when none do.
    async fn get_pulls(&self, org: &str, repo: &str, commit: &str) -> Result<Vec<Pull>, ScmError>;

    /// Unified diff of a pull request.
    async fn get_pull_diff(&self, org: &str, repo: &str, id: u64) -> Result<String, ScmError>;

    /// Start an in-progress check run and return its id.
    async fn create_check(&self, org: &str, repo: &str, commit: &str) -> Result<String, ScmError>;

    async fn update_check(
        &self,
        org: &str,
        repo: &str,
        check_id: &str,
        running: bool,
        success: bool,
    ) -> Result<(), ScmError>;

    async fn create_comment(
        &self,
        org: &str,
        repo: &str,
        pull_id: u64,
        text: &str,
    ) -> Result<String, ScmError>;

    async fn update_comment(
        &self,
        org: &str,
        repo: &str,
        comment_id: &str,
        text: &str,
    ) -> Result<(), ScmError>;

    /// Raw contents of a file at a commit.
    async fn download_file(
        &self,
        org: &str,
        repo: &str,
        commit: &str,
        filename: &str,
    ) -> Result<Vec<u8>, ScmError>;
}

/// Parse a GitHub PR URL into its component parts.
/// Expected format: https://github.com/{owner}/{repo}/pull/{number}
pub fn parse_pr_url(url: &str) -> Result<PrUrl, ScmError> {
    let parsed = reqwest::Url::parse(url).map_err(|_| ScmError::InvalidUrl(url.to_string()))?;

    if parsed.host_str() != Some("github.com") {
        return Err(ScmError::InvalidUrl(url.to_string()));
    }

    let segments: Vec<_> = parsed
        .path_segments()
        .ok_or_else(|| ScmError::InvalidUrl(url.to_string()))?
        .filter(|segment| !segment.is_empty())
        .collect();

    if segments.len() != 4 || segments[2] != "pull" {
        return Err(ScmError::InvalidUrl(url.to_string()));
    }

    let pr_number = segments[3]
        .parse::<u64>()
        .map_err(|_| ScmError::InvalidUrl(url.to_string()))?;

    Ok(PrUrl {
        owner: segments[0].to_string(),
        repo: segments[1].to_string(),
        pr_number,
    })
}

/// First pull request containing `commit`, if any.
pub async fn find_pull(
    client: &dyn ScmClient,
    owner: &str,
    repo: &str,
    commit: &str,
) -> Result<Option<Pull>, ScmError> {
    let pulls = client
        .get_pulls(owner, repo, commit)
        .instrument(info_span!("find_pull", commit = %commit))
        .await?;
    info!(commit = %commit, pulls = pulls.len(), "looked up pull requests for commit");
    Ok(pulls.into_iter().next())
}

/// Publish a report: open a check run, post the markdown report as a PR
/// comment (updating `comment_id` when given), then complete the check
/// with the report's pass/fail outcome.
#[instrument(skip(client, report), fields(owner = %target.owner, repo = %target.repo, pull = target.pull_id))]
pub async fn publish(
    client: &dyn ScmClient,
    target: &PublishTarget,
    report: &Report,
    comment_id: Option<&str>,
) -> Result<Published, ScmError> {
    let check_id = client
        .create_check(&target.owner, &target.repo, &target.commit)
        .await?;
    info!(check_id = %check_id, "created check run");

    let body = report::render_markdown(report);
    let comment_id = match comment_id {
        Some(id) => {
            client
                .update_comment(&target.owner, &target.repo, id, &body)
                .await?;
            id.to_string()
        }
        None => {
            client
                .create_comment(&target.owner, &target.repo, target.pull_id, &body)
                .await?
        }
    };
    info!(comment_id = %comment_id, "posted coverage comment");

    client
        .update_check(&target.owner, &target.repo, &check_id, false, report.passed())
        .await?;

    Ok(Published {
        check_id,
        comment_id,
    })
}
