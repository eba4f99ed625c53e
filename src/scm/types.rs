/// A pull request associated with a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pull {
    /// PR number (e.g., 42)
    pub id: u64,
    /// Base branch name
    pub base: String,
    /// Head branch name
    pub head: String,
}

/// Represents the parsed components of a GitHub PR URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrUrl {
    pub owner: String,
    pub repo: String,
    pub pr_number: u64,
}

/// Where a report is published: one pull request at one commit.
#[derive(Debug, Clone)]
pub struct PublishTarget {
    pub owner: String,
    pub repo: String,
    pub pull_id: u64,
    pub commit: String,
}

/// Identifiers of what `publish` created or updated. Opaque to this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub check_id: String,
    pub comment_id: String,
}
