mod config;
mod parser;
mod report;
mod scm;

use clap::Parser;
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use scm::{PublishTarget, ScmClient};

/// diffcov: parses a coverage upload and a pull request diff, and reports
/// how much of the changed code is covered by tests.
#[derive(Parser, Debug)]
#[command(name = "diffcov", version, about)]
struct Cli {
    /// Raw coverage upload, or a bare Cobertura XML file
    #[arg(short, long, required_unless_present = "remote_coverage")]
    coverage: Option<PathBuf>,

    /// Path of the coverage upload inside the repository, fetched at --commit
    #[arg(long, requires = "commit", conflicts_with = "coverage")]
    remote_coverage: Option<String>,

    /// Unified diff file
    #[arg(short, long, conflicts_with = "pr")]
    diff: Option<PathBuf>,

    /// GitHub Pull Request URL (e.g., https://github.com/org/repo/pull/42)
    #[arg(long)]
    pr: Option<String>,

    /// Repository as owner/name; with --commit, the pull request is looked up
    #[arg(long, conflicts_with = "pr")]
    repo: Option<String>,

    /// Head commit of the pull request
    #[arg(long)]
    commit: Option<String>,

    /// Minimum diff coverage in percent (overrides config)
    #[arg(long)]
    threshold: Option<f64>,

    /// Optional output file path for markdown report
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Post the report as a check run and PR comment
    #[arg(long, requires = "commit")]
    publish: bool,

    /// Update this existing comment instead of creating one
    #[arg(long, requires = "publish")]
    comment_id: Option<String>,
}

/// Repository and, once known, the pull request being reported on.
struct Target {
    owner: String,
    repo: String,
    pull_id: Option<u64>,
}

impl Cli {
    fn target(&self) -> Result<Option<Target>, Box<dyn std::error::Error>> {
        if let Some(url) = self.pr.as_deref() {
            let parsed = scm::parse_pr_url(url)?;
            debug!(owner = %parsed.owner, repo = %parsed.repo, pr = parsed.pr_number, "parsed PR URL");
            return Ok(Some(Target {
                owner: parsed.owner,
                repo: parsed.repo,
                pull_id: Some(parsed.pr_number),
            }));
        }
        match self.repo.as_deref() {
            Some(full_name) => {
                let (owner, repo) = full_name
                    .split_once('/')
                    .filter(|(o, r)| !o.is_empty() && !r.is_empty())
                    .ok_or_else(|| format!("Invalid repository {:?}, expected owner/name", full_name))?;
                Ok(Some(Target {
                    owner: owner.to_string(),
                    repo: repo.to_string(),
                    pull_id: None,
                }))
            }
            None => Ok(None),
        }
    }

    fn needs_github(&self) -> bool {
        self.diff.is_none() || self.remote_coverage.is_some() || self.publish
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    info!("loading configuration");
    let config = config::Config::load()?;
    let threshold = cli.threshold.or(config.report.threshold);

    let mut target = cli.target()?;
    let github = if cli.needs_github() {
        if target.is_none() {
            return Err("--pr or --repo is required unless both --coverage and --diff are local files".into());
        }
        Some(scm::GitHub::new(&config)?)
    } else {
        None
    };

    if let (Some(client), Some(target)) = (github.as_ref(), target.as_mut()) {
        if target.pull_id.is_none() {
            if let Some(commit) = cli.commit.as_deref() {
                if let Some(pull) = scm::find_pull(client, &target.owner, &target.repo, commit).await? {
                    debug!(pull = pull.id, base = %pull.base, head = %pull.head, "using pull request");
                    target.pull_id = Some(pull.id);
                }
            }
        }
    }

    let diff_text = match (cli.diff.as_deref(), github.as_ref(), target.as_ref()) {
        (Some(path), _, _) => {
            info!(path = %path.display(), "reading diff");
            std::fs::read_to_string(path)?
        }
        (None, Some(client), Some(target)) => {
            let pull_id = target
                .pull_id
                .ok_or("No pull request found; pass --pr, or --repo with --commit")?;
            info!(pull = pull_id, "fetching pull request diff");
            client.get_pull_diff(&target.owner, &target.repo, pull_id).await?
        }
        _ => return Err("No diff source: pass --diff, --pr, or --repo with --commit".into()),
    };

    let raw_coverage = match (cli.coverage.as_deref(), cli.remote_coverage.as_deref()) {
        (Some(path), _) => {
            info!(path = %path.display(), "reading coverage upload");
            std::fs::read(path)?
        }
        (None, Some(remote)) => {
            let client = github.as_ref().ok_or("GitHub client not configured")?;
            let target = target.as_ref().ok_or("--remote-coverage requires --pr or --repo")?;
            let commit = cli.commit.as_deref().ok_or("--remote-coverage requires --commit")?;
            info!(path = %remote, commit = %commit, "downloading coverage upload");
            client
                .download_file(&target.owner, &target.repo, commit, remote)
                .await?
        }
        (None, None) => return Err("No coverage source: pass --coverage or --remote-coverage".into()),
    };

    info!("parsing coverage and diff");
    let coverage = parser::parse_raw_coverage_data(&raw_coverage)?;
    let diff = parser::parse_diff(&diff_text)?;
    info!(coverage_files = coverage.file_coverage.len(), diff_files = diff.len(), "parsed inputs");

    let built_report = report::build(&coverage, &diff, threshold);
    if cli.json {
        report::output_json(&built_report)?;
    } else {
        report::output(&built_report, cli.output.as_deref())?;
    }

    if cli.publish {
        let client = github.as_ref().ok_or("GitHub client not configured")?;
        let target = target.as_ref().ok_or("--publish requires --pr or --repo")?;
        let publish_target = PublishTarget {
            owner: target.owner.clone(),
            repo: target.repo.clone(),
            pull_id: target.pull_id.ok_or("No pull request to publish to")?,
            commit: cli.commit.clone().ok_or("--publish requires --commit")?,
        };
        let published =
            scm::publish(client, &publish_target, &built_report, cli.comment_id.as_deref()).await?;
        info!(check_id = %published.check_id, comment_id = %published.comment_id, "published report");
    }

    info!(status = %built_report.status, "done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_local_files() {
        let cli = Cli::try_parse_from(["diffcov", "--coverage", "cov.txt", "--diff", "pr.diff"]).unwrap();
        assert!(!cli.needs_github());
        assert!(cli.target().unwrap().is_none());
    }

    #[test]
    fn test_cli_pr_url_target() {
        let cli = Cli::try_parse_from([
            "diffcov",
            "--coverage",
            "cov.txt",
            "--pr",
            "https://github.com/org/repo/pull/42",
        ])
        .unwrap();
        assert!(cli.needs_github());
        let target = cli.target().unwrap().unwrap();
        assert_eq!(target.owner, "org");
        assert_eq!(target.pull_id, Some(42));
    }

    #[test]
    fn test_cli_repo_target() {
        let cli = Cli::try_parse_from([
            "diffcov",
            "--remote-coverage",
            "coverage.txt",
            "--repo",
            "org/repo",
            "--commit",
            "abc",
        ])
        .unwrap();
        let target = cli.target().unwrap().unwrap();
        assert_eq!(target.repo, "repo");
        assert_eq!(target.pull_id, None);

        let bad = Cli::try_parse_from(["diffcov", "-c", "x", "--repo", "noslash"]).unwrap();
        assert!(bad.target().is_err());
    }

    #[test]
    fn test_cli_requires_coverage_source() {
        assert!(Cli::try_parse_from(["diffcov", "--diff", "pr.diff"]).is_err());
        assert!(Cli::try_parse_from(["diffcov", "-c", "x", "--publish"]).is_err());
    }
}
