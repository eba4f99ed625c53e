use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

use super::{Pull, ScmClient, ScmError};
use crate::config::Config;

const USER_AGENT: &str = "diffcov";

/// GitHub REST API client authenticated with a token.
pub struct GitHub {
    client: reqwest::Client,
    api_url: String,
    token: String,
    check_name: String,
}

#[derive(Deserialize)]
struct GitRef {
    #[serde(rename = "ref")]
    name: String,
}

#[derive(Deserialize)]
struct PullResponse {
    number: u64,
    base: GitRef,
    head: GitRef,
}

/// Checks and comments both answer with a numeric id.
#[derive(Deserialize)]
struct IdResponse {
    id: u64,
}

impl GitHub {
    pub fn new(config: &Config) -> Result<Self, ScmError> {
        let token = config.github_token().ok_or(ScmError::MissingToken)?;
        Ok(GitHub {
            client: reqwest::Client::new(),
            api_url: config.api_url().to_string(),
            token,
            check_name: config.check_name().to_string(),
        })
    }

    fn repo_url(&self, org: &str, repo: &str, path: &str) -> String {
        format!("{}/repos/{}/{}/{}", self.api_url, org, repo, path)
    }

    fn request(&self, method: Method, url: &str, accept: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .header("User-Agent", USER_AGENT)
            .header("Accept", accept)
            .bearer_auth(&self.token)
    }
}

/// Map a response to an error unless it has the expected status.
async fn expect_status(
    response: Response,
    expected: StatusCode,
    action: &str,
) -> Result<Response, ScmError> {
    let status = response.status();
    if status == expected {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    match status {
        StatusCode::UNAUTHORIZED => Err(ScmError::Unauthorized(text)),
        StatusCode::NOT_FOUND => Err(ScmError::NotFound(format!("{}: {}", action, text))),
        _ => Err(ScmError::Api(format!("{}: {}: {}", action, status, text))),
    }
}

/// GitHub answers 422 when the commit is not on any pull request.
async fn pulls_from_response(response: Response) -> Result<Vec<Pull>, ScmError> {
    if response.status() == StatusCode::UNPROCESSABLE_ENTITY {
        debug!("no pull requests for commit");
        return Ok(Vec::new());
    }
    let response = expect_status(response, StatusCode::OK, "list pulls").await?;
    let pulls = response.json::<Vec<PullResponse>>().await?;
    debug!(pulls = pulls.len(), "received pull requests");
    Ok(pulls
        .into_iter()
        .map(|p| Pull {
            id: p.number,
            base: p.base.name,
            head: p.head.name,
        })
        .collect())
}

fn check_state(running: bool, success: bool) -> serde_json::Value {
    if running {
        json!({ "status": "in_progress" })
    } else {
        let conclusion = if success { "success" } else { "failure" };
        json!({ "status": "completed", "conclusion": conclusion })
    }
}

#[async_trait]
impl ScmClient for GitHub {
    #[instrument(skip(self))]
    async fn get_pulls(&self, org: &str, repo: &str, commit: &str) -> Result<Vec<Pull>, ScmError> {
        let url = self.repo_url(org, repo, &format!("commits/{}/pulls", commit));
        let response = self
            .request(Method::GET, &url, "application/vnd.github.groot-preview+json")
            .send()
            .await?;
        pulls_from_response(response).await
    }

    #[instrument(skip(self))]
    async fn get_pull_diff(&self, org: &str, repo: &str, id: u64) -> Result<String, ScmError> {
        let url = self.repo_url(org, repo, &format!("pulls/{}", id));
        let response = self
            .request(Method::GET, &url, "application/vnd.github.v3.diff")
            .send()
            .await?;
        let diff_text = expect_status(response, StatusCode::OK, "get pull diff")
            .await?
            .text()
            .await?;
        debug!(diff_bytes = diff_text.len(), "received PR diff");
        Ok(diff_text)
    }

    #[instrument(skip(self))]
    async fn create_check(&self, org: &str, repo: &str, commit: &str) -> Result<String, ScmError> {
        let url = self.repo_url(org, repo, "check-runs");
        let response = self
            .request(Method::POST, &url, "application/vnd.github.v3+json")
            .json(&json!({
                "head_sha": commit,
                "name": self.check_name,
                "status": "in_progress",
            }))
            .send()
            .await?;
        let check = expect_status(response, StatusCode::CREATED, "create check")
            .await?
            .json::<IdResponse>()
            .await?;
        Ok(check.id.to_string())
    }

    #[instrument(skip(self))]
    async fn update_check(
        &self,
        org: &str,
        repo: &str,
        check_id: &str,
        running: bool,
        success: bool,
    ) -> Result<(), ScmError> {
        let url = self.repo_url(org, repo, &format!("check-runs/{}", check_id));
        let response = self
            .request(Method::PATCH, &url, "application/vnd.github.v3+json")
            .json(&check_state(running, success))
            .send()
            .await?;
        expect_status(response, StatusCode::OK, "update check").await?;
        Ok(())
    }

    #[instrument(skip(self, text))]
    async fn create_comment(
        &self,
        org: &str,
        repo: &str,
        pull_id: u64,
        text: &str,
    ) -> Result<String, ScmError> {
        let url = self.repo_url(org, repo, &format!("issues/{}/comments", pull_id));
        let response = self
            .request(Method::POST, &url, "application/vnd.github.v3+json")
            .json(&json!({ "body": text }))
            .send()
            .await?;
        let comment = expect_status(response, StatusCode::CREATED, "create comment")
            .await?
            .json::<IdResponse>()
            .await?;
        Ok(comment.id.to_string())
    }

    #[instrument(skip(self, text))]
    async fn update_comment(
        &self,
        org: &str,
        repo: &str,
        comment_id: &str,
        text: &str,
    ) -> Result<(), ScmError> {
        let url = self.repo_url(org, repo, &format!("issues/comments/{}", comment_id));
        let response = self
            .request(Method::PATCH, &url, "application/vnd.github.v3+json")
            .json(&json!({ "body": text }))
            .send()
            .await?;
        expect_status(response, StatusCode::OK, "update comment").await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn download_file(
        &self,
        org: &str,
        repo: &str,
        commit: &str,
        filename: &str,
    ) -> Result<Vec<u8>, ScmError> {
        let url = self.repo_url(org, repo, &format!("contents/{}", filename.trim_start_matches('/')));
        let response = self
            .request(Method::GET, &url, "application/vnd.github.v3.raw")
            .query(&[("ref", commit)])
            .send()
            .await?;
        let bytes = expect_status(response, StatusCode::OK, "download file")
            .await?
            .bytes()
            .await?;
        debug!(bytes = bytes.len(), "downloaded file");
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GitHubConfig;

    fn response(status: u16, body: &str) -> Response {
        http::Response::builder()
            .status(status)
            .body(body.to_string())
            .unwrap()
            .into()
    }

    fn client() -> GitHub {
        let config = Config {
            github: GitHubConfig {
                token: Some("secret".to_string()),
                api_url: Some("https://ghe.example.com/api/v3/".to_string()),
            },
            ..Default::default()
        };
        GitHub::new(&config).unwrap()
    }

    #[test]
    fn test_repo_url() {
        assert_eq!(
            client().repo_url("org", "repo", "pulls/42"),
            "https://ghe.example.com/api/v3/repos/org/repo/pulls/42"
        );
    }

    #[test]
    fn test_request_headers() {
        let request = client()
            .request(Method::GET, "https://ghe.example.com/x", "application/vnd.github.v3.diff")
            .build()
            .unwrap();
        let headers = request.headers();
        assert_eq!(headers["Accept"], "application/vnd.github.v3.diff");
        assert_eq!(headers["User-Agent"], "diffcov");
        assert_eq!(headers["Authorization"], "Bearer secret");
    }

    #[test]
    fn test_check_state() {
        assert_eq!(check_state(true, false), json!({ "status": "in_progress" }));
        assert_eq!(
            check_state(false, true),
            json!({ "status": "completed", "conclusion": "success" })
        );
        assert_eq!(
            check_state(false, false),
            json!({ "status": "completed", "conclusion": "failure" })
        );
    }

    #[test]
    fn test_pull_response_deserializes() {
        let body = r#"[{"number": 7, "title": "x", "base": {"ref": "main"}, "head": {"ref": "feature"}}]"#;
        let pulls: Vec<PullResponse> = serde_json::from_str(body).unwrap();
        assert_eq!(pulls[0].number, 7);
        assert_eq!(pulls[0].base.name, "main");
        assert_eq!(pulls[0].head.name, "feature");
    }

    #[tokio::test]
    async fn test_pulls_unprocessable_means_none() {
        let pulls = pulls_from_response(response(422, "{\"message\":\"No commit found\"}"))
            .await
            .unwrap();
        assert!(pulls.is_empty());
    }

    #[tokio::test]
    async fn test_pulls_ok_response() {
        let body = r#"[{"number": 7, "base": {"ref": "main"}, "head": {"ref": "feature"}}]"#;
        let pulls = pulls_from_response(response(200, body)).await.unwrap();
        assert_eq!(
            pulls,
            vec![Pull {
                id: 7,
                base: "main".to_string(),
                head: "feature".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_pulls_error_statuses() {
        assert!(matches!(
            pulls_from_response(response(401, "Bad credentials")).await,
            Err(ScmError::Unauthorized(text)) if text == "Bad credentials"
        ));
        assert!(matches!(
            pulls_from_response(response(404, "Not Found")).await,
            Err(ScmError::NotFound(text)) if text == "list pulls: Not Found"
        ));
        assert!(matches!(
            pulls_from_response(response(500, "boom")).await,
            Err(ScmError::Api(text)) if text.starts_with("list pulls: 500")
        ));
    }

    #[tokio::test]
    async fn test_expect_status() {
        let ok = expect_status(response(201, "{}"), StatusCode::CREATED, "create check")
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::CREATED);

        // Success codes other than the expected one are still errors.
        assert!(matches!(
            expect_status(response(200, "{}"), StatusCode::CREATED, "create check").await,
            Err(ScmError::Api(_))
        ));
        assert!(matches!(
            expect_status(response(422, ""), StatusCode::OK, "update check").await,
            Err(ScmError::Api(_))
        ));
    }
}
