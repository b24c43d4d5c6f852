//! GitHub integration — webhook validation and the REST-backed hosting platform.

use std::time::Duration;

use async_trait::async_trait;
use diagram_pipeline::error::PlatformError;
use diagram_pipeline::platform::PlatformResult;
use diagram_pipeline::reconciler::ISSUE_KEY_MARKER;
use diagram_pipeline::{FileOp, HostingPlatform, NewIssue, RepoTarget};
use hmac::{Hmac, Mac};
use reqwest::header::ACCEPT;
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const JSON_MEDIA: &str = "application/vnd.github+json";
const RAW_MEDIA: &str = "application/vnd.github.raw+json";
const ISSUE_PAGE_SIZE: usize = 100;
const MAX_ISSUE_PAGES: usize = 10;

/// Validate a GitHub webhook signature (X-Hub-Signature-256).
pub fn validate_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    if secret.is_empty() {
        tracing::warn!("Webhook secret not configured, skipping validation");
        return true;
    }

    let sig = signature.strip_prefix("sha256=").unwrap_or(signature);
    let sig_bytes = match hex::decode(sig) {
        Ok(b) => b,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(payload);

    mac.verify_slice(&sig_bytes).is_ok()
}

/// Map a non-success GitHub response onto the retry taxonomy.
///
/// Rate limits (429, or 403 with no remaining quota) and 5xx are transient;
/// everything else is permanent.
pub fn classify(op: &str, status: StatusCode, rate_limited: bool, body: &str) -> PlatformError {
    let message = format!("{status}: {}", body.chars().take(200).collect::<String>());
    if status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
        || (status == StatusCode::FORBIDDEN && rate_limited)
    {
        PlatformError::transient(op, message)
    } else {
        PlatformError::permanent(op, message)
    }
}

async fn check(op: &str, response: Response) -> PlatformResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let rate_limited = response
        .headers()
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        == Some("0");
    let body = response.text().await.unwrap_or_default();
    Err(classify(op, status, rate_limited, &body))
}

#[derive(Deserialize)]
struct GitObject {
    sha: String,
}

#[derive(Deserialize)]
struct GitRef {
    object: GitObject,
}

#[derive(Deserialize)]
struct GitCommit {
    tree: GitObject,
}

#[derive(Deserialize)]
struct IssueSummary {
    number: u64,
    body: Option<String>,
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

/// `HostingPlatform` over the GitHub REST API. Each target's `host` is the API base URL.
pub struct GitHubPlatform {
    client: reqwest::Client,
    token: String,
}

impl GitHubPlatform {
    pub fn new(token: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("diagram-sync")
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            token: token.to_string(),
        })
    }

    fn repo_url(target: &RepoTarget, op: &str, segments: &[&str]) -> PlatformResult<Url> {
        let bad_host = || PlatformError::permanent(op, format!("invalid host {}", target.host));
        let mut url = Url::parse(&target.host).map_err(|_| bad_host())?;
        url.path_segments_mut()
            .map_err(|()| bad_host())?
            .pop_if_empty()
            .push("repos")
            .extend(target.repository.split('/'))
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url, accept: &str) -> RequestBuilder {
        let request = self
            .client
            .request(method, url)
            .header(ACCEPT, accept)
            .header("X-GitHub-Api-Version", "2022-11-28");
        if self.token.is_empty() {
            request
        } else {
            request.bearer_auth(&self.token)
        }
    }

    async fn send(&self, op: &str, request: RequestBuilder) -> PlatformResult<Response> {
        request.send().await.map_err(|e| {
            if e.is_builder() {
                PlatformError::permanent(op, e.to_string())
            } else {
                PlatformError::transient(op, e.to_string())
            }
        })
    }

    async fn json<T: DeserializeOwned>(&self, op: &str, request: RequestBuilder) -> PlatformResult<T> {
        let response = check(op, self.send(op, request).await?).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| PlatformError::permanent(op, format!("unexpected response: {e}")))
    }
}

#[async_trait]
impl HostingPlatform for GitHubPlatform {
    async fn fetch_content(
        &self,
        target: &RepoTarget,
        path: &str,
        git_ref: &str,
    ) -> PlatformResult<Option<Vec<u8>>> {
        const OP: &str = "fetch_content";
        let mut segments = vec!["contents"];
        segments.extend(path.split('/'));
        let mut url = Self::repo_url(target, OP, &segments)?;
        url.query_pairs_mut().append_pair("ref", git_ref);

        let response = self.send(OP, self.request(Method::GET, url, RAW_MEDIA)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let bytes = check(OP, response)
            .await?
            .bytes()
            .await
            .map_err(|e| PlatformError::transient(OP, e.to_string()))?;
        Ok(Some(bytes.to_vec()))
    }

    async fn branch_head(&self, target: &RepoTarget, branch: &str) -> PlatformResult<String> {
        const OP: &str = "branch_head";
        let mut segments = vec!["git", "ref", "heads"];
        segments.extend(branch.split('/'));
        let url = Self::repo_url(target, OP, &segments)?;
        let head: GitRef = self.json(OP, self.request(Method::GET, url, JSON_MEDIA)).await?;
        Ok(head.object.sha)
    }

    /// Git data API: base tree → new tree → commit → fast-forward the ref.
    async fn commit_batch(
        &self,
        target: &RepoTarget,
        branch: &str,
        base: &str,
        ops: &[FileOp],
        message: &str,
    ) -> PlatformResult<String> {
        const OP: &str = "commit_batch";
        let url = Self::repo_url(target, OP, &["git", "commits", base])?;
        let base_commit: GitCommit = self.json(OP, self.request(Method::GET, url, JSON_MEDIA)).await?;

        let entries: Vec<serde_json::Value> = ops
            .iter()
            .map(|op| match &op.content {
                Some(content) => json!({
                    "path": op.path,
                    "mode": "100644",
                    "type": "blob",
                    "content": String::from_utf8_lossy(content),
                }),
                None => json!({
                    "path": op.path,
                    "mode": "100644",
                    "type": "blob",
                    "sha": null,
                }),
            })
            .collect();
        let url = Self::repo_url(target, OP, &["git", "trees"])?;
        let tree: GitObject = self
            .json(
                OP,
                self.request(Method::POST, url, JSON_MEDIA).json(&json!({
                    "base_tree": base_commit.tree.sha,
                    "tree": entries,
                })),
            )
            .await?;

        let url = Self::repo_url(target, OP, &["git", "commits"])?;
        let commit: GitObject = self
            .json(
                OP,
                self.request(Method::POST, url, JSON_MEDIA).json(&json!({
                    "message": message,
                    "tree": tree.sha,
                    "parents": [base],
                })),
            )
            .await?;

        let mut segments = vec!["git", "refs", "heads"];
        segments.extend(branch.split('/'));
        let url = Self::repo_url(target, OP, &segments)?;
        let response = self
            .send(
                OP,
                self.request(Method::PATCH, url, JSON_MEDIA)
                    .json(&json!({ "sha": commit.sha, "force": false })),
            )
            .await?;
        // 422 here means the update is not a fast-forward of the current head.
        if response.status() == StatusCode::UNPROCESSABLE_ENTITY {
            let body = response.text().await.unwrap_or_default();
            return Err(PlatformError::conflict(branch, body));
        }
        check(OP, response).await?;

        tracing::debug!(repo = %target.repository, branch, base, new_commit = %commit.sha, files = ops.len(), "Ref updated");
        Ok(commit.sha)
    }

    async fn find_open_issue(&self, target: &RepoTarget, key: &str) -> PlatformResult<Option<u64>> {
        const OP: &str = "find_open_issue";
        let marker = format!("{ISSUE_KEY_MARKER}{key}");

        for page in 1..=MAX_ISSUE_PAGES {
            let mut url = Self::repo_url(target, OP, &["issues"])?;
            {
                let mut query = url.query_pairs_mut();
                query
                    .append_pair("state", "open")
                    .append_pair("per_page", &ISSUE_PAGE_SIZE.to_string())
                    .append_pair("page", &page.to_string());
                if !target.issue_labels.is_empty() {
                    query.append_pair("labels", &target.issue_labels.join(","));
                }
            }
            let issues: Vec<IssueSummary> = self.json(OP, self.request(Method::GET, url, JSON_MEDIA)).await?;

            let found = issues.iter().find(|issue| {
                issue.pull_request.is_none()
                    && issue.body.as_deref().is_some_and(|body| body.contains(&marker))
            });
            if let Some(issue) = found {
                return Ok(Some(issue.number));
            }
            if issues.len() < ISSUE_PAGE_SIZE {
                break;
            }
        }
        Ok(None)
    }

    async fn create_issue(&self, target: &RepoTarget, issue: &NewIssue) -> PlatformResult<u64> {
        const OP: &str = "create_issue";
        #[derive(Deserialize)]
        struct Created {
            number: u64,
        }

        let url = Self::repo_url(target, OP, &["issues"])?;
        let created: Created = self
            .json(
                OP,
                self.request(Method::POST, url, JSON_MEDIA).json(&json!({
                    "title": issue.title,
                    "body": issue.body,
                    "labels": issue.labels,
                })),
            )
            .await?;
        Ok(created.number)
    }
}
