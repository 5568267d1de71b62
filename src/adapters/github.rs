//! GitHub adapter
//!
//! Talks to the GitHub REST v3 API (or a GitHub Enterprise endpoint). Pushes
//! go through the Git data API so that all files land in a single commit.

use std::time::Instant;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};
use url::Url;

use super::capabilities::{AuthScheme, Capabilities, ProviderMetadata};
use super::http::{ApiClient, decode_json, headers};
use super::rate_limit::RateLimitInfo;
use super::registry::{ProviderBinding, ProviderRegistry};
use super::trait_::{
    AdapterError, AdapterErrorKind, AdapterResult, BranchInfo, CommitInfo, CredentialReport,
    FileEncoding, GitProvider, HealthReport, PullSnapshot, PushRequest, RepoCoordinates,
    RepositoryInfo, TreeEntry, Webhook, WebhookConfig,
};
use super::wire;
use crate::config::ProviderClientConfig;

pub const GITHUB_KIND: &str = "github";
const DEFAULT_ENDPOINT: &str = "https://api.github.com";
const RATE_LIMIT_PREFIXES: &[&str] = &["x-ratelimit-"];
const PAGE_SIZE: usize = 100;
const MAX_PAGES: usize = 10;

#[derive(Debug, Deserialize)]
struct GitRef {
    object: wire::Sha,
}

#[derive(Debug, Deserialize)]
struct GitCommit {
    sha: String,
    tree: wire::Sha,
}

#[derive(Debug, Deserialize)]
struct BranchDetail {
    name: String,
    commit: wire::Commit,
}

#[derive(Debug, Deserialize)]
struct RateLimitResponse {
    rate: RateLimitBody,
}

#[derive(Debug, Deserialize)]
struct RateLimitBody {
    limit: u64,
    remaining: u64,
    reset: i64,
}

/// GitHub adapter
pub struct GitHubAdapter {
    name: String,
    api: ApiClient,
    capabilities: Capabilities,
}

impl GitHubAdapter {
    pub fn new(binding: &ProviderBinding, config: &ProviderClientConfig) -> AdapterResult<Self> {
        let token = binding.credentials.require_token("GitHub")?;
        let default_headers = headers(&[
            ("authorization", format!("token {token}")),
            ("accept", "application/vnd.github.v3+json".to_string()),
        ])?;
        let api = ApiClient::new(
            GITHUB_KIND,
            &binding.endpoint,
            default_headers,
            RATE_LIMIT_PREFIXES,
            config,
        )?;

        Ok(Self {
            name: binding.name.clone(),
            api,
            capabilities: Capabilities::github(),
        })
    }

    fn repo_url(&self, repo: &RepoCoordinates, rest: &[&str]) -> AdapterResult<Url> {
        let mut segments = vec!["repos", repo.owner.as_str(), repo.name.as_str()];
        segments.extend_from_slice(rest);
        self.api.url(segments)
    }

    /// `git/ref/heads/<branch>` with the branch's own slashes kept as path separators.
    fn ref_url(&self, repo: &RepoCoordinates, kind: &str, branch: &str) -> AdapterResult<Url> {
        let mut rest = vec!["git", kind, "heads"];
        rest.extend(branch.split('/'));
        self.repo_url(repo, &rest)
    }

    async fn create_blob(
        &self,
        repo: &RepoCoordinates,
        content: &str,
        encoding: FileEncoding,
    ) -> AdapterResult<String> {
        let encoding = match encoding {
            FileEncoding::Utf8 => "utf-8",
            FileEncoding::Base64 => "base64",
        };
        let blob: wire::Sha = self
            .api
            .send_json(
                Method::POST,
                self.repo_url(repo, &["git", "blobs"])?,
                &json!({ "content": content, "encoding": encoding }),
            )
            .await?;
        Ok(blob.sha)
    }
}

#[async_trait]
impl GitProvider for GitHubAdapter {
    fn kind(&self) -> &'static str {
        GITHUB_KIND
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    async fn validate_credentials(&self) -> AdapterResult<CredentialReport> {
        let response = self
            .api
            .send(self.api.request(Method::GET, self.api.url(["user"])?))
            .await?;
        let scopes: Vec<String> = response
            .headers()
            .get("x-oauth-scopes")
            .and_then(|v| v.to_str().ok())
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        let user: wire::User = decode_json(response).await?;
        info!(provider = %self.name, login = %user.login, "GitHub credentials validated");

        Ok(CredentialReport {
            identity: Some(user.login.clone()),
            scopes,
            details: json!({ "login": user.login, "id": user.id, "email": user.email }),
        })
    }

    async fn get_repository(&self, repo: &RepoCoordinates) -> AdapterResult<RepositoryInfo> {
        let wire: wire::Repository = self.api.get_json(self.repo_url(repo, &[])?).await?;
        Ok(wire.into())
    }

    async fn list_branches(&self, repo: &RepoCoordinates) -> AdapterResult<Vec<BranchInfo>> {
        let mut branches = Vec::new();
        for page in 1..=MAX_PAGES {
            let mut url = self.repo_url(repo, &["branches"])?;
            url.query_pairs_mut()
                .append_pair("per_page", &PAGE_SIZE.to_string())
                .append_pair("page", &page.to_string());
            let batch: Vec<wire::Branch> = self.api.get_json(url).await?;
            let done = batch.len() < PAGE_SIZE;
            branches.extend(batch.into_iter().map(BranchInfo::from));
            if done {
                break;
            }
        }
        Ok(branches)
    }

    async fn get_commit(&self, repo: &RepoCoordinates, sha: &str) -> AdapterResult<CommitInfo> {
        let commit: wire::Commit = self
            .api
            .get_json(self.repo_url(repo, &["commits", sha])?)
            .await?;
        Ok(commit.into())
    }

    async fn push(
        &self,
        repo: &RepoCoordinates,
        request: &PushRequest,
    ) -> AdapterResult<CommitInfo> {
        self.capabilities.check_files(&request.files)?;

        let head: GitRef = self
            .api
            .get_json(self.ref_url(repo, "ref", &request.branch)?)
            .await?;
        let head_sha = head.object.sha;
        let base: GitCommit = self
            .api
            .get_json(self.repo_url(repo, &["git", "commits", head_sha.as_str()])?)
            .await?;

        let mut entries = Vec::with_capacity(request.files.len());
        for file in &request.files {
            let blob_sha = self.create_blob(repo, &file.content, file.encoding).await?;
            entries.push(json!({
                "path": file.path,
                "mode": "100644",
                "type": "blob",
                "sha": blob_sha,
            }));
        }

        let tree: wire::Sha = self
            .api
            .send_json(
                Method::POST,
                self.repo_url(repo, &["git", "trees"])?,
                &json!({ "base_tree": base.tree.sha, "tree": entries }),
            )
            .await?;

        // Redelivered pushes produce an identical tree; keep the existing head.
        if tree.sha == base.tree.sha {
            debug!(repo = %repo, branch = %request.branch, "tree unchanged, skipping commit");
            return self.get_commit(repo, &base.sha).await;
        }

        let commit: wire::Sha = self
            .api
            .send_json(
                Method::POST,
                self.repo_url(repo, &["git", "commits"])?,
                &json!({
                    "message": request.message,
                    "tree": tree.sha,
                    "parents": [head_sha],
                    "author": { "name": request.author.name, "email": request.author.email },
                }),
            )
            .await?;

        self.api
            .send(
                self.api
                    .request(Method::PATCH, self.ref_url(repo, "refs", &request.branch)?)
                    .json(&json!({ "sha": commit.sha, "force": false })),
            )
            .await?;

        info!(
            repo = %repo,
            branch = %request.branch,
            sha = %commit.sha,
            files = request.files.len(),
            "pushed commit to GitHub"
        );
        self.get_commit(repo, &commit.sha).await
    }

    async fn pull(&self, repo: &RepoCoordinates, branch: &str) -> AdapterResult<PullSnapshot> {
        let detail: BranchDetail = self
            .api
            .get_json(self.repo_url(repo, &["branches", branch])?)
            .await
            .map_err(|err| match err.kind {
                AdapterErrorKind::NotFound => {
                    AdapterError::not_found(format!("Branch '{branch}' not found"))
                }
                _ => err,
            })?;

        let tree_sha = detail
            .commit
            .tree_sha()
            .map(str::to_string)
            .ok_or_else(|| AdapterError::malformed("Branch commit has no tree"))?;
        let mut url = self.repo_url(repo, &["git", "trees", tree_sha.as_str()])?;
        url.query_pairs_mut().append_pair("recursive", "1");
        let tree: wire::Tree = self.api.get_json(url).await?;
        if tree.truncated {
            warn!(repo = %repo, branch, "GitHub truncated the tree listing");
        }

        Ok(PullSnapshot {
            branch: detail.name,
            commit: detail.commit.into(),
            tree: tree.tree.into_iter().map(TreeEntry::from).collect(),
        })
    }

    async fn create_webhook(
        &self,
        repo: &RepoCoordinates,
        config: &WebhookConfig,
    ) -> AdapterResult<Webhook> {
        self.capabilities.require_webhooks(GITHUB_KIND)?;
        let hook: wire::Hook = self
            .api
            .send_json(
                Method::POST,
                self.repo_url(repo, &["hooks"])?,
                &json!({
                    "name": "web",
                    "active": true,
                    "events": config.events,
                    "config": {
                        "url": config.url,
                        "content_type": "json",
                        "secret": config.secret,
                        "insecure_ssl": "0",
                    },
                }),
            )
            .await?;
        Ok(hook.into_webhook(&config.url))
    }

    async fn delete_webhook(&self, repo: &RepoCoordinates, webhook_id: &str) -> AdapterResult<()> {
        self.capabilities.require_webhooks(GITHUB_KIND)?;
        self.api.delete(self.repo_url(repo, &["hooks", webhook_id])?).await
    }

    async fn health(&self) -> AdapterResult<HealthReport> {
        let started = Instant::now();
        let result: AdapterResult<RateLimitResponse> =
            self.api.get_json(self.api.url(["rate_limit"])?).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        Ok(match result {
            Ok(body) => HealthReport {
                healthy: true,
                latency_ms,
                details: json!({
                    "rate_limit": {
                        "limit": body.rate.limit,
                        "remaining": body.rate.remaining,
                        "reset": body.rate.reset,
                    }
                }),
            },
            Err(err) => HealthReport {
                healthy: false,
                latency_ms,
                details: json!({ "error": err.message }),
            },
        })
    }

    fn rate_limit(&self) -> Option<RateLimitInfo> {
        self.api.rate_limit()
    }
}

fn build(
    binding: &ProviderBinding,
    config: &ProviderClientConfig,
) -> Result<Box<dyn GitProvider>, AdapterError> {
    Ok(Box::new(GitHubAdapter::new(binding, config)?))
}

/// Register the GitHub adapter with the registry
pub fn register_github_adapter(registry: &mut ProviderRegistry) {
    registry.register(
        ProviderMetadata::new(
            GITHUB_KIND,
            AuthScheme::Token,
            Capabilities::github(),
            Some(DEFAULT_ENDPOINT),
        ),
        build,
    );
}
