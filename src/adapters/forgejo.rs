//! Forgejo / Gitea adapter
//!
//! Pushes go through the contents API one file at a time, so a push of N
//! files produces N commits and is not atomic.

use std::time::Instant;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};
use url::Url;

use super::capabilities::{AuthScheme, Capabilities, ProviderMetadata};
use super::http::{ApiClient, headers};
use super::rate_limit::RateLimitInfo;
use super::registry::{ProviderBinding, ProviderRegistry};
use super::trait_::{
    AdapterError, AdapterErrorKind, AdapterResult, BranchInfo, CommitInfo, CredentialReport,
    GitProvider, HealthReport, PullSnapshot, PushRequest, RepoCoordinates, RepositoryInfo,
    TreeEntry, Webhook, WebhookConfig,
};
use super::wire;
use crate::config::ProviderClientConfig;

pub const FORGEJO_KIND: &str = "forgejo";
const API_SUFFIX: &str = "/api/v1";
const RATE_LIMIT_PREFIXES: &[&str] = &["x-ratelimit-"];
const PAGE_SIZE: usize = 50;
const MAX_PAGES: usize = 20;

#[derive(Debug, Deserialize)]
struct ContentsEntry {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct ContentsResponse {
    commit: wire::Sha,
}

#[derive(Debug, Deserialize)]
struct Version {
    version: String,
}

/// Appends `/api/v1` unless the endpoint already points at the API root.
fn api_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim_end_matches('/');
    if trimmed.ends_with(API_SUFFIX) {
        trimmed.to_string()
    } else {
        format!("{trimmed}{API_SUFFIX}")
    }
}

/// Forgejo adapter
pub struct ForgejoAdapter {
    name: String,
    api: ApiClient,
    capabilities: Capabilities,
}

impl ForgejoAdapter {
    pub fn new(binding: &ProviderBinding, config: &ProviderClientConfig) -> AdapterResult<Self> {
        if binding.endpoint.is_empty() {
            return Err(AdapterError::configuration("Forgejo requires an endpoint"));
        }
        let token = binding.credentials.require_token("Forgejo")?;
        let default_headers = headers(&[
            ("authorization", format!("token {token}")),
            ("accept", "application/json".to_string()),
        ])?;
        let api = ApiClient::new(
            FORGEJO_KIND,
            &api_endpoint(&binding.endpoint),
            default_headers,
            RATE_LIMIT_PREFIXES,
            config,
        )?;

        Ok(Self {
            name: binding.name.clone(),
            api,
            capabilities: Capabilities::forgejo(),
        })
    }

    fn repo_url<'a, I>(&self, repo: &'a RepoCoordinates, rest: I) -> AdapterResult<Url>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut segments = vec!["repos", repo.owner.as_str(), repo.name.as_str()];
        segments.extend(rest);
        self.api.url(segments)
    }

    fn contents_url(&self, repo: &RepoCoordinates, file_path: &str) -> AdapterResult<Url> {
        let mut url = self.repo_url(repo, ["contents"])?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| AdapterError::configuration("Endpoint cannot be a base URL"))?;
            segments.extend(file_path.split('/').filter(|s| !s.is_empty()));
        }
        Ok(url)
    }

    /// Blob sha of `file_path` on `branch`, `None` when the file is new.
    async fn existing_sha(
        &self,
        repo: &RepoCoordinates,
        file_path: &str,
        branch: &str,
    ) -> AdapterResult<Option<String>> {
        let mut url = self.contents_url(repo, file_path)?;
        url.query_pairs_mut().append_pair("ref", branch);
        match self.api.get_json::<ContentsEntry>(url).await {
            Ok(entry) => Ok(Some(entry.sha)),
            Err(err) if err.kind == AdapterErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn branch_head(&self, repo: &RepoCoordinates, branch: &str) -> AdapterResult<String> {
        let mut url = self.repo_url(repo, ["branches"])?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| AdapterError::configuration("Endpoint cannot be a base URL"))?;
            segments.extend(branch.split('/'));
        }
        let branch_info: wire::Branch = self.api.get_json(url).await.map_err(|err| {
            match err.kind {
                AdapterErrorKind::NotFound => {
                    AdapterError::not_found(format!("Branch '{branch}' not found"))
                }
                _ => err,
            }
        })?;
        Ok(branch_info.commit.sha)
    }

    async fn fetch_commit(&self, repo: &RepoCoordinates, sha: &str) -> AdapterResult<wire::Commit> {
        self.api
            .get_json(self.repo_url(repo, ["git", "commits", sha])?)
            .await
    }
}

#[async_trait]
impl GitProvider for ForgejoAdapter {
    fn kind(&self) -> &'static str {
        FORGEJO_KIND
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    async fn validate_credentials(&self) -> AdapterResult<CredentialReport> {
        let user: wire::User = self.api.get_json(self.api.url(["user"])?).await?;
        info!(provider = %self.name, login = %user.login, "Forgejo credentials validated");

        Ok(CredentialReport {
            identity: Some(user.login.clone()),
            scopes: Vec::new(),
            details: json!({ "login": user.login, "id": user.id, "email": user.email }),
        })
    }

    async fn get_repository(&self, repo: &RepoCoordinates) -> AdapterResult<RepositoryInfo> {
        let wire: wire::Repository = self
            .api
            .get_json(self.repo_url(repo, std::iter::empty())?)
            .await?;
        Ok(wire.into())
    }

    async fn list_branches(&self, repo: &RepoCoordinates) -> AdapterResult<Vec<BranchInfo>> {
        let mut branches = Vec::new();
        for page in 1..=MAX_PAGES {
            let mut url = self.repo_url(repo, ["branches"])?;
            url.query_pairs_mut()
                .append_pair("limit", &PAGE_SIZE.to_string())
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
        Ok(self.fetch_commit(repo, sha).await?.into())
    }

    async fn push(
        &self,
        repo: &RepoCoordinates,
        request: &PushRequest,
    ) -> AdapterResult<CommitInfo> {
        self.capabilities.check_files(&request.files)?;

        let mut last_commit = None;
        for file in &request.files {
            let existing = self
                .existing_sha(repo, &file.path, &request.branch)
                .await?;
            let mut body = json!({
                "content": file.base64_content(),
                "message": request.message,
                "branch": request.branch,
                "author": { "name": request.author.name, "email": request.author.email },
            });
            let method = match existing {
                Some(sha) => {
                    body["sha"] = json!(sha);
                    Method::PUT
                }
                None => Method::POST,
            };
            debug!(repo = %repo, path = %file.path, %method, "writing file");
            let written: ContentsResponse = self
                .api
                .send_json(method, self.contents_url(repo, &file.path)?, &body)
                .await?;
            last_commit = Some(written.commit.sha);
        }

        let head = match last_commit {
            Some(sha) => sha,
            None => self.branch_head(repo, &request.branch).await?,
        };
        info!(
            repo = %repo,
            branch = %request.branch,
            sha = %head,
            files = request.files.len(),
            "pushed files to Forgejo"
        );
        self.get_commit(repo, &head).await
    }

    async fn pull(&self, repo: &RepoCoordinates, branch: &str) -> AdapterResult<PullSnapshot> {
        let head = self.branch_head(repo, branch).await?;
        let commit = self.fetch_commit(repo, &head).await?;
        let tree_sha = commit.tree_sha().unwrap_or(&head).to_string();

        let mut url = self.repo_url(repo, ["git", "trees", tree_sha.as_str()])?;
        url.query_pairs_mut()
            .append_pair("recursive", "true")
            .append_pair("per_page", "10000");
        let tree: wire::Tree = self.api.get_json(url).await?;

        Ok(PullSnapshot {
            branch: branch.to_string(),
            commit: commit.into(),
            tree: tree.tree.into_iter().map(TreeEntry::from).collect(),
        })
    }

    async fn create_webhook(
        &self,
        repo: &RepoCoordinates,
        config: &WebhookConfig,
    ) -> AdapterResult<Webhook> {
        self.capabilities.require_webhooks(FORGEJO_KIND)?;
        let hook: wire::Hook = self
            .api
            .send_json(
                Method::POST,
                self.repo_url(repo, ["hooks"])?,
                &json!({
                    "type": "gitea",
                    "active": true,
                    "events": config.events,
                    "config": {
                        "url": config.url,
                        "content_type": "json",
                        "secret": config.secret.clone().unwrap_or_default(),
                    },
                }),
            )
            .await?;
        Ok(hook.into_webhook(&config.url))
    }

    async fn delete_webhook(&self, repo: &RepoCoordinates, webhook_id: &str) -> AdapterResult<()> {
        self.capabilities.require_webhooks(FORGEJO_KIND)?;
        self.api.delete(self.repo_url(repo, ["hooks", webhook_id])?).await
    }

    async fn health(&self) -> AdapterResult<HealthReport> {
        let started = Instant::now();
        let version: AdapterResult<Version> = self.api.get_json(self.api.url(["version"])?).await;
        let result = match version {
            Ok(version) => Ok(json!({ "version": version.version })),
            // Some instances hide /version from token auth; /user proves reachability.
            Err(_) => self
                .api
                .get_json::<wire::User>(self.api.url(["user"])?)
                .await
                .map(|user| json!({ "login": user.login })),
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        Ok(match result {
            Ok(details) => HealthReport {
                healthy: true,
                latency_ms,
                details,
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
    Ok(Box::new(ForgejoAdapter::new(binding, config)?))
}

/// Register the Forgejo adapter with the registry
pub fn register_forgejo_adapter(registry: &mut ProviderRegistry) {
    registry.register(
        ProviderMetadata::new(FORGEJO_KIND, AuthScheme::Token, Capabilities::forgejo(), None),
        build,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::registry::Credentials;
    use crate::adapters::trait_::{CommitAuthor, FileChange, FileEncoding};
    use uuid::Uuid;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(endpoint: &str) -> ForgejoAdapter {
        let binding = ProviderBinding {
            id: Uuid::new_v4(),
            name: "codeberg".to_string(),
            kind: FORGEJO_KIND.to_string(),
            endpoint: endpoint.to_string(),
            credentials: Credentials {
                token: Some("fj-token".to_string()),
                ..Default::default()
            },
        };
        ForgejoAdapter::new(&binding, &ProviderClientConfig::default()).unwrap()
    }

    fn repo() -> RepoCoordinates {
        RepoCoordinates::new("team", "site")
    }

    fn commit_body(sha: &str, tree: &str) -> serde_json::Value {
        json!({
            "sha": sha,
            "commit": {
                "message": "sync",
                "author": {"name": "Mirror Sync", "email": "sync@example.com", "date": "2024-01-02T03:04:05Z"},
                "tree": {"sha": tree}
            },
            "parents": []
        })
    }

    #[test]
    fn appends_api_suffix_once() {
        assert_eq!(api_endpoint("https://codeberg.org/"), "https://codeberg.org/api/v1");
        assert_eq!(
            api_endpoint("https://codeberg.org/api/v1"),
            "https://codeberg.org/api/v1"
        );
    }

    #[test]
    fn requires_endpoint() {
        let binding = ProviderBinding {
            id: Uuid::new_v4(),
            name: "forge".to_string(),
            kind: FORGEJO_KIND.to_string(),
            endpoint: String::new(),
            credentials: Credentials::default(),
        };
        let err = ForgejoAdapter::new(&binding, &ProviderClientConfig::default())
            .err()
            .unwrap();
        assert_eq!(err.kind, AdapterErrorKind::Configuration);
    }

    #[tokio::test]
    async fn push_updates_existing_and_creates_new_files() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/repos/team/site/contents/README.md"))
            .and(query_param("ref", "main"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"sha": "old-blob"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/repos/team/site/contents/docs/new.md"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"message": "not found"})))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/v1/repos/team/site/contents/README.md"))
            .and(body_partial_json(json!({"sha": "old-blob", "branch": "main"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"commit": {"sha": "c1"}})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/repos/team/site/contents/docs/new.md"))
            .and(body_partial_json(json!({"content": "bmV3"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"commit": {"sha": "c2"}})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/repos/team/site/git/commits/c2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(commit_body("c2", "t2")))
            .mount(&server)
            .await;

        let request = PushRequest {
            branch: "main".to_string(),
            files: vec![
                FileChange {
                    path: "README.md".to_string(),
                    content: "updated".to_string(),
                    encoding: FileEncoding::Utf8,
                },
                FileChange {
                    path: "docs/new.md".to_string(),
                    content: "new".to_string(),
                    encoding: FileEncoding::Utf8,
                },
            ],
            message: "sync".to_string(),
            author: CommitAuthor {
                name: "Mirror Sync".to_string(),
                email: "sync@example.com".to_string(),
            },
        };

        let commit = adapter(&server.uri()).push(&repo(), &request).await.unwrap();
        assert_eq!(commit.sha, "c2");
        assert_eq!(commit.author.unwrap().email, "sync@example.com");
    }

    #[tokio::test]
    async fn pull_resolves_tree_from_head_commit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/repos/team/site/branches/main"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "main",
                "commit": {"id": "h1", "message": "head"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/repos/team/site/git/commits/h1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(commit_body("h1", "t1")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/repos/team/site/git/trees/t1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "sha": "t1",
                "tree": [{"path": "index.html", "mode": "100644", "type": "blob", "sha": "b1", "size": 12}]
            })))
            .mount(&server)
            .await;

        let snapshot = adapter(&server.uri()).pull(&repo(), "main").await.unwrap();
        assert_eq!(snapshot.commit.sha, "h1");
        assert_eq!(snapshot.tree[0].path, "index.html");
    }

    #[tokio::test]
    async fn health_falls_back_to_user_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/version"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/user"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"login": "bot"})))
            .mount(&server)
            .await;

        let report = adapter(&server.uri()).health().await.unwrap();
        assert!(report.healthy);
        assert_eq!(report.details["login"], "bot");
    }
}
