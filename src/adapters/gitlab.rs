//! GitLab adapter (gitlab.com or self-managed, API v4).

use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use tracing::{debug, info};
use url::Url;

use super::capabilities::{AuthScheme, Capabilities, ProviderMetadata};
use super::http::{ApiClient, headers};
use super::rate_limit::RateLimitInfo;
use super::registry::{ProviderBinding, ProviderRegistry};
use super::trait_::{
    AdapterError, AdapterErrorKind, AdapterResult, BranchInfo, CommitInfo, CredentialReport,
    FileEncoding, GitProvider, HealthReport, PullSnapshot, PushRequest, RepoCoordinates,
    RepositoryInfo, Signature, TreeEntry, Webhook, WebhookConfig,
};
use super::wire;
use crate::config::ProviderClientConfig;

pub const GITLAB_KIND: &str = "gitlab";
const DEFAULT_ENDPOINT: &str = "https://gitlab.com/api/v4";
const RATE_LIMIT_PREFIXES: &[&str] = &["ratelimit-", "x-ratelimit-"];
const PAGE_SIZE: usize = 100;
const MAX_PAGES: usize = 50;

#[derive(Debug, Deserialize)]
struct User {
    id: u64,
    username: String,
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenInfo {
    #[serde(default)]
    scopes: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ProjectStatistics {
    repository_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Project {
    name: String,
    path_with_namespace: String,
    description: Option<String>,
    visibility: Option<String>,
    default_branch: Option<String>,
    http_url_to_repo: String,
    ssh_url_to_repo: Option<String>,
    web_url: Option<String>,
    created_at: Option<DateTime<Utc>>,
    last_activity_at: Option<DateTime<Utc>>,
    statistics: Option<ProjectStatistics>,
    #[serde(default)]
    topics: Vec<String>,
}

impl From<Project> for RepositoryInfo {
    fn from(project: Project) -> Self {
        RepositoryInfo {
            name: project.name,
            full_name: project.path_with_namespace,
            description: project.description.filter(|d| !d.is_empty()),
            private: project.visibility.as_deref() != Some("public"),
            default_branch: project.default_branch.unwrap_or_else(|| "main".to_string()),
            clone_url: project.http_url_to_repo,
            ssh_url: project.ssh_url_to_repo,
            web_url: project.web_url,
            size_kb: project
                .statistics
                .and_then(|stats| stats.repository_size)
                .map(|bytes| bytes / 1024),
            created_at: project.created_at,
            updated_at: project.last_activity_at,
            topics: project.topics,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Commit {
    id: String,
    #[serde(default)]
    message: String,
    author_name: Option<String>,
    author_email: Option<String>,
    authored_date: Option<DateTime<Utc>>,
    committer_name: Option<String>,
    committer_email: Option<String>,
    committed_date: Option<DateTime<Utc>>,
    #[serde(default)]
    parent_ids: Vec<String>,
    web_url: Option<String>,
}

fn signature(
    name: Option<String>,
    email: Option<String>,
    date: Option<DateTime<Utc>>,
) -> Option<Signature> {
    name.map(|name| Signature {
        name,
        email: email.unwrap_or_default(),
        date,
    })
}

impl From<Commit> for CommitInfo {
    fn from(commit: Commit) -> Self {
        CommitInfo {
            sha: commit.id,
            message: commit.message,
            author: signature(commit.author_name, commit.author_email, commit.authored_date),
            committer: signature(
                commit.committer_name,
                commit.committer_email,
                commit.committed_date,
            ),
            parents: commit.parent_ids,
            url: commit.web_url,
        }
    }
}

#[derive(Debug, Deserialize)]
struct BranchDetail {
    name: String,
    commit: Commit,
}

#[derive(Debug, Deserialize)]
struct TreeItem {
    id: String,
    path: String,
    #[serde(rename = "type")]
    kind: String,
    mode: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Hook {
    id: u64,
    url: String,
}

#[derive(Debug, Deserialize)]
struct Version {
    version: String,
    revision: Option<String>,
}

/// GitLab adapter
pub struct GitLabAdapter {
    name: String,
    api: ApiClient,
    capabilities: Capabilities,
}

impl GitLabAdapter {
    pub fn new(binding: &ProviderBinding, config: &ProviderClientConfig) -> AdapterResult<Self> {
        let token = binding.credentials.require_token("GitLab")?;
        let default_headers = headers(&[("private-token", token.to_string())])?;
        let api = ApiClient::new(
            GITLAB_KIND,
            &binding.endpoint,
            default_headers,
            RATE_LIMIT_PREFIXES,
            config,
        )?;

        Ok(Self {
            name: binding.name.clone(),
            api,
            capabilities: Capabilities::gitlab(),
        })
    }

    /// `projects/<namespace%2Fproject>/...`
    fn project_url(&self, repo: &RepoCoordinates, rest: &[&str]) -> AdapterResult<Url> {
        let project = repo.full_name();
        let mut segments = vec!["projects", project.as_str()];
        segments.extend_from_slice(rest);
        self.api.url(segments)
    }

    async fn file_exists(
        &self,
        repo: &RepoCoordinates,
        file_path: &str,
        branch: &str,
    ) -> AdapterResult<bool> {
        let mut url = self.project_url(repo, &["repository", "files", file_path])?;
        url.query_pairs_mut().append_pair("ref", branch);
        match self.api.send(self.api.request(Method::HEAD, url)).await {
            Ok(_) => Ok(true),
            Err(err) if err.kind == AdapterErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl GitProvider for GitLabAdapter {
    fn kind(&self) -> &'static str {
        GITLAB_KIND
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    async fn validate_credentials(&self) -> AdapterResult<CredentialReport> {
        let user: User = self.api.get_json(self.api.url(["user"])?).await?;

        // Older instances lack this endpoint; scopes are informational.
        let scopes = match self
            .api
            .get_json::<TokenInfo>(self.api.url(["personal_access_tokens", "self"])?)
            .await
        {
            Ok(info) => info.scopes,
            Err(err) => {
                debug!(provider = %self.name, error = %err, "token scopes unavailable");
                Vec::new()
            }
        };
        info!(provider = %self.name, username = %user.username, "GitLab credentials validated");

        Ok(CredentialReport {
            identity: Some(user.username.clone()),
            scopes,
            details: json!({ "id": user.id, "username": user.username, "email": user.email }),
        })
    }

    async fn get_repository(&self, repo: &RepoCoordinates) -> AdapterResult<RepositoryInfo> {
        let mut url = self.project_url(repo, &[])?;
        url.query_pairs_mut().append_pair("statistics", "true");
        let project: Project = self.api.get_json(url).await?;
        Ok(project.into())
    }

    async fn list_branches(&self, repo: &RepoCoordinates) -> AdapterResult<Vec<BranchInfo>> {
        let mut branches = Vec::new();
        for page in 1..=MAX_PAGES {
            let mut url = self.project_url(repo, &["repository", "branches"])?;
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
        let commit: Commit = self
            .api
            .get_json(self.project_url(repo, &["repository", "commits", sha])?)
            .await?;
        Ok(commit.into())
    }

    async fn push(
        &self,
        repo: &RepoCoordinates,
        request: &PushRequest,
    ) -> AdapterResult<CommitInfo> {
        self.capabilities.check_files(&request.files)?;

        let mut actions: Vec<JsonValue> = Vec::with_capacity(request.files.len());
        for file in &request.files {
            let action = if self.file_exists(repo, &file.path, &request.branch).await? {
                "update"
            } else {
                "create"
            };
            let encoding = match file.encoding {
                FileEncoding::Utf8 => "text",
                FileEncoding::Base64 => "base64",
            };
            actions.push(json!({
                "action": action,
                "file_path": file.path,
                "content": file.content,
                "encoding": encoding,
            }));
        }

        let commit: Commit = self
            .api
            .send_json(
                Method::POST,
                self.project_url(repo, &["repository", "commits"])?,
                &json!({
                    "branch": request.branch,
                    "commit_message": request.message,
                    "author_name": request.author.name,
                    "author_email": request.author.email,
                    "actions": actions,
                }),
            )
            .await?;

        info!(
            repo = %repo,
            branch = %request.branch,
            sha = %commit.id,
            files = request.files.len(),
            "pushed commit to GitLab"
        );
        Ok(commit.into())
    }

    async fn pull(&self, repo: &RepoCoordinates, branch: &str) -> AdapterResult<PullSnapshot> {
        let detail: BranchDetail = self
            .api
            .get_json(self.project_url(repo, &["repository", "branches", branch])?)
            .await
            .map_err(|err| match err.kind {
                AdapterErrorKind::NotFound => {
                    AdapterError::not_found(format!("Branch '{branch}' not found"))
                }
                _ => err,
            })?;

        let mut tree = Vec::new();
        for page in 1..=MAX_PAGES {
            let mut url = self.project_url(repo, &["repository", "tree"])?;
            url.query_pairs_mut()
                .append_pair("ref", branch)
                .append_pair("recursive", "true")
                .append_pair("per_page", &PAGE_SIZE.to_string())
                .append_pair("page", &page.to_string());
            let batch: Vec<TreeItem> = self.api.get_json(url).await?;
            let done = batch.len() < PAGE_SIZE;
            tree.extend(batch.into_iter().map(|item| TreeEntry {
                path: item.path,
                mode: item.mode,
                kind: item.kind,
                sha: item.id,
                size: None,
            }));
            if done {
                break;
            }
        }

        Ok(PullSnapshot {
            branch: detail.name,
            commit: detail.commit.into(),
            tree,
        })
    }

    async fn create_webhook(
        &self,
        repo: &RepoCoordinates,
        config: &WebhookConfig,
    ) -> AdapterResult<Webhook> {
        self.capabilities.require_webhooks(GITLAB_KIND)?;

        let mut body = json!({
            "url": config.url,
            "enable_ssl_verification": true,
        });
        if let Some(secret) = &config.secret {
            body["token"] = json!(secret);
        }
        for event in &config.events {
            body[format!("{event}_events")] = json!(true);
        }

        let hook: Hook = self
            .api
            .send_json(Method::POST, self.project_url(repo, &["hooks"])?, &body)
            .await?;
        Ok(Webhook {
            id: hook.id.to_string(),
            url: hook.url,
            events: config.events.clone(),
            active: true,
        })
    }

    async fn delete_webhook(&self, repo: &RepoCoordinates, webhook_id: &str) -> AdapterResult<()> {
        self.capabilities.require_webhooks(GITLAB_KIND)?;
        self.api
            .delete(self.project_url(repo, &["hooks", webhook_id])?)
            .await
    }

    async fn health(&self) -> AdapterResult<HealthReport> {
        let started = Instant::now();
        let result: AdapterResult<Version> = self.api.get_json(self.api.url(["version"])?).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        Ok(match result {
            Ok(version) => HealthReport {
                healthy: true,
                latency_ms,
                details: json!({ "version": version.version, "revision": version.revision }),
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
    Ok(Box::new(GitLabAdapter::new(binding, config)?))
}

/// Register the GitLab adapter with the registry
pub fn register_gitlab_adapter(registry: &mut ProviderRegistry) {
    registry.register(
        ProviderMetadata::new(
            GITLAB_KIND,
            AuthScheme::PrivateToken,
            Capabilities::gitlab(),
            Some(DEFAULT_ENDPOINT),
        ),
        build,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::registry::Credentials;
    use crate::adapters::trait_::{CommitAuthor, FileChange};
    use uuid::Uuid;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(endpoint: &str) -> GitLabAdapter {
        let binding = ProviderBinding {
            id: Uuid::new_v4(),
            name: "gitlab-mirror".to_string(),
            kind: GITLAB_KIND.to_string(),
            endpoint: format!("{endpoint}/api/v4"),
            credentials: Credentials {
                token: Some("glpat-test".to_string()),
                ..Default::default()
            },
        };
        GitLabAdapter::new(&binding, &ProviderClientConfig::default()).unwrap()
    }

    fn repo() -> RepoCoordinates {
        RepoCoordinates::new("group/sub", "project")
    }

    #[tokio::test]
    async fn encodes_nested_namespace_in_project_path() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/projects/group%2Fsub%2Fproject"))
            .and(header("private-token", "glpat-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "project",
                "path_with_namespace": "group/sub/project",
                "visibility": "private",
                "default_branch": "develop",
                "http_url_to_repo": "https://gitlab.example.com/group/sub/project.git",
                "statistics": {"repository_size": 20480}
            })))
            .mount(&server)
            .await;

        let info = adapter(&server.uri()).get_repository(&repo()).await.unwrap();
        assert_eq!(info.default_branch, "develop");
        assert!(info.private);
        assert_eq!(info.size_kb, Some(20));
    }

    #[tokio::test]
    async fn push_picks_create_or_update_per_file() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/api/v4/projects/group%2Fsub%2Fproject/repository/files/README.md"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/api/v4/projects/group%2Fsub%2Fproject/repository/files/docs%2Fnew.md"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v4/projects/group%2Fsub%2Fproject/repository/commits"))
            .and(body_partial_json(json!({
                "branch": "main",
                "actions": [
                    {"action": "update", "file_path": "README.md"},
                    {"action": "create", "file_path": "docs/new.md"}
                ]
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "c0ffee",
                "message": "sync",
                "author_name": "Mirror Sync",
                "author_email": "sync@example.com",
                "parent_ids": ["beef"]
            })))
            .expect(1)
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
        assert_eq!(commit.sha, "c0ffee");
        assert_eq!(commit.author.unwrap().name, "Mirror Sync");
    }

    #[tokio::test]
    async fn pull_lists_tree_for_branch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/projects/group%2Fsub%2Fproject/repository/branches/main"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "main",
                "commit": {"id": "abc", "message": "init", "parent_ids": []}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v4/projects/group%2Fsub%2Fproject/repository/tree"))
            .and(query_param("ref", "main"))
            .and(query_param("recursive", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": "b1", "name": "README.md", "type": "blob", "path": "README.md", "mode": "100644"}
            ])))
            .mount(&server)
            .await;

        let snapshot = adapter(&server.uri()).pull(&repo(), "main").await.unwrap();
        assert_eq!(snapshot.commit.sha, "abc");
        assert_eq!(snapshot.tree[0].sha, "b1");
    }

    #[tokio::test]
    async fn webhook_events_map_to_flags() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v4/projects/group%2Fsub%2Fproject/hooks"))
            .and(body_partial_json(json!({"push_events": true, "token": "s3cret"})))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(json!({"id": 7, "url": "https://hooks.example.com"})),
            )
            .mount(&server)
            .await;

        let hook = adapter(&server.uri())
            .create_webhook(
                &repo(),
                &WebhookConfig {
                    url: "https://hooks.example.com".to_string(),
                    events: vec!["push".to_string()],
                    secret: Some("s3cret".to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(hook.id, "7");
    }

    #[tokio::test]
    async fn health_reads_version_and_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/version"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("ratelimit-remaining", "590")
                    .insert_header("ratelimit-limit", "600")
                    .insert_header("ratelimit-reset", "1700000000")
                    .set_body_json(json!({"version": "16.8.0", "revision": "abc"})),
            )
            .mount(&server)
            .await;

        let gitlab = adapter(&server.uri());
        let report = gitlab.health().await.unwrap();
        assert!(report.healthy);
        assert_eq!(report.details["version"], "16.8.0");
        assert_eq!(gitlab.rate_limit().unwrap().limit, 600);
    }
}
