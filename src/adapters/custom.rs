//! Generic HTTP Git server adapter
//!
//! Speaks only the read side of the smart HTTP protocol: the ref
//! advertisement at `<repo>.git/info/refs?service=git-upload-pack`. Writes,
//! webhooks and tree listings are out of reach over plain HTTP.

use std::sync::LazyLock;
use std::time::Instant;

use async_trait::async_trait;
use base64::Engine;
use regex::Regex;
use reqwest::{Method, StatusCode};
use serde_json::json;
use tracing::{debug, info};
use url::Url;

use super::capabilities::{AuthScheme, Capabilities, ProviderMetadata};
use super::http::{ApiClient, headers};
use super::rate_limit::RateLimitInfo;
use super::registry::{ProviderBinding, ProviderRegistry};
use super::trait_::{
    AdapterError, AdapterResult, BranchInfo, CommitInfo, CredentialReport, GitProvider,
    HealthReport, PullSnapshot, PushRequest, RepoCoordinates, RepositoryInfo, Webhook,
    WebhookConfig,
};
use crate::config::ProviderClientConfig;

pub const CUSTOM_KIND: &str = "custom";
const HEADS_PREFIX: &str = "refs/heads/";
const DEFAULT_BRANCH_CANDIDATES: &[&str] = &["main", "master", "develop", "trunk"];

static REF_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9a-f]{40})\s+([^\x00\s]+)").expect("ref line pattern should compile")
});

static SYMREF_HEAD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"symref=HEAD:refs/heads/([^\x00\s]+)").expect("symref pattern should compile")
});

/// One `<sha> <refname>` pair from a ref advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisedRef {
    pub sha: String,
    pub name: String,
}

/// Parsed ref advertisement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefAdvertisement {
    pub refs: Vec<AdvertisedRef>,
    /// Target of `symref=HEAD:` in the capability list, when advertised
    pub head_symref: Option<String>,
}

impl RefAdvertisement {
    /// Parses pkt-line framed output as well as the plain `<sha>\t<ref>`
    /// listing of the dumb protocol.
    pub fn parse(body: &str) -> Self {
        let mut advertisement = RefAdvertisement::default();

        for raw in body.lines() {
            let mut line = raw;
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            // The first ref follows the service header's flush-pkt on the same line.
            if line.starts_with("0000") && is_framed_ref(&line[4..]) {
                line = &line[4..];
            }
            if is_framed_ref(line) {
                line = &line[4..];
            }

            if advertisement.head_symref.is_none()
                && let Some(caps) = SYMREF_HEAD.captures(line)
            {
                advertisement.head_symref = Some(caps[1].to_string());
            }

            if let Some(caps) = REF_LINE.captures(line) {
                advertisement.refs.push(AdvertisedRef {
                    sha: caps[1].to_string(),
                    name: caps[2].to_string(),
                });
            }
        }

        advertisement
    }

    pub fn sha_of(&self, name: &str) -> Option<&str> {
        self.refs
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.sha.as_str())
    }

    pub fn branches(&self) -> impl Iterator<Item = (&str, &str)> {
        self.refs.iter().filter_map(|r| {
            r.name
                .strip_prefix(HEADS_PREFIX)
                .map(|branch| (branch, r.sha.as_str()))
        })
    }

    /// HEAD's symref, else the branch HEAD points at, else a conventional
    /// name, else the first branch.
    pub fn default_branch(&self) -> Option<String> {
        if let Some(symref) = &self.head_symref {
            return Some(symref.clone());
        }
        if let Some(head) = self.sha_of("HEAD")
            && let Some((branch, _)) = self.branches().find(|(_, sha)| *sha == head)
        {
            return Some(branch.to_string());
        }
        DEFAULT_BRANCH_CANDIDATES
            .iter()
            .find(|candidate| self.branches().any(|(branch, _)| branch == **candidate))
            .map(|candidate| candidate.to_string())
            .or_else(|| self.branches().next().map(|(branch, _)| branch.to_string()))
    }
}

/// A pkt-line length prefix directly followed by an object id.
fn is_framed_ref(line: &str) -> bool {
    line.len() >= 44 && line.as_bytes()[..44].iter().all(u8::is_ascii_hexdigit)
}

/// Strips a leading `refs/heads/` so callers can pass either form.
pub fn sanitize_branch(branch: &str) -> &str {
    branch.strip_prefix(HEADS_PREFIX).unwrap_or(branch)
}

/// Adapter for plain HTTP Git servers
pub struct CustomGitAdapter {
    name: String,
    endpoint: String,
    api: ApiClient,
    capabilities: Capabilities,
    test_repository: Option<String>,
}

impl CustomGitAdapter {
    pub fn new(binding: &ProviderBinding, config: &ProviderClientConfig) -> AdapterResult<Self> {
        if binding.endpoint.is_empty() {
            return Err(AdapterError::configuration(
                "Custom Git servers require an endpoint",
            ));
        }

        let credentials = &binding.credentials;
        let auth = if let Some(token) = credentials.token.as_deref().filter(|t| !t.is_empty()) {
            vec![("authorization", format!("Bearer {token}"))]
        } else if let (Some(user), Some(pass)) = (&credentials.username, &credentials.password) {
            let encoded =
                base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
            vec![("authorization", format!("Basic {encoded}"))]
        } else if let Some(key) = &credentials.api_key {
            vec![("x-api-key", key.clone())]
        } else {
            Vec::new()
        };

        let api = ApiClient::new(CUSTOM_KIND, &binding.endpoint, headers(&auth)?, &[], config)?;

        Ok(Self {
            name: binding.name.clone(),
            endpoint: binding.endpoint.trim_end_matches('/').to_string(),
            api,
            capabilities: Capabilities::generic(),
            test_repository: credentials.test_repository.clone(),
        })
    }

    fn refs_url(&self, repo_path: &str) -> AdapterResult<Url> {
        let mut segments: Vec<&str> = repo_path.split('/').filter(|s| !s.is_empty()).collect();
        segments.extend(["info", "refs"]);
        let mut url = self.api.url(segments)?;
        url.query_pairs_mut()
            .append_pair("service", "git-upload-pack");
        Ok(url)
    }

    fn repo_path(repo: &RepoCoordinates) -> String {
        format!("{}/{}.git", repo.owner, repo.name)
    }

    async fn advertisement(&self, repo: &RepoCoordinates) -> AdapterResult<RefAdvertisement> {
        let url = self.refs_url(&Self::repo_path(repo))?;
        let response = self
            .api
            .send_raw(self.api.request(Method::GET, url))
            .await?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(AdapterError::unauthorized("Invalid credentials"))
            }
            StatusCode::NOT_FOUND => Err(AdapterError::not_found("Repository not found")),
            status if !status.is_success() => Err(AdapterError::http(
                status.as_u16(),
                format!("Request failed with status {}", status.as_u16()),
            )),
            _ => {
                let body = response.text().await?;
                Ok(RefAdvertisement::parse(&body))
            }
        }
    }

    fn minimal_commit(&self, repo: &RepoCoordinates, sha: &str) -> CommitInfo {
        CommitInfo {
            sha: sha.to_string(),
            message: String::new(),
            author: None,
            committer: None,
            parents: Vec::new(),
            url: Some(format!(
                "{}/{}/commit/{}",
                self.endpoint,
                Self::repo_path(repo),
                sha
            )),
        }
    }
}

#[async_trait]
impl GitProvider for CustomGitAdapter {
    fn kind(&self) -> &'static str {
        CUSTOM_KIND
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    async fn validate_credentials(&self) -> AdapterResult<CredentialReport> {
        let probe = self.test_repository.as_deref().unwrap_or("test.git");
        let response = self
            .api
            .send_raw(self.api.request(Method::GET, self.refs_url(probe)?))
            .await?;
        let status = response.status();

        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(AdapterError::unauthorized("Invalid credentials"));
        }
        if status.is_server_error() {
            return Err(AdapterError::http(
                status.as_u16(),
                format!("Request failed with status {}", status.as_u16()),
            ));
        }
        info!(provider = %self.name, status = status.as_u16(), "custom Git server reachable");

        Ok(CredentialReport {
            identity: None,
            scopes: Vec::new(),
            details: json!({
                "authenticated": true,
                "server_type": CUSTOM_KIND,
                "status": status.as_u16(),
            }),
        })
    }

    async fn get_repository(&self, repo: &RepoCoordinates) -> AdapterResult<RepositoryInfo> {
        let advertisement = self.advertisement(repo).await?;
        let clone_url = format!("{}/{}", self.endpoint, Self::repo_path(repo));
        let ssh_url = Url::parse(&clone_url)
            .ok()
            .and_then(|url| {
                url.host_str()
                    .map(|host| format!("git@{host}:{}", url.path().trim_start_matches('/')))
            });

        Ok(RepositoryInfo {
            name: repo.name.clone(),
            full_name: repo.full_name(),
            description: None,
            private: true,
            default_branch: advertisement
                .default_branch()
                .unwrap_or_else(|| "master".to_string()),
            clone_url: clone_url.clone(),
            ssh_url,
            web_url: Some(clone_url),
            size_kb: None,
            created_at: None,
            updated_at: None,
            topics: Vec::new(),
        })
    }

    async fn list_branches(&self, repo: &RepoCoordinates) -> AdapterResult<Vec<BranchInfo>> {
        let advertisement = self.advertisement(repo).await?;
        Ok(advertisement
            .branches()
            .map(|(name, sha)| BranchInfo {
                name: name.to_string(),
                commit_sha: sha.to_string(),
                protected: false,
            })
            .collect())
    }

    async fn get_commit(&self, repo: &RepoCoordinates, sha: &str) -> AdapterResult<CommitInfo> {
        let advertisement = self.advertisement(repo).await?;
        if advertisement.refs.iter().any(|r| r.sha == sha) {
            Ok(self.minimal_commit(repo, sha))
        } else {
            Err(AdapterError::not_found(format!(
                "Commit {sha} is not advertised by the server"
            )))
        }
    }

    async fn push(
        &self,
        _repo: &RepoCoordinates,
        _request: &PushRequest,
    ) -> AdapterResult<CommitInfo> {
        Err(AdapterError::unsupported(
            "Push operations are not supported for custom Git servers via HTTP. Please use Git CLI or SSH.",
        ))
    }

    async fn pull(&self, repo: &RepoCoordinates, branch: &str) -> AdapterResult<PullSnapshot> {
        let branch = sanitize_branch(branch);
        let advertisement = self.advertisement(repo).await?;
        let sha = advertisement
            .sha_of(&format!("{HEADS_PREFIX}{branch}"))
            .ok_or_else(|| AdapterError::not_found(format!("Branch '{branch}' not found")))?;
        debug!(repo = %repo, branch, sha, "resolved branch head");

        Ok(PullSnapshot {
            branch: branch.to_string(),
            commit: self.minimal_commit(repo, sha),
            tree: Vec::new(),
        })
    }

    async fn create_webhook(
        &self,
        _repo: &RepoCoordinates,
        _config: &WebhookConfig,
    ) -> AdapterResult<Webhook> {
        Err(AdapterError::unsupported(
            "Webhooks are not supported for custom Git servers",
        ))
    }

    async fn delete_webhook(&self, _repo: &RepoCoordinates, _webhook_id: &str) -> AdapterResult<()> {
        Err(AdapterError::unsupported(
            "Webhooks are not supported for custom Git servers",
        ))
    }

    async fn health(&self) -> AdapterResult<HealthReport> {
        let started = Instant::now();
        let result = self
            .api
            .send_raw(self.api.request(Method::GET, self.api.base().clone()))
            .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        Ok(match result {
            Ok(response) => {
                let status = response.status().as_u16();
                HealthReport {
                    healthy: status < 400,
                    latency_ms,
                    details: json!({ "status": status, "server_type": CUSTOM_KIND }),
                }
            }
            Err(err) => HealthReport {
                healthy: false,
                latency_ms,
                details: json!({ "error": err.message }),
            },
        })
    }

    fn rate_limit(&self) -> Option<RateLimitInfo> {
        None
    }
}

fn build(
    binding: &ProviderBinding,
    config: &ProviderClientConfig,
) -> Result<Box<dyn GitProvider>, AdapterError> {
    Ok(Box::new(CustomGitAdapter::new(binding, config)?))
}

/// Register the generic HTTP Git adapter with the registry
pub fn register_custom_adapter(registry: &mut ProviderRegistry) {
    registry.register(
        ProviderMetadata::new(
            CUSTOM_KIND,
            AuthScheme::Flexible,
            Capabilities::generic(),
            None,
        ),
        build,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::registry::Credentials;
    use crate::adapters::trait_::{AdapterErrorKind, CommitAuthor};
    use uuid::Uuid;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const MAIN_SHA: &str = "1111111111111111111111111111111111111111";
    const DEV_SHA: &str = "2222222222222222222222222222222222222222";

    fn smart_advertisement() -> String {
        format!(
            "001e# service=git-upload-pack\n0000\
             00f1{MAIN_SHA} HEAD\0multi_ack thin-pack side-band symref=HEAD:refs/heads/main agent=git/2.43\n\
             003f{MAIN_SHA} refs/heads/main\n\
             003e{DEV_SHA} refs/heads/dev\n\
             0000"
        )
    }

    fn adapter(endpoint: &str, credentials: Credentials) -> CustomGitAdapter {
        let binding = ProviderBinding {
            id: Uuid::new_v4(),
            name: "in-house".to_string(),
            kind: CUSTOM_KIND.to_string(),
            endpoint: endpoint.to_string(),
            credentials,
        };
        CustomGitAdapter::new(&binding, &ProviderClientConfig::default()).unwrap()
    }

    #[test]
    fn parses_pkt_line_advertisement() {
        let advertisement = RefAdvertisement::parse(&smart_advertisement());
        assert_eq!(advertisement.sha_of("HEAD"), Some(MAIN_SHA));
        assert_eq!(advertisement.sha_of("refs/heads/dev"), Some(DEV_SHA));
        assert_eq!(advertisement.head_symref.as_deref(), Some("main"));
        assert_eq!(advertisement.branches().count(), 2);
    }

    #[test]
    fn parses_dumb_listing_and_falls_back_on_names() {
        let body = format!("{DEV_SHA}\trefs/heads/feature\n{MAIN_SHA}\trefs/heads/trunk\n");
        let advertisement = RefAdvertisement::parse(&body);
        assert_eq!(advertisement.default_branch().as_deref(), Some("trunk"));

        let only_feature = RefAdvertisement::parse(&format!("{DEV_SHA}\trefs/heads/feature\n"));
        assert_eq!(only_feature.default_branch().as_deref(), Some("feature"));
        assert_eq!(RefAdvertisement::parse("").default_branch(), None);
    }

    #[test]
    fn head_sha_picks_matching_branch() {
        let body = format!("{DEV_SHA} HEAD\n{MAIN_SHA} refs/heads/main\n{DEV_SHA} refs/heads/dev\n");
        assert_eq!(
            RefAdvertisement::parse(&body).default_branch().as_deref(),
            Some("dev")
        );
    }

    #[test]
    fn sanitizes_full_ref_names() {
        assert_eq!(sanitize_branch("refs/heads/release/1.0"), "release/1.0");
        assert_eq!(sanitize_branch("main"), "main");
    }

    #[tokio::test]
    async fn push_is_declined() {
        let custom = adapter("https://git.example.com", Credentials::default());
        let err = custom
            .push(
                &RepoCoordinates::new("team", "app"),
                &PushRequest {
                    branch: "main".to_string(),
                    files: Vec::new(),
                    message: "noop".to_string(),
                    author: CommitAuthor {
                        name: "a".to_string(),
                        email: "a@example.com".to_string(),
                    },
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, AdapterErrorKind::Unsupported);
        assert!(err.message.starts_with("Push operations are not supported"));
    }

    #[tokio::test]
    async fn repository_default_branch_from_refs() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/team/app.git/info/refs"))
            .and(query_param("service", "git-upload-pack"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_string(smart_advertisement()))
            .mount(&server)
            .await;

        let custom = adapter(
            &server.uri(),
            Credentials {
                token: Some("secret".to_string()),
                ..Default::default()
            },
        );
        let repo = RepoCoordinates::new("team", "app");
        let info = custom.get_repository(&repo).await.unwrap();
        assert_eq!(info.default_branch, "main");
        assert_eq!(info.clone_url, format!("{}/team/app.git", server.uri()));

        let snapshot = custom.pull(&repo, "refs/heads/dev").await.unwrap();
        assert_eq!(snapshot.commit.sha, DEV_SHA);

        let err = custom.pull(&repo, "gone").await.unwrap_err();
        assert_eq!(err.message, "Branch 'gone' not found");
    }

    #[tokio::test]
    async fn missing_repository_and_bad_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/team/missing.git/info/refs"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/test.git/info/refs"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let custom = adapter(
            &server.uri(),
            Credentials {
                username: Some("bot".to_string()),
                password: Some("pw".to_string()),
                ..Default::default()
            },
        );
        let err = custom
            .get_repository(&RepoCoordinates::new("team", "missing"))
            .await
            .unwrap_err();
        assert_eq!(err.message, "Repository not found");

        let err = custom.validate_credentials().await.unwrap_err();
        assert_eq!(err.kind, AdapterErrorKind::Unauthorized);
        assert_eq!(err.message, "Invalid credentials");
    }
}
