//! Core adapter trait and the normalized records every Git provider returns.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::capabilities::Capabilities;
use super::rate_limit::RateLimitInfo;

/// Classification of an adapter failure. Mirrors the data carried back to
/// callers as `{success: false, error, details}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdapterErrorKind {
    /// The provider cannot express the operation (capability short-circuit).
    Unsupported,
    Unauthorized,
    NotFound,
    RateLimited {
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_secs: Option<u64>,
    },
    /// Any other non-success status from the backend.
    Http { status: u16 },
    Network,
    Timeout,
    /// The backend answered with a body we could not decode.
    Malformed,
    /// Missing token, bad endpoint and similar binding problems.
    Configuration,
}

/// Uniform error returned by every adapter operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterError {
    #[serde(flatten)]
    pub kind: AdapterErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<JsonValue>,
}

impl AdapterError {
    pub fn new(kind: AdapterErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Unsupported, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Unauthorized, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::NotFound, message)
    }

    pub fn rate_limited(retry_after_secs: Option<u64>, message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::RateLimited { retry_after_secs }, message)
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Http { status }, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Network, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Malformed, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Configuration, message)
    }

    pub fn with_details(mut self, details: JsonValue) -> Self {
        self.details = Some(details);
        self
    }

    /// Prefixes the message, e.g. `Push failed: <message>`.
    pub fn context(mut self, prefix: &str) -> Self {
        self.message = format!("{prefix}: {}", self.message);
        self
    }

    /// Whether a later attempt has a realistic chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match &self.kind {
            AdapterErrorKind::RateLimited { .. }
            | AdapterErrorKind::Network
            | AdapterErrorKind::Timeout
            | AdapterErrorKind::Malformed => true,
            AdapterErrorKind::Http { status } => *status >= 500,
            AdapterErrorKind::Unsupported
            | AdapterErrorKind::Unauthorized
            | AdapterErrorKind::NotFound
            | AdapterErrorKind::Configuration => false,
        }
    }
}

impl std::fmt::Display for AdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            AdapterErrorKind::RateLimited {
                retry_after_secs: Some(secs),
            } => write!(f, "{} (retry after: {}s)", self.message, secs),
            _ => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for AdapterError {}

impl From<reqwest::Error> for AdapterError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AdapterError::new(AdapterErrorKind::Timeout, format!("Request timed out: {err}"))
        } else if err.is_decode() {
            AdapterError::malformed(format!("Invalid response body: {err}"))
        } else if let Some(status) = err.status() {
            AdapterError::http(status.as_u16(), err.to_string())
        } else {
            AdapterError::network(err.to_string())
        }
    }
}

pub type AdapterResult<T> = Result<T, AdapterError>;

/// Owner/name pair addressing a repository on one provider. The owner may
/// contain nested groups (`group/subgroup`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoCoordinates {
    pub owner: String,
    pub name: String,
}

impl RepoCoordinates {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

impl std::fmt::Display for RepoCoordinates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialReport {
    /// Login or account name the credentials resolve to
    pub identity: Option<String>,
    pub scopes: Vec<String>,
    pub details: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryInfo {
    pub name: String,
    pub full_name: String,
    pub description: Option<String>,
    pub private: bool,
    pub default_branch: String,
    pub clone_url: String,
    pub ssh_url: Option<String>,
    pub web_url: Option<String>,
    /// Size in KB when the backend reports it
    pub size_kb: Option<u64>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchInfo {
    pub name: String,
    pub commit_sha: String,
    pub protected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub name: String,
    pub email: String,
    pub date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub sha: String,
    pub message: String,
    pub author: Option<Signature>,
    pub committer: Option<Signature>,
    pub parents: Vec<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileEncoding {
    #[default]
    Utf8,
    Base64,
}

/// One file to create or update in a push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub encoding: FileEncoding,
}

impl FileChange {
    /// Decoded size in bytes, used for the max-file-size guard.
    pub fn size_bytes(&self) -> usize {
        match self.encoding {
            FileEncoding::Utf8 => self.content.len(),
            FileEncoding::Base64 => self.content.len() / 4 * 3,
        }
    }

    /// Content as base64, whichever encoding it arrived in.
    pub fn base64_content(&self) -> String {
        use base64::Engine;
        match self.encoding {
            FileEncoding::Base64 => self.content.clone(),
            FileEncoding::Utf8 => {
                base64::engine::general_purpose::STANDARD.encode(self.content.as_bytes())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitAuthor {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRequest {
    pub branch: String,
    pub files: Vec<FileChange>,
    pub message: String,
    pub author: CommitAuthor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub path: String,
    pub mode: Option<String>,
    /// `blob`, `tree` or `commit`
    pub kind: String,
    pub sha: String,
    pub size: Option<u64>,
}

/// Head commit plus the full tree listing of one branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullSnapshot {
    pub branch: String,
    pub commit: CommitInfo,
    pub tree: Vec<TreeEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    pub events: Vec<String>,
    pub secret: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Webhook {
    pub id: String,
    pub url: String,
    pub events: Vec<String>,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub latency_ms: u64,
    pub details: JsonValue,
}

impl HealthReport {
    /// 0..=100 score; an unhealthy provider always scores 0.
    pub fn score(&self) -> i16 {
        if !self.healthy {
            return 0;
        }
        let penalty = (self.latency_ms / 10).min(100) as i16;
        100 - penalty
    }
}

/// A Git hosting backend. Every operation either succeeds with a normalized
/// record or returns an [`AdapterError`]; backend-specific errors never cross
/// this boundary.
#[async_trait]
pub trait GitProvider: Send + Sync {
    /// Registry key, e.g. `github`.
    fn kind(&self) -> &'static str;

    /// Configured provider name.
    fn name(&self) -> &str;

    fn capabilities(&self) -> &Capabilities;

    async fn validate_credentials(&self) -> AdapterResult<CredentialReport>;

    async fn get_repository(&self, repo: &RepoCoordinates) -> AdapterResult<RepositoryInfo>;

    async fn list_branches(&self, repo: &RepoCoordinates) -> AdapterResult<Vec<BranchInfo>>;

    async fn get_commit(&self, repo: &RepoCoordinates, sha: &str) -> AdapterResult<CommitInfo>;

    /// Create-or-update each file on `request.branch`; returns the new head.
    async fn push(&self, repo: &RepoCoordinates, request: &PushRequest)
    -> AdapterResult<CommitInfo>;

    async fn pull(&self, repo: &RepoCoordinates, branch: &str) -> AdapterResult<PullSnapshot>;

    async fn create_webhook(
        &self,
        repo: &RepoCoordinates,
        config: &WebhookConfig,
    ) -> AdapterResult<Webhook>;

    async fn delete_webhook(&self, repo: &RepoCoordinates, webhook_id: &str) -> AdapterResult<()>;

    async fn health(&self) -> AdapterResult<HealthReport>;

    /// Last rate-limit snapshot observed on any call. Advisory only.
    fn rate_limit(&self) -> Option<RateLimitInfo>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(AdapterError::http(502, "bad gateway").is_transient());
        assert!(AdapterError::rate_limited(Some(30), "slow down").is_transient());
        assert!(!AdapterError::http(422, "unprocessable").is_transient());
        assert!(!AdapterError::unsupported("no").is_transient());
    }

    #[test]
    fn display_includes_retry_after() {
        let err = AdapterError::rate_limited(Some(60), "API rate limit exceeded");
        assert_eq!(err.to_string(), "API rate limit exceeded (retry after: 60s)");
        let err = AdapterError::not_found("Repository not found").context("Failed to get repository info");
        assert_eq!(
            err.to_string(),
            "Failed to get repository info: Repository not found"
        );
    }

    #[test]
    fn serializes_as_tagged_failure() {
        let err = AdapterError::http(500, "boom").with_details(serde_json::json!({"id": 1}));
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["type"], "http");
        assert_eq!(value["status"], 500);
        assert_eq!(value["message"], "boom");
        assert_eq!(value["details"]["id"], 1);
    }

    #[test]
    fn health_score_penalises_latency() {
        let report = HealthReport {
            healthy: true,
            latency_ms: 250,
            details: JsonValue::Null,
        };
        assert_eq!(report.score(), 75);
        let slow = HealthReport {
            latency_ms: 5_000,
            ..report.clone()
        };
        assert_eq!(slow.score(), 0);
        let down = HealthReport {
            healthy: false,
            ..report
        };
        assert_eq!(down.score(), 0);
    }

    #[test]
    fn file_change_sizes() {
        let utf8 = FileChange {
            path: "README.md".into(),
            content: "hello".into(),
            encoding: FileEncoding::Utf8,
        };
        assert_eq!(utf8.size_bytes(), 5);
        assert_eq!(utf8.base64_content(), "aGVsbG8=");
    }
}
