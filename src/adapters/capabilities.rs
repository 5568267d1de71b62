//! Provider metadata and static capability flags
//!
//! Capabilities let the processor short-circuit operations a backend cannot
//! perform with a typed `unsupported` error instead of a failed request.

use serde::{Deserialize, Serialize};

use super::trait_::{AdapterError, AdapterResult, FileChange};

/// Authentication scheme a provider binding uses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthScheme {
    /// `Authorization: token <pat>`
    Token,
    /// `PRIVATE-TOKEN: <pat>`
    PrivateToken,
    /// Bearer, basic or API key, whichever credentials are present
    Flexible,
}

/// Static feature flags of a provider type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub webhooks: bool,
    pub pull_requests: bool,
    pub issues: bool,
    pub projects: bool,
    pub wiki: bool,
    pub packages: bool,
    pub actions: bool,
    pub protected_branches: bool,
    pub max_file_size_mb: u64,
    pub max_repo_size_mb: u64,
}

impl Capabilities {
    pub fn github() -> Self {
        Self {
            webhooks: true,
            pull_requests: true,
            issues: true,
            projects: true,
            wiki: true,
            packages: true,
            actions: true,
            protected_branches: true,
            max_file_size_mb: 100,
            max_repo_size_mb: 5120,
        }
    }

    pub fn gitlab() -> Self {
        Self {
            max_repo_size_mb: 10240,
            ..Self::github()
        }
    }

    pub fn forgejo() -> Self {
        Self {
            projects: false,
            max_file_size_mb: 50,
            max_repo_size_mb: 2048,
            ..Self::github()
        }
    }

    /// Plain HTTP Git servers: read-only, nothing beyond the smart protocol.
    pub fn generic() -> Self {
        Self {
            webhooks: false,
            pull_requests: false,
            issues: false,
            projects: false,
            wiki: false,
            packages: false,
            actions: false,
            protected_branches: false,
            max_file_size_mb: 100,
            max_repo_size_mb: 10240,
        }
    }

    pub fn max_file_size_bytes(&self) -> usize {
        (self.max_file_size_mb as usize) * 1024 * 1024
    }

    /// Rejects a push whose files exceed the provider's file size limit.
    pub fn check_files(&self, files: &[FileChange]) -> AdapterResult<()> {
        let limit = self.max_file_size_bytes();
        match files.iter().find(|file| file.size_bytes() > limit) {
            Some(file) => Err(AdapterError::unsupported(format!(
                "File {} exceeds the {} MB limit",
                file.path, self.max_file_size_mb
            ))),
            None => Ok(()),
        }
    }

    pub fn require_webhooks(&self, provider: &str) -> AdapterResult<()> {
        if self.webhooks {
            Ok(())
        } else {
            Err(AdapterError::unsupported(format!(
                "Webhooks are not supported by {provider}"
            )))
        }
    }
}

/// Metadata about a registered provider type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMetadata {
    /// Registry key
    pub kind: String,
    pub auth: AuthScheme,
    pub capabilities: Capabilities,
    /// Endpoint used when the provider row leaves it empty
    pub default_endpoint: Option<String>,
}

impl ProviderMetadata {
    pub fn new(
        kind: &str,
        auth: AuthScheme,
        capabilities: Capabilities,
        default_endpoint: Option<&str>,
    ) -> Self {
        Self {
            kind: kind.to_string(),
            auth,
            capabilities,
            default_endpoint: default_endpoint.map(str::to_string),
        }
    }
}
