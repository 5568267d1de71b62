//! Provider adapters
//!
//! This module provides the Git provider abstraction including:
//! - The `GitProvider` trait and the normalized records it returns
//! - Capability flags, rate-limit tracking and the shared HTTP client
//! - The registry that maps provider types to adapter constructors
//! - GitHub, GitLab, Forgejo and generic HTTP Git implementations

pub mod capabilities;
pub mod custom;
pub mod forgejo;
pub mod github;
pub mod gitlab;
pub mod http;
pub mod rate_limit;
pub mod registry;
pub mod trait_;
mod wire;

pub use capabilities::{AuthScheme, Capabilities, ProviderMetadata};
pub use rate_limit::RateLimitInfo;
pub use registry::{Credentials, ProviderBinding, ProviderRegistry, RegistryError};
pub use trait_::{
    AdapterError, AdapterErrorKind, AdapterResult, BranchInfo, CommitAuthor, CommitInfo,
    CredentialReport, FileChange, FileEncoding, GitProvider, HealthReport, PullSnapshot,
    PushRequest, RepoCoordinates, RepositoryInfo, Signature, TreeEntry, Webhook, WebhookConfig,
};

pub use custom::{CustomGitAdapter, register_custom_adapter};
pub use forgejo::{ForgejoAdapter, register_forgejo_adapter};
pub use github::{GitHubAdapter, register_github_adapter};
pub use gitlab::{GitLabAdapter, register_gitlab_adapter};
