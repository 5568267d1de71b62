//! Provider registry
//!
//! Maps a provider type string to a constructor. Adapters are built per job
//! from the persisted provider row; unknown types only fail when resolved.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::capabilities::ProviderMetadata;
use super::trait_::{AdapterError, GitProvider};
use crate::config::ProviderClientConfig;
use crate::models::provider;

/// Error type for registry operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("Unknown provider type: {kind}")]
    UnsupportedProviderType { kind: String },
    #[error("Invalid configuration for provider '{provider}': {source}")]
    InvalidConfiguration {
        provider: String,
        #[source]
        source: AdapterError,
    },
}

/// Credential bag stored on the provider row. Which fields matter depends
/// on the provider type.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub token: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(alias = "apiKey")]
    pub api_key: Option<String>,
    /// Repository probed by the generic adapter's credential check
    #[serde(alias = "testRepository")]
    pub test_repository: Option<String>,
}

impl Credentials {
    pub fn from_json(value: &JsonValue) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    pub fn require_token(&self, provider: &str) -> Result<&str, AdapterError> {
        self.token
            .as_deref()
            .filter(|token| !token.is_empty())
            .ok_or_else(|| AdapterError::configuration(format!("{provider} requires a token")))
    }
}

/// Everything an adapter constructor needs from a provider row.
#[derive(Debug, Clone)]
pub struct ProviderBinding {
    pub id: Uuid,
    pub name: String,
    pub kind: String,
    /// Empty means "use the type's default endpoint"
    pub endpoint: String,
    pub credentials: Credentials,
}

impl From<&provider::Model> for ProviderBinding {
    fn from(model: &provider::Model) -> Self {
        Self {
            id: model.id,
            name: model.name.clone(),
            kind: model.provider_type.to_lowercase(),
            endpoint: model.endpoint.trim().to_string(),
            credentials: Credentials::from_json(&model.credentials),
        }
    }
}

pub type AdapterFactory =
    fn(&ProviderBinding, &ProviderClientConfig) -> Result<Box<dyn GitProvider>, AdapterError>;

struct Registration {
    metadata: ProviderMetadata,
    factory: AdapterFactory,
}

/// Registry of adapter constructors keyed by provider type
pub struct ProviderRegistry {
    entries: HashMap<String, Registration>,
    client: ProviderClientConfig,
}

impl ProviderRegistry {
    /// Create an empty registry
    pub fn new(client: ProviderClientConfig) -> Self {
        Self {
            entries: HashMap::new(),
            client,
        }
    }

    /// Registry with the built-in github, gitlab, forgejo and custom adapters
    pub fn with_defaults(client: ProviderClientConfig) -> Self {
        let mut registry = Self::new(client);
        super::github::register_github_adapter(&mut registry);
        super::gitlab::register_gitlab_adapter(&mut registry);
        super::forgejo::register_forgejo_adapter(&mut registry);
        super::custom::register_custom_adapter(&mut registry);
        registry
    }

    pub fn register(&mut self, metadata: ProviderMetadata, factory: AdapterFactory) {
        self.entries
            .insert(metadata.kind.clone(), Registration { metadata, factory });
    }

    /// Build a fresh adapter for one provider row.
    pub fn resolve(
        &self,
        provider: &provider::Model,
    ) -> Result<Box<dyn GitProvider>, RegistryError> {
        let mut binding = ProviderBinding::from(provider);
        let registration =
            self.entries
                .get(&binding.kind)
                .ok_or_else(|| RegistryError::UnsupportedProviderType {
                    kind: provider.provider_type.clone(),
                })?;

        if binding.endpoint.is_empty()
            && let Some(default) = &registration.metadata.default_endpoint
        {
            binding.endpoint = default.clone();
        }

        (registration.factory)(&binding, &self.client).map_err(|source| {
            RegistryError::InvalidConfiguration {
                provider: provider.name.clone(),
                source,
            }
        })
    }

    pub fn metadata(&self, kind: &str) -> Result<&ProviderMetadata, RegistryError> {
        self.entries
            .get(kind)
            .map(|entry| &entry.metadata)
            .ok_or_else(|| RegistryError::UnsupportedProviderType {
                kind: kind.to_string(),
            })
    }

    /// Registered provider types, sorted
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::provider::ProviderStatus;
    use serde_json::json;

    fn provider_row(kind: &str, endpoint: &str, credentials: JsonValue) -> provider::Model {
        let now = chrono::Utc::now().fixed_offset();
        provider::Model {
            id: Uuid::new_v4(),
            name: format!("{kind}-primary"),
            provider_type: kind.to_string(),
            endpoint: endpoint.to_string(),
            status: ProviderStatus::Active,
            health: 100,
            credentials,
            last_health_check: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn lists_builtin_kinds() {
        let registry = ProviderRegistry::with_defaults(ProviderClientConfig::default());
        assert_eq!(registry.kinds(), vec!["custom", "forgejo", "github", "gitlab"]);
    }

    #[test]
    fn unknown_type_fails_at_resolution() {
        let registry = ProviderRegistry::with_defaults(ProviderClientConfig::default());
        let row = provider_row("bitbucket", "https://api.bitbucket.org", json!({}));
        let err = registry.resolve(&row).err().unwrap();
        assert!(matches!(err, RegistryError::UnsupportedProviderType { .. }));
        assert_eq!(err.to_string(), "Unknown provider type: bitbucket");
    }

    #[test]
    fn missing_token_is_a_configuration_error() {
        let registry = ProviderRegistry::with_defaults(ProviderClientConfig::default());
        let row = provider_row("github", "", json!({}));
        let err = registry.resolve(&row).err().unwrap();
        assert!(matches!(err, RegistryError::InvalidConfiguration { .. }));
    }

    #[test]
    fn empty_endpoint_falls_back_to_default() {
        let registry = ProviderRegistry::with_defaults(ProviderClientConfig::default());
        let row = provider_row("GitHub", "", json!({"token": "ghp_x"}));
        let adapter = registry.resolve(&row).unwrap();
        assert_eq!(adapter.kind(), "github");
        assert_eq!(adapter.name(), "GitHub-primary");
        assert_eq!(
            registry.metadata("github").unwrap().default_endpoint.as_deref(),
            Some("https://api.github.com")
        );
    }

    #[test]
    fn credentials_accept_camel_case_aliases() {
        let creds = Credentials::from_json(&json!({"apiKey": "k", "testRepository": "a/b"}));
        assert_eq!(creds.api_key.as_deref(), Some("k"));
        assert_eq!(creds.test_repository.as_deref(), Some("a/b"));
        assert!(Credentials::from_json(&json!("garbage")).token.is_none());
    }
}
