//! Structured outcomes persisted into job metadata and the job `result`.

use serde::Serialize;
use serde_json::{Value as JsonValue, json};
use uuid::Uuid;

use crate::adapters::{AdapterError, BranchInfo, PullSnapshot};
use crate::models::sync_job::SyncAction;

/// One branch of a full sync.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BranchResult {
    pub branch: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tree_entries: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BranchResult {
    pub fn pulled(branch: &BranchInfo, snapshot: &PullSnapshot) -> Self {
        Self {
            branch: branch.name.clone(),
            success: true,
            commit: Some(snapshot.commit.sha.clone()),
            tree_entries: Some(snapshot.tree.len()),
            error: None,
        }
    }

    pub fn failed(branch: &BranchInfo, error: &AdapterError) -> Self {
        Self {
            branch: branch.name.clone(),
            success: false,
            commit: Some(branch.commit_sha.clone()).filter(|sha| !sha.is_empty()),
            tree_entries: None,
            error: Some(error.to_string()),
        }
    }
}

/// What one provider did for a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderOutcome {
    pub provider_id: Uuid,
    pub provider: String,
    pub success: bool,
    pub message: String,
    pub data: JsonValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Head commit to stamp on the binding after a successful sync
    #[serde(skip)]
    pub commit: Option<String>,
}

impl ProviderOutcome {
    pub fn succeeded(
        provider_id: Uuid,
        provider: &str,
        message: String,
        data: JsonValue,
        commit: Option<String>,
    ) -> Self {
        Self {
            provider_id,
            provider: provider.to_string(),
            success: true,
            message,
            data,
            error: None,
            commit,
        }
    }

    pub fn failed(provider_id: Uuid, provider: &str, error: &AdapterError) -> Self {
        Self {
            provider_id,
            provider: provider.to_string(),
            success: false,
            message: error.to_string(),
            data: json!({ "error": error }),
            error: Some(error.to_string()),
            commit: None,
        }
    }

    /// A full sync where some branches failed: results are kept, the
    /// provider counts as failed.
    pub fn partial(
        provider_id: Uuid,
        provider: &str,
        message: String,
        first_error: String,
        data: JsonValue,
    ) -> Self {
        Self {
            provider_id,
            provider: provider.to_string(),
            success: false,
            message,
            data,
            error: Some(first_error),
            commit: None,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// Overall result of one execution of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessorResult {
    pub action: SyncAction,
    pub success: bool,
    pub message: String,
    pub providers: Vec<ProviderOutcome>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
}

impl ProcessorResult {
    /// Nothing was executed; the delivery is acknowledged as is.
    pub fn skipped(action: SyncAction, message: impl Into<String>) -> Self {
        Self {
            action,
            success: true,
            message: message.into(),
            providers: Vec::new(),
            skipped: true,
        }
    }

    /// Succeeds only when every provider succeeded.
    pub fn from_outcomes(action: SyncAction, providers: Vec<ProviderOutcome>) -> Self {
        let total = providers.len();
        let succeeded = providers.iter().filter(|outcome| outcome.success).count();
        let success = succeeded == total;

        let message = match providers.as_slice() {
            [only] => only.message.clone(),
            _ if success => format!("{action} succeeded on all {total} providers"),
            _ => format!("{action} succeeded on {succeeded} of {total} providers"),
        };

        Self {
            action,
            success,
            message,
            providers,
            skipped: false,
        }
    }

    /// First error reported by a provider, in target order.
    pub fn error(&self) -> Option<String> {
        self.providers
            .iter()
            .find(|outcome| !outcome.success)
            .and_then(|outcome| outcome.error.clone())
    }

    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or_default()
    }
}
