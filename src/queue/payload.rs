use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

use crate::models::sync_job::{self, SyncAction};

/// Everything a worker needs to execute a job, stored with the queue entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJobPayload {
    pub sync_job_id: Uuid,
    pub repository_id: Uuid,
    pub provider_ids: Vec<Uuid>,
    pub action: SyncAction,
    pub source_ref: Option<String>,
    pub target_ref: Option<String>,
    pub commit_hash: Option<String>,
    #[serde(default)]
    pub metadata: JsonValue,
}

impl SyncJobPayload {
    /// Rebuilds the payload from a persisted record, keeping the refs and
    /// metadata the job was created with. Refs stay `None` unless the job
    /// was created with an explicit one.
    pub fn from_job(job: &sync_job::Model) -> Self {
        let source_ref = job.metadata_str("source_ref").map(str::to_string);
        let target_ref = job.metadata_str("target_ref").map(str::to_string);

        let metadata = match &job.metadata {
            JsonValue::Object(map) => {
                // Per-provider results from earlier attempts are not inputs.
                let inputs: Map<String, JsonValue> = map
                    .iter()
                    .filter(|(key, _)| !key.ends_with("_results"))
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect();
                JsonValue::Object(inputs)
            }
            _ => JsonValue::Object(Map::new()),
        };

        Self {
            sync_job_id: job.id,
            repository_id: job.repository_id,
            provider_ids: job.target_providers(),
            action: job.action,
            source_ref,
            target_ref,
            commit_hash: job.commit_hash.clone(),
            metadata,
        }
    }
}
