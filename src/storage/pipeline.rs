use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::Result;
use crate::scheduler::{JobDefinition, ModelInfo, PartyRef};
use crate::storage::path_segment;

/// Pipeline artifact saved for a party once its job produced a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub job_id: String,
    pub model_key: String,
    pub party: PartyRef,
    pub dsl: serde_json::Value,
    pub runtime_conf: serde_json::Value,
    pub model_info: ModelInfo,
    pub saved_at: DateTime<Utc>,
}

/// Writes pipelines to `<root>/<model_key>/<job_id>/<role>/<party_id>/pipeline.json`.
#[derive(Debug, Clone)]
pub struct PipelineStore {
    root: PathBuf,
}

impl PipelineStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, model_key: &str, job_id: &str, party: &PartyRef) -> Result<PathBuf> {
        // '#' shows up in generated model keys
        let model_dir = path_segment("model_key", model_key)?.replace('#', "_");
        Ok(self
            .root
            .join(model_dir)
            .join(path_segment("job_id", job_id)?)
            .join(path_segment("role", &party.role)?)
            .join(party.party_id.to_string())
            .join("pipeline.json"))
    }

    pub async fn save(
        &self,
        def: &JobDefinition,
        party: &PartyRef,
        model_key: &str,
    ) -> Result<PathBuf> {
        let pipeline = Pipeline {
            job_id: def.job_id.clone(),
            model_key: model_key.to_string(),
            party: party.clone(),
            dsl: def.dsl.clone(),
            runtime_conf: def.runtime_conf.clone(),
            model_info: def.model_info.clone(),
            saved_at: Utc::now(),
        };
        let path = self.path_for(model_key, &def.job_id, party)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, serde_json::to_vec_pretty(&pipeline)?).await?;
        Ok(path)
    }
}
