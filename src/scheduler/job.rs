use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{FlowError, Result};
use crate::scheduler::Status;
use crate::storage::path_segment;

/// A participant in a multi-party job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartyRef {
    pub role: String,
    pub party_id: u64,
}

impl PartyRef {
    pub fn new(role: impl Into<String>, party_id: u64) -> Self {
        Self {
            role: role.into(),
            party_id,
        }
    }
}

impl fmt::Display for PartyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.role, self.party_id)
    }
}

/// Identifies a unit of work inside a job at one party.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskRef {
    pub component_name: String,
    pub task_id: String,
}

/// Registry key: a job at a party, or a task of that job at that party.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StatusKey {
    pub job_id: String,
    pub party: PartyRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskRef>,
}

impl StatusKey {
    pub fn job(job_id: impl Into<String>, party: PartyRef) -> Self {
        Self {
            job_id: job_id.into(),
            party,
            task: None,
        }
    }

    pub fn task(
        job_id: impl Into<String>,
        component_name: impl Into<String>,
        task_id: impl Into<String>,
        party: PartyRef,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            party,
            task: Some(TaskRef {
                component_name: component_name.into(),
                task_id: task_id.into(),
            }),
        }
    }

    pub fn is_task(&self) -> bool {
        self.task.is_some()
    }

    /// The job-level key this key belongs to.
    pub fn job_key(&self) -> StatusKey {
        StatusKey::job(self.job_id.clone(), self.party.clone())
    }
}

impl fmt::Display for StatusKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.task {
            Some(task) => write!(
                f,
                "{}/{}/{}/{}/{}",
                self.job_id, task.component_name, task.task_id, self.party.role, self.party.party_id
            ),
            None => write!(f, "{}/{}/{}", self.job_id, self.party.role, self.party.party_id),
        }
    }
}

/// Stored state for one registry key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: Status,
    /// Free-form fields reported alongside status updates, merged over time.
    #[serde(default)]
    pub info: Map<String, Value>,
    /// Bumped on every accepted write.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StatusRecord {
    pub fn new(status: Status, info: Map<String, Value>) -> Self {
        let now = Utc::now();
        Self {
            status,
            info,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Body of job and task status reports exchanged between parties.
///
/// `dsl`, `runtime_conf` and `initiator` are only meaningful on the create
/// announcement, where they let a remote party learn the job definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dsl: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_conf: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiator: Option<PartyRef>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StatusInfo {
    pub fn with_status(status: Status) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// A job submission as posted to `/submit`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSubmission {
    #[serde(default)]
    pub job_dsl: Value,
    #[serde(default)]
    pub job_runtime_conf: Value,
}

/// Model identity derived for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model_key: String,
    pub model_version: String,
    pub roles: BTreeMap<String, Vec<u64>>,
}

/// Builds the model identity for a job from its roles and model key.
pub fn gen_model_info(
    roles: &BTreeMap<String, Vec<u64>>,
    model_key: &str,
    job_id: &str,
) -> ModelInfo {
    ModelInfo {
        model_key: model_key.to_string(),
        model_version: job_id.to_string(),
        roles: roles.clone(),
    }
}

#[derive(Deserialize)]
struct RuntimeConfHeader {
    initiator: Option<PartyRef>,
    #[serde(default)]
    role: BTreeMap<String, Vec<u64>>,
    #[serde(default)]
    job_parameters: JobParameters,
}

#[derive(Default, Deserialize)]
struct JobParameters {
    model_key: Option<String>,
}

/// Everything a party knows about a job besides per-party status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub job_id: String,
    pub dsl: Value,
    pub runtime_conf: Value,
    pub initiator: PartyRef,
    pub participants: Vec<PartyRef>,
    pub model_info: ModelInfo,
    pub created_at: DateTime<Utc>,
}

impl JobDefinition {
    /// Validates a DSL and runtime conf pair and derives the definition.
    pub fn from_parts(job_id: &str, dsl: Value, runtime_conf: Value) -> Result<Self> {
        let components = dsl
            .get("components")
            .and_then(Value::as_object)
            .ok_or_else(|| FlowError::InvalidSpec("job_dsl.components is required".into()))?;
        if components.is_empty() {
            return Err(FlowError::InvalidSpec(
                "job_dsl.components must not be empty".into(),
            ));
        }
        for name in components.keys() {
            path_segment("component_name", name)?;
        }
        if !runtime_conf.is_object() {
            return Err(FlowError::InvalidSpec(
                "job_runtime_conf must be an object".into(),
            ));
        }

        let header: RuntimeConfHeader = serde_json::from_value(runtime_conf.clone())
            .map_err(|e| FlowError::InvalidSpec(format!("job_runtime_conf: {}", e)))?;
        let initiator = header
            .initiator
            .ok_or_else(|| FlowError::InvalidSpec("job_runtime_conf.initiator is required".into()))?;

        for role in header.role.keys() {
            path_segment("role", role)?;
        }
        let participants: Vec<PartyRef> = header
            .role
            .iter()
            .flat_map(|(role, ids)| ids.iter().map(move |id| PartyRef::new(role.clone(), *id)))
            .collect();
        if participants.is_empty() {
            return Err(FlowError::InvalidSpec(
                "job_runtime_conf.role must declare at least one party".into(),
            ));
        }
        if let Some(bad) = participants.iter().find(|p| p.party_id == 0) {
            return Err(FlowError::InvalidSpec(format!(
                "party_id must be positive, got {}",
                bad
            )));
        }
        if !participants.contains(&initiator) {
            return Err(FlowError::InvalidSpec(format!(
                "initiator {} is not a declared participant",
                initiator
            )));
        }

        let model_key = header
            .job_parameters
            .model_key
            .unwrap_or_else(|| format!("{}-{}#model", initiator.role, initiator.party_id));
        let model_info = gen_model_info(&header.role, &model_key, job_id);

        Ok(Self {
            job_id: job_id.to_string(),
            dsl,
            runtime_conf,
            initiator,
            participants,
            model_info,
            created_at: Utc::now(),
        })
    }

    /// Component names declared by the DSL.
    pub fn components(&self) -> Vec<String> {
        self.dsl
            .get("components")
            .and_then(Value::as_object)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// Filter accepted by `/query` and `/config`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    pub job_id: Option<String>,
    pub role: Option<String>,
    pub party_id: Option<u64>,
    pub status: Option<Status>,
    pub initiator_role: Option<String>,
    pub initiator_party_id: Option<u64>,
}

impl JobFilter {
    pub fn by_job_id(job_id: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, key: &StatusKey, status: Status, initiator: Option<&PartyRef>) -> bool {
        self.job_id.as_ref().is_none_or(|id| *id == key.job_id)
            && self.role.as_ref().is_none_or(|r| *r == key.party.role)
            && self.party_id.is_none_or(|p| p == key.party.party_id)
            && self.status.is_none_or(|s| s == status)
            && self
                .initiator_role
                .as_ref()
                .is_none_or(|r| initiator.is_some_and(|i| i.role == *r))
            && self
                .initiator_party_id
                .is_none_or(|p| initiator.is_some_and(|i| i.party_id == p))
    }
}

/// Job row returned by `/query`: one per (job_id, role, party_id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub role: String,
    pub party_id: u64,
    pub status: Status,
    pub is_initiator: bool,
    pub initiator: Option<PartyRef>,
    pub dsl: Option<Value>,
    pub runtime_conf: Option<Value>,
    pub info: Map<String, Value>,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn runtime_conf() -> Value {
        json!({
            "initiator": {"role": "guest", "party_id": 2},
            "role": {"host": [1], "guest": [2]},
            "job_parameters": {"model_key": "lr-model"}
        })
    }

    #[test]
    fn definition_collects_participants() {
        let dsl = json!({"components": {"reader_0": {}}});
        let def = JobDefinition::from_parts("j1", dsl, runtime_conf()).unwrap();
        assert_eq!(def.initiator, PartyRef::new("guest", 2));
        assert_eq!(
            def.participants,
            vec![PartyRef::new("guest", 2), PartyRef::new("host", 1)]
        );
        assert_eq!(def.model_info.model_key, "lr-model");
        assert_eq!(def.model_info.model_version, "j1");
        assert_eq!(def.components(), vec!["reader_0".to_string()]);
    }

    #[test]
    fn definition_requires_components() {
        let err = JobDefinition::from_parts("j1", json!({}), runtime_conf()).unwrap_err();
        assert!(matches!(err, FlowError::InvalidSpec(_)));
    }

    #[test]
    fn definition_requires_initiator_among_participants() {
        let conf = json!({
            "initiator": {"role": "arbiter", "party_id": 9},
            "role": {"host": [1]}
        });
        let err = JobDefinition::from_parts("j1", json!({"components": {"a": {}}}), conf)
            .unwrap_err();
        assert!(matches!(err, FlowError::InvalidSpec(_)));
    }

    #[test]
    fn definition_rejects_names_that_cannot_be_directories() {
        let conf = json!({
            "initiator": {"role": "..", "party_id": 2},
            "role": {"..": [2]}
        });
        let err = JobDefinition::from_parts("j1", json!({"components": {"a": {}}}), conf)
            .unwrap_err();
        assert!(matches!(err, FlowError::InvalidSpec(_)));

        let err = JobDefinition::from_parts("j1", json!({"components": {"a/b": {}}}), runtime_conf())
            .unwrap_err();
        assert!(matches!(err, FlowError::InvalidSpec(_)));
    }

    #[test]
    fn default_model_key_derives_from_initiator() {
        let conf = json!({
            "initiator": {"role": "guest", "party_id": 2},
            "role": {"guest": [2]}
        });
        let def = JobDefinition::from_parts("j2", json!({"components": {"a": {}}}), conf).unwrap();
        assert_eq!(def.model_info.model_key, "guest-2#model");
    }

    #[test]
    fn status_key_display() {
        let job = StatusKey::job("j1", PartyRef::new("host", 1));
        assert_eq!(job.to_string(), "j1/host/1");
        let task = StatusKey::task("j1", "reader_0", "t1", PartyRef::new("host", 1));
        assert_eq!(task.to_string(), "j1/reader_0/t1/host/1");
        assert_eq!(task.job_key(), job);
    }

    #[test]
    fn status_info_keeps_extra_fields() {
        let info: StatusInfo =
            serde_json::from_value(json!({"status": "running", "progress": 40})).unwrap();
        assert_eq!(info.status, Some(Status::Running));
        assert_eq!(info.extra.get("progress"), Some(&json!(40)));
    }

    #[test]
    fn filter_matches_initiator_fields() {
        let key = StatusKey::job("j1", PartyRef::new("host", 1));
        let initiator = PartyRef::new("guest", 2);
        let filter = JobFilter {
            initiator_role: Some("guest".into()),
            ..Default::default()
        };
        assert!(filter.matches(&key, Status::Waiting, Some(&initiator)));
        assert!(!filter.matches(&key, Status::Waiting, None));
        let filter = JobFilter {
            status: Some(Status::Running),
            ..Default::default()
        };
        assert!(!filter.matches(&key, Status::Waiting, Some(&initiator)));
    }
}
