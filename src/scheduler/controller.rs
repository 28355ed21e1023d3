use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{FlowError, Result};
use crate::federation::{job_path, task_path, PropagationFailure, Propagator};
use crate::scheduler::{
    JobDefinition, JobFilter, JobRecord, JobSubmission, ModelInfo, PartyRef, Registration, Status,
    StatusInfo, StatusKey, StatusRegistry,
};
use crate::storage::{JobCatalog, LogLayout, PipelineStore};

/// Returned by [`JobController::submit_job`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmittedJob {
    pub job_id: String,
    pub job_dsl_path: PathBuf,
    pub job_runtime_conf_path: PathBuf,
    pub model_info: ModelInfo,
}

/// Returned by [`JobController::job_config`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub job_id: String,
    pub dsl: Value,
    pub runtime_conf: Value,
    pub model_info: ModelInfo,
}

/// Applies lifecycle operations to jobs and tasks.
///
/// Local state changes go through the [`StatusRegistry`] and are
/// authoritative; anything other parties need to hear about is handed to the
/// [`Propagator`] and never awaited.
pub struct JobController {
    registry: Arc<StatusRegistry>,
    catalog: Arc<JobCatalog>,
    logs: LogLayout,
    pipelines: PipelineStore,
    propagator: Propagator,
    job_seq: AtomicU64,
}

impl JobController {
    pub fn new(
        registry: Arc<StatusRegistry>,
        catalog: Arc<JobCatalog>,
        logs: LogLayout,
        pipelines: PipelineStore,
        propagator: Propagator,
    ) -> Self {
        Self {
            registry,
            catalog,
            logs,
            pipelines,
            propagator,
            job_seq: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<StatusRegistry> {
        &self.registry
    }

    pub fn catalog(&self) -> &Arc<JobCatalog> {
        &self.catalog
    }

    pub fn logs(&self) -> &LogLayout {
        &self.logs
    }

    fn next_job_id(&self) -> String {
        let seq = self.job_seq.fetch_add(1, Ordering::Relaxed) % 10_000;
        format!("{}{:04}", Utc::now().format("%Y%m%d%H%M%S%3f"), seq)
    }

    async fn job_known(&self, job_id: &str) -> bool {
        self.catalog.contains(job_id).await || !self.registry.job_records(job_id).await.is_empty()
    }

    /// Initiator from the catalog, falling back to what the create
    /// announcement stored on the party's record.
    async fn recorded_initiator(&self, key: &StatusKey) -> Option<PartyRef> {
        if let Some(def) = self.catalog.get(&key.job_id).await {
            return Some(def.initiator);
        }
        let record = self.registry.get(&key.job_key()).await.ok()?;
        serde_json::from_value(record.info.get("initiator")?.clone()).ok()
    }

    /// Validate a submission, persist its spec and register every
    /// participant as `waiting`. Remote participants are told in the
    /// background.
    pub async fn submit_job(&self, submission: JobSubmission) -> Result<SubmittedJob> {
        if submission.job_dsl.is_null() {
            return Err(FlowError::InvalidSpec("job_dsl is required".into()));
        }
        if submission.job_runtime_conf.is_null() {
            return Err(FlowError::InvalidSpec("job_runtime_conf is required".into()));
        }

        let job_id = self.next_job_id();
        let def = JobDefinition::from_parts(
            &job_id,
            submission.job_dsl,
            submission.job_runtime_conf,
        )?;
        let paths = self.catalog.insert(def.clone()).await?;

        for party in &def.participants {
            let mut info = Map::new();
            info.insert("initiator".into(), serde_json::to_value(&def.initiator)?);
            self.registry
                .create_or_get(&StatusKey::job(&job_id, party.clone()), Status::INITIAL, info)
                .await?;
        }

        let announcement = serde_json::to_value(StatusInfo {
            dsl: Some(def.dsl.clone()),
            runtime_conf: Some(def.runtime_conf.clone()),
            initiator: Some(def.initiator.clone()),
            ..Default::default()
        })?;
        self.propagator.broadcast(
            &def.participants,
            |p| job_path(&job_id, p, "create"),
            announcement,
        );

        tracing::info!(
            job_id = %job_id,
            initiator = %def.initiator,
            participants = def.participants.len(),
            "Job submitted"
        );

        Ok(SubmittedJob {
            job_id,
            job_dsl_path: paths.dsl_path,
            job_runtime_conf_path: paths.runtime_conf_path,
            model_info: def.model_info,
        })
    }

    /// Cancel every non-terminal job and task record of a job. A job that is
    /// already terminal everywhere is left as is.
    pub async fn stop_job(&self, job_id: &str) -> Result<()> {
        if job_id.is_empty() || !self.job_known(job_id).await {
            return Err(FlowError::NotFound(format!("job {}", job_id)));
        }

        let mut changed = false;
        for (key, _) in self.registry.job_records(job_id).await {
            changed |= self.finish_party(job_id, &key.party, Status::Cancelled).await?;
        }
        if !changed {
            tracing::debug!(job_id, "Stop on finished job ignored");
            return Ok(());
        }

        if let Some(def) = self.catalog.get(job_id).await {
            self.propagator.broadcast(
                &def.participants,
                |p| job_path(job_id, p, "status"),
                json!({ "status": Status::Cancelled }),
            );
        }
        tracing::info!(job_id, "Job stopped");
        Ok(())
    }

    /// Kill a job at a party. When addressed to the initiator, every party
    /// of the job is killed and remote parties are told to do the same.
    pub async fn kill_job(
        &self,
        job_id: &str,
        party: PartyRef,
        initiator: Option<PartyRef>,
    ) -> Result<()> {
        let key = StatusKey::job(job_id, party.clone());
        self.registry.get(&key).await?;

        let recorded = self
            .recorded_initiator(&key)
            .await
            .ok_or_else(|| FlowError::Unauthorized(format!("initiator of job {} is unknown", job_id)))?;
        match initiator {
            Some(ref i) if *i == recorded => {}
            Some(i) => {
                return Err(FlowError::Unauthorized(format!(
                    "{} is not the initiator of job {}",
                    i, job_id
                )));
            }
            None => return Err(FlowError::Unauthorized("job_initiator is required".into())),
        }

        if party != recorded {
            self.finish_party(job_id, &party, Status::Killed).await?;
            tracing::info!(job_id, party = %party, "Job killed at party");
            return Ok(());
        }

        for (key, _) in self.registry.job_records(job_id).await {
            self.finish_party(job_id, &key.party, Status::Killed).await?;
        }
        if let Some(def) = self.catalog.get(job_id).await {
            let others: Vec<PartyRef> = def
                .participants
                .iter()
                .filter(|p| **p != recorded)
                .cloned()
                .collect();
            self.propagator.broadcast(
                &others,
                |p| job_path(job_id, p, "kill"),
                json!({ "job_initiator": recorded }),
            );
        }
        tracing::info!(job_id, initiator = %recorded, "Job killed");
        Ok(())
    }

    /// Release one party's logs, artifacts and task records of a finished
    /// job. Other parties are untouched.
    pub async fn clean_job(&self, job_id: &str, party: PartyRef) -> Result<()> {
        let key = StatusKey::job(job_id, party.clone());
        let status = self.registry.get_status(&key).await?;
        if !status.is_terminal() {
            return Err(FlowError::InvalidState(format!(
                "job {} is {} at {}, only finished jobs can be cleaned",
                job_id, status, party
            )));
        }

        let tasks = self
            .registry
            .records(|k| k.job_id == job_id && k.party == party && k.is_task())
            .await;
        for (task_key, _) in &tasks {
            self.registry.remove(task_key).await?;
        }
        remove_dir_if_present(self.logs.party_dir(job_id, &party)?).await?;
        remove_dir_if_present(self.catalog.party_dir(job_id, &party)?).await?;

        tracing::info!(job_id, party = %party, tasks = tasks.len(), "Job resources cleaned");
        Ok(())
    }

    /// Register (`create`) or update a job record at a party.
    ///
    /// Re-creating an existing record is a no-op: the stored status and
    /// fields are left untouched.
    pub async fn update_job_status(
        &self,
        job_id: &str,
        party: PartyRef,
        info: StatusInfo,
        create: bool,
    ) -> Result<()> {
        let key = StatusKey::job(job_id, party.clone());

        if create {
            if let (Some(dsl), Some(conf)) = (info.dsl, info.runtime_conf) {
                if !self.catalog.contains(job_id).await {
                    let def = JobDefinition::from_parts(job_id, dsl, conf)?;
                    self.catalog.insert(def).await?;
                }
            }
            let mut fields = info.extra;
            if let Some(initiator) = info.initiator {
                fields.insert("initiator".into(), serde_json::to_value(initiator)?);
            }
            match self
                .registry
                .create_or_get(&key, Status::INITIAL, fields)
                .await?
            {
                Registration::Created(_) => {
                    tracing::info!(job_id, party = %party, "Job registered at party");
                }
                Registration::Existing(record) => {
                    tracing::debug!(job_id, party = %party, status = %record.status, "Job already registered");
                }
            }
            return Ok(());
        }

        match info.status {
            Some(status @ (Status::Killed | Status::Cancelled)) => {
                let record = self.registry.get(&key).await?;
                if !record.status.can_transition_to(status) {
                    return Err(FlowError::InvalidTransition {
                        key: key.to_string(),
                        from: record.status,
                        to: status,
                    });
                }
                if !info.extra.is_empty() {
                    self.registry.merge_info(&key, info.extra).await?;
                }
                self.finish_party(job_id, &party, status).await?;
            }
            Some(status) => {
                self.registry.set_status(&key, status, info.extra).await?;
            }
            None => {
                self.registry.merge_info(&key, info.extra).await?;
            }
        }
        Ok(())
    }

    /// Register a task and mark it running. The job must be running at the
    /// task's party.
    pub async fn start_task(
        &self,
        job_id: &str,
        component_name: &str,
        task_id: &str,
        party: PartyRef,
        info: StatusInfo,
    ) -> Result<()> {
        let job_status = self
            .registry
            .get_status(&StatusKey::job(job_id, party.clone()))
            .await?;
        if job_status != Status::Running {
            return Err(FlowError::InvalidState(format!(
                "job {} is {} at {}, tasks start only while it is running",
                job_id, job_status, party
            )));
        }
        if let Some(def) = self.catalog.get(job_id).await {
            if !def.components().iter().any(|c| c == component_name) {
                return Err(FlowError::InvalidSpec(format!(
                    "component {} is not part of job {}",
                    component_name, job_id
                )));
            }
        }

        let key = StatusKey::task(job_id, component_name, task_id, party);
        self.registry
            .create(&key, Status::INITIAL, info.extra)
            .await?;
        self.registry
            .set_status(&key, Status::Running, Map::new())
            .await?;
        tracing::info!(key = %key, "Task started");
        Ok(())
    }

    /// Update a task's status. Terminal updates may finish the job, and
    /// updates at a non-initiating node are forwarded to the initiator.
    pub async fn update_task_status(
        &self,
        job_id: &str,
        component_name: &str,
        task_id: &str,
        party: PartyRef,
        info: StatusInfo,
    ) -> Result<()> {
        let key = StatusKey::task(job_id, component_name, task_id, party.clone());
        if !self.propagator.is_local(&party) {
            return self.mirror_task_status(&key, info).await;
        }
        let forward = serde_json::to_value(&info)?;

        let Some(status) = info.status else {
            self.registry.merge_info(&key, info.extra).await?;
            return Ok(());
        };
        self.registry.set_status(&key, status, info.extra).await?;

        if let Some(def) = self.catalog.get(job_id).await {
            if !self.propagator.is_local(&def.initiator) {
                self.propagator.dispatch(
                    def.initiator.clone(),
                    task_path(job_id, component_name, task_id, &party, "status"),
                    forward,
                );
            }
        }

        if status.is_terminal() {
            self.aggregate_job_status(job_id).await?;
        }
        Ok(())
    }

    /// Record a status reported for another party's task, as forwarded to
    /// the initiator. Forwarded reports may arrive out of order, so a stale
    /// one is dropped instead of rejected.
    async fn mirror_task_status(&self, key: &StatusKey, info: StatusInfo) -> Result<()> {
        self.registry
            .create_or_get(key, Status::INITIAL, Map::new())
            .await?;
        let Some(status) = info.status else {
            self.registry.merge_info(key, info.extra).await?;
            return Ok(());
        };

        let current = self.registry.get_status(key).await?;
        if !current.can_transition_to(status) && Status::Running.can_transition_to(status) {
            self.transition_if_allowed(key, Status::Running).await?;
        }
        match self.registry.set_status(key, status, info.extra).await {
            Ok(_) => {}
            Err(FlowError::InvalidTransition { from, .. }) => {
                tracing::debug!(key = %key, from = %from, to = %status, "Stale task report dropped");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        if status.is_terminal() {
            self.aggregate_job_status(&key.job_id).await?;
        }
        Ok(())
    }

    /// Roll task outcomes up to the job once every task is finished: all
    /// success makes the job succeed, any failure fails it. Tasks ended by
    /// kill/stop leave the job to that explicit operation.
    async fn aggregate_job_status(&self, job_id: &str) -> Result<()> {
        let tasks = self.registry.task_records(job_id).await;
        if tasks.is_empty() || tasks.iter().any(|(_, r)| !r.status.is_terminal()) {
            return Ok(());
        }
        if let Some(def) = self.catalog.get(job_id).await {
            let missing = def.components().into_iter().find(|c| {
                !tasks
                    .iter()
                    .any(|(k, _)| k.task.as_ref().is_some_and(|t| t.component_name == *c))
            });
            if let Some(component) = missing {
                tracing::debug!(job_id, component, "Job has components without tasks yet");
                return Ok(());
            }
        }

        let outcome = if tasks.iter().any(|(_, r)| r.status == Status::Failed) {
            Status::Failed
        } else if tasks.iter().all(|(_, r)| r.status == Status::Success) {
            Status::Success
        } else {
            return Ok(());
        };

        for (key, record) in self.registry.job_records(job_id).await {
            if record.status == Status::Running {
                self.transition_if_allowed(&key, outcome).await?;
            }
        }
        tracing::info!(job_id, status = %outcome, tasks = tasks.len(), "Job finished");
        Ok(())
    }

    /// Move a party's job record and its unfinished tasks to `status`.
    /// Returns whether anything changed.
    async fn finish_party(&self, job_id: &str, party: &PartyRef, status: Status) -> Result<bool> {
        let mut changed = false;
        let job_key = StatusKey::job(job_id, party.clone());
        if let Ok(current) = self.registry.get_status(&job_key).await {
            if !current.is_terminal() {
                changed |= self.transition_if_allowed(&job_key, status).await?;
            }
        }

        let tasks = self
            .registry
            .records(|k| k.job_id == job_id && k.party == *party && k.is_task())
            .await;
        for (key, record) in tasks {
            if !record.status.is_terminal() {
                changed |= self.transition_if_allowed(&key, status).await?;
            }
        }
        Ok(changed)
    }

    /// Apply a transition, treating a lost race to another terminal status
    /// as "nothing to do".
    async fn transition_if_allowed(&self, key: &StatusKey, status: Status) -> Result<bool> {
        match self.registry.set_status(key, status, Map::new()).await {
            Ok(_) => Ok(true),
            Err(FlowError::InvalidTransition { from, .. }) => {
                tracing::debug!(key = %key, from = %from, to = %status, "Transition skipped");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Job records at every party matching `filter`.
    pub async fn query_jobs(&self, filter: &JobFilter) -> Vec<JobRecord> {
        let records = self
            .registry
            .records(|k| !k.is_task() && filter.job_id.as_ref().is_none_or(|id| *id == k.job_id))
            .await;

        let mut out = Vec::new();
        for (key, record) in records {
            let def = self.catalog.get(&key.job_id).await;
            let initiator = match &def {
                Some(def) => Some(def.initiator.clone()),
                None => record
                    .info
                    .get("initiator")
                    .and_then(|v| serde_json::from_value(v.clone()).ok()),
            };
            if !filter.matches(&key, record.status, initiator.as_ref()) {
                continue;
            }
            out.push(JobRecord {
                is_initiator: initiator.as_ref() == Some(&key.party),
                job_id: key.job_id,
                role: key.party.role,
                party_id: key.party.party_id,
                status: record.status,
                initiator,
                dsl: def.as_ref().map(|d| d.dsl.clone()),
                runtime_conf: def.as_ref().map(|d| d.runtime_conf.clone()),
                info: record.info,
                create_time: record.created_at,
                update_time: record.updated_at,
            });
        }
        out
    }

    /// DSL, runtime conf and model info of the first job matching `filter`.
    pub async fn job_config(&self, filter: &JobFilter) -> Result<JobConfig> {
        for record in self.query_jobs(filter).await {
            if let Some(def) = self.catalog.get(&record.job_id).await {
                return Ok(JobConfig {
                    job_id: def.job_id,
                    dsl: def.dsl,
                    runtime_conf: def.runtime_conf,
                    model_info: def.model_info,
                });
            }
        }
        Err(FlowError::NotFound("find job failed".into()))
    }

    /// Persist the pipeline artifact of a job for one party.
    pub async fn save_pipeline(
        &self,
        job_id: &str,
        party: PartyRef,
        model_key: &str,
    ) -> Result<PathBuf> {
        let def = self
            .catalog
            .get(job_id)
            .await
            .ok_or_else(|| FlowError::NotFound(format!("job {}", job_id)))?;
        self.registry
            .get(&StatusKey::job(job_id, party.clone()))
            .await?;
        let path = self.pipelines.save(&def, &party, model_key).await?;
        tracing::info!(job_id, party = %party, model_key, path = %path.display(), "Pipeline saved");
        Ok(path)
    }

    /// Gzipped tarball of a job's log directory.
    pub async fn job_log(&self, job_id: &str) -> Result<Vec<u8>> {
        if job_id.is_empty() || !self.job_known(job_id).await {
            return Err(FlowError::NotFound(format!("job {}", job_id)));
        }
        self.logs.archive(job_id).await
    }

    pub async fn propagation_failures(&self) -> Vec<PropagationFailure> {
        self.propagator.recent_failures().await
    }
}

async fn remove_dir_if_present(dir: PathBuf) -> Result<()> {
    match tokio::fs::remove_dir_all(&dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
