use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::scheduler::{JobDefinition, PartyRef};
use crate::storage::path_segment;

const DSL_FILE: &str = "job_dsl.json";
const RUNTIME_CONF_FILE: &str = "job_runtime_conf.json";
const META_FILE: &str = "job_meta.json";

/// On-disk locations of a job's specification files.
#[derive(Debug, Clone, PartialEq)]
pub struct JobPaths {
    pub dsl_path: PathBuf,
    pub runtime_conf_path: PathBuf,
}

/// Job specification store: DSL and runtime conf per job, kept under
/// `<root>/<job_id>/` and indexed in memory.
#[derive(Debug)]
pub struct JobCatalog {
    root: PathBuf,
    jobs: RwLock<HashMap<String, JobDefinition>>,
}

impl JobCatalog {
    /// Open the catalog at `root`, loading every job definition found there.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;

        let mut jobs = HashMap::new();
        let mut entries = fs::read_dir(&root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.path().join(META_FILE);
            let Ok(bytes) = fs::read(&meta).await else {
                continue;
            };
            match serde_json::from_slice::<JobDefinition>(&bytes) {
                Ok(def) => {
                    jobs.insert(def.job_id.clone(), def);
                }
                Err(e) => {
                    tracing::warn!(path = %meta.display(), error = %e, "Skipping unreadable job definition");
                }
            }
        }
        tracing::debug!(root = %root.display(), jobs = jobs.len(), "Job catalog loaded");

        Ok(Self {
            root,
            jobs: RwLock::new(jobs),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn job_dir(&self, job_id: &str) -> Result<PathBuf> {
        Ok(self.root.join(path_segment("job_id", job_id)?))
    }

    pub fn paths(&self, job_id: &str) -> Result<JobPaths> {
        let dir = self.job_dir(job_id)?;
        Ok(JobPaths {
            dsl_path: dir.join(DSL_FILE),
            runtime_conf_path: dir.join(RUNTIME_CONF_FILE),
        })
    }

    /// Directory for artifacts a single party produced for a job.
    pub fn party_dir(&self, job_id: &str, party: &PartyRef) -> Result<PathBuf> {
        Ok(self
            .job_dir(job_id)?
            .join(path_segment("role", &party.role)?)
            .join(party.party_id.to_string()))
    }

    /// Persist a definition. An existing definition for the same job is kept.
    pub async fn insert(&self, def: JobDefinition) -> Result<JobPaths> {
        let paths = self.paths(&def.job_id)?;
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&def.job_id) {
            return Ok(paths);
        }

        let dir = self.job_dir(&def.job_id)?;
        fs::create_dir_all(&dir).await?;
        fs::write(&paths.dsl_path, serde_json::to_vec_pretty(&def.dsl)?).await?;
        fs::write(
            &paths.runtime_conf_path,
            serde_json::to_vec_pretty(&def.runtime_conf)?,
        )
        .await?;
        fs::write(dir.join(META_FILE), serde_json::to_vec_pretty(&def)?).await?;

        jobs.insert(def.job_id.clone(), def);
        Ok(paths)
    }

    pub async fn get(&self, job_id: &str) -> Option<JobDefinition> {
        self.jobs.read().await.get(job_id).cloned()
    }

    pub async fn contains(&self, job_id: &str) -> bool {
        self.jobs.read().await.contains_key(job_id)
    }
}
