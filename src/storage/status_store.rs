use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};
use crate::scheduler::{StatusKey, StatusRecord};
use crate::storage::{path_segment, run_blocking};

/// Durable backing for the status registry.
///
/// Writes are synchronous: the registry acknowledges an update only after
/// `save` returns. Implementations that touch the disk go through
/// [`run_blocking`].
pub trait StatusStore: Send + Sync {
    fn load_all(&self) -> Result<Vec<(StatusKey, StatusRecord)>>;
    fn save(&self, key: &StatusKey, record: &StatusRecord) -> Result<()>;
    fn remove(&self, key: &StatusKey) -> Result<()>;
}

/// Keeps records in process memory only.
#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    records: Mutex<HashMap<StatusKey, StatusRecord>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<StatusKey, StatusRecord>>> {
        self.records
            .lock()
            .map_err(|_| FlowError::Internal("status store lock poisoned".into()))
    }
}

impl StatusStore for MemoryStatusStore {
    fn load_all(&self) -> Result<Vec<(StatusKey, StatusRecord)>> {
        Ok(self
            .lock()?
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn save(&self, key: &StatusKey, record: &StatusRecord) -> Result<()> {
        self.lock()?.insert(key.clone(), record.clone());
        Ok(())
    }

    fn remove(&self, key: &StatusKey) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct StoredStatus {
    key: StatusKey,
    record: StatusRecord,
}

/// One JSON file per key under `<root>/<job_id>/`.
#[derive(Debug, Clone)]
pub struct FileStatusStore {
    root: PathBuf,
}

impl FileStatusStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &StatusKey) -> Result<PathBuf> {
        let mut name = format!("{}_{}", sanitize(&key.party.role), key.party.party_id);
        if let Some(task) = &key.task {
            name.push_str(&format!(
                "__{}__{}",
                sanitize(&task.component_name),
                sanitize(&task.task_id)
            ));
        }
        Ok(self
            .root
            .join(path_segment("job_id", &key.job_id)?)
            .join(format!("{}.json", name)))
    }
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn read_dir_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            files.extend(read_dir_files(&path)?);
        } else if path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    Ok(files)
}

impl StatusStore for FileStatusStore {
    fn load_all(&self) -> Result<Vec<(StatusKey, StatusRecord)>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        run_blocking(|| -> Result<Vec<(StatusKey, StatusRecord)>> {
            let mut out = Vec::new();
            for path in read_dir_files(&self.root)? {
                let bytes = fs::read(&path)?;
                match serde_json::from_slice::<StoredStatus>(&bytes) {
                    Ok(stored) => out.push((stored.key, stored.record)),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable status file");
                    }
                }
            }
            Ok(out)
        })
    }

    fn save(&self, key: &StatusKey, record: &StatusRecord) -> Result<()> {
        let path = self.path_for(key)?;
        let body = serde_json::to_vec_pretty(&StoredStatus {
            key: key.clone(),
            record: record.clone(),
        })?;
        run_blocking(|| -> Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let tmp = path.with_extension("json.tmp");
            fs::write(&tmp, body)?;
            fs::rename(&tmp, &path)?;
            Ok(())
        })
    }

    fn remove(&self, key: &StatusKey) -> Result<()> {
        let path = self.path_for(key)?;
        match run_blocking(|| fs::remove_file(&path)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{PartyRef, Status};

    #[test]
    fn file_store_round_trips_job_and_task_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStatusStore::new(dir.path());

        let job = StatusKey::job("j1", PartyRef::new("host", 1));
        let task = StatusKey::task("j1", "reader/0", "t1", PartyRef::new("host", 1));
        store
            .save(&job, &StatusRecord::new(Status::Running, Default::default()))
            .unwrap();
        store
            .save(&task, &StatusRecord::new(Status::Waiting, Default::default()))
            .unwrap();

        let mut loaded = store.load_all().unwrap();
        loaded.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].0, job);
        assert_eq!(loaded[0].1.status, Status::Running);
        assert_eq!(loaded[1].0, task);

        store.remove(&task).unwrap();
        store.remove(&task).unwrap();
        assert_eq!(store.load_all().unwrap().len(), 1);
    }

    #[test]
    fn keys_cannot_escape_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStatusStore::new(dir.path().join("status"));
        let record = StatusRecord::new(Status::Waiting, Default::default());

        for job_id in ["..", "."] {
            let key = StatusKey::job(job_id, PartyRef::new("guest", 2));
            assert!(matches!(
                store.save(&key, &record),
                Err(FlowError::InvalidSpec(_))
            ));
        }
        assert!(!dir.path().join("guest_2.json").exists());

        // other parts only ever form a file name
        let key = StatusKey::task("j1", "..", "../t", PartyRef::new("..", 2));
        store.save(&key, &record).unwrap();
        assert_eq!(store.load_all().unwrap()[0].0, key);
    }

    #[test]
    fn missing_root_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStatusStore::new(dir.path().join("absent"));
        assert!(store.load_all().unwrap().is_empty());
    }
}
