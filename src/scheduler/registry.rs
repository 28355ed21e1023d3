use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock};

use crate::error::{FlowError, Result};
use crate::scheduler::{Status, StatusKey, StatusRecord};
use crate::storage::StatusStore;

/// Per-key slot. Empty means "never created" or "cleaned".
type Slot = Arc<Mutex<Option<StatusRecord>>>;

/// Outcome of an idempotent create.
#[derive(Debug, Clone, PartialEq)]
pub enum Registration {
    Created(StatusRecord),
    Existing(StatusRecord),
}

impl Registration {
    pub fn record(&self) -> &StatusRecord {
        match self {
            Registration::Created(r) | Registration::Existing(r) => r,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Registration::Created(_))
    }
}

/// Job and task status keyed by (job_id, role, party_id[, component, task]).
///
/// Every key has its own lock, so writers to the same key are serialized
/// while different keys proceed independently. A write is persisted to the
/// backing [`StatusStore`] before it becomes visible.
pub struct StatusRegistry {
    slots: RwLock<HashMap<StatusKey, Slot>>,
    store: Arc<dyn StatusStore>,
}

impl StatusRegistry {
    /// Build a registry primed with everything the store already holds.
    pub fn load(store: Arc<dyn StatusStore>) -> Result<Self> {
        let slots: HashMap<StatusKey, Slot> = store
            .load_all()?
            .into_iter()
            .map(|(key, record)| (key, Arc::new(Mutex::new(Some(record)))))
            .collect();
        tracing::debug!(records = slots.len(), "Status registry loaded");
        Ok(Self {
            slots: RwLock::new(slots),
            store,
        })
    }

    async fn existing_slot(&self, key: &StatusKey) -> Option<Slot> {
        self.slots.read().await.get(key).cloned()
    }

    async fn slot(&self, key: &StatusKey) -> Slot {
        if let Some(slot) = self.existing_slot(key).await {
            return slot;
        }
        self.slots
            .write()
            .await
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Forget `key` if its slot is empty and nobody else holds it. Callers
    /// must drop their own guard and slot first.
    async fn prune(&self, key: &StatusKey) {
        let mut slots = self.slots.write().await;
        let vacant = slots.get(key).is_some_and(|slot| {
            Arc::strong_count(slot) == 1 && slot.try_lock().is_ok_and(|guard| guard.is_none())
        });
        if vacant {
            slots.remove(key);
        }
    }

    pub async fn get(&self, key: &StatusKey) -> Result<StatusRecord> {
        let slot = self
            .existing_slot(key)
            .await
            .ok_or_else(|| FlowError::NotFound(key.to_string()))?;
        let guard = slot.lock().await;
        guard
            .clone()
            .ok_or_else(|| FlowError::NotFound(key.to_string()))
    }

    pub async fn get_status(&self, key: &StatusKey) -> Result<Status> {
        Ok(self.get(key).await?.status)
    }

    /// Register a new key. Fails with `AlreadyExists` if it is registered.
    pub async fn create(
        &self,
        key: &StatusKey,
        initial: Status,
        info: Map<String, Value>,
    ) -> Result<StatusRecord> {
        match self.create_or_get(key, initial, info).await? {
            Registration::Created(record) => Ok(record),
            Registration::Existing(_) => Err(FlowError::AlreadyExists(key.to_string())),
        }
    }

    /// Register a new key, or return the stored record untouched if the key
    /// is already registered.
    pub async fn create_or_get(
        &self,
        key: &StatusKey,
        initial: Status,
        info: Map<String, Value>,
    ) -> Result<Registration> {
        let slot = self.slot(key).await;
        let mut guard = slot.lock().await;
        if let Some(existing) = guard.as_ref() {
            return Ok(Registration::Existing(existing.clone()));
        }

        let record = StatusRecord::new(initial, info);
        self.store.save(key, &record)?;
        *guard = Some(record.clone());
        tracing::debug!(key = %key, status = %initial, "Status record created");
        Ok(Registration::Created(record))
    }

    /// Apply a validated status transition and merge `info` into the record.
    ///
    /// An unknown key is created only when `new_status` is the initial status.
    pub async fn set_status(
        &self,
        key: &StatusKey,
        new_status: Status,
        info: Map<String, Value>,
    ) -> Result<StatusRecord> {
        let slot = if new_status == Status::INITIAL {
            self.slot(key).await
        } else {
            self.existing_slot(key)
                .await
                .ok_or_else(|| FlowError::NotFound(key.to_string()))?
        };
        let mut guard = slot.lock().await;
        if guard.is_none() && new_status != Status::INITIAL {
            drop(guard);
            drop(slot);
            self.prune(key).await;
            return Err(FlowError::NotFound(key.to_string()));
        }

        let next = match guard.as_ref() {
            None => StatusRecord::new(new_status, info),
            Some(current) => {
                if !current.status.can_transition_to(new_status) {
                    return Err(FlowError::InvalidTransition {
                        key: key.to_string(),
                        from: current.status,
                        to: new_status,
                    });
                }
                let mut next = current.clone();
                next.status = new_status;
                next.info.extend(info);
                next.version += 1;
                next.updated_at = Utc::now();
                next
            }
        };

        self.store.save(key, &next)?;
        let previous = guard.replace(next.clone()).map(|r| r.status);
        if previous != Some(new_status) {
            tracing::info!(key = %key, from = ?previous, to = %new_status, "Status changed");
        }
        Ok(next)
    }

    /// Merge info fields without touching status. Terminal records are final.
    pub async fn merge_info(&self, key: &StatusKey, info: Map<String, Value>) -> Result<StatusRecord> {
        let slot = self
            .existing_slot(key)
            .await
            .ok_or_else(|| FlowError::NotFound(key.to_string()))?;
        let mut guard = slot.lock().await;
        let current = guard
            .as_ref()
            .ok_or_else(|| FlowError::NotFound(key.to_string()))?;
        if current.status.is_terminal() {
            return Err(FlowError::InvalidState(format!(
                "{} is {} and no longer accepts updates",
                key, current.status
            )));
        }

        let mut next = current.clone();
        next.info.extend(info);
        next.version += 1;
        next.updated_at = Utc::now();
        self.store.save(key, &next)?;
        *guard = Some(next.clone());
        Ok(next)
    }

    /// Drop a key's record. Returns whether anything was removed.
    pub async fn remove(&self, key: &StatusKey) -> Result<bool> {
        let Some(slot) = self.existing_slot(key).await else {
            return Ok(false);
        };
        let mut guard = slot.lock().await;
        if guard.is_none() {
            return Ok(false);
        }
        self.store.remove(key)?;
        *guard = None;
        drop(guard);
        drop(slot);
        self.prune(key).await;
        Ok(true)
    }

    /// Snapshot of all live records matching `predicate`, sorted by key.
    pub async fn records<F>(&self, predicate: F) -> Vec<(StatusKey, StatusRecord)>
    where
        F: Fn(&StatusKey) -> bool,
    {
        let slots: Vec<(StatusKey, Slot)> = self
            .slots
            .read()
            .await
            .iter()
            .filter(|(key, _)| predicate(key))
            .map(|(key, slot)| (key.clone(), slot.clone()))
            .collect();

        let mut out = Vec::with_capacity(slots.len());
        for (key, slot) in slots {
            if let Some(record) = slot.lock().await.clone() {
                out.push((key, record));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Job-level records (one per party) of a job.
    pub async fn job_records(&self, job_id: &str) -> Vec<(StatusKey, StatusRecord)> {
        self.records(|k| k.job_id == job_id && !k.is_task()).await
    }

    /// Task-level records of a job across all parties.
    pub async fn task_records(&self, job_id: &str) -> Vec<(StatusKey, StatusRecord)> {
        self.records(|k| k.job_id == job_id && k.is_task()).await
    }
}
