//! ---
//! cc_section: "03-persistence-logging"
//! cc_subsection: "module"
//! cc_type: "source"
//! cc_scope: "code"
//! cc_description: "In-process experiment store for tests and memory:// deployments."
//! cc_version: "v0.1.0"
//! cc_owner: "tbd"
//! ---
use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::model::{Experiment, ExperimentState, LastError, ListFilter, NewExperiment};
use crate::{ExperimentStore, Result, StoreError};

pub(crate) const BACKEND: &str = "memory";

#[derive(Debug)]
struct Entry {
    seq: u64,
    record: Experiment,
}

#[derive(Debug, Default)]
struct Inner {
    next_seq: u64,
    records: HashMap<Uuid, Entry>,
    keys: HashMap<String, Uuid>,
    retired: HashSet<Uuid>,
}

impl Inner {
    fn allocate_id(&self) -> Uuid {
        loop {
            let id = Uuid::new_v4();
            if !self.records.contains_key(&id) && !self.retired.contains(&id) {
                return id;
            }
        }
    }
}

/// Store backed by in-process maps. Not durable across restarts.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExperimentStore for MemoryStore {
    async fn get(&self, id: Uuid) -> Result<Experiment> {
        self.inner
            .read()
            .records
            .get(&id)
            .map(|entry| entry.record.clone())
            .ok_or(StoreError::NotFound(id))
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<Experiment>> {
        let inner = self.inner.read();
        let mut entries: Vec<&Entry> = inner
            .records
            .values()
            .filter(|entry| filter.state.map_or(true, |state| entry.record.state == state))
            .collect();
        entries.sort_by(|a, b| {
            b.record
                .created_at
                .cmp(&a.record.created_at)
                .then(b.seq.cmp(&a.seq))
        });
        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(entries
            .into_iter()
            .take(limit)
            .map(|entry| entry.record.clone())
            .collect())
    }

    async fn count(&self, state: Option<ExperimentState>) -> Result<usize> {
        let inner = self.inner.read();
        Ok(inner
            .records
            .values()
            .filter(|entry| state.map_or(true, |state| entry.record.state == state))
            .count())
    }

    async fn create(&self, new: NewExperiment) -> Result<Experiment> {
        let mut inner = self.inner.write();
        if let Some(key) = new.idempotency_key.as_ref() {
            if let Some(existing) = inner.keys.get(key) {
                return Err(StoreError::DuplicateIdempotencyKey {
                    key: key.clone(),
                    existing: *existing,
                });
            }
        }

        let id = inner.allocate_id();
        let record = Experiment::pending(id, new.spec, new.idempotency_key);
        if let Some(key) = record.idempotency_key.clone() {
            inner.keys.insert(key, id);
        }
        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.records.insert(
            id,
            Entry {
                seq,
                record: record.clone(),
            },
        );
        Ok(record)
    }

    async fn compare_and_swap(
        &self,
        id: Uuid,
        expected_version: u64,
        state: ExperimentState,
        last_error: Option<LastError>,
    ) -> Result<Experiment> {
        let mut inner = self.inner.write();
        let entry = inner.records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if entry.record.version != expected_version {
            return Err(StoreError::VersionConflict {
                id,
                expected: expected_version,
                actual: entry.record.version,
            });
        }
        let record = &mut entry.record;
        record.state = state;
        record.last_error = last_error;
        record.version += 1;
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.write();
        let state = inner
            .records
            .get(&id)
            .map(|entry| entry.record.state)
            .ok_or(StoreError::NotFound(id))?;
        if !state.is_deletable() {
            return Err(StoreError::NotDeletable { id, state });
        }
        inner.records.remove(&id);
        inner.retired.insert(id);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn backend(&self) -> &'static str {
        BACKEND
    }
}
