//! Job-store collaborator.
//!
//! The store owns job records; this crate only upserts fetched listings and
//! issues lifecycle transitions (stale, soft-delete, archive) decided by the
//! retention service. `MemoryJobStore` backs the CLI and the tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::registry::RawListing;
use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordState {
    Active,
    Stale,
    SoftDeleted,
}

pub type RecordId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: RecordId,
    pub source: String,
    pub external_id: String,
    pub title: String,
    pub url: Option<String>,
    pub last_seen_at: DateTime<Utc>,
    pub state: RecordState,
    pub state_changed_at: DateTime<Utc>,
}

/// A lifecycle decision for one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Transition {
    MarkStale { id: RecordId, at: DateTime<Utc> },
    SoftDelete { id: RecordId, at: DateTime<Utc> },
    Archive { id: RecordId, at: DateTime<Utc> },
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts new listings and refreshes `last_seen_at` on known ones.
    /// Returns how many listings were written.
    async fn upsert(
        &self,
        source: &str,
        listings: &[RawListing],
        seen_at: DateTime<Utc>,
    ) -> Result<usize, StoreError>;

    /// Live (not archived) records.
    async fn records(&self) -> Result<Vec<JobRecord>, StoreError>;

    /// Applies transitions, skipping any that no longer match the record's
    /// state. Returns how many took effect.
    async fn apply(&self, transitions: &[Transition]) -> Result<usize, StoreError>;

    async fn archived_count(&self) -> Result<usize, StoreError>;
}

pub type StoreRef = Arc<dyn JobStore>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchivedJob {
    pub record: JobRecord,
    pub archived_at: DateTime<Utc>,
}

#[derive(Default)]
struct MemoryInner {
    next_id: RecordId,
    live: HashMap<RecordId, JobRecord>,
    by_key: HashMap<(String, String), RecordId>,
    archived: Vec<ArchivedJob>,
}

#[derive(Default)]
pub struct MemoryJobStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn archived(&self) -> Vec<ArchivedJob> {
        self.inner.read().await.archived.clone()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn upsert(
        &self,
        source: &str,
        listings: &[RawListing],
        seen_at: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().await;
        let mut written = 0;
        for listing in listings {
            let key = (source.to_string(), listing.external_id.clone());
            match inner.by_key.get(&key).copied() {
                Some(id) => {
                    if let Some(record) = inner.live.get_mut(&id) {
                        record.last_seen_at = record.last_seen_at.max(seen_at);
                        record.title = listing.title.clone();
                        record.url = listing.url.clone();
                        if record.state != RecordState::Active {
                            record.state = RecordState::Active;
                            record.state_changed_at = seen_at;
                        }
                        written += 1;
                    }
                }
                None => {
                    inner.next_id += 1;
                    let id = inner.next_id;
                    inner.live.insert(
                        id,
                        JobRecord {
                            id,
                            source: source.to_string(),
                            external_id: listing.external_id.clone(),
                            title: listing.title.clone(),
                            url: listing.url.clone(),
                            last_seen_at: seen_at,
                            state: RecordState::Active,
                            state_changed_at: seen_at,
                        },
                    );
                    inner.by_key.insert(key, id);
                    written += 1;
                }
            }
        }
        Ok(written)
    }

    async fn records(&self) -> Result<Vec<JobRecord>, StoreError> {
        let inner = self.inner.read().await;
        let mut records: Vec<JobRecord> = inner.live.values().cloned().collect();
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    async fn apply(&self, transitions: &[Transition]) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().await;
        let mut applied = 0;
        for transition in transitions {
            match *transition {
                Transition::MarkStale { id, at } => {
                    if let Some(r) = inner.live.get_mut(&id) {
                        if r.state == RecordState::Active {
                            r.state = RecordState::Stale;
                            r.state_changed_at = at;
                            applied += 1;
                        }
                    }
                }
                Transition::SoftDelete { id, at } => {
                    if let Some(r) = inner.live.get_mut(&id) {
                        if r.state != RecordState::SoftDeleted {
                            r.state = RecordState::SoftDeleted;
                            r.state_changed_at = at;
                            applied += 1;
                        }
                    }
                }
                Transition::Archive { id, at } => {
                    let deleted = inner
                        .live
                        .get(&id)
                        .is_some_and(|r| r.state == RecordState::SoftDeleted);
                    if deleted {
                        if let Some(record) = inner.live.remove(&id) {
                            let key = (record.source.clone(), record.external_id.clone());
                            inner.by_key.remove(&key);
                            inner.archived.push(ArchivedJob { record, archived_at: at });
                            applied += 1;
                        }
                    }
                }
            }
        }
        Ok(applied)
    }

    async fn archived_count(&self) -> Result<usize, StoreError> {
        Ok(self.inner.read().await.archived.len())
    }
}
