//! Freshness classification for stored job records.
//!
//! Lifecycle: ACTIVE -> STALE -> SOFT_DELETED -> archived. Each decision is
//! derived from the record's state, its timestamps and the caller's `now`,
//! so re-running with the same clock issues nothing new.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::core::store::{JobRecord, RecordState, StoreRef, Transition};
use crate::error::{ConfigError, StoreError};

/// Upper bound for every retention window, in days.
pub const MAX_RETENTION_DAYS: u32 = 36_500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    expired_days: u32,
    stale_grace_days: u32,
    archive_days: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            expired_days: 30,
            stale_grace_days: 7,
            archive_days: 90,
        }
    }
}

impl RetentionPolicy {
    pub fn new(expired_days: u32) -> Result<Self, ConfigError> {
        Self::default().with_expired_days(expired_days)
    }

    pub fn with_windows(
        expired_days: u32,
        stale_grace_days: u32,
        archive_days: u32,
    ) -> Result<Self, ConfigError> {
        Self {
            expired_days,
            stale_grace_days,
            archive_days,
        }
        .validated()
    }

    /// Same windows with a different expiry, as requested by a cleanup task.
    pub fn with_expired_days(self, expired_days: u32) -> Result<Self, ConfigError> {
        Self { expired_days, ..self }.validated()
    }

    pub fn expired_days(&self) -> u32 {
        self.expired_days
    }

    pub fn stale_grace_days(&self) -> u32 {
        self.stale_grace_days
    }

    pub fn archive_days(&self) -> u32 {
        self.archive_days
    }

    fn validated(self) -> Result<Self, ConfigError> {
        if self.expired_days == 0 {
            return Err(ConfigError::invalid(
                "RETENTION_EXPIRED_DAYS",
                0,
                "must be greater than zero",
            ));
        }
        for (key, days) in [
            ("RETENTION_EXPIRED_DAYS", self.expired_days),
            ("RETENTION_STALE_GRACE_DAYS", self.stale_grace_days),
            ("RETENTION_ARCHIVE_DAYS", self.archive_days),
        ] {
            if days > MAX_RETENTION_DAYS {
                return Err(ConfigError::invalid(
                    key,
                    days,
                    format!("must be at most {} days", MAX_RETENTION_DAYS),
                ));
            }
        }
        Ok(self)
    }

    /// Transitions due for `record` at `now`, in lifecycle order.
    pub fn classify(&self, record: &JobRecord, now: DateTime<Utc>) -> Vec<Transition> {
        let mut due = Vec::new();
        let mut state = record.state;
        let mut changed_at = record.state_changed_at;

        let expired = older_than(record.last_seen_at, now, self.expired_days, false);
        if state == RecordState::Active && expired {
            due.push(Transition::MarkStale { id: record.id, at: now });
            state = RecordState::Stale;
            changed_at = now;
        }
        if state == RecordState::Stale && older_than(changed_at, now, self.stale_grace_days, true) {
            due.push(Transition::SoftDelete { id: record.id, at: now });
            state = RecordState::SoftDeleted;
            changed_at = now;
        }
        if state == RecordState::SoftDeleted
            && older_than(changed_at, now, self.archive_days, true)
        {
            due.push(Transition::Archive { id: record.id, at: now });
        }
        due
    }
}

/// True when `at` lies before `now - days` (or on it, when `inclusive`).
/// A cutoff that falls outside chrono's range is never reached.
fn older_than(at: DateTime<Utc>, now: DateTime<Utc>, days: u32, inclusive: bool) -> bool {
    let cutoff = Duration::try_days(i64::from(days)).and_then(|d| now.checked_sub_signed(d));
    let Some(cutoff) = cutoff else {
        return false;
    };
    if inclusive {
        at <= cutoff
    } else {
        at < cutoff
    }
}

/// Liveness check for a posting URL.
#[async_trait]
pub trait LinkProbe: Send + Sync {
    /// True only when the posting is definitely gone.
    async fn is_dead(&self, url: &str) -> bool;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub stale: usize,
    pub soft_deleted: usize,
    pub archived: usize,
    pub probed: usize,
}

impl RetentionReport {
    pub fn changes(&self) -> usize {
        self.stale + self.soft_deleted + self.archived
    }
}

pub struct RetentionService {
    store: StoreRef,
    probe: Option<Arc<dyn LinkProbe>>,
}

impl RetentionService {
    pub fn new(store: StoreRef) -> Self {
        Self { store, probe: None }
    }

    /// Soft-deletes stale records whose posting URL is dead.
    pub fn with_link_probe(mut self, probe: Arc<dyn LinkProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub async fn run(
        &self,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<RetentionReport, StoreError> {
        let records = self.store.records().await?;
        let mut report = RetentionReport::default();
        let mut transitions = Vec::new();

        for record in &records {
            let due = policy.classify(record, now);
            let ends_stale = match due.last() {
                Some(Transition::MarkStale { .. }) => true,
                Some(_) => false,
                None => record.state == RecordState::Stale,
            };

            if ends_stale {
                if let (Some(probe), Some(url)) = (&self.probe, record.url.as_deref()) {
                    report.probed += 1;
                    if probe.is_dead(url).await {
                        debug!("Posting {} is gone, soft-deleting record {}", url, record.id);
                        transitions.extend(due);
                        transitions.push(Transition::SoftDelete { id: record.id, at: now });
                        continue;
                    }
                }
            }
            transitions.extend(due);
        }

        // One batch per kind keeps each record's transitions in lifecycle
        // order, and the store's per-batch count tells what actually landed.
        let issued = transitions.len();
        let (mut stale, mut deletes, mut archives) = (Vec::new(), Vec::new(), Vec::new());
        for t in transitions {
            match t {
                Transition::MarkStale { .. } => stale.push(t),
                Transition::SoftDelete { .. } => deletes.push(t),
                Transition::Archive { .. } => archives.push(t),
            }
        }
        report.stale = self.apply_batch(&stale).await?;
        report.soft_deleted = self.apply_batch(&deletes).await?;
        report.archived = self.apply_batch(&archives).await?;

        if report.changes() < issued {
            debug!(
                "Store skipped {} of {} transitions whose records changed underneath",
                issued - report.changes(),
                issued
            );
        }
        info!(
            "Retention pass: {} stale, {} soft-deleted, {} archived ({} links probed)",
            report.stale, report.soft_deleted, report.archived, report.probed
        );
        Ok(report)
    }

    async fn apply_batch(&self, batch: &[Transition]) -> Result<usize, StoreError> {
        if batch.is_empty() {
            return Ok(0);
        }
        self.store.apply(batch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::RawListing;
    use crate::core::store::{JobStore, MemoryJobStore};

    fn listing(title: &str) -> RawListing {
        RawListing::new(title, Some(format!("https://jobs.example.com/{}", title)))
    }

    async fn seeded(ages_days: &[i64], now: DateTime<Utc>) -> Arc<MemoryJobStore> {
        let store = Arc::new(MemoryJobStore::new());
        for (i, age) in ages_days.iter().enumerate() {
            store
                .upsert("tavily", &[listing(&format!("job-{}", i))], now - Duration::days(*age))
                .await
                .unwrap();
        }
        store
    }

    struct AllDead;

    #[async_trait]
    impl LinkProbe for AllDead {
        async fn is_dead(&self, _url: &str) -> bool {
            true
        }
    }

    /// Serves a snapshot of records taken before a concurrent upsert.
    struct LaggingStore {
        inner: Arc<MemoryJobStore>,
        snapshot: Vec<JobRecord>,
    }

    #[async_trait]
    impl JobStore for LaggingStore {
        async fn upsert(
            &self,
            source: &str,
            listings: &[RawListing],
            seen_at: DateTime<Utc>,
        ) -> Result<usize, StoreError> {
            self.inner.upsert(source, listings, seen_at).await
        }

        async fn records(&self) -> Result<Vec<JobRecord>, StoreError> {
            Ok(self.snapshot.clone())
        }

        async fn apply(&self, transitions: &[Transition]) -> Result<usize, StoreError> {
            self.inner.apply(transitions).await
        }

        async fn archived_count(&self) -> Result<usize, StoreError> {
            self.inner.archived_count().await
        }
    }

    fn record(state: RecordState, seen: DateTime<Utc>, changed: DateTime<Utc>) -> JobRecord {
        JobRecord {
            id: 1,
            source: "tavily".into(),
            external_id: "x".into(),
            title: "Rust Engineer".into(),
            url: None,
            last_seen_at: seen,
            state,
            state_changed_at: changed,
        }
    }

    #[test]
    fn test_zero_expiry_rejected() {
        assert!(RetentionPolicy::new(0).is_err());
        assert!(RetentionPolicy::with_windows(0, 1, 1).is_err());
        assert_eq!(RetentionPolicy::new(14).unwrap().expired_days(), 14);
    }

    #[test]
    fn test_windows_are_bounded() {
        assert!(RetentionPolicy::new(MAX_RETENTION_DAYS).is_ok());
        assert!(RetentionPolicy::new(MAX_RETENTION_DAYS + 1).is_err());
        assert!(RetentionPolicy::new(u32::MAX).is_err());
        assert!(RetentionPolicy::with_windows(30, u32::MAX, 90).is_err());
        assert!(RetentionPolicy::with_windows(30, 7, u32::MAX).is_err());
    }

    #[test]
    fn test_out_of_range_cutoff_is_never_due() {
        let policy = RetentionPolicy {
            expired_days: u32::MAX,
            stale_grace_days: u32::MAX,
            archive_days: u32::MAX,
        };
        let now = Utc::now();
        let ancient = now - Duration::days(100_000);
        for state in [RecordState::Active, RecordState::Stale, RecordState::SoftDeleted] {
            assert!(policy.classify(&record(state, ancient, ancient), now).is_empty());
        }

        // Near chrono's lower bound, even a short window cannot be subtracted.
        let policy = RetentionPolicy::default();
        let floor = DateTime::<Utc>::MIN_UTC;
        assert!(policy.classify(&record(RecordState::Active, floor, floor), floor).is_empty());
    }

    #[tokio::test]
    async fn test_only_expired_records_go_stale() {
        let now = Utc::now();
        let store = seeded(&[1, 29, 31, 45], now).await;
        let service = RetentionService::new(store.clone());
        let report = service.run(&RetentionPolicy::default(), now).await.unwrap();
        assert_eq!(report.stale, 2);
        assert_eq!(report.soft_deleted, 0);

        let records = store.records().await.unwrap();
        let states: Vec<RecordState> = records.iter().map(|r| r.state).collect();
        assert_eq!(
            states,
            vec![RecordState::Active, RecordState::Active, RecordState::Stale, RecordState::Stale]
        );
    }

    #[tokio::test]
    async fn test_rerun_with_same_clock_is_idempotent() {
        let now = Utc::now();
        let store = seeded(&[40, 200], now).await;
        let service = RetentionService::new(store.clone());
        let policy = RetentionPolicy::with_windows(30, 0, 0).unwrap();

        let first = service.run(&policy, now).await.unwrap();
        assert_eq!(first.changes(), 6);
        assert_eq!(store.archived_count().await.unwrap(), 2);

        let second = service.run(&policy, now).await.unwrap();
        assert_eq!(second, RetentionReport::default());
        assert_eq!(store.archived_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_full_lifecycle_over_time() {
        let start = Utc::now();
        let store = seeded(&[31], start).await;
        let service = RetentionService::new(store.clone());
        let policy = RetentionPolicy::default();

        assert_eq!(service.run(&policy, start).await.unwrap().stale, 1);
        assert_eq!(service.run(&policy, start + Duration::days(3)).await.unwrap().changes(), 0);
        assert_eq!(service.run(&policy, start + Duration::days(7)).await.unwrap().soft_deleted, 1);
        assert_eq!(service.run(&policy, start + Duration::days(60)).await.unwrap().changes(), 0);
        assert_eq!(service.run(&policy, start + Duration::days(97)).await.unwrap().archived, 1);
        assert!(store.records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_report_counts_only_applied_transitions() {
        let now = Utc::now();
        let inner = seeded(&[200], now).await;
        let id = inner.records().await.unwrap()[0].id;
        let deleted_at = now - Duration::days(100);
        inner.apply(&[Transition::MarkStale { id, at: deleted_at }]).await.unwrap();
        inner.apply(&[Transition::SoftDelete { id, at: deleted_at }]).await.unwrap();

        let snapshot = inner.records().await.unwrap();
        // Seen again after the snapshot, so the archive decision is outdated.
        inner.upsert("tavily", &[listing("job-0")], now).await.unwrap();

        let service = RetentionService::new(Arc::new(LaggingStore {
            inner: inner.clone(),
            snapshot,
        }));
        let report = service.run(&RetentionPolicy::default(), now).await.unwrap();
        assert_eq!(report.archived, 0);
        assert_eq!(report.changes(), 0);
        assert_eq!(inner.archived_count().await.unwrap(), 0);
        assert_eq!(inner.records().await.unwrap()[0].state, RecordState::Active);
    }

    #[tokio::test]
    async fn test_dead_links_are_soft_deleted_early() {
        let now = Utc::now();
        let store = seeded(&[1, 31], now).await;
        let service = RetentionService::new(store.clone()).with_link_probe(Arc::new(AllDead));
        let report = service.run(&RetentionPolicy::default(), now).await.unwrap();
        assert_eq!(report.probed, 1);
        assert_eq!(report.stale, 1);
        assert_eq!(report.soft_deleted, 1);

        let again = service.run(&RetentionPolicy::default(), now).await.unwrap();
        assert_eq!(again.changes(), 0);
        assert_eq!(again.probed, 0);
    }
}
