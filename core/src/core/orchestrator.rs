//! Admission control for scrape and cleanup tasks.
//!
//! Every request is checked against the throttle level visible at call time.
//! Admitted scrapes reserve a per-source slot before they are handed to the
//! task queue; the slot is released when the queue reports a terminal
//! outcome. Running work is never preempted when the level escalates.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering::Relaxed};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;

use crate::core::lock;
use crate::core::registry::{QueryParams, SourceDescriptor, SourcePriority, SourceRegistry};
use crate::core::retention::MAX_RETENTION_DAYS;
use crate::core::task::{
    Admission, QueuedTask, RejectReason, TaskId, TaskKind, TaskOutcome, TaskRecord, TaskResult,
    TriggerKind, TriggerOutcome,
};
use crate::core::throttle::{ThrottleController, ThrottleLevel};
use crate::core::worker::TaskQueue;
use crate::error::TriggerError;
use crate::{SinkRef, UpdateEvent};

const DEFAULT_HISTORY_LIMIT: usize = 1024;
const DEFAULT_RETENTION_DAYS: u32 = 30;

/// Admission table for one scrape request.
///
/// `running` is the number of tasks the source already has in flight.
pub fn scrape_admission(
    level: ThrottleLevel,
    trigger: TriggerKind,
    descriptor: &SourceDescriptor,
    running: usize,
) -> Admission {
    let max = descriptor.max_concurrency;
    let priority = descriptor.priority;
    let (cap, degraded) = match (level, trigger) {
        (ThrottleLevel::Pause, _) => {
            return Admission::Rejected {
                reason: RejectReason::Paused,
            }
        }
        (ThrottleLevel::Normal, _) => (max, false),
        (ThrottleLevel::Light, TriggerKind::Scheduled) if priority == SourcePriority::Low => {
            return Admission::Rejected {
                reason: RejectReason::PriorityExcluded,
            }
        }
        (ThrottleLevel::Light, _) => ((max + 1) / 2, false),
        (ThrottleLevel::Heavy, TriggerKind::Scheduled) if priority != SourcePriority::High => {
            return Admission::Rejected {
                reason: RejectReason::PriorityExcluded,
            }
        }
        (ThrottleLevel::Heavy, TriggerKind::Scheduled) => (1, false),
        (ThrottleLevel::Heavy, TriggerKind::Manual) => (1, true),
    };

    if running >= cap {
        Admission::Rejected {
            reason: RejectReason::ConcurrencyLimit,
        }
    } else {
        Admission::Admitted {
            degraded,
            concurrency_cap: cap,
        }
    }
}

/// Terminal scrape outcomes for one source since start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScrapeCounters {
    pub succeeded: u64,
    pub failed: u64,
    /// Listings written by succeeded scrapes.
    pub listings: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrchestratorStatus {
    pub level: ThrottleLevel,
    pub running: BTreeMap<String, usize>,
    pub scrapes: BTreeMap<String, ScrapeCounters>,
    pub cleanups_running: usize,
    pub admitted_total: u64,
    pub rejected_total: u64,
}

/// Task records by id. Terminal records are kept up to `limit`, oldest
/// evicted first; pending and running ones are never evicted.
struct TaskBook {
    tasks: HashMap<TaskId, TaskRecord>,
    finished: VecDeque<TaskId>,
    limit: usize,
}

impl TaskBook {
    fn new(limit: usize) -> Self {
        Self {
            tasks: HashMap::new(),
            finished: VecDeque::new(),
            limit,
        }
    }

    fn insert(&mut self, record: TaskRecord) {
        let id = record.task_id;
        let terminal = record.outcome.is_terminal();
        self.tasks.insert(id, record);
        if terminal {
            self.retire(id);
        }
    }

    fn retire(&mut self, id: TaskId) {
        self.finished.push_back(id);
        while self.finished.len() > self.limit {
            if let Some(old) = self.finished.pop_front() {
                self.tasks.remove(&old);
            }
        }
    }

    /// Sets the terminal outcome once. Returns the task kind on success.
    fn conclude(&mut self, id: TaskId, result: &TaskResult) -> Option<TaskKind> {
        let record = self.tasks.get_mut(&id)?;
        if record.outcome.is_terminal() {
            return None;
        }
        match result {
            TaskResult::Succeeded { count } => {
                record.outcome = TaskOutcome::Succeeded;
                record.count = Some(*count);
            }
            TaskResult::Failed { error } => {
                record.outcome = TaskOutcome::Failed;
                record.error = Some(error.clone());
            }
        }
        record.finished_at = Some(Utc::now());
        let kind = record.kind.clone();
        self.retire(id);
        Some(kind)
    }
}

pub struct Orchestrator {
    throttle: Arc<ThrottleController>,
    registry: Arc<SourceRegistry>,
    queue: Arc<dyn TaskQueue>,
    sink: SinkRef,
    retention_days: u32,
    slots: Mutex<HashMap<String, usize>>,
    scrapes: Mutex<HashMap<String, ScrapeCounters>>,
    cleanups_running: AtomicUsize,
    book: Mutex<TaskBook>,
    admitted_total: AtomicU64,
    rejected_total: AtomicU64,
}

impl Orchestrator {
    pub fn new(
        throttle: Arc<ThrottleController>,
        registry: Arc<SourceRegistry>,
        queue: Arc<dyn TaskQueue>,
        sink: SinkRef,
    ) -> Self {
        Self {
            throttle,
            registry,
            queue,
            sink,
            retention_days: DEFAULT_RETENTION_DAYS,
            slots: Mutex::new(HashMap::new()),
            scrapes: Mutex::new(HashMap::new()),
            cleanups_running: AtomicUsize::new(0),
            book: Mutex::new(TaskBook::new(DEFAULT_HISTORY_LIMIT)),
            admitted_total: AtomicU64::new(0),
            rejected_total: AtomicU64::new(0),
        }
    }

    /// Expiry used by cleanups that do not name their own window.
    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    pub fn with_history_limit(self, limit: usize) -> Self {
        *lock(&self.book) = TaskBook::new(limit.max(1));
        self
    }

    pub fn throttle(&self) -> &Arc<ThrottleController> {
        &self.throttle
    }

    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }

    /// Requests a scrape of `source`. Returns as soon as the decision is
    /// made and, when admitted, the task is queued.
    ///
    /// Unknown sources fail without creating a task.
    pub async fn request_scrape(
        &self,
        source: &str,
        trigger: TriggerKind,
        query: QueryParams,
    ) -> Result<TriggerOutcome, TriggerError> {
        let descriptor = self.registry.lookup(source)?;
        let level = self.throttle.current_level();

        let admission = {
            let mut slots = lock(&self.slots);
            let running = slots.entry(descriptor.name.clone()).or_insert(0);
            let admission = scrape_admission(level, trigger, descriptor, *running);
            if admission.is_admitted() {
                *running += 1;
            }
            admission
        };

        let record = TaskRecord::new(
            TaskKind::Scrape {
                source: descriptor.name.clone(),
            },
            trigger,
            &admission,
        );
        let task_id = record.task_id;
        lock(&self.book).insert(record);
        let outcome = TriggerOutcome { task_id, admission };

        if let Admission::Rejected { reason } = admission {
            self.rejected_total.fetch_add(1, Relaxed);
            info!("Rejected {:?} scrape of '{}' at {}: {}", trigger, source, level, reason);
            return Ok(outcome);
        }
        self.admitted_total.fetch_add(1, Relaxed);
        debug!("Admitted {:?} scrape of '{}' at {} as {}", trigger, source, level, task_id);

        let queued = QueuedTask::Scrape {
            task_id,
            source: descriptor.name.clone(),
            query,
        };
        if let Err(e) = self.queue.enqueue(queued).await {
            warn!("Could not queue scrape of '{}': {}", source, e);
            self.finish(task_id, TaskResult::Failed { error: e.to_string() });
            return Err(TriggerError::Queue(e));
        }
        Ok(outcome)
    }

    /// Requests a retention pass. Admitted at every level, PAUSE included.
    /// The window must be between 1 and [`MAX_RETENTION_DAYS`].
    pub async fn request_cleanup(
        &self,
        trigger: TriggerKind,
        retention_days: Option<u32>,
    ) -> Result<TriggerOutcome, TriggerError> {
        let days = retention_days.unwrap_or(self.retention_days);
        if days == 0 || days > MAX_RETENTION_DAYS {
            return Err(TriggerError::InvalidRetentionDays);
        }

        let admission = Admission::Admitted {
            degraded: false,
            concurrency_cap: 0,
        };
        self.cleanups_running.fetch_add(1, Relaxed);
        let kind = TaskKind::Cleanup {
            retention_days: days,
        };
        let record = TaskRecord::new(kind, trigger, &admission);
        let task_id = record.task_id;
        lock(&self.book).insert(record);
        self.admitted_total.fetch_add(1, Relaxed);
        info!(
            "Admitted {:?} cleanup ({} days) at {} as {}",
            trigger,
            days,
            self.throttle.current_level(),
            task_id
        );

        if let Err(e) = self
            .queue
            .enqueue(QueuedTask::Cleanup {
                task_id,
                retention_days: days,
            })
            .await
        {
            warn!("Could not queue cleanup: {}", e);
            self.finish(task_id, TaskResult::Failed { error: e.to_string() });
            return Err(TriggerError::Queue(e));
        }
        Ok(TriggerOutcome { task_id, admission })
    }

    /// Queue acknowledgement that a task started executing.
    pub fn mark_running(&self, task_id: TaskId) -> bool {
        let mut book = lock(&self.book);
        match book.tasks.get_mut(&task_id) {
            Some(record) if record.outcome == TaskOutcome::Pending => {
                record.outcome = TaskOutcome::Running;
                true
            }
            Some(record) => {
                debug!("Task {} reported running while {:?}", task_id, record.outcome);
                false
            }
            None => {
                warn!("Running report for unknown task {}", task_id);
                false
            }
        }
    }

    /// Records the terminal outcome reported by the queue and frees the
    /// task's slot. Later reports for the same task are ignored.
    pub fn finish(&self, task_id: TaskId, result: TaskResult) -> bool {
        // The slot is freed while the record is still locked, so a reader
        // never sees a terminal task that still holds its slot.
        let kind = {
            let mut book = lock(&self.book);
            match book.conclude(task_id, &result) {
                Some(kind) => {
                    self.release(&kind);
                    kind
                }
                None => {
                    warn!("Ignoring outcome for unknown or finished task {}", task_id);
                    return false;
                }
            }
        };

        if let TaskKind::Scrape { ref source } = kind {
            let mut scrapes = lock(&self.scrapes);
            let counters = scrapes.entry(source.clone()).or_default();
            match &result {
                TaskResult::Succeeded { count } => {
                    counters.succeeded += 1;
                    counters.listings += *count as u64;
                }
                TaskResult::Failed { .. } => counters.failed += 1,
            }
        }

        match (kind, result) {
            (TaskKind::Scrape { source }, TaskResult::Succeeded { count }) if count > 0 => {
                info!("Scrape {} of '{}' stored {} listings", task_id, source, count);
                self.sink.publish(&UpdateEvent::JobsUpdated { source, count });
            }
            (TaskKind::Scrape { source }, TaskResult::Succeeded { .. }) => {
                debug!("Scrape {} of '{}' found nothing new", task_id, source)
            }
            (TaskKind::Scrape { source }, TaskResult::Failed { error }) => {
                warn!("Scrape {} of '{}' failed: {}", task_id, source, error)
            }
            (TaskKind::Cleanup { .. }, TaskResult::Succeeded { count }) => {
                debug!("Cleanup {} changed {} records", task_id, count)
            }
            (TaskKind::Cleanup { .. }, TaskResult::Failed { error }) => {
                warn!("Cleanup {} failed: {}", task_id, error)
            }
        }
        true
    }

    fn release(&self, kind: &TaskKind) {
        match kind {
            TaskKind::Scrape { source } => {
                if let Some(running) = lock(&self.slots).get_mut(source) {
                    *running = running.saturating_sub(1);
                }
            }
            TaskKind::Cleanup { .. } => {
                let _ = self
                    .cleanups_running
                    .fetch_update(Relaxed, Relaxed, |n| Some(n.saturating_sub(1)));
            }
        }
    }

    pub fn task(&self, task_id: TaskId) -> Option<TaskRecord> {
        lock(&self.book).tasks.get(&task_id).cloned()
    }

    /// True while `source` holds at least one reserved slot.
    pub fn is_running(&self, source: &str) -> bool {
        lock(&self.slots).get(source).is_some_and(|&n| n > 0)
    }

    pub fn cleanup_running(&self) -> bool {
        self.cleanups_running.load(Relaxed) > 0
    }

    pub fn status(&self) -> OrchestratorStatus {
        let running = {
            let slots = lock(&self.slots);
            self.registry
                .list()
                .into_iter()
                .map(|d| {
                    let n = slots.get(&d.name).copied().unwrap_or(0);
                    (d.name, n)
                })
                .collect()
        };
        let scrapes = {
            let counters = lock(&self.scrapes);
            self.registry
                .list()
                .into_iter()
                .map(|d| {
                    let c = counters.get(&d.name).copied().unwrap_or_default();
                    (d.name, c)
                })
                .collect()
        };
        OrchestratorStatus {
            level: self.throttle.current_level(),
            running,
            scrapes,
            cleanups_running: self.cleanups_running.load(Relaxed),
            admitted_total: self.admitted_total.load(Relaxed),
            rejected_total: self.rejected_total.load(Relaxed),
        }
    }
}
