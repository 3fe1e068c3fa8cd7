//! Task queue seam and the in-process worker pool behind it.
//!
//! The orchestrator only knows [`TaskQueue`]. The bundled implementation is
//! an mpsc channel drained by [`WorkerPool`], which executes each task at
//! least once and reports the terminal outcome back to the orchestrator.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use log::{debug, error, warn};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::core::orchestrator::Orchestrator;
use crate::core::registry::QueryParams;
use crate::core::retention::{RetentionPolicy, RetentionService};
use crate::core::store::StoreRef;
use crate::core::task::{QueuedTask, TaskResult};
use crate::error::{QueueError, SourceFetchError};

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Hands an admitted task over for execution. Must not wait for the
    /// task to run.
    async fn enqueue(&self, task: QueuedTask) -> Result<(), QueueError>;
}

/// Bounded in-process queue. A full buffer refuses the task.
pub struct ChannelQueue {
    tx: mpsc::Sender<QueuedTask>,
}

impl ChannelQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<QueuedTask>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl TaskQueue for ChannelQueue {
    async fn enqueue(&self, task: QueuedTask) -> Result<(), QueueError> {
        self.tx.try_send(task).map_err(|e| match e {
            TrySendError::Full(_) => QueueError::Full,
            TrySendError::Closed(_) => QueueError::Closed,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    pub concurrency: usize,
    /// Fetch attempts per scrape, the first one included.
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_attempts: 3,
            retry_delay: Duration::from_secs(300),
        }
    }
}

pub struct WorkerPool {
    orchestrator: Arc<Orchestrator>,
    store: StoreRef,
    retention: Arc<RetentionService>,
    policy: RetentionPolicy,
    config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        store: StoreRef,
        retention: Arc<RetentionService>,
        policy: RetentionPolicy,
        config: WorkerConfig,
    ) -> Self {
        Self {
            orchestrator,
            store,
            retention,
            policy,
            config,
        }
    }

    /// Drains `rx` until every sender is gone, running at most
    /// `concurrency` tasks at a time, then waits for the stragglers.
    pub async fn run(self, mut rx: mpsc::Receiver<QueuedTask>) {
        let pool = Arc::new(self);
        let semaphore = Arc::new(Semaphore::new(pool.config.concurrency.max(1)));
        let mut running = JoinSet::new();

        while let Some(task) = rx.recv().await {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let pool = Arc::clone(&pool);
            running.spawn(async move {
                let _permit = permit;
                pool.execute(task).await;
            });
            while let Some(joined) = running.try_join_next() {
                log_join_error(joined);
            }
        }

        while let Some(joined) = running.join_next().await {
            log_join_error(joined);
        }
        debug!("Worker pool drained");
    }

    /// Runs one task and always reports a terminal outcome, even when the
    /// source or the store panics.
    pub async fn execute(&self, task: QueuedTask) {
        let task_id = task.task_id();
        self.orchestrator.mark_running(task_id);
        let result = AssertUnwindSafe(self.dispatch(task))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                let reason = panic_message(&*payload);
                error!("Task {} panicked: {}", task_id, reason);
                TaskResult::Failed {
                    error: format!("worker panicked: {}", reason),
                }
            });
        self.orchestrator.finish(task_id, result);
    }

    async fn dispatch(&self, task: QueuedTask) -> TaskResult {
        match task {
            QueuedTask::Scrape { source, query, .. } => self.scrape(&source, &query).await,
            QueuedTask::Cleanup { retention_days, .. } => self.cleanup(retention_days).await,
        }
    }

    async fn scrape(&self, name: &str, query: &QueryParams) -> TaskResult {
        let source = match self.orchestrator.registry().get(name) {
            Ok(source) => source,
            Err(e) => return TaskResult::Failed { error: e.to_string() },
        };

        let mut attempt = 1;
        let listings = loop {
            match source.fetch(query).await {
                Ok(listings) => break listings,
                Err(e) if attempt < self.config.max_attempts && retryable(&e) => {
                    warn!(
                        "Fetch from '{}' failed (attempt {}/{}): {}",
                        name, attempt, self.config.max_attempts, e
                    );
                    attempt += 1;
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(e) => return TaskResult::Failed { error: e.to_string() },
            }
        };

        match self.store.upsert(name, &listings, Utc::now()).await {
            Ok(count) => TaskResult::Succeeded { count },
            Err(e) => TaskResult::Failed { error: e.to_string() },
        }
    }

    async fn cleanup(&self, retention_days: u32) -> TaskResult {
        let policy = match self.policy.with_expired_days(retention_days) {
            Ok(policy) => policy,
            Err(e) => return TaskResult::Failed { error: e.to_string() },
        };
        match self.retention.run(&policy, Utc::now()).await {
            Ok(report) => TaskResult::Succeeded {
                count: report.changes(),
            },
            Err(e) => TaskResult::Failed { error: e.to_string() },
        }
    }
}

fn retryable(err: &SourceFetchError) -> bool {
    !matches!(err, SourceFetchError::NotConfigured { .. })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn log_join_error(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!("Worker task ended abnormally: {}", e);
    }
}
