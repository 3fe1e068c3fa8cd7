//! Periodic beats that drive scheduled scrapes and cleanups.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{Instant, MissedTickBehavior};

use crate::core::orchestrator::Orchestrator;
use crate::core::registry::QueryParams;
use crate::core::task::{TriggerKind, TriggerOutcome};
use crate::core::throttle::{LevelChange, ThrottleLevel};
use crate::core::{shutdown_requested, BackgroundHandle};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum BeatOutcome {
    /// The previous cycle's task for this source is still running.
    Skipped,
    Triggered(TriggerOutcome),
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BeatEntry {
    pub source: String,
    pub outcome: BeatOutcome,
}

impl BeatEntry {
    pub fn is_admitted(&self) -> bool {
        matches!(&self.outcome, BeatOutcome::Triggered(o) if o.admission.is_admitted())
    }
}

pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    scrape_interval: Duration,
    cleanup_interval: Duration,
}

impl Scheduler {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        scrape_interval: Duration,
        cleanup_interval: Duration,
    ) -> Self {
        Self {
            orchestrator,
            scrape_interval,
            cleanup_interval,
        }
    }

    /// One scheduled scrape request per registered source, in registration
    /// order. Sources still running from the last beat are skipped.
    pub async fn scrape_beat(&self) -> Vec<BeatEntry> {
        let mut entries = Vec::new();
        for descriptor in self.orchestrator.registry().list() {
            let outcome = if self.orchestrator.is_running(&descriptor.name) {
                debug!("Skipping '{}': previous scrape still running", descriptor.name);
                BeatOutcome::Skipped
            } else {
                let name = &descriptor.name;
                match self
                    .orchestrator
                    .request_scrape(name, TriggerKind::Scheduled, QueryParams::default())
                    .await
                {
                    Ok(outcome) => BeatOutcome::Triggered(outcome),
                    Err(e) => BeatOutcome::Failed { error: e.to_string() },
                }
            };
            entries.push(BeatEntry {
                source: descriptor.name,
                outcome,
            });
        }
        entries
    }

    /// Requests a scheduled cleanup unless one is already running.
    pub async fn cleanup_beat(&self) -> Option<TriggerOutcome> {
        if self.orchestrator.cleanup_running() {
            debug!("Skipping cleanup: previous pass still running");
            return None;
        }
        match self.orchestrator.request_cleanup(TriggerKind::Scheduled, None).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!("Scheduled cleanup not queued: {}", e);
                None
            }
        }
    }

    fn is_disk_pause(&self, change: &LevelChange) -> bool {
        let floor = self.orchestrator.throttle().thresholds().disk_min_free_percent;
        change.to == ThrottleLevel::Pause && change.snapshot.disk_free_percent < floor
    }

    /// Spawns the beat loop. The first scrape beat fires immediately; the
    /// first cleanup waits one full interval.
    pub fn start(self: Arc<Self>) -> BackgroundHandle {
        let mut changes = self.orchestrator.throttle().subscribe();
        BackgroundHandle::spawn(move |mut shutdown| async move {
            let mut scrape_tick = tokio::time::interval(self.scrape_interval);
            scrape_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let first_cleanup = Instant::now() + self.cleanup_interval;
            let mut cleanup_tick = tokio::time::interval_at(first_cleanup, self.cleanup_interval);
            cleanup_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = scrape_tick.tick() => {
                        let entries = self.scrape_beat().await;
                        let triggered = entries.iter().filter(|e| e.is_admitted()).count();
                        info!("Scrape beat: {} of {} sources admitted", triggered, entries.len());
                    }
                    _ = cleanup_tick.tick() => {
                        self.cleanup_beat().await;
                    }
                    change = changes.recv() => match change {
                        Ok(change) if self.is_disk_pause(&change) => {
                            warn!(
                                "Disk free at {:.1}%, requesting emergency cleanup",
                                change.snapshot.disk_free_percent
                            );
                            self.cleanup_beat().await;
                        }
                        Ok(_) | Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => break,
                    },
                    _ = shutdown_requested(&mut shutdown) => break,
                }
            }
            debug!("Scheduler stopped");
        })
    }
}
