pub mod api;
pub mod config;
pub mod core;
pub mod error;
pub mod http;
pub mod modules;
pub mod utils;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub use crate::config::Settings;
pub use crate::core::orchestrator::{Orchestrator, OrchestratorStatus, ScrapeCounters};
pub use crate::core::registry::{
    QueryParams, RawListing, Source, SourceDescriptor, SourcePriority, SourceRegistry,
};
pub use crate::core::resources::{ResourceSampler, ResourceSnapshot, SystemProbe};
pub use crate::core::retention::{RetentionPolicy, RetentionReport, RetentionService};
pub use crate::core::scheduler::Scheduler;
pub use crate::core::store::{JobStore, MemoryJobStore};
pub use crate::core::task::{
    Admission, RejectReason, TaskId, TaskRecord, TriggerKind, TriggerOutcome,
};
pub use crate::core::throttle::{ThrottleController, ThrottleLevel};
pub use crate::core::worker::{ChannelQueue, TaskQueue, WorkerConfig, WorkerPool};
pub use crate::http::HttpClient;

/// Event pushed to real-time subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpdateEvent {
    /// A scrape finished successfully with at least one listing.
    JobsUpdated { source: String, count: usize },
}

/// Output abstraction for completed-work notifications.
/// The CLI prints them, the admin API fans them out over websockets.
pub trait UpdateSink: Send + Sync {
    fn publish(&self, event: &UpdateEvent);
}

pub type SinkRef = Arc<dyn UpdateSink>;

/// Terminal output sink for CLI usage.
pub struct ConsoleSink;

impl ConsoleSink {
    pub fn new_ref() -> SinkRef {
        Arc::new(Self)
    }
}

impl UpdateSink for ConsoleSink {
    fn publish(&self, event: &UpdateEvent) {
        use colored::*;
        use std::io::Write;
        match event {
            UpdateEvent::JobsUpdated { source, count } => {
                println!(
                    "{} {} new or refreshed listings from {}",
                    "[+]".green().bold(),
                    count.to_string().bright_yellow(),
                    source.cyan()
                );
            }
        }
        std::io::stdout().flush().ok();
    }
}

/// Re-publishes events on a broadcast channel. Having no subscribers is
/// not an error.
#[derive(Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<UpdateEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn sender(&self) -> broadcast::Sender<UpdateEvent> {
        self.tx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.tx.subscribe()
    }
}

impl UpdateSink for BroadcastSink {
    fn publish(&self, event: &UpdateEvent) {
        let _ = self.tx.send(event.clone());
    }
}

/// Delivers every event to each inner sink in order.
pub struct FanoutSink(Vec<SinkRef>);

impl FanoutSink {
    pub fn new(sinks: Vec<SinkRef>) -> Self {
        Self(sinks)
    }
}

impl UpdateSink for FanoutSink {
    fn publish(&self, event: &UpdateEvent) {
        for sink in &self.0 {
            sink.publish(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let event = UpdateEvent::JobsUpdated {
            source: "tavily".into(),
            count: 4,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            serde_json::json!({"type": "jobs_updated", "source": "tavily", "count": 4})
        );
    }

    #[tokio::test]
    async fn test_fanout_reaches_every_broadcast_subscriber() {
        let a = BroadcastSink::new(4);
        let b = BroadcastSink::new(4);
        let (mut rx_a, mut rx_b) = (a.subscribe(), b.subscribe());
        let fanout = FanoutSink::new(vec![Arc::new(a), Arc::new(b)]);

        let event = UpdateEvent::JobsUpdated {
            source: "remoteok".into(),
            count: 1,
        };
        fanout.publish(&event);
        assert_eq!(rx_a.recv().await.unwrap(), event);
        assert_eq!(rx_b.recv().await.unwrap(), event);
    }

    #[test]
    fn test_broadcast_without_subscribers_is_silent() {
        BroadcastSink::new(1).publish(&UpdateEvent::JobsUpdated {
            source: "x".into(),
            count: 1,
        });
    }
}
