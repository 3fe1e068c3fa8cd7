pub mod orchestrator;
pub mod registry;
pub mod resources;
pub mod retention;
pub mod scheduler;
pub mod store;
pub mod task;
pub mod throttle;
pub mod worker;

use std::future::Future;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Lifecycle handle for a repeating background loop.
///
/// The loop receives a shutdown signal through a watch channel; `stop`
/// flips it and waits for the loop to drain its current iteration.
pub struct BackgroundHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl BackgroundHandle {
    pub(crate) fn spawn<F, Fut>(body: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, rx) = watch::channel(false);
        let join = tokio::spawn(body(rx));
        Self { shutdown, join }
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.join.await;
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Resolves once the shutdown flag is raised or its sender is gone.
pub(crate) async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Locks a short critical section, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
