//! Background workers and the supervised task table that can pause them.
pub mod vectorizer;
pub mod watcher;

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Capability to pause and resume named background workers.
pub trait WorkerController: Send + Sync {
    /// Every worker name known to the controller, running or not.
    fn workers(&self) -> Vec<String>;

    fn is_running(&self, name: &str) -> bool;

    /// Asks a worker to stop at its next cancellation point. False if it is not running.
    fn signal_stop(&self, name: &str) -> bool;

    /// Stops a worker without waiting for it. False if it could not be stopped.
    fn force_stop(&self, name: &str) -> bool;

    /// Starts a stopped worker again. False if the name is unknown.
    fn resume(&self, name: &str) -> bool;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SuspendReport {
    pub stopped_gracefully: Vec<String>,
    pub force_stopped: Vec<String>,
    /// Workers that were not running when the request arrived.
    pub already_absent: Vec<String>,
    pub failed: Vec<String>,
}

impl SuspendReport {
    /// Workers this request actually stopped, and so should be resumed afterwards.
    pub fn stopped(&self) -> impl Iterator<Item = &String> {
        self.stopped_gracefully.iter().chain(&self.force_stopped)
    }

    pub fn all_stopped(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Signals every running worker, waits up to `timeout` for them to exit, then
/// force-stops whatever is still running.
pub async fn suspend_workers(controller: &dyn WorkerController, timeout: Duration) -> SuspendReport {
    let mut report = SuspendReport::default();
    let mut waiting = Vec::new();

    for name in controller.workers() {
        if controller.signal_stop(&name) {
            waiting.push(name);
        } else {
            report.already_absent.push(name);
        }
    }

    let deadline = Instant::now() + timeout;
    while !waiting.is_empty() {
        waiting.retain(|name| {
            if controller.is_running(name) {
                true
            } else {
                report.stopped_gracefully.push(name.clone());
                false
            }
        });
        if waiting.is_empty() || Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(STOP_POLL_INTERVAL).await;
    }

    for name in waiting {
        if controller.force_stop(&name) {
            warn!(worker = %name, "Worker did not stop in time; force-stopped");
            report.force_stopped.push(name);
        } else {
            warn!(worker = %name, "Failed to stop worker");
            report.failed.push(name);
        }
    }

    info!(
        graceful = report.stopped_gracefully.len(),
        forced = report.force_stopped.len(),
        absent = report.already_absent.len(),
        failed = report.failed.len(),
        "Workers suspended"
    );
    report
}

/// Starts a worker task bound to the given cancellation token.
pub type WorkerFactory = Arc<dyn Fn(CancellationToken) -> JoinHandle<()> + Send + Sync>;

struct Slot {
    factory: WorkerFactory,
    running: Option<(CancellationToken, JoinHandle<()>)>,
}

/// Table of named worker tasks. Each worker can be stopped and later respawned
/// from its factory.
#[derive(Default)]
pub struct Supervisor {
    slots: Mutex<BTreeMap<String, Slot>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, BTreeMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a worker and starts it. A worker already registered under the name
    /// is cancelled and replaced.
    pub fn spawn(&self, name: impl Into<String>, factory: WorkerFactory) {
        let name = name.into();
        let token = CancellationToken::new();
        let handle = factory(token.clone());
        let previous = self.slots().insert(
            name.clone(),
            Slot {
                factory,
                running: Some((token, handle)),
            },
        );
        if let Some((token, _)) = previous.and_then(|s| s.running) {
            token.cancel();
        }
        debug!(worker = %name, "Worker spawned");
    }

    /// Cancels every worker and waits up to `timeout` for each before aborting it.
    pub async fn shutdown(&self, timeout: Duration) {
        let running: Vec<_> = self
            .slots()
            .iter_mut()
            .filter_map(|(name, slot)| slot.running.take().map(|r| (name.clone(), r)))
            .collect();
        for (name, (token, handle)) in running {
            token.cancel();
            let abort = handle.abort_handle();
            if tokio::time::timeout(timeout, handle).await.is_err() {
                warn!(worker = %name, "Worker did not stop in time during shutdown");
                abort.abort();
            }
        }
    }
}

impl WorkerController for Supervisor {
    fn workers(&self) -> Vec<String> {
        self.slots().keys().cloned().collect()
    }

    fn is_running(&self, name: &str) -> bool {
        self.slots()
            .get(name)
            .and_then(|s| s.running.as_ref())
            .is_some_and(|(_, handle)| !handle.is_finished())
    }

    fn signal_stop(&self, name: &str) -> bool {
        match self.slots().get(name).and_then(|s| s.running.as_ref()) {
            Some((token, handle)) if !handle.is_finished() => {
                token.cancel();
                true
            }
            _ => false,
        }
    }

    fn force_stop(&self, name: &str) -> bool {
        let mut slots = self.slots();
        let Some(slot) = slots.get_mut(name) else {
            return false;
        };
        if let Some((token, handle)) = slot.running.take() {
            token.cancel();
            handle.abort();
        }
        true
    }

    fn resume(&self, name: &str) -> bool {
        let mut slots = self.slots();
        let Some(slot) = slots.get_mut(name) else {
            return false;
        };
        let alive = slot
            .running
            .as_ref()
            .is_some_and(|(token, handle)| !handle.is_finished() && !token.is_cancelled());
        if !alive {
            let token = CancellationToken::new();
            let handle = (slot.factory)(token.clone());
            slot.running = Some((token, handle));
            debug!(worker = %name, "Worker resumed");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cooperative(starts: Arc<AtomicUsize>) -> WorkerFactory {
        Arc::new(move |token: CancellationToken| {
            starts.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move { token.cancelled().await })
        })
    }

    fn stubborn() -> WorkerFactory {
        Arc::new(|_token: CancellationToken| {
            tokio::spawn(async {
                loop {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
            })
        })
    }

    #[tokio::test]
    async fn test_suspend_graceful_forced_and_absent() {
        let supervisor = Supervisor::new();
        let starts = Arc::new(AtomicUsize::new(0));
        supervisor.spawn("vectorizer", cooperative(starts.clone()));
        supervisor.spawn("watcher", stubborn());
        supervisor.spawn("finished", Arc::new(|_t: CancellationToken| tokio::spawn(async {})));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let report = suspend_workers(&supervisor, Duration::from_millis(200)).await;
        assert_eq!(report.stopped_gracefully, vec!["vectorizer".to_string()]);
        assert_eq!(report.force_stopped, vec!["watcher".to_string()]);
        assert_eq!(report.already_absent, vec!["finished".to_string()]);
        assert!(report.all_stopped());
        assert!(!supervisor.is_running("watcher"));

        assert!(supervisor.resume("vectorizer"));
        assert!(supervisor.is_running("vectorizer"));
        assert_eq!(starts.load(Ordering::SeqCst), 2);
        assert!(!supervisor.resume("unknown"));

        supervisor.shutdown(Duration::from_millis(100)).await;
        assert!(!supervisor.is_running("vectorizer"));
    }

    #[tokio::test]
    async fn test_suspend_with_no_workers() {
        let supervisor = Supervisor::new();
        let report = suspend_workers(&supervisor, Duration::from_millis(10)).await;
        assert!(report.stopped().next().is_none());
        assert!(report.already_absent.is_empty());
    }
}
