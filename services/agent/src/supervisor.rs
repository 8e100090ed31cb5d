//! Per-app supervision.
//!
//! One monitoring task per running app polls the runtime handle. When the
//! workload is gone the task hands the exit to the manager and ends. Stop
//! and delete cancel the task through its watch channel instead of waiting
//! for the loop to notice.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use hostdeck_id::AppId;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::manager::AppManager;
use crate::runtime::{Liveness, Runtime, RuntimeHandle};

/// Liveness errors in a row before they are logged as persistent.
const FAILURE_WARN_THRESHOLD: u32 = 3;

struct SupervisorEntry {
    generation: u64,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Registry of monitoring tasks, at most one per app.
#[derive(Default)]
pub struct SupervisorSet {
    tasks: Mutex<HashMap<AppId, SupervisorEntry>>,
}

impl SupervisorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start monitoring `handle` for `app_id`, replacing any existing task.
    pub(crate) fn spawn(
        &self,
        manager: Weak<AppManager>,
        runtime: Arc<dyn Runtime>,
        app_id: AppId,
        generation: u64,
        handle: RuntimeHandle,
        interval: Duration,
    ) {
        let (cancel, cancelled) = watch::channel(false);
        let task = tokio::spawn(supervise(
            manager, runtime, app_id, generation, handle, interval, cancelled,
        ));

        let Ok(mut tasks) = self.tasks.lock() else {
            warn!(app_id = %app_id, "Supervisor registry poisoned, task left unregistered");
            return;
        };
        if let Some(previous) = tasks.insert(
            app_id,
            SupervisorEntry {
                generation,
                cancel,
                task,
            },
        ) {
            let _ = previous.cancel.send(true);
            debug!(app_id = %app_id, generation = previous.generation, "Replaced supervisor");
        }
    }

    /// Signal the task for `app_id` to stop. Does not wait for it.
    pub fn cancel(&self, app_id: AppId) -> bool {
        let entry = self.tasks.lock().ok().and_then(|mut t| t.remove(&app_id));
        match entry {
            Some(entry) => {
                let _ = entry.cancel.send(true);
                true
            }
            None => false,
        }
    }

    /// Drop the registration of a task that ended by itself.
    pub(crate) fn finish(&self, app_id: AppId, generation: u64) {
        if let Ok(mut tasks) = self.tasks.lock() {
            if tasks.get(&app_id).is_some_and(|e| e.generation == generation) {
                tasks.remove(&app_id);
            }
        }
    }

    /// Whether a live task monitors `app_id`.
    pub fn is_supervised(&self, app_id: AppId) -> bool {
        self.tasks
            .lock()
            .map(|t| t.get(&app_id).is_some_and(|e| !e.task.is_finished()))
            .unwrap_or(false)
    }

    /// Generation watched by the task for `app_id`.
    pub fn generation(&self, app_id: AppId) -> Option<u64> {
        self.tasks
            .lock()
            .ok()
            .and_then(|t| t.get(&app_id).map(|e| e.generation))
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel every task (agent shutdown). Workloads keep running.
    pub fn cancel_all(&self) {
        let drained: Vec<SupervisorEntry> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain().map(|(_, e)| e).collect(),
            Err(_) => return,
        };
        for entry in drained {
            let _ = entry.cancel.send(true);
        }
    }
}

/// Poll `handle` until it dies or the task is cancelled.
async fn supervise(
    manager: Weak<AppManager>,
    runtime: Arc<dyn Runtime>,
    app_id: AppId,
    generation: u64,
    handle: RuntimeHandle,
    interval: Duration,
    mut cancelled: watch::Receiver<bool>,
) {
    debug!(app_id = %app_id, handle = %handle, generation, "Supervisor started");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick completes immediately.
    ticker.tick().await;

    let mut consecutive_failures = 0u32;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match runtime.liveness(&handle).await {
                    Ok(Liveness::Running) => {
                        consecutive_failures = 0;
                    }
                    Ok(liveness) => {
                        info!(app_id = %app_id, handle = %handle, ?liveness, "Workload terminated");
                        if let Some(manager) = manager.upgrade() {
                            manager.on_runtime_exit(app_id, generation, liveness).await;
                        }
                        break;
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        if consecutive_failures < FAILURE_WARN_THRESHOLD {
                            debug!(app_id = %app_id, error = %e, consecutive_failures, "Liveness check failed");
                        } else {
                            warn!(app_id = %app_id, error = %e, consecutive_failures, "Liveness check failing repeatedly");
                        }
                    }
                }
            }
            changed = cancelled.changed() => {
                if changed.is_err() || *cancelled.borrow() {
                    debug!(app_id = %app_id, generation, "Supervisor cancelled");
                    break;
                }
            }
        }
    }
}
