//! Status reporter.
//!
//! Pushes lifecycle transitions to the control plane without ever blocking a
//! transition: updates go onto an unbounded queue and a background worker
//! delivers them in order with retry and backoff. Exhausted retries are
//! logged and dropped; local state stays authoritative.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::app::App;
use crate::backoff::BackoffPolicy;
use crate::client::{ControlPlaneClient, StatusUpdate};

/// Delivery attempts per update.
pub const MAX_ATTEMPTS: u32 = 5;

/// Handle for queueing status pushes.
#[derive(Clone)]
pub struct StatusReporter {
    tx: Option<mpsc::UnboundedSender<StatusUpdate>>,
}

impl StatusReporter {
    /// Start the delivery worker. It exits once every reporter clone is
    /// dropped and the queue is drained.
    pub fn spawn(client: Arc<ControlPlaneClient>, backoff: BackoffPolicy) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(client, backoff, rx));
        (Self { tx: Some(tx) }, worker)
    }

    /// Reporter that discards everything.
    pub fn noop() -> Self {
        Self { tx: None }
    }

    /// Queue the app's current status.
    pub fn report(&self, app: &App) {
        let Some(tx) = &self.tx else {
            return;
        };
        if tx.send(StatusUpdate::from_app(app)).is_err() {
            warn!(app_id = %app.id, "Status worker gone, dropping update");
        }
    }
}

async fn run_worker(
    client: Arc<ControlPlaneClient>,
    backoff: BackoffPolicy,
    mut rx: mpsc::UnboundedReceiver<StatusUpdate>,
) {
    info!("Status reporter started");

    while let Some(update) = rx.recv().await {
        deliver(&client, &backoff, &update).await;
    }

    info!("Status reporter stopped");
}

async fn deliver(client: &ControlPlaneClient, backoff: &BackoffPolicy, update: &StatusUpdate) {
    for attempt in 0..MAX_ATTEMPTS {
        match client.update_status(update).await {
            Ok(()) => {
                debug!(app_id = %update.app_id, status = %update.status, attempt, "Status delivered");
                return;
            }
            Err(e) if attempt + 1 < MAX_ATTEMPTS => {
                let delay = backoff.delay(attempt);
                debug!(
                    app_id = %update.app_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Status push failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                warn!(
                    app_id = %update.app_id,
                    status = %update.status,
                    attempts = MAX_ATTEMPTS,
                    error = %e,
                    "Dropping status update after repeated failures"
                );
            }
        }
    }
}
