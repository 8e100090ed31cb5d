//! Heartbeat loop for reporting running apps to the control plane.
//!
//! Every interval the agent posts one heartbeat per `running` app. A failed
//! heartbeat never changes local state; it is only logged, louder once
//! failures persist.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::client::ControlPlaneClient;
use crate::manager::AppManager;

/// Failed rounds in a row before failures are logged as errors.
const ESCALATE_AFTER: u32 = 3;

/// Run the heartbeat loop until shutdown.
pub async fn run_heartbeat_loop(
    client: Arc<ControlPlaneClient>,
    manager: Arc<AppManager>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "Starting heartbeat loop");

    let mut consecutive_failures = 0u32;
    let mut interval_timer = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = interval_timer.tick() => {
                let running = manager.running_apps().await;
                let failed = beat(&client, &running).await;

                if failed == 0 {
                    consecutive_failures = 0;
                    debug!(apps = running.len(), "Heartbeats sent");
                    continue;
                }

                consecutive_failures += 1;
                if consecutive_failures <= ESCALATE_AFTER {
                    warn!(failed, apps = running.len(), consecutive_failures, "Heartbeat failed");
                } else {
                    error!(failed, apps = running.len(), consecutive_failures, "Heartbeat failed repeatedly");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Heartbeat loop shutting down");
                    break;
                }
            }
        }
    }
}

/// Send one heartbeat per app. Returns how many failed.
async fn beat(client: &ControlPlaneClient, apps: &[hostdeck_id::AppId]) -> usize {
    let mut failed = 0;
    for app_id in apps {
        if let Err(e) = client.heartbeat(*app_id).await {
            debug!(app_id = %app_id, error = %e, "Heartbeat not accepted");
            failed += 1;
        }
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use hostdeck_id::AppId;
    use std::collections::HashMap;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(url: &str) -> ControlPlaneClient {
        let vars = HashMap::from([("HOSTDECK_CONTROL_PLANE_URL".to_string(), url.to_string())]);
        let config = Config::from_lookup(|key| vars.get(key).cloned()).unwrap();
        ControlPlaneClient::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_beat_posts_once_per_app() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/heartbeat"))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&server)
            .await;

        let failed = beat(&client(&server.uri()), &[AppId::new(), AppId::new()]).await;
        assert_eq!(failed, 0);
    }

    #[tokio::test]
    async fn test_beat_counts_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/heartbeat"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let failed = beat(&client(&server.uri()), &[AppId::new()]).await;
        assert_eq!(failed, 1);
    }
}
