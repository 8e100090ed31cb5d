//! Control plane API client for the agent.
//!
//! Two calls, both agent to control plane:
//! - status pushes (`POST /update_status`)
//! - per-app heartbeats (`POST /heartbeat`)

use anyhow::{Context, Result};
use hostdeck_id::{AgentId, AppId};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::app::{App, AppStatus};
use crate::config::Config;

/// Header identifying the agent on every call.
pub const AGENT_HEADER: &str = "x-hostdeck-agent";

/// Status push body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub app_id: AppId,
    pub status: AppStatus,
    pub url: String,
    pub gpus: Vec<u32>,
}

impl StatusUpdate {
    pub fn from_app(app: &App) -> Self {
        Self {
            app_id: app.id,
            status: app.status,
            url: app.url(),
            gpus: app.gpu_indices(),
        }
    }
}

/// Heartbeat body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub app_id: AppId,
}

/// Control plane API client.
pub struct ControlPlaneClient {
    client: reqwest::Client,
    base_url: String,
    agent_id: AgentId,
}

impl ControlPlaneClient {
    /// Create a client whose calls are bounded by the configured timeout.
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.call_timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.control_plane_url.clone(),
            agent_id: config.agent_id,
        })
    }

    /// Report an app's status.
    pub async fn update_status(&self, update: &StatusUpdate) -> Result<()> {
        let url = format!("{}/update_status", self.base_url);
        debug!(app_id = %update.app_id, status = %update.status, "Reporting app status");

        let response = self
            .client
            .post(&url)
            .header(AGENT_HEADER, self.agent_id.to_string())
            .json(update)
            .send()
            .await?;

        if !response.status().is_success() {
            let status_code = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status_code, body = %body, "Failed to report status");
            anyhow::bail!("Failed to report status: {} - {}", status_code, body);
        }

        Ok(())
    }

    /// Tell the control plane `app_id` is alive.
    pub async fn heartbeat(&self, app_id: AppId) -> Result<()> {
        let url = format!("{}/heartbeat", self.base_url);

        let response = self
            .client
            .post(&url)
            .header(AGENT_HEADER, self.agent_id.to_string())
            .json(&HeartbeatRequest { app_id })
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("Heartbeat failed with status: {}", response.status());
        }

        Ok(())
    }
}
