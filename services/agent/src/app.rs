//! App model: variants, lifecycle states and access policy.

use std::net::IpAddr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use hostdeck_id::AppId;
use serde::{Deserialize, Serialize};

use crate::resources::GpuShare;
use crate::runtime::{Artifact, RuntimeHandle};

// =============================================================================
// Variant
// =============================================================================

/// Deployment kind of an app, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    /// Single interpreted script.
    #[serde(alias = "gradio")]
    Script,
    /// Image built from a build description.
    #[serde(alias = "docker")]
    Image,
    /// Multi-service compose definition.
    #[serde(alias = "docker_compose")]
    Compose,
    /// Saved container archive.
    #[serde(alias = "docker_tar")]
    Archive,
}

impl Variant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Script => "script",
            Self::Image => "image",
            Self::Compose => "compose",
            Self::Archive => "archive",
        }
    }
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Status
// =============================================================================

/// App lifecycle state.
///
/// ```text
/// deploying -> starting -> running -> stopping -> stopped
///     |           |           |           |
///     +-----------+-----------+-----------+----> error
///
/// stopped | error -> starting   (restart)
/// ```
///
/// A deploy with nothing to build is created directly in `starting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppStatus {
    Deploying,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl AppStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deploying => "deploying",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "deploying" => Some(Self::Deploying),
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "stopping" => Some(Self::Stopping),
            "stopped" => Some(Self::Stopped),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Stopped and error are terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: AppStatus) -> bool {
        use AppStatus::*;

        if next == Error {
            return !self.is_terminal();
        }

        matches!(
            (self, next),
            (Deploying, Starting)
                | (Starting, Running)
                | (Running, Stopping)
                | (Running, Stopped)
                | (Stopping, Stopped)
                | (Stopped, Starting)
                | (Error, Starting)
        )
    }
}

impl std::fmt::Display for AppStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Access policy
// =============================================================================

/// Optional per-app access restrictions, immutable after creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPolicy {
    /// Addresses or CIDR networks allowed to reach the app. Empty = anyone.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow_ips: Vec<String>,

    /// Required bearer value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_header: Option<String>,
}

impl AccessPolicy {
    /// Validate every entry so it can be embedded in generated configuration
    /// verbatim.
    pub fn validate(&self) -> Result<(), String> {
        for entry in &self.allow_ips {
            validate_network(entry)?;
        }

        if let Some(token) = &self.auth_header {
            if token.is_empty() {
                return Err("auth_header must not be empty".to_string());
            }
            if token
                .chars()
                .any(|c| c.is_whitespace() || c.is_control() || "\"'\\;{}$".contains(c))
            {
                return Err("auth_header contains characters that cannot be matched".to_string());
            }
        }

        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.allow_ips.is_empty() && self.auth_header.is_none()
    }
}

fn validate_network(entry: &str) -> Result<(), String> {
    let (addr, prefix) = match entry.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (entry, None),
    };

    let ip: IpAddr = addr
        .parse()
        .map_err(|_| format!("invalid address in allow_ips: {entry}"))?;

    if let Some(prefix) = prefix {
        let max = if ip.is_ipv4() { 32 } else { 128 };
        match prefix.parse::<u8>() {
            Ok(bits) if bits <= max => {}
            _ => return Err(format!("invalid prefix length in allow_ips: {entry}")),
        }
    }

    Ok(())
}

// =============================================================================
// App
// =============================================================================

/// One deployed workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct App {
    pub id: AppId,
    pub variant: Variant,
    pub status: AppStatus,

    /// Uploaded bundle (directory, or file for archives).
    pub source: PathBuf,

    /// Assigned while the status holds resources.
    pub port: Option<u16>,

    /// Port of the last successful allocation, preferred on restart.
    #[serde(default)]
    pub last_port: Option<u16>,

    /// GPU shares assigned while the status holds resources.
    #[serde(default)]
    pub gpus: Vec<GpuShare>,

    pub vram_required_mb: u64,

    #[serde(default)]
    pub access: AccessPolicy,

    /// Container-side port for image and archive apps.
    #[serde(default)]
    pub container_port: Option<u16>,

    /// Entry script override for script apps.
    #[serde(default)]
    pub entrypoint: Option<String>,

    /// Retained build output, reused by restart.
    #[serde(default)]
    pub artifact: Option<Artifact>,

    /// Present while a runtime is believed alive.
    #[serde(default)]
    pub handle: Option<RuntimeHandle>,

    /// Last failure, cleared on the next start.
    #[serde(default)]
    pub error: Option<String>,

    /// Bumped on every start so stale supervisors can recognise themselves.
    #[serde(default)]
    pub generation: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl App {
    /// Public path of the app behind the proxy.
    pub fn url(&self) -> String {
        format!("/apps/{}/", self.id)
    }

    pub fn gpu_indices(&self) -> Vec<u32> {
        self.gpus.iter().map(|s| s.index).collect()
    }

    /// Move to `next`, returning false (and leaving the app untouched) if the
    /// transition is not allowed.
    pub fn transition(&mut self, next: AppStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.updated_at = Utc::now();
        true
    }
}
