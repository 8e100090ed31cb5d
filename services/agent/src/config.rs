//! Configuration for the agent.
//!
//! Everything is read once at startup from `HOSTDECK_*` environment
//! variables. Unparseable values are errors rather than silent defaults.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use hostdeck_id::AgentId;

/// GPU query used when `HOSTDECK_GPU_QUERY_CMD` is unset.
pub const DEFAULT_GPU_QUERY_CMD: &str =
    "nvidia-smi --query-gpu=index,memory.total,memory.free --format=csv,noheader,nounits";

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identity used when talking to the control plane.
    pub agent_id: AgentId,

    /// Address the agent API listens on.
    pub listen_addr: SocketAddr,

    /// Control plane base URL (status pushes, heartbeats).
    pub control_plane_url: String,

    /// Per-call timeout for control plane requests.
    pub call_timeout: Duration,

    /// Ordered candidate ports for apps.
    pub candidate_ports: Vec<u16>,

    /// Root for the state DB, logs, routes file and generated proxy config.
    pub data_dir: PathBuf,

    /// Port of the generated proxy `server` block.
    pub proxy_listen_port: u16,

    /// Where the generated config is linked so the proxy loads it.
    pub proxy_link_path: PathBuf,

    /// Command that makes the proxy re-read its configuration.
    pub proxy_reload_cmd: Vec<String>,

    /// Command printing `index, total, free` per GPU.
    pub gpu_query_cmd: Vec<String>,

    /// Background GPU snapshot refresh interval.
    pub gpu_refresh_interval: Duration,

    /// Supervisor polling interval.
    pub supervise_interval: Duration,

    /// Grace period between graceful and forced termination.
    pub stop_grace: Duration,

    /// Upper bound on a stop before the app is force-marked stopped.
    pub stop_timeout: Duration,

    /// Per-app heartbeat interval.
    pub heartbeat_interval: Duration,

    /// Interpreter used for script apps.
    pub python: String,

    /// Container CLI.
    pub docker: String,

    /// Variable carrying the host port into compose files.
    pub compose_port_var: String,

    /// Container port used when neither the request nor the build file says.
    pub default_container_port: u16,

    /// Optional credential for gated model downloads.
    pub hf_token: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let agent_id = match get("HOSTDECK_AGENT_ID") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("invalid HOSTDECK_AGENT_ID: {raw}"))?,
            None => AgentId::new(),
        };

        let listen_addr = parse_or(&get, "HOSTDECK_LISTEN_ADDR", "0.0.0.0:8001".parse()?)?;

        let control_plane_url = get("HOSTDECK_CONTROL_PLANE_URL")
            .unwrap_or_else(|| "http://localhost:8000".to_string())
            .trim_end_matches('/')
            .to_string();

        let call_timeout = Duration::from_millis(parse_or(&get, "HOSTDECK_CALL_TIMEOUT_MS", 5000)?);

        let candidate_ports = match get("HOSTDECK_PORTS") {
            Some(list) => parse_port_list(&list)?,
            None => {
                let start: u16 = parse_or(&get, "HOSTDECK_PORT_START", 9000)?;
                let end: u16 = parse_or(&get, "HOSTDECK_PORT_END", 9100)?;
                if start >= end {
                    bail!("HOSTDECK_PORT_START ({start}) must be below HOSTDECK_PORT_END ({end})");
                }
                (start..end).collect()
            }
        };

        let data_dir = PathBuf::from(
            get("HOSTDECK_DATA_DIR").unwrap_or_else(|| "/var/lib/hostdeck".to_string()),
        );

        let proxy_link_path = PathBuf::from(
            get("HOSTDECK_PROXY_LINK_PATH")
                .unwrap_or_else(|| "/etc/nginx/conf.d/hostdeck-apps.conf".to_string()),
        );

        let proxy_reload_cmd = split_command(
            &get("HOSTDECK_PROXY_RELOAD_CMD").unwrap_or_else(|| "nginx -s reload".to_string()),
            "HOSTDECK_PROXY_RELOAD_CMD",
        )?;

        let gpu_query_cmd = split_command(
            &get("HOSTDECK_GPU_QUERY_CMD").unwrap_or_else(|| DEFAULT_GPU_QUERY_CMD.to_string()),
            "HOSTDECK_GPU_QUERY_CMD",
        )?;

        Ok(Self {
            agent_id,
            listen_addr,
            control_plane_url,
            call_timeout,
            candidate_ports,
            data_dir,
            proxy_listen_port: parse_or(&get, "HOSTDECK_PROXY_LISTEN_PORT", 8080)?,
            proxy_link_path,
            proxy_reload_cmd,
            gpu_query_cmd,
            gpu_refresh_interval: Duration::from_secs(parse_or(
                &get,
                "HOSTDECK_GPU_REFRESH_SECS",
                15,
            )?),
            supervise_interval: Duration::from_millis(parse_or(
                &get,
                "HOSTDECK_SUPERVISE_INTERVAL_MS",
                2000,
            )?),
            stop_grace: Duration::from_secs(parse_or(&get, "HOSTDECK_STOP_GRACE_SECS", 10)?),
            stop_timeout: Duration::from_secs(parse_or(&get, "HOSTDECK_STOP_TIMEOUT_SECS", 30)?),
            heartbeat_interval: Duration::from_secs(parse_or(&get, "HOSTDECK_HEARTBEAT_SECS", 20)?),
            python: get("HOSTDECK_PYTHON").unwrap_or_else(|| "python3".to_string()),
            docker: get("HOSTDECK_DOCKER").unwrap_or_else(|| "docker".to_string()),
            compose_port_var: get("HOSTDECK_COMPOSE_PORT_VAR")
                .unwrap_or_else(|| "APP_PORT".to_string()),
            default_container_port: parse_or(&get, "HOSTDECK_DEFAULT_CONTAINER_PORT", 7860)?,
            hf_token: get("HF_TOKEN"),
            log_level: get("HOSTDECK_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    /// SQLite file holding app records.
    pub fn state_db_path(&self) -> PathBuf {
        self.data_dir.join("agent.db")
    }

    /// Directory holding one log file per app.
    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Persisted route table.
    pub fn routes_path(&self) -> PathBuf {
        self.data_dir.join("routes.json")
    }

    /// Generated proxy configuration.
    pub fn proxy_config_path(&self) -> PathBuf {
        self.data_dir.join("apps.conf")
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key}={raw}: {e}")),
        None => Ok(default),
    }
}

fn parse_port_list(raw: &str) -> Result<Vec<u16>> {
    let mut ports = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let port: u16 = part
            .parse()
            .with_context(|| format!("invalid port in HOSTDECK_PORTS: {part}"))?;
        if port == 0 {
            bail!("port 0 is not a valid candidate");
        }
        if !ports.contains(&port) {
            ports.push(port);
        }
    }
    if ports.is_empty() {
        bail!("HOSTDECK_PORTS is set but lists no ports");
    }
    Ok(ports)
}

fn split_command(raw: &str, key: &str) -> Result<Vec<String>> {
    let parts: Vec<String> = raw.split_whitespace().map(str::to_string).collect();
    if parts.is_empty() {
        bail!("{key} must name a program");
    }
    Ok(parts)
}
