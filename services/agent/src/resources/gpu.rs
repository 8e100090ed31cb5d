//! GPU memory accounting.
//!
//! Free memory is re-queried on every allocation attempt. Reservations made
//! for apps that have not yet touched their GPU are subtracted from the
//! device total, so the effective free figure for a GPU is
//! `min(observed_free, total - reserved)`.

use std::collections::BTreeMap;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hostdeck_id::AppId;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use super::AllocError;

/// One GPU as reported by the query command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub index: u32,
    pub total_mb: u64,
    pub free_mb: u64,
}

/// Memory reserved for an app on one GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuShare {
    pub index: u32,
    pub reserved_mb: u64,
}

/// GPU state as exposed by the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GpuView {
    pub index: u32,
    pub total_mb: u64,
    pub free_mb: u64,
    pub reserved_mb: u64,
    pub apps: Vec<AppId>,
}

/// Snapshot of the last successful query.
#[derive(Debug, Clone, Serialize)]
pub struct GpuSnapshot {
    pub gpus: Vec<GpuView>,
    pub refreshed_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Probes
// =============================================================================

/// Read-only source of per-device memory figures.
#[async_trait]
pub trait GpuProbe: Send + Sync {
    async fn query(&self) -> Result<Vec<GpuInfo>>;
}

/// Probe running an `nvidia-smi`-style command that prints
/// `index, total, free` per line in MiB.
pub struct CommandGpuProbe {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandGpuProbe {
    pub fn new(command: &[String]) -> Result<Self> {
        let Some((program, args)) = command.split_first() else {
            bail!("GPU query command is empty");
        };
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout: Duration::from_secs(10),
        })
    }
}

#[async_trait]
impl GpuProbe for CommandGpuProbe {
    async fn query(&self) -> Result<Vec<GpuInfo>> {
        let output = tokio::time::timeout(
            self.timeout,
            tokio::process::Command::new(&self.program)
                .args(&self.args)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .with_context(|| format!("{} timed out", self.program))?
        .with_context(|| format!("failed to run {}", self.program))?;

        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        parse_query_output(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse `index, total, free` lines. Blank lines are skipped.
pub fn parse_query_output(text: &str) -> Result<Vec<GpuInfo>> {
    let mut gpus = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < 3 {
            bail!("unexpected GPU query line: {line}");
        }
        gpus.push(GpuInfo {
            index: fields[0]
                .parse()
                .with_context(|| format!("bad GPU index in: {line}"))?,
            total_mb: fields[1]
                .parse()
                .with_context(|| format!("bad total memory in: {line}"))?,
            free_mb: fields[2]
                .parse()
                .with_context(|| format!("bad free memory in: {line}"))?,
        });
    }
    gpus.sort_by_key(|g| g.index);
    Ok(gpus)
}

/// Probe returning figures set by the caller.
#[derive(Default)]
pub struct StaticGpuProbe {
    gpus: StdMutex<Vec<GpuInfo>>,
    failing: StdMutex<bool>,
}

impl StaticGpuProbe {
    pub fn new(gpus: Vec<GpuInfo>) -> Self {
        Self {
            gpus: StdMutex::new(gpus),
            failing: StdMutex::new(false),
        }
    }

    /// Convenience for `(index, free)` pairs with total equal to free.
    pub fn with_free(free: &[(u32, u64)]) -> Self {
        Self::new(
            free.iter()
                .map(|(index, mb)| GpuInfo {
                    index: *index,
                    total_mb: *mb,
                    free_mb: *mb,
                })
                .collect(),
        )
    }

    pub fn set(&self, gpus: Vec<GpuInfo>) {
        if let Ok(mut current) = self.gpus.lock() {
            *current = gpus;
        }
    }

    pub fn set_failing(&self, failing: bool) {
        if let Ok(mut f) = self.failing.lock() {
            *f = failing;
        }
    }
}

#[async_trait]
impl GpuProbe for StaticGpuProbe {
    async fn query(&self) -> Result<Vec<GpuInfo>> {
        if self.failing.lock().map(|f| *f).unwrap_or(true) {
            bail!("GPU query unavailable");
        }
        Ok(self.gpus.lock().map(|g| g.clone()).unwrap_or_default())
    }
}

// =============================================================================
// Selection
// =============================================================================

/// Choose GPUs for `required_mb` given `(index, effective_free)` pairs.
///
/// A single GPU that fits is preferred, scanning in ascending index order.
/// Otherwise GPUs are taken greedily by descending free memory, ties broken
/// by ascending index, until the requirement is met. Returns `None` if all
/// GPUs together cannot satisfy it.
pub fn select_gpus(available: &[(u32, u64)], required_mb: u64) -> Option<Vec<GpuShare>> {
    if required_mb == 0 {
        return Some(Vec::new());
    }

    let mut by_index: Vec<(u32, u64)> = available.to_vec();
    by_index.sort_by_key(|(index, _)| *index);

    if let Some((index, _)) = by_index.iter().find(|(_, free)| *free >= required_mb) {
        return Some(vec![GpuShare {
            index: *index,
            reserved_mb: required_mb,
        }]);
    }

    let mut by_free = by_index;
    by_free.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    let mut remaining = required_mb;
    let mut shares = Vec::new();
    for (index, free) in by_free {
        if remaining == 0 {
            break;
        }
        if free == 0 {
            continue;
        }
        let take = free.min(remaining);
        shares.push(GpuShare {
            index,
            reserved_mb: take,
        });
        remaining -= take;
    }

    (remaining == 0).then_some(shares)
}

// =============================================================================
// Pool
// =============================================================================

#[derive(Default)]
struct GpuState {
    snapshot: Vec<GpuInfo>,
    refreshed_at: Option<DateTime<Utc>>,
    reservations: BTreeMap<AppId, Vec<GpuShare>>,
}

impl GpuState {
    fn reserved_on(&self, index: u32) -> u64 {
        self.reservations
            .values()
            .flatten()
            .filter(|s| s.index == index)
            .map(|s| s.reserved_mb)
            .sum()
    }

    fn effective_free(&self) -> Vec<(u32, u64)> {
        self.snapshot
            .iter()
            .map(|g| {
                let headroom = g.total_mb.saturating_sub(self.reserved_on(g.index));
                (g.index, g.free_mb.min(headroom))
            })
            .collect()
    }
}

/// GPU free-memory view and per-app reservations.
///
/// The lock is held across the fresh query so two allocations can never
/// decide on the same stale figures.
pub struct GpuPool {
    probe: Arc<dyn GpuProbe>,
    state: Mutex<GpuState>,
}

impl GpuPool {
    pub fn new(probe: Arc<dyn GpuProbe>) -> Self {
        Self {
            probe,
            state: Mutex::new(GpuState::default()),
        }
    }

    /// Reserve `required_mb` across one or more GPUs for `app`.
    pub async fn allocate(&self, app: AppId, required_mb: u64) -> Result<Vec<GpuShare>, AllocError> {
        if required_mb == 0 {
            return Ok(Vec::new());
        }

        let mut state = self.state.lock().await;

        match self.probe.query().await {
            Ok(gpus) => {
                state.snapshot = gpus;
                state.refreshed_at = Some(Utc::now());
            }
            Err(e) if state.refreshed_at.is_some() => {
                warn!(error = %e, "GPU query failed, using last snapshot");
            }
            Err(e) => {
                warn!(error = %e, "GPU query failed and no snapshot is available");
                return Err(AllocError::InsufficientCapacity {
                    required_mb,
                    available_mb: 0,
                });
            }
        }

        // A retry for the same app replaces its earlier reservation.
        state.reservations.remove(&app);

        let available = state.effective_free();
        let Some(shares) = select_gpus(&available, required_mb) else {
            let available_mb = available.iter().map(|(_, free)| free).sum();
            return Err(AllocError::InsufficientCapacity {
                required_mb,
                available_mb,
            });
        };

        debug!(app_id = %app, required_mb, shares = ?shares, "GPU memory reserved");
        state.reservations.insert(app, shares.clone());
        Ok(shares)
    }

    /// Re-register shares for an app adopted during recovery.
    pub async fn restore(&self, app: AppId, shares: Vec<GpuShare>) {
        let mut state = self.state.lock().await;
        if shares.is_empty() {
            state.reservations.remove(&app);
        } else {
            state.reservations.insert(app, shares);
        }
    }

    /// Drop all shares held by `app`. Idempotent.
    pub async fn release(&self, app: AppId) {
        let mut state = self.state.lock().await;
        if state.reservations.remove(&app).is_some() {
            debug!(app_id = %app, "GPU memory released");
        }
    }

    /// Re-query the hardware outside of an allocation.
    pub async fn refresh(&self) -> Result<()> {
        let gpus = self.probe.query().await?;
        let mut state = self.state.lock().await;
        state.snapshot = gpus;
        state.refreshed_at = Some(Utc::now());
        Ok(())
    }

    pub async fn reservations(&self) -> BTreeMap<AppId, Vec<GpuShare>> {
        self.state.lock().await.reservations.clone()
    }

    pub async fn snapshot(&self) -> GpuSnapshot {
        let state = self.state.lock().await;
        let gpus = state
            .snapshot
            .iter()
            .map(|g| {
                let apps = state
                    .reservations
                    .iter()
                    .filter(|(_, shares)| shares.iter().any(|s| s.index == g.index))
                    .map(|(id, _)| *id)
                    .collect();
                GpuView {
                    index: g.index,
                    total_mb: g.total_mb,
                    free_mb: g.free_mb,
                    reserved_mb: state.reserved_on(g.index),
                    apps,
                }
            })
            .collect();
        GpuSnapshot {
            gpus,
            refreshed_at: state.refreshed_at,
        }
    }
}

/// Periodically refresh the GPU snapshot until shutdown.
pub async fn run_gpu_refresh_loop(
    pool: Arc<GpuPool>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "Starting GPU refresh loop");
    let mut timer = tokio::time::interval(interval);
    let mut failing = false;

    loop {
        tokio::select! {
            _ = timer.tick() => {
                match pool.refresh().await {
                    Ok(()) => {
                        if failing {
                            info!("GPU query recovered");
                        }
                        failing = false;
                    }
                    Err(e) => {
                        if !failing {
                            warn!(error = %e, "GPU refresh failed");
                        }
                        failing = true;
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("GPU refresh loop shutting down");
                    break;
                }
            }
        }
    }
}
