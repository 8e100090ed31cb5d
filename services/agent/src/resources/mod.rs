//! Resource allocator.
//!
//! Owns the port pool and the GPU memory view. Each resource type has its
//! own lock and neither is held across a runtime launch: allocation finishes
//! before the launch starts, and a failed launch releases explicitly.

mod gpu;
mod ports;

use std::sync::Arc;

use hostdeck_id::AppId;
use thiserror::Error;
use tracing::info;

pub use gpu::{
    parse_query_output, run_gpu_refresh_loop, select_gpus, CommandGpuProbe, GpuInfo, GpuPool,
    GpuProbe, GpuShare, GpuSnapshot, GpuView, StaticGpuProbe,
};
pub use ports::{BindProbe, PortPool, PortProbe, StaticPortProbe};

/// Allocation failures.
#[derive(Debug, Error)]
pub enum AllocError {
    /// No candidate port is free.
    #[error("no free port among {candidates} candidates")]
    ResourceExhausted { candidates: usize },

    /// No GPU combination meets the requirement.
    #[error("insufficient GPU memory: requested {required_mb} MB, {available_mb} MB available")]
    InsufficientCapacity { required_mb: u64, available_mb: u64 },

    /// A port being re-registered is held by another app.
    #[error("port {port} is already assigned to {owner}")]
    PortConflict { port: u16, owner: AppId },

    /// A lock holder panicked.
    #[error("allocator lock poisoned")]
    Poisoned,
}

/// Resources committed to one app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub port: u16,
    pub gpus: Vec<GpuShare>,
}

/// Single process-wide pool of ports and GPU memory.
pub struct ResourcePool {
    ports: PortPool,
    gpus: Arc<GpuPool>,
}

impl ResourcePool {
    pub fn new(ports: PortPool, gpus: Arc<GpuPool>) -> Self {
        Self { ports, gpus }
    }

    pub fn gpus(&self) -> &Arc<GpuPool> {
        &self.gpus
    }

    pub fn ports(&self) -> &PortPool {
        &self.ports
    }

    /// Allocate a port (preferring `preferred_port`) and then GPU memory.
    /// A GPU failure returns the port before the error is reported.
    pub async fn allocate(
        &self,
        app: AppId,
        vram_required_mb: u64,
        preferred_port: Option<u16>,
    ) -> Result<Allocation, AllocError> {
        let port = self.ports.allocate(app, preferred_port)?;

        match self.gpus.allocate(app, vram_required_mb).await {
            Ok(gpus) => {
                info!(
                    app_id = %app,
                    port,
                    gpus = ?gpus.iter().map(|s| s.index).collect::<Vec<_>>(),
                    vram_required_mb,
                    "Resources allocated"
                );
                Ok(Allocation { port, gpus })
            }
            Err(e) => {
                self.ports.release(port, app);
                Err(e)
            }
        }
    }

    /// Re-register an existing allocation (recovery).
    pub async fn restore(&self, app: AppId, allocation: &Allocation) -> Result<(), AllocError> {
        self.ports.reserve(allocation.port, app)?;
        self.gpus.restore(app, allocation.gpus.clone()).await;
        Ok(())
    }

    /// Release everything `app` holds. Safe to call repeatedly.
    pub async fn release(&self, app: AppId, port: Option<u16>) {
        if let Some(port) = port {
            self.ports.release(port, app);
        }
        self.gpus.release(app).await;
    }
}
