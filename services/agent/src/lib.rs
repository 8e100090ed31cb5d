//! hostdeck GPU host agent.
//!
//! Runs on each GPU host and turns uploaded app bundles into served,
//! supervised workloads behind a reverse proxy.
//!
//! ## Architecture
//!
//! ```text
//! HTTP API ──> AppManager ──┬── ResourcePool      (ports + GPU memory)
//!                           ├── VariantLauncher   (script, image, compose, archive)
//!                           ├── Runtime           (host processes and containers)
//!                           ├── ProxyConfigurator (routes file + generated config)
//!                           ├── SupervisorSet     (one monitor per running app)
//!                           ├── StateStore        (local SQLite records)
//!                           └── StatusReporter    (control plane pushes)
//! ```
//!
//! On startup [`AppManager::recover`] rebuilds the app set from the routes
//! file and the workloads still alive on the host.
//!
//! ## Modules
//!
//! - `resources`: port and GPU allocation
//! - `launch`: per-variant build and start plans
//! - `runtime`: runtime backends (host and mock)
//! - `proxy`: route table persistence, config rendering and reload
//! - `manager`: lifecycle operations and recovery
//! - `state`: local SQLite state persistence

pub mod api;
pub mod app;
pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod launch;
pub mod manager;
pub mod proxy;
pub mod recovery;
pub mod reporter;
pub mod resources;
pub mod runtime;
pub mod state;
pub mod supervisor;

// Re-export commonly used types
pub use app::{AccessPolicy, App, AppStatus, Variant};
pub use error::LaunchError;
pub use manager::{AppManager, DeployRequest, ManagerSettings, Outcome};
pub use recovery::{RecoveryError, RecoveryReport};
pub use runtime::MockRuntime;
