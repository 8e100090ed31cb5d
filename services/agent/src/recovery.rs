//! Startup recovery planning.
//!
//! After a restart the agent has two records of what should exist: the
//! persisted route table (declared) and the labelled workloads still alive
//! on the host (observed). A route is kept only when both agree; the
//! observed handle wins over the one written in the route, since the
//! workload may have been recreated under the same label.
//!
//! When the workloads cannot be listed, declared routes are kept as they
//! are and left to supervision.
//!
//! Planning is pure. [`crate::manager::AppManager::recover`] applies the plan.

use std::collections::BTreeMap;

use hostdeck_id::AppId;
use hostdeck_reconcile::reconcile;
use thiserror::Error;

use crate::proxy::{ProxyError, RouteDescriptor};
use crate::runtime::{ObservedRuntime, RuntimeHandle};
use crate::state::StateStoreError;

/// Recovery failures. Either one stops the agent from serving.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("cannot recover routes: {0}")]
    Routes(#[from] ProxyError),

    #[error("cannot read app records: {0}")]
    Store(#[from] StateStoreError),
}

/// A route whose workload is still alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adoption {
    pub app_id: AppId,
    /// Declared route with the observed handle.
    pub route: RouteDescriptor,
}

/// What to do with each declared route and observed workload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryPlan {
    pub adopt: Vec<Adoption>,
    /// Declared routes with no live workload.
    pub dropped: Vec<AppId>,
    /// Live workloads with no route. Left running, never adopted.
    pub unmanaged: Vec<ObservedRuntime>,
}

/// Summary of an applied recovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub adopted: Vec<AppId>,
    pub dropped: Vec<AppId>,
    pub unmanaged: Vec<RuntimeHandle>,
    /// Apps caught mid-operation, now in `error`.
    pub interrupted: Vec<AppId>,
    pub warnings: Vec<String>,
}

/// Match declared routes against live workloads.
pub fn plan_recovery(
    declared: BTreeMap<AppId, RouteDescriptor>,
    mut observed: Vec<ObservedRuntime>,
) -> RecoveryPlan {
    // Deterministic choice when two workloads carry the same label.
    observed.sort();

    let reconciliation = reconcile(declared, observed, |o: &ObservedRuntime| o.app_id);

    let adopt = reconciliation
        .matched
        .into_iter()
        .map(|m| {
            let mut route = m.declared;
            route.handle = m.observed.handle;
            Adoption {
                app_id: m.key,
                route,
            }
        })
        .collect();

    RecoveryPlan {
        adopt,
        dropped: reconciliation.stale.into_iter().map(|(id, _)| id).collect(),
        unmanaged: reconciliation.unmanaged,
    }
}

/// Plan used when live workloads cannot be enumerated: every declared route
/// is kept with its recorded handle. Supervision then finds the dead ones.
pub fn plan_unverified(declared: BTreeMap<AppId, RouteDescriptor>) -> RecoveryPlan {
    RecoveryPlan {
        adopt: declared
            .into_iter()
            .map(|(app_id, route)| Adoption { app_id, route })
            .collect(),
        ..RecoveryPlan::default()
    }
}
