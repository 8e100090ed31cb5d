//! Port pool.
//!
//! Candidates are tried in configured order. A candidate is handed out only
//! if no app holds it and a bind-and-release probe on the host succeeds, so
//! ports taken by processes outside the agent are skipped.

use std::collections::{BTreeMap, HashSet};
use std::io::ErrorKind;
use std::net::TcpListener;
use std::sync::{Arc, Mutex};

use hostdeck_id::AppId;
use tracing::{debug, warn};

use super::AllocError;

/// Host-level check that a port can be bound right now.
pub trait PortProbe: Send + Sync {
    fn is_free(&self, port: u16) -> bool;
}

/// Probe that binds `0.0.0.0:<port>` and drops the listener immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct BindProbe;

impl PortProbe for BindProbe {
    fn is_free(&self, port: u16) -> bool {
        match TcpListener::bind(("0.0.0.0", port)) {
            Ok(_listener) => true,
            Err(e) if e.kind() == ErrorKind::AddrInUse => false,
            Err(e) => {
                warn!(port, error = %e, "Port probe failed");
                false
            }
        }
    }
}

/// Probe with a fixed set of externally busy ports.
#[derive(Debug, Default)]
pub struct StaticPortProbe {
    busy: Mutex<HashSet<u16>>,
}

impl StaticPortProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a port as taken by something outside the agent.
    pub fn occupy(&self, port: u16) {
        if let Ok(mut busy) = self.busy.lock() {
            busy.insert(port);
        }
    }

    pub fn vacate(&self, port: u16) {
        if let Ok(mut busy) = self.busy.lock() {
            busy.remove(&port);
        }
    }
}

impl PortProbe for StaticPortProbe {
    fn is_free(&self, port: u16) -> bool {
        self.busy
            .lock()
            .map(|busy| !busy.contains(&port))
            .unwrap_or(false)
    }
}

/// Exclusive port assignment over a fixed candidate list.
pub struct PortPool {
    candidates: Vec<u16>,
    assigned: Mutex<BTreeMap<u16, AppId>>,
    probe: Arc<dyn PortProbe>,
}

impl PortPool {
    pub fn new(candidates: Vec<u16>, probe: Arc<dyn PortProbe>) -> Self {
        Self {
            candidates,
            assigned: Mutex::new(BTreeMap::new()),
            probe,
        }
    }

    pub fn candidates(&self) -> &[u16] {
        &self.candidates
    }

    /// Assign the first free candidate to `app`, trying `preferred` first
    /// when it is a candidate.
    pub fn allocate(&self, app: AppId, preferred: Option<u16>) -> Result<u16, AllocError> {
        let mut assigned = self.assigned.lock().map_err(|_| AllocError::Poisoned)?;

        let preferred = preferred.filter(|p| self.candidates.contains(p));
        let order = preferred
            .into_iter()
            .chain(self.candidates.iter().copied().filter(|p| Some(*p) != preferred));

        for port in order {
            if assigned.contains_key(&port) {
                continue;
            }
            if !self.probe.is_free(port) {
                debug!(port, "Candidate port busy on host");
                continue;
            }
            assigned.insert(port, app);
            debug!(app_id = %app, port, "Port assigned");
            return Ok(port);
        }

        Err(AllocError::ResourceExhausted {
            candidates: self.candidates.len(),
        })
    }

    /// Record an existing assignment without probing (the port is expected
    /// to be bound by the app's own runtime). Fails if another app holds it.
    pub fn reserve(&self, port: u16, app: AppId) -> Result<(), AllocError> {
        let mut assigned = self.assigned.lock().map_err(|_| AllocError::Poisoned)?;
        match assigned.get(&port) {
            Some(owner) if *owner != app => Err(AllocError::PortConflict { port, owner: *owner }),
            _ => {
                assigned.insert(port, app);
                Ok(())
            }
        }
    }

    /// Release `port` if `app` holds it. Releasing an unassigned port, or one
    /// since reassigned to another app, is a no-op.
    pub fn release(&self, port: u16, app: AppId) {
        let Ok(mut assigned) = self.assigned.lock() else {
            return;
        };
        if assigned.get(&port) == Some(&app) {
            assigned.remove(&port);
            debug!(app_id = %app, port, "Port released");
        }
    }

    /// Snapshot of current assignments.
    pub fn assigned(&self) -> BTreeMap<u16, AppId> {
        self.assigned
            .lock()
            .map(|a| a.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(ports: &[u16]) -> (PortPool, Arc<StaticPortProbe>) {
        let probe = Arc::new(StaticPortProbe::new());
        (PortPool::new(ports.to_vec(), probe.clone()), probe)
    }

    #[test]
    fn test_first_free_in_order() {
        let (pool, _) = pool(&[9001, 9002]);
        let a = AppId::new();
        let b = AppId::new();

        assert_eq!(pool.allocate(a, None).unwrap(), 9001);
        assert_eq!(pool.allocate(b, None).unwrap(), 9002);
        assert!(matches!(
            pool.allocate(AppId::new(), None),
            Err(AllocError::ResourceExhausted { candidates: 2 })
        ));
    }

    #[test]
    fn test_skips_ports_busy_on_host() {
        let (pool, probe) = pool(&[9001, 9002]);
        probe.occupy(9001);
        assert_eq!(pool.allocate(AppId::new(), None).unwrap(), 9002);
    }

    #[test]
    fn test_preferred_port_used_when_free() {
        let (pool, _) = pool(&[9001, 9002, 9003]);
        assert_eq!(pool.allocate(AppId::new(), Some(9003)).unwrap(), 9003);
        // taken now, falls back to order
        assert_eq!(pool.allocate(AppId::new(), Some(9003)).unwrap(), 9001);
        // not a candidate
        assert_eq!(pool.allocate(AppId::new(), Some(80)).unwrap(), 9002);
    }

    #[test]
    fn test_release_is_idempotent_and_owner_checked() {
        let (pool, _) = pool(&[9001]);
        let a = AppId::new();
        let b = AppId::new();

        let port = pool.allocate(a, None).unwrap();
        pool.release(port, a);
        pool.release(port, a);

        assert_eq!(pool.allocate(b, None).unwrap(), 9001);
        // stale release from the previous owner must not free b's port
        pool.release(9001, a);
        assert_eq!(pool.assigned().get(&9001), Some(&b));
    }

    #[test]
    fn test_reserve_conflict() {
        let (pool, _) = pool(&[9001]);
        let a = AppId::new();
        pool.reserve(9001, a).unwrap();
        pool.reserve(9001, a).unwrap();
        assert!(matches!(
            pool.reserve(9001, AppId::new()),
            Err(AllocError::PortConflict { port: 9001, .. })
        ));
    }

    #[test]
    fn test_bind_probe_sees_listener() {
        let listener = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!BindProbe.is_free(port));
        drop(listener);
    }

    #[test]
    fn test_concurrent_allocations_unique() {
        let ports: Vec<u16> = (9000..9020).collect();
        let (pool, _) = pool(&ports);
        let pool = Arc::new(pool);

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || pool.allocate(AppId::new(), None).ok())
            })
            .collect();

        let got: Vec<u16> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();

        let unique: HashSet<_> = got.iter().collect();
        assert_eq!(got.len(), 20);
        assert_eq!(unique.len(), got.len());
        assert!(got.iter().all(|p| ports.contains(p)));
    }
}
