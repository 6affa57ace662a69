//! A named execution endpoint with a resource budget and live usage.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::resources::HostResources;

/// A host holds a total resource budget and the amount currently allocated to
/// running tasks. Allocation is mutated under the host's own lock; selection
/// scans are serialized at the cluster level so two tasks can never claim the
/// same freed capacity.
pub struct Host {
    name: String,
    total: Mutex<HostResources>,
    allocated: Mutex<HostResources>,
    alive: AtomicBool,
    last_seen: Mutex<Option<DateTime<Utc>>>,
}

impl Host {
    pub fn new(name: impl Into<String>, total: HostResources) -> Self {
        Self {
            name: name.into(),
            total: Mutex::new(total),
            allocated: Mutex::new(HostResources {
                cpus: 0,
                ..HostResources::default()
            }),
            alive: AtomicBool::new(true),
            last_seen: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn total(&self) -> HostResources {
        self.total.lock().unwrap().clone()
    }

    /// Capacity not currently claimed by running tasks.
    pub fn free(&self) -> HostResources {
        let total = self.total.lock().unwrap();
        let allocated = self.allocated.lock().unwrap();
        total.free_after(&allocated)
    }

    /// True when the host is alive and `request` fits in its free capacity.
    pub fn can_run(&self, request: &HostResources) -> bool {
        self.is_alive() && request.fits_within(&self.free())
    }

    /// Claim `request` from this host's capacity. Callers must hold the
    /// cluster selection lock so the preceding [`can_run`](Self::can_run)
    /// check and this claim are atomic with respect to other selections.
    pub fn allocate(&self, request: &HostResources) {
        self.allocated.lock().unwrap().add(request);
    }

    /// Return `request` to this host's capacity.
    pub fn release(&self, request: &HostResources) {
        self.allocated.lock().unwrap().sub(request);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Record a successful probe, optionally refreshing the budget reported
    /// by the host.
    pub fn mark_alive(&self, refreshed_total: Option<HostResources>) {
        if let Some(total) = refreshed_total {
            *self.total.lock().unwrap() = total;
        }
        *self.last_seen.lock().unwrap() = Some(Utc::now());
        self.alive.store(true, Ordering::Release);
    }

    /// Take the host out of selection rotation. Tasks already running on it
    /// keep their allocation until they finish.
    pub fn mark_unreachable(&self) {
        self.alive.store(false, Ordering::Release);
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        *self.last_seen.lock().unwrap()
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("name", &self.name)
            .field("alive", &self.is_alive())
            .field("free", &self.free())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_reduces_free_capacity() {
        let host = Host::new("node1", HostResources::new(8, 1000, 0));
        let req = HostResources::new(2, 100, 0);

        assert!(host.can_run(&req));
        host.allocate(&req);
        assert_eq!(host.free().cpus, 6);
        assert_eq!(host.free().mem_bytes, 900);

        host.release(&req);
        assert_eq!(host.free().cpus, 8);
        assert_eq!(host.free().mem_bytes, 1000);
    }

    #[test]
    fn cannot_run_when_capacity_exhausted() {
        let host = Host::new("node1", HostResources::new(2, 0, 0));
        let req = HostResources::new(2, 0, 0);

        host.allocate(&req);
        assert!(!host.can_run(&req));
    }

    #[test]
    fn unreachable_host_rejects_work_but_keeps_allocation() {
        let host = Host::new("node1", HostResources::new(4, 0, 0));
        let req = HostResources::new(1, 0, 0);
        host.allocate(&req);

        host.mark_unreachable();
        assert!(!host.can_run(&req));
        assert_eq!(host.free().cpus, 3);

        host.mark_alive(None);
        assert!(host.can_run(&req));
        assert!(host.last_seen().is_some());
    }

    #[test]
    fn mark_alive_can_refresh_budget() {
        let host = Host::new("node1", HostResources::new(4, 0, 0));
        host.mark_alive(Some(HostResources::new(16, 0, 0)));
        assert_eq!(host.total().cpus, 16);
    }
}
