//! An insertion-ordered collection of hosts with atomic host selection.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::host::Host;
use crate::resources::HostResources;
use crate::updater::{updater_loop, HostProbe};

/// A pool of execution endpoints.
///
/// Hosts keep their insertion order, which doubles as the selection
/// tie-break: the first host able to satisfy a request wins. Selection scans
/// run under a single cluster-level lock so the capacity check and the
/// allocation happen atomically; releases only need the per-host lock.
pub struct Cluster {
    hosts: RwLock<Vec<Arc<Host>>>,
    select_lock: Mutex<()>,
    updaters: tokio::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl Cluster {
    pub fn new() -> Self {
        let (shutdown, _) = tokio::sync::watch::channel(false);
        Self {
            hosts: RwLock::new(Vec::new()),
            select_lock: Mutex::new(()),
            updaters: tokio::sync::Mutex::new(Vec::new()),
            shutdown,
        }
    }

    /// Register a host. Insertion order is preserved.
    pub fn add(&self, host: Arc<Host>) {
        self.hosts.write().unwrap().push(host);
    }

    pub fn hosts(&self) -> Vec<Arc<Host>> {
        self.hosts.read().unwrap().clone()
    }

    pub fn host(&self, name: &str) -> Option<Arc<Host>> {
        self.hosts
            .read()
            .unwrap()
            .iter()
            .find(|h| h.name() == name)
            .cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.read().unwrap().is_empty()
    }

    /// Pick the first host whose free capacity satisfies `request` and claim
    /// the resources on it. `None` means no host can run the task right now;
    /// the caller keeps it queued until capacity frees up.
    ///
    /// When `preferred` names a registered, eligible host it wins over the
    /// insertion-order scan.
    pub fn select_host(
        &self,
        request: &HostResources,
        preferred: Option<&str>,
    ) -> Option<Arc<Host>> {
        let _guard = self.select_lock.lock().unwrap();
        let hosts = self.hosts.read().unwrap();

        if let Some(name) = preferred {
            if let Some(host) = hosts.iter().find(|h| h.name() == name) {
                if host.can_run(request) {
                    host.allocate(request);
                    return Some(host.clone());
                }
            }
        }

        for host in hosts.iter() {
            if host.can_run(request) {
                host.allocate(request);
                return Some(host.clone());
            }
        }
        None
    }

    /// Spawn one periodic info-updater worker per registered host.
    pub async fn start_host_info_updaters(&self, probe: Arc<dyn HostProbe>, interval: Duration) {
        // A previous stop leaves the flag raised; lower it for the new workers.
        let _ = self.shutdown.send(false);

        let mut updaters = self.updaters.lock().await;
        for host in self.hosts.read().unwrap().iter() {
            let receiver = self.shutdown.subscribe();
            updaters.push(tokio::spawn(updater_loop(
                host.clone(),
                probe.clone(),
                interval,
                receiver,
            )));
        }
        tracing::debug!(count = updaters.len(), "host info updaters started");
    }

    /// Signal every updater worker to stop and wait for all of them to
    /// finish. Idempotent: calling with no running workers is a no-op.
    pub async fn stop_host_info_updaters(&self) {
        let _ = self.shutdown.send(true);
        let mut updaters = self.updaters.lock().await;
        for handle in updaters.drain(..) {
            let _ = handle.await;
        }
    }
}

impl Default for Cluster {
    fn default() -> Self {
        Self::new()
    }
}
