//! Host and cluster resource model for the Sluice workflow engine.
//!
//! A [`Host`] is a named execution endpoint with a resource budget and live
//! usage; a [`Cluster`] is an insertion-ordered collection of hosts that
//! selects one able to satisfy a task's resource request, and owns the
//! lifecycle of the per-host info-updater workers.

pub mod cluster;
pub mod host;
pub mod resources;
pub mod updater;

pub use cluster::Cluster;
pub use host::Host;
pub use resources::HostResources;
pub use updater::{HostProbe, ProbeResult, SshProbe, StaticProbe};
