//! snaptracker: cluster-wide snapshot catalog.
//!
//! Probes poll node sidecars, the registry merges what they report, and the
//! query path answers "newest snapshot for (group, target)".

// Core
pub mod key;      // SnapshotKey / SnapshotEntry / SnapshotRecord
pub mod registry; // ordered in-memory store
pub mod target;   // Target / TargetSet
pub mod probe;    // per-target poll loop + sidecar client
pub mod manager;  // probe set reconciliation + prune sweep
pub mod reload;   // atomically swapped target set

// Service surface
pub mod config;
pub mod metrics;
pub mod server;

pub use key::{SnapshotEntry, SnapshotKey, SnapshotRecord};
pub use manager::{Manager, ReconcileReport};
pub use probe::{HttpSidecarClient, Probe, ProbePhase, ProbeSettings, ProbeState, SidecarClient, SidecarListing};
pub use registry::Registry;
pub use reload::{ReloadCoordinator, ReloadHandle};
pub use target::{Target, TargetSet};
