//! Probe manager: owns the live probe set and reconciles it against the desired targets.
//!
//! Also runs the prune sweeper, which drops registry entries from nodes that
//! are still configured but stopped answering long ago.

use log::{info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use crate::metrics::{record_probe_started, record_probe_stopped, record_prune, record_reconcile};
use crate::probe::{Probe, ProbePhase, ProbeSettings, ProbeState, SidecarClient};
use crate::registry::Registry;
use crate::target::{Rejected, Target, TargetSet};

/// What one reconciliation pass did.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub started: Vec<Target>,
    pub stopped: Vec<Target>,
    pub unchanged: usize,
    pub rejected: Vec<Rejected>,
}

impl ReconcileReport {
    /// True when the pass neither started nor stopped a probe.
    pub fn is_noop(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty()
    }
}

/// Health row for one live target.
#[derive(Clone, Debug)]
pub struct ProbeStatus {
    pub target: Target,
    pub phase: ProbePhase,
    pub state: ProbeState,
}

struct Sweeper {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: JoinHandle<()>,
}

pub struct Manager {
    registry: Arc<Registry>,
    client: Arc<dyn SidecarClient>,
    settings: ProbeSettings,
    live: Mutex<BTreeMap<Target, Probe>>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl Manager {
    pub fn new(registry: Arc<Registry>, client: Arc<dyn SidecarClient>, settings: ProbeSettings) -> Self {
        Self {
            registry,
            client,
            settings,
            live: Mutex::new(BTreeMap::new()),
            sweeper: Mutex::new(None),
        }
    }

    fn live(&self) -> MutexGuard<'_, BTreeMap<Target, Probe>> {
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bring the live probe set in line with `desired`.
    ///
    /// Probes present in both sets keep running untouched. Removed targets are
    /// stopped first and their entries dropped from the registry afterwards,
    /// so nothing they report can reappear. Idempotent.
    pub fn reconcile(&self, desired: &TargetSet) -> ReconcileReport {
        let mut report = ReconcileReport {
            rejected: desired.rejected().to_vec(),
            ..ReconcileReport::default()
        };
        for r in &report.rejected {
            warn!("target {} skipped: {}", r.target, r.reason);
        }

        let mut live = self.live();

        let to_stop: Vec<Target> = live.keys().filter(|t| !desired.contains(t)).cloned().collect();
        for t in to_stop {
            if let Some(probe) = live.remove(&t) {
                probe.stop();
                record_probe_stopped();
            }
            let dropped = self.registry.remove_source(&t.group, &t.target, &t.address);
            info!("probe {}: withdrawn, {} entr(ies) dropped", t, dropped);
            report.stopped.push(t);
        }

        for t in desired.iter() {
            if live.contains_key(t) {
                report.unchanged += 1;
                continue;
            }
            let probe = Probe::start(t.clone(), self.registry.clone(), self.client.clone(), self.settings);
            record_probe_started();
            live.insert(t.clone(), probe);
            report.started.push(t.clone());
        }
        drop(live);

        record_reconcile(report.rejected.len());
        info!(
            "reconcile: {} started, {} stopped, {} unchanged, {} rejected",
            report.started.len(),
            report.stopped.len(),
            report.unchanged,
            report.rejected.len()
        );
        report
    }

    pub fn live_targets(&self) -> Vec<Target> {
        self.live().keys().cloned().collect()
    }

    pub fn probe_statuses(&self) -> Vec<ProbeStatus> {
        self.live()
            .iter()
            .map(|(t, p)| ProbeStatus {
                target: t.clone(),
                phase: p.phase(),
                state: p.state(),
            })
            .collect()
    }

    pub fn probe_state(&self, target: &Target) -> Option<ProbeState> {
        self.live().get(target).map(|p| p.state())
    }

    /// Start the periodic prune sweep. A second call replaces the first sweeper.
    pub fn start_sweeper(&self, max_age: Duration, every: Duration) {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let registry = self.registry.clone();
        let flag = stop.clone();
        let spawned = thread::Builder::new().name("prune sweeper".into()).spawn(move || {
            let (lock, cv) = &*flag;
            loop {
                let g = lock.lock().unwrap_or_else(|e| e.into_inner());
                let (g, _) = cv
                    .wait_timeout_while(g, every, |stopped| !*stopped)
                    .unwrap_or_else(|e| e.into_inner());
                if *g {
                    break;
                }
                drop(g);
                let removed = registry.prune(max_age, SystemTime::now());
                record_prune(removed);
                if removed > 0 {
                    info!("prune: dropped {} entr(ies) older than {:?}", removed, max_age);
                }
            }
        });

        match spawned {
            Ok(handle) => {
                let old = self
                    .sweeper
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .replace(Sweeper { stop, handle });
                if let Some(old) = old {
                    stop_sweeper(old);
                }
            }
            Err(e) => warn!("prune sweeper not started: {}", e),
        }
    }

    /// Stop every probe and the sweeper.
    ///
    /// Probe threads are not joined. A thread blocked in a sidecar request is
    /// abandoned and exits once the request returns; it writes nothing.
    pub fn shutdown(&self) {
        if let Some(s) = self.sweeper.lock().unwrap_or_else(|e| e.into_inner()).take() {
            stop_sweeper(s);
        }
        let probes: Vec<Probe> = {
            let mut live = self.live();
            std::mem::take(&mut *live).into_values().collect()
        };
        for p in &probes {
            p.stop();
            record_probe_stopped();
        }
        info!("manager: {} probe(s) stopped", probes.len());
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        if let Some(s) = self.sweeper.get_mut().unwrap_or_else(|e| e.into_inner()).take() {
            let (lock, cv) = &*s.stop;
            *lock.lock().unwrap_or_else(|e| e.into_inner()) = true;
            cv.notify_all();
        }
    }
}

fn stop_sweeper(s: Sweeper) {
    let (lock, cv) = &*s.stop;
    *lock.lock().unwrap_or_else(|e| e.into_inner()) = true;
    cv.notify_all();
    if s.handle.join().is_err() {
        warn!("prune sweeper panicked");
    }
}
