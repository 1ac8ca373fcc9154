//! Hot reload of the desired target set.
//!
//! The active [`TargetSet`] lives behind an `ArcSwap`: readers load a
//! consistent `Arc` without locking, a reload replaces it with one pointer
//! swap. Reloads themselves are serialized, so two reconciliations never
//! interleave.

use anyhow::{anyhow, Result};
use arc_swap::ArcSwap;
use log::{error, info, warn};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::manager::{Manager, ReconcileReport};
use crate::metrics::record_reload;
use crate::target::{Target, TargetSet};

pub struct ReloadCoordinator {
    current: ArcSwap<TargetSet>,
    manager: Arc<Manager>,
    serial: Mutex<()>,
}

impl ReloadCoordinator {
    /// Starts with an empty set; nothing is polled until the first reload.
    pub fn new(manager: Arc<Manager>) -> Self {
        Self {
            current: ArcSwap::from_pointee(TargetSet::empty()),
            manager,
            serial: Mutex::new(()),
        }
    }

    /// The active target set.
    pub fn current(&self) -> Arc<TargetSet> {
        self.current.load_full()
    }

    /// Validate `targets`, publish them and reconcile the probes.
    ///
    /// On a validation error the previous set stays active and the error is
    /// returned.
    pub fn reload(&self, targets: Vec<Target>) -> Result<ReconcileReport> {
        let _serial = self.serial.lock().unwrap_or_else(|e| e.into_inner());

        let set = match TargetSet::validate(targets) {
            Ok(s) => Arc::new(s),
            Err(e) => {
                record_reload(false);
                error!("reload rejected, keeping {} active target(s): {:#}", self.current().len(), e);
                return Err(e.context("reload rejected; previous targets remain active"));
            }
        };

        self.current.store(set.clone());
        let report = self.manager.reconcile(&set);
        record_reload(true);
        info!("reload applied: {} target(s) active", set.len());
        Ok(report)
    }

    /// Spawn the reload worker. Each [`ReloadHandle::trigger`] makes the
    /// worker call `source()` and then `reload`, one request at a time.
    pub fn spawn_worker<F>(self: &Arc<Self>, source: F) -> Result<(ReloadHandle, JoinHandle<()>)>
    where
        F: Fn() -> Result<Vec<Target>> + Send + 'static,
    {
        let (tx, rx): (Sender<Request>, Receiver<Request>) = mpsc::channel();
        let coord = self.clone();
        let handle = thread::Builder::new()
            .name("reload worker".into())
            .spawn(move || {
                for reply in rx {
                    let res = source().and_then(|targets| coord.reload(targets));
                    if let Err(e) = &res {
                        warn!("reload failed: {:#}", e);
                    }
                    // The requester may have given up waiting.
                    let _ = reply.send(res);
                }
                info!("reload worker exiting");
            })
            .map_err(|e| anyhow!("spawn reload worker: {}", e))?;
        Ok((ReloadHandle { tx }, handle))
    }
}

type Request = Sender<Result<ReconcileReport>>;

/// Cloneable trigger for the reload worker.
#[derive(Clone)]
pub struct ReloadHandle {
    tx: Sender<Request>,
}

impl ReloadHandle {
    /// Queue a reload and wait for its outcome.
    pub fn trigger(&self) -> Result<ReconcileReport> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .send(reply_tx)
            .map_err(|_| anyhow!("reload worker is gone"))?;
        reply_rx
            .recv()
            .map_err(|_| anyhow!("reload worker dropped the request"))?
    }
}
