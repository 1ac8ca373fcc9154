// Shared helpers for integration tests: a scripted in-process sidecar client
// and polling waits.
#![allow(dead_code)]

use anyhow::{anyhow, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use snaptracker::{ProbeSettings, SidecarClient, SidecarListing, SnapshotRecord, Target};

pub type Step = std::result::Result<SidecarListing, String>;

/// Per-address script. Steps are consumed in order; the last one repeats.
#[derive(Default)]
struct Script {
    steps: VecDeque<Step>,
    delay: Duration,
}

#[derive(Default)]
pub struct ScriptedClient {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<HashMap<String, u64>>,
    total: AtomicU64,
}

impl ScriptedClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, address: &str, steps: Vec<Step>) {
        let mut m = self.scripts.lock().unwrap();
        let s = m.entry(address.to_string()).or_default();
        s.steps = steps.into();
    }

    pub fn set_delay(&self, address: &str, delay: Duration) {
        let mut m = self.scripts.lock().unwrap();
        m.entry(address.to_string()).or_default().delay = delay;
    }

    pub fn calls(&self, address: &str) -> u64 {
        self.calls.lock().unwrap().get(address).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }
}

impl SidecarClient for ScriptedClient {
    fn fetch(&self, target: &Target, _timeout: Duration) -> Result<SidecarListing> {
        *self.calls.lock().unwrap().entry(target.address.clone()).or_insert(0) += 1;
        self.total.fetch_add(1, Ordering::SeqCst);

        let (step, delay) = {
            let mut m = self.scripts.lock().unwrap();
            match m.get_mut(&target.address) {
                None => (Err("connection refused".to_string()), Duration::ZERO),
                Some(s) => {
                    let step = if s.steps.len() > 1 {
                        s.steps.pop_front().unwrap()
                    } else {
                        s.steps.front().cloned().unwrap_or_else(|| Err("no script".to_string()))
                    };
                    (step, s.delay)
                }
            }
        };
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        step.map_err(|e| anyhow!(e))
    }
}

pub fn rec(group: &str, target: &str, slot: u64) -> SnapshotRecord {
    SnapshotRecord {
        group: group.to_string(),
        target: target.to_string(),
        slot,
        base_slot: 0,
        info: serde_json::json!({ "file": format!("snapshot-{}.tar.zst", slot) }),
    }
}

pub fn listing(records: Vec<SnapshotRecord>) -> Step {
    Ok(SidecarListing { generation: None, records })
}

pub fn listing_gen(generation: u64, records: Vec<SnapshotRecord>) -> Step {
    Ok(SidecarListing { generation: Some(generation), records })
}

pub fn fast_settings() -> ProbeSettings {
    ProbeSettings {
        interval: Duration::from_millis(20),
        timeout: Duration::from_millis(200),
        backoff_initial: Duration::from_millis(5),
        backoff_max: Duration::from_millis(40),
    }
}

/// Poll `cond` every few ms until it holds or `limit` passes.
pub fn wait_until<F: FnMut() -> bool>(limit: Duration, mut cond: F) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}
