//! Per-target poll loop.
//!
//! Each probe owns one OS thread. The thread polls the sidecar, writes the
//! listing into the registry, then sleeps for the scrape interval (after a
//! success) or for an exponential backoff (after a failure). Both sleeps are
//! condvar waits that `stop()` interrupts.
//!
//! Registry writes happen under the probe's gate lock and re-check the stop
//! flag, so once `stop()` has returned the probe writes nothing more. A
//! request still in flight at that point is abandoned: its result is dropped
//! when it arrives (bounded by the request timeout) and the thread exits.

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use rand::Rng;
use serde::Deserialize;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use crate::key::{SnapshotEntry, SnapshotRecord};
use crate::metrics::{record_foreign_records, record_poll_failure, record_poll_ok, record_stale_listing};
use crate::registry::Registry;
use crate::target::Target;

// ------------------------- sidecar protocol -------------------------

/// Parsed sidecar answer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SidecarListing {
    /// Ordering token, when the sidecar provides one.
    pub generation: Option<u64>,
    pub records: Vec<SnapshotRecord>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ListingWire {
    Wrapped {
        #[serde(default)]
        generation: Option<u64>,
        snapshots: Vec<SnapshotRecord>,
    },
    Bare(Vec<SnapshotRecord>),
}

impl SidecarListing {
    /// Accepts either `[records]` or `{"generation": n, "snapshots": [records]}`.
    pub fn parse(body: &[u8]) -> Result<Self> {
        let wire: ListingWire =
            serde_json::from_slice(body).context("malformed sidecar listing")?;
        Ok(match wire {
            ListingWire::Wrapped { generation, snapshots } => Self { generation, records: snapshots },
            ListingWire::Bare(records) => Self { generation: None, records },
        })
    }
}

/// Source of snapshot listings for one target.
pub trait SidecarClient: Send + Sync {
    fn fetch(&self, target: &Target, timeout: Duration) -> Result<SidecarListing>;
}

/// `GET {base}/v1/snapshots` over HTTP.
pub struct HttpSidecarClient {
    http: reqwest::blocking::Client,
}

impl HttpSidecarClient {
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .context("build sidecar http client")?;
        Ok(Self { http })
    }
}

impl SidecarClient for HttpSidecarClient {
    fn fetch(&self, target: &Target, timeout: Duration) -> Result<SidecarListing> {
        let url = format!("{}/v1/snapshots", target.base_url());
        let resp = self
            .http
            .get(&url)
            .timeout(timeout)
            .send()
            .with_context(|| format!("GET {}", url))?;
        let status = resp.status();
        if !status.is_success() {
            bail!("GET {}: status {}", url, status);
        }
        let body = resp.bytes().with_context(|| format!("read body of {}", url))?;
        SidecarListing::parse(&body)
    }
}

// ------------------------- backoff -------------------------

/// Exponential backoff with up to 10% jitter, never above the cap.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        let max = max.max(initial);
        Self { initial, max, current: initial }
    }

    /// Next delay; the base doubles up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = base.saturating_mul(2).min(self.max);
        let jitter_ms = (base.as_millis() as u64) / 10;
        if jitter_ms == 0 {
            return base;
        }
        let jittered = base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
        jittered.min(self.max)
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

// ------------------------- probe -------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProbeSettings {
    pub interval: Duration,
    pub timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            timeout: Duration::from_secs(10),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbePhase {
    Idle,
    Polling,
    Backoff,
    Stopped,
}

impl ProbePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbePhase::Idle => "idle",
            ProbePhase::Polling => "polling",
            ProbePhase::Backoff => "backoff",
            ProbePhase::Stopped => "stopped",
        }
    }
}

/// Health of one target as seen by its probe.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProbeState {
    pub last_success_at: Option<SystemTime>,
    pub last_error_at: Option<SystemTime>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    /// Generation of the last listing applied, if the sidecar sends one.
    pub last_generation: Option<u64>,
    /// Listings discarded in a row because their generation went backwards.
    pub consecutive_stale: u32,
    pub polls_total: u64,
    pub entries_applied: u64,
}

struct Gate {
    stopped: bool,
    phase: ProbePhase,
}

struct Shared {
    gate: Mutex<Gate>,
    wake: Condvar,
    state: Mutex<ProbeState>,
}

impl Shared {
    fn gate(&self) -> MutexGuard<'_, Gate> {
        self.gate.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> MutexGuard<'_, ProbeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enter `phase` unless stopped. Returns false when stopped.
    fn enter(&self, phase: ProbePhase) -> bool {
        let mut g = self.gate();
        if g.stopped {
            return false;
        }
        g.phase = phase;
        true
    }

    /// Wait for `delay` or until stopped. Returns true when stopped.
    fn sleep(&self, delay: Duration) -> bool {
        let g = self.gate();
        let (g, _) = self
            .wake
            .wait_timeout_while(g, delay, |g| !g.stopped)
            .unwrap_or_else(|e| e.into_inner());
        g.stopped
    }
}

/// Regressed generations seen in a row before the sidecar is taken to have
/// restarted and its new counter is adopted.
const RESTART_AFTER_STALE: u32 = 3;

/// Outcome of applying one listing.
enum Applied {
    Stopped,
    Stale,
    Written(usize),
}

/// Handle to one running poll loop.
pub struct Probe {
    target: Target,
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Probe {
    /// Spawn the poll loop. Connectivity problems are handled inside the loop.
    pub fn start(
        target: Target,
        registry: Arc<Registry>,
        client: Arc<dyn SidecarClient>,
        settings: ProbeSettings,
    ) -> Self {
        let shared = Arc::new(Shared {
            gate: Mutex::new(Gate { stopped: false, phase: ProbePhase::Idle }),
            wake: Condvar::new(),
            state: Mutex::new(ProbeState::default()),
        });

        let worker = Worker {
            target: target.clone(),
            shared: shared.clone(),
            registry,
            client,
            settings,
        };
        let handle = match thread::Builder::new()
            .name(format!("probe {}", target))
            .spawn(move || worker.run())
        {
            Ok(h) => Some(h),
            Err(e) => {
                // Surface it as probe health rather than failing the caller.
                warn!("probe {}: spawn failed: {}", target, e);
                let mut st = shared.state();
                st.last_error = Some(format!("spawn poll thread: {}", e));
                st.last_error_at = Some(SystemTime::now());
                drop(st);
                let mut g = shared.gate();
                g.stopped = true;
                g.phase = ProbePhase::Stopped;
                None
            }
        };

        Self {
            target,
            shared,
            handle: Mutex::new(handle),
        }
    }

    /// Cancel the current and future cycles. No registry write happens after this returns.
    pub fn stop(&self) {
        let mut g = self.shared.gate();
        if !g.stopped {
            g.stopped = true;
            g.phase = ProbePhase::Stopped;
            debug!("probe {}: stop requested", self.target);
        }
        self.shared.wake.notify_all();
    }

    /// Wait for the poll thread to exit. Call after `stop`.
    pub fn join(&self) {
        let h = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(h) = h {
            if h.join().is_err() {
                warn!("probe {}: poll thread panicked", self.target);
            }
        }
    }

    pub fn phase(&self) -> ProbePhase {
        self.shared.gate().phase
    }

    pub fn state(&self) -> ProbeState {
        self.shared.state().clone()
    }
}

impl Drop for Probe {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    target: Target,
    shared: Arc<Shared>,
    registry: Arc<Registry>,
    client: Arc<dyn SidecarClient>,
    settings: ProbeSettings,
}

impl Worker {
    fn run(self) {
        info!("probe {}: started", self.target);
        let mut backoff = Backoff::new(self.settings.backoff_initial, self.settings.backoff_max);

        loop {
            if !self.shared.enter(ProbePhase::Polling) {
                break;
            }

            let delay = match self.client.fetch(&self.target, self.settings.timeout) {
                Ok(listing) => match self.apply(listing) {
                    Applied::Stopped => break,
                    outcome => {
                        if let Applied::Written(n) = outcome {
                            debug!("probe {}: applied {} snapshot(s)", self.target, n);
                        }
                        backoff.reset();
                        if !self.shared.enter(ProbePhase::Idle) {
                            break;
                        }
                        self.settings.interval
                    }
                },
                Err(e) => {
                    if !self.shared.enter(ProbePhase::Backoff) {
                        break;
                    }
                    let delay = backoff.next_delay();
                    let failures = self.fail(&e);
                    warn!(
                        "probe {}: poll failed ({} in a row, retry in {} ms): {:#}",
                        self.target,
                        failures,
                        delay.as_millis(),
                        e
                    );
                    delay
                }
            };

            if self.shared.sleep(delay) {
                break;
            }
        }
        info!("probe {}: stopped", self.target);
    }

    fn apply(&self, listing: SidecarListing) -> Applied {
        let now = SystemTime::now();
        let total = listing.records.len();
        let entries: Vec<SnapshotEntry> = listing
            .records
            .into_iter()
            .filter(|r| r.group == self.target.group && r.target == self.target.target)
            .map(|r| SnapshotEntry::from_record(r, &self.target.address, now))
            .collect();
        let foreign = total - entries.len();
        if foreign > 0 {
            record_foreign_records(foreign);
            debug!(
                "probe {}: dropped {} record(s) naming another group/target",
                self.target, foreign
            );
        }

        let gate = self.shared.gate();
        if gate.stopped {
            return Applied::Stopped;
        }
        let mut st = self.shared.state();
        st.polls_total += 1;

        if let (Some(new), Some(old)) = (listing.generation, st.last_generation) {
            if new < old {
                st.consecutive_stale += 1;
                if st.consecutive_stale < RESTART_AFTER_STALE {
                    record_stale_listing();
                    record_poll_ok(0);
                    debug!(
                        "probe {}: listing generation {} older than applied {}, ignored",
                        self.target, new, old
                    );
                    return Applied::Stale;
                }
                info!(
                    "probe {}: generation went back from {} to {} on {} polls in a row, sidecar restarted",
                    self.target, old, new, st.consecutive_stale
                );
            }
        }
        if listing.generation.is_some() {
            st.last_generation = listing.generation;
        }
        st.consecutive_stale = 0;
        st.consecutive_failures = 0;
        st.last_success_at = Some(now);

        let n = self.registry.upsert_many(entries);
        st.entries_applied += n as u64;
        record_poll_ok(n);
        Applied::Written(n)
    }

    fn fail(&self, e: &anyhow::Error) -> u32 {
        record_poll_failure();
        let mut st = self.shared.state();
        st.polls_total += 1;
        st.consecutive_failures = st.consecutive_failures.saturating_add(1);
        st.last_error = Some(format!("{:#}", e));
        st.last_error_at = Some(SystemTime::now());
        st.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bare_and_wrapped() {
        let bare = br#"[{"group":"g","target":"t","slot":5,"base_slot":1,"info":{"size":10}}]"#;
        let l = SidecarListing::parse(bare).unwrap();
        assert_eq!(l.generation, None);
        assert_eq!(l.records.len(), 1);
        assert_eq!(l.records[0].info["size"], 10);

        let wrapped = br#"{"generation":7,"snapshots":[]}"#;
        let l = SidecarListing::parse(wrapped).unwrap();
        assert_eq!(l.generation, Some(7));
        assert!(l.records.is_empty());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(SidecarListing::parse(b"not json").is_err());
        assert!(SidecarListing::parse(br#"{"snapshots":[{"group":"g"}]}"#).is_err());
        assert!(SidecarListing::parse(br#"{"other":1}"#).is_err());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_millis(500));
        let bases = [100u64, 200, 400, 500, 500];
        for base in bases {
            let d = b.next_delay().as_millis() as u64;
            assert!(d >= base && d <= base + base / 10, "delay {} for base {}", d, base);
            assert!(d <= 500, "delay {} above the cap", d);
        }
        b.reset();
        let d = b.next_delay().as_millis() as u64;
        assert!((100..=110).contains(&d));
    }

    #[test]
    fn backoff_jitter_never_exceeds_cap() {
        let mut b = Backoff::new(Duration::from_millis(1000), Duration::from_millis(1000));
        for _ in 0..200 {
            assert_eq!(b.next_delay(), Duration::from_millis(1000));
        }
    }

    #[test]
    fn backoff_normalizes_bounds() {
        let mut b = Backoff::new(Duration::ZERO, Duration::ZERO);
        assert_eq!(b.next_delay(), Duration::from_millis(1));
        assert_eq!(b.next_delay(), Duration::from_millis(1));
    }
}
