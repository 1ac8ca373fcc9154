//! Lightweight global metrics for snaptracker.
//!
//! Thread-safe atomic counters for:
//! - probes (polls, failures, entries applied, stale listings)
//! - manager (reconciliations, probe starts/stops, prune sweeps)
//! - reload (accepted / rejected)

use std::sync::atomic::{AtomicU64, Ordering};

// ----- Probes -----
static PROBE_POLLS_TOTAL: AtomicU64 = AtomicU64::new(0);
static PROBE_FAILURES_TOTAL: AtomicU64 = AtomicU64::new(0);
static PROBE_ENTRIES_APPLIED: AtomicU64 = AtomicU64::new(0);
static PROBE_RECORDS_FOREIGN: AtomicU64 = AtomicU64::new(0);
static PROBE_STALE_LISTINGS: AtomicU64 = AtomicU64::new(0);

// ----- Manager -----
static PROBES_ACTIVE: AtomicU64 = AtomicU64::new(0);
static PROBES_STARTED: AtomicU64 = AtomicU64::new(0);
static PROBES_STOPPED: AtomicU64 = AtomicU64::new(0);
static RECONCILE_RUNS: AtomicU64 = AtomicU64::new(0);
static TARGETS_REJECTED: AtomicU64 = AtomicU64::new(0);
static PRUNE_RUNS: AtomicU64 = AtomicU64::new(0);
static PRUNED_ENTRIES: AtomicU64 = AtomicU64::new(0);

// ----- Reload -----
static RELOADS_OK: AtomicU64 = AtomicU64::new(0);
static RELOADS_FAILED: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    // Probes
    pub probe_polls_total: u64,
    pub probe_failures_total: u64,
    pub probe_entries_applied: u64,
    pub probe_records_foreign: u64,
    pub probe_stale_listings: u64,

    // Manager
    pub probes_active: u64,
    pub probes_started: u64,
    pub probes_stopped: u64,
    pub reconcile_runs: u64,
    pub targets_rejected: u64,
    pub prune_runs: u64,
    pub pruned_entries: u64,

    // Reload
    pub reloads_ok: u64,
    pub reloads_failed: u64,
}

impl MetricsSnapshot {
    pub fn probe_failure_ratio(&self) -> f64 {
        if self.probe_polls_total == 0 {
            0.0
        } else {
            self.probe_failures_total as f64 / self.probe_polls_total as f64
        }
    }
}

// ----- Recorders (Probes) -----
pub fn record_poll_ok(applied: usize) {
    PROBE_POLLS_TOTAL.fetch_add(1, Ordering::Relaxed);
    PROBE_ENTRIES_APPLIED.fetch_add(applied as u64, Ordering::Relaxed);
}

pub fn record_poll_failure() {
    PROBE_POLLS_TOTAL.fetch_add(1, Ordering::Relaxed);
    PROBE_FAILURES_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub fn record_foreign_records(n: usize) {
    PROBE_RECORDS_FOREIGN.fetch_add(n as u64, Ordering::Relaxed);
}

pub fn record_stale_listing() {
    PROBE_STALE_LISTINGS.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (Manager) -----
pub fn record_probe_started() {
    PROBES_STARTED.fetch_add(1, Ordering::Relaxed);
    PROBES_ACTIVE.fetch_add(1, Ordering::Relaxed);
}

pub fn record_probe_stopped() {
    PROBES_STOPPED.fetch_add(1, Ordering::Relaxed);
    PROBES_ACTIVE.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1))).ok();
}

pub fn record_reconcile(rejected: usize) {
    RECONCILE_RUNS.fetch_add(1, Ordering::Relaxed);
    TARGETS_REJECTED.fetch_add(rejected as u64, Ordering::Relaxed);
}

pub fn record_prune(removed: usize) {
    PRUNE_RUNS.fetch_add(1, Ordering::Relaxed);
    PRUNED_ENTRIES.fetch_add(removed as u64, Ordering::Relaxed);
}

// ----- Recorders (Reload) -----
pub fn record_reload(ok: bool) {
    if ok {
        RELOADS_OK.fetch_add(1, Ordering::Relaxed);
    } else {
        RELOADS_FAILED.fetch_add(1, Ordering::Relaxed);
    }
}

// ----- Snapshot -----
pub fn snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        probe_polls_total: PROBE_POLLS_TOTAL.load(Ordering::Relaxed),
        probe_failures_total: PROBE_FAILURES_TOTAL.load(Ordering::Relaxed),
        probe_entries_applied: PROBE_ENTRIES_APPLIED.load(Ordering::Relaxed),
        probe_records_foreign: PROBE_RECORDS_FOREIGN.load(Ordering::Relaxed),
        probe_stale_listings: PROBE_STALE_LISTINGS.load(Ordering::Relaxed),

        probes_active: PROBES_ACTIVE.load(Ordering::Relaxed),
        probes_started: PROBES_STARTED.load(Ordering::Relaxed),
        probes_stopped: PROBES_STOPPED.load(Ordering::Relaxed),
        reconcile_runs: RECONCILE_RUNS.load(Ordering::Relaxed),
        targets_rejected: TARGETS_REJECTED.load(Ordering::Relaxed),
        prune_runs: PRUNE_RUNS.load(Ordering::Relaxed),
        pruned_entries: PRUNED_ENTRIES.load(Ordering::Relaxed),

        reloads_ok: RELOADS_OK.load(Ordering::Relaxed),
        reloads_failed: RELOADS_FAILED.load(Ordering::Relaxed),
    }
}

/// Prometheus text exposition of the current counters.
pub fn render_prometheus(registry_rows: usize) -> String {
    let m = snapshot();
    let mut out = String::new();

    let ver = env!("CARGO_PKG_VERSION");
    out.push_str("# HELP snaptracker_build_info Build info.\n");
    out.push_str("# TYPE snaptracker_build_info gauge\n");
    out.push_str(&format!("snaptracker_build_info{{version=\"{}\"}} 1\n", ver));

    let rows: [(&str, &str, &str, String); 15] = [
        ("probe_polls_total", "counter", "Sidecar polls attempted.", m.probe_polls_total.to_string()),
        ("probe_failures_total", "counter", "Sidecar polls that failed.", m.probe_failures_total.to_string()),
        ("probe_failure_ratio", "gauge", "Failed polls (percent).", format!("{:.2}", m.probe_failure_ratio() * 100.0)),
        ("probe_entries_applied_total", "counter", "Snapshot entries written to the registry.", m.probe_entries_applied.to_string()),
        ("probe_records_foreign_total", "counter", "Records dropped for naming another group/target.", m.probe_records_foreign.to_string()),
        ("probe_stale_listings_total", "counter", "Listings discarded by the generation guard.", m.probe_stale_listings.to_string()),
        ("probes_active", "gauge", "Running probes.", m.probes_active.to_string()),
        ("probes_started_total", "counter", "Probes started.", m.probes_started.to_string()),
        ("probes_stopped_total", "counter", "Probes stopped.", m.probes_stopped.to_string()),
        ("reconcile_runs_total", "counter", "Reconciliation passes.", m.reconcile_runs.to_string()),
        ("targets_rejected_total", "counter", "Target entries skipped as malformed or duplicate.", m.targets_rejected.to_string()),
        ("prune_runs_total", "counter", "Prune sweeps.", m.prune_runs.to_string()),
        ("pruned_entries_total", "counter", "Entries removed by prune sweeps.", m.pruned_entries.to_string()),
        ("reloads_ok_total", "counter", "Accepted reloads.", m.reloads_ok.to_string()),
        ("reloads_failed_total", "counter", "Rejected reloads.", m.reloads_failed.to_string()),
    ];
    for (name, kind, help, value) in rows.iter() {
        out.push_str(&format!("# HELP snaptracker_{} {}\n", name, help));
        out.push_str(&format!("# TYPE snaptracker_{} {}\n", name, kind));
        out.push_str(&format!("snaptracker_{} {}\n", name, value));
    }

    out.push_str("# HELP snaptracker_registry_entries Entries currently in the registry.\n");
    out.push_str("# TYPE snaptracker_registry_entries gauge\n");
    out.push_str(&format!("snaptracker_registry_entries {}\n", registry_rows));

    out
}
