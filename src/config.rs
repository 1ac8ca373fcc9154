//! Tracker configuration.
//!
//! Sources, lowest to highest precedence:
//! - built-in defaults (`TrackerConfig::default()`),
//! - TOML file (`TrackerConfig::load`),
//! - environment (`SNAPTRACKER_*`, see `apply_env`),
//! - command-line flags (applied by the binary).
//!
//! Only the target list is hot-reloadable. Timing tunables are read once at
//! startup because running probes keep the settings they were started with.
//!
//! File layout:
//!
//! ```toml
//! listen = "0.0.0.0:8457"
//! scrape_interval_ms = 15000
//!
//! [[groups]]
//! name = "mainnet"
//! targets = [
//!   { target = "full", address = "10.0.0.1:13080" },
//! ]
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::probe::ProbeSettings;
use crate::target::Target;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    listen: Option<String>,
    scrape_interval_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
    backoff_initial_ms: Option<u64>,
    backoff_max_ms: Option<u64>,
    max_snapshot_age_secs: Option<u64>,
    prune_interval_ms: Option<u64>,
    #[serde(default)]
    groups: Vec<GroupConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupConfig {
    pub name: String,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    pub target: String,
    pub address: String,
}

/// Effective configuration of the tracker process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackerConfig {
    /// Query/control listen address.
    /// Env: SNAPTRACKER_LISTEN (default "0.0.0.0:8457")
    pub listen: String,

    /// Pause between successful polls of one sidecar.
    /// Env: SNAPTRACKER_SCRAPE_INTERVAL_MS (default 15000)
    pub scrape_interval_ms: u64,

    /// Whole-request timeout of one poll.
    /// Env: SNAPTRACKER_REQUEST_TIMEOUT_MS (default 10000)
    pub request_timeout_ms: u64,

    /// TCP connect timeout of the sidecar client.
    /// Env: SNAPTRACKER_CONNECT_TIMEOUT_MS (default 3000)
    pub connect_timeout_ms: u64,

    /// First retry delay after a failed poll; doubles per failure.
    /// Env: SNAPTRACKER_BACKOFF_INITIAL_MS (default 1000)
    pub backoff_initial_ms: u64,

    /// Retry delay cap.
    /// Env: SNAPTRACKER_BACKOFF_MAX_MS (default 60000)
    pub backoff_max_ms: u64,

    /// Entries not refreshed for longer than this are pruned.
    /// Env: SNAPTRACKER_MAX_SNAPSHOT_AGE_SECS (default 600)
    pub max_snapshot_age_secs: u64,

    /// Period of the prune sweep.
    /// Env: SNAPTRACKER_PRUNE_INTERVAL_MS (default 30000)
    pub prune_interval_ms: u64,

    pub groups: Vec<GroupConfig>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8457".to_string(),
            scrape_interval_ms: 15_000,
            request_timeout_ms: 10_000,
            connect_timeout_ms: 3_000,
            backoff_initial_ms: 1_000,
            backoff_max_ms: 60_000,
            max_snapshot_age_secs: 600,
            prune_interval_ms: 30_000,
            groups: Vec::new(),
        }
    }
}

impl TrackerConfig {
    /// Read a TOML file on top of the defaults, then apply env overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let file = read_file(path)?;
        let mut cfg = Self::default();
        cfg.merge_file(file);
        cfg.apply_env();
        Ok(cfg)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let file: FileConfig = toml::from_str(s).context("parse TOML config")?;
        let mut cfg = Self::default();
        cfg.merge_file(file);
        Ok(cfg)
    }

    fn merge_file(&mut self, f: FileConfig) {
        fn pick(dst: &mut u64, v: Option<u64>) {
            if let Some(v) = v {
                *dst = v;
            }
        }
        if let Some(l) = f.listen {
            self.listen = l;
        }
        pick(&mut self.scrape_interval_ms, f.scrape_interval_ms);
        pick(&mut self.request_timeout_ms, f.request_timeout_ms);
        pick(&mut self.connect_timeout_ms, f.connect_timeout_ms);
        pick(&mut self.backoff_initial_ms, f.backoff_initial_ms);
        pick(&mut self.backoff_max_ms, f.backoff_max_ms);
        pick(&mut self.max_snapshot_age_secs, f.max_snapshot_age_secs);
        pick(&mut self.prune_interval_ms, f.prune_interval_ms);
        self.groups = f.groups;
    }

    /// Override tunables from `SNAPTRACKER_*` variables. Unparsable values are ignored.
    pub fn apply_env(&mut self) {
        fn env_u64(name: &str, dst: &mut u64) {
            if let Ok(v) = std::env::var(name) {
                if let Ok(n) = v.trim().parse::<u64>() {
                    *dst = n;
                }
            }
        }

        if let Ok(v) = std::env::var("SNAPTRACKER_LISTEN") {
            let s = v.trim();
            if !s.is_empty() {
                self.listen = s.to_string();
            }
        }
        env_u64("SNAPTRACKER_SCRAPE_INTERVAL_MS", &mut self.scrape_interval_ms);
        env_u64("SNAPTRACKER_REQUEST_TIMEOUT_MS", &mut self.request_timeout_ms);
        env_u64("SNAPTRACKER_CONNECT_TIMEOUT_MS", &mut self.connect_timeout_ms);
        env_u64("SNAPTRACKER_BACKOFF_INITIAL_MS", &mut self.backoff_initial_ms);
        env_u64("SNAPTRACKER_BACKOFF_MAX_MS", &mut self.backoff_max_ms);
        env_u64("SNAPTRACKER_MAX_SNAPSHOT_AGE_SECS", &mut self.max_snapshot_age_secs);
        env_u64("SNAPTRACKER_PRUNE_INTERVAL_MS", &mut self.prune_interval_ms);
    }

    /// Flatten `[[groups]]` into targets. Validation happens in `TargetSet`.
    pub fn targets(&self) -> Vec<Target> {
        self.groups
            .iter()
            .flat_map(|g| {
                g.targets
                    .iter()
                    .map(move |t| Target::new(&g.name, &t.target, &t.address))
            })
            .collect()
    }

    pub fn probe_settings(&self) -> ProbeSettings {
        ProbeSettings {
            interval: Duration::from_millis(self.scrape_interval_ms),
            timeout: Duration::from_millis(self.request_timeout_ms),
            backoff_initial: Duration::from_millis(self.backoff_initial_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn max_snapshot_age(&self) -> Duration {
        Duration::from_secs(self.max_snapshot_age_secs)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_millis(self.prune_interval_ms.max(1))
    }
}

fn read_file(path: &Path) -> Result<FileConfig> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parse TOML config {}", path.display()))
}

/// Re-read only the target list from `path` (reload source).
pub fn read_targets(path: &Path) -> Result<Vec<Target>> {
    let mut cfg = TrackerConfig::default();
    cfg.merge_file(read_file(path)?);
    Ok(cfg.targets())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
listen = "127.0.0.1:9000"
scrape_interval_ms = 500

[[groups]]
name = "mainnet"
targets = [
  { target = "full", address = "10.0.0.1:13080" },
  { target = "full", address = "10.0.0.2:13080" },
]

[[groups]]
name = "testnet"
targets = [{ target = "incremental", address = "http://10.1.0.1:13080" }]
"#;

    #[test]
    fn parse_sample() {
        let cfg = TrackerConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(cfg.listen, "127.0.0.1:9000");
        assert_eq!(cfg.scrape_interval_ms, 500);
        assert_eq!(cfg.request_timeout_ms, 10_000);
        let t = cfg.targets();
        assert_eq!(t.len(), 3);
        assert_eq!(t[0], Target::new("mainnet", "full", "10.0.0.1:13080"));
        assert_eq!(t[2].group, "testnet");
        assert_eq!(cfg.probe_settings().interval, Duration::from_millis(500));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(TrackerConfig::from_toml_str("lisen = \"x\"").is_err());
        assert!(TrackerConfig::from_toml_str("[[groups]]\nname = \"g\"\nnodes = []").is_err());
    }

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = TrackerConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, TrackerConfig::default());
        assert!(cfg.targets().is_empty());
    }
}
