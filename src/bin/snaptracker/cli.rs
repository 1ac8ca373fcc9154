use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Snapshot tracker: scrapes node sidecars and serves latest-snapshot queries.
#[derive(Parser, Debug)]
#[command(name = "snaptracker", version, about = "Cluster-wide snapshot tracker")]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Run the tracker: probes, prune sweep, query/control HTTP API
    Serve {
        /// Config file (TOML). Re-read on POST /reload.
        #[arg(long)]
        config: PathBuf,
        /// Listen address (overrides config and SNAPTRACKER_LISTEN)
        #[arg(long)]
        listen: Option<String>,
        /// Scrape interval in ms (overrides config)
        #[arg(long)]
        scrape_interval_ms: Option<u64>,
        /// Max age of an entry before pruning, in seconds (overrides config)
        #[arg(long)]
        max_snapshot_age_secs: Option<u64>,
    },
    /// Validate a config file and print the target set
    Check {
        #[arg(long)]
        config: PathBuf,
        /// Print JSON instead of text
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}
