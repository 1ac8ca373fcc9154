use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;

use snaptracker::config::{read_targets, TrackerConfig};
use snaptracker::server::{self, ApiContext};
use snaptracker::{HttpSidecarClient, Manager, Registry, ReloadCoordinator, TargetSet};

mod cli;

fn main() {
    init_logger();

    if let Err(e) = run() {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = cli::Cli::parse();
    match cli.cmd {
        cli::Cmd::Serve { config, listen, scrape_interval_ms, max_snapshot_age_secs } => {
            let mut cfg = TrackerConfig::load(&config)?;
            if let Some(l) = listen {
                cfg.listen = l;
            }
            if let Some(ms) = scrape_interval_ms {
                cfg.scrape_interval_ms = ms;
            }
            if let Some(s) = max_snapshot_age_secs {
                cfg.max_snapshot_age_secs = s;
            }
            serve(config, cfg)
        }
        cli::Cmd::Check { config, json } => check(config, json),
    }
}

fn serve(config_path: PathBuf, cfg: TrackerConfig) -> Result<()> {
    let registry = Arc::new(Registry::new());
    let client = Arc::new(HttpSidecarClient::new(cfg.connect_timeout())?);
    let manager = Arc::new(Manager::new(registry.clone(), client, cfg.probe_settings()));
    let coord = Arc::new(ReloadCoordinator::new(manager.clone()));

    // A tracker without a valid initial target set is a startup failure.
    coord
        .reload(cfg.targets())
        .with_context(|| format!("initial targets from {}", config_path.display()))?;

    manager.start_sweeper(cfg.max_snapshot_age(), cfg.prune_interval());

    let source = config_path.clone();
    let (reload, _worker) = coord.spawn_worker(move || read_targets(&source))?;

    let http = server::bind(&cfg.listen)?;
    info!(
        "snaptracker listening on {} ({} target(s), config {})",
        cfg.listen,
        coord.current().len(),
        config_path.display()
    );

    let ctx = ApiContext {
        registry,
        manager,
        reload: Some(reload),
    };
    // Runs until the process is terminated.
    server::serve(&http, &ctx);
    Ok(())
}

fn check(config_path: PathBuf, json: bool) -> Result<()> {
    let cfg = TrackerConfig::load(&config_path)?;
    let set = TargetSet::validate(cfg.targets())?;

    if json {
        let out = serde_json::json!({
            "listen": cfg.listen,
            "targets": set.iter().collect::<Vec<_>>(),
            "rejected": set.rejected(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("listen: {}", cfg.listen);
    println!("targets: {}", set.len());
    for t in set.iter() {
        println!("  {}", t);
    }
    for r in set.rejected() {
        println!("  rejected {}: {}", r.target, r.reason);
    }
    Ok(())
}

fn init_logger() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}
