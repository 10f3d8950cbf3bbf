use clap::Parser;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod capture;
mod config;
mod dns;
mod gate;
mod packet;
mod sink;
mod socket;
mod stats;
mod storage;
mod watch;

use capture::CaptureEngine;
use config::{CliArgs, Config};
use gate::{GateStatus, ProcessGate};
use sink::ChannelSink;
use socket::RawSocketProvider;
use watch::{ProcessEvent, ProcessWatcher};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CliArgs::parse();

    // Load config from file if provided, otherwise use defaults.
    let mut config = if let Some(ref config_path) = cli.config {
        Config::from_file(Path::new(config_path))?
    } else {
        Config::default()
    };
    config.merge_cli(&cli);

    // Logging.
    if config.quiet {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new("error"))
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(
                std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
            ))
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    if config.watch.is_empty() {
        anyhow::bail!(
            "no watched processes configured; pass --watch <name> or set `watch` in the config file"
        );
    }

    // The capture socket binds to an explicit address; auto-detect only as
    // a fallback.
    let bind_addr = match config.bind_address {
        Some(addr) => addr,
        None => detect_host_address()?,
    };

    // ── State & Storage ───────────────────────────────────────────────
    let stats = Arc::new(stats::CaptureStats::new());
    let storage = Arc::new(storage::Storage::new(&config.db_path)?);

    // ── DNS Cache (optional) ──────────────────────────────────────────
    let dns_cache = if config.resolve_dns {
        tracing::info!("Reverse DNS resolution enabled");
        Some(Arc::new(dns::DnsCache::new(
            Duration::from_secs(300),
            Duration::from_secs(2),
        )))
    } else {
        None
    };

    // ── Record channel: capture thread -> storage writer ──────────────
    let (tx, rx) = mpsc::channel(10000);

    let storage_writer = storage.clone();
    tokio::spawn(async move {
        storage_writer.run_writer(rx, dns_cache).await;
    });

    // ── Stale Peer Cleanup Task ───────────────────────────────────────
    let stats_cleanup = stats.clone();
    let peer_timeout = config.peer_timeout;
    tokio::spawn(async move {
        let mut cleanup_interval = interval(Duration::from_secs(10));
        loop {
            cleanup_interval.tick().await;
            stats_cleanup.cleanup_stale_peers(Duration::from_secs(peer_timeout));
        }
    });

    // ── Data Retention Task ───────────────────────────────────────────
    if let Some(retention_seconds) = config.data_retention_seconds {
        let storage_retention = storage.clone();
        tokio::spawn(async move {
            let mut retention_interval = interval(Duration::from_secs(60));
            loop {
                retention_interval.tick().await;
                match storage_retention.delete_old_data(retention_seconds) {
                    Ok(deleted) if deleted > 0 => {
                        tracing::info!("Data retention: deleted {} old records", deleted);
                    }
                    Err(e) => {
                        tracing::error!("Data retention cleanup failed: {}", e);
                    }
                    _ => {}
                }
            }
        });
    }

    // ── Capture engine behind the process gate ────────────────────────
    let sink = Arc::new(ChannelSink::new(tx.clone(), stats.clone()));
    let engine = CaptureEngine::new(RawSocketProvider, sink);
    let gate_status = Arc::new(GateStatus::default());
    let gate = Arc::new(ProcessGate::new(engine, bind_addr, gate_status.clone()));

    // ── Process Watcher -> Gate ───────────────────────────────────────
    let (event_tx, mut event_rx) = mpsc::channel(256);
    let watcher = ProcessWatcher::new(
        config.watch.clone(),
        Duration::from_secs(config.poll_interval_seconds),
    );
    tokio::spawn(async move {
        watcher.run(event_tx).await;
    });

    let gate_events = gate.clone();
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                ProcessEvent::Started(name) => gate_events.on_process_start(&name),
                ProcessEvent::Ended(name) => gate_events.on_process_end(&name),
            }
        }
    });

    tracing::info!(
        %bind_addr,
        watched = ?config.watch,
        "ipwatch ready; capture activates with the first watched process"
    );

    // Signal handler for graceful shutdown.
    let gate_shutdown = gate.clone();
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, closing capture socket");
        gate_shutdown.shutdown();
        std::process::exit(0);
    })
    .expect("Error setting Ctrl-C handler");

    // ── HTTP API ──────────────────────────────────────────────────────
    let app_state = Arc::new(api::AppState {
        stats: stats.clone(),
        storage: storage.clone(),
        gate: gate_status.clone(),
        start_time: std::time::Instant::now(),
    });

    let app = api::router(app_state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    tracing::info!("Server running on http://0.0.0.0:{}", config.port);
    axum::serve(listener, app).await?;

    Ok(())
}

/// First IPv4 address the local hostname resolves to.
fn detect_host_address() -> anyhow::Result<Ipv4Addr> {
    let hostname = dns_lookup::get_hostname()?;
    let addrs = dns_lookup::lookup_host(&hostname)?;
    addrs
        .into_iter()
        .find_map(|addr| match addr {
            std::net::IpAddr::V4(v4) => Some(v4),
            std::net::IpAddr::V6(_) => None,
        })
        .ok_or_else(|| {
            anyhow::anyhow!("hostname {hostname} has no IPv4 address; set bind_address explicitly")
        })
}
