// ===============================
// src/main.rs
// ===============================
/*
 cargo run -- --run-for 60 --log-dir logs --record-file data/events.jsonl

 # negotiation activity
curl -s localhost:9898/metrics | egrep '^(authorizations_total|transactions_total)'

# agent health
curl -s localhost:9898/metrics | grep '^agent_cycle'
*/
/*
=============================================================================
Project : sma-portfolio (multi-agent portfolio simulation in Rust)
Module  : main.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Market simulator feeding three cooperating agents (MarketAnalyst,
          WalletManager, PortfolioManager) over an in-process message bus;
          authorization-gated trades, Prometheus metrics, JSONL recording.
=============================================================================
*/
use std::sync::Arc;

use sma_portfolio::{
    agent::{Agent, AgentRunner},
    analyst::MarketAnalyst,
    bus::MessageBus,
    config, logging, metrics, recorder, simulator,
    domain::Event,
    portfolio::PortfolioManager,
    store::{MemoryStore, Store},
    wallet::WalletManager,
};
use tokio::{
    select,
    sync::{mpsc, watch},
    time::{sleep, timeout, Duration},
};
use tracing::{error, info, warn};

const HEARTBEAT_EVERY: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    // ---- Load config & limits ----
    let (args, limits) = config::load();

    // ---- Logging ----
    if let Err(e) = logging::init(&args.log_level, args.log_dir.as_deref()) {
        eprintln!("log directory unusable ({e}), console only");
        let _ = logging::init(&args.log_level, None);
    }

    // ---- Metrics ----
    metrics::init();
    if args.metrics_port != 0 {
        if let Err(e) = metrics::spawn_endpoint(args.metrics_port) {
            warn!(?e, port = args.metrics_port, "metrics endpoint disabled");
        }
    }

    info!(
        initial_cash = args.initial_cash,
        update_interval_s = args.update_interval,
        cycle_delay_ms = args.cycle_delay_ms,
        ?limits,
        record_file = ?args.record_file,
        log_dir = ?args.log_dir,
        "startup config"
    );

    // ---- Recorder (optional) ----
    let (rec_tx, rec_task) = match args.record_file.clone() {
        Some(path) => {
            let (tx, rx) = mpsc::channel::<Event>(8192);
            (Some(tx), Some(tokio::spawn(recorder::run(rx, path))))
        }
        None => (None, None),
    };

    // ---- Store + bus ----
    let store: Arc<dyn Store> = Arc::new(MemoryStore::seeded(args.initial_cash));
    let bus = MessageBus::new(rec_tx.clone());

    // ---- Agents ----
    let wallet = Arc::new(WalletManager::new(store.clone(), bus.clone(), limits.clone()));
    let agents: Vec<Arc<dyn Agent>> = vec![
        wallet.clone(),
        Arc::new(MarketAnalyst::new(store.clone(), bus.clone(), limits.clone())),
        Arc::new(PortfolioManager::new(store.clone(), bus.clone(), limits.clone())),
    ];
    let runners: Vec<AgentRunner> = agents
        .into_iter()
        .map(|a| AgentRunner::new(a, bus.clone(), args.cycle_delay()))
        .collect();

    for r in &runners {
        if let Err(e) = r.start().await {
            error!(agent = r.name(), error = %e, "agent failed to start");
        }
    }

    // ---- Market simulator ----
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sim = tokio::spawn(simulator::run(store.clone(), args.update_interval(), shutdown_rx));

    for r in &runners {
        if let Err(e) = r.spawn_cycle().await {
            error!(agent = r.name(), error = %e, "agent loop not started");
        }
    }
    if let Some(tx) = &rec_tx {
        let _ = tx.try_send(Event::Note("system started".into()));
    }
    info!(agents = runners.len(), "system running, Ctrl-C to stop");

    // ---- Heartbeat until Ctrl-C or --run-for ----
    let deadline = async {
        match args.run_for {
            Some(secs) => sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    warn!(?e, "ctrl_c listener failed");
                }
                info!("interrupt received");
                break;
            }
            _ = &mut deadline => {
                info!("run time elapsed");
                break;
            }
            _ = sleep(HEARTBEAT_EVERY) => {
                match store.wallet().await {
                    Ok(Some(w)) => info!(cash = w.available_cash, total = w.total_value, "heartbeat"),
                    Ok(None) => warn!("heartbeat: wallet missing"),
                    Err(e) => warn!(error = %e, "heartbeat: store unavailable"),
                }
            }
        }
    }

    // ---- Graceful shutdown ----
    for r in &runners {
        r.stop().await;
    }
    let _ = shutdown_tx.send(true);
    for r in &runners {
        r.join().await;
    }
    if let Err(e) = sim.await {
        error!(?e, "simulator task failed");
    }

    let report = wallet.financial_report().await;
    info!(
        balance = report.balance,
        inflows = report.inflows,
        outflows = report.outflows,
        net = report.net_flow,
        liquidity_ok = report.liquidity_ok,
        "final financial report"
    );

    bus.stop();
    bus.clear().await;
    drop(runners);
    drop(wallet);
    drop(bus);
    if let Some(tx) = rec_tx {
        let _ = tx.try_send(Event::Note("system stopped".into()));
    }
    if let Some(task) = rec_task {
        if timeout(Duration::from_secs(3), task).await.is_err() {
            warn!("recorder did not drain in time");
        }
    }
    info!("bye");
}
