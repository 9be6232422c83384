// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use tracing::{debug, info, warn};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Bus --------
pub static BUS_PUBLISHED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("bus_published_total", "messages queued with publish").unwrap());

pub static BUS_DELIVERIES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("bus_deliveries_total", "successful handler deliveries (label: type)"),
        &["type"],
    )
    .unwrap()
});

pub static BUS_HANDLER_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("bus_handler_failures_total", "handler errors and panics (label: receiver)"),
        &["receiver"],
    )
    .unwrap()
});

// -------- Agents --------
pub static AGENT_CYCLES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("agent_cycles_total", "perceive/act cycles"), &["agent"]).unwrap()
});

pub static AGENT_CYCLE_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("agent_cycle_errors_total", "failed or panicked cycles"),
        &["agent"],
    )
    .unwrap()
});

pub static SIGNALS_BY: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("signals_total_by", "analyst signals (labels: action, asset)"),
        &["action", "asset"],
    )
    .unwrap()
});

pub static ALERTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("alerts_total", "persisted alerts (labels: origin, category)"),
        &["origin", "category"],
    )
    .unwrap()
});

// -------- Negotiation --------
pub static AUTHORIZATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("authorizations_total", "authorization decisions (labels: side, outcome)"),
        &["side", "outcome"],
    )
    .unwrap()
});

pub static TRANSACTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("transactions_total", "committed transactions"), &["side"]).unwrap()
});

pub static PENDING_PROPOSALS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("pending_proposals", "proposals awaiting authorization").unwrap());

pub static EXPIRED_PROPOSALS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("expired_proposals_total", "proposals dropped after the authorization timeout")
        .unwrap()
});

// -------- Wallet / market --------
pub static WALLET_CASH: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("wallet_available_cash", "available cash").unwrap());

pub static WALLET_TOTAL: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("wallet_total_value", "cash + positions at market").unwrap());

pub static PRICE_TICKS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("price_ticks_total", "simulator update rounds").unwrap());

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(BUS_PUBLISHED.clone())),
        REGISTRY.register(Box::new(BUS_DELIVERIES.clone())),
        REGISTRY.register(Box::new(BUS_HANDLER_FAILURES.clone())),
        REGISTRY.register(Box::new(AGENT_CYCLES.clone())),
        REGISTRY.register(Box::new(AGENT_CYCLE_ERRORS.clone())),
        REGISTRY.register(Box::new(SIGNALS_BY.clone())),
        REGISTRY.register(Box::new(ALERTS.clone())),
        REGISTRY.register(Box::new(AUTHORIZATIONS.clone())),
        REGISTRY.register(Box::new(TRANSACTIONS.clone())),
        REGISTRY.register(Box::new(PENDING_PROPOSALS.clone())),
        REGISTRY.register(Box::new(EXPIRED_PROPOSALS.clone())),
        REGISTRY.register(Box::new(WALLET_CASH.clone())),
        REGISTRY.register(Box::new(WALLET_TOTAL.clone())),
        REGISTRY.register(Box::new(PRICE_TICKS.clone())),
    ] {
        if let Err(e) = m {
            warn!(?e, "metric registration failed");
        }
    }
}

/// Prometheus text exposition of `REGISTRY`.
pub fn encode_metrics() -> Vec<u8> {
    let mut buf = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&REGISTRY.gather(), &mut buf) {
        warn!(?e, "metrics encoding failed");
        buf.clear();
    }
    buf
}

/// Status line, content type and body for a request path.
fn route(path: &str) -> (&'static str, &'static str, Vec<u8>) {
    match path {
        "/" | "/metrics" => ("200 OK", "text/plain; version=0.0.4; charset=utf-8", encode_metrics()),
        "/health" => (
            "200 OK",
            "application/json",
            format!(
                r#"{{"cash":{:.2},"total":{:.2},"pending_proposals":{}}}"#,
                WALLET_CASH.get(),
                WALLET_TOTAL.get(),
                PENDING_PROPOSALS.get()
            )
            .into_bytes(),
        ),
        _ => ("404 Not Found", "text/plain", b"not found\n".to_vec()),
    }
}

fn handle_client(mut stream: TcpStream) -> std::io::Result<()> {
    let mut req = [0u8; 1024];
    let n = stream.read(&mut req)?;
    // request line: "GET /path HTTP/1.1"
    let path = std::str::from_utf8(&req[..n])
        .ok()
        .and_then(|r| r.split_whitespace().nth(1))
        .unwrap_or("/");
    let (status, content_type, body) = route(path);
    write!(
        stream,
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )?;
    stream.write_all(&body)?;
    stream.flush()
}

/// Binds `0.0.0.0:port` and answers `/metrics` and `/health` on a dedicated thread.
pub fn spawn_endpoint(port: u16) -> std::io::Result<thread::JoinHandle<()>> {
    let listener = TcpListener::bind(("0.0.0.0", port))?;
    info!(port, "metrics listening on /metrics, wallet snapshot on /health");
    Ok(thread::spawn(move || {
        for conn in listener.incoming() {
            match conn.and_then(handle_client) {
                Ok(()) => {}
                Err(e) => debug!(?e, "metrics request failed"),
            }
        }
    }))
}
