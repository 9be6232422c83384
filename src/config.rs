// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : sma-portfolio (multi-agent portfolio simulation in Rust)
Module  : config.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Market simulator feeding three cooperating agents (MarketAnalyst,
          WalletManager, PortfolioManager) over an in-process message bus;
          authorization-gated trades, Prometheus metrics, JSONL recording.
=============================================================================
*/
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use dotenvy::dotenv;

/// Runtime knobs. Each flag falls back to its env var, then to the default.
#[derive(Parser, Clone, Debug)]
#[command(name = "sma-portfolio", version, about = "Multi-agent portfolio simulation")]
pub struct Args {
    /// Market simulator period (seconds)
    #[arg(long, env = "UPDATE_INTERVAL", default_value_t = 5)]
    pub update_interval: u64,

    /// Pause between two agent cycles (milliseconds)
    #[arg(long, env = "CYCLE_DELAY_MS", default_value_t = 1000)]
    pub cycle_delay_ms: u64,

    /// Cash seeded into the wallet at startup
    #[arg(long, env = "DEFAULT_CASH", default_value_t = 50_000.0)]
    pub initial_cash: f64,

    #[arg(long, env = "MIN_LIQUIDITY_THRESHOLD", default_value_t = 1000.0)]
    pub min_liquidity: f64,

    /// Per-asset signal cooldown (seconds)
    #[arg(long, env = "SIGNAL_COOLDOWN", default_value_t = 60)]
    pub signal_cooldown: u64,

    /// Minimum spacing between rebalancing rounds (seconds)
    #[arg(long, env = "OPERATION_COOLDOWN", default_value_t = 30)]
    pub operation_cooldown: u64,

    /// How long a proposal may wait for its authorization (seconds)
    #[arg(long, env = "AUTHORIZATION_TIMEOUT", default_value_t = 30)]
    pub authorization_timeout: u64,

    #[arg(long, env = "MIN_TRADE_VALUE", default_value_t = 100.0)]
    pub min_trade_value: f64,

    /// Absolute percent change that raises a volatility alert
    #[arg(long = "risk-threshold", env = "RISK_THRESHOLD_PCT", default_value_t = 5.0)]
    pub risk_threshold_pct: f64,

    /// Reports are emitted every N cycles (0 disables)
    #[arg(long, env = "REPORT_EVERY", default_value_t = 30)]
    pub report_every: u64,

    /// Prometheus endpoint port (0 disables)
    #[arg(long, env = "METRICS_PORT", default_value_t = 9898)]
    pub metrics_port: u16,

    /// JSONL journal of bus traffic
    #[arg(long, env = "RECORD_FILE")]
    pub record_file: Option<String>,

    /// Directory for sma_system.log and the per-agent log files
    #[arg(long, env = "LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Stop after N seconds instead of waiting for Ctrl-C
    #[arg(long, env = "RUN_FOR")]
    pub run_for: Option<u64>,
}

impl Args {
    pub fn update_interval(&self) -> Duration { Duration::from_secs(self.update_interval) }
    pub fn cycle_delay(&self) -> Duration { Duration::from_millis(self.cycle_delay_ms) }
}

/// Thresholds shared by the agents.
#[derive(Clone, Debug)]
pub struct Limits {
    pub min_liquidity: f64,
    pub signal_cooldown: Duration,
    pub operation_cooldown: Duration,
    pub authorization_timeout: Duration,
    pub min_trade_value: f64,
    pub risk_threshold_pct: f64,
    pub report_every: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            min_liquidity: 1000.0,
            signal_cooldown: Duration::from_secs(60),
            operation_cooldown: Duration::from_secs(30),
            authorization_timeout: Duration::from_secs(30),
            min_trade_value: 100.0,
            risk_threshold_pct: 5.0,
            report_every: 30,
        }
    }
}

impl From<&Args> for Limits {
    fn from(a: &Args) -> Self {
        Self {
            min_liquidity: a.min_liquidity,
            signal_cooldown: Duration::from_secs(a.signal_cooldown),
            operation_cooldown: Duration::from_secs(a.operation_cooldown),
            authorization_timeout: Duration::from_secs(a.authorization_timeout),
            min_trade_value: a.min_trade_value,
            risk_threshold_pct: a.risk_threshold_pct,
            report_every: a.report_every,
        }
    }
}

pub fn load() -> (Args, Limits) {
    // .env first so clap sees its values as env fallbacks
    let _ = dotenv();
    let args = Args::parse();
    let limits = Limits::from(&args);
    (args, limits)
}
