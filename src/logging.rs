// ===============================
// src/logging.rs
// ===============================
//
// Console output always; with a log directory also:
//   sma_system.log        everything from this crate (debug) + deps (info)
//   wallet_manager.log    \
//   market_analyst.log     > one file per agent module
//   portfolio_manager.log /
//
use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::{Filter, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::{analyst, portfolio, wallet};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

pub const SYSTEM_LOG: &str = "sma_system.log";
pub const AGENT_LOGS: [(&str, &str); 3] = [
    ("wallet_manager.log", wallet::LOG_TARGET),
    ("market_analyst.log", analyst::LOG_TARGET),
    ("portfolio_manager.log", portfolio::LOG_TARGET),
];

fn file_layer<F>(path: &Path, filter: F) -> std::io::Result<BoxedLayer>
where
    F: Filter<Registry> + Send + Sync + 'static,
{
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(fmt::layer()
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .with_filter(filter)
        .boxed())
}

/// `RUST_LOG` wins over `level` for the console. Calling it twice is harmless.
pub fn init(level: &str, log_dir: Option<&Path>) -> std::io::Result<()> {
    let console_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let mut layers: Vec<BoxedLayer> = vec![fmt::layer().with_filter(console_filter).boxed()];

    if let Some(dir) = log_dir {
        fs::create_dir_all(dir)?;
        let crate_root = module_path!().split("::").next().unwrap_or("sma_portfolio");
        layers.push(file_layer(
            &dir.join(SYSTEM_LOG),
            Targets::new().with_target(crate_root, LevelFilter::DEBUG).with_default(LevelFilter::INFO),
        )?);
        for (file, target) in AGENT_LOGS {
            layers.push(file_layer(&dir.join(file), Targets::new().with_target(target, LevelFilter::DEBUG))?);
        }
    }

    let _ = tracing_subscriber::registry().with(layers).try_init();
    Ok(())
}
