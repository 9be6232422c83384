// ===============================
// src/simulator.rs
// ===============================
//
// Market simulator: every `update_interval` each asset takes a gaussian step
// scaled by its class volatility, and each indicator a 0.1% one. Prices never
// drop below 0.01. The store derives previous price and percent change.
//
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::metrics::PRICE_TICKS;
use crate::store::{Store, StoreError};

pub const PRICE_FLOOR: f64 = 0.01;
pub const INDICATOR_VOLATILITY: f64 = 0.001;

/// Relative gaussian step: `value * (1 + volatility * z)`, z ~ N(0, 1).
fn gaussian_step<R: Rng + ?Sized>(rng: &mut R, value: f64, volatility: f64) -> f64 {
    let z: f64 = StandardNormal.sample(rng);
    value * (1.0 + volatility * z)
}

pub fn next_price<R: Rng + ?Sized>(rng: &mut R, price: f64, volatility: f64) -> f64 {
    gaussian_step(rng, price, volatility).max(PRICE_FLOOR)
}

/// One update round with a caller-provided rng.
pub async fn tick_with<R: Rng + Send>(store: &dyn Store, rng: &mut R) -> Result<usize, StoreError> {
    let assets = store.assets().await?;
    let prices: Vec<(String, f64)> = assets
        .iter()
        .map(|a| (a.code.clone(), next_price(rng, a.price, a.class.volatility())))
        .collect();
    store.update_prices(&prices).await?;

    let indicators = store.indicators().await?;
    let values: Vec<(String, f64)> = indicators
        .iter()
        .map(|i| (i.name.clone(), gaussian_step(rng, i.value, INDICATOR_VOLATILITY)))
        .collect();
    store.update_indicators(&values).await?;

    PRICE_TICKS.inc();
    Ok(prices.len())
}

pub async fn run(store: Arc<dyn Store>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    info!(period_s = period.as_secs_f64(), "market simulator started");
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                // ThreadRng is !Send, seed a StdRng per round instead
                let mut rng = StdRng::from_entropy();
                match tick_with(store.as_ref(), &mut rng).await {
                    Ok(n) => debug!(assets = n, "prices updated"),
                    Err(e) => warn!(error = %e, "price update failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() { break; }
            }
        }
    }
    info!("market simulator stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn price_never_below_floor() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut p = 0.02;
        for _ in 0..1000 {
            p = next_price(&mut rng, p, 0.9);
            assert!(p >= PRICE_FLOOR);
        }
    }

    #[test]
    fn steps_are_centered_on_current_value() {
        let mut rng = StdRng::seed_from_u64(42);
        let n = 20_000;
        let mean: f64 = (0..n).map(|_| gaussian_step(&mut rng, 100.0, 0.02)).sum::<f64>() / n as f64;
        assert!((mean - 100.0).abs() < 0.1);
    }

    #[tokio::test]
    async fn tick_moves_prices_and_records_change() {
        let store = MemoryStore::seeded(1000.0);
        let before = store.assets().await.unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let n = tick_with(&store, &mut rng).await.unwrap();
        assert_eq!(n, before.len());

        let after = store.assets().await.unwrap();
        for (a, b) in before.iter().zip(after.iter()) {
            assert_eq!(b.previous_price, a.price);
            let expected = (b.price / a.price - 1.0) * 100.0;
            assert!((b.change_pct - expected).abs() < 1e-9);
        }
        assert!(after.iter().any(|b| b.change_pct != 0.0));
    }

    #[tokio::test]
    async fn outage_is_reported_not_panicking() {
        let store = MemoryStore::seeded(1000.0);
        store.set_unavailable(true);
        let mut rng = StdRng::seed_from_u64(3);
        assert!(tick_with(&store, &mut rng).await.is_err());
    }
}
