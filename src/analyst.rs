// ===============================
// src/analyst.rs
// ===============================
//
// MarketAnalyst: reads quotes and indicators, classifies the trend of each
// asset and turns strong moves into signals for the PortfolioManager.
//
//   change >  2%  -> alta_forte     change < -2%  -> queda_forte
//   change >  0.5 -> alta_suave     change < -0.5 -> queda_suave
//   otherwise     -> lateral
//
//   queda_forte & change < -3% -> buy  / strong
//   alta_forte  & change >  3% -> sell / moderate
//   lateral                    -> hold / weak   (report only)
//
// Buy/sell signals are throttled per asset (signal_cooldown). Moves beyond
// risk_threshold_pct raise one volatility alert per price update.
//
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentError};
use crate::bus::MessageBus;
use crate::config::Limits;
use crate::domain::{Asset, NewAlert};
use crate::message::{
    IndicatorReading, MarketReport, Message, Payload, Quote, RiskAlert, Signal, SignalAction,
    SignalBatch, SignalStrength, Trend, TrendAnalysis, TrendReading, MARKET_ANALYST,
    PORTFOLIO_MANAGER,
};
use crate::metrics::{ALERTS, SIGNALS_BY};
use crate::store::Store;

pub const LOG_TARGET: &str = module_path!();
pub const RISK_CATEGORY: &str = "risco_volatilidade_alta";

pub fn classify_trend(change_pct: f64) -> Trend {
    if change_pct > 2.0 {
        Trend::StrongUp
    } else if change_pct > 0.5 {
        Trend::MildUp
    } else if change_pct < -2.0 {
        Trend::StrongDown
    } else if change_pct < -0.5 {
        Trend::MildDown
    } else {
        Trend::Sideways
    }
}

pub fn signal_for(reading: &TrendReading) -> Option<Signal> {
    let (action, strength, reason) = match reading.trend {
        Trend::StrongDown if reading.change_pct < -3.0 => (
            SignalAction::Buy,
            SignalStrength::Strong,
            format!("significant drop ({:.2}%)", reading.change_pct),
        ),
        Trend::StrongUp if reading.change_pct > 3.0 => (
            SignalAction::Sell,
            SignalStrength::Moderate,
            format!("significant rise ({:.2}%)", reading.change_pct),
        ),
        Trend::Sideways => (SignalAction::Hold, SignalStrength::Weak, "sideways market".to_string()),
        _ => return None,
    };
    Some(Signal { asset_code: reading.asset_code.clone(), action, strength, reason })
}

fn quote_of(a: &Asset) -> Quote {
    Quote {
        class: a.class,
        price: a.price,
        previous_price: a.previous_price,
        change_pct: a.change_pct,
        updated_at: a.updated_at,
    }
}

#[derive(Default)]
struct View {
    assets: Vec<Asset>,
    indicators: Vec<IndicatorReading>,
    trends: HashMap<String, TrendReading>,
    last_signal: HashMap<String, Signal>,
    last_emitted: HashMap<String, Instant>,
    // asset -> updated_at of the price that already raised an alert
    risk_seen: HashMap<String, DateTime<Utc>>,
}

/// What one act() decided; sent after the view lock is released.
#[derive(Default)]
struct Outbox {
    buys: Vec<Signal>,
    sells: Vec<Signal>,
    risks: Vec<(String, f64)>,
    report: Option<MarketReport>,
}

pub struct MarketAnalyst {
    store: Arc<dyn Store>,
    bus: MessageBus,
    limits: Limits,
    view: Mutex<View>,
    cycles: AtomicU64,
}

impl MarketAnalyst {
    pub fn new(store: Arc<dyn Store>, bus: MessageBus, limits: Limits) -> Self {
        Self { store, bus, limits, view: Mutex::new(View::default()), cycles: AtomicU64::new(0) }
    }

    fn decide(&self, view: &mut View, cycle: u64) -> Outbox {
        let mut out = Outbox::default();
        let now = Instant::now();
        let mut all_signals = Vec::new();

        for a in &view.assets {
            let reading = TrendReading {
                asset_code: a.code.clone(),
                trend: classify_trend(a.change_pct),
                change_pct: a.change_pct,
                price: a.price,
            };
            if let Some(sig) = signal_for(&reading) {
                view.last_signal.insert(a.code.clone(), sig.clone());
                all_signals.push(sig.clone());
                if sig.action != SignalAction::Hold {
                    let cooling = view
                        .last_emitted
                        .get(&a.code)
                        .is_some_and(|t| now.duration_since(*t) < self.limits.signal_cooldown);
                    if cooling {
                        debug!(asset = %a.code, "signal suppressed by cooldown");
                    } else {
                        view.last_emitted.insert(a.code.clone(), now);
                        match sig.action {
                            SignalAction::Buy => out.buys.push(sig),
                            _ => out.sells.push(sig),
                        }
                    }
                }
            }
            view.trends.insert(a.code.clone(), reading);

            if a.change_pct.abs() > self.limits.risk_threshold_pct
                && view.risk_seen.get(&a.code) != Some(&a.updated_at)
            {
                view.risk_seen.insert(a.code.clone(), a.updated_at);
                out.risks.push((a.code.clone(), a.change_pct));
            }
        }

        if self.limits.report_every > 0 && cycle % self.limits.report_every == 0 {
            let mut trends: Vec<TrendReading> = view.trends.values().cloned().collect();
            trends.sort_by(|a, b| a.asset_code.cmp(&b.asset_code));
            out.report = Some(MarketReport {
                total_assets: view.assets.len(),
                trends,
                signals: all_signals,
                indicators: view.indicators.clone(),
            });
        }
        out
    }

    async fn raise_risk(&self, asset_code: String, change_pct: f64) {
        let text = format!("high volatility on {asset_code}: {change_pct:.2}%");
        match self.store.insert_alert(NewAlert::warning(MARKET_ANALYST, RISK_CATEGORY, text.clone())).await {
            Ok(_) => ALERTS.with_label_values(&[MARKET_ANALYST, RISK_CATEGORY]).inc(),
            Err(e) => warn!(error = %e, asset = %asset_code, "risk alert not persisted"),
        }
        warn!(asset = %asset_code, change_pct, "volatility alert");
        self.bus
            .broadcast(Message::broadcast(
                MARKET_ANALYST,
                Payload::RiskAlert(RiskAlert { category: RISK_CATEGORY.to_string(), asset_code, message: text }),
            ))
            .await;
    }
}

#[async_trait]
impl Agent for MarketAnalyst {
    fn name(&self) -> &str { MARKET_ANALYST }

    async fn perceive(&self) -> Result<(), AgentError> {
        let assets = match self.store.assets().await {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, "market read failed, keeping previous view");
                return Ok(());
            }
        };
        let indicators = match self.store.indicators().await {
            Ok(rows) => Some(rows),
            Err(e) => {
                warn!(error = %e, "indicator read failed, keeping previous values");
                None
            }
        };
        let mut view = self.view.lock().await;
        view.assets = assets;
        if let Some(rows) = indicators {
            view.indicators = rows
                .into_iter()
                .map(|i| IndicatorReading { name: i.name, value: i.value, change_pct: i.change_pct })
                .collect();
        }
        debug!(assets = view.assets.len(), "market perceived");
        Ok(())
    }

    async fn act(&self) -> Result<(), AgentError> {
        let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        let out = {
            let mut view = self.view.lock().await;
            self.decide(&mut view, cycle)
        };

        for s in out.buys.iter().chain(out.sells.iter()) {
            SIGNALS_BY.with_label_values(&[&format!("{:?}", s.action).to_lowercase(), &s.asset_code]).inc();
        }
        if !out.buys.is_empty() {
            info!(count = out.buys.len(), "buy signals");
            self.bus
                .send(Message::direct(
                    MARKET_ANALYST,
                    PORTFOLIO_MANAGER,
                    Payload::BuySignals(SignalBatch { signals: out.buys }),
                ))
                .await;
        }
        if !out.sells.is_empty() {
            info!(count = out.sells.len(), "sell signals");
            self.bus
                .send(Message::direct(
                    MARKET_ANALYST,
                    PORTFOLIO_MANAGER,
                    Payload::SellSignals(SignalBatch { signals: out.sells }),
                ))
                .await;
        }
        for (code, change) in out.risks {
            self.raise_risk(code, change).await;
        }
        if let Some(report) = out.report {
            info!(assets = report.total_assets, signals = report.signals.len(), "market report");
            self.bus.broadcast(Message::broadcast(MARKET_ANALYST, Payload::MarketReport(report))).await;
        }
        Ok(())
    }

    async fn handle_message(&self, message: Message) -> Result<(), AgentError> {
        match message.payload {
            Payload::AnalysisRequest(req) => {
                let reply = {
                    let view = self.view.lock().await;
                    view.assets.iter().find(|a| a.code == req.asset_code).map(|a| TrendAnalysis {
                        asset_code: a.code.clone(),
                        quote: quote_of(a),
                        trend: view.trends.get(&a.code).cloned(),
                        signal: view.last_signal.get(&a.code).cloned(),
                    })
                };
                match reply {
                    Some(analysis) => {
                        self.bus
                            .send(Message::direct(MARKET_ANALYST, &message.sender, Payload::TrendAnalysis(analysis)))
                            .await;
                    }
                    None => warn!(asset = %req.asset_code, from = %message.sender, "analysis requested for unknown asset"),
                }
            }
            other => debug!(kind = other.kind().as_str(), from = %message.sender, "message ignored"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::handler;
    use crate::message::{AnalysisRequest, MessageKind};
    use crate::store::MemoryStore;
    use std::time::Duration;

    type Inbox = Arc<std::sync::Mutex<Vec<Message>>>;

    async fn capture(bus: &MessageBus, name: &str) -> Inbox {
        let inbox: Inbox = Arc::default();
        let sink = inbox.clone();
        bus.subscribe(
            name,
            handler(move |m| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(m);
                    Ok(())
                }
            }),
        )
        .await;
        inbox
    }

    fn signalled(inbox: &Inbox) -> Vec<String> {
        inbox
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| match &m.payload {
                Payload::BuySignals(b) | Payload::SellSignals(b) => Some(b.signals.clone()),
                _ => None,
            })
            .flatten()
            .map(|s| s.asset_code)
            .collect()
    }

    fn setup() -> (Arc<MemoryStore>, MessageBus, MarketAnalyst) {
        let store = Arc::new(MemoryStore::seeded(10_000.0));
        let bus = MessageBus::default();
        let analyst = MarketAnalyst::new(store.clone(), bus.clone(), Limits::default());
        (store, bus, analyst)
    }

    #[test]
    fn trend_thresholds() {
        assert_eq!(classify_trend(2.5), Trend::StrongUp);
        assert_eq!(classify_trend(1.0), Trend::MildUp);
        assert_eq!(classify_trend(0.5), Trend::Sideways);
        assert_eq!(classify_trend(-0.6), Trend::MildDown);
        assert_eq!(classify_trend(-2.5), Trend::StrongDown);
    }

    #[test]
    fn strong_drop_needs_more_than_three_percent_for_a_buy() {
        let mut r = TrendReading { asset_code: "PETR4".into(), trend: Trend::StrongDown, change_pct: -2.5, price: 31.0 };
        assert!(signal_for(&r).is_none());
        r.change_pct = -4.2;
        let s = signal_for(&r).unwrap();
        assert_eq!((s.action, s.strength), (SignalAction::Buy, SignalStrength::Strong));
        assert_eq!(s.reason, "significant drop (-4.20%)");
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_is_per_asset() {
        let (store, bus, analyst) = setup();
        let pm = capture(&bus, PORTFOLIO_MANAGER).await;

        // PETR4 32.50 -> 31.00 (-4.6%)
        store.update_prices(&[("PETR4".into(), 31.0)]).await.unwrap();
        analyst.perceive().await.unwrap();
        analyst.act().await.unwrap();
        assert_eq!(signalled(&pm), vec!["PETR4"]);

        // VALE3 68.90 -> 65.00 (-5.7%) inside PETR4's window
        tokio::time::advance(Duration::from_secs(10)).await;
        store.update_prices(&[("VALE3".into(), 65.0)]).await.unwrap();
        analyst.perceive().await.unwrap();
        analyst.act().await.unwrap();
        assert_eq!(signalled(&pm), vec!["PETR4", "VALE3"]);

        tokio::time::advance(Duration::from_secs(61)).await;
        analyst.act().await.unwrap();
        assert_eq!(signalled(&pm), vec!["PETR4", "VALE3", "PETR4", "VALE3"]);
    }

    #[tokio::test]
    async fn risk_alert_raised_once_per_price_update() {
        let (store, bus, analyst) = setup();
        let wm = capture(&bus, "WalletManager").await;

        store.update_prices(&[("BTC".into(), 265_000.0)]).await.unwrap();
        analyst.perceive().await.unwrap();
        analyst.act().await.unwrap();
        analyst.act().await.unwrap();

        let alerts = store.alerts().await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].category, RISK_CATEGORY);
        let risk_msgs = wm.lock().unwrap().iter().filter(|m| m.kind() == MessageKind::RiskAlert).count();
        assert_eq!(risk_msgs, 1);
        // BTC +6% is also a sell signal for the manager, which is not subscribed here
        assert!(signalled(&wm).is_empty());
    }

    #[tokio::test]
    async fn answers_analysis_requests_for_known_assets_only() {
        let (store, bus, analyst) = setup();
        let pm = capture(&bus, PORTFOLIO_MANAGER).await;
        store.update_prices(&[("ETH".into(), 15_150.0)]).await.unwrap();
        analyst.perceive().await.unwrap();
        analyst.act().await.unwrap();

        let ask = |code: &str| {
            Message::direct(PORTFOLIO_MANAGER, MARKET_ANALYST, Payload::AnalysisRequest(AnalysisRequest { asset_code: code.into() }))
        };
        analyst.handle_message(ask("ETH")).await.unwrap();
        analyst.handle_message(ask("DOGE")).await.unwrap();

        let replies: Vec<TrendAnalysis> = pm
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| match &m.payload {
                Payload::TrendAnalysis(t) => Some(t.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].asset_code, "ETH");
        assert_eq!(replies[0].trend.as_ref().map(|t| t.trend), Some(Trend::MildUp));
        assert!((replies[0].quote.change_pct - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn store_outage_keeps_previous_view() {
        let (store, bus, analyst) = setup();
        let everyone = capture(&bus, "WalletManager").await;
        analyst.perceive().await.unwrap();

        store.set_unavailable(true);
        analyst.perceive().await.unwrap();
        assert_eq!(analyst.view.lock().await.assets.len(), 12);

        // report on the first cycle still carries the cached assets
        let analyst = MarketAnalyst::new(store.clone(), bus.clone(), Limits { report_every: 1, ..Limits::default() });
        store.set_unavailable(false);
        analyst.perceive().await.unwrap();
        store.set_unavailable(true);
        analyst.perceive().await.unwrap();
        analyst.act().await.unwrap();
        let reports: Vec<usize> = everyone
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| match &m.payload {
                Payload::MarketReport(r) => Some(r.total_assets),
                _ => None,
            })
            .collect();
        assert_eq!(reports, vec![12]);
    }
}
