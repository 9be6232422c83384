// ===============================
// tests/negotiation.rs
// ===============================
//
// End-to-end negotiation through the public API: agents wired on one bus,
// cycles driven by hand, bus traffic observed through the recorder channel.
//
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use sma_portfolio::agent::{Agent, AgentRunner};
use sma_portfolio::analyst::{MarketAnalyst, RISK_CATEGORY};
use sma_portfolio::bus::MessageBus;
use sma_portfolio::config::Limits;
use sma_portfolio::domain::{default_targets, Event, Severity, TradeSide};
use sma_portfolio::message::{
    AuthorizationRequest, AuthorizationResponse, DenialReason, Message, MessageKind, Payload,
    PORTFOLIO_MANAGER, WALLET_MANAGER,
};
use sma_portfolio::portfolio::{PlannedOp, PortfolioManager};
use sma_portfolio::simulator;
use sma_portfolio::store::{sample_assets, MemoryStore, Store};
use sma_portfolio::wallet::WalletManager;
use tokio::sync::mpsc;

struct Harness {
    store: Arc<MemoryStore>,
    bus: MessageBus,
    journal: mpsc::Receiver<Event>,
    analyst: Arc<MarketAnalyst>,
    wallet: Arc<WalletManager>,
    portfolio: Arc<PortfolioManager>,
    _runners: Vec<AgentRunner>,
}

impl Harness {
    async fn new(store: MemoryStore) -> Self {
        let store = Arc::new(store);
        let shared: Arc<dyn Store> = store.clone();
        let (tx, journal) = mpsc::channel(100_000);
        let bus = MessageBus::new(Some(tx));
        let limits = Limits::default();

        let analyst = Arc::new(MarketAnalyst::new(shared.clone(), bus.clone(), limits.clone()));
        let wallet = Arc::new(WalletManager::new(shared.clone(), bus.clone(), limits.clone()));
        let portfolio = Arc::new(PortfolioManager::new(shared, bus.clone(), limits));

        let agents: [Arc<dyn Agent>; 3] = [analyst.clone(), wallet.clone(), portfolio.clone()];
        let mut runners = Vec::new();
        for a in agents {
            let r = AgentRunner::new(a, bus.clone(), Duration::from_secs(1));
            r.start().await.unwrap();
            runners.push(r);
        }
        Self { store, bus, journal, analyst, wallet, portfolio, _runners: runners }
    }

    async fn cycle(&self) {
        for a in [self.wallet.clone() as Arc<dyn Agent>, self.analyst.clone(), self.portfolio.clone()] {
            a.perceive().await.unwrap();
            a.act().await.unwrap();
        }
    }

    fn drain(&mut self) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(ev) = self.journal.try_recv() {
            if let Event::Msg(m) = ev {
                out.push(m);
            }
        }
        out
    }
}

fn responses(msgs: &[Message]) -> Vec<AuthorizationResponse> {
    msgs.iter()
        .filter_map(|m| match &m.payload {
            Payload::BuyAuthorization(r) | Payload::SellAuthorization(r) => Some(r.clone()),
            _ => None,
        })
        .collect()
}

fn raw_request(side: TradeSide, value: f64) -> Message {
    Message::direct(
        PORTFOLIO_MANAGER,
        WALLET_MANAGER,
        Payload::AuthorizationRequest(AuthorizationRequest {
            proposal_id: format!("PR-raw-{value}"),
            side,
            asset_code: "PETR4".into(),
            value,
            quantity: Some(1.0),
            reason: "manual".into(),
        }),
    )
}

fn small_store(cash: f64) -> MemoryStore {
    MemoryStore::new().with_wallet(cash).with_assets(sample_assets()).with_targets(default_targets())
}

#[tokio::test]
async fn buy_above_balance_is_denied_without_transaction() {
    let mut h = Harness::new(small_store(1000.0)).await;
    h.bus.send(raw_request(TradeSide::Buy, 1500.0)).await;

    let r = responses(&h.drain());
    assert_eq!(r.len(), 1);
    assert!(!r[0].authorized);
    assert_eq!(r[0].denial, Some(DenialReason::InsufficientFunds));
    assert!(h.store.recent_transactions(10).await.unwrap().is_empty());
    assert_eq!(h.store.wallet().await.unwrap().unwrap().available_cash, 1000.0);
}

#[tokio::test]
async fn buy_within_balance_is_committed() {
    let mut h = Harness::new(small_store(1000.0)).await;
    h.portfolio
        .propose(PlannedOp {
            side: TradeSide::Buy,
            asset_code: "PETR4".into(),
            value: 500.0,
            quantity: None,
            reason: "test".into(),
        })
        .await
        .unwrap();

    let r = responses(&h.drain());
    assert_eq!(r.len(), 1);
    assert!(r[0].authorized);
    let txs = h.store.recent_transactions(10).await.unwrap();
    assert_eq!(txs.len(), 1);
    assert_eq!(txs[0].side, TradeSide::Buy);
    assert_eq!(txs[0].total_value, 500.0);
    assert_eq!(h.store.wallet().await.unwrap().unwrap().available_cash, 500.0);
    assert_eq!(h.portfolio.pending_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn strong_drop_signals_once_per_cooldown() {
    let mut h = Harness::new(small_store(0.0)).await;
    h.store.update_prices(&[("PETR4".into(), 32.5 * 0.965)]).await.unwrap();

    h.analyst.perceive().await.unwrap();
    h.analyst.act().await.unwrap();
    tokio::time::advance(Duration::from_secs(10)).await;
    h.analyst.perceive().await.unwrap();
    h.analyst.act().await.unwrap();

    let signals: Vec<_> = h
        .drain()
        .into_iter()
        .filter_map(|m| match m.payload {
            Payload::BuySignals(b) => Some(b.signals),
            _ => None,
        })
        .flatten()
        .filter(|s| s.asset_code == "PETR4")
        .collect();
    assert_eq!(signals.len(), 1);
    assert!(signals[0].reason.contains("-3.50"));
}

#[tokio::test]
async fn crypto_spike_raises_persisted_warning_and_broadcast() {
    let mut h = Harness::new(small_store(0.0)).await;
    h.store.update_prices(&[("BTC".into(), 265_000.0)]).await.unwrap();
    h.analyst.perceive().await.unwrap();
    h.analyst.act().await.unwrap();

    let alerts = h.store.alerts().await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].category, RISK_CATEGORY);
    assert_eq!(alerts[0].severity, Severity::Warning);

    let risk: Vec<Message> = h.drain().into_iter().filter(|m| m.kind() == MessageKind::RiskAlert).collect();
    // one delivery per other agent, none back to the analyst
    assert_eq!(risk.len(), 2);
    assert!(risk.iter().all(|m| m.receiver.is_none()));
}

#[tokio::test]
async fn sell_is_always_authorized() {
    let mut h = Harness::new(small_store(10.0)).await;
    h.bus.send(raw_request(TradeSide::Sell, 1_000_000.0)).await;
    let r = responses(&h.drain());
    assert_eq!(r.len(), 1);
    assert!(r[0].authorized);
    assert!(r[0].denial.is_none());
}

#[tokio::test(start_paused = true)]
async fn every_transaction_follows_an_authorization_and_cash_stays_positive() {
    let mut h = Harness::new(MemoryStore::seeded(50_000.0)).await;
    let mut rng = StdRng::seed_from_u64(2024);
    let mut msgs = Vec::new();

    for _ in 0..40 {
        simulator::tick_with(h.store.as_ref(), &mut rng).await.unwrap();
        h.cycle().await;
        let w = h.store.wallet().await.unwrap().unwrap();
        assert!(w.available_cash >= 0.0, "cash went negative: {}", w.available_cash);
        msgs.extend(h.drain());
        tokio::time::advance(Duration::from_secs(31)).await;
    }

    let mut granted: Vec<AuthorizationResponse> = responses(&msgs).into_iter().filter(|r| r.authorized).collect();
    let mut txs = h.store.recent_transactions(usize::MAX).await.unwrap();
    txs.reverse();
    assert!(!txs.is_empty());
    for tx in &txs {
        let pos = granted.iter().position(|r| {
            r.request.side == tx.side
                && r.request.asset_code == tx.asset_code
                && match tx.side {
                    TradeSide::Buy => (r.request.value - tx.total_value).abs() < 1e-6,
                    TradeSide::Sell => r.request.quantity.is_some_and(|q| q >= tx.quantity - 1e-9),
                }
        });
        let pos = pos.unwrap_or_else(|| panic!("transaction {} has no authorization", tx.id));
        granted.remove(pos);
    }

    // wallet total stays consistent with positions
    let w = h.store.revalue_wallet().await.unwrap().unwrap();
    let held: f64 = h.store.positions().await.unwrap().iter().map(|p| p.market_value).sum();
    assert!((w.total_value - (w.available_cash + held)).abs() < 1e-6);
}
