// ===============================
// src/portfolio.rs
// ===============================
//
// PortfolioManager: keeps the class distribution near its targets and reacts
// to analyst signals. Every trade goes through two phases:
//
//   propose : register pending proposal (id) -> solicitacao_autorizacao to WalletManager
//   commit  : autorizacao_* with the same id and authorized=true -> Store::apply_trade
//             -> operacao_executada
//
// Proposals left unanswered longer than authorization_timeout are dropped.
//
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentError};
use crate::bus::MessageBus;
use crate::config::Limits;
use crate::domain::{Asset, AssetClass, DiversificationTarget, NewAlert, Position, TradeCommand, TradeSide, Wallet};
use crate::message::{
    AnalysisRequest, AuthorizationRequest, AuthorizationResponse, ClassAllocation, Distribution,
    ExecutedOperation, Message, Payload, PortfolioReport, Signal, TrendAnalysis, MARKET_ANALYST,
    PORTFOLIO_MANAGER, WALLET_MANAGER,
};
use crate::metrics::{ALERTS, EXPIRED_PROPOSALS, PENDING_PROPOSALS, TRANSACTIONS};
use crate::store::Store;

pub const LOG_TARGET: &str = module_path!();
pub const DIVERSIFICATION_CATEGORY: &str = "diversificacao_desbalanceada";

const ALERT_DEDUP_SECS: i64 = 60;
const EMPTY_PORTFOLIO_OPS: usize = 5;
const SIGNAL_MIN_CASH: f64 = 1000.0;
const SIGNAL_BUY_CAP: f64 = 1000.0;
const SIGNAL_BUY_FRACTION: f64 = 0.10;
const SIGNAL_SELL_FRACTION: f64 = 0.05;
// below this a buy is dropped instead of shrunk to the available cash
const MIN_CASH_TO_ADJUST: f64 = 100.0;

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedOp {
    pub side: TradeSide,
    pub asset_code: String,
    /// Buy: cash to spend. Sell: estimated proceeds.
    pub value: f64,
    pub quantity: Option<f64>,
    pub reason: String,
}

/// Value and share of each class; `total` is the wallet total (cash included).
pub fn distribution(positions: &[Position], wallet: Wallet) -> Distribution {
    let total = wallet.total_value;
    let by_class = AssetClass::ALL
        .iter()
        .map(|&class| {
            let value: f64 = positions.iter().filter(|p| p.class == class).map(|p| p.market_value).sum();
            let percent = if total > 0.0 { value / total * 100.0 } else { 0.0 };
            ClassAllocation { class, value, percent }
        })
        .collect();
    Distribution { by_class, cash: wallet.available_cash, total }
}

/// Classes off target by more than their tolerance, with the signed gap (target - current).
pub fn off_target(dist: &Distribution, targets: &[DiversificationTarget]) -> Vec<(AssetClass, f64)> {
    targets
        .iter()
        .filter_map(|t| {
            let diff = t.target_pct - dist.percent_of(t.class);
            (diff.abs() > t.tolerance_pct).then_some((t.class, diff))
        })
        .collect()
}

/// Pure rebalancing plan. Buys never add up to more than `cash`.
pub fn plan_rebalance(
    dist: &Distribution,
    targets: &[DiversificationTarget],
    positions: &[Position],
    assets: &[Asset],
    min_trade_value: f64,
    max_ops: usize,
) -> Vec<PlannedOp> {
    let base = if positions.is_empty() { dist.cash } else { dist.total };
    let mut cash_left = dist.cash;
    let mut ops = Vec::new();

    for (class, diff) in off_target(dist, targets) {
        if ops.len() >= max_ops {
            break;
        }
        let amount = diff.abs() / 100.0 * base;
        if diff > 0.0 {
            let Some(asset) = assets.iter().find(|a| a.class == class) else { continue };
            let value = amount.min(cash_left);
            if value > min_trade_value {
                cash_left -= value;
                ops.push(PlannedOp {
                    side: TradeSide::Buy,
                    asset_code: asset.code.clone(),
                    value,
                    quantity: None,
                    reason: format!("rebalance {class}: {diff:+.2}% below target"),
                });
            }
        } else {
            let Some(pos) = positions.iter().find(|p| p.class == class && p.quantity > 0.0) else { continue };
            let Some(price) = assets.iter().find(|a| a.code == pos.asset_code).map(|a| a.price) else { continue };
            if price <= 0.0 {
                continue;
            }
            let quantity = pos.quantity.min(amount / price);
            let value = quantity * price;
            if value >= min_trade_value {
                ops.push(PlannedOp {
                    side: TradeSide::Sell,
                    asset_code: pos.asset_code.clone(),
                    value,
                    quantity: Some(quantity),
                    reason: format!("rebalance {class}: {:.2}% above target", -diff),
                });
            }
        }
    }
    ops
}

fn new_proposal_id() -> String {
    let now = Utc::now().timestamp_nanos_opt().unwrap_or(0);
    format!("PR-{}-{}", now, rand::thread_rng().gen::<u32>())
}

struct Pending { request: AuthorizationRequest, created: Instant }

#[derive(Default)]
struct Book {
    targets: Vec<DiversificationTarget>,
    distribution: Distribution,
    positions: usize,
    pending: HashMap<String, Pending>,
    last_operation: Option<Instant>,
    // per-asset spacing of signal-driven trades
    asset_ops: HashMap<String, Instant>,
    analyses: HashMap<String, TrendAnalysis>,
}

pub struct PortfolioManager {
    store: Arc<dyn Store>,
    bus: MessageBus,
    limits: Limits,
    book: Mutex<Book>,
    cycles: AtomicU64,
}

impl PortfolioManager {
    pub fn new(store: Arc<dyn Store>, bus: MessageBus, limits: Limits) -> Self {
        Self { store, bus, limits, book: Mutex::new(Book::default()), cycles: AtomicU64::new(0) }
    }

    pub async fn pending_count(&self) -> usize { self.book.lock().await.pending.len() }

    /// Latest analyst reply for `asset_code`, if any.
    pub async fn analysis(&self, asset_code: &str) -> Option<TrendAnalysis> {
        self.book.lock().await.analyses.get(asset_code).cloned()
    }

    /// Signal reason, tagged with the last known trend of the asset.
    async fn signal_reason(&self, signal: &Signal) -> String {
        match self.analysis(&signal.asset_code).await.and_then(|a| a.trend) {
            Some(t) => format!("{} [trend {}, {:+.2}%]", signal.reason, t.trend.as_str(), t.change_pct),
            None => signal.reason.clone(),
        }
    }

    async fn in_cooldown(&self, asset_code: &str) -> bool {
        let book = self.book.lock().await;
        book.asset_ops.get(asset_code).is_some_and(|t| t.elapsed() < self.limits.operation_cooldown)
    }

    async fn cash(&self) -> Result<f64, AgentError> {
        match self.store.wallet().await? {
            Some(w) => Ok(w.available_cash),
            None => Err(AgentError::WalletMissing),
        }
    }

    /// Phase one: register the proposal and ask the WalletManager.
    pub async fn propose(&self, op: PlannedOp) -> Result<(), AgentError> {
        let mut value = op.value;
        if op.side == TradeSide::Buy {
            let cash = self.cash().await?;
            if value > cash {
                if cash > MIN_CASH_TO_ADJUST {
                    info!(asset = %op.asset_code, wanted = value, cash, "buy reduced to available cash");
                    value = cash;
                } else {
                    info!(asset = %op.asset_code, wanted = value, cash, "buy dropped, not enough cash");
                    return Ok(());
                }
            }
        }
        let request = AuthorizationRequest {
            proposal_id: new_proposal_id(),
            side: op.side,
            asset_code: op.asset_code,
            value,
            quantity: op.quantity,
            reason: op.reason,
        };
        {
            let mut book = self.book.lock().await;
            book.pending
                .insert(request.proposal_id.clone(), Pending { request: request.clone(), created: Instant::now() });
            PENDING_PROPOSALS.set(book.pending.len() as i64);
        }
        info!(proposal = %request.proposal_id, side = request.side.as_str(), asset = %request.asset_code, value, "authorization requested");
        self.bus
            .send(Message::direct(PORTFOLIO_MANAGER, WALLET_MANAGER, Payload::AuthorizationRequest(request)))
            .await;
        Ok(())
    }

    /// Phase two: match the response to its proposal and commit when authorized.
    async fn on_authorization(&self, response: AuthorizationResponse) -> Result<(), AgentError> {
        let id = response.request.proposal_id.clone();
        let pending = {
            let mut book = self.book.lock().await;
            match book.pending.get(&id).map(|p| p.request == response.request) {
                None => None,
                Some(false) => {
                    warn!(proposal = %id, "response does not echo the proposal, ignored");
                    return Ok(());
                }
                Some(true) => {
                    let p = book.pending.remove(&id);
                    PENDING_PROPOSALS.set(book.pending.len() as i64);
                    p
                }
            }
        };
        let Some(pending) = pending else {
            warn!(proposal = %id, "response for unknown or expired proposal ignored");
            return Ok(());
        };
        if !response.authorized {
            info!(
                proposal = %id,
                reason = response.denial.map(|d| d.as_str()).unwrap_or("unspecified"),
                "proposal denied"
            );
            return Ok(());
        }

        let req = pending.request;
        let cmd = match (req.side, req.quantity) {
            (TradeSide::Buy, _) => TradeCommand::Buy { asset_code: req.asset_code.clone(), value: req.value },
            (TradeSide::Sell, Some(quantity)) => TradeCommand::Sell { asset_code: req.asset_code.clone(), quantity },
            (TradeSide::Sell, None) => {
                warn!(proposal = %id, "sell proposal without quantity");
                return Ok(());
            }
        };
        let tx = match self.store.apply_trade(cmd).await {
            Ok(tx) => tx,
            Err(e) => {
                warn!(proposal = %id, error = %e, "trade rejected by store");
                return Ok(());
            }
        };
        TRANSACTIONS.with_label_values(&[tx.side.as_str()]).inc();
        {
            let now = Instant::now();
            let mut book = self.book.lock().await;
            book.last_operation = Some(now);
            book.asset_ops.insert(tx.asset_code.clone(), now);
        }
        info!(proposal = %id, tx = tx.id, side = tx.side.as_str(), asset = %tx.asset_code, qty = tx.quantity, value = tx.total_value, "operation executed");
        self.bus.publish(Message::broadcast(
            PORTFOLIO_MANAGER,
            Payload::OperationExecuted(ExecutedOperation {
                transaction_id: tx.id,
                side: tx.side,
                asset_code: tx.asset_code,
                quantity: tx.quantity,
                value: tx.total_value,
            }),
        ));
        Ok(())
    }

    async fn expire_pending(&self) {
        let timeout = self.limits.authorization_timeout;
        let mut book = self.book.lock().await;
        book.pending.retain(|id, p| {
            let alive = p.created.elapsed() < timeout;
            if !alive {
                EXPIRED_PROPOSALS.inc();
                warn!(proposal = %id, asset = %p.request.asset_code, "authorization timed out, proposal dropped");
            }
            alive
        });
        PENDING_PROPOSALS.set(book.pending.len() as i64);
    }

    async fn flag_imbalances(&self, gaps: &[(AssetClass, f64)], dist: &Distribution, targets: &[DiversificationTarget]) -> Result<(), AgentError> {
        if gaps.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let recent = self.store.alerts().await?;
        for (class, _) in gaps {
            let label = class.label();
            let seen = recent.iter().any(|a| {
                a.origin == PORTFOLIO_MANAGER
                    && a.category == DIVERSIFICATION_CATEGORY
                    && a.message.starts_with(label)
                    && (now - a.timestamp).num_seconds() < ALERT_DEDUP_SECS
            });
            if seen {
                continue;
            }
            let target = targets.iter().find(|t| t.class == *class);
            let text = format!(
                "{label} at {:.2}% vs target {:.2}% (tolerance {:.2})",
                dist.percent_of(*class),
                target.map(|t| t.target_pct).unwrap_or(0.0),
                target.map(|t| t.tolerance_pct).unwrap_or(0.0),
            );
            warn!(class = label, "{text}");
            self.store.insert_alert(NewAlert::warning(PORTFOLIO_MANAGER, DIVERSIFICATION_CATEGORY, text)).await?;
            ALERTS.with_label_values(&[PORTFOLIO_MANAGER, DIVERSIFICATION_CATEGORY]).inc();
        }
        Ok(())
    }

    async fn execute(&self, ops: Vec<PlannedOp>) {
        for op in ops {
            let asset = op.asset_code.clone();
            if let Err(e) = self.propose(op).await {
                warn!(asset = %asset, error = %e, "proposal failed");
            }
        }
    }

    async fn on_buy_signals(&self, signals: Vec<Signal>) -> Result<(), AgentError> {
        for s in signals {
            if self.in_cooldown(&s.asset_code).await {
                debug!(asset = %s.asset_code, "buy signal ignored, asset in cooldown");
            } else {
                let cash = self.cash().await?;
                if cash > SIGNAL_MIN_CASH {
                    let value = SIGNAL_BUY_CAP.min(cash * SIGNAL_BUY_FRACTION);
                    let reason = self.signal_reason(&s).await;
                    self.book.lock().await.asset_ops.insert(s.asset_code.clone(), Instant::now());
                    self.propose(PlannedOp { side: TradeSide::Buy, asset_code: s.asset_code.clone(), value, quantity: None, reason })
                    .await?;
                } else {
                    debug!(asset = %s.asset_code, cash, "buy signal ignored, cash too low");
                }
            }
            self.request_analysis(&s.asset_code).await;
        }
        Ok(())
    }

    async fn on_sell_signals(&self, signals: Vec<Signal>) -> Result<(), AgentError> {
        let positions = self.store.positions().await?;
        for s in signals {
            if self.in_cooldown(&s.asset_code).await {
                debug!(asset = %s.asset_code, "sell signal ignored, asset in cooldown");
                self.request_analysis(&s.asset_code).await;
                continue;
            }
            match positions.iter().find(|p| p.asset_code == s.asset_code && p.quantity > 0.0) {
                Some(p) => {
                    let quantity = p.quantity * SIGNAL_SELL_FRACTION;
                    let value = p.market_value * SIGNAL_SELL_FRACTION;
                    if value >= self.limits.min_trade_value {
                        let reason = self.signal_reason(&s).await;
                        self.book.lock().await.asset_ops.insert(s.asset_code.clone(), Instant::now());
                        self.propose(PlannedOp {
                            side: TradeSide::Sell,
                            asset_code: s.asset_code.clone(),
                            value,
                            quantity: Some(quantity),
                            reason,
                        })
                        .await?;
                    } else {
                        debug!(asset = %s.asset_code, value, "sell signal ignored, slice too small");
                    }
                }
                None => debug!(asset = %s.asset_code, "sell signal ignored, no position"),
            }
            self.request_analysis(&s.asset_code).await;
        }
        Ok(())
    }

    async fn request_analysis(&self, asset_code: &str) {
        self.bus
            .send(Message::direct(
                PORTFOLIO_MANAGER,
                MARKET_ANALYST,
                Payload::AnalysisRequest(AnalysisRequest { asset_code: asset_code.to_string() }),
            ))
            .await;
    }
}

#[async_trait]
impl Agent for PortfolioManager {
    fn name(&self) -> &str { PORTFOLIO_MANAGER }

    async fn perceive(&self) -> Result<(), AgentError> {
        let targets = self.store.targets().await;
        let snapshot = match (self.store.positions().await, self.store.wallet().await) {
            (Ok(p), Ok(Some(w))) => Some((distribution(&p, w), p.len())),
            (Ok(_), Ok(None)) => return Err(AgentError::WalletMissing),
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "portfolio read failed, keeping previous distribution");
                None
            }
        };
        let mut book = self.book.lock().await;
        match targets {
            Ok(t) => book.targets = t,
            Err(e) => warn!(error = %e, "target read failed, keeping previous targets"),
        }
        if let Some((dist, n)) = snapshot {
            book.distribution = dist;
            book.positions = n;
        }
        Ok(())
    }

    async fn act(&self) -> Result<(), AgentError> {
        let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        let wallet = self.store.revalue_wallet().await?.ok_or(AgentError::WalletMissing)?;
        self.expire_pending().await;

        let positions = self.store.positions().await?;
        let assets = self.store.assets().await?;
        let dist = distribution(&positions, wallet);
        let (targets, last_operation) = {
            let mut book = self.book.lock().await;
            book.distribution = dist.clone();
            book.positions = positions.len();
            (book.targets.clone(), book.last_operation)
        };

        if positions.is_empty() {
            if wallet.available_cash > self.limits.min_trade_value {
                let ops = plan_rebalance(&dist, &targets, &positions, &assets, self.limits.min_trade_value, EMPTY_PORTFOLIO_OPS);
                if !ops.is_empty() {
                    info!(ops = ops.len(), cash = wallet.available_cash, "empty portfolio, initial allocation");
                    self.book.lock().await.last_operation = Some(Instant::now());
                    self.execute(ops).await;
                }
            }
        } else {
            let gaps = off_target(&dist, &targets);
            self.flag_imbalances(&gaps, &dist, &targets).await?;
            let cooled = last_operation.map_or(true, |t| t.elapsed() >= self.limits.operation_cooldown);
            if !gaps.is_empty() && cooled {
                let max_ops = if wallet.available_cash > 0.8 * wallet.total_value { 3 } else { 1 };
                let ops = plan_rebalance(&dist, &targets, &positions, &assets, self.limits.min_trade_value, max_ops);
                if !ops.is_empty() {
                    info!(ops = ops.len(), "rebalancing");
                    self.book.lock().await.last_operation = Some(Instant::now());
                    self.execute(ops).await;
                }
            }
        }

        if self.limits.report_every > 0 && cycle % self.limits.report_every == 0 {
            let (dist, positions, pending) = {
                let book = self.book.lock().await;
                (book.distribution.clone(), book.positions, book.pending.len())
            };
            info!(total = dist.total, cash = dist.cash, positions, pending, "portfolio distribution");
            self.bus.publish(Message::broadcast(PORTFOLIO_MANAGER, Payload::PortfolioDistribution(dist.clone())));
            self.bus
                .send(Message::direct(
                    PORTFOLIO_MANAGER,
                    WALLET_MANAGER,
                    Payload::PortfolioReport(PortfolioReport { distribution: dist, positions, pending_proposals: pending }),
                ))
                .await;
        }
        Ok(())
    }

    async fn handle_message(&self, message: Message) -> Result<(), AgentError> {
        let sender = message.sender;
        match message.payload {
            Payload::BuySignals(batch) => self.on_buy_signals(batch.signals).await?,
            Payload::SellSignals(batch) => self.on_sell_signals(batch.signals).await?,
            Payload::BuyAuthorization(r) | Payload::SellAuthorization(r) => self.on_authorization(r).await?,
            Payload::TrendAnalysis(analysis) => {
                debug!(asset = %analysis.asset_code, "analysis cached");
                self.book.lock().await.analyses.insert(analysis.asset_code.clone(), analysis);
            }
            Payload::LiquidityAlert(a) => warn!(from = %sender, balance = a.balance, minimum = a.minimum, "liquidity alert received"),
            Payload::RiskAlert(a) => warn!(from = %sender, asset = %a.asset_code, "{}", a.message),
            other => debug!(kind = other.kind().as_str(), from = %sender, "message ignored"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::default_targets;
    use crate::message::{DenialReason, Quote, SignalAction, SignalBatch, SignalStrength, Trend, TrendReading};
    use crate::store::{sample_assets, MemoryStore};
    use crate::wallet::WalletManager;
    use std::time::Duration;

    fn wallet(cash: f64, total: f64) -> Wallet { Wallet { available_cash: cash, total_value: total } }

    fn position(code: &str, class: AssetClass, quantity: f64, price: f64) -> Position {
        Position {
            asset_code: code.into(),
            class,
            quantity,
            average_cost: price,
            cost_basis: quantity * price,
            market_value: quantity * price,
        }
    }

    fn buy_signal(code: &str) -> Message {
        Message::direct(
            MARKET_ANALYST,
            PORTFOLIO_MANAGER,
            Payload::BuySignals(SignalBatch {
                signals: vec![Signal {
                    asset_code: code.into(),
                    action: SignalAction::Buy,
                    strength: SignalStrength::Strong,
                    reason: "significant drop (-4.00%)".into(),
                }],
            }),
        )
    }

    fn sell_signal(code: &str) -> Message {
        Message::direct(
            MARKET_ANALYST,
            PORTFOLIO_MANAGER,
            Payload::SellSignals(SignalBatch {
                signals: vec![Signal {
                    asset_code: code.into(),
                    action: SignalAction::Sell,
                    strength: SignalStrength::Strong,
                    reason: "significant rise (+4.00%)".into(),
                }],
            }),
        )
    }

    async fn wired(cash: f64) -> (Arc<MemoryStore>, MessageBus, Arc<PortfolioManager>) {
        let store = Arc::new(MemoryStore::seeded(cash));
        let bus = MessageBus::default();
        let pm = Arc::new(PortfolioManager::new(store.clone(), bus.clone(), Limits::default()));
        let wm = Arc::new(WalletManager::new(store.clone(), bus.clone(), Limits::default()));
        for (name, agent) in [(PORTFOLIO_MANAGER, pm.clone() as Arc<dyn Agent>), (WALLET_MANAGER, wm as Arc<dyn Agent>)] {
            bus.subscribe(
                name,
                crate::bus::handler(move |m| {
                    let agent = agent.clone();
                    async move { agent.handle_message(m).await }
                }),
            )
            .await;
        }
        (store, bus, pm)
    }

    #[test]
    fn empty_portfolio_plan_follows_targets_on_cash() {
        let dist = distribution(&[], wallet(10_000.0, 10_000.0));
        let ops = plan_rebalance(&dist, &default_targets(), &[], &sample_assets(), 100.0, 5);
        let summary: Vec<(&str, f64)> = ops.iter().map(|o| (o.asset_code.as_str(), o.value)).collect();
        assert_eq!(summary.len(), 4);
        let expected = [("PETR4", 4000.0), ("CDB001", 3000.0), ("BTC", 2000.0), ("FUND001", 1000.0)];
        for ((code, value), (ecode, evalue)) in summary.iter().zip(expected) {
            assert_eq!(*code, ecode);
            assert!((value - evalue).abs() < 1e-6);
        }
        assert!(ops.iter().all(|o| o.side == TradeSide::Buy));
    }

    #[test]
    fn overweight_class_sells_first_position() {
        // equity 80% of a 10 000 portfolio, nothing else
        let positions = vec![position("PETR4", AssetClass::Equity, 200.0, 32.5), position("VALE3", AssetClass::Equity, 21.0, 68.9)];
        let equity: f64 = positions.iter().map(|p| p.market_value).sum();
        let dist = distribution(&positions, wallet(10_000.0 - equity, 10_000.0));
        let ops = plan_rebalance(&dist, &default_targets(), &positions, &sample_assets(), 100.0, 5);
        let sell = ops.iter().find(|o| o.side == TradeSide::Sell).unwrap();
        assert_eq!(sell.asset_code, "PETR4");
        let over = equity / 10_000.0 * 100.0 - 40.0;
        let expected_qty = (over / 100.0 * 10_000.0 / 32.5).min(200.0);
        assert!((sell.quantity.unwrap() - expected_qty).abs() < 1e-9);
    }

    #[test]
    fn small_gaps_and_max_ops_are_respected() {
        let dist = distribution(&[], wallet(150.0, 150.0));
        // 10% of 150 for Fund is below the minimum trade value
        let ops = plan_rebalance(&dist, &default_targets(), &[], &sample_assets(), 100.0, 5);
        assert!(ops.iter().all(|o| o.asset_code != "FUND001"));
        let dist = distribution(&[], wallet(10_000.0, 10_000.0));
        assert_eq!(plan_rebalance(&dist, &default_targets(), &[], &sample_assets(), 100.0, 1).len(), 1);
    }

    #[tokio::test]
    async fn initial_allocation_commits_only_authorized_trades() {
        let (store, _bus, pm) = wired(10_000.0).await;
        pm.perceive().await.unwrap();
        pm.act().await.unwrap();

        let txs = store.recent_transactions(10).await.unwrap();
        assert_eq!(txs.len(), 4);
        let w = store.wallet().await.unwrap().unwrap();
        assert!(w.available_cash >= 0.0);
        assert!(w.available_cash < 1.0);
        assert_eq!(pm.pending_count().await, 0);
    }

    #[tokio::test]
    async fn buy_signal_respects_cash_floor() {
        let (store, _bus, pm) = wired(900.0).await;
        pm.handle_message(buy_signal("PETR4")).await.unwrap();
        assert!(store.recent_transactions(10).await.unwrap().is_empty());

        let (store, _bus, pm) = wired(5000.0).await;
        pm.handle_message(buy_signal("PETR4")).await.unwrap();
        let txs = store.recent_transactions(10).await.unwrap();
        assert_eq!(txs.len(), 1);
        assert!((txs[0].total_value - 500.0).abs() < 1e-9);

        // second signal inside the operation cooldown is ignored
        pm.handle_message(buy_signal("PETR4")).await.unwrap();
        assert_eq!(store.recent_transactions(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_or_denied_responses_never_trade() {
        let (store, _bus, pm) = wired(5000.0).await;
        let request = AuthorizationRequest {
            proposal_id: "PR-forged".into(),
            side: TradeSide::Buy,
            asset_code: "VALE3".into(),
            value: 1000.0,
            quantity: None,
            reason: "forged".into(),
        };
        let forged = Message::direct(
            WALLET_MANAGER,
            PORTFOLIO_MANAGER,
            Payload::BuyAuthorization(AuthorizationResponse { request: request.clone(), authorized: true, denial: None }),
        );
        pm.handle_message(forged).await.unwrap();
        assert!(store.recent_transactions(10).await.unwrap().is_empty());

        // a proposal above cash that the wallet will refuse
        let bus_only = MessageBus::default();
        let lone = PortfolioManager::new(store.clone(), bus_only, Limits::default());
        lone.propose(PlannedOp { side: TradeSide::Buy, asset_code: "VALE3".into(), value: 400.0, quantity: None, reason: "t".into() })
            .await
            .unwrap();
        let id = lone.book.lock().await.pending.keys().next().cloned().unwrap();
        let pending_req = lone.book.lock().await.pending[&id].request.clone();
        lone.on_authorization(AuthorizationResponse {
            request: pending_req,
            authorized: false,
            denial: Some(DenialReason::InsufficientFunds),
        })
        .await
        .unwrap();
        assert_eq!(lone.pending_count().await, 0);
        assert!(store.recent_transactions(10).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_proposals_expire() {
        let store = Arc::new(MemoryStore::seeded(5000.0));
        // no WalletManager on this bus: requests go unanswered
        let pm = PortfolioManager::new(store.clone(), MessageBus::default(), Limits::default());
        pm.handle_message(buy_signal("ITUB4")).await.unwrap();
        assert_eq!(pm.pending_count().await, 1);
        let late = {
            let book = pm.book.lock().await;
            book.pending.values().next().map(|p| p.request.clone()).unwrap()
        };

        tokio::time::advance(Duration::from_secs(31)).await;
        pm.expire_pending().await;
        assert_eq!(pm.pending_count().await, 0);

        pm.on_authorization(AuthorizationResponse { request: late, authorized: true, denial: None }).await.unwrap();
        assert!(store.recent_transactions(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn imbalance_alert_is_deduplicated() {
        let (store, _bus, pm) = wired(10_000.0).await;
        store.apply_trade(TradeCommand::Buy { asset_code: "BTC".into(), value: 9000.0 }).await.unwrap();
        pm.perceive().await.unwrap();
        pm.act().await.unwrap();
        pm.act().await.unwrap();
        let crypto_alerts = store
            .alerts()
            .await
            .unwrap()
            .into_iter()
            .filter(|a| a.category == DIVERSIFICATION_CATEGORY && a.message.starts_with("Crypto"))
            .count();
        assert_eq!(crypto_alerts, 1);
    }

    #[tokio::test]
    async fn sell_signal_sells_a_slice_once_per_cooldown() {
        let (store, _bus, pm) = wired(50_000.0).await;
        store.apply_trade(TradeCommand::Buy { asset_code: "PETR4".into(), value: 40_000.0 }).await.unwrap();
        let held = store.positions().await.unwrap()[0].quantity;

        pm.handle_message(sell_signal("PETR4")).await.unwrap();
        pm.handle_message(sell_signal("PETR4")).await.unwrap();

        let sells: Vec<_> = store
            .recent_transactions(10)
            .await
            .unwrap()
            .into_iter()
            .filter(|t| t.side == TradeSide::Sell)
            .collect();
        assert_eq!(sells.len(), 1);
        assert!((sells[0].quantity - held * SIGNAL_SELL_FRACTION).abs() < 1e-9);
    }

    #[tokio::test]
    async fn sell_signal_without_position_or_with_small_slice_is_ignored() {
        let (store, _bus, pm) = wired(50_000.0).await;
        pm.handle_message(sell_signal("VALE3")).await.unwrap();

        // 5% of 1 000 is below the minimum trade value
        store.apply_trade(TradeCommand::Buy { asset_code: "ITUB4".into(), value: 1000.0 }).await.unwrap();
        pm.handle_message(sell_signal("ITUB4")).await.unwrap();

        let txs = store.recent_transactions(10).await.unwrap();
        assert!(txs.iter().all(|t| t.side == TradeSide::Buy));
        assert_eq!(pm.pending_count().await, 0);
    }

    #[tokio::test]
    async fn mismatched_response_keeps_the_genuine_proposal() {
        let store = Arc::new(MemoryStore::seeded(5000.0));
        let pm = PortfolioManager::new(store.clone(), MessageBus::default(), Limits::default());
        pm.propose(PlannedOp { side: TradeSide::Buy, asset_code: "VALE3".into(), value: 400.0, quantity: None, reason: "t".into() })
            .await
            .unwrap();
        let genuine = pm.book.lock().await.pending.values().next().map(|p| p.request.clone()).unwrap();

        let mut altered = genuine.clone();
        altered.value = 4000.0;
        pm.on_authorization(AuthorizationResponse { request: altered, authorized: true, denial: None }).await.unwrap();
        assert_eq!(pm.pending_count().await, 1);
        assert!(store.recent_transactions(10).await.unwrap().is_empty());

        pm.on_authorization(AuthorizationResponse { request: genuine, authorized: true, denial: None }).await.unwrap();
        assert_eq!(pm.pending_count().await, 0);
        let txs = store.recent_transactions(10).await.unwrap();
        assert_eq!(txs.len(), 1);
        assert!((txs[0].total_value - 400.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn cached_analysis_tags_signal_proposals() {
        let store = Arc::new(MemoryStore::seeded(5000.0));
        let pm = PortfolioManager::new(store.clone(), MessageBus::default(), Limits::default());
        let analysis = TrendAnalysis {
            asset_code: "PETR4".into(),
            quote: Quote {
                class: AssetClass::Equity,
                price: 31.0,
                previous_price: 32.5,
                change_pct: -4.62,
                updated_at: Utc::now(),
            },
            trend: Some(TrendReading { asset_code: "PETR4".into(), trend: Trend::StrongDown, change_pct: -4.62, price: 31.0 }),
            signal: None,
        };
        pm.handle_message(Message::direct(MARKET_ANALYST, PORTFOLIO_MANAGER, Payload::TrendAnalysis(analysis)))
            .await
            .unwrap();
        assert!(pm.analysis("PETR4").await.is_some());

        pm.handle_message(buy_signal("PETR4")).await.unwrap();
        let reason = pm.book.lock().await.pending.values().next().map(|p| p.request.reason.clone()).unwrap();
        assert_eq!(reason, "significant drop (-4.00%) [trend queda_forte, -4.62%]");
    }
}
