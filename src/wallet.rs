// ===============================
// src/wallet.rs
// ===============================
//
// WalletManager: guardian of the cash balance.
// - liquidity check against min_liquidity, one alert per truncated balance
// - saldo_atualizado whenever the balance moved since the last cycle
// - authorization of PortfolioManager proposals, always on a fresh wallet read
//
use std::collections::VecDeque;
use std::sync::Arc;

use ahash::AHashSet as HashSet;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::agent::{Agent, AgentError};
use crate::bus::MessageBus;
use crate::config::Limits;
use crate::domain::{NewAlert, TradeSide, Transaction};
use crate::message::{
    AuthorizationRequest, AuthorizationResponse, BalanceUpdate, DenialReason, LiquidityAlert, Message,
    OperationalLimit, Payload, WALLET_MANAGER,
};
use crate::metrics::{ALERTS, AUTHORIZATIONS, WALLET_CASH, WALLET_TOTAL};
use crate::store::Store;

pub const LOG_TARGET: &str = module_path!();
pub const LIQUIDITY_CATEGORY: &str = "liquidez_baixa";
const CASH_FLOW_WINDOW: usize = 50;

#[derive(Debug, Clone, Serialize)]
pub struct FinancialReport {
    pub balance: f64,
    pub operational_limit: Option<f64>,
    pub inflows: f64,
    pub outflows: f64,
    pub net_flow: f64,
    pub liquidity_ok: bool,
}

#[derive(Default)]
struct Ledger {
    balance: Option<f64>,
    total_value: f64,
    last_published: Option<f64>,
    cash_flow: VecDeque<Transaction>,
    liquidity_keys: HashSet<i64>,
    open_liquidity_alerts: Vec<u64>,
    operational_limit: Option<f64>,
}

enum Liquidity { Fine, Low { key_is_new: bool }, Recovered(Vec<u64>) }

pub struct WalletManager {
    store: Arc<dyn Store>,
    bus: MessageBus,
    limits: Limits,
    ledger: Mutex<Ledger>,
}

impl WalletManager {
    pub fn new(store: Arc<dyn Store>, bus: MessageBus, limits: Limits) -> Self {
        Self { store, bus, limits, ledger: Mutex::new(Ledger::default()) }
    }

    /// Decides on a proposal. Denial is an answer, not an error.
    pub async fn authorize(&self, request: AuthorizationRequest, requester: &str) {
        let (authorized, denial) = match self.store.wallet().await {
            Ok(Some(w)) => match request.side {
                TradeSide::Buy if request.value <= w.available_cash => (true, None),
                TradeSide::Buy => {
                    info!(
                        proposal = %request.proposal_id,
                        value = request.value,
                        cash = w.available_cash,
                        "buy denied: insufficient funds"
                    );
                    (false, Some(DenialReason::InsufficientFunds))
                }
                TradeSide::Sell => (true, None),
            },
            Ok(None) => {
                error!(proposal = %request.proposal_id, "authorization denied by error: wallet missing");
                (false, Some(DenialReason::WalletUnavailable))
            }
            Err(e) => {
                error!(proposal = %request.proposal_id, error = %e, "authorization denied by error");
                (false, Some(DenialReason::WalletUnavailable))
            }
        };

        let side = request.side;
        AUTHORIZATIONS
            .with_label_values(&[side.as_str(), if authorized { "granted" } else { "denied" }])
            .inc();
        if authorized {
            info!(proposal = %request.proposal_id, side = side.as_str(), asset = %request.asset_code, value = request.value, "authorized");
        }
        let response = AuthorizationResponse { request, authorized, denial };
        let payload = match side {
            TradeSide::Buy => Payload::BuyAuthorization(response),
            TradeSide::Sell => Payload::SellAuthorization(response),
        };
        self.bus.send(Message::direct(WALLET_MANAGER, requester, payload)).await;
    }

    pub async fn set_operational_limit(&self, limit: f64) {
        self.ledger.lock().await.operational_limit = Some(limit);
        info!(limit, "operational limit set");
        self.bus.publish(Message::broadcast(WALLET_MANAGER, Payload::LimitSet(OperationalLimit { limit })));
    }

    pub async fn financial_report(&self) -> FinancialReport {
        let ledger = self.ledger.lock().await;
        let (inflows, outflows) = ledger.cash_flow.iter().fold((0.0, 0.0), |(i, o), t| match t.side {
            TradeSide::Sell => (i + t.total_value, o),
            TradeSide::Buy => (i, o + t.total_value),
        });
        let balance = ledger.balance.unwrap_or(0.0);
        FinancialReport {
            balance,
            operational_limit: ledger.operational_limit,
            inflows,
            outflows,
            net_flow: inflows - outflows,
            liquidity_ok: balance >= self.limits.min_liquidity,
        }
    }

    async fn raise_liquidity_alert(&self, balance: f64) {
        let minimum = self.limits.min_liquidity;
        let text = format!("available cash {balance:.2} below minimum {minimum:.2}");
        match self.store.insert_alert(NewAlert::warning(WALLET_MANAGER, LIQUIDITY_CATEGORY, text)).await {
            Ok(alert) => {
                ALERTS.with_label_values(&[WALLET_MANAGER, LIQUIDITY_CATEGORY]).inc();
                self.ledger.lock().await.open_liquidity_alerts.push(alert.id);
            }
            Err(e) => warn!(error = %e, "liquidity alert not persisted"),
        }
        warn!(balance, minimum, "low liquidity");
        self.bus
            .broadcast(Message::broadcast(WALLET_MANAGER, Payload::LiquidityAlert(LiquidityAlert { balance, minimum })))
            .await;
    }
}

#[async_trait]
impl Agent for WalletManager {
    fn name(&self) -> &str { WALLET_MANAGER }

    async fn perceive(&self) -> Result<(), AgentError> {
        let wallet = match self.store.wallet().await {
            Ok(Some(w)) => w,
            Ok(None) => return Err(AgentError::WalletMissing),
            Err(e) => {
                warn!(error = %e, "wallet read failed, keeping cached balance");
                return Ok(());
            }
        };
        let recent = match self.store.recent_transactions(CASH_FLOW_WINDOW).await {
            Ok(rows) => Some(rows),
            Err(e) => {
                warn!(error = %e, "transaction read failed");
                None
            }
        };

        WALLET_CASH.set(wallet.available_cash);
        WALLET_TOTAL.set(wallet.total_value);
        let mut ledger = self.ledger.lock().await;
        ledger.balance = Some(wallet.available_cash);
        ledger.total_value = wallet.total_value;
        if let Some(rows) = recent {
            for t in rows.iter().take(10) {
                debug!(id = t.id, side = t.side.as_str(), asset = %t.asset_code, value = t.total_value, "recent transaction");
            }
            ledger.cash_flow = rows.into_iter().collect();
        }
        Ok(())
    }

    async fn act(&self) -> Result<(), AgentError> {
        let (balance, liquidity, previous_published) = {
            let mut ledger = self.ledger.lock().await;
            let Some(balance) = ledger.balance else { return Ok(()) };
            let liquidity = if balance < self.limits.min_liquidity {
                Liquidity::Low { key_is_new: ledger.liquidity_keys.insert(balance.trunc() as i64) }
            } else if !ledger.liquidity_keys.is_empty() {
                ledger.liquidity_keys.clear();
                Liquidity::Recovered(std::mem::take(&mut ledger.open_liquidity_alerts))
            } else {
                Liquidity::Fine
            };
            let previous = ledger.last_published;
            if previous != Some(balance) {
                ledger.last_published = Some(balance);
            }
            (balance, liquidity, previous)
        };

        match liquidity {
            Liquidity::Low { key_is_new: true } => self.raise_liquidity_alert(balance).await,
            Liquidity::Low { key_is_new: false } | Liquidity::Fine => {}
            Liquidity::Recovered(ids) => {
                info!(balance, "liquidity restored");
                for id in ids {
                    if let Err(e) = self.store.resolve_alert(id).await {
                        warn!(error = %e, id, "could not resolve liquidity alert");
                    }
                }
            }
        }

        if previous_published != Some(balance) {
            debug!(balance, ?previous_published, "balance changed");
            self.bus.publish(Message::broadcast(
                WALLET_MANAGER,
                Payload::BalanceUpdated(BalanceUpdate { balance, previous: previous_published }),
            ));
        }
        Ok(())
    }

    async fn handle_message(&self, message: Message) -> Result<(), AgentError> {
        let sender = message.sender;
        match message.payload {
            Payload::AuthorizationRequest(req) => self.authorize(req, &sender).await,
            Payload::PortfolioReport(r) => {
                info!(from = %sender, positions = r.positions, pending = r.pending_proposals, total = r.distribution.total, "portfolio report")
            }
            Payload::MarketReport(r) => info!(from = %sender, assets = r.total_assets, signals = r.signals.len(), "market report"),
            Payload::OperationExecuted(op) => {
                info!(from = %sender, tx = op.transaction_id, side = op.side.as_str(), asset = %op.asset_code, value = op.value, "operation executed")
            }
            other => debug!(kind = other.kind().as_str(), from = %sender, "message ignored"),
        }
        Ok(())
    }
}
