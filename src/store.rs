// ===============================
// src/store.rs
// ===============================
//
// Shared state collaborator. Agents only see the `Store` trait; the relational
// backend is external, `MemoryStore` stands in for it in-process.
//
// Every trait call is one "session": it takes the lock for its own duration
// only, no lock spans several agent reasoning steps.
//
use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::domain::{
    default_targets, Alert, Asset, AssetClass, DiversificationTarget, Indicator, NewAlert, Position,
    TradeCommand, TradeSide, Transaction, Wallet,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("asset {0} not found")]
    AssetNotFound(String),
    #[error("wallet not found")]
    WalletMissing,
    #[error("insufficient cash: requested {requested:.2}, available {available:.2}")]
    InsufficientCash { requested: f64, available: f64 },
    #[error("no position in {0}")]
    NoPosition(String),
    #[error("invalid trade amount {0}")]
    InvalidAmount(f64),
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn assets(&self) -> Result<Vec<Asset>, StoreError>;
    /// Sets new prices; previous price and percent change follow from the old price.
    async fn update_prices(&self, prices: &[(String, f64)]) -> Result<(), StoreError>;
    async fn indicators(&self) -> Result<Vec<Indicator>, StoreError>;
    async fn update_indicators(&self, values: &[(String, f64)]) -> Result<(), StoreError>;

    async fn wallet(&self) -> Result<Option<Wallet>, StoreError>;
    /// Recomputes total value from current prices and returns the fresh row.
    async fn revalue_wallet(&self) -> Result<Option<Wallet>, StoreError>;
    async fn positions(&self) -> Result<Vec<Position>, StoreError>;
    /// Most recent first.
    async fn recent_transactions(&self, limit: usize) -> Result<Vec<Transaction>, StoreError>;
    async fn targets(&self) -> Result<Vec<DiversificationTarget>, StoreError>;

    async fn insert_alert(&self, alert: NewAlert) -> Result<Alert, StoreError>;
    async fn alerts(&self) -> Result<Vec<Alert>, StoreError>;
    async fn resolve_alert(&self, id: u64) -> Result<bool, StoreError>;

    /// Transaction row, position and wallet are updated together or not at all.
    /// A buy above available cash is rejected.
    async fn apply_trade(&self, cmd: TradeCommand) -> Result<Transaction, StoreError>;
}

#[derive(Debug, Clone)]
struct PositionRow { asset_code: String, quantity: f64, average_cost: f64, cost_basis: f64 }

#[derive(Debug, Default)]
struct Tables {
    assets: Vec<Asset>,
    indicators: Vec<Indicator>,
    positions: Vec<PositionRow>,
    transactions: Vec<Transaction>,
    wallet: Option<Wallet>,
    targets: Vec<DiversificationTarget>,
    alerts: Vec<Alert>,
    next_tx_id: u64,
    next_alert_id: u64,
}

impl Tables {
    fn asset(&self, code: &str) -> Result<&Asset, StoreError> {
        self.assets.iter().find(|a| a.code == code).ok_or_else(|| StoreError::AssetNotFound(code.to_string()))
    }

    fn price_of(&self, code: &str) -> f64 {
        self.assets.iter().find(|a| a.code == code).map(|a| a.price).unwrap_or(0.0)
    }

    fn positions_value(&self) -> f64 {
        self.positions.iter().map(|p| p.quantity * self.price_of(&p.asset_code)).sum()
    }

    fn revalue(&mut self) -> Option<Wallet> {
        let positions_value = self.positions_value();
        let w = self.wallet.as_mut()?;
        w.total_value = w.available_cash + positions_value;
        Some(*w)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    #[cfg(test)]
    unavailable: std::sync::atomic::AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    /// Wallet, sample assets, indicators and default diversification targets.
    pub fn seeded(initial_cash: f64) -> Self {
        Self::new()
            .with_wallet(initial_cash)
            .with_assets(sample_assets())
            .with_indicators(sample_indicators())
            .with_targets(default_targets())
    }

    pub fn with_wallet(mut self, cash: f64) -> Self {
        self.tables.get_mut().wallet = Some(Wallet { available_cash: cash, total_value: cash });
        self
    }

    pub fn with_assets(mut self, assets: Vec<Asset>) -> Self {
        self.tables.get_mut().assets = assets;
        self
    }

    pub fn with_indicators(mut self, indicators: Vec<Indicator>) -> Self {
        self.tables.get_mut().indicators = indicators;
        self
    }

    pub fn with_targets(mut self, targets: Vec<DiversificationTarget>) -> Self {
        self.tables.get_mut().targets = targets;
        self
    }

    /// Makes every call fail with `StoreError::Unavailable` until reset.
    #[cfg(test)]
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, std::sync::atomic::Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        #[cfg(test)]
        if self.unavailable.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(StoreError::Unavailable("simulated outage".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn assets(&self) -> Result<Vec<Asset>, StoreError> {
        self.check()?;
        Ok(self.tables.read().await.assets.clone())
    }

    async fn update_prices(&self, prices: &[(String, f64)]) -> Result<(), StoreError> {
        self.check()?;
        let mut t = self.tables.write().await;
        let now = Utc::now();
        for (code, new_price) in prices {
            if let Some(a) = t.assets.iter_mut().find(|a| &a.code == code) {
                let prev = a.price;
                a.previous_price = prev;
                a.price = *new_price;
                a.change_pct = if prev > 0.0 { (new_price / prev - 1.0) * 100.0 } else { 0.0 };
                a.updated_at = now;
            }
        }
        Ok(())
    }

    async fn indicators(&self) -> Result<Vec<Indicator>, StoreError> {
        self.check()?;
        Ok(self.tables.read().await.indicators.clone())
    }

    async fn update_indicators(&self, values: &[(String, f64)]) -> Result<(), StoreError> {
        self.check()?;
        let mut t = self.tables.write().await;
        let now = Utc::now();
        for (name, value) in values {
            if let Some(ind) = t.indicators.iter_mut().find(|i| &i.name == name) {
                ind.change_pct = if ind.value != 0.0 { (value / ind.value - 1.0) * 100.0 } else { 0.0 };
                ind.value = *value;
                ind.updated_at = now;
            }
        }
        Ok(())
    }

    async fn wallet(&self) -> Result<Option<Wallet>, StoreError> {
        self.check()?;
        Ok(self.tables.read().await.wallet)
    }

    async fn revalue_wallet(&self) -> Result<Option<Wallet>, StoreError> {
        self.check()?;
        Ok(self.tables.write().await.revalue())
    }

    async fn positions(&self) -> Result<Vec<Position>, StoreError> {
        self.check()?;
        let t = self.tables.read().await;
        let out = t
            .positions
            .iter()
            .filter_map(|p| {
                let asset = t.asset(&p.asset_code).ok()?;
                Some(Position {
                    asset_code: p.asset_code.clone(),
                    class: asset.class,
                    quantity: p.quantity,
                    average_cost: p.average_cost,
                    cost_basis: p.cost_basis,
                    market_value: p.quantity * asset.price,
                })
            })
            .collect();
        Ok(out)
    }

    async fn recent_transactions(&self, limit: usize) -> Result<Vec<Transaction>, StoreError> {
        self.check()?;
        let t = self.tables.read().await;
        Ok(t.transactions.iter().rev().take(limit).cloned().collect())
    }

    async fn targets(&self) -> Result<Vec<DiversificationTarget>, StoreError> {
        self.check()?;
        Ok(self.tables.read().await.targets.clone())
    }

    async fn insert_alert(&self, alert: NewAlert) -> Result<Alert, StoreError> {
        self.check()?;
        let mut t = self.tables.write().await;
        t.next_alert_id += 1;
        let row = Alert {
            id: t.next_alert_id,
            origin: alert.origin,
            category: alert.category,
            message: alert.message,
            severity: alert.severity,
            resolved: false,
            timestamp: Utc::now(),
        };
        t.alerts.push(row.clone());
        Ok(row)
    }

    async fn alerts(&self) -> Result<Vec<Alert>, StoreError> {
        self.check()?;
        Ok(self.tables.read().await.alerts.clone())
    }

    async fn resolve_alert(&self, id: u64) -> Result<bool, StoreError> {
        self.check()?;
        let mut t = self.tables.write().await;
        match t.alerts.iter_mut().find(|a| a.id == id) {
            Some(a) if !a.resolved => {
                a.resolved = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn apply_trade(&self, cmd: TradeCommand) -> Result<Transaction, StoreError> {
        self.check()?;
        let mut guard = self.tables.write().await;
        let t = &mut *guard;
        let cash = t.wallet.ok_or(StoreError::WalletMissing)?.available_cash;

        let (code, side, quantity, price, value) = match cmd {
            TradeCommand::Buy { asset_code, value } => {
                let price = t.asset(&asset_code)?.price;
                if !(value > 0.0) || price <= 0.0 {
                    return Err(StoreError::InvalidAmount(value));
                }
                if value > cash {
                    return Err(StoreError::InsufficientCash { requested: value, available: cash });
                }
                let qty = value / price;
                match t.positions.iter_mut().find(|p| p.asset_code == asset_code) {
                    Some(p) => {
                        p.cost_basis += value;
                        p.quantity += qty;
                        p.average_cost = p.cost_basis / p.quantity;
                    }
                    None => t.positions.push(PositionRow {
                        asset_code: asset_code.clone(),
                        quantity: qty,
                        average_cost: price,
                        cost_basis: value,
                    }),
                }
                (asset_code, TradeSide::Buy, qty, price, value)
            }
            TradeCommand::Sell { asset_code, quantity } => {
                let price = t.asset(&asset_code)?.price;
                if !(quantity > 0.0) {
                    return Err(StoreError::InvalidAmount(quantity));
                }
                let idx = t
                    .positions
                    .iter()
                    .position(|p| p.asset_code == asset_code && p.quantity > 0.0)
                    .ok_or_else(|| StoreError::NoPosition(asset_code.clone()))?;
                let p = &mut t.positions[idx];
                // never sell more than held
                let qty = quantity.min(p.quantity);
                p.quantity = (p.quantity - qty).max(0.0);
                p.cost_basis = p.quantity * p.average_cost;
                if p.quantity <= 0.0 {
                    t.positions.remove(idx);
                }
                (asset_code, TradeSide::Sell, qty, price, qty * price)
            }
        };

        if let Some(w) = t.wallet.as_mut() {
            match side {
                TradeSide::Buy => w.available_cash -= value,
                TradeSide::Sell => w.available_cash += value,
            }
        }
        t.next_tx_id += 1;
        let tx = Transaction {
            id: t.next_tx_id,
            asset_code: code,
            side,
            quantity,
            unit_price: price,
            total_value: value,
            timestamp: Utc::now(),
        };
        t.transactions.push(tx.clone());
        t.revalue();
        Ok(tx)
    }
}

pub fn sample_assets() -> Vec<Asset> {
    vec![
        Asset::new("PETR4", "Petrobras PN", AssetClass::Equity, 32.50),
        Asset::new("VALE3", "Vale ON", AssetClass::Equity, 68.90),
        Asset::new("ITUB4", "Itau PN", AssetClass::Equity, 28.75),
        Asset::new("BBDC4", "Bradesco PN", AssetClass::Equity, 15.20),
        Asset::new("ABEV3", "Ambev ON", AssetClass::Equity, 12.85),
        Asset::new("CDB001", "CDB Banco XYZ 120% CDI", AssetClass::FixedIncome, 1000.0),
        Asset::new("LCI001", "LCI Banco ABC", AssetClass::FixedIncome, 1000.0),
        Asset::new("TESOURO", "Tesouro IPCA+ 2029", AssetClass::FixedIncome, 950.0),
        Asset::new("BTC", "Bitcoin", AssetClass::Crypto, 250_000.0),
        Asset::new("ETH", "Ethereum", AssetClass::Crypto, 15_000.0),
        Asset::new("FUND001", "Fundo Multimercado XYZ", AssetClass::Fund, 100.0),
        Asset::new("FUND002", "Fundo de Acoes ABC", AssetClass::Fund, 150.0),
    ]
}

pub fn sample_indicators() -> Vec<Indicator> {
    let now = Utc::now();
    [("Selic", 10.75), ("IPCA", 4.62), ("IBOVESPA", 125_000.0), ("Dolar", 5.15)]
        .into_iter()
        .map(|(name, value)| Indicator { name: name.to_string(), value, change_pct: 0.0, updated_at: now })
        .collect()
}
