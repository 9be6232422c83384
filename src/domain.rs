// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AssetClass {
    #[serde(rename = "acao")]
    Equity,
    #[serde(rename = "renda_fixa")]
    FixedIncome,
    #[serde(rename = "cripto")]
    Crypto,
    #[serde(rename = "fundo")]
    Fund,
}

impl AssetClass {
    pub const ALL: [AssetClass; 4] = [
        AssetClass::Equity,
        AssetClass::FixedIncome,
        AssetClass::Crypto,
        AssetClass::Fund,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            AssetClass::Equity => "Equity",
            AssetClass::FixedIncome => "FixedIncome",
            AssetClass::Crypto => "Crypto",
            AssetClass::Fund => "Fund",
        }
    }

    /// Daily-ish volatility used by the simulator (fraction, not percent).
    pub fn volatility(&self) -> f64 {
        match self {
            AssetClass::Equity => 0.02,
            AssetClass::FixedIncome => 0.001,
            AssetClass::Crypto => 0.05,
            AssetClass::Fund => 0.01,
        }
    }
}

impl std::fmt::Display for AssetClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeSide {
    #[serde(rename = "compra")]
    Buy,
    #[serde(rename = "venda")]
    Sell,
}
impl TradeSide {
    pub fn as_str(&self) -> &'static str { match self { TradeSide::Buy => "compra", TradeSide::Sell => "venda" } }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub code: String,
    pub name: String,
    pub class: AssetClass,
    pub price: f64,
    pub previous_price: f64,
    pub change_pct: f64,
    pub updated_at: DateTime<Utc>,
}

impl Asset {
    pub fn new(code: &str, name: &str, class: AssetClass, price: f64) -> Self {
        Self {
            code: code.to_string(),
            name: name.to_string(),
            class,
            price,
            previous_price: price,
            change_pct: 0.0,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Indicator { pub name: String, pub value: f64, pub change_pct: f64, pub updated_at: DateTime<Utc> }

/// Holding of one asset. `market_value` is quantity × current price at read time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub asset_code: String,
    pub class: AssetClass,
    pub quantity: f64,
    pub average_cost: f64,
    pub cost_basis: f64,
    pub market_value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: u64,
    pub asset_code: String,
    pub side: TradeSide,
    pub quantity: f64,
    pub unit_price: f64,
    pub total_value: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Wallet { pub available_cash: f64, pub total_value: f64 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiversificationTarget { pub class: AssetClass, pub target_pct: f64, pub tolerance_pct: f64 }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity { Info, Warning, Critical }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: u64,
    pub origin: String,
    pub category: String,
    pub message: String,
    pub severity: Severity,
    pub resolved: bool,
    pub timestamp: DateTime<Utc>,
}

/// Alert as requested by an agent, before the store assigns id and timestamp.
#[derive(Debug, Clone)]
pub struct NewAlert { pub origin: String, pub category: String, pub message: String, pub severity: Severity }

impl NewAlert {
    pub fn warning(origin: &str, category: &str, message: String) -> Self {
        Self { origin: origin.to_string(), category: category.to_string(), message, severity: Severity::Warning }
    }
}

/// A trade the store must apply atomically (transaction row + position + wallet).
#[derive(Debug, Clone)]
pub enum TradeCommand {
    Buy { asset_code: String, value: f64 },
    Sell { asset_code: String, quantity: f64 },
}

// Recorder journal entries
#[derive(Debug, Clone, Serialize)]
pub enum Event { Msg(Message), Note(String) }

pub fn default_targets() -> Vec<DiversificationTarget> {
    [
        (AssetClass::Equity, 40.0),
        (AssetClass::FixedIncome, 30.0),
        (AssetClass::Crypto, 20.0),
        (AssetClass::Fund, 10.0),
    ]
    .into_iter()
    .map(|(class, target_pct)| DiversificationTarget { class, target_pct, tolerance_pct: 5.0 })
    .collect()
}
