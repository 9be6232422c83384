// ===============================
// src/message.rs
// ===============================
//
// Envelope + typed payloads exchanged on the bus. One payload struct per
// message type; the wire name of each type is kept in `MessageKind::as_str`.
//
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{AssetClass, TradeSide};

pub const WALLET_MANAGER: &str = "WalletManager";
pub const MARKET_ANALYST: &str = "MarketAnalyst";
pub const PORTFOLIO_MANAGER: &str = "PortfolioManager";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub sender: String,
    /// `None` means broadcast.
    pub receiver: Option<String>,
    pub payload: Payload,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn broadcast(sender: &str, payload: Payload) -> Self {
        Self { sender: sender.to_string(), receiver: None, payload, timestamp: Utc::now() }
    }

    pub fn direct(sender: &str, receiver: &str, payload: Payload) -> Self {
        Self {
            sender: sender.to_string(),
            receiver: Some(receiver.to_string()),
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn kind(&self) -> MessageKind { self.payload.kind() }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<{} from={} to={}>",
            self.kind().as_str(),
            self.sender,
            self.receiver.as_deref().unwrap_or("*")
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    BalanceUpdated,
    LimitSet,
    BuyAuthorization,
    SellAuthorization,
    LiquidityAlert,
    TrendAnalysis,
    BuySignals,
    SellSignals,
    RiskAlert,
    MarketReport,
    PortfolioDistribution,
    OperationExecuted,
    AuthorizationRequest,
    AnalysisRequest,
    PortfolioReport,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::BalanceUpdated => "saldo_atualizado",
            MessageKind::LimitSet => "limite_definido",
            MessageKind::BuyAuthorization => "autorizacao_compra",
            MessageKind::SellAuthorization => "autorizacao_venda",
            MessageKind::LiquidityAlert => "alerta_liquidez",
            MessageKind::TrendAnalysis => "analise_tendencia",
            MessageKind::BuySignals => "sinal_compra",
            MessageKind::SellSignals => "sinal_venda",
            MessageKind::RiskAlert => "alerta_risco",
            MessageKind::MarketReport => "relatorio_mercado",
            MessageKind::PortfolioDistribution => "distribuicao_carteira",
            MessageKind::OperationExecuted => "operacao_executada",
            MessageKind::AuthorizationRequest => "solicitacao_autorizacao",
            MessageKind::AnalysisRequest => "solicitacao_analise",
            MessageKind::PortfolioReport => "relatorio_portfolio",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Payload {
    #[serde(rename = "saldo_atualizado")]
    BalanceUpdated(BalanceUpdate),
    #[serde(rename = "limite_definido")]
    LimitSet(OperationalLimit),
    #[serde(rename = "autorizacao_compra")]
    BuyAuthorization(AuthorizationResponse),
    #[serde(rename = "autorizacao_venda")]
    SellAuthorization(AuthorizationResponse),
    #[serde(rename = "alerta_liquidez")]
    LiquidityAlert(LiquidityAlert),
    #[serde(rename = "analise_tendencia")]
    TrendAnalysis(TrendAnalysis),
    #[serde(rename = "sinal_compra")]
    BuySignals(SignalBatch),
    #[serde(rename = "sinal_venda")]
    SellSignals(SignalBatch),
    #[serde(rename = "alerta_risco")]
    RiskAlert(RiskAlert),
    #[serde(rename = "relatorio_mercado")]
    MarketReport(MarketReport),
    #[serde(rename = "distribuicao_carteira")]
    PortfolioDistribution(Distribution),
    #[serde(rename = "operacao_executada")]
    OperationExecuted(ExecutedOperation),
    #[serde(rename = "solicitacao_autorizacao")]
    AuthorizationRequest(AuthorizationRequest),
    #[serde(rename = "solicitacao_analise")]
    AnalysisRequest(AnalysisRequest),
    #[serde(rename = "relatorio_portfolio")]
    PortfolioReport(PortfolioReport),
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::BalanceUpdated(_) => MessageKind::BalanceUpdated,
            Payload::LimitSet(_) => MessageKind::LimitSet,
            Payload::BuyAuthorization(_) => MessageKind::BuyAuthorization,
            Payload::SellAuthorization(_) => MessageKind::SellAuthorization,
            Payload::LiquidityAlert(_) => MessageKind::LiquidityAlert,
            Payload::TrendAnalysis(_) => MessageKind::TrendAnalysis,
            Payload::BuySignals(_) => MessageKind::BuySignals,
            Payload::SellSignals(_) => MessageKind::SellSignals,
            Payload::RiskAlert(_) => MessageKind::RiskAlert,
            Payload::MarketReport(_) => MessageKind::MarketReport,
            Payload::PortfolioDistribution(_) => MessageKind::PortfolioDistribution,
            Payload::OperationExecuted(_) => MessageKind::OperationExecuted,
            Payload::AuthorizationRequest(_) => MessageKind::AuthorizationRequest,
            Payload::AnalysisRequest(_) => MessageKind::AnalysisRequest,
            Payload::PortfolioReport(_) => MessageKind::PortfolioReport,
        }
    }
}

// ---- Wallet ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceUpdate { pub balance: f64, pub previous: Option<f64> }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationalLimit { pub limit: f64 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidityAlert { pub balance: f64, pub minimum: f64 }

// ---- Negotiation ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationRequest {
    /// Correlates the response with the requester's pending proposal.
    pub proposal_id: String,
    pub side: TradeSide,
    pub asset_code: String,
    /// Buy: cash to spend. Sell: estimated proceeds at request time.
    pub value: f64,
    pub quantity: Option<f64>,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DenialReason {
    #[serde(rename = "saldo_insuficiente")]
    InsufficientFunds,
    #[serde(rename = "carteira_indisponivel")]
    WalletUnavailable,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenialReason::InsufficientFunds => "saldo_insuficiente",
            DenialReason::WalletUnavailable => "carteira_indisponivel",
        }
    }
}

/// Echo of the request merged with the decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationResponse {
    #[serde(flatten)]
    pub request: AuthorizationRequest,
    pub authorized: bool,
    pub denial: Option<DenialReason>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutedOperation {
    pub transaction_id: u64,
    pub side: TradeSide,
    pub asset_code: String,
    pub quantity: f64,
    pub value: f64,
}

// ---- Market analysis ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trend {
    #[serde(rename = "alta_forte")]
    StrongUp,
    #[serde(rename = "alta_suave")]
    MildUp,
    #[serde(rename = "queda_forte")]
    StrongDown,
    #[serde(rename = "queda_suave")]
    MildDown,
    #[serde(rename = "lateral")]
    Sideways,
}

impl Trend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trend::StrongUp => "alta_forte",
            Trend::MildUp => "alta_suave",
            Trend::StrongDown => "queda_forte",
            Trend::MildDown => "queda_suave",
            Trend::Sideways => "lateral",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalAction { Buy, Sell, Hold }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalStrength { Strong, Moderate, Weak }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub asset_code: String,
    pub action: SignalAction,
    pub strength: SignalStrength,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalBatch { pub signals: Vec<Signal> }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub class: AssetClass,
    pub price: f64,
    pub previous_price: f64,
    pub change_pct: f64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendReading { pub asset_code: String, pub trend: Trend, pub change_pct: f64, pub price: f64 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest { pub asset_code: String }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendAnalysis {
    pub asset_code: String,
    pub quote: Quote,
    pub trend: Option<TrendReading>,
    pub signal: Option<Signal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAlert { pub category: String, pub asset_code: String, pub message: String }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorReading { pub name: String, pub value: f64, pub change_pct: f64 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketReport {
    pub total_assets: usize,
    pub trends: Vec<TrendReading>,
    pub signals: Vec<Signal>,
    pub indicators: Vec<IndicatorReading>,
}

// ---- Portfolio ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassAllocation { pub class: AssetClass, pub value: f64, pub percent: f64 }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Distribution { pub by_class: Vec<ClassAllocation>, pub cash: f64, pub total: f64 }

impl Distribution {
    pub fn percent_of(&self, class: AssetClass) -> f64 {
        self.by_class.iter().find(|a| a.class == class).map(|a| a.percent).unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioReport { pub distribution: Distribution, pub positions: usize, pub pending_proposals: usize }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorization_response_echoes_request_fields_on_the_wire() {
        let req = AuthorizationRequest {
            proposal_id: "PR-1".into(),
            side: TradeSide::Buy,
            asset_code: "PETR4".into(),
            value: 1500.0,
            quantity: None,
            reason: "rebalance".into(),
        };
        let msg = Message::direct(
            WALLET_MANAGER,
            PORTFOLIO_MANAGER,
            Payload::BuyAuthorization(AuthorizationResponse {
                request: req,
                authorized: false,
                denial: Some(DenialReason::InsufficientFunds),
            }),
        );
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["payload"]["type"], "autorizacao_compra");
        let body = &v["payload"]["payload"];
        assert_eq!(body["authorized"], false);
        assert_eq!(body["denial"], "saldo_insuficiente");
        assert_eq!(body["asset_code"], "PETR4");
        assert_eq!(body["side"], "compra");
        assert_eq!(body["value"], 1500.0);
    }

    #[test]
    fn kind_names_follow_wire_names() {
        let p = Payload::AnalysisRequest(AnalysisRequest { asset_code: "BTC".into() });
        assert_eq!(p.kind(), MessageKind::AnalysisRequest);
        assert_eq!(p.kind().as_str(), "solicitacao_analise");
        let m = Message::broadcast(MARKET_ANALYST, p);
        assert!(m.receiver.is_none());
        assert_eq!(m.to_string(), "<solicitacao_analise from=MarketAnalyst to=*>");
    }
}
