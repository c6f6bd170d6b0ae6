//! Brokerage session abstraction.
//!
//! Defines the `BrokerSession` trait the engine drives, the instrument and
//! quote types exchanged across it, and the event stream it publishes
//! (order status, disconnects, positions). The wire protocol of a real
//! brokerage lives behind this trait; the crate ships the in-memory
//! [`paper::PaperBroker`].

pub mod calendar;
pub mod paper;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio::sync::mpsc;

use crate::types::{
    parse_local_symbol, Contract, OptionRight, OrderId, OrderSide, OrderState, PositionEntry,
};

// ---------------------------------------------------------------------------
// Instruments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityType {
    Index,
    Option,
}

/// A contract specification as understood by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,
    pub sec_type: SecurityType,
    pub exchange: String,
    pub currency: String,
    #[serde(default)]
    pub expiration: Option<NaiveDate>,
    #[serde(default)]
    pub strike: Option<Decimal>,
    #[serde(default)]
    pub right: Option<OptionRight>,
    #[serde(default)]
    pub trading_class: Option<String>,
    #[serde(default)]
    pub local_symbol: Option<String>,
    /// Broker contract id, filled in by qualification.
    #[serde(default)]
    pub con_id: Option<i64>,
}

impl Instrument {
    /// An index listed on its primary exchange.
    pub fn index(symbol: &str, exchange: &str, currency: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            sec_type: SecurityType::Index,
            exchange: exchange.to_string(),
            currency: currency.to_string(),
            expiration: None,
            strike: None,
            right: None,
            trading_class: None,
            local_symbol: None,
            con_id: None,
        }
    }

    /// A partially specified option: all strikes of one expiration and right.
    pub fn option_series(
        symbol: &str,
        expiration: NaiveDate,
        right: OptionRight,
        exchange: &str,
        trading_class: &str,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            sec_type: SecurityType::Option,
            exchange: exchange.to_string(),
            currency: "USD".to_string(),
            expiration: Some(expiration),
            strike: None,
            right: Some(right),
            trading_class: Some(trading_class.to_string()),
            local_symbol: None,
            con_id: None,
        }
    }

    /// Rebuild an orderable option from its local symbol. The root of the
    /// symbol is the trading class; `underlying` is the index it settles on.
    pub fn from_local_symbol(underlying: &str, local_symbol: &str, exchange: &str) -> Result<Self> {
        let parsed = parse_local_symbol(local_symbol)?;
        Ok(Self {
            symbol: underlying.to_string(),
            sec_type: SecurityType::Option,
            exchange: exchange.to_string(),
            currency: "USD".to_string(),
            expiration: Some(parsed.expiration),
            strike: Some(parsed.strike),
            right: Some(parsed.right),
            trading_class: Some(parsed.root),
            local_symbol: Some(local_symbol.to_string()),
            con_id: None,
        })
    }

    pub fn describe(&self) -> String {
        match &self.local_symbol {
            Some(s) => s.trim().to_string(),
            None => format!("{} {:?}@{}", self.symbol, self.sec_type, self.exchange),
        }
    }
}

/// Contract details, including the venue's liquid-hours calendar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractDetails {
    pub instrument: Instrument,
    /// `YYYYMMDD:HHMM-HHMM[,...];YYYYMMDD:CLOSED`
    pub liquid_hours: String,
    pub time_zone_id: String,
}

/// Model greeks attached to an option quote.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelGreeks {
    pub implied_vol: f64,
    pub delta: f64,
    pub gamma: f64,
    pub vega: f64,
    pub theta: f64,
    pub underlying_price: Option<f64>,
}

/// Point-in-time quote for one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteSnapshot {
    pub instrument: Instrument,
    pub bid: Decimal,
    pub ask: Decimal,
    pub bid_size: Decimal,
    pub ask_size: Decimal,
    pub volume: Decimal,
    pub greeks: Option<ModelGreeks>,
}

impl QuoteSnapshot {
    /// Convert an option quote into a chain contract. Returns None for
    /// instruments that are not fully specified options.
    pub fn to_contract(&self) -> Option<Contract> {
        let inst = &self.instrument;
        if inst.sec_type != SecurityType::Option {
            return None;
        }
        let greeks = self.greeks;
        Some(Contract {
            local_symbol: inst.local_symbol.clone()?,
            underlying: inst.symbol.clone(),
            trading_class: inst.trading_class.clone().unwrap_or_else(|| inst.symbol.clone()),
            strike: inst.strike?,
            right: inst.right?,
            expiration: inst.expiration?,
            bid: self.bid,
            ask: self.ask,
            bid_size: self.bid_size,
            ask_size: self.ask_size,
            volume: self.volume,
            implied_vol: greeks.map(|g| g.implied_vol),
            delta: greeks.map(|g| g.delta),
            gamma: greeks.map(|g| g.gamma),
            vega: greeks.map(|g| g.vega),
            theta: greeks.map(|g| g.theta),
            underlying_price: greeks.and_then(|g| g.underlying_price),
        })
    }
}

// ---------------------------------------------------------------------------
// Orders and events
// ---------------------------------------------------------------------------

/// Raw order status as reported by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrokerOrderStatus {
    PendingSubmit,
    PreSubmitted,
    Submitted,
    Filled,
    Cancelled,
    ApiCancelled,
    Inactive,
}

impl BrokerOrderStatus {
    pub fn to_order_state(self) -> OrderState {
        match self {
            BrokerOrderStatus::PendingSubmit => OrderState::Pending,
            BrokerOrderStatus::PreSubmitted | BrokerOrderStatus::Submitted => OrderState::Active,
            BrokerOrderStatus::Filled => OrderState::Filled,
            BrokerOrderStatus::Cancelled | BrokerOrderStatus::ApiCancelled => OrderState::Cancelled,
            BrokerOrderStatus::Inactive => OrderState::Rejected,
        }
    }
}

/// Returned by `place_order`.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderHandle {
    pub order_id: OrderId,
    pub instrument: Instrument,
    pub side: OrderSide,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderStatusUpdate {
    pub order_id: OrderId,
    pub local_symbol: String,
    pub status: BrokerOrderStatus,
    pub filled: u32,
    pub remaining: u32,
    pub avg_fill_price: Decimal,
}

/// Events published by a broker session.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    OrderStatus(OrderStatusUpdate),
    Position(PositionEntry),
    Disconnected,
}

// ---------------------------------------------------------------------------
// Session trait
// ---------------------------------------------------------------------------

/// A brokerage connection.
///
/// Calls fail with `anyhow` errors; the engine decides which failures are
/// retried. Events are delivered on the channel returned by `subscribe`.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    async fn connect(&self, host: &str, port: u16, client_id: i32) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Resolve specifications to tradable instruments. Unknown ones are
    /// omitted from the result.
    async fn qualify_contracts(&self, instruments: &[Instrument]) -> Result<Vec<Instrument>>;

    /// Details for every contract matching a (possibly partial) specification.
    async fn contract_details(&self, instrument: &Instrument) -> Result<Vec<ContractDetails>>;

    async fn option_expirations(&self, underlying: &Instrument) -> Result<BTreeSet<NaiveDate>>;

    async fn quotes_snapshot(&self, instruments: &[Instrument]) -> Result<Vec<QuoteSnapshot>>;

    /// Submit a market order.
    async fn place_order(
        &self,
        instrument: &Instrument,
        side: OrderSide,
        quantity: u32,
    ) -> Result<OrderHandle>;

    /// Current status of the session's working and completed orders.
    async fn open_orders(&self) -> Result<Vec<OrderStatusUpdate>>;

    async fn positions(&self) -> Result<Vec<PositionEntry>>;

    /// Take the event stream. Only one subscriber is supported.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<BrokerEvent>;
}
