//! Shared types for the THETA engine.
//!
//! These types form the data model used across all modules: market bars,
//! regimes, option contracts and chains, spread candidates, order state and
//! the error taxonomy. Strategy, broker and engine modules depend on them
//! without depending on each other.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Bars
// ---------------------------------------------------------------------------

/// One daily OHLC bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyBar {
    pub date: NaiveDate,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
}

/// One intraday OHLC bar, timestamped at bar open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntradayBar {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
}

// ---------------------------------------------------------------------------
// Regimes
// ---------------------------------------------------------------------------

/// Trend of the underlying relative to its 20-day average.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrendRegime {
    Down,
    Up,
}

impl TrendRegime {
    /// Binary flag: 1 for uptrend, 0 for downtrend.
    pub fn as_flag(self) -> u8 {
        match self {
            TrendRegime::Down => 0,
            TrendRegime::Up => 1,
        }
    }
}

/// Volatility state of the vol proxy (20-day vs 60-day average).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolRegime {
    Compressed,
    Elevated,
}

impl VolRegime {
    /// Binary flag: 1 for elevated, 0 for compressed.
    pub fn as_flag(self) -> u8 {
        match self {
            VolRegime::Compressed => 0,
            VolRegime::Elevated => 1,
        }
    }
}

/// Regimes computed once per day before the open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegimeSnapshot {
    pub date: NaiveDate,
    pub trend: TrendRegime,
    pub vol: VolRegime,
}

impl fmt::Display for RegimeSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} trend_regime={} vol_regime={}",
            self.date,
            self.trend.as_flag(),
            self.vol.as_flag()
        )
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Option right.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionRight {
    Call,
    Put,
}

impl fmt::Display for OptionRight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionRight::Call => write!(f, "C"),
            OptionRight::Put => write!(f, "P"),
        }
    }
}

impl std::str::FromStr for OptionRight {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "c" | "call" => Ok(OptionRight::Call),
            "p" | "put" => Ok(OptionRight::Put),
            _ => Err(anyhow::anyhow!("Unknown option right: {s}")),
        }
    }
}

/// Expected move and strike targets for the day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectedMove {
    pub date: NaiveDate,
    /// Fraction of spot (0.005 = 0.5%).
    pub fraction: f64,
    pub short_strike: Decimal,
    pub long_strike: Decimal,
    pub side: OptionRight,
}

/// A quoted option contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    /// Broker local symbol, unique within a chain.
    pub local_symbol: String,
    pub underlying: String,
    pub trading_class: String,
    pub strike: Decimal,
    pub right: OptionRight,
    pub expiration: NaiveDate,
    pub bid: Decimal,
    pub ask: Decimal,
    pub bid_size: Decimal,
    pub ask_size: Decimal,
    pub volume: Decimal,
    pub implied_vol: Option<f64>,
    pub delta: Option<f64>,
    pub gamma: Option<f64>,
    pub vega: Option<f64>,
    pub theta: Option<f64>,
    pub underlying_price: Option<f64>,
}

impl Contract {
    /// Mid of bid and ask.
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / dec!(2)
    }

    /// Quoted spread as a percentage of mid. Zero when mid is zero.
    pub fn spread_pct(&self) -> Decimal {
        let mid = self.mid();
        if mid.is_zero() {
            return Decimal::ZERO;
        }
        ((self.ask - self.bid) / mid * dec!(100)).round_dp(2)
    }

    /// Bid and ask are present and not crossed.
    pub fn has_valid_quote(&self) -> bool {
        self.bid >= Decimal::ZERO && self.ask > Decimal::ZERO && self.ask >= self.bid
    }

    /// Implied vol, delta, gamma, vega and theta are all present and finite.
    pub fn has_full_greeks(&self) -> bool {
        [self.implied_vol, self.delta, self.gamma, self.vega, self.theta]
            .iter()
            .all(|g| matches!(g, Some(v) if v.is_finite()))
    }

    /// Build a fully quoted sample contract for tests.
    #[cfg(test)]
    pub fn sample(strike: Decimal, right: OptionRight) -> Self {
        let expiration = NaiveDate::from_ymd_opt(2024, 5, 17).unwrap_or_default();
        Contract {
            local_symbol: format_local_symbol("SPXW", expiration, right, strike),
            underlying: "SPX".to_string(),
            trading_class: "SPXW".to_string(),
            strike,
            right,
            expiration,
            bid: dec!(1.00),
            ask: dec!(1.10),
            bid_size: dec!(10),
            ask_size: dec!(10),
            volume: dec!(100),
            implied_vol: Some(0.12),
            delta: Some(-0.10),
            gamma: Some(0.01),
            vega: Some(0.5),
            theta: Some(-1.2),
            underlying_price: Some(5000.0),
        }
    }
}

impl fmt::Display for Contract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} {}{} {}) bid {} / ask {}",
            self.local_symbol.trim(),
            self.underlying,
            self.strike,
            self.right,
            self.expiration,
            self.bid,
            self.ask
        )
    }
}

// ---------------------------------------------------------------------------
// Local symbol codec
// ---------------------------------------------------------------------------

/// Components of an IB-style option local symbol such as `SPXW  240517P05200000`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionSymbol {
    pub root: String,
    pub expiration: NaiveDate,
    pub right: OptionRight,
    pub strike: Decimal,
}

/// Parse an option local symbol: root, then `YYMMDD`, right, strike × 1000.
pub fn parse_local_symbol(symbol: &str) -> anyhow::Result<OptionSymbol> {
    let mut parts = symbol.split_whitespace();
    let (root, body) = match (parts.next(), parts.next(), parts.next()) {
        (Some(root), Some(body), None) => (root, body),
        _ => anyhow::bail!("Malformed option local symbol: {symbol:?}"),
    };

    if body.len() != 15 || !body.is_ascii() {
        anyhow::bail!("Malformed option local symbol body: {body:?}");
    }

    let expiration = NaiveDate::parse_from_str(&format!("20{}", &body[..6]), "%Y%m%d")
        .map_err(|e| anyhow::anyhow!("Bad expiration in {symbol:?}: {e}"))?;
    let right: OptionRight = body[6..7].parse()?;
    let strike_milli: i64 = body[7..]
        .parse()
        .map_err(|e| anyhow::anyhow!("Bad strike in {symbol:?}: {e}"))?;

    Ok(OptionSymbol {
        root: root.to_string(),
        expiration,
        right,
        strike: Decimal::new(strike_milli, 3).normalize(),
    })
}

/// Format an option local symbol with the root padded to six characters.
pub fn format_local_symbol(
    root: &str,
    expiration: NaiveDate,
    right: OptionRight,
    strike: Decimal,
) -> String {
    let milli = (strike * dec!(1000)).trunc().to_i64().unwrap_or_default();
    format!(
        "{root:<6}{:02}{:02}{:02}{right}{milli:08}",
        expiration.year() % 100,
        expiration.month(),
        expiration.day(),
    )
}

// ---------------------------------------------------------------------------
// Chain and spread
// ---------------------------------------------------------------------------

/// Quoted contracts for one underlying and expiration, ordered by strike and
/// unique by local symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainSnapshot {
    pub underlying: String,
    pub expiration: NaiveDate,
    contracts: Vec<Contract>,
}

impl ChainSnapshot {
    /// Build a snapshot. Duplicate local symbols keep their first quote;
    /// contracts are sorted by strike (stable, so equal strikes keep input order).
    pub fn new(underlying: &str, expiration: NaiveDate, contracts: Vec<Contract>) -> Self {
        let mut seen = std::collections::HashSet::new();
        let mut unique: Vec<Contract> = contracts
            .into_iter()
            .filter(|c| seen.insert(c.local_symbol.clone()))
            .collect();
        unique.sort_by(|a, b| a.strike.cmp(&b.strike));

        Self {
            underlying: underlying.to_string(),
            expiration,
            contracts: unique,
        }
    }

    pub fn contracts(&self) -> &[Contract] {
        &self.contracts
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }
}

/// A validated two-leg credit spread.
#[derive(Debug, Clone, PartialEq)]
pub struct SpreadCandidate {
    pub short_leg: Contract,
    pub long_leg: Contract,
    pub width: Decimal,
}

impl SpreadCandidate {
    pub fn right(&self) -> OptionRight {
        self.short_leg.right
    }

    /// Credit when crossing the spread: sell at the short bid, buy at the long ask.
    pub fn market_credit(&self) -> Decimal {
        (self.short_leg.bid - self.long_leg.ask).round_dp(2)
    }

    /// Credit at both mids.
    pub fn mid_credit(&self) -> Decimal {
        (self.short_leg.mid() - self.long_leg.mid()).round_dp(2)
    }
}

// ---------------------------------------------------------------------------
// Orders and positions
// ---------------------------------------------------------------------------

/// Broker-assigned order id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderId(pub u64);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Order direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Which leg of the spread an order belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LegRole {
    /// Protective leg, bought first.
    Long,
    /// Premium leg, sold after the long leg is acknowledged.
    Short,
}

impl LegRole {
    pub fn side(self) -> OrderSide {
        match self {
            LegRole::Long => OrderSide::Buy,
            LegRole::Short => OrderSide::Sell,
        }
    }
}

impl fmt::Display for LegRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LegRole::Long => write!(f, "long"),
            LegRole::Short => write!(f, "short"),
        }
    }
}

/// Lifecycle of one leg order as seen by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    Pending,
    Active,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderState {
    /// The broker has accepted the order (working or done).
    pub fn is_acknowledged(self) -> bool {
        matches!(self, OrderState::Active | OrderState::Filled)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Cancelled | OrderState::Rejected
        )
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderState::Pending => "Pending",
            OrderState::Active => "Active",
            OrderState::Filled => "Filled",
            OrderState::Cancelled => "Cancelled",
            OrderState::Rejected => "Rejected",
        };
        write!(f, "{s}")
    }
}

/// Net position in one contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionEntry {
    pub local_symbol: String,
    /// Signed quantity: positive long, negative short.
    pub quantity: i64,
    pub avg_cost: Decimal,
}

/// Contract → position mapping, rebuilt from broker position events.
#[derive(Debug, Clone, Default)]
pub struct PositionTable {
    entries: HashMap<String, PositionEntry>,
}

impl PositionTable {
    /// Apply a position update. A zero quantity removes the entry.
    pub fn apply(&mut self, entry: PositionEntry) {
        if entry.quantity == 0 {
            self.entries.remove(&entry.local_symbol);
        } else {
            self.entries.insert(entry.local_symbol.clone(), entry);
        }
    }

    /// Replace the whole table (used after reconnection).
    pub fn replace_all(&mut self, entries: Vec<PositionEntry>) {
        self.entries.clear();
        for entry in entries {
            self.apply(entry);
        }
    }

    pub fn quantity(&self, local_symbol: &str) -> i64 {
        self.entries.get(local_symbol).map_or(0, |e| e.quantity)
    }

    pub fn get(&self, local_symbol: &str) -> Option<&PositionEntry> {
        self.entries.get(local_symbol)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A fill reported by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillRecord {
    pub order_id: OrderId,
    pub role: LegRole,
    pub local_symbol: String,
    pub quantity: u32,
    pub avg_price: Decimal,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// How far an error reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// Transient: retry with bounded attempts.
    Retryable,
    /// Abort today's entry attempt; the session keeps running.
    Entry,
    /// Terminate the session.
    Session,
}

/// Spread validation failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Incomplete contracts found: {resolved} distinct tradable legs resolved, need 2")]
    IncompleteLegs { resolved: usize },

    #[error("Legs differ in right or expiration: {short} vs {long}")]
    LegMismatch { short: String, long: String },

    #[error("Width between short and long strike is {actual}, expected {expected}")]
    WidthMismatch { expected: Decimal, actual: Decimal },
}

impl ValidationError {
    /// Incomplete legs only warn; a structural mismatch points at a chain or
    /// selection defect and is raised as an error.
    pub fn is_defect(&self) -> bool {
        !matches!(self, ValidationError::IncompleteLegs { .. })
    }
}

/// Engine error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Connectivity error after {attempts} attempts: {message}")]
    Connectivity { attempts: u32, message: String },

    #[error("Option chain incomplete: {0}")]
    ChainIncomplete(String),

    #[error("Spread validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Order {order_id} ({local_symbol}) rejected")]
    OrderRejected {
        order_id: OrderId,
        local_symbol: String,
    },

    #[error("Order {order_id} ({local_symbol}) cancelled after acknowledgment")]
    OrderCancelledPostAck {
        order_id: OrderId,
        local_symbol: String,
    },

    /// Unknown to the broker once the session came back.
    #[error("Order {order_id} ({local_symbol}) lost")]
    OrderLost {
        order_id: OrderId,
        local_symbol: String,
    },

    #[error("Timed out waiting for acknowledgment of order {0}")]
    AckTimeout(OrderId),

    #[error("Venue closed on {0}")]
    VenueClosed(NaiveDate),

    #[error("Insufficient history for {series}: need {required} bars, have {available}")]
    InsufficientHistory {
        series: String,
        required: usize,
        available: usize,
    },

    #[error("No {ticker} bar at or after the {anchor} anchor")]
    AnchorPriceUnavailable { ticker: String, anchor: String },

    #[error("Invalid market input: {0}")]
    InvalidInput(String),

    #[error("Broker error: {0}")]
    Broker(String),

    /// A broker call failed because the session dropped; the caller
    /// reconnects and tries again.
    #[error("Broker connection lost: {0}")]
    ConnectionLost(String),

    #[error("Market data error: {0}")]
    MarketData(String),
}

impl EngineError {
    pub fn scope(&self) -> ErrorScope {
        match self {
            EngineError::ChainIncomplete(_) | EngineError::ConnectionLost(_) => {
                ErrorScope::Retryable
            }
            EngineError::Connectivity { .. } | EngineError::VenueClosed(_) => ErrorScope::Session,
            _ => ErrorScope::Entry,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_local_symbol() {
        let sym = parse_local_symbol("SPXW  240517P05200000").unwrap();
        assert_eq!(sym.root, "SPXW");
        assert_eq!(sym.expiration, NaiveDate::from_ymd_opt(2024, 5, 17).unwrap());
        assert_eq!(sym.right, OptionRight::Put);
        assert_eq!(sym.strike, dec!(5200));
    }

    #[test]
    fn test_parse_fractional_strike() {
        let sym = parse_local_symbol("SPY   240517C00512500").unwrap();
        assert_eq!(sym.root, "SPY");
        assert_eq!(sym.right, OptionRight::Call);
        assert_eq!(sym.strike, dec!(512.5));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_local_symbol("SPXW").is_err());
        assert!(parse_local_symbol("SPXW  240517X05200000").is_err());
        assert!(parse_local_symbol("SPXW  2405P05200000").is_err());
    }

    #[test]
    fn test_format_local_symbol() {
        let exp = NaiveDate::from_ymd_opt(2024, 5, 17).unwrap();
        assert_eq!(
            format_local_symbol("SPXW", exp, OptionRight::Put, dec!(5200)),
            "SPXW  240517P05200000"
        );
        assert_eq!(
            format_local_symbol("SPY", exp, OptionRight::Call, dec!(512.5)),
            "SPY   240517C00512500"
        );
    }

    #[test]
    fn test_chain_dedups_and_sorts() {
        let mut dup = Contract::sample(dec!(4970), OptionRight::Put);
        dup.bid = dec!(9.99);
        let chain = ChainSnapshot::new(
            "SPX",
            dup.expiration,
            vec![
                Contract::sample(dec!(4980), OptionRight::Put),
                Contract::sample(dec!(4970), OptionRight::Put),
                dup,
            ],
        );
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.contracts()[0].strike, dec!(4970));
        // First quote wins
        assert_eq!(chain.contracts()[0].bid, dec!(1.00));
    }

    #[test]
    fn test_credit_quotes() {
        let mut short = Contract::sample(dec!(4975), OptionRight::Put);
        short.bid = dec!(10.00);
        short.ask = dec!(10.20);
        let mut long = Contract::sample(dec!(4970), OptionRight::Put);
        long.bid = dec!(3.80);
        long.ask = dec!(4.00);
        let spread = SpreadCandidate {
            short_leg: short,
            long_leg: long,
            width: dec!(5),
        };
        assert_eq!(spread.market_credit(), dec!(6.00));
        assert_eq!(spread.mid_credit(), dec!(6.10));
    }

    #[test]
    fn test_full_greeks_requires_all() {
        let mut c = Contract::sample(dec!(4970), OptionRight::Put);
        assert!(c.has_full_greeks());
        c.vega = None;
        assert!(!c.has_full_greeks());
        c.vega = Some(f64::NAN);
        assert!(!c.has_full_greeks());
    }

    #[test]
    fn test_position_table_zero_removes() {
        let mut table = PositionTable::default();
        table.apply(PositionEntry {
            local_symbol: "A".into(),
            quantity: -1,
            avg_cost: dec!(10),
        });
        assert_eq!(table.quantity("A"), -1);
        table.apply(PositionEntry {
            local_symbol: "A".into(),
            quantity: 0,
            avg_cost: dec!(0),
        });
        assert!(table.is_empty());
    }

    #[test]
    fn test_error_scopes() {
        assert_eq!(
            EngineError::ChainIncomplete("x".into()).scope(),
            ErrorScope::Retryable
        );
        assert_eq!(
            EngineError::VenueClosed(NaiveDate::from_ymd_opt(2024, 5, 18).unwrap()).scope(),
            ErrorScope::Session
        );
        assert_eq!(
            EngineError::ConnectionLost("not connected".into()).scope(),
            ErrorScope::Retryable
        );
        assert_eq!(
            EngineError::Broker("no such contract".into()).scope(),
            ErrorScope::Entry
        );
        let v: EngineError = ValidationError::IncompleteLegs { resolved: 1 }.into();
        assert_eq!(v.scope(), ErrorScope::Entry);
    }

    #[test]
    fn test_order_error_messages() {
        let rejected = EngineError::OrderRejected {
            order_id: OrderId(7),
            local_symbol: "SPXW  240517P04970000".into(),
        };
        assert_eq!(rejected.to_string(), "Order 7 (SPXW  240517P04970000) rejected");
        assert_eq!(rejected.scope(), ErrorScope::Entry);

        let cancelled = EngineError::OrderCancelledPostAck {
            order_id: OrderId(8),
            local_symbol: "SPXW  240517P04975000".into(),
        };
        assert!(cancelled.to_string().ends_with("cancelled after acknowledgment"));
    }
}
