//! In-memory paper broker.
//!
//! Serves one reference index and a single 0DTE chain, fills market orders
//! immediately at the touch (buy at the ask, sell at the bid) and publishes
//! the same event sequence a live session would: `PendingSubmit`,
//! `Submitted`, then `Filled` plus a position update.
//!
//! Fault injection hooks let callers exercise the engine's failure paths:
//! failed connects, disconnects, rejections, post-acknowledgment
//! cancellations, held acknowledgments, degraded quotes and forgotten orders.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    BrokerEvent, BrokerOrderStatus, BrokerSession, ContractDetails, Instrument, ModelGreeks,
    OrderHandle, OrderStatusUpdate, QuoteSnapshot, SecurityType,
};
use crate::types::{format_local_symbol, OptionRight, OrderId, OrderSide, PositionEntry};

// ---------------------------------------------------------------------------
// Fixture format
// ---------------------------------------------------------------------------

/// Chain fixture. Quotes carry no expiration; they are listed on the
/// session date when loaded.
#[derive(Debug, Clone, Deserialize)]
pub struct ChainFixture {
    pub underlying: String,
    pub trading_class: String,
    pub exchange: String,
    pub currency: String,
    pub spot: Decimal,
    pub quotes: Vec<FixtureQuote>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FixtureQuote {
    pub strike: Decimal,
    pub right: OptionRight,
    pub bid: Decimal,
    pub ask: Decimal,
    #[serde(default)]
    pub bid_size: Decimal,
    #[serde(default)]
    pub ask_size: Decimal,
    #[serde(default)]
    pub volume: Decimal,
    #[serde(default)]
    pub greeks: Option<ModelGreeks>,
}

impl ChainFixture {
    pub fn load(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read chain fixture: {path}"))?;
        serde_json::from_str(&raw).with_context(|| format!("Invalid chain fixture: {path}"))
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct PaperOrder {
    instrument: Instrument,
    side: OrderSide,
    quantity: u32,
    status: BrokerOrderStatus,
    filled: u32,
    avg_fill_price: Decimal,
}

impl PaperOrder {
    fn status_update(&self, order_id: OrderId) -> OrderStatusUpdate {
        OrderStatusUpdate {
            order_id,
            local_symbol: self.instrument.local_symbol.clone().unwrap_or_default(),
            status: self.status,
            filled: self.filled,
            remaining: self.quantity - self.filled,
            avg_fill_price: self.avg_fill_price,
        }
    }
}

struct PaperState {
    connected: bool,
    failing_connects: u32,
    events: mpsc::UnboundedSender<BrokerEvent>,
    next_order_id: u64,
    orders: BTreeMap<OrderId, PaperOrder>,
    placed: Vec<OrderHandle>,
    positions: HashMap<String, PositionEntry>,
    rejecting: BTreeSet<String>,
    cancelling: HashMap<String, u32>,
    holding_acks: bool,
    degraded_snapshots: u32,
}

impl PaperState {
    fn emit(&self, event: BrokerEvent) {
        // A dropped receiver just means nobody is listening.
        let _ = self.events.send(event);
    }

    fn set_status(&mut self, order_id: OrderId, status: BrokerOrderStatus) {
        if let Some(order) = self.orders.get_mut(&order_id) {
            order.status = status;
            let update = order.status_update(order_id);
            self.emit(BrokerEvent::OrderStatus(update));
        }
    }
}

/// Simulated brokerage session.
pub struct PaperBroker {
    session_date: NaiveDate,
    liquid_hours: String,
    time_zone_id: String,
    reference: Instrument,
    spot: Decimal,
    chain: Vec<QuoteSnapshot>,
    state: Mutex<PaperState>,
}

impl PaperBroker {
    /// Build a broker serving `chain` as the listed contracts for `session_date`.
    pub fn new(
        session_date: NaiveDate,
        liquid_hours: String,
        reference: Instrument,
        spot: Decimal,
        chain: Vec<QuoteSnapshot>,
    ) -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self {
            session_date,
            liquid_hours,
            time_zone_id: "US/Eastern".to_string(),
            reference,
            spot,
            chain,
            state: Mutex::new(PaperState {
                connected: false,
                failing_connects: 0,
                events: tx,
                next_order_id: 1,
                orders: BTreeMap::new(),
                placed: Vec::new(),
                positions: HashMap::new(),
                rejecting: BTreeSet::new(),
                cancelling: HashMap::new(),
                holding_acks: false,
                degraded_snapshots: 0,
            }),
        }
    }

    /// List a fixture's quotes on `session_date`.
    pub fn from_fixture(fixture: ChainFixture, session_date: NaiveDate, liquid_hours: String) -> Self {
        let reference = Instrument::index(&fixture.underlying, &fixture.exchange, &fixture.currency);
        let chain = fixture
            .quotes
            .iter()
            .map(|q| {
                let local_symbol =
                    format_local_symbol(&fixture.trading_class, session_date, q.right, q.strike);
                QuoteSnapshot {
                    instrument: Instrument {
                        symbol: fixture.underlying.clone(),
                        sec_type: SecurityType::Option,
                        exchange: "SMART".to_string(),
                        currency: fixture.currency.clone(),
                        expiration: Some(session_date),
                        strike: Some(q.strike),
                        right: Some(q.right),
                        trading_class: Some(fixture.trading_class.clone()),
                        local_symbol: Some(local_symbol),
                        con_id: None,
                    },
                    bid: q.bid,
                    ask: q.ask,
                    bid_size: q.bid_size,
                    ask_size: q.ask_size,
                    volume: q.volume,
                    greeks: q.greeks,
                }
            })
            .collect();

        Self::new(session_date, liquid_hours, reference, fixture.spot, chain)
    }

    fn state(&self) -> MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn find_quote(&self, local_symbol: &str) -> Option<&QuoteSnapshot> {
        self.chain
            .iter()
            .find(|q| q.instrument.local_symbol.as_deref() == Some(local_symbol))
    }

    fn con_id_of(&self, local_symbol: &str) -> Option<i64> {
        self.chain
            .iter()
            .position(|q| q.instrument.local_symbol.as_deref() == Some(local_symbol))
            .map(|i| 1_000 + i as i64)
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.state().connected {
            Ok(())
        } else {
            bail!("Paper broker not connected")
        }
    }

    /// Run the post-submission lifecycle of an order: acknowledge, then
    /// either cancel (if armed) or fill at the touch.
    fn work_order(&self, state: &mut PaperState, order_id: OrderId) {
        state.set_status(order_id, BrokerOrderStatus::Submitted);

        let Some(order) = state.orders.get(&order_id).cloned() else {
            return;
        };
        let symbol = order.instrument.local_symbol.clone().unwrap_or_default();

        if let Some(remaining) = state.cancelling.get_mut(&symbol) {
            if *remaining > 0 {
                *remaining -= 1;
                info!(%order_id, symbol = %symbol.trim(), "Paper order cancelled by venue");
                state.set_status(order_id, BrokerOrderStatus::Cancelled);
                return;
            }
        }

        let price = match (self.find_quote(&symbol), order.side) {
            (Some(q), OrderSide::Buy) => q.ask,
            (Some(q), OrderSide::Sell) => q.bid,
            (None, _) => Decimal::ZERO,
        };

        if let Some(o) = state.orders.get_mut(&order_id) {
            o.filled = o.quantity;
            o.avg_fill_price = price;
        }
        state.set_status(order_id, BrokerOrderStatus::Filled);

        let signed = match order.side {
            OrderSide::Buy => i64::from(order.quantity),
            OrderSide::Sell => -i64::from(order.quantity),
        };
        let entry = state
            .positions
            .entry(symbol.clone())
            .or_insert_with(|| PositionEntry {
                local_symbol: symbol.clone(),
                quantity: 0,
                avg_cost: Decimal::ZERO,
            });
        entry.quantity += signed;
        entry.avg_cost = price;
        let update = entry.clone();
        if update.quantity == 0 {
            state.positions.remove(&symbol);
        }
        state.emit(BrokerEvent::Position(update));

        debug!(%order_id, symbol = %symbol.trim(), %price, "Paper order filled");
    }

    // -- Fault injection ----------------------------------------------------

    /// The next `n` connection attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.state().failing_connects = n;
    }

    /// Drop the session and publish a disconnect event.
    pub fn inject_disconnect(&self) {
        let mut state = self.state();
        state.connected = false;
        state.emit(BrokerEvent::Disconnected);
    }

    /// Orders on this contract are rejected before acknowledgment.
    pub fn reject_orders_for(&self, local_symbol: &str) {
        self.state().rejecting.insert(local_symbol.to_string());
    }

    /// The next `times` orders on this contract are cancelled right after
    /// being acknowledged.
    pub fn cancel_orders_for(&self, local_symbol: &str, times: u32) {
        self.state().cancelling.insert(local_symbol.to_string(), times);
    }

    /// Leave new orders in `PendingSubmit` until [`acknowledge`](Self::acknowledge).
    pub fn hold_acknowledgments(&self, hold: bool) {
        self.state().holding_acks = hold;
    }

    /// Release a held order.
    pub fn acknowledge(&self, order_id: OrderId) {
        let mut state = self.state();
        self.work_order(&mut state, order_id);
    }

    /// Strip greeks from the next `n` quote snapshots.
    pub fn degrade_next_snapshots(&self, n: u32) {
        self.state().degraded_snapshots = n;
    }

    /// Drop an order from the book, as if the venue lost it.
    pub fn forget_order(&self, order_id: OrderId) {
        self.state().orders.remove(&order_id);
    }

    /// Every order handed out so far, in submission order.
    pub fn placed_orders(&self) -> Vec<OrderHandle> {
        self.state().placed.clone()
    }

    pub fn session_date(&self) -> NaiveDate {
        self.session_date
    }
}

#[async_trait]
impl BrokerSession for PaperBroker {
    async fn connect(&self, host: &str, port: u16, client_id: i32) -> Result<()> {
        let mut state = self.state();
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            bail!("Connection refused by {host}:{port}");
        }
        state.connected = true;
        info!(host, port, client_id, "Paper broker connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.state().connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state().connected
    }

    async fn qualify_contracts(&self, instruments: &[Instrument]) -> Result<Vec<Instrument>> {
        self.ensure_connected()?;
        let mut qualified = Vec::new();
        for inst in instruments {
            match inst.sec_type {
                SecurityType::Index if inst.symbol == self.reference.symbol => {
                    let mut q = self.reference.clone();
                    q.con_id = Some(416_904);
                    qualified.push(q);
                }
                SecurityType::Option => {
                    let Some(symbol) = inst.local_symbol.as_deref() else {
                        continue;
                    };
                    if let Some(quote) = self.find_quote(symbol) {
                        let mut q = quote.instrument.clone();
                        q.con_id = self.con_id_of(symbol);
                        qualified.push(q);
                    } else {
                        warn!(symbol = %symbol.trim(), "Unknown contract, not qualified");
                    }
                }
                _ => warn!(symbol = %inst.symbol, "Unknown instrument, not qualified"),
            }
        }
        Ok(qualified)
    }

    async fn contract_details(&self, instrument: &Instrument) -> Result<Vec<ContractDetails>> {
        self.ensure_connected()?;
        let details = |inst: &Instrument| ContractDetails {
            instrument: inst.clone(),
            liquid_hours: self.liquid_hours.clone(),
            time_zone_id: self.time_zone_id.clone(),
        };

        match instrument.sec_type {
            SecurityType::Index if instrument.symbol == self.reference.symbol => {
                Ok(vec![details(&self.reference)])
            }
            SecurityType::Index => Ok(Vec::new()),
            SecurityType::Option => Ok(self
                .chain
                .iter()
                .map(|q| &q.instrument)
                .filter(|i| i.symbol == instrument.symbol)
                .filter(|i| instrument.expiration.is_none() || i.expiration == instrument.expiration)
                .filter(|i| instrument.right.is_none() || i.right == instrument.right)
                .filter(|i| instrument.strike.is_none() || i.strike == instrument.strike)
                .filter(|i| {
                    instrument.trading_class.is_none() || i.trading_class == instrument.trading_class
                })
                .map(|i| {
                    let mut i = i.clone();
                    i.con_id = i.local_symbol.as_deref().and_then(|s| self.con_id_of(s));
                    details(&i)
                })
                .collect()),
        }
    }

    async fn option_expirations(&self, underlying: &Instrument) -> Result<BTreeSet<NaiveDate>> {
        self.ensure_connected()?;
        Ok(self
            .chain
            .iter()
            .filter(|q| q.instrument.symbol == underlying.symbol)
            .filter_map(|q| q.instrument.expiration)
            .collect())
    }

    async fn quotes_snapshot(&self, instruments: &[Instrument]) -> Result<Vec<QuoteSnapshot>> {
        self.ensure_connected()?;
        let degrade = {
            let mut state = self.state();
            let degrade = state.degraded_snapshots > 0;
            state.degraded_snapshots = state.degraded_snapshots.saturating_sub(1);
            degrade
        };

        let mut quotes = Vec::with_capacity(instruments.len());
        for inst in instruments {
            if inst.sec_type == SecurityType::Index {
                quotes.push(QuoteSnapshot {
                    instrument: inst.clone(),
                    bid: self.spot,
                    ask: self.spot,
                    bid_size: Decimal::ZERO,
                    ask_size: Decimal::ZERO,
                    volume: Decimal::ZERO,
                    greeks: None,
                });
                continue;
            }
            let found = inst.local_symbol.as_deref().and_then(|s| self.find_quote(s));
            if let Some(q) = found {
                let mut q = q.clone();
                if degrade {
                    q.greeks = None;
                }
                quotes.push(q);
            }
        }
        Ok(quotes)
    }

    async fn place_order(
        &self,
        instrument: &Instrument,
        side: OrderSide,
        quantity: u32,
    ) -> Result<OrderHandle> {
        let symbol = instrument
            .local_symbol
            .clone()
            .ok_or_else(|| anyhow!("Cannot order unqualified instrument {}", instrument.describe()))?;

        let mut state = self.state();
        if !state.connected {
            bail!("Paper broker not connected");
        }

        let order_id = OrderId(state.next_order_id);
        state.next_order_id += 1;
        state.orders.insert(
            order_id,
            PaperOrder {
                instrument: instrument.clone(),
                side,
                quantity,
                status: BrokerOrderStatus::PendingSubmit,
                filled: 0,
                avg_fill_price: Decimal::ZERO,
            },
        );
        let handle = OrderHandle {
            order_id,
            instrument: instrument.clone(),
            side,
            quantity,
        };
        state.placed.push(handle.clone());
        info!(%order_id, symbol = %symbol.trim(), %side, quantity, "Paper order placed");

        state.set_status(order_id, BrokerOrderStatus::PendingSubmit);
        if state.rejecting.contains(&symbol) {
            state.set_status(order_id, BrokerOrderStatus::Inactive);
        } else if !state.holding_acks {
            self.work_order(&mut state, order_id);
        }

        Ok(handle)
    }

    async fn open_orders(&self) -> Result<Vec<OrderStatusUpdate>> {
        self.ensure_connected()?;
        let state = self.state();
        Ok(state
            .orders
            .iter()
            .map(|(id, o)| o.status_update(*id))
            .collect())
    }

    async fn positions(&self) -> Result<Vec<PositionEntry>> {
        self.ensure_connected()?;
        Ok(self.state().positions.values().cloned().collect())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<BrokerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state().events = tx;
        rx
    }
}
