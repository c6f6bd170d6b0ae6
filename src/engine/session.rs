//! Session-owned state for one trading day.
//!
//! The runtime owns exactly one `SessionState` and passes it by reference.
//! Leg orders, the position table and fills are written only from broker
//! events (and post-reconnect reconciliation, which replays the broker's own
//! view as events).

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

use crate::broker::{Instrument, OrderStatusUpdate};
use crate::types::{
    ChainSnapshot, Contract, ExpectedMove, FillRecord, LegRole, OrderId, OrderState,
    PositionTable, RegimeSnapshot, SpreadCandidate,
};

/// One leg of the spread and its current order.
#[derive(Debug, Clone)]
pub struct LegOrder {
    pub role: LegRole,
    pub contract: Contract,
    pub instrument: Instrument,
    pub order_id: Option<OrderId>,
    pub state: OrderState,
    pub acknowledged: bool,
    /// The broker lost track of the order across a reconnect.
    pub lost: bool,
    pub resubmits: u32,
    pub filled: u32,
    pub avg_fill_price: Decimal,
}

/// What an order-status update changed on a tracked leg.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub role: LegRole,
    pub order_id: OrderId,
    pub local_symbol: String,
    pub previous: OrderState,
    pub current: OrderState,
    pub was_acknowledged: bool,
    pub resubmits: u32,
    pub filled: u32,
    pub avg_fill_price: Decimal,
}

pub struct SessionState {
    pub session_id: Uuid,
    pub date: NaiveDate,
    pub regime: Option<RegimeSnapshot>,
    pub expected_move: Option<ExpectedMove>,
    pub chain: Option<ChainSnapshot>,
    pub spread: Option<SpreadCandidate>,
    /// Credit from median quotes over the anchor minute, used for marking
    /// when fills are unavailable.
    pub quoted_credit: Option<Decimal>,
    pub positions: PositionTable,
    legs: HashMap<LegRole, LegOrder>,
    orders: HashMap<OrderId, LegRole>,
    fills: Vec<FillRecord>,
}

impl SessionState {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            date,
            regime: None,
            expected_move: None,
            chain: None,
            spread: None,
            quoted_credit: None,
            positions: PositionTable::default(),
            legs: HashMap::new(),
            orders: HashMap::new(),
            fills: Vec::new(),
        }
    }

    /// Record the validated spread and the instruments its legs trade as.
    pub fn set_spread(&mut self, spread: SpreadCandidate, long: Instrument, short: Instrument) {
        for (role, contract, instrument) in [
            (LegRole::Long, spread.long_leg.clone(), long),
            (LegRole::Short, spread.short_leg.clone(), short),
        ] {
            self.legs.insert(
                role,
                LegOrder {
                    role,
                    contract,
                    instrument,
                    order_id: None,
                    state: OrderState::Pending,
                    acknowledged: false,
                    lost: false,
                    resubmits: 0,
                    filled: 0,
                    avg_fill_price: Decimal::ZERO,
                },
            );
        }
        self.spread = Some(spread);
    }

    pub fn leg(&self, role: LegRole) -> Option<&LegOrder> {
        self.legs.get(&role)
    }

    /// Attach a freshly placed order to a leg, replacing any previous one.
    pub fn register_order(&mut self, role: LegRole, order_id: OrderId) {
        if let Some(leg) = self.legs.get_mut(&role) {
            if leg.order_id.is_some() {
                leg.resubmits += 1;
            }
            leg.order_id = Some(order_id);
            leg.state = OrderState::Pending;
            leg.acknowledged = false;
            leg.lost = false;
            leg.filled = 0;
            leg.avg_fill_price = Decimal::ZERO;
            self.orders.insert(order_id, role);
        }
    }

    pub fn role_of(&self, order_id: OrderId) -> Option<LegRole> {
        self.orders.get(&order_id).copied()
    }

    /// Apply a broker status report. Returns None for orders that are not
    /// the current order of a leg (unknown or superseded).
    pub fn apply_status(&mut self, update: &OrderStatusUpdate) -> Option<StatusChange> {
        let role = self.role_of(update.order_id)?;
        let leg = self.legs.get_mut(&role)?;
        if leg.order_id != Some(update.order_id) {
            debug!(order_id = %update.order_id, %role, "Status for superseded order ignored");
            return None;
        }

        let previous = leg.state;
        let was_acknowledged = leg.acknowledged;
        let current = update.status.to_order_state();

        // A terminal state is final; late or reordered reports cannot revive it.
        if previous.is_terminal() && previous != current {
            debug!(order_id = %update.order_id, %previous, %current, "Late status ignored");
            return None;
        }

        leg.state = current;
        leg.acknowledged |= current.is_acknowledged();
        if update.filled > 0 {
            leg.filled = update.filled;
            leg.avg_fill_price = update.avg_fill_price;
        }

        Some(StatusChange {
            role,
            order_id: update.order_id,
            local_symbol: update.local_symbol.clone(),
            previous,
            current,
            was_acknowledged,
            resubmits: leg.resubmits,
            filled: leg.filled,
            avg_fill_price: leg.avg_fill_price,
        })
    }

    /// Mark a tracked order the broker no longer knows about.
    pub fn mark_lost(&mut self, order_id: OrderId) -> Option<LegRole> {
        let role = self.role_of(order_id)?;
        let leg = self.legs.get_mut(&role)?;
        if leg.order_id != Some(order_id) {
            return None;
        }
        leg.lost = true;
        leg.state = OrderState::Cancelled;
        Some(role)
    }

    /// Current orders of legs that the broker has not yet acknowledged.
    pub fn unacknowledged_orders(&self) -> Vec<(LegRole, OrderId)> {
        let mut out: Vec<(LegRole, OrderId)> = self
            .legs
            .values()
            .filter(|leg| !leg.acknowledged && !leg.state.is_terminal())
            .filter_map(|leg| leg.order_id.map(|id| (leg.role, id)))
            .collect();
        out.sort_by_key(|(_, id)| *id);
        out
    }

    pub fn record_fill(&mut self, change: &StatusChange) {
        self.fills.push(FillRecord {
            order_id: change.order_id,
            role: change.role,
            local_symbol: change.local_symbol.clone(),
            quantity: change.filled,
            avg_price: change.avg_fill_price,
            timestamp: Utc::now(),
        });
    }

    pub fn fills(&self) -> &[FillRecord] {
        &self.fills
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerOrderStatus;
    use crate::types::OptionRight;
    use rust_decimal_macros::dec;

    fn session() -> SessionState {
        let short = Contract::sample(dec!(4975), OptionRight::Put);
        let long = Contract::sample(dec!(4970), OptionRight::Put);
        let long_inst = Instrument::from_local_symbol("SPX", &long.local_symbol, "SMART").unwrap();
        let short_inst =
            Instrument::from_local_symbol("SPX", &short.local_symbol, "SMART").unwrap();
        let mut s = SessionState::new(short.expiration);
        s.set_spread(
            SpreadCandidate {
                short_leg: short,
                long_leg: long,
                width: dec!(5),
            },
            long_inst,
            short_inst,
        );
        s
    }

    fn update(id: u64, status: BrokerOrderStatus) -> OrderStatusUpdate {
        OrderStatusUpdate {
            order_id: OrderId(id),
            local_symbol: "SPXW  240517P04970000".into(),
            status,
            filled: if status == BrokerOrderStatus::Filled { 1 } else { 0 },
            remaining: 0,
            avg_fill_price: dec!(1.10),
        }
    }

    #[test]
    fn test_tracks_acknowledgment() {
        let mut s = session();
        s.register_order(LegRole::Long, OrderId(1));
        assert_eq!(s.unacknowledged_orders(), vec![(LegRole::Long, OrderId(1))]);

        let change = s.apply_status(&update(1, BrokerOrderStatus::Submitted)).unwrap();
        assert!(!change.was_acknowledged);
        assert_eq!(change.current, OrderState::Active);
        assert!(s.unacknowledged_orders().is_empty());

        let change = s.apply_status(&update(1, BrokerOrderStatus::Filled)).unwrap();
        assert!(change.was_acknowledged);
        assert_eq!(change.filled, 1);
    }

    #[test]
    fn test_unknown_and_superseded_orders_are_ignored() {
        let mut s = session();
        assert!(s.apply_status(&update(9, BrokerOrderStatus::Submitted)).is_none());

        s.register_order(LegRole::Long, OrderId(1));
        s.register_order(LegRole::Long, OrderId(2));
        assert_eq!(s.leg(LegRole::Long).unwrap().resubmits, 1);
        assert!(s.apply_status(&update(1, BrokerOrderStatus::Filled)).is_none());
        assert!(s.apply_status(&update(2, BrokerOrderStatus::Submitted)).is_some());
    }

    #[test]
    fn test_terminal_state_is_final() {
        let mut s = session();
        s.register_order(LegRole::Short, OrderId(3));
        s.apply_status(&update(3, BrokerOrderStatus::Inactive)).unwrap();
        assert!(s.apply_status(&update(3, BrokerOrderStatus::Submitted)).is_none());
        assert_eq!(s.leg(LegRole::Short).unwrap().state, OrderState::Rejected);
    }

    #[test]
    fn test_lost_order_is_marked() {
        let mut s = session();
        s.register_order(LegRole::Short, OrderId(4));
        assert_eq!(s.mark_lost(OrderId(4)), Some(LegRole::Short));
        let leg = s.leg(LegRole::Short).unwrap();
        assert!(leg.lost);
        assert!(s.unacknowledged_orders().is_empty());
    }

    #[test]
    fn test_fills_are_recorded() {
        let mut s = session();
        s.register_order(LegRole::Long, OrderId(1));
        let change = s.apply_status(&update(1, BrokerOrderStatus::Filled)).unwrap();
        s.record_fill(&change);
        assert_eq!(s.fills().len(), 1);
        assert_eq!(s.fills()[0].avg_price, dec!(1.10));
    }
}
