//! End-to-end session scenarios against the paper broker.

use rust_decimal_macros::dec;

use theta::alerts::AlertLevel;
use theta::broker::paper::PaperBroker;
use theta::broker::BrokerSession;
use theta::engine::EngineState;
use theta::types::{OptionRight, OrderId, OrderSide, TrendRegime};

use super::harness::{
    chain_fixture, market_data, paper_broker, session_date, symbol, test_config, Harness,
    MockMarketData,
};

#[tokio::test]
async fn test_full_day_places_long_leg_first_and_marks_spread() {
    let mut h = Harness::standard();

    h.ready().await;
    assert_eq!(h.runtime.state(), EngineState::ConnectedIdle);
    let regime = h.runtime.session().regime.unwrap();
    assert_eq!(regime.trend, TrendRegime::Up);
    assert!(h.sink.has(AlertLevel::Info, "trend_regime=1 vol_regime=0"));

    h.runtime.run_entry().await;
    assert_eq!(h.runtime.state(), EngineState::Monitoring);

    let expected = h.runtime.session().expected_move.clone().unwrap();
    assert_eq!(expected.side, OptionRight::Put);

    let orders = h.broker.placed_orders();
    assert_eq!(orders.len(), 2);
    assert_eq!(orders[0].side, OrderSide::Buy);
    assert_eq!(
        orders[0].instrument.local_symbol.as_deref(),
        Some(symbol(OptionRight::Put, dec!(4970)).as_str())
    );
    assert_eq!(orders[1].side, OrderSide::Sell);
    assert_eq!(
        orders[1].instrument.local_symbol.as_deref(),
        Some(symbol(OptionRight::Put, dec!(4975)).as_str())
    );
    assert!(h.sink.has(AlertLevel::Info, "Short leg found"));
    assert!(h.sink.has(AlertLevel::Info, "Spread credit: market 0.30"));

    h.runtime.pump_events().await;
    let session = h.runtime.session();
    assert_eq!(session.fills().len(), 2);
    assert_eq!(session.positions.quantity(&symbol(OptionRight::Put, dec!(4970))), 1);
    assert_eq!(session.positions.quantity(&symbol(OptionRight::Put, dec!(4975))), -1);

    let mark = h.runtime.mark_position().await.unwrap();
    assert_eq!(mark.entry_credit, dec!(0.30));
    assert_eq!(mark.spread_value, dec!(0.20));
    assert_eq!(mark.pnl_points, dec!(0.10));
    assert_eq!(mark.pnl_total, dec!(10));

    h.runtime.run_exit().await;
    assert_eq!(h.runtime.state(), EngineState::Terminated);
    assert!(!h.broker.is_connected());
    assert!(h.sink.has(AlertLevel::Info, "Program exited at market close"));
    assert!(h.sink.messages(AlertLevel::Error).is_empty());
}

#[tokio::test]
async fn test_mark_uses_anchor_quotes_until_both_legs_fill() {
    let mut h = Harness::standard();
    h.ready().await;
    h.runtime.run_entry().await;

    // The short leg's fill is still queued
    assert_eq!(h.runtime.session().fills().len(), 1);
    let mark = h.runtime.mark_position().await.unwrap();
    assert_eq!(mark.entry_credit, dec!(0.50));

    h.runtime.pump_events().await;
    let mark = h.runtime.mark_position().await.unwrap();
    assert_eq!(mark.entry_credit, dec!(0.30));
}

#[tokio::test]
async fn test_downtrend_sells_call_spread_above_spot() {
    let mut h = Harness::new(test_config(), paper_broker(), market_data(dec!(-0.5)));
    h.ready().await;
    h.runtime.run_entry().await;

    assert_eq!(h.runtime.state(), EngineState::Monitoring);
    let orders = h.broker.placed_orders();
    assert_eq!(
        orders[0].instrument.local_symbol.as_deref(),
        Some(symbol(OptionRight::Call, dec!(5030)).as_str())
    );
    assert_eq!(
        orders[1].instrument.local_symbol.as_deref(),
        Some(symbol(OptionRight::Call, dec!(5025)).as_str())
    );
}

#[tokio::test]
async fn test_missing_greeks_exhaust_chain_retries_without_orders() {
    let mut h = Harness::standard();
    h.broker.degrade_next_snapshots(3);
    h.ready().await;
    h.runtime.run_entry().await;

    assert!(h.broker.placed_orders().is_empty());
    assert_eq!(h.runtime.state(), EngineState::ConnectedIdle);
    assert!(h.runtime.machine().entry_abandoned());
    assert!(h.sink.has(AlertLevel::Error, "gave up after 3 attempts"));

    // No second attempt the same day
    h.runtime.run_entry().await;
    assert!(h.broker.placed_orders().is_empty());
    assert!(h.sink.has(AlertLevel::Warning, "Entry skipped"));
}

#[tokio::test]
async fn test_chain_recovers_within_retry_budget() {
    let mut h = Harness::standard();
    h.broker.degrade_next_snapshots(2);
    h.ready().await;
    h.runtime.run_entry().await;

    assert_eq!(h.runtime.state(), EngineState::Monitoring);
    assert_eq!(h.broker.placed_orders().len(), 2);
}

#[tokio::test]
async fn test_rejected_long_leg_abandons_entry() {
    let mut h = Harness::standard();
    h.broker.reject_orders_for(&symbol(OptionRight::Put, dec!(4970)));
    h.ready().await;
    h.runtime.run_entry().await;

    assert_eq!(h.broker.placed_orders().len(), 1);
    assert_eq!(h.runtime.state(), EngineState::ConnectedIdle);
    assert!(h.runtime.machine().entry_abandoned());
    assert!(!h.runtime.machine().needs_manual_intervention());
    assert!(h.sink.has(AlertLevel::Error, "rejected before acknowledgment"));
}

#[tokio::test]
async fn test_rejected_short_leg_strands_long_leg() {
    let mut h = Harness::standard();
    h.broker.reject_orders_for(&symbol(OptionRight::Put, dec!(4975)));
    h.ready().await;
    h.runtime.run_entry().await;

    assert_eq!(h.broker.placed_orders().len(), 2);
    assert_eq!(h.runtime.state(), EngineState::ConnectedIdle);
    assert!(h.runtime.machine().needs_manual_intervention());
    assert!(h.sink.has(AlertLevel::Error, "manual intervention required"));
}

#[tokio::test]
async fn test_post_ack_cancel_resubmits_leg() {
    let mut h = Harness::standard();
    let short = symbol(OptionRight::Put, dec!(4975));
    h.broker.cancel_orders_for(&short, 1);
    h.ready().await;
    h.runtime.run_entry().await;
    h.runtime.pump_events().await;

    let orders = h.broker.placed_orders();
    assert_eq!(orders.len(), 3);
    assert_eq!(orders[2].side, OrderSide::Sell);
    assert_eq!(orders[2].instrument.local_symbol.as_deref(), Some(short.as_str()));

    assert_eq!(h.runtime.state(), EngineState::Monitoring);
    assert!(h.sink.has(AlertLevel::Warning, "cancelled after acknowledgment"));
    assert!(h.sink.has(AlertLevel::Info, "(attempt 1/3)"));
    assert_eq!(h.runtime.session().positions.quantity(&short), -1);
    assert!(!h.runtime.machine().needs_manual_intervention());
}

#[tokio::test]
async fn test_resubmission_stops_at_limit() {
    let mut cfg = test_config();
    cfg.retry.resubmit_attempts = 2;
    let mut h = Harness::new(cfg, paper_broker(), market_data(dec!(0.5)));
    let short = symbol(OptionRight::Put, dec!(4975));
    h.broker.cancel_orders_for(&short, 10);
    h.ready().await;
    h.runtime.run_entry().await;
    h.runtime.pump_events().await;

    // Original short order plus two replacements
    assert_eq!(h.broker.placed_orders().len(), 4);
    assert!(h.runtime.machine().needs_manual_intervention());
    assert!(h.sink.has(AlertLevel::Error, "resubmission exhausted after 2 attempts"));
    assert_eq!(h.runtime.session().positions.quantity(&short), 0);
}

#[tokio::test]
async fn test_closed_venue_terminates_before_any_request() {
    let date = session_date();
    let broker = std::sync::Arc::new(PaperBroker::from_fixture(
        chain_fixture(),
        date,
        format!("{}:CLOSED", date.format("%Y%m%d")),
    ));
    // No expectations: any market-data call fails the test
    let mut h = Harness::new(test_config(), broker, MockMarketData::new());

    h.runtime.run().await.unwrap();

    assert_eq!(h.runtime.state(), EngineState::Terminated);
    assert!(h.broker.placed_orders().is_empty());
    assert!(h.sink.has(AlertLevel::Error, "Venue closed on 2024-05-17"));
}

#[tokio::test]
async fn test_late_start_after_exit_only_shuts_down() {
    // The session date is in the past, so only the exit trigger is pending
    let mut h = Harness::new(test_config(), paper_broker(), MockMarketData::new());

    h.runtime.run().await.unwrap();

    assert_eq!(h.runtime.state(), EngineState::Terminated);
    assert!(h.broker.placed_orders().is_empty());
    assert!(h.sink.has(AlertLevel::Info, "Program exited at market close"));
}

#[tokio::test]
async fn test_connect_exhaustion_terminates() {
    let mut h = Harness::standard();
    h.broker.fail_next_connects(10);

    h.runtime.run().await.unwrap();

    assert_eq!(h.runtime.state(), EngineState::Terminated);
    assert!(h.sink.has(AlertLevel::Error, "after 3 attempts"));
}

#[tokio::test]
async fn test_transient_connect_failures_are_retried() {
    let mut h = Harness::standard();
    h.broker.fail_next_connects(2);
    h.runtime.start().await;
    assert_eq!(h.runtime.state(), EngineState::ConnectedIdle);
}

#[tokio::test]
async fn test_signal_failure_skips_entry() {
    let mut md = MockMarketData::new();
    md.expect_get_daily_bars().returning(|_, _, _| Ok(Vec::new()));
    let mut h = Harness::new(test_config(), paper_broker(), md);

    h.ready().await;
    assert!(h.runtime.machine().entry_abandoned());
    assert!(h.sink.has(AlertLevel::Error, "Insufficient history"));

    h.runtime.run_entry().await;
    assert!(h.broker.placed_orders().is_empty());
}

#[tokio::test]
async fn test_ack_timeout_abandons_entry() {
    let mut cfg = test_config();
    cfg.retry.ack_timeout_secs = 0;
    let mut h = Harness::new(cfg, paper_broker(), market_data(dec!(0.5)));
    h.broker.hold_acknowledgments(true);
    h.ready().await;
    h.runtime.run_entry().await;

    assert_eq!(h.broker.placed_orders().len(), 1);
    assert_eq!(h.runtime.state(), EngineState::ConnectedIdle);
    assert!(h.sink.has(
        AlertLevel::Error,
        "Timed out waiting for acknowledgment of order 1"
    ));

    // A late acknowledgment needs a human
    h.broker.acknowledge(OrderId(1));
    h.runtime.pump_events().await;
    assert!(h.runtime.machine().needs_manual_intervention());
    assert!(h.sink.has(AlertLevel::Warning, "acknowledged after entry was abandoned"));
}

#[tokio::test]
async fn test_disconnect_while_awaiting_ack_marks_order_lost() {
    let mut h = Harness::standard();
    h.broker.hold_acknowledgments(true);
    h.ready().await;

    let broker = h.broker.clone();
    let inject = async move {
        while broker.placed_orders().is_empty() {
            tokio::task::yield_now().await;
        }
        broker.forget_order(OrderId(1));
        broker.inject_disconnect();
    };
    tokio::join!(h.runtime.run_entry(), inject);

    assert_eq!(h.broker.placed_orders().len(), 1);
    assert_eq!(h.runtime.state(), EngineState::ConnectedIdle);
    assert!(h.runtime.machine().entry_abandoned());
    assert!(h.sink.has(
        AlertLevel::Warning,
        "Disconnected from broker during AwaitingLongAck"
    ));
    assert!(h.sink.has(AlertLevel::Info, "Reconnected to broker"));
    assert!(h.sink.has(AlertLevel::Error, "lost before acknowledgment"));
}

#[tokio::test]
async fn test_disconnect_while_monitoring_reconciles_state() {
    let mut h = Harness::standard();
    h.ready().await;
    h.runtime.run_entry().await;
    h.runtime.pump_events().await;

    h.broker.inject_disconnect();
    h.runtime.pump_events().await;

    assert_eq!(h.runtime.state(), EngineState::Monitoring);
    assert!(h.sink.has(AlertLevel::Info, "resuming Monitoring"));
    assert!(h.sink.has(AlertLevel::Info, "Reconciled 2 broker orders; 2 open positions"));
    // Nothing is replayed
    assert_eq!(h.broker.placed_orders().len(), 2);
}

#[tokio::test]
async fn test_disconnect_during_selection_reconnects_and_enters() {
    let mut cfg = test_config();
    cfg.retry.chain_delay_secs = 1;
    let mut h = Harness::new(cfg, paper_broker(), market_data(dec!(0.5)));
    h.broker.degrade_next_snapshots(1);
    h.ready().await;

    // Drop the session while the first chain retry is backing off
    let broker = h.broker.clone();
    let inject = async move {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        broker.inject_disconnect();
    };
    tokio::join!(h.runtime.run_entry(), inject);

    assert_eq!(h.runtime.state(), EngineState::Monitoring);
    assert_eq!(h.broker.placed_orders().len(), 2);
    assert!(!h.runtime.machine().entry_abandoned());
    assert!(h.sink.has(
        AlertLevel::Warning,
        "Disconnected from broker during SelectingContracts"
    ));
    assert!(h.sink.has(AlertLevel::Info, "resuming SelectingContracts"));
    assert!(h.sink.messages(AlertLevel::Error).is_empty());
}

#[tokio::test]
async fn test_disconnect_after_long_ack_still_places_short_leg() {
    let mut h = Harness::standard();
    h.broker.hold_acknowledgments(true);
    h.ready().await;

    let broker = h.broker.clone();
    let inject = async move {
        while broker.placed_orders().is_empty() {
            tokio::task::yield_now().await;
        }
        broker.acknowledge(OrderId(1));
        broker.inject_disconnect();
        while broker.placed_orders().len() < 2 {
            tokio::task::yield_now().await;
        }
        broker.acknowledge(OrderId(2));
    };
    tokio::join!(h.runtime.run_entry(), inject);

    assert_eq!(h.runtime.state(), EngineState::Monitoring);
    let orders = h.broker.placed_orders();
    assert_eq!(orders.len(), 2);
    assert_eq!(orders[1].side, OrderSide::Sell);
    assert!(h.sink.has(
        AlertLevel::Warning,
        "Disconnected from broker during PlacingShortLeg"
    ));
    assert!(h.sink.has(AlertLevel::Info, "resuming PlacingShortLeg"));
    assert!(!h.runtime.machine().needs_manual_intervention());
    assert!(h.sink.messages(AlertLevel::Error).is_empty());
}

#[tokio::test]
async fn test_failed_reconnect_during_entry_terminates_without_orders() {
    let mut h = Harness::standard();
    h.ready().await;

    h.broker.fail_next_connects(3);
    h.broker.inject_disconnect();
    h.runtime.run_entry().await;

    assert!(h.broker.placed_orders().is_empty());
    assert_eq!(h.runtime.state(), EngineState::Terminated);
    assert!(h.sink.has(AlertLevel::Error, "Reconnect failure"));
    assert!(!h.sink.has(AlertLevel::Error, "Entry aborted"));
}
