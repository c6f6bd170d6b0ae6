//! Session runtime.
//!
//! Owns the broker session, the market-data provider, the alert fan-out and
//! the state machine, and drives one trading day: connect, verify the venue
//! is open, compute regimes before the open, enter the spread at the entry
//! trigger, mark it while it is open, and shut down at the exit trigger.
//!
//! Broker events are consumed from a single channel. Whenever the runtime
//! waits (for a trigger or for an order acknowledgment) it keeps draining
//! that channel, so disconnects and late status reports are handled in the
//! order they arrive. Entry also drains it before every selection attempt
//! and leg placement, so a dropped session is restored before it continues.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::machine::{AckOutcome, Command, EngineState, ExecutionStateMachine};
use super::monitor::{fill_credit, mark_spread, MarkInputs, SpreadMark};
use super::retry::{RetryError, RetryPolicy};
use super::scheduler::{DailySchedule, Trigger};
use super::session::SessionState;
use crate::alerts::Alerts;
use crate::broker::calendar::LiquidHours;
use crate::broker::{BrokerEvent, BrokerSession, Instrument, OrderStatusUpdate, QuoteSnapshot};
use crate::config::AppConfig;
use crate::market_data::{option_ticker, Granularity, MarketDataProvider};
use crate::strategy::{
    price_at_anchor, ExpectedMoveCalculator, ExpectedMoveConfig, RegimeClassifier,
    SpreadValidator, StrikeSelector,
};
use crate::types::{
    ChainSnapshot, Contract, DailyBar, EngineError, ErrorScope, ExpectedMove, LegRole,
    OptionRight, OrderId, OrderState, RegimeSnapshot, SpreadCandidate, TrendRegime,
    ValidationError,
};

fn exhaustion_parts(err: RetryError<anyhow::Error>, budget: u32) -> (u32, String) {
    match err {
        RetryError::Exhausted { attempts, last } => (attempts, format!("{last:#}")),
        RetryError::Fatal(e) => (budget, format!("{e:#}")),
    }
}

/// Output of one successful selection attempt.
struct SelectedSpread {
    chain: ChainSnapshot,
    spread: SpreadCandidate,
    long: Instrument,
    short: Instrument,
}

pub struct EngineRuntime {
    config: AppConfig,
    broker: Arc<dyn BrokerSession>,
    market_data: Arc<dyn MarketDataProvider>,
    alerts: Alerts,
    schedule: DailySchedule,
    anchor: NaiveTime,
    machine: ExecutionStateMachine,
    session: SessionState,
    events: mpsc::UnboundedReceiver<BrokerEvent>,
    events_closed: bool,
    ack_waiters: HashMap<OrderId, oneshot::Sender<AckOutcome>>,
    reconnect_pending: bool,
    reconnects: u32,
    reference: Option<Instrument>,
    classifier: RegimeClassifier,
    calculator: ExpectedMoveCalculator,
    selector: StrikeSelector,
    validator: SpreadValidator,
}

impl EngineRuntime {
    pub fn new(
        config: AppConfig,
        broker: Arc<dyn BrokerSession>,
        market_data: Arc<dyn MarketDataProvider>,
        alerts: Alerts,
        date: NaiveDate,
    ) -> Result<Self> {
        let schedule = DailySchedule::from_config(&config)?;
        let anchor = config.anchor_time()?;
        let events = broker.subscribe();
        let calculator = ExpectedMoveCalculator::new(ExpectedMoveConfig {
            distance_factor: config.strategy.distance_factor,
            spread_width: config.strategy.spread_width,
        });
        let validator = SpreadValidator::new(config.strategy.spread_width);
        let machine = ExecutionStateMachine::new(config.retry.resubmit_attempts);

        Ok(Self {
            config,
            broker,
            market_data,
            alerts,
            schedule,
            anchor,
            machine,
            session: SessionState::new(date),
            events,
            events_closed: false,
            ack_waiters: HashMap::new(),
            reconnect_pending: false,
            reconnects: 0,
            reference: None,
            classifier: RegimeClassifier::new(),
            calculator,
            selector: StrikeSelector::new(),
            validator,
        })
    }

    pub fn state(&self) -> EngineState {
        self.machine.state()
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn machine(&self) -> &ExecutionStateMachine {
        &self.machine
    }

    fn connect_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.config.retry.connect_attempts, self.config.retry.connect_delay())
    }

    fn chain_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.config.retry.chain_attempts, self.config.retry.chain_delay())
    }

    fn market_data_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.config.retry.market_data_attempts,
            self.config.retry.market_data_delay(),
        )
    }

    // -----------------------------------------------------------------------
    // Day loop
    // -----------------------------------------------------------------------

    /// Run the whole session: connect, then fire each pending trigger at its
    /// scheduled instant.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            session_id = %self.session.session_id,
            date = %self.session.date,
            symbol = %self.config.instrument.symbol,
            "Session starting"
        );

        self.start().await;

        let pending = self.schedule.pending(self.session.date, Utc::now());
        for (trigger, at) in pending {
            if self.machine.is_terminated() {
                break;
            }
            debug!(%trigger, at = %at, "Waiting for trigger");
            self.wait_until(at).await;
            if self.machine.is_terminated() {
                break;
            }

            info!(%trigger, state = %self.machine.state(), "Trigger fired");
            match trigger {
                Trigger::PreOpen => self.run_pre_open().await,
                Trigger::Entry => self.run_entry().await,
                Trigger::Exit => self.run_exit().await,
            }
        }

        info!(
            session_id = %self.session.session_id,
            state = %self.machine.state(),
            manual_intervention = self.machine.needs_manual_intervention(),
            "Session finished"
        );
        Ok(())
    }

    /// Close the session early, e.g. on an operator interrupt.
    pub async fn shutdown(&mut self, reason: &str) {
        if self.machine.is_terminated() {
            return;
        }
        warn!(reason, "Shutting down before the exit trigger");
        self.close_session(Some(reason)).await;
    }

    async fn wait_until(&mut self, at: DateTime<Utc>) {
        let remaining = (at - Utc::now()).to_std().unwrap_or_default();
        let deadline = Instant::now() + remaining;
        let mut ticker = tokio::time::interval(self.config.monitor.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; marks start one interval in.
        ticker.reset();

        loop {
            let monitoring = self.config.monitor.enabled
                && self.machine.state() == EngineState::Monitoring;
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                event = self.events.recv(), if !self.events_closed => {
                    self.handle_event(event).await;
                }
                _ = ticker.tick(), if monitoring => self.monitor_tick().await,
            }
            if self.machine.is_terminated() {
                break;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Startup
    // -----------------------------------------------------------------------

    /// Connect, qualify the reference index and check today's liquid hours.
    pub async fn start(&mut self) {
        let cmds = self.machine.start();
        self.execute(cmds).await;

        let policy = self.connect_policy();
        let connected = {
            let broker = &*self.broker;
            let cfg = &self.config.broker;
            policy
                .run(
                    "broker connect",
                    move |_| broker.connect(&cfg.host, cfg.port, cfg.client_id),
                    |_| true,
                )
                .await
        };
        if let Err(e) = connected {
            let (attempts, message) = exhaustion_parts(e, policy.max_attempts);
            let cmds = self.machine.on_connect_exhausted(attempts, &message);
            self.execute(cmds).await;
            return;
        }

        let cmds = match self.verify_venue().await {
            Ok(open) => self.machine.on_connected(self.session.date, open),
            Err(e) => self.machine.on_startup_failed(&format!("{e:#}")),
        };
        self.execute(cmds).await;

        if !self.machine.is_terminated() {
            self.refresh_positions().await;
        }
    }

    async fn verify_venue(&mut self) -> Result<bool> {
        let inst = &self.config.instrument;
        let index = Instrument::index(&inst.symbol, &inst.primary_exchange, &inst.currency);
        let reference = self
            .broker
            .qualify_contracts(&[index])
            .await
            .context("Reference qualification failed")?
            .into_iter()
            .next()
            .with_context(|| format!("Reference instrument {} not found", inst.symbol))?;

        let details = self
            .broker
            .contract_details(&reference)
            .await
            .context("Contract details request failed")?;
        let first = details
            .first()
            .with_context(|| format!("No contract details for {}", reference.describe()))?;
        let hours = LiquidHours::parse(&first.liquid_hours)?;
        let open = hours.is_open_on(self.session.date);

        info!(
            reference = %reference.describe(),
            con_id = ?reference.con_id,
            open,
            "Reference instrument qualified"
        );
        self.reference = Some(reference);
        Ok(open)
    }

    async fn refresh_positions(&mut self) {
        match self.broker.positions().await {
            Ok(entries) => {
                self.session.positions.replace_all(entries);
                debug!(positions = self.session.positions.len(), "Positions loaded");
            }
            Err(e) => warn!(error = %e, "Position request failed"),
        }
    }

    // -----------------------------------------------------------------------
    // Pre-open
    // -----------------------------------------------------------------------

    /// Compute today's regimes from daily history.
    pub async fn run_pre_open(&mut self) {
        let cmds = self.machine.begin_signal();
        self.execute(cmds).await;
        if self.machine.state() != EngineState::ComputingSignal {
            return;
        }

        let cmds = match self.compute_regime().await {
            Ok(regime) => {
                self.session.regime = Some(regime);
                self.machine.on_regime(&regime)
            }
            Err(e) => self.machine.on_signal_failed(&e),
        };
        self.execute(cmds).await;
    }

    async fn compute_regime(&self) -> Result<RegimeSnapshot, EngineError> {
        let date = self.session.date;
        let start = date - chrono::Duration::days(self.config.signal.history_days);
        let end = date - chrono::Duration::days(1);

        let vol = self.daily_bars(&self.config.signal.vol_ticker, start, end).await?;
        let trend = self.daily_bars(&self.config.signal.trend_ticker, start, end).await?;
        self.classifier.classify(date, &vol, &trend)
    }

    async fn daily_bars(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyBar>, EngineError> {
        let md = &*self.market_data;
        self.market_data_policy()
            .run(
                "daily bars",
                move |_| md.get_daily_bars(ticker, start, end),
                |_| true,
            )
            .await
            .map_err(|e| EngineError::MarketData(format!("{ticker} daily bars: {e:#}")))
    }

    // -----------------------------------------------------------------------
    // Entry
    // -----------------------------------------------------------------------

    /// Select, validate and place the spread: long leg first, the short leg
    /// only once the long leg is acknowledged.
    pub async fn run_entry(&mut self) {
        let cmds = self.machine.begin_entry();
        self.execute(cmds).await;
        if self.machine.state() != EngineState::SelectingContracts {
            return;
        }

        let spread = match self.prepare_spread().await {
            Ok(spread) => spread,
            Err(_) if self.machine.is_terminated() => return,
            Err(e) => {
                warn!(error = %e, scope = ?e.scope(), "Entry aborted");
                let cmds = self.machine.on_entry_failed(&e);
                self.execute(cmds).await;
                return;
            }
        };
        let cmds = self.machine.on_validated(&spread);
        self.execute(cmds).await;

        self.place_leg(LegRole::Long).await;
        if self.machine.state() != EngineState::PlacingShortLeg {
            return;
        }
        self.place_leg(LegRole::Short).await;
    }

    async fn prepare_spread(&mut self) -> Result<SpreadCandidate, EngineError> {
        let date = self.session.date;
        let regime = self.session.regime.ok_or_else(|| {
            EngineError::InvalidInput(format!("no regime computed for {date}"))
        })?;

        let expected = self.compute_expected_move(regime.trend).await?;
        info!(
            fraction = expected.fraction,
            short_target = %expected.short_strike.round_dp(2),
            long_target = %expected.long_strike.round_dp(2),
            side = %expected.side,
            "Strike targets"
        );
        self.session.expected_move = Some(expected.clone());

        // Incomplete chains and dropped sessions are retried; every attempt
        // starts from a live session.
        let policy = self.chain_policy();
        let mut attempt = 1;
        let selected = loop {
            self.settle_connection().await?;
            match self.select_spread(&expected, attempt).await {
                Ok(selected) => break selected,
                Err(e) if e.scope() != ErrorScope::Retryable => return Err(e),
                Err(e) => {
                    if !policy.backoff("spread selection", attempt, &e).await {
                        let exhausted = if matches!(e, EngineError::ChainIncomplete(_)) {
                            EngineError::ChainIncomplete(format!(
                                "gave up after {attempt} attempts: {e}"
                            ))
                        } else {
                            e
                        };
                        return Err(exhausted);
                    }
                    attempt += 1;
                }
            }
        };

        self.session.chain = Some(selected.chain);
        self.session
            .set_spread(selected.spread.clone(), selected.long, selected.short);
        Ok(selected.spread)
    }

    /// One selection attempt: expiration check, chain snapshot, strike
    /// selection, qualification and validation.
    async fn select_spread(
        &self,
        expected: &ExpectedMove,
        attempt: u32,
    ) -> Result<SelectedSpread, EngineError> {
        self.ensure_expiration_listed().await?;

        let chain = self.fetch_chain(expected.side).await?;
        debug!(attempt, contracts = chain.len(), "Chain snapshot taken");
        let short = self
            .selector
            .select(&chain, expected.short_strike, expected.side)?;
        let long = self
            .selector
            .select(&chain, expected.long_strike, expected.side)?;

        let exchange = &self.config.instrument.exchange;
        let specs = [&short, &long]
            .into_iter()
            .map(|c| Instrument::from_local_symbol(&c.underlying, &c.local_symbol, exchange))
            .collect::<Result<Vec<_>>>()
            .map_err(|e| EngineError::InvalidInput(format!("{e:#}")))?;
        let qualified = self
            .broker
            .qualify_contracts(&specs)
            .await
            .map_err(|e| self.broker_failure(e))?;
        let tradable: Vec<String> = qualified
            .iter()
            .filter_map(|i| i.local_symbol.clone())
            .collect();

        let spread = self.validator.validate(&short, &long, &tradable)?;

        let find = |c: &Contract| {
            qualified
                .iter()
                .find(|i| i.local_symbol.as_deref() == Some(c.local_symbol.as_str()))
                .cloned()
        };
        let (Some(long_inst), Some(short_inst)) = (find(&long), find(&short)) else {
            return Err(ValidationError::IncompleteLegs {
                resolved: tradable.len(),
            }
            .into());
        };
        Ok(SelectedSpread {
            chain,
            spread,
            long: long_inst,
            short: short_inst,
        })
    }

    /// Broker failures while the session is down become retryable.
    fn broker_failure(&self, e: anyhow::Error) -> EngineError {
        if self.broker.is_connected() {
            EngineError::Broker(format!("{e:#}"))
        } else {
            EngineError::ConnectionLost(format!("{e:#}"))
        }
    }

    /// Handle queued broker events and finish any reconnect they start, so
    /// the next broker call runs against a live session in the resumed
    /// state. Fails only when reconnecting terminated the session.
    async fn settle_connection(&mut self) -> Result<(), EngineError> {
        self.pump_events().await;
        if !self.machine.is_terminated() && !self.broker.is_connected() {
            // Dropped without a disconnect event reaching us yet.
            self.dispatch(BrokerEvent::Disconnected).await;
            self.process_reconnect().await;
        }
        if self.machine.is_terminated() {
            return Err(EngineError::ConnectionLost(
                "session terminated while reconnecting".into(),
            ));
        }
        Ok(())
    }

    async fn compute_expected_move(&self, trend: TrendRegime) -> Result<ExpectedMove, EngineError> {
        let vol = self.anchor_price(&self.config.signal.vol_ticker).await?;
        let spot = self.anchor_price(&self.config.signal.spot_ticker).await?;
        self.calculator.compute(self.session.date, vol, spot, trend)
    }

    async fn anchor_price(&self, ticker: &str) -> Result<Decimal, EngineError> {
        let md = &*self.market_data;
        let date = self.session.date;
        let bars = self
            .market_data_policy()
            .run(
                "intraday bars",
                move |_| md.get_intraday_bars(ticker, date, Granularity::Minute),
                |_| true,
            )
            .await
            .map_err(|e| EngineError::MarketData(format!("{ticker} intraday bars: {e:#}")))?;

        price_at_anchor(&bars, self.anchor, self.schedule.time_zone()).ok_or_else(|| {
            EngineError::AnchorPriceUnavailable {
                ticker: ticker.to_string(),
                anchor: self.anchor.format("%H:%M").to_string(),
            }
        })
    }

    /// Today must be a listed expiration of the underlying.
    async fn ensure_expiration_listed(&self) -> Result<(), EngineError> {
        let Some(reference) = &self.reference else {
            return Err(EngineError::Broker("reference instrument not qualified".into()));
        };
        let expirations = self
            .broker
            .option_expirations(reference)
            .await
            .map_err(|e| self.broker_failure(e))?;
        if expirations.contains(&self.session.date) {
            Ok(())
        } else {
            Err(EngineError::InvalidInput(format!(
                "{} has no expiration listed on {}",
                reference.symbol, self.session.date
            )))
        }
    }

    async fn fetch_chain(&self, right: OptionRight) -> Result<ChainSnapshot, EngineError> {
        let inst = &self.config.instrument;
        let date = self.session.date;
        let series = Instrument::option_series(
            &inst.symbol,
            date,
            right,
            &inst.exchange,
            &inst.trading_class,
        );
        let details = self
            .broker
            .contract_details(&series)
            .await
            .map_err(|e| self.broker_failure(e))?;
        if details.is_empty() {
            return Err(EngineError::ChainIncomplete(format!(
                "no {right} contracts listed for {} {date}",
                inst.symbol
            )));
        }

        let instruments: Vec<Instrument> = details.into_iter().map(|d| d.instrument).collect();
        let quotes = self
            .broker
            .quotes_snapshot(&instruments)
            .await
            .map_err(|e| self.broker_failure(e))?;
        let contracts: Vec<Contract> = quotes.iter().filter_map(QuoteSnapshot::to_contract).collect();
        Ok(ChainSnapshot::new(&inst.symbol, date, contracts))
    }

    async fn place_leg(&mut self, role: LegRole) {
        let placing = match role {
            LegRole::Long => EngineState::PlacingLongLeg,
            LegRole::Short => EngineState::PlacingShortLeg,
        };
        if let Err(e) = self.settle_connection().await {
            warn!(%role, error = %e, "Leg not placed");
            return;
        }
        if self.machine.state() != placing {
            warn!(%role, state = %self.machine.state(), "Leg not placed");
            return;
        }

        let Some(instrument) = self.session.leg(role).map(|leg| leg.instrument.clone()) else {
            warn!(%role, "No leg to place");
            return;
        };
        let quantity = self.config.engine.unit_size;

        let handle = match self.broker.place_order(&instrument, role.side(), quantity).await {
            Ok(handle) => handle,
            Err(e) => {
                let reason = self.broker_failure(e).to_string();
                let cmds = self.machine.on_place_failed(role, &reason);
                self.execute(cmds).await;
                return;
            }
        };

        info!(
            order_id = %handle.order_id,
            %role,
            side = %handle.side,
            quantity,
            contract = %instrument.describe(),
            "Order placed"
        );
        self.session.register_order(role, handle.order_id);
        let cmds = self.machine.on_order_placed(role, handle.order_id);
        self.execute(cmds).await;

        let outcome = self.await_ack(role, handle.order_id).await;
        debug!(order_id = %handle.order_id, %role, ?outcome, "Acknowledgment resolved");
    }

    /// Wait for the broker to acknowledge an order while still servicing
    /// events. The timeout restarts after every successful reconnect.
    async fn await_ack(&mut self, role: LegRole, order_id: OrderId) -> Option<AckOutcome> {
        let (tx, mut rx) = oneshot::channel();
        self.ack_waiters.insert(order_id, tx);

        let timeout = self.config.retry.ack_timeout();
        let mut deadline = Instant::now() + timeout;
        let mut seen_reconnects = self.reconnects;

        loop {
            if self.machine.is_terminated() {
                self.ack_waiters.remove(&order_id);
                return None;
            }
            if self.reconnects != seen_reconnects {
                seen_reconnects = self.reconnects;
                deadline = Instant::now() + timeout;
            }

            tokio::select! {
                biased;
                outcome = &mut rx => return outcome.ok(),
                event = self.events.recv(), if !self.events_closed => {
                    self.handle_event(event).await;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    self.ack_waiters.remove(&order_id);
                    warn!(%order_id, %role, timeout_secs = timeout.as_secs(), "Acknowledgment timed out");
                    let cmds = self.machine.on_ack_timeout(role, order_id);
                    self.execute(cmds).await;
                    return None;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Handle every event already queued without waiting for more.
    pub async fn pump_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.dispatch(event).await;
            self.process_reconnect().await;
        }
    }

    async fn handle_event(&mut self, event: Option<BrokerEvent>) {
        match event {
            Some(event) => self.dispatch(event).await,
            None => {
                warn!("Broker event stream closed");
                self.events_closed = true;
                self.dispatch(BrokerEvent::Disconnected).await;
            }
        }
        self.process_reconnect().await;
    }

    async fn dispatch(&mut self, event: BrokerEvent) {
        let cmds = match event {
            BrokerEvent::OrderStatus(update) => self.apply_order_status(&update),
            BrokerEvent::Position(entry) => {
                debug!(
                    symbol = %entry.local_symbol.trim(),
                    quantity = entry.quantity,
                    avg_cost = %entry.avg_cost,
                    "Position update"
                );
                self.session.positions.apply(entry);
                Vec::new()
            }
            BrokerEvent::Disconnected => {
                warn!(state = %self.machine.state(), "Broker disconnected");
                self.machine.on_disconnected()
            }
        };
        self.execute(cmds).await;
    }

    fn apply_order_status(&mut self, update: &OrderStatusUpdate) -> Vec<Command> {
        let Some(change) = self.session.apply_status(update) else {
            debug!(order_id = %update.order_id, status = ?update.status, "Untracked order status");
            return Vec::new();
        };
        if change.current == OrderState::Filled && change.previous != OrderState::Filled {
            self.session.record_fill(&change);
        }
        info!(
            order_id = %change.order_id,
            role = %change.role,
            previous = %change.previous,
            current = %change.current,
            filled = change.filled,
            "Order status"
        );
        self.machine.on_order_status(&change)
    }

    async fn execute(&mut self, cmds: Vec<Command>) {
        for cmd in cmds {
            match cmd {
                Command::Alert(level, message) => self.alerts.notify(level, &message).await,
                Command::Reconnect => self.reconnect_pending = true,
                Command::Resubmit(role) => self.resubmit(role).await,
                Command::CompleteAck { order_id, outcome } => {
                    if let Some(tx) = self.ack_waiters.remove(&order_id) {
                        // The waiter may already have given up.
                        let _ = tx.send(outcome);
                    }
                }
                Command::Terminate => info!(
                    session_id = %self.session.session_id,
                    "Session terminated"
                ),
            }
        }
    }

    /// Replace a leg whose order was cancelled after acknowledgment.
    async fn resubmit(&mut self, role: LegRole) {
        let Some(leg) = self.session.leg(role) else {
            return;
        };
        let instrument = leg.instrument.clone();
        let attempt = leg.resubmits + 1;
        let limit = self.config.retry.resubmit_attempts;

        match self
            .broker
            .place_order(&instrument, role.side(), self.config.engine.unit_size)
            .await
        {
            Ok(handle) => {
                self.session.register_order(role, handle.order_id);
                self.alerts
                    .info(format!(
                        "Resubmitted {role} leg as order {} (attempt {attempt}/{limit})",
                        handle.order_id
                    ))
                    .await;
            }
            Err(e) => {
                for cmd in self.machine.on_resubmit_failed(role, &format!("{e:#}")) {
                    if let Command::Alert(level, message) = cmd {
                        self.alerts.notify(level, &message).await;
                    }
                }
            }
        }
    }

    async fn process_reconnect(&mut self) {
        while self.reconnect_pending && !self.machine.is_terminated() {
            self.reconnect_pending = false;

            let policy = self.connect_policy();
            let result = {
                let broker = &*self.broker;
                let cfg = &self.config.broker;
                policy
                    .run(
                        "broker reconnect",
                        move |_| broker.connect(&cfg.host, cfg.port, cfg.client_id),
                        |_| true,
                    )
                    .await
            };

            match result {
                Ok(()) => {
                    self.reconnects += 1;
                    let cmds = self.machine.on_reconnected();
                    self.execute(cmds).await;
                    self.reconcile().await;
                }
                Err(e) => {
                    let (attempts, message) = exhaustion_parts(e, policy.max_attempts);
                    let cmds = self.machine.on_connect_exhausted(attempts, &message);
                    self.execute(cmds).await;
                }
            }
        }
    }

    /// Rebuild order and position state from the broker after a reconnect.
    /// Orders are never replayed: unacknowledged orders the broker no longer
    /// knows are marked lost.
    async fn reconcile(&mut self) {
        let reported = match self.broker.open_orders().await {
            Ok(orders) => orders,
            Err(e) => {
                self.alerts
                    .warning(format!("Order reconciliation failed: {e:#}"))
                    .await;
                return;
            }
        };

        let known: HashSet<OrderId> = reported.iter().map(|u| u.order_id).collect();
        let mut cmds = Vec::new();
        for update in &reported {
            cmds.extend(self.apply_order_status(update));
        }
        for (role, order_id) in self.session.unacknowledged_orders() {
            if known.contains(&order_id) || self.session.mark_lost(order_id).is_none() {
                continue;
            }
            let symbol = self
                .session
                .leg(role)
                .and_then(|leg| leg.instrument.local_symbol.clone())
                .unwrap_or_default();
            warn!(%order_id, %role, "Order unknown to broker after reconnect");
            cmds.extend(self.machine.on_order_lost(role, order_id, &symbol));
        }
        self.execute(cmds).await;

        self.refresh_positions().await;
        self.alerts
            .info(format!(
                "Reconciled {} broker orders; {} open positions",
                reported.len(),
                self.session.positions.len()
            ))
            .await;
    }

    // -----------------------------------------------------------------------
    // Monitoring
    // -----------------------------------------------------------------------

    pub async fn monitor_tick(&mut self) {
        if self.machine.state() != EngineState::Monitoring {
            return;
        }
        match self.mark_position().await {
            Ok(mark) => info!(session_id = %self.session.session_id, %mark, "Spread marked"),
            Err(e) => warn!(error = %e, "Spread mark skipped"),
        }
    }

    /// Mark the open spread against the latest quotes.
    pub async fn mark_position(&mut self) -> Result<SpreadMark> {
        let spread = self
            .session
            .spread
            .clone()
            .context("No spread open to mark")?;
        let short_ticker = option_ticker(&spread.short_leg.local_symbol);
        let long_ticker = option_ticker(&spread.long_leg.local_symbol);

        let entry_credit = match fill_credit(self.session.fills()) {
            Some(credit) => credit,
            None => self.quoted_credit(&short_ticker, &long_ticker).await?,
        };

        let short = self.market_data.get_latest_quote(&short_ticker).await?;
        let long = self.market_data.get_latest_quote(&long_ticker).await?;
        let spot = match self.market_data.get_latest_quote(&self.config.signal.spot_ticker).await {
            Ok(q) => Some(q.mid),
            Err(e) => {
                debug!(error = %e, "Spot quote unavailable");
                None
            }
        };

        Ok(mark_spread(&MarkInputs {
            timestamp: short.timestamp.max(long.timestamp),
            entry_credit,
            short_mid: short.mid,
            long_mid: long.mid,
            units: self.config.engine.unit_size,
            right: spread.right(),
            short_strike: spread.short_leg.strike,
            spot,
        }))
    }

    /// Credit from median quotes over the anchor minute, cached for the day.
    async fn quoted_credit(&mut self, short_ticker: &str, long_ticker: &str) -> Result<Decimal> {
        if let Some(credit) = self.session.quoted_credit {
            return Ok(credit);
        }
        let from = self.schedule.local_instant(self.session.date, self.anchor);
        let to = from + chrono::Duration::minutes(1);

        let short = self.market_data.get_quote_median(short_ticker, from, to).await?;
        let long = self.market_data.get_quote_median(long_ticker, from, to).await?;
        let credit = (short.mid() - long.mid()).round_dp(2);
        info!(%credit, "Entry credit from anchor-minute quotes");
        self.session.quoted_credit = Some(credit);
        Ok(credit)
    }

    // -----------------------------------------------------------------------
    // Exit
    // -----------------------------------------------------------------------

    /// Shut the session down at the exit trigger. Open positions are left to
    /// expire.
    pub async fn run_exit(&mut self) {
        self.close_session(None).await;
    }

    async fn close_session(&mut self, reason: Option<&str>) {
        let cmds = self.machine.begin_exit();
        self.execute(cmds).await;
        if self.machine.is_terminated() {
            return;
        }
        self.pump_events().await;

        let mut summary = format!(
            "{} fills, {} open positions",
            self.session.fills().len(),
            self.session.positions.len()
        );
        if self.machine.needs_manual_intervention() {
            summary.push_str("; manual intervention required");
        }
        if let Some(reason) = reason {
            summary = format!("{reason}; {summary}");
        }

        if let Err(e) = self.broker.disconnect().await {
            warn!(error = %e, "Broker disconnect failed");
        }
        let cmds = self.machine.on_exit_complete(&summary);
        self.execute(cmds).await;
    }
}
