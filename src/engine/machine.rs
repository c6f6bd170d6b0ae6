//! Execution state machine.
//!
//! Every handler is synchronous and performs no I/O: it moves the machine to
//! its next state and returns the commands (alerts, reconnects, resubmits,
//! acknowledgment completions) for the runtime to carry out.
//!
//! ```text
//! Disconnected -> Connecting -> ConnectedIdle -> ComputingSignal -> ConnectedIdle
//!   -> SelectingContracts -> PlacingLongLeg -> AwaitingLongAck
//!   -> PlacingShortLeg -> AwaitingShortAck -> Monitoring
//!   -> ExitRequested -> Terminated
//! ```
//!
//! Any disconnect re-enters `Connecting` and resumes the interrupted state
//! once the session is back.

use chrono::NaiveDate;
use std::fmt;

use super::session::StatusChange;
use crate::alerts::AlertLevel;
use crate::types::{
    EngineError, LegRole, OrderId, OrderState, RegimeSnapshot, SpreadCandidate, ValidationError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Disconnected,
    Connecting,
    ConnectedIdle,
    ComputingSignal,
    SelectingContracts,
    PlacingLongLeg,
    AwaitingLongAck,
    PlacingShortLeg,
    AwaitingShortAck,
    Monitoring,
    ExitRequested,
    Terminated,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How an awaited acknowledgment resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Acknowledged,
    Rejected,
    Cancelled,
    Lost,
}

/// Side effects requested by a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Alert(AlertLevel, String),
    Reconnect,
    Resubmit(LegRole),
    CompleteAck { order_id: OrderId, outcome: AckOutcome },
    Terminate,
}

fn info(msg: impl Into<String>) -> Command {
    Command::Alert(AlertLevel::Info, msg.into())
}

fn warning(msg: impl Into<String>) -> Command {
    Command::Alert(AlertLevel::Warning, msg.into())
}

fn error(msg: impl Into<String>) -> Command {
    Command::Alert(AlertLevel::Error, msg.into())
}

pub struct ExecutionStateMachine {
    state: EngineState,
    /// State to return to once a reconnect succeeds.
    resume_to: Option<EngineState>,
    resubmit_limit: u32,
    entry_attempted: bool,
    entry_abandoned: bool,
    manual_intervention: bool,
}

impl ExecutionStateMachine {
    pub fn new(resubmit_limit: u32) -> Self {
        Self {
            state: EngineState::Disconnected,
            resume_to: None,
            resubmit_limit,
            entry_attempted: false,
            entry_abandoned: false,
            manual_intervention: false,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn is_terminated(&self) -> bool {
        self.state == EngineState::Terminated
    }

    /// A leg was left in a state the engine will not repair on its own.
    pub fn needs_manual_intervention(&self) -> bool {
        self.manual_intervention
    }

    pub fn entry_abandoned(&self) -> bool {
        self.entry_abandoned
    }

    fn awaiting(&self) -> Option<LegRole> {
        match self.state {
            EngineState::AwaitingLongAck => Some(LegRole::Long),
            EngineState::AwaitingShortAck => Some(LegRole::Short),
            _ => None,
        }
    }

    /// Give up on today's entry and go back to idle.
    fn abandon_entry(&mut self) {
        self.entry_abandoned = true;
        if self.state != EngineState::Terminated {
            self.state = EngineState::ConnectedIdle;
        }
    }

    // -- Connection ---------------------------------------------------------

    pub fn start(&mut self) -> Vec<Command> {
        self.state = EngineState::Connecting;
        Vec::new()
    }

    /// Session established and the reference instrument qualified.
    pub fn on_connected(&mut self, date: NaiveDate, venue_open: bool) -> Vec<Command> {
        if !venue_open {
            self.state = EngineState::Terminated;
            let err = EngineError::VenueClosed(date);
            return vec![error(format!("{err}; not trading today")), Command::Terminate];
        }
        self.state = EngineState::ConnectedIdle;
        vec![info(format!("Connected; venue open on {date}"))]
    }

    /// Startup could not complete for a reason retries will not fix.
    pub fn on_startup_failed(&mut self, reason: &str) -> Vec<Command> {
        self.state = EngineState::Terminated;
        vec![error(format!("Startup failed: {reason}")), Command::Terminate]
    }

    pub fn on_connect_exhausted(&mut self, attempts: u32, message: &str) -> Vec<Command> {
        self.state = EngineState::Terminated;
        let err = EngineError::Connectivity {
            attempts,
            message: message.to_string(),
        };
        vec![error(format!("Reconnect failure: {err}")), Command::Terminate]
    }

    pub fn on_disconnected(&mut self) -> Vec<Command> {
        match self.state {
            EngineState::Terminated | EngineState::ExitRequested => Vec::new(),
            // Already reconnecting; keep the original resume point.
            EngineState::Connecting | EngineState::Disconnected => vec![Command::Reconnect],
            current => {
                self.resume_to = Some(current);
                self.state = EngineState::Connecting;
                vec![
                    warning(format!("Disconnected from broker during {current}; reconnecting")),
                    Command::Reconnect,
                ]
            }
        }
    }

    pub fn on_reconnected(&mut self) -> Vec<Command> {
        let resumed = self.resume_to.take().unwrap_or(EngineState::ConnectedIdle);
        self.state = resumed;
        vec![info(format!("Reconnected to broker; resuming {resumed}"))]
    }

    // -- Signal -------------------------------------------------------------

    pub fn begin_signal(&mut self) -> Vec<Command> {
        if self.state != EngineState::ConnectedIdle {
            return vec![warning(format!("Pre-open trigger skipped in state {}", self.state))];
        }
        self.state = EngineState::ComputingSignal;
        Vec::new()
    }

    pub fn on_regime(&mut self, regime: &RegimeSnapshot) -> Vec<Command> {
        self.state = EngineState::ConnectedIdle;
        vec![info(format!("Regimes computed: {regime}"))]
    }

    pub fn on_signal_failed(&mut self, err: &EngineError) -> Vec<Command> {
        self.abandon_entry();
        vec![error(format!("Signal computation failed, no entry today: {err}"))]
    }

    // -- Entry --------------------------------------------------------------

    /// Entry runs at most once per day.
    pub fn begin_entry(&mut self) -> Vec<Command> {
        if self.entry_attempted || self.entry_abandoned {
            return vec![warning("Entry skipped: already attempted or abandoned today")];
        }
        if self.state != EngineState::ConnectedIdle {
            return vec![warning(format!("Entry trigger skipped in state {}", self.state))];
        }
        self.entry_attempted = true;
        self.state = EngineState::SelectingContracts;
        Vec::new()
    }

    pub fn on_entry_failed(&mut self, err: &EngineError) -> Vec<Command> {
        self.abandon_entry();
        let alert = match err {
            EngineError::Validation(v @ ValidationError::IncompleteLegs { .. }) => {
                warning(format!("{v}; no order sent"))
            }
            EngineError::Validation(v) => error(format!("{v}; no order sent, entry abandoned")),
            other => error(format!("Entry aborted, no order sent: {other}")),
        };
        vec![alert]
    }

    pub fn on_validated(&mut self, spread: &SpreadCandidate) -> Vec<Command> {
        self.state = EngineState::PlacingLongLeg;
        let leg = |label: &str, c: &crate::types::Contract| {
            info(format!(
                "{label} leg found: {} (spread {}%)",
                c,
                c.spread_pct()
            ))
        };
        vec![
            leg("Short", &spread.short_leg),
            leg("Long", &spread.long_leg),
            info(format!(
                "Spread credit: market {} / mid {} (width {})",
                spread.market_credit(),
                spread.mid_credit(),
                spread.width
            )),
        ]
    }

    pub fn on_order_placed(&mut self, role: LegRole, order_id: OrderId) -> Vec<Command> {
        self.state = match (self.state, role) {
            (EngineState::PlacingLongLeg, LegRole::Long) => EngineState::AwaitingLongAck,
            (EngineState::PlacingShortLeg, LegRole::Short) => EngineState::AwaitingShortAck,
            (other, _) => other,
        };
        vec![info(format!("{role} leg order {order_id} placed"))]
    }

    pub fn on_place_failed(&mut self, role: LegRole, reason: &str) -> Vec<Command> {
        self.abandon_entry();
        let mut cmds = vec![error(format!(
            "Placing {role} leg failed, entry abandoned: {reason}"
        ))];
        if role == LegRole::Short {
            cmds.push(self.strand_long_leg());
        }
        cmds
    }

    pub fn on_ack_timeout(&mut self, role: LegRole, order_id: OrderId) -> Vec<Command> {
        if self.awaiting() != Some(role) {
            return Vec::new();
        }
        self.abandon_entry();
        let err = EngineError::AckTimeout(order_id);
        let mut cmds = vec![error(format!("{err}; entry abandoned"))];
        if role == LegRole::Short {
            cmds.push(self.strand_long_leg());
        }
        cmds
    }

    fn strand_long_leg(&mut self) -> Command {
        self.manual_intervention = true;
        error("Long leg is open without its short leg; manual intervention required")
    }

    // -- Order events -------------------------------------------------------

    pub fn on_order_status(&mut self, change: &StatusChange) -> Vec<Command> {
        let mut cmds = Vec::new();
        let role = change.role;
        let id = change.order_id;

        match change.current {
            OrderState::Active | OrderState::Filled if !change.was_acknowledged => {
                cmds.push(Command::CompleteAck {
                    order_id: id,
                    outcome: AckOutcome::Acknowledged,
                });
                if self.awaiting() == Some(role) {
                    self.state = match role {
                        LegRole::Long => EngineState::PlacingShortLeg,
                        LegRole::Short => EngineState::Monitoring,
                    };
                    cmds.push(info(format!("{role} leg order {id} acknowledged")));
                } else if self.entry_abandoned {
                    self.manual_intervention = true;
                    cmds.push(warning(format!(
                        "{role} leg order {id} acknowledged after entry was abandoned; manual intervention required"
                    )));
                } else {
                    cmds.push(info(format!("Resubmitted {role} leg order {id} acknowledged")));
                }
            }
            OrderState::Rejected if !change.was_acknowledged => {
                cmds.push(Command::CompleteAck {
                    order_id: id,
                    outcome: AckOutcome::Rejected,
                });
                let err = EngineError::OrderRejected {
                    order_id: id,
                    local_symbol: change.local_symbol.trim().to_string(),
                };
                cmds.extend(self.fail_unacknowledged(role, &err.to_string()));
            }
            OrderState::Cancelled if !change.was_acknowledged => {
                cmds.push(Command::CompleteAck {
                    order_id: id,
                    outcome: AckOutcome::Cancelled,
                });
                let reason = format!("Order {id} ({}) cancelled", change.local_symbol.trim());
                cmds.extend(self.fail_unacknowledged(role, &reason));
            }
            OrderState::Rejected => cmds.extend(self.on_rejected_after_ack(change)),
            OrderState::Cancelled => cmds.extend(self.on_cancelled_after_ack(change)),
            _ => {}
        }

        if change.current == OrderState::Filled && change.previous != OrderState::Filled {
            cmds.push(info(format!(
                "Order {id} filled: {} {} @ {}",
                change.filled,
                change.local_symbol.trim(),
                change.avg_fill_price
            )));
        }
        cmds
    }

    /// The broker no longer knows an order we never saw acknowledged.
    pub fn on_order_lost(
        &mut self,
        role: LegRole,
        order_id: OrderId,
        local_symbol: &str,
    ) -> Vec<Command> {
        let mut cmds = vec![Command::CompleteAck {
            order_id,
            outcome: AckOutcome::Lost,
        }];
        let err = EngineError::OrderLost {
            order_id,
            local_symbol: local_symbol.trim().to_string(),
        };
        cmds.extend(self.fail_unacknowledged(role, &err.to_string()));
        cmds
    }

    fn fail_unacknowledged(&mut self, role: LegRole, reason: &str) -> Vec<Command> {
        if self.awaiting() == Some(role) {
            self.abandon_entry();
            let mut cmds = vec![error(format!(
                "{role} leg: {reason} before acknowledgment; entry abandoned for today"
            ))];
            if role == LegRole::Short {
                cmds.push(self.strand_long_leg());
            }
            cmds
        } else {
            self.manual_intervention = true;
            vec![error(format!(
                "{role} leg: {reason} before acknowledgment; manual intervention required"
            ))]
        }
    }

    /// A working order the broker later refused. Never resubmitted.
    fn on_rejected_after_ack(&mut self, change: &StatusChange) -> Vec<Command> {
        let role = change.role;
        let err = EngineError::OrderRejected {
            order_id: change.order_id,
            local_symbol: change.local_symbol.trim().to_string(),
        };
        self.manual_intervention = true;
        // The short leg is never placed once its long leg is gone.
        if role == LegRole::Long && self.state == EngineState::PlacingShortLeg {
            self.abandon_entry();
        }
        vec![error(format!(
            "{role} leg: {err} after acknowledgment; not resubmitted, manual intervention required"
        ))]
    }

    fn on_cancelled_after_ack(&mut self, change: &StatusChange) -> Vec<Command> {
        let role = change.role;
        let err = EngineError::OrderCancelledPostAck {
            order_id: change.order_id,
            local_symbol: change.local_symbol.trim().to_string(),
        };
        let mut cmds = vec![warning(format!("{role} leg: {err}"))];

        if self.entry_abandoned || matches!(self.state, EngineState::ExitRequested | EngineState::Terminated) {
            self.manual_intervention = true;
            cmds.push(error(format!(
                "{role} leg not resubmitted (entry abandoned or session closing); manual intervention required"
            )));
        } else if change.resubmits < self.resubmit_limit {
            cmds.push(Command::Resubmit(role));
        } else {
            self.manual_intervention = true;
            cmds.push(error(format!(
                "{role} leg resubmission exhausted after {} attempts; position left as is for manual intervention",
                change.resubmits
            )));
        }
        cmds
    }

    pub fn on_resubmit_failed(&mut self, role: LegRole, reason: &str) -> Vec<Command> {
        self.manual_intervention = true;
        vec![error(format!(
            "Resubmitting {role} leg failed: {reason}; manual intervention required"
        ))]
    }

    // -- Exit ---------------------------------------------------------------

    pub fn begin_exit(&mut self) -> Vec<Command> {
        if self.state == EngineState::Terminated {
            return Vec::new();
        }
        self.state = EngineState::ExitRequested;
        Vec::new()
    }

    pub fn on_exit_complete(&mut self, summary: &str) -> Vec<Command> {
        self.state = EngineState::Terminated;
        vec![
            info(format!("Program exited at market close. {summary}")),
            Command::Terminate,
        ]
    }
}
