//! Session engine: the execution state machine, session state, retry
//! policy, daily scheduling, spread marking and the async runtime that ties
//! them to the broker, market data and alerts.

pub mod machine;
pub mod monitor;
pub mod retry;
pub mod runtime;
pub mod scheduler;
pub mod session;

pub use machine::{AckOutcome, Command, EngineState, ExecutionStateMachine};
pub use monitor::{fill_credit, mark_spread, MarkInputs, SpreadMark};
pub use retry::{RetryError, RetryPolicy};
pub use runtime::EngineRuntime;
pub use scheduler::{DailySchedule, Trigger};
pub use session::{LegOrder, SessionState, StatusChange};
