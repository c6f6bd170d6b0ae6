//! Strategy engine: regime classification, expected-move targets, strike
//! selection and spread validation.
//!
//! Everything here is pure and synchronous. Retries, broker calls and alerts
//! live in `engine`.

pub mod expected_move;
pub mod regime;
pub mod selector;
pub mod validator;

pub use expected_move::{price_at_anchor, ExpectedMoveCalculator, ExpectedMoveConfig};
pub use regime::RegimeClassifier;
pub use selector::StrikeSelector;
pub use validator::SpreadValidator;
