//! Pre-trade spread validation.
//!
//! Runs after strike selection and contract qualification, before any order
//! is sent. Either returns a complete [`SpreadCandidate`] or a typed failure.

use rust_decimal::Decimal;
use tracing::debug;

use crate::types::{Contract, SpreadCandidate, ValidationError};

pub struct SpreadValidator {
    spread_width: Decimal,
}

impl SpreadValidator {
    pub fn new(spread_width: Decimal) -> Self {
        Self { spread_width }
    }

    pub fn spread_width(&self) -> Decimal {
        self.spread_width
    }

    /// Validate the selected legs.
    ///
    /// `tradable` holds the local symbols the broker qualified out of the
    /// two selected legs. Checks run in order: two distinct tradable legs,
    /// matching right and expiration, exact width.
    pub fn validate(
        &self,
        short_leg: &Contract,
        long_leg: &Contract,
        tradable: &[String],
    ) -> Result<SpreadCandidate, ValidationError> {
        let is_tradable = |c: &Contract| tradable.iter().any(|s| s == &c.local_symbol);
        let distinct = short_leg.local_symbol != long_leg.local_symbol;

        let resolved = match (distinct, is_tradable(short_leg), is_tradable(long_leg)) {
            (true, true, true) if tradable.len() == 2 => 2,
            (true, s, l) => usize::from(s) + usize::from(l),
            (false, s, _) => usize::from(s),
        };
        if resolved != 2 {
            return Err(ValidationError::IncompleteLegs { resolved });
        }

        if short_leg.right != long_leg.right || short_leg.expiration != long_leg.expiration {
            return Err(ValidationError::LegMismatch {
                short: short_leg.local_symbol.trim().to_string(),
                long: long_leg.local_symbol.trim().to_string(),
            });
        }

        let actual = (short_leg.strike - long_leg.strike).abs();
        if actual != self.spread_width {
            return Err(ValidationError::WidthMismatch {
                expected: self.spread_width,
                actual,
            });
        }

        debug!(
            short = %short_leg.local_symbol.trim(),
            long = %long_leg.local_symbol.trim(),
            width = %actual,
            "Spread validated"
        );

        Ok(SpreadCandidate {
            short_leg: short_leg.clone(),
            long_leg: long_leg.clone(),
            width: actual,
        })
    }
}
