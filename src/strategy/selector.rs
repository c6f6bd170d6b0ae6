//! Nearest-strike contract selection from a quoted chain.

use rust_decimal::Decimal;

use crate::types::{ChainSnapshot, Contract, EngineError, OptionRight};

/// Picks the contract of a given right whose strike is closest to a target.
///
/// Selection is pure: the same snapshot and target always yield the same
/// contract. Incomplete quotes fail the whole selection; retrying with a
/// fresh snapshot is the caller's job.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrikeSelector;

impl StrikeSelector {
    pub fn new() -> Self {
        Self
    }

    pub fn select(
        &self,
        chain: &ChainSnapshot,
        target: Decimal,
        right: OptionRight,
    ) -> Result<Contract, EngineError> {
        let candidates: Vec<&Contract> = chain
            .contracts()
            .iter()
            .filter(|c| c.right == right)
            .collect();

        if candidates.is_empty() {
            return Err(EngineError::ChainIncomplete(format!(
                "no {right} contracts quoted for {} {}",
                chain.underlying, chain.expiration
            )));
        }

        if let Some(bad) = candidates
            .iter()
            .find(|c| !c.has_valid_quote() || !c.has_full_greeks())
        {
            return Err(EngineError::ChainIncomplete(format!(
                "{} is missing a valid quote or greeks",
                bad.local_symbol.trim()
            )));
        }

        // Chain is sorted by strike and `min_by_key` keeps the first minimum,
        // so ties resolve to the lower strike.
        candidates
            .into_iter()
            .min_by_key(|c| (c.strike - target).abs())
            .cloned()
            .ok_or_else(|| EngineError::ChainIncomplete("empty candidate set".into()))
    }
}
