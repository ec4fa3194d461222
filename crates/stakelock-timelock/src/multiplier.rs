//! Duration → share multiplier.
//!
//! Linear between `min / max` at the shortest lock and 1.0 at the longest:
//!
//!   min_ratio = min × UNIT / max
//!   ratio     = min_ratio + (d − min) × (UNIT − min_ratio) / (max − min)
//!
//! UNIT = 1e18. Every division truncates, so both endpoints are exact and
//! the ratio never exceeds UNIT.

use stakelock_core::config::MultiplierConfig;
use stakelock_core::constants::FIXED_POINT_UNIT;
use stakelock_core::error::StakeError;
use stakelock_core::types::{Balance, Seconds};

/// Fixed-point ratio for a lock of `duration` seconds.
pub fn multiplier(duration: Seconds, config: &MultiplierConfig) -> Result<u128, StakeError> {
    let min = config.min_lock_duration;
    let max = config.max_lock_duration;
    if duration < min || duration > max || min >= max {
        return Err(StakeError::InvalidDuration { duration, min, max });
    }

    let min_ratio = (min as u128) * FIXED_POINT_UNIT / (max as u128);
    let span = (max - min) as u128;
    let elapsed = (duration - min) as u128;
    // elapsed < 2^64 and UNIT < 2^60, so the product fits in u128.
    Ok(min_ratio + elapsed * (FIXED_POINT_UNIT - min_ratio) / span)
}

/// `amount × ratio / UNIT`, truncated.
pub fn shares_for(amount: Balance, ratio: u128) -> Result<Balance, StakeError> {
    amount
        .checked_mul(ratio)
        .map(|v| v / FIXED_POINT_UNIT)
        .ok_or(StakeError::Overflow)
}
