//! stakelock-timelock
//!
//! Time-locked deposits that mint reward shares scaled by lock duration.
//! The multiplier is a pure function; `LockLedger` owns the lock records and
//! custody; `LockQuery` is a read-only view used by operators and the CLI.

pub mod ledger;
pub mod multiplier;
pub mod query;

pub use ledger::{LockLedger, StakingData, LOCK_LEDGER_CONFIG_KEY};
pub use multiplier::{multiplier, shares_for};
pub use query::{LockPage, LockQuery};
