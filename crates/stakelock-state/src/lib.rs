//! stakelock-state
//!
//! Persistent state for the staking ledger and the reward distributor,
//! plus a sled-backed token ledger implementing the external ledger seams.

pub mod db;
pub mod token;

pub use db::{ClaimEntry, StateDb};
pub use token::SledTokenLedger;
