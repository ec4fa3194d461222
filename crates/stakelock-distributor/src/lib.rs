//! stakelock-distributor
//!
//! Reward windows committed as Merkle roots, and the claim path that pays
//! them out of distributor custody exactly once per allocation.

pub mod claim;
pub mod registry;

pub use claim::ClaimVerifier;
pub use registry::{WindowPage, WindowRegistry, DISTRIBUTOR_CONFIG_KEY};
