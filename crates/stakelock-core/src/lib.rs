pub mod config;
pub mod constants;
pub mod error;
pub mod ledger;
pub mod lock;
pub mod types;
pub mod window;

pub use config::{DistributorConfig, LockLedgerConfig, MultiplierConfig};
pub use constants::*;
pub use error::StakeError;
pub use ledger::{AssetLedger, MintAuthority, ShareLedger};
pub use lock::Lock;
pub use types::*;
pub use window::{ClaimRequest, Window};
