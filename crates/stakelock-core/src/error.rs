use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StakeError {
    // ── Lock ledger ──────────────────────────────────────────────────────────
    #[error("duration not correct: {duration}s outside [{min}s, {max}s]")]
    InvalidDuration { duration: u64, min: u64, max: u64 },

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("transfer failed (STF): {0}")]
    TransferFailed(String),

    #[error("!owner")]
    NotOwner,

    #[error("lock not expired (unlocks at {unlock_at})")]
    NotExpired { unlock_at: i64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("lock {0} already withdrawn")]
    LockWithdrawn(u64),

    // ── Distributor ──────────────────────────────────────────────────────────
    #[error("invalid merkle proof")]
    InvalidProof,

    #[error("already claimed: window {window_index}, account index {account_index}")]
    AlreadyClaimed { window_index: u64, account_index: u64 },

    #[error("unknown window: {0}")]
    UnknownWindow(u64),

    #[error("merkle root must be non-zero")]
    InvalidRoot,

    #[error("window {window_index} allocation exceeded: need {need}, remaining {remaining}")]
    AllocationExceeded { window_index: u64, need: u128, remaining: u128 },

    // ── Administration ───────────────────────────────────────────────────────
    #[error("caller is not the admin")]
    Unauthorized,

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("already initialized")]
    AlreadyInitialized,

    #[error("not initialized")]
    NotInitialized,

    // ── Token ledgers ────────────────────────────────────────────────────────
    #[error("insufficient balance: need {need}, have {have}")]
    InsufficientBalance { need: u128, have: u128 },

    #[error("insufficient allowance: need {need}, have {have}")]
    InsufficientAllowance { need: u128, have: u128 },

    #[error("mint authority does not match token {0}")]
    AuthorityMismatch(String),

    #[error("token {0} is not transferable")]
    NonTransferable(String),

    #[error("invalid account: {0}")]
    InvalidAccount(String),

    #[error("arithmetic overflow")]
    Overflow,

    // ── Serialization / storage ──────────────────────────────────────────────
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(String),
}
