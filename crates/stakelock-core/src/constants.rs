/// ─── Stakelock Protocol Constants ───────────────────────────────────────────
///
/// Ratios are 18-decimal fixed point: `FIXED_POINT_UNIT` is 1.0.

// ── Fixed point ──────────────────────────────────────────────────────────────

/// 1.0 in the multiplier's fixed-point representation.
pub const FIXED_POINT_UNIT: u128 = 1_000_000_000_000_000_000;

// ── Time ─────────────────────────────────────────────────────────────────────

pub const SECONDS_PER_DAY: u64 = 86_400;

/// Month length used by `deposit_by_months` until an admin overrides it.
pub const DEFAULT_SECONDS_PER_MONTH: u64 = 30 * SECONDS_PER_DAY;

/// Grace period after maturity before a lock may be ejected. Default: none.
pub const DEFAULT_EJECT_BUFFER_SECS: u64 = 0;

// ── Lock defaults ────────────────────────────────────────────────────────────

/// Default minimum lock duration: 30 days.
pub const DEFAULT_MIN_LOCK_DURATION_SECS: u64 = 30 * SECONDS_PER_DAY;

/// Default maximum lock duration: 90 days.
pub const DEFAULT_MAX_LOCK_DURATION_SECS: u64 = 90 * SECONDS_PER_DAY;

/// Default minimum deposit, in base units of the deposit token.
pub const DEFAULT_MIN_DEPOSIT_AMOUNT: u128 = 1;

// ── Enumeration ──────────────────────────────────────────────────────────────

/// Upper bound on the number of records returned by one paginated query.
pub const MAX_PAGE_SIZE: usize = 256;

// ── Claims ───────────────────────────────────────────────────────────────────

/// Account indices per claim-bitmap word.
pub const CLAIM_WORD_BITS: u64 = 64;

/// Short code reported with every rejected asset movement.
pub const TRANSFER_FAILED_CODE: &str = "STF";
