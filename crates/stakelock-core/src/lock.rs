use serde::{Deserialize, Serialize};

use crate::types::{AccountId, Balance, Seconds, Timestamp};

/// One deposit with its own maturity clock.
///
/// A withdrawn lock keeps its slot but reads back as `Lock::cleared()`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Lock {
    /// Principal held in custody.
    pub amount: Balance,
    pub locked_at: Timestamp,
    pub lock_duration: Seconds,
    /// Depositor; the only account allowed to withdraw.
    pub owner: AccountId,
    /// Shares minted for this lock, burned verbatim on release.
    pub shares: Balance,
    /// Account the shares were minted to.
    pub share_holder: AccountId,
}

impl Lock {
    pub fn cleared() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.amount > 0
    }

    /// Timestamp from which the lock may be withdrawn.
    pub fn unlock_at(&self) -> Timestamp {
        self.locked_at
            .saturating_add(i64::try_from(self.lock_duration).unwrap_or(i64::MAX))
    }

    pub fn is_matured(&self, now: Timestamp) -> bool {
        now >= self.unlock_at()
    }
}
