use chrono::DateTime;
use serde::{Deserialize, Serialize};

use stakelock_core::constants::{MAX_PAGE_SIZE, SECONDS_PER_DAY};
use stakelock_core::error::StakeError;
use stakelock_core::lock::Lock;
use stakelock_core::types::{AccountId, LockId, Timestamp};
use stakelock_state::StateDb;

/// One page of lock records plus where the next page starts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockPage {
    pub locks: Vec<(LockId, Lock)>,
    /// `None` once the scan reached the end of the ledger.
    pub next_offset: Option<LockId>,
}

/// Read-only queries over stored locks.
pub struct LockQuery<'a> {
    db: &'a StateDb,
}

impl<'a> LockQuery<'a> {
    pub fn new(db: &'a StateDb) -> Self {
        Self { db }
    }

    /// Fetch a lock; withdrawn slots come back cleared.
    pub fn get(&self, id: LockId) -> Result<Lock, StakeError> {
        self.db
            .get_lock(id)?
            .ok_or_else(|| StakeError::NotFound(format!("lock {id}")))
    }

    pub fn len(&self) -> Result<u64, StakeError> {
        self.db.lock_count()
    }

    pub fn is_empty(&self) -> Result<bool, StakeError> {
        Ok(self.len()? == 0)
    }

    /// Returns true if the lock is active and matured at `now`.
    pub fn is_matured(&self, id: LockId, now: Timestamp) -> Result<bool, StakeError> {
        let lock = self.get(id)?;
        Ok(lock.is_active() && lock.is_matured(now))
    }

    /// Up to `limit` slots (capped at `MAX_PAGE_SIZE`) starting at `offset`.
    pub fn page(&self, offset: LockId, limit: usize) -> Result<LockPage, StakeError> {
        let limit = limit.min(MAX_PAGE_SIZE);
        let locks = self.db.iter_locks(offset, limit)?;
        let next = offset.saturating_add(locks.len() as u64);
        let next_offset = (next < self.db.lock_count()?).then_some(next);
        Ok(LockPage { locks, next_offset })
    }

    /// Active locks owned by `owner` among the `limit` slots after `offset`.
    /// Callers walk `next_offset` to cover the whole ledger.
    pub fn page_of(&self, owner: &AccountId, offset: LockId, limit: usize) -> Result<LockPage, StakeError> {
        let mut page = self.page(offset, limit)?;
        page.locks.retain(|(_, l)| l.is_active() && &l.owner == owner);
        Ok(page)
    }

    /// Human-readable summary of a lock's state.
    pub fn describe(&self, id: LockId, now: Timestamp) -> Result<String, StakeError> {
        let lock = self.get(id)?;
        if !lock.is_active() {
            return Ok(format!("Lock {id} | withdrawn"));
        }

        let unlock_at = lock.unlock_at();
        let status = if now >= unlock_at {
            "matured, ready to withdraw".to_string()
        } else {
            let days = (unlock_at - now) / SECONDS_PER_DAY as i64;
            format!("locked, unlocks in {days} days")
        };
        let unlock_str = DateTime::from_timestamp(unlock_at, 0)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| unlock_at.to_string());

        Ok(format!(
            "Lock {} | {} deposited | {} shares to {} | owner: {} | unlock {} | {}",
            id, lock.amount, lock.shares, lock.share_holder, lock.owner, unlock_str, status
        ))
    }
}
