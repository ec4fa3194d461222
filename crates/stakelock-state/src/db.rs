use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
};
use sled::{IVec, Transactional};
use std::path::Path;

use stakelock_core::constants::CLAIM_WORD_BITS;
use stakelock_core::error::StakeError;
use stakelock_core::lock::Lock;
use stakelock_core::types::{Balance, LockId, TokenId, WindowIndex};
use stakelock_core::window::Window;

use crate::token::SledTokenLedger;

const LOCK_COUNT_KEY: &str = "lock_count";
const WINDOW_COUNT_KEY: &str = "window_count";

/// Persistent state database backed by sled.
///
/// Named trees:
///   locks            — u64 BE lock id          → bincode(Lock)
///   windows          — u64 BE window index     → bincode(Window)
///   window_remaining — u64 BE window index     → u128 BE unclaimed allocation
///   claims           — window BE ‖ word BE     → u64 BE bitmap word
///   balances         — token ‖ 0 ‖ account     → u128 BE
///   allowances       — token ‖ 0 ‖ owner ‖ spender → u128 BE
///   meta             — utf8 key bytes          → raw bytes
pub struct StateDb {
    db: sled::Db,
    locks: sled::Tree,
    windows: sled::Tree,
    window_remaining: sled::Tree,
    claims: sled::Tree,
    balances: sled::Tree,
    allowances: sled::Tree,
    meta: sled::Tree,
}

pub(crate) fn storage(e: impl std::fmt::Display) -> StakeError {
    StakeError::Storage(e.to_string())
}

pub(crate) fn abort<T>(e: StakeError) -> ConflictableTransactionResult<T, StakeError> {
    Err(ConflictableTransactionError::Abort(e))
}

pub(crate) fn from_tx(e: TransactionError<StakeError>) -> StakeError {
    match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => storage(e),
    }
}

pub(crate) fn decode_u128(v: Option<IVec>) -> Result<u128, StakeError> {
    match v {
        None => Ok(0),
        Some(bytes) => {
            let arr: [u8; 16] = bytes
                .as_ref()
                .try_into()
                .map_err(|_| StakeError::Serialization("expected 16-byte integer".into()))?;
            Ok(u128::from_be_bytes(arr))
        }
    }
}

fn decode_u64(v: Option<IVec>) -> Result<u64, StakeError> {
    match v {
        None => Ok(0),
        Some(bytes) => {
            let arr: [u8; 8] = bytes
                .as_ref()
                .try_into()
                .map_err(|_| StakeError::Serialization("expected 8-byte integer".into()))?;
            Ok(u64::from_be_bytes(arr))
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StakeError> {
    bincode::serialize(value).map_err(|e| StakeError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StakeError> {
    bincode::deserialize(bytes).map_err(|e| StakeError::Serialization(e.to_string()))
}

fn claim_key(window_index: WindowIndex, account_index: u64) -> ([u8; 16], u64) {
    let word = account_index / CLAIM_WORD_BITS;
    let bit = account_index % CLAIM_WORD_BITS;
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&window_index.to_be_bytes());
    key[8..].copy_from_slice(&word.to_be_bytes());
    (key, 1u64 << bit)
}

/// One consumed allocation, as committed to the claim bitmap.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClaimEntry {
    pub window_index: WindowIndex,
    pub account_index: u64,
    pub amount: Balance,
}

impl StateDb {
    /// Open or create the state database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StakeError> {
        let db = sled::open(path).map_err(storage)?;
        Self::from_db(db)
    }

    /// In-memory database removed on drop.
    pub fn open_temporary() -> Result<Self, StakeError> {
        let db = sled::Config::new().temporary(true).open().map_err(storage)?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StakeError> {
        let locks            = db.open_tree("locks").map_err(storage)?;
        let windows          = db.open_tree("windows").map_err(storage)?;
        let window_remaining = db.open_tree("window_remaining").map_err(storage)?;
        let claims           = db.open_tree("claims").map_err(storage)?;
        let balances         = db.open_tree("balances").map_err(storage)?;
        let allowances       = db.open_tree("allowances").map_err(storage)?;
        let meta             = db.open_tree("meta").map_err(storage)?;
        Ok(Self { db, locks, windows, window_remaining, claims, balances, allowances, meta })
    }

    /// Handle on the ledger for `token`, sharing this database.
    pub fn token_ledger(&self, token: TokenId) -> SledTokenLedger {
        SledTokenLedger::new(token, self.balances.clone(), self.allowances.clone(), self.meta.clone())
    }

    // ── Locks ────────────────────────────────────────────────────────────────

    pub fn lock_count(&self) -> Result<u64, StakeError> {
        decode_u64(self.meta.get(LOCK_COUNT_KEY).map_err(storage)?)
    }

    pub fn get_lock(&self, id: LockId) -> Result<Option<Lock>, StakeError> {
        match self.locks.get(id.to_be_bytes()).map_err(storage)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Append `lock` at the next id and bump the count in one transaction.
    pub fn append_lock(&self, lock: &Lock) -> Result<LockId, StakeError> {
        let bytes = encode(lock)?;
        (&self.locks, &self.meta)
            .transaction(|(locks, meta)| {
                let id = match decode_u64(meta.get(LOCK_COUNT_KEY)?) {
                    Ok(id) => id,
                    Err(e) => return abort(e),
                };
                locks.insert(&id.to_be_bytes()[..], bytes.as_slice())?;
                meta.insert(LOCK_COUNT_KEY, &(id + 1).to_be_bytes()[..])?;
                Ok(id)
            })
            .map_err(from_tx)
    }

    /// Overwrite an existing slot. Fails `NotFound` for ids never appended.
    pub fn put_lock(&self, id: LockId, lock: &Lock) -> Result<(), StakeError> {
        if id >= self.lock_count()? {
            return Err(StakeError::NotFound(format!("lock {id}")));
        }
        self.locks.insert(id.to_be_bytes(), encode(lock)?).map_err(storage)?;
        Ok(())
    }

    /// Up to `limit` locks starting at id `offset`, in id order.
    pub fn iter_locks(&self, offset: LockId, limit: usize) -> Result<Vec<(LockId, Lock)>, StakeError> {
        let mut out = Vec::with_capacity(limit.min(64));
        for item in self.locks.range(offset.to_be_bytes()..).take(limit) {
            let (key, value) = item.map_err(storage)?;
            let id = decode_u64(Some(key))?;
            out.push((id, decode(&value)?));
        }
        Ok(out)
    }

    // ── Windows ──────────────────────────────────────────────────────────────

    pub fn window_count(&self) -> Result<u64, StakeError> {
        decode_u64(self.meta.get(WINDOW_COUNT_KEY).map_err(storage)?)
    }

    pub fn get_window(&self, index: WindowIndex) -> Result<Option<Window>, StakeError> {
        match self.windows.get(index.to_be_bytes()).map_err(storage)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Store `window` at the next index (overriding `window.index`) with its
    /// full allocation as the remaining balance.
    pub fn append_window(&self, window: &Window) -> Result<WindowIndex, StakeError> {
        (&self.windows, &self.window_remaining, &self.meta)
            .transaction(|(windows, remaining, meta)| {
                let index = match decode_u64(meta.get(WINDOW_COUNT_KEY)?) {
                    Ok(i) => i,
                    Err(e) => return abort(e),
                };
                let stored = Window { index, ..window.clone() };
                let bytes = match encode(&stored) {
                    Ok(b) => b,
                    Err(e) => return abort(e),
                };
                windows.insert(&index.to_be_bytes()[..], bytes)?;
                remaining.insert(&index.to_be_bytes()[..], &window.total_allocated.to_be_bytes()[..])?;
                meta.insert(WINDOW_COUNT_KEY, &(index + 1).to_be_bytes()[..])?;
                Ok(index)
            })
            .map_err(from_tx)
    }

    pub fn iter_windows(&self, offset: WindowIndex, limit: usize) -> Result<Vec<Window>, StakeError> {
        let mut out = Vec::new();
        for item in self.windows.range(offset.to_be_bytes()..).take(limit) {
            let (_, value) = item.map_err(storage)?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    pub fn window_remaining(&self, index: WindowIndex) -> Result<Balance, StakeError> {
        decode_u128(self.window_remaining.get(index.to_be_bytes()).map_err(storage)?)
    }

    // ── Claims ───────────────────────────────────────────────────────────────

    pub fn is_claimed(&self, window_index: WindowIndex, account_index: u64) -> Result<bool, StakeError> {
        let (key, mask) = claim_key(window_index, account_index);
        let word = decode_u64(self.claims.get(key).map_err(storage)?)?;
        Ok(word & mask != 0)
    }

    /// Mark every entry consumed and debit its window's remaining allocation.
    /// Either all entries commit or none do.
    pub fn commit_claims(&self, entries: &[ClaimEntry]) -> Result<(), StakeError> {
        (&self.claims, &self.window_remaining)
            .transaction(|(claims, remaining)| {
                for e in entries {
                    let (key, mask) = claim_key(e.window_index, e.account_index);
                    let word = match decode_u64(claims.get(&key)?) {
                        Ok(w) => w,
                        Err(err) => return abort(err),
                    };
                    if word & mask != 0 {
                        return abort(StakeError::AlreadyClaimed {
                            window_index: e.window_index,
                            account_index: e.account_index,
                        });
                    }
                    claims.insert(&key[..], &(word | mask).to_be_bytes()[..])?;

                    let rkey = e.window_index.to_be_bytes();
                    let left = match decode_u128(remaining.get(&rkey)?) {
                        Ok(r) => r,
                        Err(err) => return abort(err),
                    };
                    if left < e.amount {
                        return abort(StakeError::AllocationExceeded {
                            window_index: e.window_index,
                            need: e.amount,
                            remaining: left,
                        });
                    }
                    remaining.insert(&rkey[..], &(left - e.amount).to_be_bytes()[..])?;
                }
                Ok(())
            })
            .map_err(from_tx)
    }

    /// Undo `commit_claims` for entries whose payout never happened.
    pub fn revert_claims(&self, entries: &[ClaimEntry]) -> Result<(), StakeError> {
        (&self.claims, &self.window_remaining)
            .transaction(|(claims, remaining)| {
                for e in entries {
                    let (key, mask) = claim_key(e.window_index, e.account_index);
                    let word = match decode_u64(claims.get(&key)?) {
                        Ok(w) => w,
                        Err(err) => return abort(err),
                    };
                    claims.insert(&key[..], &(word & !mask).to_be_bytes()[..])?;

                    let rkey = e.window_index.to_be_bytes();
                    let left = match decode_u128(remaining.get(&rkey)?) {
                        Ok(r) => r,
                        Err(err) => return abort(err),
                    };
                    remaining.insert(&rkey[..], &left.saturating_add(e.amount).to_be_bytes()[..])?;
                }
                Ok(())
            })
            .map_err(from_tx)
    }

    // ── Meta ─────────────────────────────────────────────────────────────────

    pub fn get_meta<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StakeError> {
        match self.meta.get(key.as_bytes()).map_err(storage)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_meta<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StakeError> {
        self.meta.insert(key.as_bytes(), encode(value)?).map_err(storage)?;
        Ok(())
    }

    /// Write `value` only if `key` is unset; `AlreadyInitialized` otherwise.
    pub fn init_meta<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StakeError> {
        let bytes = encode(value)?;
        self.meta
            .compare_and_swap(key.as_bytes(), None as Option<&[u8]>, Some(bytes))
            .map_err(storage)?
            .map_err(|_| StakeError::AlreadyInitialized)
    }

    /// Flush all pending writes to disk.
    pub fn flush(&self) -> Result<(), StakeError> {
        self.db.flush().map_err(storage)?;
        Ok(())
    }
}
