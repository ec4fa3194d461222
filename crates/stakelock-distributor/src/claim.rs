use std::collections::{BTreeMap, BTreeSet};

use tracing::{error, info};

use stakelock_core::error::StakeError;
use stakelock_core::ledger::AssetLedger;
use stakelock_core::types::{AccountId, Balance, Hash32, TokenId, WindowIndex};
use stakelock_core::window::{ClaimRequest, Window};
use stakelock_crypto::merkle::{claim_leaf, verify_proof};
use stakelock_state::ClaimEntry;

use crate::registry::WindowRegistry;

/// Pays out Merkle-committed allocations from distributor custody.
///
/// Reward ledgers are registered per token; a window whose token has no
/// registered ledger cannot be claimed.
pub struct ClaimVerifier<R: AssetLedger> {
    registry: WindowRegistry,
    rewards: BTreeMap<TokenId, R>,
}

/// A verified claim waiting to be applied.
struct Staged {
    entry: ClaimEntry,
    token: TokenId,
    account: AccountId,
}

impl<R: AssetLedger> ClaimVerifier<R> {
    pub fn new(registry: WindowRegistry) -> Self {
        Self { registry, rewards: BTreeMap::new() }
    }

    /// Register the ledger paying out `ledger.token()`. Replaces any earlier
    /// ledger for the same token.
    pub fn with_reward_ledger(mut self, ledger: R) -> Self {
        self.add_reward_ledger(ledger);
        self
    }

    pub fn add_reward_ledger(&mut self, ledger: R) {
        self.rewards.insert(ledger.token().clone(), ledger);
    }

    pub fn registry(&self) -> &WindowRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut WindowRegistry {
        &mut self.registry
    }

    pub fn reward_ledger(&self, token: &TokenId) -> Option<&R> {
        self.rewards.get(token)
    }

    fn ledger_for(&self, token: &TokenId) -> Result<&R, StakeError> {
        self.rewards
            .get(token)
            .ok_or_else(|| StakeError::TransferFailed(format!("no ledger registered for {token}")))
    }

    pub fn is_claimed(&self, window_index: WindowIndex, account_index: u64) -> Result<bool, StakeError> {
        self.registry.db().is_claimed(window_index, account_index)
    }

    // ── Verification ─────────────────────────────────────────────────────────

    fn verify(&self, req: &ClaimRequest) -> Result<Window, StakeError> {
        let db = self.registry.db();
        let window = db
            .get_window(req.window_index)?
            .ok_or(StakeError::UnknownWindow(req.window_index))?;
        if db.is_claimed(req.window_index, req.account_index)? {
            return Err(StakeError::AlreadyClaimed {
                window_index: req.window_index,
                account_index: req.account_index,
            });
        }
        let leaf = claim_leaf(req.account_index, &req.account, req.amount, req.window_index);
        if !verify_proof(&req.merkle_proof, &window.merkle_root, &leaf) {
            return Err(StakeError::InvalidProof);
        }
        Ok(window)
    }

    /// Verify every request, reject in-batch duplicates, and check that each
    /// window's allocation and each token's custody balance cover the batch.
    fn stage(&self, requests: &[ClaimRequest]) -> Result<Vec<Staged>, StakeError> {
        let db = self.registry.db();
        let mut seen = BTreeSet::new();
        let mut per_window: BTreeMap<WindowIndex, Balance> = BTreeMap::new();
        let mut per_token: BTreeMap<TokenId, Balance> = BTreeMap::new();
        let mut staged = Vec::with_capacity(requests.len());

        for req in requests {
            let window = self.verify(req)?;
            if !seen.insert((req.window_index, req.account_index)) {
                return Err(StakeError::AlreadyClaimed {
                    window_index: req.window_index,
                    account_index: req.account_index,
                });
            }

            let need = per_window.entry(req.window_index).or_insert(0);
            *need = need.checked_add(req.amount).ok_or(StakeError::Overflow)?;
            let remaining = db.window_remaining(req.window_index)?;
            if *need > remaining {
                return Err(StakeError::AllocationExceeded {
                    window_index: req.window_index,
                    need: *need,
                    remaining,
                });
            }

            let owed = per_token.entry(window.reward_token.clone()).or_insert(0);
            *owed = owed.checked_add(req.amount).ok_or(StakeError::Overflow)?;

            staged.push(Staged {
                entry: ClaimEntry {
                    window_index: req.window_index,
                    account_index: req.account_index,
                    amount: req.amount,
                },
                token: window.reward_token,
                account: req.account.clone(),
            });
        }

        let custody = &self.registry.config().custody;
        for (token, owed) in &per_token {
            let have = self.ledger_for(token)?.balance_of(custody)?;
            if have < *owed {
                return Err(StakeError::TransferFailed(format!(
                    "custody holds {have} {token}, claims need {owed}"
                )));
            }
        }
        Ok(staged)
    }

    // ── Claims ───────────────────────────────────────────────────────────────

    /// Claim one allocation. Pays `amount` of the window's reward token to
    /// `account`.
    pub fn claim(
        &mut self,
        window_index: WindowIndex,
        amount: Balance,
        account_index: u64,
        account: &AccountId,
        merkle_proof: Vec<Hash32>,
    ) -> Result<(), StakeError> {
        self.claim_multi(&[ClaimRequest {
            window_index,
            amount,
            account_index,
            account: account.clone(),
            merkle_proof,
        }])
    }

    /// Claim a batch. Every request is verified before any is applied; if
    /// one fails, none take effect.
    pub fn claim_multi(&mut self, requests: &[ClaimRequest]) -> Result<(), StakeError> {
        if requests.is_empty() {
            return Ok(());
        }
        let staged = self.stage(requests)?;
        let entries: Vec<ClaimEntry> = staged.iter().map(|s| s.entry.clone()).collect();
        self.registry.db().commit_claims(&entries)?;

        let custody = self.registry.config().custody.clone();
        for (paid, s) in staged.iter().enumerate() {
            let result = self
                .ledger_for(&s.token)
                .and_then(|ledger| ledger.transfer(&custody, &s.account, s.entry.amount));
            if let Err(e) = result {
                self.unwind(&staged[..paid], &custody);
                if let Err(revert_err) = self.registry.db().revert_claims(&entries) {
                    error!(error = %revert_err, "could not revert claim bitmap");
                }
                return Err(StakeError::TransferFailed(e.to_string()));
            }
            info!(
                window_index = s.entry.window_index,
                account_index = s.entry.account_index,
                account = %s.account,
                amount = s.entry.amount,
                "claimed"
            );
        }
        Ok(())
    }

    fn unwind(&self, paid: &[Staged], custody: &AccountId) {
        for s in paid.iter().rev() {
            let result = self
                .ledger_for(&s.token)
                .and_then(|ledger| ledger.transfer(&s.account, custody, s.entry.amount));
            if let Err(e) = result {
                error!(account = %s.account, amount = s.entry.amount, error = %e, "could not unwind payout");
            }
        }
    }

    /// Admin recovery of reward tokens not owed to any open window.
    pub fn withdraw_rewards(
        &mut self,
        caller: &AccountId,
        token: &TokenId,
        amount: Balance,
    ) -> Result<(), StakeError> {
        self.registry.require_admin(caller)?;
        if amount == 0 {
            return Err(StakeError::InvalidAmount("amount must be greater than zero".into()));
        }
        let ledger = self.ledger_for(token)?;
        let custody = &self.registry.config().custody;
        let held = ledger.balance_of(custody)?;
        let free = held.saturating_sub(self.registry.outstanding(token)?);
        if amount > free {
            return Err(StakeError::InsufficientBalance { need: amount, have: free });
        }
        ledger
            .transfer(custody, caller, amount)
            .map_err(|e| StakeError::TransferFailed(e.to_string()))?;
        info!(%token, amount, to = %caller, "rewards withdrawn");
        Ok(())
    }
}
