use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use stakelock_core::config::DistributorConfig;
use stakelock_core::constants::MAX_PAGE_SIZE;
use stakelock_core::error::StakeError;
use stakelock_core::types::{AccountId, Balance, Hash32, Timestamp, TokenId, WindowIndex};
use stakelock_core::window::Window;
use stakelock_state::StateDb;

/// Meta key holding the `DistributorConfig`.
pub const DISTRIBUTOR_CONFIG_KEY: &str = "distributor_config";

/// One page of windows plus where the next page starts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowPage {
    pub windows: Vec<Window>,
    pub next_offset: Option<WindowIndex>,
}

/// Append-only list of published reward windows.
pub struct WindowRegistry {
    db: Arc<StateDb>,
    config: DistributorConfig,
}

impl WindowRegistry {
    pub fn initialize(db: Arc<StateDb>, config: DistributorConfig) -> Result<Self, StakeError> {
        config.validate()?;
        db.init_meta(DISTRIBUTOR_CONFIG_KEY, &config)?;
        info!(admin = %config.admin, custody = %config.custody, "distributor initialized");
        Ok(Self { db, config })
    }

    pub fn open(db: Arc<StateDb>) -> Result<Self, StakeError> {
        let config = db
            .get_meta(DISTRIBUTOR_CONFIG_KEY)?
            .ok_or(StakeError::NotInitialized)?;
        Ok(Self { db, config })
    }

    pub fn config(&self) -> &DistributorConfig {
        &self.config
    }

    pub(crate) fn db(&self) -> &StateDb {
        &self.db
    }

    pub(crate) fn require_admin(&self, caller: &AccountId) -> Result<(), StakeError> {
        if caller != &self.config.admin {
            warn!(%caller, "rejected admin call");
            return Err(StakeError::Unauthorized);
        }
        Ok(())
    }

    /// Record a new window. Funding custody is a separate step; nothing is
    /// transferred here.
    pub fn publish_window(
        &mut self,
        caller: &AccountId,
        merkle_root: Hash32,
        total_allocated: Balance,
        reward_token: TokenId,
        metadata: impl Into<String>,
        now: Timestamp,
    ) -> Result<WindowIndex, StakeError> {
        self.require_admin(caller)?;
        if merkle_root.is_zero() {
            return Err(StakeError::InvalidRoot);
        }
        if total_allocated == 0 {
            return Err(StakeError::InvalidAmount("window allocation must be greater than zero".into()));
        }
        let window = Window {
            index: 0,
            merkle_root,
            total_allocated,
            reward_token,
            metadata: metadata.into(),
            published_at: now,
        };
        let index = self.db.append_window(&window)?;
        info!(
            window_index = index,
            root = %window.merkle_root,
            total = total_allocated,
            token = %window.reward_token,
            "window published"
        );
        Ok(index)
    }

    pub fn window(&self, index: WindowIndex) -> Result<Window, StakeError> {
        self.db
            .get_window(index)?
            .ok_or_else(|| StakeError::NotFound(format!("window {index}")))
    }

    pub fn windows_length(&self) -> Result<u64, StakeError> {
        self.db.window_count()
    }

    /// Allocation of `index` not yet claimed.
    pub fn remaining(&self, index: WindowIndex) -> Result<Balance, StakeError> {
        self.window(index)?;
        self.db.window_remaining(index)
    }

    pub fn windows_page(&self, offset: WindowIndex, limit: usize) -> Result<WindowPage, StakeError> {
        let limit = limit.min(MAX_PAGE_SIZE);
        let windows = self.db.iter_windows(offset, limit)?;
        let next = offset.saturating_add(windows.len() as u64);
        let next_offset = (next < self.windows_length()?).then_some(next);
        Ok(WindowPage { windows, next_offset })
    }

    /// Unclaimed allocation across every window paying in `token`.
    pub fn outstanding(&self, token: &TokenId) -> Result<Balance, StakeError> {
        let mut total: Balance = 0;
        let mut offset = 0;
        loop {
            let page = self.windows_page(offset, MAX_PAGE_SIZE)?;
            for w in page.windows.iter().filter(|w| &w.reward_token == token) {
                total = total
                    .checked_add(self.db.window_remaining(w.index)?)
                    .ok_or(StakeError::Overflow)?;
            }
            match page.next_offset {
                Some(next) => offset = next,
                None => return Ok(total),
            }
        }
    }
}
