//! stakelock
//!
//! Operator CLI for the staking ledger and reward distributor. Every command
//! opens the state database, performs one operation and exits.
//!
//! Usage:
//!   stakelock init            --config <init.json>
//!   stakelock credit          --token <sym> --to <account> --amount <n>
//!   stakelock approve         --token <sym> --spender <account> --amount <n>   (as --caller)
//!   stakelock balance         --token <sym> --account <account>
//!   stakelock deposit         --amount <n> (--duration <secs> | --months <m>) [--recipient <account>]
//!   stakelock withdraw        --lock-id <id>
//!   stakelock boost           --lock-id <id>
//!   stakelock eject           --lock-id <id>...
//!   stakelock lock            --lock-id <id>
//!   stakelock locks           [--owner <account>] [--offset <n>] [--limit <n>]
//!   stakelock staking         --account <account>
//!   stakelock set-config      [--min-lock-amount ..] [--min-lock-duration ..] ...
//!   stakelock publish-window  --allocations <file> --token <sym> --proofs-out <file>
//!   stakelock window          --index <n>
//!   stakelock windows         [--offset <n>] [--limit <n>]
//!   stakelock claim           --proofs <file> [--account-index <i>...]
//!   stakelock is-claimed      --window <n> --account-index <i>
//!   stakelock withdraw-rewards --token <sym> --amount <n>
//!
//! Accounts are base-58 ids, or `@name` for an id derived from `name`.
//!
//! `init` writes the share mint authority to `mint_authority.json` next to
//! the data directory. Every lock ledger command loads it from there.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::info;

use stakelock_core::{
    AccountId, AssetLedger, Balance, ClaimRequest, DistributorConfig, Hash32, LockLedgerConfig,
    MintAuthority, MultiplierConfig, TokenId, DEFAULT_EJECT_BUFFER_SECS,
    DEFAULT_SECONDS_PER_MONTH,
};
use stakelock_crypto::{claim_leaf, MerkleTree};
use stakelock_distributor::{ClaimVerifier, WindowRegistry, DISTRIBUTOR_CONFIG_KEY};
use stakelock_state::{SledTokenLedger, StateDb};
use stakelock_timelock::{LockLedger, LOCK_LEDGER_CONFIG_KEY};

type Ledger = LockLedger<SledTokenLedger, SledTokenLedger>;

const AUTHORITY_FILE: &str = "mint_authority.json";

// ── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "stakelock", version, about = "Time-locked share staking with Merkle reward windows")]
struct Args {
    /// Directory for the persistent state database.
    #[arg(long, global = true, default_value = "~/.stakelock/data")]
    data_dir: PathBuf,

    /// Account performing the operation.
    #[arg(long, global = true)]
    caller: Option<String>,

    /// Override the current Unix time (seconds).
    #[arg(long, global = true)]
    now: Option<i64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Set up the lock ledger and distributor from a JSON init file.
    Init {
        #[arg(long)]
        config: PathBuf,
    },

    /// Mint test balance of a plain token to an account.
    Credit {
        #[arg(long)]
        token: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        amount: Balance,
    },

    /// Let `spender` move up to `amount` of the caller's tokens.
    /// Defaults to the lock ledger custody account.
    Approve {
        #[arg(long)]
        token: String,
        #[arg(long)]
        spender: Option<String>,
        #[arg(long)]
        amount: Balance,
    },

    Balance {
        #[arg(long)]
        token: String,
        #[arg(long)]
        account: String,
    },

    /// Lock deposit tokens and receive shares.
    Deposit {
        #[arg(long)]
        amount: Balance,
        /// Lock duration in seconds.
        #[arg(long, conflicts_with = "months")]
        duration: Option<u64>,
        /// Lock duration in months.
        #[arg(long)]
        months: Option<u32>,
        /// Share recipient. Defaults to the caller.
        #[arg(long)]
        recipient: Option<String>,
    },

    /// Withdraw a matured lock.
    Withdraw {
        #[arg(long)]
        lock_id: u64,
    },

    /// Extend a lock to the maximum duration and top up its shares.
    Boost {
        #[arg(long)]
        lock_id: u64,
    },

    /// Admin: release matured locks to their owners.
    Eject {
        #[arg(long = "lock-id", required = true)]
        lock_ids: Vec<u64>,
    },

    /// Describe one lock.
    Lock {
        #[arg(long)]
        lock_id: u64,
    },

    /// List locks, optionally only those owned by one account.
    Locks {
        #[arg(long)]
        owner: Option<String>,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Print an account's share balance, deposit balance and locks as JSON.
    Staking {
        #[arg(long)]
        account: String,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Admin: update lock ledger parameters.
    SetConfig {
        #[arg(long)]
        min_lock_amount: Option<Balance>,
        #[arg(long)]
        min_lock_duration: Option<u64>,
        #[arg(long)]
        max_lock_duration: Option<u64>,
        #[arg(long)]
        seconds_per_month: Option<u64>,
        #[arg(long)]
        eject_buffer: Option<u64>,
    },

    /// Admin: build a Merkle tree over an allocation list, publish its root
    /// and write every recipient's proof.
    PublishWindow {
        #[arg(long)]
        allocations: PathBuf,
        #[arg(long)]
        token: String,
        #[arg(long, default_value = "")]
        metadata: String,
        #[arg(long)]
        proofs_out: PathBuf,
    },

    Window {
        #[arg(long)]
        index: u64,
    },

    Windows {
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Claim allocations from a proofs file. Claims every entry unless
    /// account indices are given; the batch succeeds or fails as a whole.
    Claim {
        #[arg(long)]
        proofs: PathBuf,
        #[arg(long = "account-index")]
        account_indices: Vec<u64>,
    },

    IsClaimed {
        #[arg(long)]
        window: u64,
        #[arg(long)]
        account_index: u64,
    },

    /// Admin: recover reward tokens not owed to any window.
    WithdrawRewards {
        #[arg(long)]
        token: String,
        #[arg(long)]
        amount: Balance,
    },
}

// ── Files ─────────────────────────────────────────────────────────────────────

/// Contents of the `init` config file.
#[derive(Deserialize, Debug)]
struct InitFile {
    admin: String,
    timelock_custody: String,
    distributor_custody: String,
    deposit_token: String,
    share_token: String,
    #[serde(default)]
    multiplier: MultiplierConfig,
    #[serde(default = "default_seconds_per_month")]
    seconds_per_month: u64,
    #[serde(default)]
    eject_buffer: Option<u64>,
}

fn default_seconds_per_month() -> u64 {
    DEFAULT_SECONDS_PER_MONTH
}

#[derive(Deserialize, Debug)]
struct Allocation {
    account: String,
    /// Decimal string; JSON numbers cannot carry the full range.
    amount: String,
}

/// One line of a proofs file, everything a recipient needs to claim.
#[derive(Serialize, Deserialize, Debug)]
struct ProofEntry {
    window_index: u64,
    account_index: u64,
    account: String,
    amount: String,
    proof: Vec<String>,
}

impl ProofEntry {
    fn to_request(&self) -> anyhow::Result<ClaimRequest> {
        let merkle_proof = self
            .proof
            .iter()
            .map(|h| Hash32::from_hex(h).map_err(|e| anyhow::anyhow!("invalid proof hash {h}: {e}")))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(ClaimRequest {
            window_index: self.window_index,
            amount: self.amount.parse().with_context(|| format!("invalid amount {}", self.amount))?,
            account_index: self.account_index,
            account: parse_account(&self.account)?,
            merkle_proof,
        })
    }
}

// ── Main ─────────────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,stakelock=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let data_dir = expand_tilde(&args.data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;
    let db = Arc::new(StateDb::open(&data_dir).context("opening state database")?);
    let authority_file = data_dir.with_file_name(AUTHORITY_FILE);
    let now = args.now.unwrap_or_else(|| chrono::Utc::now().timestamp());
    let caller = || -> anyhow::Result<AccountId> {
        match &args.caller {
            Some(c) => parse_account(c),
            None => bail!("this command needs --caller"),
        }
    };

    match args.command {
        Command::Init { config } => cmd_init(&db, &config, &authority_file)?,

        Command::Credit { token, to, amount } => {
            let to = parse_account(&to)?;
            db.token_ledger(TokenId::new(&token)).credit(&to, amount)?;
            println!("credited {amount} {token} to {to}");
        }

        Command::Approve { token, spender, amount } => {
            let owner = caller()?;
            let spender = match spender {
                Some(s) => parse_account(&s)?,
                None => open_lock_ledger(&db, &authority_file)?.config().custody.clone(),
            };
            db.token_ledger(TokenId::new(&token)).approve(&owner, &spender, amount)?;
            println!("{owner} approved {spender} for {amount} {token}");
        }

        Command::Balance { token, account } => {
            let account = parse_account(&account)?;
            let ledger = db.token_ledger(TokenId::new(&token));
            println!("{}", AssetLedger::balance_of(&ledger, &account)?);
        }

        Command::Deposit { amount, duration, months, recipient } => {
            let who = caller()?;
            let recipient = match recipient {
                Some(r) => parse_account(&r)?,
                None => who.clone(),
            };
            let mut ledger = open_lock_ledger(&db, &authority_file)?;
            let id = match (duration, months) {
                (Some(secs), None) => ledger.deposit(&who, amount, secs, &recipient, now)?,
                (None, Some(m)) => ledger.deposit_by_months(&who, amount, m, &recipient, now)?,
                _ => bail!("give exactly one of --duration or --months"),
            };
            let lock = ledger.lock(id)?;
            println!("lock {id}: {} shares to {recipient}", lock.shares);
        }

        Command::Withdraw { lock_id } => {
            open_lock_ledger(&db, &authority_file)?.withdraw(&caller()?, lock_id, now)?;
            println!("withdrew lock {lock_id}");
        }

        Command::Boost { lock_id } => {
            let extra = open_lock_ledger(&db, &authority_file)?.boost_to_max(&caller()?, lock_id, now)?;
            println!("boosted lock {lock_id}: {extra} extra shares");
        }

        Command::Eject { lock_ids } => {
            let ejected = open_lock_ledger(&db, &authority_file)?.eject(&caller()?, &lock_ids, now)?;
            println!("ejected {ejected:?}");
        }

        Command::Lock { lock_id } => {
            println!("{}", open_lock_ledger(&db, &authority_file)?.query().describe(lock_id, now)?);
        }

        Command::Locks { owner, offset, limit } => {
            let ledger = open_lock_ledger(&db, &authority_file)?;
            let page = match owner {
                Some(o) => ledger.locks_of(&parse_account(&o)?, offset, limit)?,
                None => ledger.locks_page(offset, limit)?,
            };
            for (id, lock) in &page.locks {
                println!(
                    "{id}\towner={}\tamount={}\tshares={}\tunlock_at={}",
                    lock.owner,
                    lock.amount,
                    lock.shares,
                    lock.unlock_at()
                );
            }
            if let Some(next) = page.next_offset {
                println!("next offset: {next}");
            }
        }

        Command::Staking { account, offset, limit } => {
            let ledger = open_lock_ledger(&db, &authority_file)?;
            let data = ledger.staking_data(&parse_account(&account)?, offset, limit)?;
            println!("{}", serde_json::to_string_pretty(&data)?);
        }

        Command::SetConfig {
            min_lock_amount,
            min_lock_duration,
            max_lock_duration,
            seconds_per_month,
            eject_buffer,
        } => {
            let who = caller()?;
            let mut ledger = open_lock_ledger(&db, &authority_file)?;
            // Widen before narrowing so an intermediate config never has min >= max.
            if let Some(v) = max_lock_duration {
                if v > ledger.config().multiplier.max_lock_duration {
                    ledger.set_max_lock_duration(&who, v)?;
                }
            }
            if let Some(v) = min_lock_duration {
                ledger.set_min_lock_duration(&who, v)?;
            }
            if let Some(v) = max_lock_duration {
                if v != ledger.config().multiplier.max_lock_duration {
                    ledger.set_max_lock_duration(&who, v)?;
                }
            }
            if let Some(v) = min_lock_amount {
                ledger.set_min_lock_amount(&who, v)?;
            }
            if let Some(v) = seconds_per_month {
                ledger.set_seconds_per_month(&who, v)?;
            }
            if let Some(v) = eject_buffer {
                ledger.set_eject_buffer(&who, v)?;
            }
            println!("{}", serde_json::to_string_pretty(ledger.config())?);
        }

        Command::PublishWindow { allocations, token, metadata, proofs_out } => {
            cmd_publish_window(&db, &caller()?, &allocations, &token, metadata, &proofs_out, now)?
        }

        Command::Window { index } => {
            let registry = WindowRegistry::open(db.clone())?;
            let window = registry.window(index)?;
            println!("window {}", window.index);
            println!("  root:      {}", window.merkle_root);
            println!("  token:     {}", window.reward_token);
            println!("  total:     {}", window.total_allocated);
            println!("  remaining: {}", registry.remaining(index)?);
            println!("  metadata:  {}", window.metadata);
        }

        Command::Windows { offset, limit } => {
            let page = WindowRegistry::open(db.clone())?.windows_page(offset, limit)?;
            for w in &page.windows {
                println!("{}\t{}\t{}\t{}", w.index, w.merkle_root, w.reward_token, w.total_allocated);
            }
            if let Some(next) = page.next_offset {
                println!("next offset: {next}");
            }
        }

        Command::Claim { proofs, account_indices } => {
            let raw = std::fs::read_to_string(&proofs)
                .with_context(|| format!("reading proofs file {}", proofs.display()))?;
            let entries: Vec<ProofEntry> = serde_json::from_str(&raw).context("parsing proofs file")?;
            let requests = entries
                .iter()
                .filter(|e| account_indices.is_empty() || account_indices.contains(&e.account_index))
                .map(ProofEntry::to_request)
                .collect::<anyhow::Result<Vec<_>>>()?;
            if requests.is_empty() {
                bail!("no matching entries in {}", proofs.display());
            }
            let mut verifier = open_verifier(&db, requests.iter().map(|r| r.window_index))?;
            verifier.claim_multi(&requests)?;
            println!("claimed {} allocation(s)", requests.len());
        }

        Command::IsClaimed { window, account_index } => {
            let verifier: ClaimVerifier<SledTokenLedger> = ClaimVerifier::new(WindowRegistry::open(db.clone())?);
            println!("{}", verifier.is_claimed(window, account_index)?);
        }

        Command::WithdrawRewards { token, amount } => {
            let who = caller()?;
            let token = TokenId::new(token);
            let mut verifier = ClaimVerifier::new(WindowRegistry::open(db.clone())?)
                .with_reward_ledger(db.token_ledger(token.clone()));
            verifier.withdraw_rewards(&who, &token, amount)?;
            println!("withdrew {amount} {token} to {who}");
        }
    }

    db.flush().context("flushing state database")?;
    Ok(())
}

// ── Commands ─────────────────────────────────────────────────────────────────

fn cmd_init(db: &Arc<StateDb>, path: &Path, authority_file: &Path) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading init file {}", path.display()))?;
    let init: InitFile = serde_json::from_str(&raw).context("parsing init file")?;

    // Everything is parsed and validated before the first write.
    let admin = parse_account(&init.admin)?;
    let custody = parse_account(&init.timelock_custody)?;
    let mut config = LockLedgerConfig::new(
        admin.clone(),
        custody.clone(),
        TokenId::new(init.deposit_token),
        TokenId::new(init.share_token),
        init.multiplier,
    );
    config.seconds_per_month = init.seconds_per_month;
    config.eject_buffer = init.eject_buffer.unwrap_or(DEFAULT_EJECT_BUFFER_SECS);
    config.validate().context("validating lock ledger config")?;
    let distributor = DistributorConfig { admin, custody: parse_account(&init.distributor_custody)? };
    distributor.validate().context("validating distributor config")?;

    let initialized = db.get_meta::<LockLedgerConfig>(LOCK_LEDGER_CONFIG_KEY)?.is_some()
        || db.get_meta::<DistributorConfig>(DISTRIBUTOR_CONFIG_KEY)?.is_some();
    if initialized {
        bail!("already initialized");
    }
    if authority_file.exists() {
        bail!(
            "mint authority file {} already exists; remove it or use a fresh data dir",
            authority_file.display()
        );
    }

    let deposit = db.token_ledger(config.deposit_token.clone());
    let shares = db.token_ledger(config.share_token.clone());
    let authority = shares
        .grant_mint_authority(&custody)
        .context("granting share mint authority")?;
    std::fs::write(authority_file, serde_json::to_string_pretty(&authority)?)
        .with_context(|| format!("writing mint authority to {}", authority_file.display()))?;
    LockLedger::initialize(db.clone(), config, deposit, shares, authority)
        .context("initializing lock ledger")?;
    WindowRegistry::initialize(db.clone(), distributor).context("initializing distributor")?;

    info!(path = %path.display(), authority = %authority_file.display(), "initialized");
    println!("initialized from {}", path.display());
    println!("mint authority written to {}; keep it with the data dir", authority_file.display());
    Ok(())
}

fn cmd_publish_window(
    db: &Arc<StateDb>,
    caller: &AccountId,
    allocations: &Path,
    token: &str,
    metadata: String,
    proofs_out: &Path,
    now: i64,
) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(allocations)
        .with_context(|| format!("reading allocations {}", allocations.display()))?;
    let list: Vec<Allocation> = serde_json::from_str(&raw).context("parsing allocations")?;
    if list.is_empty() {
        bail!("allocation list is empty");
    }

    let mut registry = WindowRegistry::open(db.clone())?;
    let window_index = registry.windows_length()?;

    let mut parsed = Vec::with_capacity(list.len());
    let mut total: Balance = 0;
    for a in &list {
        let account = parse_account(&a.account)?;
        let amount: Balance = a.amount.parse().with_context(|| format!("invalid amount {}", a.amount))?;
        total = total.checked_add(amount).context("allocation total overflows")?;
        parsed.push((account, amount));
    }

    let leaves = parsed
        .iter()
        .enumerate()
        .map(|(i, (account, amount))| claim_leaf(i as u64, account, *amount, window_index))
        .collect();
    let tree = MerkleTree::from_leaves(leaves);

    let published = registry.publish_window(caller, tree.root(), total, TokenId::new(token), metadata, now)?;
    if published != window_index {
        bail!("window index moved during publish: expected {window_index}, got {published}");
    }

    let mut entries = Vec::with_capacity(parsed.len());
    for (i, (account, amount)) in parsed.iter().enumerate() {
        let proof = tree.proof(i).context("proof index out of range")?;
        entries.push(ProofEntry {
            window_index,
            account_index: i as u64,
            account: account.to_b58(),
            amount: amount.to_string(),
            proof: proof.iter().map(Hash32::to_hex).collect(),
        });
    }
    std::fs::write(proofs_out, serde_json::to_string_pretty(&entries)?)
        .with_context(|| format!("writing proofs to {}", proofs_out.display()))?;

    println!("window {window_index}: root {} total {total} {token}", tree.root());
    println!("proofs written to {}", proofs_out.display());
    Ok(())
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn open_lock_ledger(db: &Arc<StateDb>, authority_file: &Path) -> anyhow::Result<Ledger> {
    let config: LockLedgerConfig = db
        .get_meta(LOCK_LEDGER_CONFIG_KEY)?
        .context("lock ledger not initialized; run `stakelock init` first")?;
    let deposit = db.token_ledger(config.deposit_token.clone());
    let shares = db.token_ledger(config.share_token.clone());
    Ok(LockLedger::open(db.clone(), deposit, shares, load_authority(authority_file)?)?)
}

fn load_authority(path: &Path) -> anyhow::Result<MintAuthority> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading mint authority {}", path.display()))?;
    serde_json::from_str(&json).context("parsing mint authority file")
}

/// Verifier with a reward ledger registered for every window in `windows`.
fn open_verifier(
    db: &Arc<StateDb>,
    windows: impl Iterator<Item = u64>,
) -> anyhow::Result<ClaimVerifier<SledTokenLedger>> {
    let mut verifier = ClaimVerifier::new(WindowRegistry::open(db.clone())?);
    for index in windows {
        if let Ok(window) = verifier.registry().window(index) {
            if verifier.reward_ledger(&window.reward_token).is_none() {
                verifier.add_reward_ledger(db.token_ledger(window.reward_token));
            }
        }
    }
    Ok(verifier)
}

fn parse_account(s: &str) -> anyhow::Result<AccountId> {
    match s.strip_prefix('@') {
        Some(name) => Ok(AccountId::derive(name.as_bytes())),
        None => Ok(AccountId::from_b58(s)?),
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Ok(home) = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
            return PathBuf::from(home).join(stripped);
        }
    }
    path.to_path_buf()
}
