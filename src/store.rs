//! Ledger store - durable keyed storage with per-account atomic mutation
//!
//! This is the sole concurrency boundary of the system. Every mutating
//! operation goes through [`LedgerStore::with_account`], which serializes
//! writers per account, commits the mutated snapshot together with its new
//! transactions, and re-checks a version counter so a stale snapshot fails
//! with `ConcurrentModification` instead of clobbering newer state.
//!
//! The transaction log is append-only and owned by the store independently of
//! any in-memory account view; it is the source of truth for audits.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::EscrowResult;
use crate::error::EscrowError;
use crate::models::{EscrowAccount, Transaction, TransactionKind};
use crate::money::Money;

/// Account snapshot paired with its optimistic-concurrency version
#[derive(Debug, Clone)]
struct VersionedAccount {
    account: EscrowAccount,
    version: u64,
}

/// Balances reconstructed purely from the transaction log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayedBalances {
    pub funded: Money,
    pub released: Money,
}

/// In-memory ledger store guarded by per-account mutexes.
///
/// A durable deployment swaps this for a transactional table with row-level
/// locking; the contract stays the same.
pub struct LedgerStore {
    accounts: RwLock<HashMap<Uuid, VersionedAccount>>,
    locks: RwLock<HashMap<Uuid, Arc<Mutex<()>>>>,
    transactions: RwLock<Vec<Transaction>>,
}

impl LedgerStore {
    pub fn new() -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            locks: RwLock::new(HashMap::new()),
            transactions: RwLock::new(Vec::new()),
        }
    }

    /// Insert a freshly created account
    pub async fn insert_account(&self, account: EscrowAccount) {
        let id = account.id;
        self.accounts
            .write()
            .await
            .insert(id, VersionedAccount { account, version: 0 });
        debug!(account_id = %id, "inserted account");
    }

    /// Current snapshot of an account
    pub async fn get_account(&self, account_id: Uuid) -> EscrowResult<EscrowAccount> {
        self.accounts
            .read()
            .await
            .get(&account_id)
            .map(|v| v.account.clone())
            .ok_or_else(|| EscrowError::not_found("account", account_id.to_string()))
    }

    /// Run a mutation against an account under its exclusive lock.
    ///
    /// The closure receives the current snapshot and returns the transactions
    /// to append; snapshot and transactions commit atomically. The closure is
    /// synchronous on purpose: external I/O must happen outside the lock.
    pub async fn with_account<F>(&self, account_id: Uuid, f: F) -> EscrowResult<EscrowAccount>
    where
        F: FnOnce(&mut EscrowAccount) -> EscrowResult<Vec<Transaction>>,
    {
        let lock = self.account_lock(account_id).await?;
        let _guard = lock.lock().await;

        let (mut snapshot, version) = {
            let accounts = self.accounts.read().await;
            let versioned = accounts
                .get(&account_id)
                .ok_or_else(|| EscrowError::not_found("account", account_id.to_string()))?;
            (versioned.account.clone(), versioned.version)
        };

        let new_transactions = f(&mut snapshot)?;
        snapshot.updated_at = chrono::Utc::now();

        // Commit: re-check the version, then persist snapshot and log together.
        let mut accounts = self.accounts.write().await;
        let current = accounts
            .get(&account_id)
            .ok_or_else(|| EscrowError::not_found("account", account_id.to_string()))?;
        if current.version != version {
            return Err(EscrowError::ConcurrentModification { account_id });
        }
        accounts.insert(
            account_id,
            VersionedAccount {
                account: snapshot.clone(),
                version: version + 1,
            },
        );
        self.transactions.write().await.extend(new_transactions);
        drop(accounts);

        Ok(snapshot)
    }

    /// Delete an account; only permitted once every milestone is terminal
    pub async fn remove_account(&self, account_id: Uuid) -> EscrowResult<()> {
        let lock = self.account_lock(account_id).await?;
        let _guard = lock.lock().await;

        let mut accounts = self.accounts.write().await;
        let versioned = accounts
            .get(&account_id)
            .ok_or_else(|| EscrowError::not_found("account", account_id.to_string()))?;
        if !versioned.account.all_milestones_terminal() {
            return Err(EscrowError::invalid_state(
                format!("{:?}", versioned.account.status),
                "deleted".to_string(),
                "account still has non-terminal milestones".to_string(),
            ));
        }
        accounts.remove(&account_id);
        drop(accounts);
        self.locks.write().await.remove(&account_id);
        Ok(())
    }

    /// All transactions for an account, ordered by creation time.
    ///
    /// Appends happen in commit order, so the log is already chronological;
    /// the sort keeps the contract explicit.
    pub async fn transactions_for_account(&self, account_id: Uuid) -> Vec<Transaction> {
        let mut matching: Vec<Transaction> = self
            .transactions
            .read()
            .await
            .iter()
            .filter(|t| t.account_id == account_id)
            .cloned()
            .collect();
        matching.sort_by_key(|t| t.created_at);
        matching
    }

    /// Reconstruct `funded`/`released` purely from the transaction log.
    ///
    /// `funded = sum(fund) - sum(refund)`, `released = sum(release)`; fee
    /// transactions never touch custody balances.
    pub async fn replay(&self, account_id: Uuid) -> EscrowResult<ReplayedBalances> {
        let account = self.get_account(account_id).await?;
        let currency = account.total_budget.currency();

        let mut funded = Money::zero(currency);
        let mut released = Money::zero(currency);
        for tx in self.transactions_for_account(account_id).await {
            match tx.kind {
                TransactionKind::Fund => funded = funded.checked_add(tx.amount)?,
                TransactionKind::Refund => funded = funded.checked_sub(tx.amount)?,
                TransactionKind::Release => released = released.checked_add(tx.amount)?,
                TransactionKind::Fee => {}
            }
        }

        Ok(ReplayedBalances { funded, released })
    }

    async fn account_lock(&self, account_id: Uuid) -> EscrowResult<Arc<Mutex<()>>> {
        if !self.accounts.read().await.contains_key(&account_id) {
            return Err(EscrowError::not_found("account", account_id.to_string()));
        }
        let mut locks = self.locks.write().await;
        Ok(locks
            .entry(account_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }
}

impl Default for LedgerStore {
    fn default() -> Self {
        Self::new()
    }
}
