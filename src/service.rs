//! Escrow service - the public operations over the ledger
//!
//! Every mutating operation is serialized per account through the store lock,
//! validates against current account and milestone state, talks to the
//! external payment processor *outside* the lock, then commits the state
//! transition together with its transaction records atomically.
//!
//! Mutating calls carry a client-supplied idempotency key; replaying a key
//! against an already-completed operation returns the recorded result without
//! moving money again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::EscrowResult;
use crate::config::ServiceConfig;
use crate::error::EscrowError;
use crate::models::{
    AccountStatus, AccountSummary, Actor, DisputeOutcome, EscrowAccount, Milestone,
    MilestoneSpec, MilestoneStatus, Role, Transaction, TransactionKind,
};
use crate::money::Money;
use crate::notifier::{EscrowEvent, EscrowNotifier, EventKind};
use crate::processor::{PaymentProcessor, ProcessorError, ProcessorReceipt};
use crate::store::LedgerStore;

/// Account creation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAccountRequest {
    pub project_id: String,
    pub payer_id: String,
    pub payee_id: String,
    pub total_budget: Money,
    pub milestones: Vec<MilestoneSpec>,
}

/// Result of funding a milestone
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundOutcome {
    pub account: EscrowAccount,
    pub fee: Money,
    pub processor_ref: String,
}

/// Result of releasing or refunding a milestone
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutOutcome {
    pub account: EscrowAccount,
    pub processor_ref: String,
}

/// Result of resolving a dispute
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveOutcome {
    pub account: EscrowAccount,
    pub released: Money,
    pub refunded: Money,
}

/// Ledger-vs-log cross-check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reconciliation {
    pub summary: AccountSummary,
    pub replayed_funded: Money,
    pub replayed_released: Money,
    pub consistent: bool,
}

/// Recorded terminal result for an idempotency key
#[derive(Debug, Clone)]
struct CompletedOperation {
    fingerprint: String,
    result: serde_json::Value,
    recorded_at: Instant,
}

/// Main escrow service
pub struct EscrowService {
    config: ServiceConfig,
    store: Arc<LedgerStore>,
    processor: Arc<dyn PaymentProcessor>,
    notifier: Arc<dyn EscrowNotifier>,
    replay_cache: RwLock<HashMap<String, CompletedOperation>>,
    key_locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl EscrowService {
    pub fn new(
        config: ServiceConfig,
        store: Arc<LedgerStore>,
        processor: Arc<dyn PaymentProcessor>,
        notifier: Arc<dyn EscrowNotifier>,
    ) -> Self {
        Self {
            config,
            store,
            processor,
            notifier,
            replay_cache: RwLock::new(HashMap::new()),
            key_locks: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<LedgerStore> {
        &self.store
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Create an escrow account with its milestone schedule.
    ///
    /// Fails `InvalidAmount` if the budget or any milestone amount is not
    /// positive, `BudgetExceeded` if the milestones overcommit the budget,
    /// `CurrencyMismatch` on mixed currencies.
    pub async fn create_account(
        &self,
        request: CreateAccountRequest,
        actor: &Actor,
        idempotency_key: &str,
    ) -> EscrowResult<EscrowAccount> {
        let lock = self.key_lock(idempotency_key).await;
        let _serialized = lock.lock().await;

        let fingerprint = fingerprint("create_account", &request)?;
        if let Some(prior) = self.replayed(idempotency_key, &fingerprint).await? {
            return Ok(prior);
        }

        if actor.role != Role::Payer || actor.id != request.payer_id {
            return Err(EscrowError::unauthorized(
                actor.id.clone(),
                "create an escrow account".to_string(),
            ));
        }

        let account = EscrowAccount::new(
            request.project_id,
            request.payer_id,
            request.payee_id,
            request.total_budget,
            request.milestones,
        )?;
        self.store.insert_account(account.clone()).await;
        info!(account_id = %account.id, budget = %account.total_budget, "created escrow account");

        self.record(idempotency_key, fingerprint, &account).await?;
        self.emit(EscrowEvent::new(
            EventKind::AccountCreated,
            account.id,
            None,
            Some(account.total_budget),
        ))
        .await;

        Ok(account)
    }

    /// Fund a milestone: charge `amount + fee` on the payer's instrument,
    /// then commit `pending -> funded` with `fund` and `fee` transactions.
    ///
    /// The charge happens outside the account lock; if the ledger commit then
    /// fails, a compensating refund is issued and `PartialFailure` is
    /// reported with the processor reference.
    pub async fn fund_milestone(
        &self,
        account_id: Uuid,
        milestone_id: Uuid,
        instrument_ref: &str,
        actor: &Actor,
        idempotency_key: &str,
    ) -> EscrowResult<FundOutcome> {
        let lock = self.key_lock(idempotency_key).await;
        let _serialized = lock.lock().await;

        let fingerprint = fingerprint(
            "fund_milestone",
            &(account_id, milestone_id, instrument_ref, actor),
        )?;
        if let Some(prior) = self.replayed(idempotency_key, &fingerprint).await? {
            return Ok(prior);
        }

        let account = self.store.get_account(account_id).await?;
        authorize(&account, actor, "fund a milestone", &[Role::Payer])?;
        let milestone = account.milestone(milestone_id)?;
        gate_fundable(&account, milestone)?;

        let amount = milestone.amount;
        let fee = amount.percentage(self.config.fee_bps)?;
        let total = amount.checked_add(fee)?;

        info!(%account_id, %milestone_id, %amount, %fee, "charging payer for milestone");
        let receipt = self
            .processor
            .charge(total, instrument_ref, idempotency_key)
            .await
            .map_err(map_processor_error)?;

        let actor_id = actor.id.clone();
        let receipt_ref = receipt.processor_tx_id.clone();
        let committed = self
            .commit_with_retries(account_id, move |acct| {
                let m = acct.milestone_mut(milestone_id)?;
                gate_fundable_status(m)?;
                m.validate_transition(MilestoneStatus::Funded)?;
                m.status = MilestoneStatus::Funded;
                m.funded_at = Some(Utc::now());
                m.updated_at = Utc::now();
                let capacity_ok = acct.funded().compare(&acct.total_budget)? != std::cmp::Ordering::Greater;
                if !capacity_ok {
                    return Err(EscrowError::BudgetExceeded {
                        budget_minor: acct.total_budget.minor(),
                        requested_minor: acct.funded().minor(),
                    });
                }
                Ok(vec![
                    Transaction::new(
                        account_id,
                        Some(milestone_id),
                        TransactionKind::Fund,
                        amount,
                        actor_id.clone(),
                        Some(receipt_ref.clone()),
                    ),
                    Transaction::new(
                        account_id,
                        Some(milestone_id),
                        TransactionKind::Fee,
                        fee,
                        actor_id.clone(),
                        Some(receipt_ref.clone()),
                    ),
                ])
            })
            .await;

        let account = match committed {
            Ok(account) => account,
            Err(err) => return Err(self.compensate_charge(&receipt, idempotency_key, err).await),
        };

        let outcome = FundOutcome {
            account,
            fee,
            processor_ref: receipt.processor_tx_id,
        };
        self.record(idempotency_key, fingerprint, &outcome).await?;
        self.emit(EscrowEvent::new(
            EventKind::MilestoneFunded,
            account_id,
            Some(milestone_id),
            Some(amount),
        ))
        .await;

        Ok(outcome)
    }

    /// Release a funded milestone: pay out to the payee, commit
    /// `funded -> released`. The payee may never self-release.
    pub async fn release_milestone(
        &self,
        account_id: Uuid,
        milestone_id: Uuid,
        actor: &Actor,
        idempotency_key: &str,
    ) -> EscrowResult<PayoutOutcome> {
        let lock = self.key_lock(idempotency_key).await;
        let _serialized = lock.lock().await;

        let fingerprint = fingerprint("release_milestone", &(account_id, milestone_id, actor))?;
        if let Some(prior) = self.replayed(idempotency_key, &fingerprint).await? {
            return Ok(prior);
        }

        let account = self.store.get_account(account_id).await?;
        authorize(
            &account,
            actor,
            "release a milestone",
            &[Role::Payer, Role::Arbitrator],
        )?;
        let milestone = account.milestone(milestone_id)?;
        gate_funded(milestone)?;
        let amount = milestone.amount;

        info!(%account_id, %milestone_id, %amount, "paying out milestone to payee");
        let receipt = self
            .processor
            .payout(amount, &account.payee_id, idempotency_key)
            .await
            .map_err(map_processor_error)?;

        let actor_id = actor.id.clone();
        let receipt_ref = receipt.processor_tx_id.clone();
        let committed = self
            .commit_with_retries(account_id, move |acct| {
                let m = acct.milestone_mut(milestone_id)?;
                gate_funded(m)?;
                m.validate_transition(MilestoneStatus::Released)?;
                m.status = MilestoneStatus::Released;
                m.released_at = Some(Utc::now());
                m.updated_at = Utc::now();
                acct.refresh_status();
                Ok(vec![Transaction::new(
                    account_id,
                    Some(milestone_id),
                    TransactionKind::Release,
                    amount,
                    actor_id.clone(),
                    Some(receipt_ref.clone()),
                )])
            })
            .await;

        let account = match committed {
            Ok(account) => account,
            Err(err) => return Err(self.compensate_charge(&receipt, idempotency_key, err).await),
        };

        let completed = account.status == AccountStatus::Completed;
        let outcome = PayoutOutcome {
            account,
            processor_ref: receipt.processor_tx_id,
        };
        self.record(idempotency_key, fingerprint, &outcome).await?;
        self.emit(EscrowEvent::new(
            EventKind::MilestoneReleased,
            account_id,
            Some(milestone_id),
            Some(amount),
        ))
        .await;
        if completed {
            self.emit(EscrowEvent::new(EventKind::AccountCompleted, account_id, None, None))
                .await;
        }

        Ok(outcome)
    }

    /// Refund a funded milestone to the payer, before dispute or release.
    ///
    /// The refund targets the original charge, looked up from the fund
    /// transaction's processor reference in the log.
    pub async fn refund_milestone(
        &self,
        account_id: Uuid,
        milestone_id: Uuid,
        reason: &str,
        actor: &Actor,
        idempotency_key: &str,
    ) -> EscrowResult<PayoutOutcome> {
        let lock = self.key_lock(idempotency_key).await;
        let _serialized = lock.lock().await;

        let fingerprint =
            fingerprint("refund_milestone", &(account_id, milestone_id, reason, actor))?;
        if let Some(prior) = self.replayed(idempotency_key, &fingerprint).await? {
            return Ok(prior);
        }

        let account = self.store.get_account(account_id).await?;
        authorize(
            &account,
            actor,
            "refund a milestone",
            &[Role::Payer, Role::Arbitrator],
        )?;
        let milestone = account.milestone(milestone_id)?;
        gate_funded(milestone)?;
        let amount = milestone.amount;

        let charge_ref = self.charge_reference(account_id, milestone_id).await?;
        info!(%account_id, %milestone_id, %amount, reason, "refunding milestone to payer");
        let receipt = self
            .processor
            .refund(&charge_ref, amount, idempotency_key)
            .await
            .map_err(map_processor_error)?;

        let actor_id = actor.id.clone();
        let receipt_ref = receipt.processor_tx_id.clone();
        let committed = self
            .commit_with_retries(account_id, move |acct| {
                let m = acct.milestone_mut(milestone_id)?;
                gate_funded(m)?;
                m.validate_transition(MilestoneStatus::Refunded)?;
                m.status = MilestoneStatus::Refunded;
                m.updated_at = Utc::now();
                Ok(vec![Transaction::new(
                    account_id,
                    Some(milestone_id),
                    TransactionKind::Refund,
                    amount,
                    actor_id.clone(),
                    Some(receipt_ref.clone()),
                )])
            })
            .await;

        let account = match committed {
            Ok(account) => account,
            Err(err) => {
                warn!(%account_id, %milestone_id, error = %err, "refund committed at processor but not in ledger");
                return Err(EscrowError::PartialFailure {
                    reference: receipt.processor_tx_id,
                    compensation: "refund recorded at processor; ledger reconciliation required"
                        .to_string(),
                });
            }
        };

        let outcome = PayoutOutcome {
            account,
            processor_ref: receipt.processor_tx_id,
        };
        self.record(idempotency_key, fingerprint, &outcome).await?;
        self.emit(EscrowEvent::new(
            EventKind::MilestoneRefunded,
            account_id,
            Some(milestone_id),
            Some(amount),
        ))
        .await;

        Ok(outcome)
    }

    /// Freeze a funded milestone under a dispute; release and refund are
    /// blocked until resolution. No money moves and no transaction is
    /// appended: a dispute is a hold, not a transfer.
    pub async fn open_dispute(
        &self,
        account_id: Uuid,
        milestone_id: Uuid,
        reason: &str,
        actor: &Actor,
        idempotency_key: &str,
    ) -> EscrowResult<EscrowAccount> {
        let lock = self.key_lock(idempotency_key).await;
        let _serialized = lock.lock().await;

        let fingerprint = fingerprint("open_dispute", &(account_id, milestone_id, reason, actor))?;
        if let Some(prior) = self.replayed(idempotency_key, &fingerprint).await? {
            return Ok(prior);
        }

        let account = self.store.get_account(account_id).await?;
        authorize(
            &account,
            actor,
            "open a dispute",
            &[Role::Payer, Role::Payee],
        )?;
        gate_funded(account.milestone(milestone_id)?)?;

        info!(%account_id, %milestone_id, reason, "opening dispute");
        let account = self
            .commit_with_retries(account_id, move |acct| {
                let m = acct.milestone_mut(milestone_id)?;
                gate_funded(m)?;
                m.validate_transition(MilestoneStatus::Disputed)?;
                m.status = MilestoneStatus::Disputed;
                m.updated_at = Utc::now();
                Ok(vec![])
            })
            .await?;

        self.record(idempotency_key, fingerprint, &account).await?;
        self.emit(EscrowEvent::new(
            EventKind::DisputeOpened,
            account_id,
            Some(milestone_id),
            None,
        ))
        .await;

        Ok(account)
    }

    /// Resolve a dispute. The split outcome is the only path allowed to
    /// produce a partial result: it releases `x` to the payee and refunds
    /// `amount - x` to the payer as two transactions in one atomic commit,
    /// carving the milestone down to the released remainder so the derived
    /// balances still reconcile against the log.
    pub async fn resolve_dispute(
        &self,
        account_id: Uuid,
        milestone_id: Uuid,
        outcome: DisputeOutcome,
        actor: &Actor,
        idempotency_key: &str,
    ) -> EscrowResult<ResolveOutcome> {
        let lock = self.key_lock(idempotency_key).await;
        let _serialized = lock.lock().await;

        let fingerprint =
            fingerprint("resolve_dispute", &(account_id, milestone_id, outcome, actor))?;
        if let Some(prior) = self.replayed(idempotency_key, &fingerprint).await? {
            return Ok(prior);
        }

        let account = self.store.get_account(account_id).await?;
        authorize(&account, actor, "resolve a dispute", &[Role::Arbitrator])?;
        let milestone = account.milestone(milestone_id)?;
        if milestone.status.is_terminal() {
            return Err(EscrowError::AlreadyTerminal {
                milestone_id,
                status: format!("{:?}", milestone.status),
            });
        }
        if milestone.status != MilestoneStatus::Disputed {
            return Err(EscrowError::invalid_state(
                format!("{:?}", milestone.status),
                "resolved".to_string(),
                "only disputed milestones can be resolved".to_string(),
            ));
        }

        let amount = milestone.amount;
        let released = match outcome {
            DisputeOutcome::ReleaseAll => amount,
            DisputeOutcome::RefundAll => Money::zero(amount.currency()),
            DisputeOutcome::Split { release } => {
                if release.compare(&amount)? == std::cmp::Ordering::Greater {
                    return Err(EscrowError::invalid_amount(format!(
                        "split release {release} exceeds milestone amount {amount}"
                    )));
                }
                release
            }
        };
        let refunded = amount.checked_sub(released)?;

        info!(%account_id, %milestone_id, %released, %refunded, "resolving dispute");

        let payout_receipt = if released.is_positive() {
            let receipt = self
                .processor
                .payout(
                    released,
                    &account.payee_id,
                    &format!("{idempotency_key}/release"),
                )
                .await
                .map_err(map_processor_error)?;
            Some(receipt)
        } else {
            None
        };
        // Once the payout leg has confirmed, a refund-leg failure must still
        // hand the caller the payout reference for manual reconciliation.
        let refund_receipt = if refunded.is_positive() {
            let refunding = async {
                let charge_ref = self.charge_reference(account_id, milestone_id).await?;
                self.processor
                    .refund(&charge_ref, refunded, &format!("{idempotency_key}/refund"))
                    .await
                    .map_err(map_processor_error)
            };
            match refunding.await {
                Ok(receipt) => Some(receipt),
                Err(err) => return Err(partial_after_payout(&payout_receipt, err)),
            }
        } else {
            None
        };

        let actor_id = actor.id.clone();
        let payout_ref = payout_receipt.as_ref().map(|r| r.processor_tx_id.clone());
        let refund_ref = refund_receipt.as_ref().map(|r| r.processor_tx_id.clone());
        let committed = self
            .commit_with_retries(account_id, move |acct| {
                let m = acct.milestone_mut(milestone_id)?;
                if m.status != MilestoneStatus::Disputed {
                    return Err(EscrowError::invalid_state(
                        format!("{:?}", m.status),
                        "resolved".to_string(),
                        "milestone left the disputed state before commit".to_string(),
                    ));
                }
                let mut transactions = Vec::new();
                if released.is_positive() {
                    m.validate_transition(MilestoneStatus::Released)?;
                    m.status = MilestoneStatus::Released;
                    // Carve the milestone down to the released remainder so
                    // derived balances keep matching the transaction log.
                    m.amount = released;
                    m.released_at = Some(Utc::now());
                    transactions.push(Transaction::new(
                        account_id,
                        Some(milestone_id),
                        TransactionKind::Release,
                        released,
                        actor_id.clone(),
                        payout_ref.clone(),
                    ));
                } else {
                    m.validate_transition(MilestoneStatus::Refunded)?;
                    m.status = MilestoneStatus::Refunded;
                }
                if refunded.is_positive() {
                    transactions.push(Transaction::new(
                        account_id,
                        Some(milestone_id),
                        TransactionKind::Refund,
                        refunded,
                        actor_id.clone(),
                        refund_ref.clone(),
                    ));
                }
                m.resolved_at = Some(Utc::now());
                m.updated_at = Utc::now();
                acct.refresh_status();
                Ok(transactions)
            })
            .await;

        let account = match committed {
            Ok(account) => account,
            Err(err) => {
                let reference = payout_ref_or(&payout_receipt, &refund_receipt);
                warn!(%account_id, %milestone_id, error = %err, "dispute resolution committed at processor but not in ledger");
                return Err(EscrowError::PartialFailure {
                    reference,
                    compensation: "processor transfers confirmed; ledger reconciliation required"
                        .to_string(),
                });
            }
        };

        let completed = account.status == AccountStatus::Completed;
        let result = ResolveOutcome {
            account,
            released,
            refunded,
        };
        self.record(idempotency_key, fingerprint, &result).await?;
        self.emit(EscrowEvent::new(
            EventKind::DisputeResolved,
            account_id,
            Some(milestone_id),
            Some(amount),
        ))
        .await;
        if completed {
            self.emit(EscrowEvent::new(EventKind::AccountCompleted, account_id, None, None))
                .await;
        }

        Ok(result)
    }

    /// Increase the account budget; the single sanctioned budget mutation.
    pub async fn increase_budget(
        &self,
        account_id: Uuid,
        additional: Money,
        actor: &Actor,
        idempotency_key: &str,
    ) -> EscrowResult<EscrowAccount> {
        let lock = self.key_lock(idempotency_key).await;
        let _serialized = lock.lock().await;

        let fingerprint = fingerprint("increase_budget", &(account_id, additional, actor))?;
        if let Some(prior) = self.replayed(idempotency_key, &fingerprint).await? {
            return Ok(prior);
        }

        if !additional.is_positive() {
            return Err(EscrowError::invalid_amount(
                "budget increase must be greater than zero",
            ));
        }
        let account = self.store.get_account(account_id).await?;
        authorize(&account, actor, "increase the budget", &[Role::Payer])?;

        let account = self
            .commit_with_retries(account_id, move |acct| {
                acct.total_budget = acct.total_budget.checked_add(additional)?;
                Ok(vec![])
            })
            .await?;
        self.record(idempotency_key, fingerprint, &account).await?;
        Ok(account)
    }

    /// Remove a pending milestone. A pending milestone holds no funds, so
    /// removal carries no invariant risk.
    pub async fn remove_pending_milestone(
        &self,
        account_id: Uuid,
        milestone_id: Uuid,
        actor: &Actor,
        idempotency_key: &str,
    ) -> EscrowResult<EscrowAccount> {
        let lock = self.key_lock(idempotency_key).await;
        let _serialized = lock.lock().await;

        let fingerprint =
            fingerprint("remove_pending_milestone", &(account_id, milestone_id, actor))?;
        if let Some(prior) = self.replayed(idempotency_key, &fingerprint).await? {
            return Ok(prior);
        }

        let account = self.store.get_account(account_id).await?;
        authorize(&account, actor, "remove a milestone", &[Role::Payer])?;

        let account = self
            .commit_with_retries(account_id, move |acct| {
                let m = acct.milestone(milestone_id)?;
                if m.status != MilestoneStatus::Pending {
                    return Err(EscrowError::invalid_state(
                        format!("{:?}", m.status),
                        "removed".to_string(),
                        "only pending milestones can be removed".to_string(),
                    ));
                }
                acct.milestones.retain(|m| m.id != milestone_id);
                Ok(vec![])
            })
            .await?;
        self.record(idempotency_key, fingerprint, &account).await?;
        Ok(account)
    }

    /// Cancel an account. Funded or disputed milestones must be refunded or
    /// resolved first.
    pub async fn cancel_account(
        &self,
        account_id: Uuid,
        actor: &Actor,
        idempotency_key: &str,
    ) -> EscrowResult<EscrowAccount> {
        let lock = self.key_lock(idempotency_key).await;
        let _serialized = lock.lock().await;

        let fingerprint = fingerprint("cancel_account", &(account_id, actor))?;
        if let Some(prior) = self.replayed(idempotency_key, &fingerprint).await? {
            return Ok(prior);
        }

        let account = self.store.get_account(account_id).await?;
        authorize(&account, actor, "cancel the account", &[Role::Payer])?;

        let account = self
            .commit_with_retries(account_id, move |acct| {
                if acct.status != AccountStatus::Active {
                    return Err(EscrowError::invalid_state(
                        format!("{:?}", acct.status),
                        "cancelled".to_string(),
                        "only active accounts can be cancelled".to_string(),
                    ));
                }
                if acct.milestones.iter().any(|m| {
                    matches!(
                        m.status,
                        MilestoneStatus::Funded | MilestoneStatus::Disputed
                    )
                }) {
                    return Err(EscrowError::invalid_state(
                        "active".to_string(),
                        "cancelled".to_string(),
                        "funded or disputed milestones must be refunded or resolved first"
                            .to_string(),
                    ));
                }
                acct.status = AccountStatus::Cancelled;
                Ok(vec![])
            })
            .await?;

        self.record(idempotency_key, fingerprint, &account).await?;
        self.emit(EscrowEvent::new(EventKind::AccountCancelled, account_id, None, None))
            .await;
        Ok(account)
    }

    /// Current account snapshot
    pub async fn account(&self, account_id: Uuid) -> EscrowResult<EscrowAccount> {
        self.store.get_account(account_id).await
    }

    /// Derived balance fields, recomputed from current milestone states
    pub async fn account_summary(&self, account_id: Uuid) -> EscrowResult<AccountSummary> {
        Ok(self.store.get_account(account_id).await?.summary())
    }

    /// Audit query: the account's transactions in chronological order
    pub async fn transactions(&self, account_id: Uuid) -> EscrowResult<Vec<Transaction>> {
        self.store.get_account(account_id).await?;
        Ok(self.store.transactions_for_account(account_id).await)
    }

    /// Replay the transaction log and cross-check it against the summary
    pub async fn reconcile(&self, account_id: Uuid) -> EscrowResult<Reconciliation> {
        let summary = self.account_summary(account_id).await?;
        let replayed = self.store.replay(account_id).await?;
        let consistent =
            replayed.funded == summary.funded && replayed.released == summary.released;
        if !consistent {
            warn!(%account_id, "ledger does not reconcile against the transaction log");
        }
        Ok(Reconciliation {
            summary,
            replayed_funded: replayed.funded,
            replayed_released: replayed.released,
            consistent,
        })
    }

    /// Commit a mutation, retrying on optimistic-concurrency conflicts.
    async fn commit_with_retries<F>(&self, account_id: Uuid, f: F) -> EscrowResult<EscrowAccount>
    where
        F: Fn(&mut EscrowAccount) -> EscrowResult<Vec<Transaction>>,
    {
        let mut attempts = 0;
        loop {
            match self.store.with_account(account_id, &f).await {
                Err(EscrowError::ConcurrentModification { .. })
                    if attempts < self.config.max_commit_retries =>
                {
                    attempts += 1;
                    warn!(%account_id, attempts, "commit conflict, retrying");
                }
                other => return other,
            }
        }
    }

    /// Compensate a confirmed charge/payout whose ledger commit failed.
    ///
    /// `ConcurrentModification` passes through untouched: the caller retries
    /// the whole operation with the same idempotency key and the processor
    /// replays the original receipt instead of charging again.
    async fn compensate_charge(
        &self,
        receipt: &ProcessorReceipt,
        idempotency_key: &str,
        err: EscrowError,
    ) -> EscrowError {
        if matches!(err, EscrowError::ConcurrentModification { .. }) {
            return err;
        }
        warn!(
            reference = %receipt.processor_tx_id,
            error = %err,
            "ledger commit failed after confirmed processor transfer; issuing compensating refund"
        );
        let compensation = match self
            .processor
            .refund(
                &receipt.processor_tx_id,
                receipt.amount,
                &format!("{idempotency_key}/comp"),
            )
            .await
        {
            Ok(refund) => format!(
                "compensating refund {} issued for {}",
                refund.processor_tx_id, receipt.amount
            ),
            Err(refund_err) => {
                warn!(error = %refund_err, "compensating refund failed; manual reconciliation required");
                format!(
                    "compensating refund failed ({refund_err}); manual reconciliation required"
                )
            }
        };
        EscrowError::PartialFailure {
            reference: receipt.processor_tx_id.clone(),
            compensation,
        }
    }

    /// Processor reference of the original charge for a milestone
    async fn charge_reference(&self, account_id: Uuid, milestone_id: Uuid) -> EscrowResult<String> {
        self.store
            .transactions_for_account(account_id)
            .await
            .iter()
            .rev()
            .find(|t| t.kind == TransactionKind::Fund && t.milestone_id == Some(milestone_id))
            .and_then(|t| t.processor_ref.clone())
            .ok_or_else(|| {
                EscrowError::payment_failed(
                    None,
                    format!("no charge reference on record for milestone {milestone_id}"),
                )
            })
    }

    /// Exclusive lock for one idempotency key.
    ///
    /// Concurrent calls carrying the same key serialize here, so a retry
    /// racing its original waits and then observes the recorded result
    /// instead of re-running the operation (and compensating a charge that
    /// is backing held funds). Unheld locks are pruned on the way in.
    async fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.write().await;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn replay_ttl(&self) -> Duration {
        Duration::from_secs(self.config.replay_ttl_secs)
    }

    async fn replayed<T: DeserializeOwned>(
        &self,
        key: &str,
        fingerprint: &str,
    ) -> EscrowResult<Option<T>> {
        let cache = self.replay_cache.read().await;
        match cache.get(key) {
            None => Ok(None),
            Some(completed) if completed.recorded_at.elapsed() > self.replay_ttl() => Ok(None),
            Some(completed) if completed.fingerprint == fingerprint => {
                info!(key, "idempotent replay, returning recorded result");
                Ok(Some(serde_json::from_value(completed.result.clone())?))
            }
            Some(_) => Err(EscrowError::IdempotencyMismatch {
                key: key.to_string(),
            }),
        }
    }

    async fn record<T: Serialize>(
        &self,
        key: &str,
        fingerprint: String,
        result: &T,
    ) -> EscrowResult<()> {
        let value = serde_json::to_value(result)?;
        let ttl = self.replay_ttl();
        let mut cache = self.replay_cache.write().await;
        cache.retain(|_, completed| completed.recorded_at.elapsed() <= ttl);
        cache.insert(
            key.to_string(),
            CompletedOperation {
                fingerprint,
                result: value,
                recorded_at: Instant::now(),
            },
        );
        Ok(())
    }

    async fn emit(&self, event: EscrowEvent) {
        if let Err(err) = self.notifier.notify(event).await {
            warn!(error = %err, "notification delivery failed");
        }
    }
}

/// Deterministic request fingerprint for idempotency-mismatch detection
fn fingerprint<T: Serialize>(operation: &str, params: &T) -> EscrowResult<String> {
    Ok(format!(
        "{operation}:{}",
        serde_json::to_string(params)?
    ))
}

fn authorize(
    account: &EscrowAccount,
    actor: &Actor,
    action: &str,
    allowed: &[Role],
) -> EscrowResult<()> {
    let identity_matches = match actor.role {
        Role::Payer => actor.id == account.payer_id,
        Role::Payee => actor.id == account.payee_id,
        Role::Arbitrator => true,
    };
    if allowed.contains(&actor.role) && identity_matches {
        Ok(())
    } else {
        Err(EscrowError::unauthorized(
            actor.id.clone(),
            action.to_string(),
        ))
    }
}

/// Gate for operations that require a funded, undisputed milestone
fn gate_funded(milestone: &Milestone) -> EscrowResult<()> {
    match milestone.status {
        MilestoneStatus::Funded => Ok(()),
        MilestoneStatus::Disputed => Err(EscrowError::Disputed {
            milestone_id: milestone.id,
        }),
        status if status.is_terminal() => Err(EscrowError::AlreadyTerminal {
            milestone_id: milestone.id,
            status: format!("{status:?}"),
        }),
        status => Err(EscrowError::invalid_state(
            format!("{status:?}"),
            "funded-required".to_string(),
            "milestone is not funded".to_string(),
        )),
    }
}

/// Gate for funding: milestone pending, capacity available
fn gate_fundable(account: &EscrowAccount, milestone: &Milestone) -> EscrowResult<()> {
    gate_fundable_status(milestone)?;
    let would_fund = account.funded().checked_add(milestone.amount)?;
    if would_fund.compare(&account.total_budget)? == std::cmp::Ordering::Greater {
        return Err(EscrowError::BudgetExceeded {
            budget_minor: account.total_budget.minor(),
            requested_minor: would_fund.minor(),
        });
    }
    Ok(())
}

fn gate_fundable_status(milestone: &Milestone) -> EscrowResult<()> {
    match milestone.status {
        MilestoneStatus::Pending => Ok(()),
        MilestoneStatus::Disputed => Err(EscrowError::Disputed {
            milestone_id: milestone.id,
        }),
        status if status.is_terminal() => Err(EscrowError::AlreadyTerminal {
            milestone_id: milestone.id,
            status: format!("{status:?}"),
        }),
        status => Err(EscrowError::invalid_state(
            format!("{status:?}"),
            "Funded".to_string(),
            "milestone is not pending".to_string(),
        )),
    }
}

fn map_processor_error(err: ProcessorError) -> EscrowError {
    match err {
        ProcessorError::Declined(reason) => EscrowError::PaymentFailed {
            reference: None,
            reason,
        },
        ProcessorError::Timeout => EscrowError::PaymentTimeout { reference: None },
        ProcessorError::Unavailable(reason) => EscrowError::PaymentFailed {
            reference: None,
            reason,
        },
    }
}

/// Surface a refund-leg failure that follows a confirmed payout as a partial
/// failure carrying the payout reference. With no payout leg nothing has
/// moved yet, so the original error passes through.
fn partial_after_payout(payout: &Option<ProcessorReceipt>, err: EscrowError) -> EscrowError {
    match payout {
        Some(receipt) => EscrowError::PartialFailure {
            reference: receipt.processor_tx_id.clone(),
            compensation: format!(
                "payout confirmed but the refund leg failed ({err}); retry with the same idempotency key"
            ),
        },
        None => err,
    }
}

fn payout_ref_or(
    payout: &Option<ProcessorReceipt>,
    refund: &Option<ProcessorReceipt>,
) -> String {
    payout
        .as_ref()
        .or(refund.as_ref())
        .map(|r| r.processor_tx_id.clone())
        .unwrap_or_default()
}
