//! Core data models for the escrow ledger
//!
//! This module contains the account aggregate, the milestone state machine,
//! and the append-only transaction record, plus the actor/role types the
//! service uses for authorization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::EscrowResult;
use crate::error::EscrowError;
use crate::money::Money;

/// Milestone state machine enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    /// Created but not yet funded
    Pending,
    /// Payer's money is held in custody
    Funded,
    /// Paid out to the payee (terminal)
    Released,
    /// Frozen under an open dispute
    Disputed,
    /// Returned to the payer (terminal)
    Refunded,
}

impl MilestoneStatus {
    /// Check if this is a terminal state (no further transitions possible)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Released | Self::Refunded)
    }

    /// Check if this state allows funding
    pub fn can_fund(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Check if this state allows release
    pub fn can_release(&self) -> bool {
        matches!(self, Self::Funded)
    }

    /// Check if this state allows a refund
    pub fn can_refund(&self) -> bool {
        matches!(self, Self::Funded)
    }

    /// Check if this state allows opening a dispute
    pub fn can_dispute(&self) -> bool {
        matches!(self, Self::Funded)
    }
}

/// Account lifecycle enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Completed,
    Cancelled,
}

/// Transaction type enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Fund,
    Release,
    Refund,
    Fee,
}

/// Role flag supplied by the identity collaborator; the ledger trusts it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Payer,
    Payee,
    Arbitrator,
}

/// Pre-authorized caller identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    pub fn new<S: Into<String>>(id: S, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }
}

/// Dispute resolution outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum DisputeOutcome {
    /// Pay the full amount to the payee
    ReleaseAll,
    /// Return the full amount to the payer
    RefundAll,
    /// Release part to the payee, refund the remainder to the payer
    Split { release: Money },
}

/// Milestone specification supplied at account creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MilestoneSpec {
    pub title: String,
    pub amount: Money,
    pub due_date: Option<DateTime<Utc>>,
}

/// A discrete, separately payable unit of project work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Milestone {
    pub id: Uuid,
    pub account_id: Uuid,
    pub title: String,
    /// Fixed at creation; only the split dispute resolution may carve it down
    pub amount: Money,
    pub due_date: Option<DateTime<Utc>>,
    pub status: MilestoneStatus,

    // Set once, never overwritten
    pub funded_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Milestone {
    /// Create a new pending milestone for an account
    pub fn new(account_id: Uuid, spec: MilestoneSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id,
            title: spec.title,
            amount: spec.amount,
            due_date: spec.due_date,
            status: MilestoneStatus::Pending,
            funded_at: None,
            released_at: None,
            resolved_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    /// Validate a state transition against the state machine
    pub fn validate_transition(&self, to: MilestoneStatus) -> EscrowResult<()> {
        let valid = matches!(
            (self.status, to),
            (MilestoneStatus::Pending, MilestoneStatus::Funded)
                | (MilestoneStatus::Funded, MilestoneStatus::Released)
                | (MilestoneStatus::Funded, MilestoneStatus::Disputed)
                | (MilestoneStatus::Funded, MilestoneStatus::Refunded)
                | (MilestoneStatus::Disputed, MilestoneStatus::Released)
                | (MilestoneStatus::Disputed, MilestoneStatus::Refunded)
        );

        if valid {
            Ok(())
        } else {
            Err(EscrowError::invalid_state(
                format!("{:?}", self.status),
                format!("{to:?}"),
                "transition not permitted by the milestone state machine".to_string(),
            ))
        }
    }

    /// Money held or already paid out for this milestone
    pub fn holds_funds(&self) -> bool {
        matches!(
            self.status,
            MilestoneStatus::Funded | MilestoneStatus::Released | MilestoneStatus::Disputed
        )
    }
}

/// Account summary with the derived balance fields, recomputed on every read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSummary {
    pub account_id: Uuid,
    pub total_budget: Money,
    pub funded: Money,
    pub released: Money,
    pub balance: Money,
}

/// The custody boundary holding all milestones for one project
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowAccount {
    pub id: Uuid,
    pub project_id: String,
    pub payer_id: String,
    pub payee_id: String,
    /// Only increases, via the explicit increase-budget operation
    pub total_budget: Money,
    pub status: AccountStatus,
    /// Order is the payout sequence, not necessarily completion order
    pub milestones: Vec<Milestone>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EscrowAccount {
    /// Create a new account with its milestones, validating amounts, currency,
    /// and the budget invariant.
    pub fn new(
        project_id: String,
        payer_id: String,
        payee_id: String,
        total_budget: Money,
        specs: Vec<MilestoneSpec>,
    ) -> EscrowResult<Self> {
        if !total_budget.is_positive() {
            return Err(EscrowError::invalid_amount(
                "total budget must be greater than zero",
            ));
        }

        let id = Uuid::new_v4();
        let mut committed = Money::zero(total_budget.currency());
        let mut milestones = Vec::with_capacity(specs.len());

        for spec in specs {
            if !spec.amount.is_positive() {
                return Err(EscrowError::invalid_amount(format!(
                    "milestone {:?} amount must be greater than zero",
                    spec.title
                )));
            }
            committed = committed.checked_add(spec.amount)?;
            milestones.push(Milestone::new(id, spec));
        }

        if committed.compare(&total_budget)? == std::cmp::Ordering::Greater {
            return Err(EscrowError::BudgetExceeded {
                budget_minor: total_budget.minor(),
                requested_minor: committed.minor(),
            });
        }

        Ok(Self {
            id,
            project_id,
            payer_id,
            payee_id,
            total_budget,
            status: AccountStatus::Active,
            milestones,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
    }

    /// Look up a milestone by id
    pub fn milestone(&self, milestone_id: Uuid) -> EscrowResult<&Milestone> {
        self.milestones
            .iter()
            .find(|m| m.id == milestone_id)
            .ok_or_else(|| EscrowError::not_found("milestone", milestone_id.to_string()))
    }

    /// Mutable milestone lookup
    pub fn milestone_mut(&mut self, milestone_id: Uuid) -> EscrowResult<&mut Milestone> {
        self.milestones
            .iter_mut()
            .find(|m| m.id == milestone_id)
            .ok_or_else(|| EscrowError::not_found("milestone", milestone_id.to_string()))
    }

    /// Sum of milestone amounts currently held or already paid out.
    ///
    /// Derived from milestone statuses; the per-account budget invariant keeps
    /// the raw sum within range.
    pub fn funded(&self) -> Money {
        self.sum_where(Milestone::holds_funds)
    }

    /// Sum of released milestone amounts
    pub fn released(&self) -> Money {
        self.sum_where(|m| m.status == MilestoneStatus::Released)
    }

    /// Money still in custody: funded minus released
    pub fn balance(&self) -> Money {
        let funded = self.funded();
        // released <= funded by construction
        Money::new(funded.minor() - self.released().minor(), funded.currency())
            .unwrap_or_else(|_| Money::zero(self.total_budget.currency()))
    }

    /// Budget not yet committed to funded milestones
    pub fn unfunded_capacity(&self) -> Money {
        let funded = self.funded();
        Money::new(
            self.total_budget.minor() - funded.minor(),
            self.total_budget.currency(),
        )
        .unwrap_or_else(|_| Money::zero(self.total_budget.currency()))
    }

    fn sum_where<F: Fn(&Milestone) -> bool>(&self, predicate: F) -> Money {
        let minor = self
            .milestones
            .iter()
            .filter(|m| predicate(m))
            .map(|m| m.amount.minor())
            .sum();
        Money::new(minor, self.total_budget.currency())
            .unwrap_or_else(|_| Money::zero(self.total_budget.currency()))
    }

    /// Recomputed balance fields; never cached beyond the transaction boundary
    pub fn summary(&self) -> AccountSummary {
        AccountSummary {
            account_id: self.id,
            total_budget: self.total_budget,
            funded: self.funded(),
            released: self.released(),
            balance: self.balance(),
        }
    }

    /// Mark the account completed once every milestone has been released
    pub fn refresh_status(&mut self) {
        if self.status == AccountStatus::Active
            && !self.milestones.is_empty()
            && self
                .milestones
                .iter()
                .all(|m| m.status == MilestoneStatus::Released)
        {
            self.status = AccountStatus::Completed;
        }
    }

    /// Check that every milestone is terminal (account may then be deleted)
    pub fn all_milestones_terminal(&self) -> bool {
        self.milestones.iter().all(|m| m.status.is_terminal())
    }
}

/// Append-only record of a single monetary event; never mutated or deleted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub account_id: Uuid,
    /// None for account-level events
    pub milestone_id: Option<Uuid>,
    pub kind: TransactionKind,
    pub amount: Money,
    pub created_at: DateTime<Utc>,
    pub actor_id: String,
    /// External processor reference for reconciliation
    pub processor_ref: Option<String>,
}

impl Transaction {
    pub fn new(
        account_id: Uuid,
        milestone_id: Option<Uuid>,
        kind: TransactionKind,
        amount: Money,
        actor_id: String,
        processor_ref: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id,
            milestone_id,
            kind,
            amount,
            created_at: Utc::now(),
            actor_id,
            processor_ref,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Currency;

    fn usd(minor: i64) -> Money {
        Money::new(minor, Currency::Usd).unwrap()
    }

    fn spec(title: &str, minor: i64) -> MilestoneSpec {
        MilestoneSpec {
            title: title.to_string(),
            amount: usd(minor),
            due_date: None,
        }
    }

    fn account() -> EscrowAccount {
        EscrowAccount::new(
            "project-1".to_string(),
            "payer-1".to_string(),
            "payee-1".to_string(),
            usd(500_000),
            vec![
                spec("design", 50_000),
                spec("build", 150_000),
                spec("integrate", 175_000),
                spec("launch", 125_000),
            ],
        )
        .unwrap()
    }

    #[test]
    fn budget_invariant_enforced_at_creation() {
        let result = EscrowAccount::new(
            "project-1".to_string(),
            "payer-1".to_string(),
            "payee-1".to_string(),
            usd(500_000),
            vec![spec("a", 400_000), spec("b", 250_000)],
        );
        assert!(matches!(result, Err(EscrowError::BudgetExceeded { .. })));
    }

    #[test]
    fn zero_amount_milestone_rejected() {
        let result = EscrowAccount::new(
            "project-1".to_string(),
            "payer-1".to_string(),
            "payee-1".to_string(),
            usd(500_000),
            vec![spec("a", 0)],
        );
        assert!(matches!(result, Err(EscrowError::InvalidAmount(_))));
    }

    #[test]
    fn derived_fields_track_statuses() {
        let mut account = account();
        assert_eq!(account.funded(), usd(0));

        account.milestones[0].status = MilestoneStatus::Funded;
        assert_eq!(account.funded(), usd(50_000));
        assert_eq!(account.balance(), usd(50_000));

        account.milestones[0].status = MilestoneStatus::Released;
        assert_eq!(account.funded(), usd(50_000));
        assert_eq!(account.released(), usd(50_000));
        assert_eq!(account.balance(), usd(0));
        assert_eq!(account.unfunded_capacity(), usd(450_000));
    }

    #[test]
    fn transition_table() {
        let mut milestone = Milestone::new(Uuid::new_v4(), spec("m", 100));
        assert!(milestone.validate_transition(MilestoneStatus::Funded).is_ok());
        assert!(milestone.validate_transition(MilestoneStatus::Released).is_err());

        milestone.status = MilestoneStatus::Funded;
        assert!(milestone.validate_transition(MilestoneStatus::Released).is_ok());
        assert!(milestone.validate_transition(MilestoneStatus::Disputed).is_ok());
        assert!(milestone.validate_transition(MilestoneStatus::Refunded).is_ok());
        assert!(milestone.validate_transition(MilestoneStatus::Pending).is_err());

        milestone.status = MilestoneStatus::Released;
        assert!(milestone.status.is_terminal());
        assert!(milestone.validate_transition(MilestoneStatus::Refunded).is_err());
    }

    #[test]
    fn completion_requires_all_released() {
        let mut account = account();
        for m in &mut account.milestones {
            m.status = MilestoneStatus::Released;
        }
        account.refresh_status();
        assert_eq!(account.status, AccountStatus::Completed);
    }
}
