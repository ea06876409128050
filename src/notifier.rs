//! Notification collaborator
//!
//! After a transaction commits, the service emits a fire-and-forget event to
//! the notifier. Delivery failure is logged and never rolls back the ledger.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::money::Money;

/// Event kinds emitted after commits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    AccountCreated,
    AccountCancelled,
    AccountCompleted,
    MilestoneFunded,
    MilestoneReleased,
    MilestoneRefunded,
    DisputeOpened,
    DisputeResolved,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AccountCreated => "account.created",
            Self::AccountCancelled => "account.cancelled",
            Self::AccountCompleted => "account.completed",
            Self::MilestoneFunded => "milestone.funded",
            Self::MilestoneReleased => "milestone.released",
            Self::MilestoneRefunded => "milestone.refunded",
            Self::DisputeOpened => "dispute.opened",
            Self::DisputeResolved => "dispute.resolved",
        }
    }
}

/// Event payload handed to the notifier
#[derive(Debug, Clone, Serialize)]
pub struct EscrowEvent {
    pub kind: EventKind,
    pub account_id: Uuid,
    pub milestone_id: Option<Uuid>,
    pub amount: Option<Money>,
    pub occurred_at: DateTime<Utc>,
}

impl EscrowEvent {
    pub fn new(kind: EventKind, account_id: Uuid, milestone_id: Option<Uuid>, amount: Option<Money>) -> Self {
        Self {
            kind,
            account_id,
            milestone_id,
            amount,
            occurred_at: Utc::now(),
        }
    }
}

#[derive(Error, Debug)]
#[error("notification failed: {0}")]
pub struct NotifyError(pub String);

/// Fire-and-forget notification sink
#[async_trait]
pub trait EscrowNotifier: Send + Sync {
    async fn notify(&self, event: EscrowEvent) -> Result<(), NotifyError>;
}

/// Notifier that emits events to the tracing log
pub struct TracingNotifier;

#[async_trait]
impl EscrowNotifier for TracingNotifier {
    async fn notify(&self, event: EscrowEvent) -> Result<(), NotifyError> {
        info!(
            event = event.kind.name(),
            account_id = %event.account_id,
            milestone_id = ?event.milestone_id,
            amount = ?event.amount.map(|a| a.to_string()),
            "escrow event"
        );
        Ok(())
    }
}

/// Notifier that drops every event
pub struct NullNotifier;

#[async_trait]
impl EscrowNotifier for NullNotifier {
    async fn notify(&self, _event: EscrowEvent) -> Result<(), NotifyError> {
        Ok(())
    }
}
