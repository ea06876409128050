//! Error types for the escrow ledger
//!
//! The taxonomy splits into validation errors (rejected synchronously, no
//! side effects), state errors, concurrency errors (caller retries), and
//! external-processor errors (carry a processor reference for manual
//! reconciliation).

use thiserror::Error;
use uuid::Uuid;

use crate::money::Currency;

/// Main error type for escrow operations
#[derive(Error, Debug)]
pub enum EscrowError {
    /// A supplied amount is zero, negative, or otherwise unusable
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// Subtraction would take a balance below zero
    #[error("amount underflow: cannot take {take} minor units from {have}")]
    NegativeAmount { have: i64, take: i64 },

    /// Arithmetic exceeded the representable range
    #[error("amount overflow in money arithmetic")]
    AmountOverflow,

    /// Two amounts in one operation carry different currencies
    #[error("currency mismatch: {left} vs {right}")]
    CurrencyMismatch { left: Currency, right: Currency },

    /// Milestone amounts exceed the account budget
    #[error("budget exceeded: milestones total {requested_minor} minor units, budget {budget_minor}")]
    BudgetExceeded {
        budget_minor: i64,
        requested_minor: i64,
    },

    /// Requested transition is not permitted by the state machine
    #[error("invalid state transition: {from} -> {to}: {reason}")]
    InvalidState {
        from: String,
        to: String,
        reason: String,
    },

    /// Milestone is frozen under an open dispute
    #[error("milestone {milestone_id} is disputed; release and refund are blocked until resolution")]
    Disputed { milestone_id: Uuid },

    /// Milestone already reached a terminal state
    #[error("milestone {milestone_id} is already terminal ({status})")]
    AlreadyTerminal { milestone_id: Uuid, status: String },

    /// Actor is not permitted to perform the operation
    #[error("actor {actor} is not authorized to {action}")]
    Unauthorized { actor: String, action: String },

    /// An idempotency key was replayed with different arguments
    #[error("idempotency key {key} was already used with different arguments")]
    IdempotencyMismatch { key: String },

    /// Entity lookup failed
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// Optimistic re-check failed at commit time; the caller retries
    #[error("concurrent modification of account {account_id}")]
    ConcurrentModification { account_id: Uuid },

    /// The external processor rejected the charge/payout/refund
    #[error("payment failed: {reason} (processor ref: {reference:?})")]
    PaymentFailed {
        reference: Option<String>,
        reason: String,
    },

    /// The external processor call timed out; outcome unknown, poll before retrying
    #[error("payment timed out (processor ref: {reference:?})")]
    PaymentTimeout { reference: Option<String> },

    /// A processor transfer confirmed but the operation did not complete
    #[error("partial failure: processor transfer {reference} confirmed but the operation did not complete; {compensation}")]
    PartialFailure {
        reference: String,
        compensation: String,
    },

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EscrowError {
    /// Create an invalid-amount error
    pub fn invalid_amount<S: Into<String>>(msg: S) -> Self {
        Self::InvalidAmount(msg.into())
    }

    /// Create a state transition error
    pub fn invalid_state<S: Into<String>>(from: S, to: S, reason: S) -> Self {
        Self::InvalidState {
            from: from.into(),
            to: to.into(),
            reason: reason.into(),
        }
    }

    /// Create an unauthorized error
    pub fn unauthorized<S: Into<String>>(actor: S, action: S) -> Self {
        Self::Unauthorized {
            actor: actor.into(),
            action: action.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found<S: Into<String>>(entity: &'static str, id: S) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Create a payment-failed error
    pub fn payment_failed<S: Into<String>>(reference: Option<String>, reason: S) -> Self {
        Self::PaymentFailed {
            reference,
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Stable machine-readable code for API consumers
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidAmount(_) => "INVALID_AMOUNT",
            Self::NegativeAmount { .. } => "NEGATIVE_AMOUNT",
            Self::AmountOverflow => "AMOUNT_OVERFLOW",
            Self::CurrencyMismatch { .. } => "CURRENCY_MISMATCH",
            Self::BudgetExceeded { .. } => "BUDGET_EXCEEDED",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::Disputed { .. } => "DISPUTED",
            Self::AlreadyTerminal { .. } => "ALREADY_TERMINAL",
            Self::Unauthorized { .. } => "UNAUTHORIZED",
            Self::IdempotencyMismatch { .. } => "IDEMPOTENCY_MISMATCH",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::ConcurrentModification { .. } => "CONCURRENT_MODIFICATION",
            Self::PaymentFailed { .. } => "PAYMENT_FAILED",
            Self::PaymentTimeout { .. } => "PAYMENT_TIMEOUT",
            Self::PartialFailure { .. } => "PARTIAL_FAILURE",
            Self::Config(_) => "CONFIG",
            Self::Serialization(_) => "SERIALIZATION",
        }
    }

    /// Processor reference for manual reconciliation, when one exists
    pub fn processor_reference(&self) -> Option<&str> {
        match self {
            Self::PaymentFailed { reference, .. } | Self::PaymentTimeout { reference } => {
                reference.as_deref()
            }
            Self::PartialFailure { reference, .. } => Some(reference),
            _ => None,
        }
    }
}

impl From<config::ConfigError> for EscrowError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
