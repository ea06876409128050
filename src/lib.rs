//! Milestone escrow ledger
//!
//! This crate holds project funds in custody between a payer and a payee and
//! releases them only against discrete milestones. It implements:
//! - A fixed-point [`money::Money`] type (integer minor units, no floats)
//! - The milestone state machine (pending → funded → released | refunded | disputed)
//! - A [`store::LedgerStore`] with per-account atomic mutation
//! - An append-only transaction log that makes every balance reconstructable
//! - The [`service::EscrowService`] public operations with idempotent replay
//!
//! The external payment processor and the notification sink are trait seams;
//! see [`processor`] and [`notifier`].

pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod money;
pub mod notifier;
pub mod processor;
pub mod service;
pub mod store;

use error::EscrowError;

/// Result type alias for escrow operations
pub type EscrowResult<T> = Result<T, EscrowError>;

pub use config::{ProcessorConfig, ServiceConfig};
pub use models::{
    AccountStatus, AccountSummary, Actor, DisputeOutcome, EscrowAccount, Milestone,
    MilestoneSpec, MilestoneStatus, Role, Transaction, TransactionKind,
};
pub use money::{Currency, Money};
pub use service::EscrowService;
pub use store::LedgerStore;
