//! End-to-end tests for the escrow service: the funded/released/balance
//! arithmetic, idempotent replay, dispute freeze, and reconciliation against
//! the transaction log.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use escrow_ledger::error::EscrowError;
use escrow_ledger::models::{
    Actor, DisputeOutcome, MilestoneSpec, MilestoneStatus, Role, TransactionKind,
};
use escrow_ledger::money::{Currency, Money};
use escrow_ledger::notifier::NullNotifier;
use escrow_ledger::processor::{
    MockProcessor, PaymentProcessor, ProcessorError, ProcessorReceipt,
};
use escrow_ledger::service::{CreateAccountRequest, EscrowService};
use escrow_ledger::{LedgerStore, ServiceConfig};

fn usd(minor: i64) -> Money {
    Money::new(minor, Currency::Usd).unwrap()
}

fn payer() -> Actor {
    Actor::new("payer-1", Role::Payer)
}

fn payee() -> Actor {
    Actor::new("payee-1", Role::Payee)
}

fn arbitrator() -> Actor {
    Actor::new("arb-1", Role::Arbitrator)
}

fn spec(title: &str, minor: i64) -> MilestoneSpec {
    MilestoneSpec {
        title: title.to_string(),
        amount: usd(minor),
        due_date: None,
    }
}

fn request(budget: i64, amounts: &[i64]) -> CreateAccountRequest {
    CreateAccountRequest {
        project_id: "project-1".to_string(),
        payer_id: "payer-1".to_string(),
        payee_id: "payee-1".to_string(),
        total_budget: usd(budget),
        milestones: amounts
            .iter()
            .enumerate()
            .map(|(i, &amount)| spec(&format!("milestone-{}", i + 1), amount))
            .collect(),
    }
}

fn service() -> (Arc<EscrowService>, Arc<MockProcessor>) {
    let processor = Arc::new(MockProcessor::new());
    let service = Arc::new(EscrowService::new(
        ServiceConfig::default(),
        Arc::new(LedgerStore::new()),
        processor.clone(),
        Arc::new(NullNotifier),
    ));
    (service, processor)
}

/// Delays charges so two racing calls both pass their pre-checks before
/// either commit lands.
struct SlowChargeProcessor {
    inner: Arc<MockProcessor>,
    delay: Duration,
}

#[async_trait]
impl PaymentProcessor for SlowChargeProcessor {
    async fn charge(
        &self,
        amount: Money,
        instrument_ref: &str,
        idempotency_key: &str,
    ) -> Result<ProcessorReceipt, ProcessorError> {
        tokio::time::sleep(self.delay).await;
        self.inner.charge(amount, instrument_ref, idempotency_key).await
    }

    async fn payout(
        &self,
        amount: Money,
        payee_instrument_ref: &str,
        idempotency_key: &str,
    ) -> Result<ProcessorReceipt, ProcessorError> {
        self.inner.payout(amount, payee_instrument_ref, idempotency_key).await
    }

    async fn refund(
        &self,
        processor_tx_id: &str,
        amount: Money,
        idempotency_key: &str,
    ) -> Result<ProcessorReceipt, ProcessorError> {
        self.inner.refund(processor_tx_id, amount, idempotency_key).await
    }
}

fn slow_service() -> (Arc<EscrowService>, Arc<MockProcessor>) {
    let mock = Arc::new(MockProcessor::new());
    let service = Arc::new(EscrowService::new(
        ServiceConfig::default(),
        Arc::new(LedgerStore::new()),
        Arc::new(SlowChargeProcessor {
            inner: mock.clone(),
            delay: Duration::from_millis(20),
        }),
        Arc::new(NullNotifier),
    ));
    (service, mock)
}

#[tokio::test]
async fn example_scenario_from_the_ledger_spec() {
    let (service, _) = service();
    let account = service
        .create_account(request(5000, &[500, 1500, 1750, 1250]), &payer(), "create")
        .await
        .unwrap();
    let m1 = account.milestones[0].id;
    let m4 = account.milestones[3].id;

    service
        .fund_milestone(account.id, m1, "card-1", &payer(), "fund-1")
        .await
        .unwrap();
    let summary = service.account_summary(account.id).await.unwrap();
    assert_eq!(summary.funded, usd(500));
    assert_eq!(summary.balance, usd(500));

    service
        .release_milestone(account.id, m1, &payer(), "release-1")
        .await
        .unwrap();
    let summary = service.account_summary(account.id).await.unwrap();
    assert_eq!(summary.released, usd(500));
    assert_eq!(summary.balance, usd(0));

    let outcome = service
        .fund_milestone(account.id, m4, "card-1", &payer(), "fund-4")
        .await
        .unwrap();
    let summary = service.account_summary(account.id).await.unwrap();
    assert_eq!(summary.funded, usd(1750));

    // 1250 at 5% rounds half-up: 62.5 -> 63, so the payer was charged 1313.
    assert_eq!(outcome.fee, usd(63));
    let fee_total: i64 = service
        .transactions(account.id)
        .await
        .unwrap()
        .iter()
        .filter(|t| t.kind == TransactionKind::Fee && t.milestone_id == Some(m4))
        .map(|t| t.amount.minor())
        .sum();
    assert_eq!(fee_total, 63);
}

#[tokio::test]
async fn overcommitted_schedule_fails_at_creation() {
    let (service, _) = service();
    let result = service
        .create_account(
            request(5000, &[500, 1500, 1750, 1250, 2500]),
            &payer(),
            "create",
        )
        .await;
    assert!(matches!(result, Err(EscrowError::BudgetExceeded { .. })));
}

#[tokio::test]
async fn no_double_release() {
    let (service, _) = service();
    let account = service
        .create_account(request(5000, &[500]), &payer(), "create")
        .await
        .unwrap();
    let m1 = account.milestones[0].id;

    service
        .fund_milestone(account.id, m1, "card-1", &payer(), "fund-1")
        .await
        .unwrap();
    service
        .release_milestone(account.id, m1, &payer(), "release-1")
        .await
        .unwrap();

    let second = service
        .release_milestone(account.id, m1, &payer(), "release-again")
        .await;
    assert!(matches!(second, Err(EscrowError::AlreadyTerminal { .. })));

    let summary = service.account_summary(account.id).await.unwrap();
    assert_eq!(summary.released, usd(500));
    let releases = service
        .transactions(account.id)
        .await
        .unwrap()
        .iter()
        .filter(|t| t.kind == TransactionKind::Release)
        .count();
    assert_eq!(releases, 1);
}

#[tokio::test]
async fn idempotent_replay_of_funding() {
    let (service, processor) = service();
    let account = service
        .create_account(request(5000, &[1250]), &payer(), "create")
        .await
        .unwrap();
    let m1 = account.milestones[0].id;

    let first = service
        .fund_milestone(account.id, m1, "card-1", &payer(), "fund-key")
        .await
        .unwrap();
    let replay = service
        .fund_milestone(account.id, m1, "card-1", &payer(), "fund-key")
        .await
        .unwrap();

    assert_eq!(first.processor_ref, replay.processor_ref);
    assert_eq!(processor.receipt_count().await, 1);

    let log = service.transactions(account.id).await.unwrap();
    let funds = log.iter().filter(|t| t.kind == TransactionKind::Fund).count();
    let fees = log.iter().filter(|t| t.kind == TransactionKind::Fee).count();
    assert_eq!((funds, fees), (1, 1));
}

#[tokio::test]
async fn concurrent_retry_with_same_key_does_not_refund_held_funds() {
    let (service, processor) = slow_service();
    let account = service
        .create_account(request(5000, &[500]), &payer(), "create")
        .await
        .unwrap();
    let m1 = account.milestones[0].id;

    // A client retry racing its original: both calls carry the same key.
    let payer = payer();
    let (first, second) = tokio::join!(
        service.fund_milestone(account.id, m1, "card-1", &payer, "fund-key"),
        service.fund_milestone(account.id, m1, "card-1", &payer, "fund-key"),
    );
    let first = first.unwrap();
    let second = second.unwrap();
    assert_eq!(first.processor_ref, second.processor_ref);
    assert_eq!(processor.receipt_count().await, 1);
    // The charge is backing the held funds; it must not be refunded away
    assert!(processor.refunds().await.is_empty());

    let account = service.account(account.id).await.unwrap();
    assert_eq!(account.milestones[0].status, MilestoneStatus::Funded);
    let log = service.transactions(account.id).await.unwrap();
    let funds = log.iter().filter(|t| t.kind == TransactionKind::Fund).count();
    assert_eq!(funds, 1);
}

#[tokio::test]
async fn losing_fund_race_is_compensated_and_reported() {
    let (service, processor) = slow_service();
    let account = service
        .create_account(request(5000, &[500]), &payer(), "create")
        .await
        .unwrap();
    let m1 = account.milestones[0].id;

    // Distinct keys: both charges clear, only one commit can win.
    let payer = payer();
    let (a, b) = tokio::join!(
        service.fund_milestone(account.id, m1, "card-1", &payer, "fund-a"),
        service.fund_milestone(account.id, m1, "card-1", &payer, "fund-b"),
    );
    let loser = match (a, b) {
        (Ok(_), Err(err)) | (Err(err), Ok(_)) => err,
        other => panic!("expected exactly one winner, got {other:?}"),
    };
    assert!(matches!(loser, EscrowError::PartialFailure { .. }));
    assert!(loser.processor_reference().is_some());

    // The loser's full charge (500 + 25 fee) was refunded
    let refunds = processor.refunds().await;
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].amount, usd(525));

    let log = service.transactions(account.id).await.unwrap();
    let funds = log.iter().filter(|t| t.kind == TransactionKind::Fund).count();
    assert_eq!(funds, 1);
    let reconciliation = service.reconcile(account.id).await.unwrap();
    assert!(reconciliation.consistent);
}

#[tokio::test]
async fn expired_idempotency_keys_are_evicted() {
    let config = ServiceConfig {
        replay_ttl_secs: 0,
        ..ServiceConfig::default()
    };
    let service = Arc::new(EscrowService::new(
        config,
        Arc::new(LedgerStore::new()),
        Arc::new(MockProcessor::new()),
        Arc::new(NullNotifier),
    ));

    let first = service
        .create_account(request(5000, &[500]), &payer(), "create")
        .await
        .unwrap();
    let second = service
        .create_account(request(5000, &[500]), &payer(), "create")
        .await
        .unwrap();
    // The recorded result expired immediately, so nothing was replayed
    assert_ne!(first.id, second.id);
}

#[tokio::test]
async fn replayed_key_with_different_arguments_is_rejected() {
    let (service, _) = service();
    let account = service
        .create_account(request(5000, &[500, 1500]), &payer(), "create")
        .await
        .unwrap();
    let m1 = account.milestones[0].id;
    let m2 = account.milestones[1].id;

    service
        .fund_milestone(account.id, m1, "card-1", &payer(), "shared-key")
        .await
        .unwrap();
    let result = service
        .fund_milestone(account.id, m2, "card-1", &payer(), "shared-key")
        .await;
    assert!(matches!(result, Err(EscrowError::IdempotencyMismatch { .. })));
}

#[tokio::test]
async fn dispute_freezes_release_and_refund() {
    let (service, _) = service();
    let account = service
        .create_account(request(5000, &[1500]), &payer(), "create")
        .await
        .unwrap();
    let m1 = account.milestones[0].id;

    service
        .fund_milestone(account.id, m1, "card-1", &payer(), "fund-1")
        .await
        .unwrap();
    service
        .open_dispute(account.id, m1, "work not delivered", &payee(), "dispute-1")
        .await
        .unwrap();

    assert!(matches!(
        service
            .release_milestone(account.id, m1, &payer(), "release-1")
            .await,
        Err(EscrowError::Disputed { .. })
    ));
    assert!(matches!(
        service
            .refund_milestone(account.id, m1, "changed my mind", &payer(), "refund-1")
            .await,
        Err(EscrowError::Disputed { .. })
    ));
}

#[tokio::test]
async fn split_resolution_reconciles() {
    let (service, _) = service();
    let account = service
        .create_account(request(5000, &[1500]), &payer(), "create")
        .await
        .unwrap();
    let m1 = account.milestones[0].id;

    service
        .fund_milestone(account.id, m1, "card-1", &payer(), "fund-1")
        .await
        .unwrap();
    service
        .open_dispute(account.id, m1, "partial delivery", &payer(), "dispute-1")
        .await
        .unwrap();

    let result = service
        .resolve_dispute(
            account.id,
            m1,
            DisputeOutcome::Split {
                release: usd(1000),
            },
            &arbitrator(),
            "resolve-1",
        )
        .await
        .unwrap();

    assert_eq!(result.released, usd(1000));
    assert_eq!(result.refunded, usd(500));
    // released + refunded covers the original amount as two transactions
    let log = service.transactions(account.id).await.unwrap();
    let release_total: i64 = log
        .iter()
        .filter(|t| t.kind == TransactionKind::Release)
        .map(|t| t.amount.minor())
        .sum();
    let refund_total: i64 = log
        .iter()
        .filter(|t| t.kind == TransactionKind::Refund)
        .map(|t| t.amount.minor())
        .sum();
    assert_eq!(release_total + refund_total, 1500);

    let reconciliation = service.reconcile(account.id).await.unwrap();
    assert!(reconciliation.consistent);
    assert_eq!(reconciliation.summary.funded, usd(1000));
    assert_eq!(reconciliation.summary.released, usd(1000));
    assert_eq!(reconciliation.summary.balance, usd(0));
}

#[tokio::test]
async fn refund_leg_failure_reports_the_payout_reference() {
    let (service, processor) = service();
    let account = service
        .create_account(request(5000, &[1500]), &payer(), "create")
        .await
        .unwrap();
    let m1 = account.milestones[0].id;

    service
        .fund_milestone(account.id, m1, "card-1", &payer(), "fund-1")
        .await
        .unwrap();
    service
        .open_dispute(account.id, m1, "partial delivery", &payer(), "dispute-1")
        .await
        .unwrap();

    processor.decline_refunds().await;
    let err = service
        .resolve_dispute(
            account.id,
            m1,
            DisputeOutcome::Split {
                release: usd(1000),
            },
            &arbitrator(),
            "resolve-1",
        )
        .await
        .unwrap_err();

    // The payout went through, so the error must carry its reference
    assert!(matches!(err, EscrowError::PartialFailure { .. }));
    assert!(err.processor_reference().is_some());

    let account = service.account(account.id).await.unwrap();
    assert_eq!(account.milestones[0].status, MilestoneStatus::Disputed);
}

#[tokio::test]
async fn split_larger_than_amount_is_rejected() {
    let (service, _) = service();
    let account = service
        .create_account(request(5000, &[1500]), &payer(), "create")
        .await
        .unwrap();
    let m1 = account.milestones[0].id;

    service
        .fund_milestone(account.id, m1, "card-1", &payer(), "fund-1")
        .await
        .unwrap();
    service
        .open_dispute(account.id, m1, "disagreement", &payer(), "dispute-1")
        .await
        .unwrap();

    let result = service
        .resolve_dispute(
            account.id,
            m1,
            DisputeOutcome::Split {
                release: usd(2000),
            },
            &arbitrator(),
            "resolve-1",
        )
        .await;
    assert!(matches!(result, Err(EscrowError::InvalidAmount(_))));
}

#[tokio::test]
async fn declined_charge_leaves_no_trace() {
    let (service, processor) = service();
    let account = service
        .create_account(request(5000, &[500]), &payer(), "create")
        .await
        .unwrap();
    let m1 = account.milestones[0].id;

    processor.decline_next().await;
    let result = service
        .fund_milestone(account.id, m1, "card-1", &payer(), "fund-1")
        .await;
    assert!(matches!(result, Err(EscrowError::PaymentFailed { .. })));

    let account = service.account(account.id).await.unwrap();
    assert_eq!(account.milestones[0].status, MilestoneStatus::Pending);
    assert!(service.transactions(account.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn timeout_then_retry_with_same_key() {
    let (service, processor) = service();
    let account = service
        .create_account(request(5000, &[500]), &payer(), "create")
        .await
        .unwrap();
    let m1 = account.milestones[0].id;

    processor.timeout_next().await;
    let result = service
        .fund_milestone(account.id, m1, "card-1", &payer(), "fund-1")
        .await;
    assert!(matches!(result, Err(EscrowError::PaymentTimeout { .. })));

    // Retry with the same idempotency key once the outcome is known
    service
        .fund_milestone(account.id, m1, "card-1", &payer(), "fund-1")
        .await
        .unwrap();
    let log = service.transactions(account.id).await.unwrap();
    let funds = log.iter().filter(|t| t.kind == TransactionKind::Fund).count();
    assert_eq!(funds, 1);
}

#[tokio::test]
async fn payee_may_not_self_release() {
    let (service, _) = service();
    let account = service
        .create_account(request(5000, &[500]), &payer(), "create")
        .await
        .unwrap();
    let m1 = account.milestones[0].id;

    service
        .fund_milestone(account.id, m1, "card-1", &payer(), "fund-1")
        .await
        .unwrap();
    let result = service
        .release_milestone(account.id, m1, &payee(), "release-1")
        .await;
    assert!(matches!(result, Err(EscrowError::Unauthorized { .. })));
}

#[tokio::test]
async fn refund_frees_capacity_for_later_milestones() {
    let (service, _) = service();
    let account = service
        .create_account(request(3250, &[1500, 1750]), &payer(), "create")
        .await
        .unwrap();
    let m1 = account.milestones[0].id;
    let m2 = account.milestones[1].id;

    service
        .fund_milestone(account.id, m1, "card-1", &payer(), "fund-1")
        .await
        .unwrap();
    service
        .refund_milestone(account.id, m1, "descoped", &payer(), "refund-1")
        .await
        .unwrap();

    let summary = service.account_summary(account.id).await.unwrap();
    assert_eq!(summary.funded, usd(0));

    service
        .fund_milestone(account.id, m2, "card-1", &payer(), "fund-2")
        .await
        .unwrap();
    let reconciliation = service.reconcile(account.id).await.unwrap();
    assert!(reconciliation.consistent);
    assert_eq!(reconciliation.summary.funded, usd(1750));
}

#[tokio::test]
async fn cancel_blocked_while_funds_are_held() {
    let (service, _) = service();
    let account = service
        .create_account(request(5000, &[500]), &payer(), "create")
        .await
        .unwrap();
    let m1 = account.milestones[0].id;

    service
        .fund_milestone(account.id, m1, "card-1", &payer(), "fund-1")
        .await
        .unwrap();
    assert!(matches!(
        service.cancel_account(account.id, &payer(), "cancel-1").await,
        Err(EscrowError::InvalidState { .. })
    ));

    service
        .refund_milestone(account.id, m1, "project halted", &payer(), "refund-1")
        .await
        .unwrap();
    let cancelled = service
        .cancel_account(account.id, &payer(), "cancel-2")
        .await
        .unwrap();
    assert_eq!(
        cancelled.status,
        escrow_ledger::AccountStatus::Cancelled
    );
}

#[tokio::test]
async fn conservation_across_a_full_run() {
    let (service, _) = service();
    let account = service
        .create_account(request(5000, &[500, 1500, 1750, 1250]), &payer(), "create")
        .await
        .unwrap();
    let ids: Vec<_> = account.milestones.iter().map(|m| m.id).collect();

    for (i, &mid) in ids.iter().enumerate() {
        service
            .fund_milestone(account.id, mid, "card-1", &payer(), &format!("fund-{i}"))
            .await
            .unwrap();
    }
    service
        .release_milestone(account.id, ids[0], &payer(), "release-0")
        .await
        .unwrap();
    // Released out of payout order on purpose
    service
        .release_milestone(account.id, ids[3], &payer(), "release-3")
        .await
        .unwrap();
    service
        .refund_milestone(account.id, ids[1], "descoped", &payer(), "refund-1")
        .await
        .unwrap();

    let reconciliation = service.reconcile(account.id).await.unwrap();
    assert!(reconciliation.consistent);
    let summary = reconciliation.summary;
    assert!(summary.released.minor() <= summary.funded.minor());
    assert!(summary.funded.minor() <= summary.total_budget.minor());
    assert_eq!(summary.funded, usd(3500)); // 500 + 1750 + 1250 after the refund
    assert_eq!(summary.released, usd(1750));
    assert_eq!(summary.balance, usd(1750));
}
