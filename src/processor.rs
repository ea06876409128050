//! Payment processor collaborator
//!
//! The ledger never touches payment instruments itself; charges, payouts, and
//! refunds go through an opaque external processor behind the
//! [`PaymentProcessor`] trait. Every call is idempotency-key driven so the
//! service can safely retry after timeouts.
//!
//! [`HttpProcessor`] talks JSON to a processor API; [`MockProcessor`] is a
//! deterministic in-memory implementation with scriptable failures, used by
//! the tests and the demo binary.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::EscrowResult;
use crate::config::ProcessorConfig;
use crate::error::EscrowError;
use crate::money::Money;

/// Errors surfaced by the external processor
#[derive(Error, Debug)]
pub enum ProcessorError {
    /// The payer's instrument declined the charge
    #[error("declined: {0}")]
    Declined(String),

    /// The call timed out; the outcome is unknown
    #[error("processor timed out")]
    Timeout,

    /// Transport or processor-side failure
    #[error("processor unavailable: {0}")]
    Unavailable(String),
}

/// Receipt for a confirmed charge, payout, or refund
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorReceipt {
    /// Processor-side transaction id, usable for reconciliation and refunds
    pub processor_tx_id: String,
    pub amount: Money,
}

/// Opaque external payment processor
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// Charge the payer's instrument
    async fn charge(
        &self,
        amount: Money,
        instrument_ref: &str,
        idempotency_key: &str,
    ) -> Result<ProcessorReceipt, ProcessorError>;

    /// Pay out to the payee's instrument
    async fn payout(
        &self,
        amount: Money,
        payee_instrument_ref: &str,
        idempotency_key: &str,
    ) -> Result<ProcessorReceipt, ProcessorError>;

    /// Refund a prior charge, fully or partially
    async fn refund(
        &self,
        processor_tx_id: &str,
        amount: Money,
        idempotency_key: &str,
    ) -> Result<ProcessorReceipt, ProcessorError>;
}

#[derive(Debug, Serialize)]
struct ChargeRequest<'a> {
    amount_minor: i64,
    currency: &'a str,
    instrument_ref: &'a str,
    idempotency_key: &'a str,
}

#[derive(Debug, Serialize)]
struct PayoutRequest<'a> {
    amount_minor: i64,
    currency: &'a str,
    payee_instrument_ref: &'a str,
    idempotency_key: &'a str,
}

#[derive(Debug, Serialize)]
struct RefundRequest<'a> {
    processor_tx_id: &'a str,
    amount_minor: i64,
    currency: &'a str,
    idempotency_key: &'a str,
}

#[derive(Debug, Deserialize)]
struct ProcessorApiResponse {
    transaction_id: String,
}

/// JSON client for a processor HTTP API
pub struct HttpProcessor {
    client: reqwest::Client,
    base_url: String,
}

impl HttpProcessor {
    pub fn new(config: &ProcessorConfig) -> EscrowResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|err| EscrowError::config(format!("processor client: {err}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post<T: Serialize>(
        &self,
        endpoint: &str,
        request: &T,
        amount: Money,
    ) -> Result<ProcessorReceipt, ProcessorError> {
        let url = format!("{}{}", self.base_url, endpoint);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    ProcessorError::Timeout
                } else {
                    ProcessorError::Unavailable(err.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            let body: ProcessorApiResponse = response
                .json()
                .await
                .map_err(|err| ProcessorError::Unavailable(err.to_string()))?;
            Ok(ProcessorReceipt {
                processor_tx_id: body.transaction_id,
                amount,
            })
        } else if status == reqwest::StatusCode::PAYMENT_REQUIRED {
            let reason = response.text().await.unwrap_or_default();
            Err(ProcessorError::Declined(reason))
        } else {
            Err(ProcessorError::Unavailable(format!(
                "unexpected status {status} from {endpoint}"
            )))
        }
    }
}

#[async_trait]
impl PaymentProcessor for HttpProcessor {
    async fn charge(
        &self,
        amount: Money,
        instrument_ref: &str,
        idempotency_key: &str,
    ) -> Result<ProcessorReceipt, ProcessorError> {
        let request = ChargeRequest {
            amount_minor: amount.minor(),
            currency: amount.currency().as_str(),
            instrument_ref,
            idempotency_key,
        };
        self.post("/v1/charges", &request, amount).await
    }

    async fn payout(
        &self,
        amount: Money,
        payee_instrument_ref: &str,
        idempotency_key: &str,
    ) -> Result<ProcessorReceipt, ProcessorError> {
        let request = PayoutRequest {
            amount_minor: amount.minor(),
            currency: amount.currency().as_str(),
            payee_instrument_ref,
            idempotency_key,
        };
        self.post("/v1/payouts", &request, amount).await
    }

    async fn refund(
        &self,
        processor_tx_id: &str,
        amount: Money,
        idempotency_key: &str,
    ) -> Result<ProcessorReceipt, ProcessorError> {
        let request = RefundRequest {
            processor_tx_id,
            amount_minor: amount.minor(),
            currency: amount.currency().as_str(),
            idempotency_key,
        };
        self.post("/v1/refunds", &request, amount).await
    }
}

/// Scripted failure for the next mock call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScriptedFailure {
    Decline,
    Timeout,
}

/// Deterministic in-memory processor.
///
/// Receipts are keyed by idempotency key, so replaying a key returns the
/// original receipt instead of moving money twice.
pub struct MockProcessor {
    receipts: Mutex<HashMap<String, ProcessorReceipt>>,
    refunds: Mutex<Vec<ProcessorReceipt>>,
    next_failure: Mutex<Option<ScriptedFailure>>,
    refuse_refunds: Mutex<bool>,
}

impl MockProcessor {
    pub fn new() -> Self {
        Self {
            receipts: Mutex::new(HashMap::new()),
            refunds: Mutex::new(Vec::new()),
            next_failure: Mutex::new(None),
            refuse_refunds: Mutex::new(false),
        }
    }

    /// Decline the next charge/payout/refund
    pub async fn decline_next(&self) {
        *self.next_failure.lock().await = Some(ScriptedFailure::Decline);
    }

    /// Time out the next charge/payout/refund
    pub async fn timeout_next(&self) {
        *self.next_failure.lock().await = Some(ScriptedFailure::Timeout);
    }

    /// Decline every refund while charges and payouts keep succeeding
    pub async fn decline_refunds(&self) {
        *self.refuse_refunds.lock().await = true;
    }

    /// Refunds issued so far (compensation assertions in tests)
    pub async fn refunds(&self) -> Vec<ProcessorReceipt> {
        self.refunds.lock().await.clone()
    }

    /// Number of distinct charges/payouts performed
    pub async fn receipt_count(&self) -> usize {
        self.receipts.lock().await.len()
    }

    async fn execute(
        &self,
        prefix: &str,
        amount: Money,
        idempotency_key: &str,
    ) -> Result<ProcessorReceipt, ProcessorError> {
        if let Some(receipt) = self.receipts.lock().await.get(idempotency_key) {
            return Ok(receipt.clone());
        }
        match self.next_failure.lock().await.take() {
            Some(ScriptedFailure::Decline) => {
                return Err(ProcessorError::Declined("card declined".to_string()));
            }
            Some(ScriptedFailure::Timeout) => return Err(ProcessorError::Timeout),
            None => {}
        }
        let receipt = ProcessorReceipt {
            processor_tx_id: format!("{prefix}_{}", Uuid::new_v4()),
            amount,
        };
        self.receipts
            .lock()
            .await
            .insert(idempotency_key.to_string(), receipt.clone());
        info!(tx = %receipt.processor_tx_id, %amount, "mock processor accepted {prefix}");
        Ok(receipt)
    }
}

impl Default for MockProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaymentProcessor for MockProcessor {
    async fn charge(
        &self,
        amount: Money,
        _instrument_ref: &str,
        idempotency_key: &str,
    ) -> Result<ProcessorReceipt, ProcessorError> {
        self.execute("ch", amount, idempotency_key).await
    }

    async fn payout(
        &self,
        amount: Money,
        _payee_instrument_ref: &str,
        idempotency_key: &str,
    ) -> Result<ProcessorReceipt, ProcessorError> {
        self.execute("po", amount, idempotency_key).await
    }

    async fn refund(
        &self,
        processor_tx_id: &str,
        amount: Money,
        idempotency_key: &str,
    ) -> Result<ProcessorReceipt, ProcessorError> {
        if *self.refuse_refunds.lock().await {
            return Err(ProcessorError::Declined("refund rejected".to_string()));
        }
        let receipt = self.execute("re", amount, idempotency_key).await?;
        info!(original = processor_tx_id, "mock processor refunded");
        self.refunds.lock().await.push(receipt.clone());
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Currency;

    fn usd(minor: i64) -> Money {
        Money::new(minor, Currency::Usd).unwrap()
    }

    #[tokio::test]
    async fn mock_replays_receipt_for_same_key() {
        let processor = MockProcessor::new();
        let first = processor.charge(usd(1_000), "card-1", "key-1").await.unwrap();
        let second = processor.charge(usd(1_000), "card-1", "key-1").await.unwrap();
        assert_eq!(first.processor_tx_id, second.processor_tx_id);
        assert_eq!(processor.receipt_count().await, 1);
    }

    #[tokio::test]
    async fn scripted_decline_fires_once() {
        let processor = MockProcessor::new();
        processor.decline_next().await;
        assert!(matches!(
            processor.charge(usd(1_000), "card-1", "key-1").await,
            Err(ProcessorError::Declined(_))
        ));
        assert!(processor.charge(usd(1_000), "card-1", "key-2").await.is_ok());
    }
}
