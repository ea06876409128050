//! HTTP surface for the escrow service
//!
//! Thin axum layer: every mutating route requires an `Idempotency-Key`
//! header, amounts cross the boundary as decimal strings, and errors
//! serialize as `{code, message, reference?}` with the stable codes from
//! [`crate::error::EscrowError::code`].

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::error::EscrowError;
use crate::models::{Actor, DisputeOutcome, EscrowAccount, MilestoneSpec, Transaction};
use crate::money::Money;
use crate::service::{CreateAccountRequest, EscrowService};

/// Build the router over a shared service
pub fn router(service: Arc<EscrowService>) -> Router {
    Router::new()
        .route("/accounts", post(create_account))
        .route("/accounts/:id", get(get_account))
        .route("/accounts/:id/transactions", get(get_transactions))
        .route("/accounts/:id/reconcile", get(reconcile))
        .route("/accounts/:id/cancel", post(cancel_account))
        .route("/accounts/:id/milestones/:mid/fund", post(fund_milestone))
        .route("/accounts/:id/milestones/:mid/release", post(release_milestone))
        .route("/accounts/:id/milestones/:mid/refund", post(refund_milestone))
        .route("/accounts/:id/milestones/:mid/dispute", post(open_dispute))
        .route("/accounts/:id/milestones/:mid/dispute/resolve", post(resolve_dispute))
        .layer(CorsLayer::permissive())
        .with_state(service)
}

#[derive(Debug)]
enum ApiError {
    MissingIdempotencyKey,
    Escrow(EscrowError),
}

impl From<EscrowError> for ApiError {
    fn from(err: EscrowError) -> Self {
        Self::Escrow(err)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reference: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::MissingIdempotencyKey => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    code: "MISSING_IDEMPOTENCY_KEY",
                    message: "mutating calls require an Idempotency-Key header".to_string(),
                    reference: None,
                },
            ),
            Self::Escrow(err) => {
                let status = match &err {
                    EscrowError::NotFound { .. } => StatusCode::NOT_FOUND,
                    EscrowError::Unauthorized { .. } => StatusCode::FORBIDDEN,
                    EscrowError::InvalidAmount(_)
                    | EscrowError::NegativeAmount { .. }
                    | EscrowError::AmountOverflow
                    | EscrowError::CurrencyMismatch { .. }
                    | EscrowError::BudgetExceeded { .. } => StatusCode::BAD_REQUEST,
                    EscrowError::InvalidState { .. }
                    | EscrowError::Disputed { .. }
                    | EscrowError::AlreadyTerminal { .. }
                    | EscrowError::ConcurrentModification { .. }
                    | EscrowError::IdempotencyMismatch { .. } => StatusCode::CONFLICT,
                    EscrowError::PaymentFailed { .. } => StatusCode::PAYMENT_REQUIRED,
                    EscrowError::PaymentTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                    EscrowError::PartialFailure { .. } => StatusCode::BAD_GATEWAY,
                    EscrowError::Config(_) | EscrowError::Serialization(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                let body = ErrorBody {
                    code: err.code(),
                    message: err.to_string(),
                    reference: err.processor_reference().map(str::to_string),
                };
                (status, body)
            }
        };
        (status, axum::Json(body)).into_response()
    }
}

fn idempotency_key(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or(ApiError::MissingIdempotencyKey)
}

#[derive(Debug, Deserialize)]
struct MilestoneSpecBody {
    title: String,
    /// Decimal display string, e.g. "1250.00"
    amount: String,
    due_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct CreateAccountBody {
    project_id: String,
    payer_id: String,
    payee_id: String,
    total_budget: String,
    milestones: Vec<MilestoneSpecBody>,
    actor: Actor,
}

#[derive(Debug, Deserialize)]
struct FundBody {
    instrument_ref: String,
    actor: Actor,
}

#[derive(Debug, Deserialize)]
struct ActorBody {
    actor: Actor,
}

#[derive(Debug, Deserialize)]
struct ReasonBody {
    reason: String,
    actor: Actor,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
enum ResolveOutcomeBody {
    ReleaseAll,
    RefundAll,
    Split { release: String },
}

#[derive(Debug, Deserialize)]
struct ResolveBody {
    #[serde(flatten)]
    outcome: ResolveOutcomeBody,
    actor: Actor,
}

/// Summary with decimal display strings for human consumers
#[derive(Debug, Serialize)]
struct SummaryBody {
    account_id: Uuid,
    currency: String,
    total_budget: String,
    funded: String,
    released: String,
    balance: String,
}

#[derive(Debug, Serialize)]
struct AccountBody {
    account: EscrowAccount,
    summary: SummaryBody,
}

fn account_body(account: EscrowAccount) -> AccountBody {
    let summary = account.summary();
    AccountBody {
        summary: SummaryBody {
            account_id: summary.account_id,
            currency: summary.total_budget.currency().to_string(),
            total_budget: summary.total_budget.to_decimal().to_string(),
            funded: summary.funded.to_decimal().to_string(),
            released: summary.released.to_decimal().to_string(),
            balance: summary.balance.to_decimal().to_string(),
        },
        account,
    }
}

async fn create_account(
    State(service): State<Arc<EscrowService>>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<CreateAccountBody>,
) -> Result<impl IntoResponse, ApiError> {
    let key = idempotency_key(&headers)?;
    let currency = service.config().currency;
    let milestones = body
        .milestones
        .into_iter()
        .map(|m| {
            Ok(MilestoneSpec {
                title: m.title,
                amount: Money::parse_decimal(&m.amount, currency)?,
                due_date: m.due_date,
            })
        })
        .collect::<Result<Vec<_>, EscrowError>>()?;
    let request = CreateAccountRequest {
        project_id: body.project_id,
        payer_id: body.payer_id,
        payee_id: body.payee_id,
        total_budget: Money::parse_decimal(&body.total_budget, currency)?,
        milestones,
    };
    let account = service.create_account(request, &body.actor, &key).await?;
    Ok((StatusCode::CREATED, axum::Json(account_body(account))))
}

async fn get_account(
    State(service): State<Arc<EscrowService>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let account = service.account(id).await?;
    Ok(axum::Json(account_body(account)))
}

async fn get_transactions(
    State(service): State<Arc<EscrowService>>,
    Path(id): Path<Uuid>,
) -> Result<axum::Json<Vec<Transaction>>, ApiError> {
    Ok(axum::Json(service.transactions(id).await?))
}

async fn reconcile(
    State(service): State<Arc<EscrowService>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(axum::Json(service.reconcile(id).await?))
}

async fn cancel_account(
    State(service): State<Arc<EscrowService>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<ActorBody>,
) -> Result<impl IntoResponse, ApiError> {
    let key = idempotency_key(&headers)?;
    let account = service.cancel_account(id, &body.actor, &key).await?;
    Ok(axum::Json(account_body(account)))
}

async fn fund_milestone(
    State(service): State<Arc<EscrowService>>,
    Path((id, mid)): Path<(Uuid, Uuid)>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<FundBody>,
) -> Result<impl IntoResponse, ApiError> {
    let key = idempotency_key(&headers)?;
    let outcome = service
        .fund_milestone(id, mid, &body.instrument_ref, &body.actor, &key)
        .await?;
    Ok(axum::Json(account_body(outcome.account)))
}

async fn release_milestone(
    State(service): State<Arc<EscrowService>>,
    Path((id, mid)): Path<(Uuid, Uuid)>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<ActorBody>,
) -> Result<impl IntoResponse, ApiError> {
    let key = idempotency_key(&headers)?;
    let outcome = service.release_milestone(id, mid, &body.actor, &key).await?;
    Ok(axum::Json(account_body(outcome.account)))
}

async fn refund_milestone(
    State(service): State<Arc<EscrowService>>,
    Path((id, mid)): Path<(Uuid, Uuid)>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<ReasonBody>,
) -> Result<impl IntoResponse, ApiError> {
    let key = idempotency_key(&headers)?;
    let outcome = service
        .refund_milestone(id, mid, &body.reason, &body.actor, &key)
        .await?;
    Ok(axum::Json(account_body(outcome.account)))
}

async fn open_dispute(
    State(service): State<Arc<EscrowService>>,
    Path((id, mid)): Path<(Uuid, Uuid)>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<ReasonBody>,
) -> Result<impl IntoResponse, ApiError> {
    let key = idempotency_key(&headers)?;
    let account = service
        .open_dispute(id, mid, &body.reason, &body.actor, &key)
        .await?;
    Ok(axum::Json(account_body(account)))
}

async fn resolve_dispute(
    State(service): State<Arc<EscrowService>>,
    Path((id, mid)): Path<(Uuid, Uuid)>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<ResolveBody>,
) -> Result<impl IntoResponse, ApiError> {
    let key = idempotency_key(&headers)?;
    let currency = service.config().currency;
    let outcome = match body.outcome {
        ResolveOutcomeBody::ReleaseAll => DisputeOutcome::ReleaseAll,
        ResolveOutcomeBody::RefundAll => DisputeOutcome::RefundAll,
        ResolveOutcomeBody::Split { release } => DisputeOutcome::Split {
            release: Money::parse_decimal(&release, currency)?,
        },
    };
    let result = service
        .resolve_dispute(id, mid, outcome, &body.actor, &key)
        .await?;
    Ok(axum::Json(account_body(result.account)))
}
