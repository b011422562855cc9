use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::extract::ActorId;
use super::response::{BalanceResponse, Success};
use crate::allocator::BulkAllocationOutcome;
use crate::engine::{CreditEngine, SettlementRequest, UsageAuthorization, UsageRequest};
use crate::error::Result;
use crate::ledger::{PoolKind, PoolRef, Transaction, TransactionQuery, TransactionType};
use crate::storage::LedgerStore;

type Engine<S> = State<Arc<CreditEngine<S>>>;

/// Build the ledger router.
///
/// | Method | Path | Operation |
/// |---|---|---|
/// | POST | `/v1/usage/authorize` | gate and resolve |
/// | POST | `/v1/usage/settle` | price and debit |
/// | POST | `/v1/orgs/{org_id}/allocations` | allocate |
/// | POST | `/v1/orgs/{org_id}/classes/{class_id}/allocations` | bulk allocate |
/// | POST | `/v1/orgs/{org_id}/transfers` | family transfer |
/// | GET | `/v1/orgs/{org_id}/transactions` | ledger listing |
/// | POST | `/v1/orgs/{org_id}/credit-requests` | child asks for credit |
/// | POST | `/v1/purchases` | record purchase |
/// | POST | `/v1/transactions/{id}/reversal` | reverse usage |
pub fn router<S>(engine: CreditEngine<S>) -> Router
where
    S: LedgerStore + Clone + 'static,
{
    Router::new()
        .route("/v1/usage/authorize", post(authorize::<S>))
        .route("/v1/usage/settle", post(settle::<S>))
        .route("/v1/orgs/{org_id}/allocations", post(allocate::<S>))
        .route(
            "/v1/orgs/{org_id}/classes/{class_id}/allocations",
            post(bulk_allocate::<S>),
        )
        .route("/v1/orgs/{org_id}/transfers", post(transfer::<S>))
        .route("/v1/orgs/{org_id}/transactions", get(list_transactions::<S>))
        .route("/v1/orgs/{org_id}/credit-requests", post(request_credit::<S>))
        .route("/v1/purchases", post(record_purchase::<S>))
        .route("/v1/transactions/{id}/reversal", post(reverse::<S>))
        .with_state(Arc::new(engine))
}

// Request bodies

#[derive(Debug, Deserialize)]
struct AuthorizeBody {
    #[serde(default)]
    organization_id: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SettleBody {
    pool: PoolRef,
    model: String,
    tokens_in: u64,
    tokens_out: u64,
}

#[derive(Debug, Deserialize)]
struct AllocateBody {
    member_id: String,
    amount: Decimal,
}

#[derive(Debug, Deserialize)]
struct BulkAllocateBody {
    amount_per_student: Decimal,
}

#[derive(Debug, Deserialize)]
struct TransferBody {
    child_user_id: String,
    amount: Decimal,
}

#[derive(Debug, Deserialize)]
struct PurchaseBody {
    target: PoolRef,
    amount: Decimal,
    external_payment_id: String,
}

#[derive(Debug, Deserialize)]
struct ReversalBody {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreditRequestBody {
    #[serde(default)]
    amount: Option<Decimal>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TransactionParams {
    member_id: Option<String>,
    user_id: Option<String>,
    tx_type: Option<TransactionType>,
    pool: Option<PoolKind>,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    limit: Option<u64>,
}

// Response payloads

#[derive(Debug, Serialize)]
struct SettleResponse {
    new_balance: Decimal,
    cost: Decimal,
    pricing_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    transaction_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct PurchaseResponse {
    new_balance: Decimal,
    transaction_id: String,
    /// False when the payment id had been recorded before.
    applied: bool,
}

#[derive(Debug, Serialize)]
struct TransferResponse {
    new_balance: Decimal,
    transaction_id: String,
    organization_unallocated: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_balance: Option<Decimal>,
}

#[derive(Debug, Serialize)]
struct TransactionList {
    transactions: Vec<Transaction>,
}

#[derive(Debug, Serialize)]
struct CreditRequestResponse {
    notified: usize,
}

// Handlers

async fn authorize<S: LedgerStore + Clone + 'static>(
    State(engine): Engine<S>,
    ActorId(user_id): ActorId,
    Json(body): Json<AuthorizeBody>,
) -> Result<Success<UsageAuthorization>> {
    let authorization = engine
        .authorize_usage(&UsageRequest {
            user_id,
            organization_id: body.organization_id,
            model: body.model,
        })
        .await?;
    Ok(Success::new(authorization))
}

async fn settle<S: LedgerStore + Clone + 'static>(
    State(engine): Engine<S>,
    ActorId(user_id): ActorId,
    Json(body): Json<SettleBody>,
) -> Result<Success<SettleResponse>> {
    let settlement = engine
        .settle_usage(&SettlementRequest {
            user_id,
            pool: body.pool,
            model: body.model,
            tokens_in: body.tokens_in,
            tokens_out: body.tokens_out,
        })
        .await?;
    Ok(Success::new(SettleResponse {
        new_balance: settlement.remaining,
        cost: settlement.cost.cost,
        pricing_version: settlement.cost.pricing_version,
        transaction_id: settlement.transaction.map(|tx| tx.id),
    }))
}

async fn allocate<S: LedgerStore + Clone + 'static>(
    State(engine): Engine<S>,
    ActorId(actor): ActorId,
    Path(org_id): Path<String>,
    Json(body): Json<AllocateBody>,
) -> Result<Success<BalanceResponse>> {
    let outcome = engine
        .allocate(&actor, &org_id, &body.member_id, body.amount)
        .await?;
    Ok(Success::new(BalanceResponse::new(outcome.new_allocation)))
}

async fn bulk_allocate<S: LedgerStore + Clone + 'static>(
    State(engine): Engine<S>,
    ActorId(actor): ActorId,
    Path((org_id, class_id)): Path<(String, String)>,
    Json(body): Json<BulkAllocateBody>,
) -> Result<Success<BulkAllocationOutcome>> {
    let outcome = engine
        .bulk_allocate(&actor, &org_id, &class_id, body.amount_per_student)
        .await?;
    Ok(Success::new(outcome))
}

async fn transfer<S: LedgerStore + Clone + 'static>(
    State(engine): Engine<S>,
    ActorId(actor): ActorId,
    Path(org_id): Path<String>,
    Json(body): Json<TransferBody>,
) -> Result<Success<TransferResponse>> {
    let outcome = engine
        .transfer(&actor, &org_id, &body.child_user_id, body.amount)
        .await?;
    Ok(Success::new(TransferResponse {
        new_balance: outcome.child_balance,
        transaction_id: outcome.transaction.id,
        organization_unallocated: outcome.organization_unallocated,
        parent_balance: outcome.parent_balance,
    }))
}

async fn list_transactions<S: LedgerStore + Clone + 'static>(
    State(engine): Engine<S>,
    ActorId(actor): ActorId,
    Path(org_id): Path<String>,
    Query(params): Query<TransactionParams>,
) -> Result<Success<TransactionList>> {
    let query = TransactionQuery {
        organization_id: Some(org_id.clone()),
        member_id: params.member_id,
        user_id: params.user_id,
        tx_type: params.tx_type,
        pool: params.pool,
        since: params.since,
        until: params.until,
        limit: params.limit,
    };
    let transactions = engine.transactions(&actor, &org_id, query).await?;
    Ok(Success::new(TransactionList { transactions }))
}

async fn request_credit<S: LedgerStore + Clone + 'static>(
    State(engine): Engine<S>,
    ActorId(actor): ActorId,
    Path(org_id): Path<String>,
    Json(body): Json<CreditRequestBody>,
) -> Result<Success<CreditRequestResponse>> {
    let notified = engine
        .request_credit(&actor, &org_id, body.amount, body.message)
        .await?;
    Ok(Success::new(CreditRequestResponse { notified }))
}

/// Called by the payment integration once a payment has settled.
async fn record_purchase<S: LedgerStore + Clone + 'static>(
    State(engine): Engine<S>,
    Json(body): Json<PurchaseBody>,
) -> Result<Success<PurchaseResponse>> {
    let outcome = engine
        .record_purchase(&body.target, body.amount, &body.external_payment_id)
        .await?;
    Ok(Success::new(PurchaseResponse {
        new_balance: outcome.new_balance,
        transaction_id: outcome.transaction.id,
        applied: outcome.applied,
    }))
}

async fn reverse<S: LedgerStore + Clone + 'static>(
    State(engine): Engine<S>,
    ActorId(actor): ActorId,
    Path(transaction_id): Path<String>,
    Json(body): Json<ReversalBody>,
) -> Result<Success<BalanceResponse>> {
    let reason = body.reason.as_deref().unwrap_or("Reversed by administrator");
    let outcome = engine.reverse_usage(&actor, &transaction_id, reason).await?;
    Ok(Success::new(
        BalanceResponse::new(outcome.new_balance).with_transaction(outcome.transaction.id),
    ))
}
