//! API Routes
//!
//! HTTP endpoint definitions. Every handler resolves the caller from the
//! `OperationContext` placed by the auth middleware; role checks live in
//! the engine's handlers.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit::ChainVerificationResult;
use crate::domain::{Booking, OperationContext, Provider, Role, StageId, Wallet};
use crate::error::AppError;
use crate::handlers::{
    AcceptResult, AdjustWalletCommand, CreateRequestCommand, PaymentCreditCommand,
    PaymentCreditResult, RateCommand, RatingResult, RegisterProviderCommand, ReviewQueueItem,
    ReviewStageCommand, SettlementResult, TransferCommand, TransferResult, UpdateStatusCommand,
    VerificationStatusView, WalletEntryResult,
};
use crate::Engine;

type ApiState = State<Arc<Engine>>;

// =========================================================================
// Request/Response types
// =========================================================================

#[derive(Debug, Deserialize)]
pub struct SubmitStageRequest {
    pub data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct AvailabilityRequest {
    pub available: bool,
}

#[derive(Debug, Deserialize)]
pub struct BlacklistRequest {
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct NoteRequest {
    pub note: String,
}

#[derive(Debug, Serialize)]
pub struct BookingListResponse {
    pub bookings: Vec<Booking>,
    pub total: usize,
}

impl From<Vec<Booking>> for BookingListResponse {
    fn from(bookings: Vec<Booking>) -> Self {
        Self {
            total: bookings.len(),
            bookings,
        }
    }
}

// =========================================================================
// API Router
// =========================================================================

/// Create the API router
pub fn create_router() -> Router<Arc<Engine>> {
    Router::new()
        // Providers
        .route("/providers", post(register_provider))
        .route("/providers/:provider_id", get(get_provider))
        .route(
            "/providers/:provider_id/verification/stages/:stage",
            post(submit_stage),
        )
        .route("/providers/:provider_id/verification", get(verification_status))
        .route("/providers/:provider_id/availability", post(set_availability))
        // Admin: verification
        .route(
            "/admin/providers/:provider_id/verification/stages/:stage/review",
            post(review_stage),
        )
        .route("/admin/providers/:provider_id/unapprove", post(unapprove))
        .route(
            "/admin/providers/:provider_id/blacklist",
            post(blacklist).delete(remove_blacklist),
        )
        .route("/admin/verification/queue", get(review_queue))
        // Admin: review moderation
        .route(
            "/admin/reviews/:booking_id/hidden",
            post(hide_review).delete(unhide_review),
        )
        .route("/admin/reviews/:booking_id", delete(delete_review))
        .route("/admin/audit/verify", get(verify_audit_chain))
        // Matching
        .route("/requests/eligible", get(eligible_requests))
        .route("/requests/:booking_id/accept", post(accept_request))
        // Bookings
        .route("/requests", post(create_request))
        .route("/requests/mine", get(my_bookings))
        .route("/requests/:booking_id", get(get_booking))
        .route("/requests/:booking_id/status", post(update_status))
        .route("/requests/:booking_id/cancel", post(cancel_booking))
        .route("/requests/:booking_id/notes", post(add_note))
        .route("/requests/:booking_id/rating", post(rate_booking))
        .route("/requests/:booking_id/settle", post(settle_booking))
        // Wallet
        .route("/wallet", get(get_wallet))
        .route("/wallet/topup", post(wallet_topup))
        .route("/wallet/transfer", post(wallet_transfer))
        .route("/admin/wallets/:account_id/credit", post(admin_credit))
        .route("/admin/wallets/:account_id/debit", post(admin_debit))
}

fn caller_id(context: &OperationContext) -> Result<Uuid, AppError> {
    Ok(context.caller()?.user_id)
}

// =========================================================================
// Providers
// =========================================================================

async fn register_provider(
    State(engine): ApiState,
    Extension(context): Extension<OperationContext>,
    Json(command): Json<RegisterProviderCommand>,
) -> Result<(StatusCode, Json<Provider>), AppError> {
    let provider = engine.providers.register(command, &context).await?;
    Ok((StatusCode::CREATED, Json(provider)))
}

async fn get_provider(
    State(engine): ApiState,
    Extension(context): Extension<OperationContext>,
    Path(provider_id): Path<Uuid>,
) -> Result<Json<Provider>, AppError> {
    Ok(Json(engine.providers.get(provider_id, &context).await?))
}

async fn submit_stage(
    State(engine): ApiState,
    Extension(context): Extension<OperationContext>,
    Path((provider_id, stage)): Path<(Uuid, StageId)>,
    Json(request): Json<SubmitStageRequest>,
) -> Result<Json<VerificationStatusView>, AppError> {
    let view = engine
        .verification
        .submit_stage(provider_id, stage, request.data, &context)
        .await?;
    Ok(Json(view))
}

async fn verification_status(
    State(engine): ApiState,
    Extension(context): Extension<OperationContext>,
    Path(provider_id): Path<Uuid>,
) -> Result<Json<VerificationStatusView>, AppError> {
    Ok(Json(engine.verification.status(provider_id, &context).await?))
}

async fn set_availability(
    State(engine): ApiState,
    Extension(context): Extension<OperationContext>,
    Path(provider_id): Path<Uuid>,
    Json(request): Json<AvailabilityRequest>,
) -> Result<Json<Provider>, AppError> {
    let provider = engine
        .providers
        .set_availability(provider_id, request.available, &context)
        .await?;
    Ok(Json(provider))
}

// =========================================================================
// Admin: verification
// =========================================================================

async fn review_stage(
    State(engine): ApiState,
    Extension(context): Extension<OperationContext>,
    Path((provider_id, stage)): Path<(Uuid, StageId)>,
    Json(command): Json<ReviewStageCommand>,
) -> Result<Json<VerificationStatusView>, AppError> {
    let view = engine
        .verification
        .review(provider_id, stage, command, &context)
        .await?;
    Ok(Json(view))
}

async fn unapprove(
    State(engine): ApiState,
    Extension(context): Extension<OperationContext>,
    Path(provider_id): Path<Uuid>,
) -> Result<Json<VerificationStatusView>, AppError> {
    Ok(Json(engine.verification.unapprove(provider_id, &context).await?))
}

async fn blacklist(
    State(engine): ApiState,
    Extension(context): Extension<OperationContext>,
    Path(provider_id): Path<Uuid>,
    Json(request): Json<BlacklistRequest>,
) -> Result<Json<Provider>, AppError> {
    let provider = engine
        .verification
        .blacklist(provider_id, request.reason, &context)
        .await?;
    Ok(Json(provider))
}

async fn remove_blacklist(
    State(engine): ApiState,
    Extension(context): Extension<OperationContext>,
    Path(provider_id): Path<Uuid>,
) -> Result<Json<Provider>, AppError> {
    Ok(Json(engine.verification.remove_blacklist(provider_id, &context).await?))
}

async fn review_queue(
    State(engine): ApiState,
    Extension(context): Extension<OperationContext>,
) -> Result<Json<Vec<ReviewQueueItem>>, AppError> {
    Ok(Json(engine.verification.review_queue(&context).await?))
}

// =========================================================================
// Admin: review moderation and audit
// =========================================================================

async fn hide_review(
    State(engine): ApiState,
    Extension(context): Extension<OperationContext>,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<RatingResult>, AppError> {
    Ok(Json(engine.ratings.hide_review(booking_id, &context).await?))
}

async fn unhide_review(
    State(engine): ApiState,
    Extension(context): Extension<OperationContext>,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<RatingResult>, AppError> {
    Ok(Json(engine.ratings.unhide_review(booking_id, &context).await?))
}

async fn delete_review(
    State(engine): ApiState,
    Extension(context): Extension<OperationContext>,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<RatingResult>, AppError> {
    Ok(Json(engine.ratings.delete_review(booking_id, &context).await?))
}

async fn verify_audit_chain(
    State(engine): ApiState,
    Extension(context): Extension<OperationContext>,
) -> Result<Json<ChainVerificationResult>, AppError> {
    context.require_admin()?;
    Ok(Json(engine.audit().verify_hash_chain().await?))
}

// =========================================================================
// Matching
// =========================================================================

async fn eligible_requests(
    State(engine): ApiState,
    Extension(context): Extension<OperationContext>,
) -> Result<Json<BookingListResponse>, AppError> {
    let provider_id = caller_id(&context)?;
    let requests = engine
        .matching
        .list_eligible_requests(provider_id, &context)
        .await?;
    Ok(Json(requests.into()))
}

async fn accept_request(
    State(engine): ApiState,
    Extension(context): Extension<OperationContext>,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<AcceptResult>, AppError> {
    let provider_id = caller_id(&context)?;
    Ok(Json(engine.matching.accept(provider_id, booking_id, &context).await?))
}

// =========================================================================
// Bookings
// =========================================================================

async fn create_request(
    State(engine): ApiState,
    Extension(context): Extension<OperationContext>,
    Json(command): Json<CreateRequestCommand>,
) -> Result<(StatusCode, Json<Booking>), AppError> {
    let booking = engine.bookings.create_request(command, &context).await?;
    Ok((StatusCode::CREATED, Json(booking)))
}

/// Bookings the caller created (clients) or is assigned to (providers)
async fn my_bookings(
    State(engine): ApiState,
    Extension(context): Extension<OperationContext>,
) -> Result<Json<BookingListResponse>, AppError> {
    let caller = context.caller()?;
    let bookings = match caller.role {
        Role::Provider => {
            engine
                .bookings
                .list_provider_bookings(caller.user_id, &context)
                .await?
        }
        Role::Client | Role::Admin => {
            engine
                .bookings
                .list_client_bookings(caller.user_id, &context)
                .await?
        }
    };
    Ok(Json(bookings.into()))
}

async fn get_booking(
    State(engine): ApiState,
    Extension(context): Extension<OperationContext>,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<Booking>, AppError> {
    Ok(Json(engine.bookings.get(booking_id, &context).await?))
}

async fn update_status(
    State(engine): ApiState,
    Extension(context): Extension<OperationContext>,
    Path(booking_id): Path<Uuid>,
    Json(command): Json<UpdateStatusCommand>,
) -> Result<Json<Booking>, AppError> {
    let provider_id = caller_id(&context)?;
    let booking = engine
        .bookings
        .update_status(provider_id, booking_id, command.status, &context)
        .await?;
    Ok(Json(booking))
}

async fn cancel_booking(
    State(engine): ApiState,
    Extension(context): Extension<OperationContext>,
    Path(booking_id): Path<Uuid>,
    request: Option<Json<CancelRequest>>,
) -> Result<Json<Booking>, AppError> {
    let client_id = caller_id(&context)?;
    let reason = request.and_then(|Json(body)| body.reason);
    let booking = engine
        .bookings
        .cancel(client_id, booking_id, reason, &context)
        .await?;
    Ok(Json(booking))
}

async fn add_note(
    State(engine): ApiState,
    Extension(context): Extension<OperationContext>,
    Path(booking_id): Path<Uuid>,
    Json(request): Json<NoteRequest>,
) -> Result<Json<Booking>, AppError> {
    let provider_id = caller_id(&context)?;
    let booking = engine
        .bookings
        .add_note(provider_id, booking_id, request.note, &context)
        .await?;
    Ok(Json(booking))
}

async fn rate_booking(
    State(engine): ApiState,
    Extension(context): Extension<OperationContext>,
    Path(booking_id): Path<Uuid>,
    Json(command): Json<RateCommand>,
) -> Result<Json<RatingResult>, AppError> {
    let client_id = caller_id(&context)?;
    let result = engine
        .ratings
        .rate(client_id, booking_id, command, &context)
        .await?;
    Ok(Json(result))
}

async fn settle_booking(
    State(engine): ApiState,
    Extension(context): Extension<OperationContext>,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<SettlementResult>, AppError> {
    let client_id = caller_id(&context)?;
    Ok(Json(engine.bookings.settle(client_id, booking_id, &context).await?))
}

// =========================================================================
// Wallet
// =========================================================================

async fn get_wallet(
    State(engine): ApiState,
    Extension(context): Extension<OperationContext>,
) -> Result<Json<Wallet>, AppError> {
    let account_id = caller_id(&context)?;
    Ok(Json(engine.ledger.get_wallet(account_id, &context).await?))
}

async fn wallet_topup(
    State(engine): ApiState,
    Extension(context): Extension<OperationContext>,
    Json(command): Json<PaymentCreditCommand>,
) -> Result<Json<PaymentCreditResult>, AppError> {
    let account_id = caller_id(&context)?;
    let result = engine
        .ledger
        .credit_from_payment(account_id, command, &context)
        .await?;
    Ok(Json(result))
}

async fn wallet_transfer(
    State(engine): ApiState,
    Extension(context): Extension<OperationContext>,
    Json(command): Json<TransferCommand>,
) -> Result<Json<TransferResult>, AppError> {
    let account_id = caller_id(&context)?;
    Ok(Json(engine.ledger.transfer(account_id, command, &context).await?))
}

async fn admin_credit(
    State(engine): ApiState,
    Extension(context): Extension<OperationContext>,
    Path(account_id): Path<Uuid>,
    Json(command): Json<AdjustWalletCommand>,
) -> Result<Json<WalletEntryResult>, AppError> {
    let result = engine
        .ledger
        .admin_adjust(account_id, command, true, &context)
        .await?;
    Ok(Json(result))
}

async fn admin_debit(
    State(engine): ApiState,
    Extension(context): Extension<OperationContext>,
    Path(account_id): Path<Uuid>,
    Json(command): Json<AdjustWalletCommand>,
) -> Result<Json<WalletEntryResult>, AppError> {
    let result = engine
        .ledger
        .admin_adjust(account_id, command, false, &context)
        .await?;
    Ok(Json(result))
}
