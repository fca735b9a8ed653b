// HTTP API handlers

use axum::{
    async_trait,
    extract::{ws::Message, ws::WebSocket, FromRequestParts, Path, State, WebSocketUpgrade},
    http::{header, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::battle::ResolutionOutcome;
use crate::error::LedgerError;
use crate::types::{
    BalanceView, ChallengeRequest, CheckDepositRequest, CurrencyBalance, EnterQueueRequest,
    RejectWithdrawalRequest, User, VerifyRequest, WithdrawalRequest,
};
use crate::AppState;

pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Map a service error to its status code and a JSON body without backend details.
pub fn error_response(err: LedgerError) -> Response {
    match &err {
        LedgerError::Storage(_) | LedgerError::ExternalUnavailable(_) | LedgerError::PayoutUnrecorded { .. } => {
            error!("Request failed: {}", err)
        }
        _ => debug!("Request rejected: {}", err),
    }

    (
        err.status_code(),
        Json(json!({
            "error": err.public_message(),
            "kind": err.kind(),
        })),
    )
        .into_response()
}

fn authorize_admin(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = state.config.admin_token.as_deref().filter(|token| !token.is_empty()) else {
        warn!(target: "security", "Admin endpoint called but no admin token is configured");
        return Err(error_response(LedgerError::NotAuthorized("admin access is disabled".to_string())));
    };

    let provided = headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    // Compare digests so the comparison length does not depend on the input
    if Sha256::digest(provided.as_bytes()) != Sha256::digest(expected.as_bytes()) {
        warn!(target: "security", "Rejected admin request with an invalid token");
        return Err(error_response(LedgerError::NotAuthorized("invalid admin token".to_string())));
    }
    Ok(())
}

/// The caller behind an `Authorization: Bearer <session token>` header.
pub struct AuthenticatedUser(pub User);

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or_else(|| error_response(LedgerError::Unauthenticated("missing bearer token".to_string())))?;

        state.users.authenticate(token.trim()).await.map(AuthenticatedUser).map_err(error_response)
    }
}

pub async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "battle-service",
        "timestamp": Utc::now()
    }))
}

pub async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics_handle {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

pub async fn auth_challenge(
    State(state): State<AppState>,
    Json(request): Json<ChallengeRequest>,
) -> Response {
    match state.users.challenge(&request.wallet_address).await {
        Ok(challenge) => (StatusCode::OK, Json(challenge)).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn auth_verify(
    State(state): State<AppState>,
    Json(request): Json<VerifyRequest>,
) -> Response {
    match state.users.verify(&request.wallet_address, &request.signature).await {
        Ok(session) => (StatusCode::OK, Json(session)).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn get_balances(State(state): State<AppState>, Path(wallet): Path<String>) -> Response {
    let user = match state.users.require_user(&wallet).await {
        Ok(user) => user,
        Err(e) => return error_response(e),
    };

    match state.ledger.balances(user.id).await {
        Ok(balances) => {
            let view = BalanceView {
                wallet_address: user.wallet_address,
                balances: balances
                    .into_iter()
                    .map(|(currency, balance)| CurrencyBalance { currency, balance })
                    .collect(),
            };
            (StatusCode::OK, Json(view)).into_response()
        }
        Err(e) => error_response(e),
    }
}

pub async fn get_transactions(State(state): State<AppState>, Path(wallet): Path<String>) -> Response {
    let user = match state.users.require_user(&wallet).await {
        Ok(user) => user,
        Err(e) => return error_response(e),
    };

    match state.ledger.history(user.id).await {
        Ok(transactions) => (
            StatusCode::OK,
            Json(json!({
                "wallet_address": user.wallet_address,
                "transactions": transactions,
            })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn enter_queue(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Json(request): Json<EnterQueueRequest>,
) -> Response {
    info!("Queue request from {}: {} {}", user.wallet_address, request.side.as_str(), request.currency);

    match state.matching.enter_queue(user.id, request.side, request.currency).await {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn get_current_battle(State(state): State<AppState>, Path(wallet): Path<String>) -> Response {
    let user = match state.users.require_user(&wallet).await {
        Ok(user) => user,
        Err(e) => return error_response(e),
    };

    match state.battles.get_current_battle(user.id).await {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn resolve_battle(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Path(battle_id): Path<Uuid>,
) -> Response {
    match state.battles.resolve_battle(battle_id, Some(user.id)).await {
        Ok(outcome) => {
            let status = match outcome {
                ResolutionOutcome::NotYetEligible { .. } => StatusCode::ACCEPTED,
                _ => StatusCode::OK,
            };
            (status, Json(outcome)).into_response()
        }
        Err(e) => error_response(e),
    }
}

pub async fn check_deposit(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Json(request): Json<CheckDepositRequest>,
) -> Response {
    info!("Deposit check from {}: {} ({})", user.wallet_address, request.tx_hash, request.currency);

    match state
        .deposits
        .check_transaction_for_user(user.id, &request.tx_hash, request.currency)
        .await
    {
        Ok(credit) => (StatusCode::OK, Json(credit)).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn request_withdrawal(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Json(request): Json<WithdrawalRequest>,
) -> Response {
    match state
        .withdrawals
        .request(user.id, request.amount, request.currency, &request.destination_address)
        .await
    {
        Ok(withdrawal) => (StatusCode::CREATED, Json(withdrawal)).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn cancel_withdrawal(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Path(withdrawal_id): Path<Uuid>,
) -> Response {
    match state.withdrawals.cancel(withdrawal_id, user.id).await {
        Ok(withdrawal) => (StatusCode::OK, Json(withdrawal)).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn list_pending_withdrawals(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(denied) = authorize_admin(&state, &headers) {
        return denied;
    }

    match state.withdrawals.list_pending().await {
        Ok(pending) => (StatusCode::OK, Json(json!({ "withdrawals": pending }))).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn approve_withdrawal(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(withdrawal_id): Path<Uuid>,
) -> Response {
    if let Err(denied) = authorize_admin(&state, &headers) {
        return denied;
    }

    info!("Admin approval for withdrawal {}", withdrawal_id);
    match state.withdrawals.approve(withdrawal_id).await {
        Ok(withdrawal) => (StatusCode::OK, Json(withdrawal)).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn reject_withdrawal(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(withdrawal_id): Path<Uuid>,
    body: Option<Json<RejectWithdrawalRequest>>,
) -> Response {
    if let Err(denied) = authorize_admin(&state, &headers) {
        return denied;
    }

    let reason = body.and_then(|Json(request)| request.reason);
    match state.withdrawals.reject(withdrawal_id, reason).await {
        Ok(withdrawal) => (StatusCode::OK, Json(withdrawal)).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(|socket| websocket_connection(socket, state))
}

async fn websocket_connection(socket: WebSocket, state: AppState) {
    info!("WebSocket connection established");

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let mut broadcast_receiver = state.ws_broadcaster.subscribe();

    // The feed is one-way; client frames only matter for close detection
    let client_task = tokio::spawn(async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => {
                    debug!("WebSocket connection closed by client");
                    break;
                }
                Err(e) => {
                    error!("WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }
    });

    let broadcast_task = tokio::spawn(async move {
        loop {
            let message = match broadcast_receiver.recv().await {
                Ok(message) => message,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("WebSocket subscriber lagged, skipped {} events", skipped);
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };

            let json_message = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to serialize WebSocket message: {}", e);
                    continue;
                }
            };

            if let Err(e) = ws_sender.send(Message::Text(json_message)).await {
                debug!("Failed to send WebSocket message: {}", e);
                break;
            }
        }
    });

    tokio::select! {
        _ = client_task => {}
        _ = broadcast_task => {}
    }

    info!("WebSocket connection closed");
}
