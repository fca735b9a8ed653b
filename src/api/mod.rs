// HTTP surface

pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::AppState;
use handlers::*;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(websocket_handler))
        // Users
        .route("/auth/challenge", post(auth_challenge))
        .route("/auth/verify", post(auth_verify))
        .route("/balances/:wallet", get(get_balances))
        .route("/transactions/:wallet", get(get_transactions))
        // Battles
        .route("/battles/queue", post(enter_queue))
        .route("/battles/current/:wallet", get(get_current_battle))
        .route("/battles/:battle_id/resolve", post(resolve_battle))
        // Funds
        .route("/deposits/check", post(check_deposit))
        .route("/withdrawals", post(request_withdrawal))
        .route("/withdrawals/:withdrawal_id/cancel", post(cancel_withdrawal))
        // Admin
        .route("/admin/withdrawals", get(list_pending_withdrawals))
        .route("/admin/withdrawals/:withdrawal_id/approve", post(approve_withdrawal))
        .route("/admin/withdrawals/:withdrawal_id/reject", post(reject_withdrawal))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
