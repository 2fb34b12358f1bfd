//! HTTP routes: the WebSocket endpoint plus a small read-only API.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::broker::SessionState;
use crate::profile::Profile;
use crate::state::AppState;
use crate::types::{ClientId, Order};
use crate::ws;

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub profile: Profile,
    pub client_id: ClientId,
    pub broker: SessionState,
}

/// GET /api/health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        profile: state.bindings.profile,
        client_id: state.bindings.client_id.clone(),
        broker: state.broker.state(),
    })
}

/// GET /api/orders
pub async fn list_orders(State(state): State<Arc<AppState>>) -> Json<Vec<Order>> {
    Json(state.all_orders().await)
}

/// GET /api/orders/{id}
pub async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Order>, StatusCode> {
    state
        .get_order(&id)
        .await
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/api/health", get(health))
        .route("/api/orders", get(list_orders))
        .route("/api/orders/{id}", get(get_order))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
