use crate::{chain::ChainClient as _, handlers::AppState, models::HealthStatus, store::InvoiceStore as _};
use axum::{extract::State, Json};
use chrono::Utc;

pub async fn health_check(State(state): State<AppState>) -> Json<HealthStatus> {
    let cursor = state.store.cursor().ok();
    let chain_ok = state.chain.head_height().await.is_ok();
    let store_ok = cursor.is_some();

    let status = if store_ok && chain_ok {
        "healthy"
    } else if store_ok {
        "degraded"
    } else {
        "unhealthy"
    };

    Json(HealthStatus {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        store: store_ok,
        chain_rpc: chain_ok,
        cursor: cursor.unwrap_or(0),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        timestamp: Utc::now(),
    })
}

pub async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "message": "chainpay server is running.",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
