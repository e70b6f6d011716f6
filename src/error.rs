use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ChainPayError {
    #[error("Invoice not found: {0}")]
    InvoiceNotFound(String),

    #[error("Invalid invoice request: {0}")]
    InvalidRequest(String),

    #[error("Unknown asset: {0}")]
    UnknownAsset(String),

    #[error("RPC error: {0}")]
    RpcError(#[from] ethers::providers::ProviderError),

    #[error("Transfer rejected: {0}")]
    TransferRejected(String),

    #[error("Wallet error: {0}")]
    WalletError(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error("Anyhow error: {0}")]
    AnyhowError(#[from] anyhow::Error),
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub error_code: String,
    pub timestamp: chrono::DateTime<Utc>,
    pub request_id: String,
}

impl IntoResponse for ChainPayError {
    fn into_response(self) -> Response {
        let request_id = Uuid::new_v4().to_string();

        let (status, error_code) = match &self {
            ChainPayError::InvoiceNotFound(_) => (StatusCode::NOT_FOUND, "INVOICE_NOT_FOUND"),
            ChainPayError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
            ChainPayError::UnknownAsset(_) => (StatusCode::BAD_REQUEST, "UNKNOWN_ASSET"),
            ChainPayError::RpcError(_) | ChainPayError::TransferRejected(_) => {
                (StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        let body = ErrorResponse {
            success: false,
            error: self.to_string(),
            error_code: error_code.to_string(),
            timestamp: Utc::now(),
            request_id,
        };

        tracing::error!(
            error = ?self,
            error_code = error_code,
            "Request failed"
        );

        (status, Json(body)).into_response()
    }
}
