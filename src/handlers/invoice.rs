use crate::{
    chain::ChainClient as _,
    error::ChainPayError,
    handlers::AppState,
    models::{
        Asset, CreateInvoiceRequest, CreateInvoiceResponse, Invoice, InvoiceStatus,
        ListInvoicesQuery, ListInvoicesResponse,
    },
    store::{InvoiceFilter, InvoiceStore as _},
};
use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::Utc;
use ethers::types::U256;
use uuid::Uuid;

const MAX_PAGE_SIZE: u32 = 100;

pub async fn create_invoice(
    State(state): State<AppState>,
    Json(request): Json<CreateInvoiceRequest>,
) -> Result<Json<CreateInvoiceResponse>, ChainPayError> {
    let amount = U256::from_dec_str(request.amount.trim())
        .map_err(|_| ChainPayError::InvalidRequest(format!("invalid amount: {}", request.amount)))?;
    if amount.is_zero() {
        return Err(ChainPayError::InvalidRequest(
            "amount must be greater than zero".to_string(),
        ));
    }

    let asset = Asset::parse(&request.asset);
    if let Asset::Token(symbol) = &asset {
        if state.tokens.iter().all(|(s, _)| s != symbol) {
            return Err(ChainPayError::UnknownAsset(symbol.clone()));
        }
    }

    let id = format!("inv_{}", Uuid::new_v4().simple());
    let (receiving_address, one_time_key) = state.wallet.derive(&id)?;

    // Token funds leave through the sweep contract, so a delegation is
    // signed now, while the one-time key is in hand. Native sweeps
    // re-derive the key instead.
    let authorization = match &asset {
        Asset::Token(_) => {
            let nonce = state.chain.transaction_count(receiving_address).await?;
            Some(state.wallet.sign_delegation(&one_time_key, nonce)?)
        }
        Asset::Native => None,
    };

    let now = Utc::now().timestamp_millis();
    let invoice = Invoice {
        id: id.clone(),
        amount,
        asset: asset.clone(),
        receiving_address,
        authorization,
        expiration: now + state.invoice_ttl_ms,
        description: request.description.clone(),
        fulfilled: false,
        swept: false,
        created_at: now,
    };
    state.store.insert(&invoice)?;

    tracing::info!(
        invoice_id = %id,
        asset = %asset,
        amount = %amount,
        address = ?receiving_address,
        "Invoice created"
    );

    Ok(Json(CreateInvoiceResponse {
        invoice_id: id,
        amount: amount.to_string(),
        asset: asset.as_str().to_string(),
        receiving_address,
        expiration: invoice.expiration,
        description: request.description,
    }))
}

pub async fn get_invoice(
    State(state): State<AppState>,
    Path(invoice_id): Path<String>,
) -> Result<Json<InvoiceStatus>, ChainPayError> {
    let invoice = state
        .store
        .get(&invoice_id)?
        .ok_or(ChainPayError::InvoiceNotFound(invoice_id))?;
    Ok(Json(status_of(&invoice)))
}

pub async fn list_invoices(
    State(state): State<AppState>,
    Query(query): Query<ListInvoicesQuery>,
) -> Result<Json<ListInvoicesResponse>, ChainPayError> {
    let page = query.page.unwrap_or(1).max(1);
    let page_size = query.page_size.unwrap_or(20).clamp(1, MAX_PAGE_SIZE);

    let filter = InvoiceFilter {
        asset: query.asset.as_deref().map(Asset::parse),
        fulfilled: query.fulfilled,
        swept: query.swept,
        page,
        page_size,
    };

    let invoices = state
        .store
        .list(&filter)?
        .iter()
        .map(status_of)
        .collect();

    Ok(Json(ListInvoicesResponse {
        invoices,
        page,
        page_size,
    }))
}

pub async fn delete_invoice(
    State(state): State<AppState>,
    Path(invoice_id): Path<String>,
) -> Result<Json<serde_json::Value>, ChainPayError> {
    if !state.store.delete(&invoice_id)? {
        return Err(ChainPayError::InvoiceNotFound(invoice_id));
    }
    Ok(Json(
        serde_json::json!({ "message": "Invoice deleted successfully." }),
    ))
}

fn status_of(invoice: &Invoice) -> InvoiceStatus {
    InvoiceStatus {
        invoice_id: invoice.id.clone(),
        amount: invoice.amount.to_string(),
        asset: invoice.asset.as_str().to_string(),
        receiving_address: invoice.receiving_address,
        expiration: invoice.expiration,
        description: invoice.description.clone(),
        fulfilled: invoice.fulfilled,
        swept: invoice.swept,
        created_at: invoice.created_at,
    }
}
