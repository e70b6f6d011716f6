use crate::{
    chain::ChainClient as _,
    error::ChainPayError,
    handlers::AppState,
    models::{Asset, BalanceResponse, Invoice},
    store::InvoiceStore as _,
};
use axum::{extract::State, Json};
use chrono::Utc;
use ethers::types::U256;
use std::collections::BTreeMap;

/// Treasury holdings on chain, plus per-asset totals of confirmed-but-unswept
/// and still-pending invoice amounts from the store.
pub async fn get_balance(
    State(state): State<AppState>,
) -> Result<Json<BalanceResponse>, ChainPayError> {
    let mut treasury = BTreeMap::new();
    treasury.insert(
        Asset::Native.as_str().to_string(),
        state.chain.native_balance(state.treasury).await?.to_string(),
    );
    for (symbol, token_address) in &state.tokens {
        treasury.insert(
            symbol.clone(),
            state
                .chain
                .token_balance(*token_address, state.treasury)
                .await?
                .to_string(),
        );
    }

    let unswept = totals_by_asset(&state.store.list_sweep_candidates()?);
    let now = Utc::now().timestamp_millis();
    let pending = totals_by_asset(&state.store.list_pending(now, None)?);

    Ok(Json(BalanceResponse {
        treasury,
        unswept,
        pending,
    }))
}

fn totals_by_asset(invoices: &[Invoice]) -> BTreeMap<String, String> {
    let mut totals: BTreeMap<String, U256> = BTreeMap::new();
    for invoice in invoices {
        let entry = totals
            .entry(invoice.asset.as_str().to_string())
            .or_insert_with(U256::zero);
        *entry = entry.saturating_add(invoice.amount);
    }
    totals
        .into_iter()
        .map(|(asset, total)| (asset, total.to_string()))
        .collect()
}
