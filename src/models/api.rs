use chrono::Utc;
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Deserialize)]
pub struct CreateInvoiceRequest {
    /// Amount in the smallest on-chain unit, as a decimal string.
    pub amount: String,
    pub asset: String,
    pub description: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateInvoiceResponse {
    pub invoice_id: String,
    pub amount: String,
    pub asset: String,
    pub receiving_address: Address,
    pub expiration: i64,
    pub description: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InvoiceStatus {
    pub invoice_id: String,
    pub amount: String,
    pub asset: String,
    pub receiving_address: Address,
    pub expiration: i64,
    pub description: Option<String>,
    pub fulfilled: bool,
    pub swept: bool,
    pub created_at: i64,
}

#[derive(Debug, Deserialize)]
pub struct ListInvoicesQuery {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    pub asset: Option<String>,
    pub fulfilled: Option<bool>,
    pub swept: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct ListInvoicesResponse {
    pub invoices: Vec<InvoiceStatus>,
    pub page: u32,
    pub page_size: u32,
}

/// Treasury holdings plus aggregate unswept/pending amounts per asset,
/// all in smallest-unit decimal strings.
#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub treasury: BTreeMap<String, String>,
    pub unswept: BTreeMap<String, String>,
    pub pending: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub store: bool,
    pub chain_rpc: bool,
    pub cursor: u64,
    pub uptime_seconds: u64,
    pub timestamp: chrono::DateTime<Utc>,
}
