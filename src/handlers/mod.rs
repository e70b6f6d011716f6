pub mod balance;
pub mod health;
pub mod invoice;

pub use balance::*;
pub use health::*;
pub use invoice::*;

use crate::{chain::ChainClient, services::WalletService, store::InvoiceStore};
use ethers::types::Address;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn InvoiceStore>,
    pub chain: Arc<dyn ChainClient>,
    pub wallet: Arc<WalletService>,
    pub treasury: Address,
    /// Configured token assets, symbol -> contract address.
    pub tokens: Vec<(String, Address)>,
    pub invoice_ttl_ms: i64,
    pub started_at: Instant,
}
