use crate::{
    chain::ChainClient,
    models::{Asset, Invoice},
    services::latch::Latch,
    store::InvoiceStore,
};
use anyhow::Result;
use chrono::Utc;
use ethers::types::Address;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Scans the chain block by block, matching incoming transfers against
/// pending invoices and flipping them to fulfilled. The persisted cursor
/// makes the scan resumable across restarts; the latch keeps cycles from
/// overlapping when a tick outlasts its period.
pub struct ChainObserver {
    chain: Arc<dyn ChainClient>,
    store: Arc<dyn InvoiceStore>,
    /// Configured token assets, symbol -> contract address.
    tokens: Vec<(String, Address)>,
    latch: Latch,
}

impl ChainObserver {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        store: Arc<dyn InvoiceStore>,
        tokens: Vec<(String, Address)>,
    ) -> Self {
        Self {
            chain,
            store,
            tokens,
            latch: Latch::new(),
        }
    }

    pub async fn run(self: Arc<Self>, period: Duration) {
        tracing::info!("Chain observer started, period {:?}", period);
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            self.tick().await;
        }
    }

    /// One scan cycle. Never propagates an error: a failed cycle is logged
    /// and retried from the committed cursor on the next tick.
    pub async fn tick(&self) {
        let Some(_guard) = self.latch.try_acquire() else {
            tracing::debug!("Scan still in progress, skipping tick");
            return;
        };

        if let Err(e) = self.scan().await {
            tracing::warn!("Scan cycle abandoned: {e:#}");
        }
    }

    async fn scan(&self) -> Result<()> {
        let head = self.chain.head_height().await?;
        let cursor = self.store.cursor()?;
        if head <= cursor {
            return Ok(());
        }

        tracing::debug!("Scanning blocks {}..={}", cursor + 1, head);
        for height in (cursor + 1)..=head {
            // An error mid-range stops the cycle; the cursor keeps whatever
            // was committed and the next tick resumes after it.
            self.process_block(height).await?;
        }
        Ok(())
    }

    async fn process_block(&self, height: u64) -> Result<()> {
        let transfers = self.chain.block_transfers(height).await?;

        // Progress commits before matching. A crash between this write and
        // the matching below loses that block's matches; accepted tradeoff
        // to keep restarts from rescanning the whole chain.
        self.store.set_cursor(height)?;

        let now_ms = Utc::now().timestamp_millis();
        let (mut native, mut by_token) = self.pending_by_address(now_ms)?;
        if native.is_empty() && by_token.is_empty() {
            return Ok(());
        }

        for transfer in transfers {
            let Some(invoice) = native.get(&transfer.to) else {
                continue;
            };
            if transfer.value >= invoice.amount {
                self.fulfill(invoice, height, now_ms)?;
                native.remove(&transfer.to);
            }
        }

        for (symbol, token_address) in &self.tokens {
            let Some(pending) = by_token.get_mut(symbol) else {
                continue;
            };
            if pending.is_empty() {
                continue;
            }

            let recipients: Vec<Address> = pending.keys().copied().collect();
            let events = self
                .chain
                .token_transfers(*token_address, height, &recipients)
                .await?;

            for event in events {
                let Some(invoice) = pending.get(&event.to) else {
                    continue;
                };
                if event.value >= invoice.amount {
                    self.fulfill(invoice, height, now_ms)?;
                    pending.remove(&event.to);
                }
            }
        }

        Ok(())
    }

    /// Pending invoices partitioned for matching: native ones keyed by
    /// address, token ones keyed by symbol then address.
    #[allow(clippy::type_complexity)]
    fn pending_by_address(
        &self,
        now_ms: i64,
    ) -> Result<(
        HashMap<Address, Invoice>,
        HashMap<String, HashMap<Address, Invoice>>,
    )> {
        let mut native = HashMap::new();
        let mut by_token: HashMap<String, HashMap<Address, Invoice>> = HashMap::new();

        for invoice in self.store.list_pending(now_ms, None)? {
            match &invoice.asset {
                Asset::Native => {
                    native.insert(invoice.receiving_address, invoice);
                }
                Asset::Token(symbol) => {
                    by_token
                        .entry(symbol.clone())
                        .or_default()
                        .insert(invoice.receiving_address, invoice);
                }
            }
        }
        Ok((native, by_token))
    }

    fn fulfill(&self, invoice: &Invoice, height: u64, now_ms: i64) -> Result<()> {
        // Conditional update: a lost race (already fulfilled, or expired
        // since the pending read) is a no-op, not an error.
        if self.store.mark_fulfilled(&invoice.id, now_ms)? {
            tracing::info!(
                invoice_id = %invoice.id,
                asset = %invoice.asset,
                block = height,
                "Invoice fulfilled"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{FeeEstimate, NativeTransfer, TokenTransfer};
    use crate::error::ChainPayError;
    use crate::models::Asset;
    use crate::store::SqliteInvoiceStore;
    use async_trait::async_trait;
    use ethers::signers::LocalWallet;
    use ethers::types::{H256, U256};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeChain {
        head: AtomicU64,
        blocks: Mutex<HashMap<u64, Vec<NativeTransfer>>>,
        token_events: Mutex<HashMap<(Address, u64), Vec<TokenTransfer>>>,
        broken_blocks: Mutex<Vec<u64>>,
    }

    impl FakeChain {
        fn set_head(&self, height: u64) {
            self.head.store(height, Ordering::SeqCst);
        }

        fn add_transfer(&self, height: u64, to: Address, value: u64) {
            self.blocks.lock().unwrap().entry(height).or_default().push(
                NativeTransfer {
                    to,
                    value: U256::from(value),
                },
            );
        }

        fn add_token_event(&self, token: Address, height: u64, to: Address, value: u64) {
            self.token_events
                .lock()
                .unwrap()
                .entry((token, height))
                .or_default()
                .push(TokenTransfer {
                    to,
                    value: U256::from(value),
                });
        }

        fn break_block(&self, height: u64) {
            self.broken_blocks.lock().unwrap().push(height);
        }

        fn fix_block(&self, height: u64) {
            self.broken_blocks.lock().unwrap().retain(|h| *h != height);
        }
    }

    #[async_trait]
    impl ChainClient for FakeChain {
        async fn head_height(&self) -> Result<u64, ChainPayError> {
            Ok(self.head.load(Ordering::SeqCst))
        }

        async fn block_transfers(
            &self,
            height: u64,
        ) -> Result<Vec<NativeTransfer>, ChainPayError> {
            if self.broken_blocks.lock().unwrap().contains(&height) {
                return Err(ChainPayError::InternalError(format!(
                    "block {height} unavailable"
                )));
            }
            Ok(self
                .blocks
                .lock()
                .unwrap()
                .get(&height)
                .cloned()
                .unwrap_or_default())
        }

        async fn token_transfers(
            &self,
            token: Address,
            height: u64,
            recipients: &[Address],
        ) -> Result<Vec<TokenTransfer>, ChainPayError> {
            Ok(self
                .token_events
                .lock()
                .unwrap()
                .get(&(token, height))
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .filter(|e| recipients.contains(&e.to))
                .collect())
        }

        async fn native_balance(&self, _address: Address) -> Result<U256, ChainPayError> {
            unimplemented!("not used by observer")
        }

        async fn token_balance(
            &self,
            _token: Address,
            _address: Address,
        ) -> Result<U256, ChainPayError> {
            unimplemented!("not used by observer")
        }

        async fn transaction_count(&self, _address: Address) -> Result<u64, ChainPayError> {
            unimplemented!("not used by observer")
        }

        async fn estimate_native_fee(
            &self,
            _from: Address,
            _to: Address,
        ) -> Result<FeeEstimate, ChainPayError> {
            unimplemented!("not used by observer")
        }

        async fn send_native_transfer(
            &self,
            _wallet: LocalWallet,
            _to: Address,
            _value: U256,
            _fee: &FeeEstimate,
        ) -> Result<H256, ChainPayError> {
            unimplemented!("not used by observer")
        }

        async fn sweep_tokens(
            &self,
            _delegation: &crate::models::SignedDelegation,
            _delegated: Address,
            _tokens: &[Address],
            _treasury: Address,
        ) -> Result<H256, ChainPayError> {
            unimplemented!("not used by observer")
        }
    }

    fn temp_store() -> (tempfile::TempDir, Arc<SqliteInvoiceStore>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store =
            SqliteInvoiceStore::open(dir.path().join("test.db"), 0).expect("open store");
        (dir, Arc::new(store))
    }

    fn invoice(id: &str, asset: Asset, address: Address, amount: u64, expiration: i64) -> Invoice {
        Invoice {
            id: id.to_string(),
            amount: U256::from(amount),
            asset,
            receiving_address: address,
            authorization: None,
            expiration,
            description: None,
            fulfilled: false,
            swept: false,
            created_at: Utc::now().timestamp_millis(),
        }
    }

    fn far_future() -> i64 {
        Utc::now().timestamp_millis() + 900_000
    }

    const TOKEN: Address = Address::repeat_byte(0x77);

    fn observer(chain: Arc<FakeChain>, store: Arc<SqliteInvoiceStore>) -> ChainObserver {
        ChainObserver::new(chain, store, vec![("USDC".to_string(), TOKEN)])
    }

    #[tokio::test]
    async fn native_transfer_fulfills_invoice() {
        let chain = Arc::new(FakeChain::default());
        let (_dir, store) = temp_store();

        let address = Address::repeat_byte(0x11);
        store
            .insert(&invoice("inv_a", Asset::Native, address, 1_000_000, far_future()))
            .expect("insert");

        chain.set_head(3);
        chain.add_transfer(3, address, 2_000_000);

        observer(chain, store.clone()).tick().await;

        let stored = store.get("inv_a").expect("get").expect("exists");
        assert!(stored.fulfilled);
        assert!(!stored.swept);
        assert_eq!(store.cursor().expect("cursor"), 3);
    }

    #[tokio::test]
    async fn underpaid_transfer_does_not_fulfill() {
        let chain = Arc::new(FakeChain::default());
        let (_dir, store) = temp_store();

        let address = Address::repeat_byte(0x12);
        store
            .insert(&invoice("inv_b", Asset::Native, address, 1_000_000, far_future()))
            .expect("insert");

        chain.set_head(1);
        chain.add_transfer(1, address, 999_999);

        observer(chain, store.clone()).tick().await;

        let stored = store.get("inv_b").expect("get").expect("exists");
        assert!(!stored.fulfilled);
        assert_eq!(store.cursor().expect("cursor"), 1);
    }

    #[tokio::test]
    async fn repeated_qualifying_transfers_fulfill_exactly_once() {
        let chain = Arc::new(FakeChain::default());
        let (_dir, store) = temp_store();

        let address = Address::repeat_byte(0x13);
        store
            .insert(&invoice("inv_c", Asset::Native, address, 500, far_future()))
            .expect("insert");

        chain.set_head(2);
        chain.add_transfer(1, address, 600);
        chain.add_transfer(1, address, 700);
        chain.add_transfer(2, address, 800);

        let observer = observer(chain, store.clone());
        observer.tick().await;
        observer.tick().await;

        let stored = store.get("inv_c").expect("get").expect("exists");
        assert!(stored.fulfilled);
        assert_eq!(store.cursor().expect("cursor"), 2);
    }

    #[tokio::test]
    async fn expired_invoice_is_never_fulfilled() {
        let chain = Arc::new(FakeChain::default());
        let (_dir, store) = temp_store();

        let address = Address::repeat_byte(0x14);
        let expired = Utc::now().timestamp_millis() - 1_000;
        store
            .insert(&invoice("inv_d", Asset::Native, address, 100, expired))
            .expect("insert");

        chain.set_head(1);
        chain.add_transfer(1, address, 100_000);

        observer(chain, store.clone()).tick().await;

        let stored = store.get("inv_d").expect("get").expect("exists");
        assert!(!stored.fulfilled);
    }

    #[tokio::test]
    async fn token_event_fulfills_token_invoice() {
        let chain = Arc::new(FakeChain::default());
        let (_dir, store) = temp_store();

        let address = Address::repeat_byte(0x15);
        store
            .insert(&invoice(
                "inv_e",
                Asset::Token("USDC".to_string()),
                address,
                1_000,
                far_future(),
            ))
            .expect("insert");

        chain.set_head(5);
        chain.add_token_event(TOKEN, 5, address, 1_500);

        observer(chain, store.clone()).tick().await;

        let stored = store.get("inv_e").expect("get").expect("exists");
        assert!(stored.fulfilled);
    }

    #[tokio::test]
    async fn broken_block_stops_cycle_and_resumes_next_tick() {
        let chain = Arc::new(FakeChain::default());
        let (_dir, store) = temp_store();

        let address = Address::repeat_byte(0x16);
        store
            .insert(&invoice("inv_f", Asset::Native, address, 100, far_future()))
            .expect("insert");

        chain.set_head(4);
        chain.add_transfer(4, address, 100);
        chain.break_block(3);

        let observer = observer(chain.clone(), store.clone());
        observer.tick().await;

        // Blocks 1 and 2 committed, 3 failed, 4 never reached.
        assert_eq!(store.cursor().expect("cursor"), 2);
        assert!(!store.get("inv_f").expect("get").expect("exists").fulfilled);

        chain.fix_block(3);
        observer.tick().await;

        assert_eq!(store.cursor().expect("cursor"), 4);
        assert!(store.get("inv_f").expect("get").expect("exists").fulfilled);
    }

    #[tokio::test]
    async fn head_behind_cursor_is_a_no_op() {
        let chain = Arc::new(FakeChain::default());
        let (_dir, store) = temp_store();

        store.set_cursor(10).expect("set cursor");
        chain.set_head(7);

        observer(chain, store.clone()).tick().await;

        assert_eq!(store.cursor().expect("cursor"), 10);
    }
}
