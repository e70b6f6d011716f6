use crate::{
    chain::ChainClient,
    error::ChainPayError,
    models::{Asset, Invoice},
    services::{latch::Latch, wallet::WalletService},
    store::InvoiceStore,
};
use anyhow::Result;
use ethers::types::Address;
use std::sync::Arc;
use std::time::Duration;

/// Native sweeps are attempted at most this many times per cycle, with the
/// fee estimate escalating 5% between attempts.
const MAX_SWEEP_ATTEMPTS: u32 = 5;

/// Consolidates fulfilled-but-unswept invoice funds into the treasury.
/// Runs on a much longer period than the observer; candidates that cannot
/// be swept this cycle are simply picked up again on the next one.
pub struct SweepEngine {
    chain: Arc<dyn ChainClient>,
    store: Arc<dyn InvoiceStore>,
    wallet: Arc<WalletService>,
    treasury: Address,
    /// Full configured token list, passed to every sweep-contract call.
    token_addresses: Vec<Address>,
    latch: Latch,
}

impl SweepEngine {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        store: Arc<dyn InvoiceStore>,
        wallet: Arc<WalletService>,
        treasury: Address,
        token_addresses: Vec<Address>,
    ) -> Self {
        Self {
            chain,
            store,
            wallet,
            treasury,
            token_addresses,
            latch: Latch::new(),
        }
    }

    pub async fn run(self: Arc<Self>, period: Duration) {
        tracing::info!("Sweep engine started, period {:?}", period);
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            self.tick().await;
        }
    }

    /// One sweep cycle. Failures are per-invoice: one bad candidate never
    /// blocks the rest, and nothing here is fatal to the process.
    pub async fn tick(&self) {
        let Some(_guard) = self.latch.try_acquire() else {
            tracing::debug!("Sweep still in progress, skipping tick");
            return;
        };

        let candidates = match self.store.list_sweep_candidates() {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::warn!("Sweep cycle abandoned, store unavailable: {e:#}");
                return;
            }
        };
        if candidates.is_empty() {
            return;
        }

        tracing::info!("Sweep cycle: {} candidate(s)", candidates.len());
        for invoice in candidates {
            if let Err(e) = self.sweep_one(&invoice).await {
                tracing::warn!(
                    invoice_id = %invoice.id,
                    "Sweep failed, will retry next cycle: {e:#}"
                );
            }
        }
    }

    async fn sweep_one(&self, invoice: &Invoice) -> Result<()> {
        match &invoice.asset {
            Asset::Native => self.sweep_native(invoice).await,
            Asset::Token(_) => self.sweep_token(invoice).await,
        }
    }

    /// Re-derive the one-time key and move `amount - fee` to treasury,
    /// escalating the fee on rejection up to `MAX_SWEEP_ATTEMPTS`.
    async fn sweep_native(&self, invoice: &Invoice) -> Result<()> {
        let (address, wallet) = self.wallet.derive(&invoice.id)?;
        let mut fee = self
            .chain
            .estimate_native_fee(address, self.treasury)
            .await?;

        for attempt in 1..=MAX_SWEEP_ATTEMPTS {
            let total_fee = fee.total();
            if total_fee >= invoice.amount {
                // Structurally unsweepable at current fees; stays a sweep
                // candidate until conditions change. Not retried here.
                tracing::warn!(
                    invoice_id = %invoice.id,
                    fee = %total_fee,
                    amount = %invoice.amount,
                    "Payout would be non-positive, invoice stuck"
                );
                return Ok(());
            }
            let payout = invoice.amount - total_fee;

            match self
                .chain
                .send_native_transfer(wallet.clone(), self.treasury, payout, &fee)
                .await
            {
                Ok(tx_hash) => {
                    self.mark_swept(invoice)?;
                    tracing::info!(
                        invoice_id = %invoice.id,
                        payout = %payout,
                        tx = ?tx_hash,
                        "Native sweep confirmed"
                    );
                    return Ok(());
                }
                Err(ChainPayError::TransferRejected(reason)) => {
                    tracing::warn!(
                        invoice_id = %invoice.id,
                        attempt,
                        "Native transfer rejected: {reason}"
                    );
                    fee = fee.bumped();
                }
                Err(e) => return Err(e.into()),
            }
        }

        tracing::warn!(
            invoice_id = %invoice.id,
            "Native sweep attempts exhausted, deferring to next cycle"
        );
        Ok(())
    }

    /// One delegated call moves every configured token balance held by the
    /// derived address; success sweeps the invoice regardless of how many
    /// of the listed tokens actually held anything.
    async fn sweep_token(&self, invoice: &Invoice) -> Result<()> {
        let delegation = invoice.authorization.as_ref().ok_or_else(|| {
            ChainPayError::InternalError(format!(
                "token invoice {} has no stored delegation",
                invoice.id
            ))
        })?;

        let tx_hash = self
            .chain
            .sweep_tokens(
                delegation,
                invoice.receiving_address,
                &self.token_addresses,
                self.treasury,
            )
            .await?;

        self.mark_swept(invoice)?;
        tracing::info!(
            invoice_id = %invoice.id,
            tx = ?tx_hash,
            "Token sweep confirmed"
        );
        Ok(())
    }

    fn mark_swept(&self, invoice: &Invoice) -> Result<()> {
        if !self.store.mark_swept(&invoice.id)? {
            // Funds moved but the flag didn't: either a concurrent sweep
            // (excluded by the latch) or a store inconsistency worth seeing.
            tracing::error!(
                invoice_id = %invoice.id,
                "Sweep succeeded but invoice was not marked swept"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{FeeEstimate, NativeTransfer, TokenTransfer};
    use crate::models::SignedDelegation;
    use crate::store::SqliteInvoiceStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use ethers::signers::LocalWallet;
    use ethers::types::{H256, U256};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    const TEST_MNEMONIC: &str =
        "test test test test test test test test test test test junk";
    const TREASURY: Address = Address::repeat_byte(0xaa);
    const TOKEN_A: Address = Address::repeat_byte(0x01);
    const TOKEN_B: Address = Address::repeat_byte(0x02);

    #[derive(Debug, Clone, PartialEq)]
    struct SentTransfer {
        to: Address,
        value: U256,
        total_fee: U256,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct SweepCallRecord {
        delegated: Address,
        tokens: Vec<Address>,
        treasury: Address,
        nonce: u64,
    }

    struct FakeChain {
        fee: FeeEstimate,
        /// Reject this many native submissions before accepting one.
        reject_first: AtomicU32,
        fail_sweep_for: Mutex<Vec<Address>>,
        sent: Mutex<Vec<SentTransfer>>,
        sweeps: Mutex<Vec<SweepCallRecord>>,
    }

    impl FakeChain {
        fn new(gas: u64, fee_per_gas: u64) -> Self {
            Self {
                fee: FeeEstimate {
                    gas: U256::from(gas),
                    max_fee_per_gas: U256::from(fee_per_gas),
                    max_priority_fee_per_gas: U256::zero(),
                },
                reject_first: AtomicU32::new(0),
                fail_sweep_for: Mutex::new(Vec::new()),
                sent: Mutex::new(Vec::new()),
                sweeps: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChainClient for FakeChain {
        async fn head_height(&self) -> Result<u64, ChainPayError> {
            Ok(0)
        }

        async fn block_transfers(
            &self,
            _height: u64,
        ) -> Result<Vec<NativeTransfer>, ChainPayError> {
            unimplemented!("not used by sweeper")
        }

        async fn token_transfers(
            &self,
            _token: Address,
            _height: u64,
            _recipients: &[Address],
        ) -> Result<Vec<TokenTransfer>, ChainPayError> {
            unimplemented!("not used by sweeper")
        }

        async fn native_balance(&self, _address: Address) -> Result<U256, ChainPayError> {
            unimplemented!("not used by sweeper")
        }

        async fn token_balance(
            &self,
            _token: Address,
            _address: Address,
        ) -> Result<U256, ChainPayError> {
            unimplemented!("not used by sweeper")
        }

        async fn transaction_count(&self, _address: Address) -> Result<u64, ChainPayError> {
            Ok(0)
        }

        async fn estimate_native_fee(
            &self,
            _from: Address,
            _to: Address,
        ) -> Result<FeeEstimate, ChainPayError> {
            Ok(self.fee)
        }

        async fn send_native_transfer(
            &self,
            _wallet: LocalWallet,
            to: Address,
            value: U256,
            fee: &FeeEstimate,
        ) -> Result<H256, ChainPayError> {
            if self
                .reject_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ChainPayError::TransferRejected("underpriced".to_string()));
            }
            self.sent.lock().unwrap().push(SentTransfer {
                to,
                value,
                total_fee: fee.total(),
            });
            Ok(H256::repeat_byte(0xfe))
        }

        async fn sweep_tokens(
            &self,
            delegation: &SignedDelegation,
            delegated: Address,
            tokens: &[Address],
            treasury: Address,
        ) -> Result<H256, ChainPayError> {
            if self.fail_sweep_for.lock().unwrap().contains(&delegated) {
                return Err(ChainPayError::RpcError(
                    ethers::providers::ProviderError::CustomError("revert".to_string()),
                ));
            }
            self.sweeps.lock().unwrap().push(SweepCallRecord {
                delegated,
                tokens: tokens.to_vec(),
                treasury,
                nonce: delegation.nonce,
            });
            Ok(H256::repeat_byte(0xfd))
        }
    }

    fn temp_store() -> (tempfile::TempDir, Arc<SqliteInvoiceStore>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store =
            SqliteInvoiceStore::open(dir.path().join("test.db"), 0).expect("open store");
        (dir, Arc::new(store))
    }

    fn wallet_service() -> Arc<WalletService> {
        Arc::new(
            WalletService::new(TEST_MNEMONIC.to_string(), 5115, Address::repeat_byte(0x42))
                .expect("valid mnemonic"),
        )
    }

    fn fulfilled_invoice(
        store: &SqliteInvoiceStore,
        wallet: &WalletService,
        id: &str,
        asset: Asset,
        amount: u64,
        delegation: Option<SignedDelegation>,
    ) -> Invoice {
        let (address, _) = wallet.derive(id).expect("derive");
        let now = Utc::now().timestamp_millis();
        let invoice = Invoice {
            id: id.to_string(),
            amount: U256::from(amount),
            asset,
            receiving_address: address,
            authorization: delegation,
            expiration: now + 900_000,
            description: None,
            fulfilled: false,
            swept: false,
            created_at: now,
        };
        store.insert(&invoice).expect("insert");
        assert!(store.mark_fulfilled(id, now).expect("fulfill"));
        store.get(id).expect("get").expect("exists")
    }

    fn engine(chain: Arc<FakeChain>, store: Arc<SqliteInvoiceStore>) -> SweepEngine {
        SweepEngine::new(
            chain,
            store,
            wallet_service(),
            TREASURY,
            vec![TOKEN_A, TOKEN_B],
        )
    }

    #[tokio::test]
    async fn native_sweep_transfers_amount_minus_fee() {
        // fee = 50_000 total against a 1_000_000 invoice.
        let chain = Arc::new(FakeChain::new(50_000, 1));
        let (_dir, store) = temp_store();
        let wallet = wallet_service();
        fulfilled_invoice(&store, &wallet, "inv_n1", Asset::Native, 1_000_000, None);

        engine(chain.clone(), store.clone()).tick().await;

        let sent = chain.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, TREASURY);
        assert_eq!(sent[0].value, U256::from(950_000u64));

        let stored = store.get("inv_n1").expect("get").expect("exists");
        assert!(stored.swept);
        assert!(stored.fulfilled);
    }

    #[tokio::test]
    async fn native_sweep_escalates_fee_then_succeeds() {
        // base total fee = 100 gas * 100 per gas = 10_000.
        let chain = Arc::new(FakeChain::new(100, 100));
        chain.reject_first.store(2, Ordering::SeqCst);
        let (_dir, store) = temp_store();
        let wallet = wallet_service();
        fulfilled_invoice(&store, &wallet, "inv_n2", Asset::Native, 1_000_000, None);

        engine(chain.clone(), store.clone()).tick().await;

        let sent = chain.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        // Two 5% bumps of the per-gas fee: 100 -> 105 -> 110.
        let expected_fee = U256::from(100u64 * 110);
        assert_eq!(sent[0].total_fee, expected_fee);
        assert_eq!(sent[0].value, U256::from(1_000_000u64) - expected_fee);

        assert!(store.get("inv_n2").expect("get").expect("exists").swept);
    }

    #[tokio::test]
    async fn native_sweep_gives_up_after_bounded_attempts() {
        let chain = Arc::new(FakeChain::new(10_000, 1));
        chain.reject_first.store(u32::MAX, Ordering::SeqCst);
        let (_dir, store) = temp_store();
        let wallet = wallet_service();
        fulfilled_invoice(&store, &wallet, "inv_n3", Asset::Native, 1_000_000, None);

        engine(chain.clone(), store.clone()).tick().await;

        assert!(chain.sent.lock().unwrap().is_empty());
        // 5 attempts consumed, none beyond.
        assert_eq!(
            u32::MAX - chain.reject_first.load(Ordering::SeqCst),
            MAX_SWEEP_ATTEMPTS
        );

        let stored = store.get("inv_n3").expect("get").expect("exists");
        assert!(!stored.swept);
        assert!(stored.is_sweep_candidate());
    }

    #[tokio::test]
    async fn unprofitable_invoice_is_skipped_not_swept() {
        // fee = 2_000_000 total against a 1_000_000 invoice.
        let chain = Arc::new(FakeChain::new(2_000_000, 1));
        let (_dir, store) = temp_store();
        let wallet = wallet_service();
        fulfilled_invoice(&store, &wallet, "inv_n4", Asset::Native, 1_000_000, None);

        engine(chain.clone(), store.clone()).tick().await;

        assert!(chain.sent.lock().unwrap().is_empty());
        let stored = store.get("inv_n4").expect("get").expect("exists");
        assert!(stored.is_sweep_candidate());
    }

    #[tokio::test]
    async fn token_sweep_passes_full_token_list_and_delegation() {
        let chain = Arc::new(FakeChain::new(10_000, 1));
        let (_dir, store) = temp_store();
        let wallet = wallet_service();

        let (_, one_time) = wallet.derive("inv_t1").expect("derive");
        let delegation = wallet.sign_delegation(&one_time, 3).expect("sign");
        let invoice = fulfilled_invoice(
            &store,
            &wallet,
            "inv_t1",
            Asset::Token("USDC".to_string()),
            1_000,
            Some(delegation),
        );

        engine(chain.clone(), store.clone()).tick().await;

        let sweeps = chain.sweeps.lock().unwrap().clone();
        assert_eq!(sweeps.len(), 1);
        assert_eq!(sweeps[0].delegated, invoice.receiving_address);
        assert_eq!(sweeps[0].tokens, vec![TOKEN_A, TOKEN_B]);
        assert_eq!(sweeps[0].treasury, TREASURY);
        assert_eq!(sweeps[0].nonce, 3);

        assert!(store.get("inv_t1").expect("get").expect("exists").swept);
    }

    #[tokio::test]
    async fn failed_candidate_does_not_block_the_rest() {
        let chain = Arc::new(FakeChain::new(10_000, 1));
        let (_dir, store) = temp_store();
        let wallet = wallet_service();

        let (failing_addr, failing_wallet) = wallet.derive("inv_t2").expect("derive");
        chain.fail_sweep_for.lock().unwrap().push(failing_addr);
        let bad_delegation = wallet.sign_delegation(&failing_wallet, 0).expect("sign");
        fulfilled_invoice(
            &store,
            &wallet,
            "inv_t2",
            Asset::Token("USDC".to_string()),
            1_000,
            Some(bad_delegation),
        );
        fulfilled_invoice(&store, &wallet, "inv_n5", Asset::Native, 1_000_000, None);

        engine(chain.clone(), store.clone()).tick().await;

        assert!(!store.get("inv_t2").expect("get").expect("exists").swept);
        assert!(store.get("inv_n5").expect("get").expect("exists").swept);
    }

    #[tokio::test]
    async fn swept_invoices_are_not_candidates_again() {
        let chain = Arc::new(FakeChain::new(10_000, 1));
        let (_dir, store) = temp_store();
        let wallet = wallet_service();
        fulfilled_invoice(&store, &wallet, "inv_n6", Asset::Native, 1_000_000, None);

        let engine = engine(chain.clone(), store.clone());
        engine.tick().await;
        engine.tick().await;

        assert_eq!(chain.sent.lock().unwrap().len(), 1);
    }
}
