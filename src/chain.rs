use crate::{error::ChainPayError, models::SignedDelegation};
use async_trait::async_trait;
use ethers::{
    abi::AbiEncode,
    prelude::abigen,
    providers::{Http, Middleware, Provider, ProviderError},
    signers::{LocalWallet, Signer},
    types::{
        Address, Bytes, Eip1559TransactionRequest, Filter, TransactionRequest, ValueOrArray, H256,
        U256,
    },
    utils::{keccak256, rlp::RlpStream},
};
use std::sync::Arc;

// Minimal ABI of the fixed sweep contract: drains the listed token balances
// of the calling (delegated) address into `recipient`.
abigen!(
    Sweeper,
    r#"[
        function sweep(address[] tokens, address recipient) external
    ]"#
);

abigen!(
    IERC20Balance,
    r#"[
        function balanceOf(address account) external view returns (uint256)
    ]"#
);

/// Gas limit used for the delegated sweep call. Estimating against the
/// derived address before the delegation is applied would undershoot, so a
/// fixed ceiling is used instead.
const SWEEP_GAS_LIMIT: u64 = 500_000;

/// EIP-7702 set-code transaction type.
const SWEEP_TX_TYPE: u8 = 0x04;

#[derive(Debug, Clone, Copy)]
pub struct NativeTransfer {
    pub to: Address,
    pub value: U256,
}

#[derive(Debug, Clone, Copy)]
pub struct TokenTransfer {
    pub to: Address,
    pub value: U256,
}

/// A native-transfer fee estimate: gas units and per-gas fee components.
#[derive(Debug, Clone, Copy)]
pub struct FeeEstimate {
    pub gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

impl FeeEstimate {
    /// Total fee reserved out of the invoice amount.
    pub fn total(&self) -> U256 {
        self.gas * (self.max_fee_per_gas + self.max_priority_fee_per_gas)
    }

    /// The 5% escalation step applied between native sweep attempts.
    pub fn bumped(&self) -> FeeEstimate {
        FeeEstimate {
            gas: self.gas,
            max_fee_per_gas: self.max_fee_per_gas * 105 / 100,
            max_priority_fee_per_gas: self.max_priority_fee_per_gas * 105 / 100,
        }
    }
}

/// Chain read/write surface consumed by the observer and the sweeper.
/// Implemented over JSON-RPC in production and by in-memory fakes in tests.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn head_height(&self) -> Result<u64, ChainPayError>;

    /// Recipient/value pairs of every transaction in the block. A block
    /// that cannot be fetched (including "not yet available") is an error.
    async fn block_transfers(&self, height: u64) -> Result<Vec<NativeTransfer>, ChainPayError>;

    /// Transfer events of one token contract within a single block,
    /// filtered server-side to the given recipient addresses.
    async fn token_transfers(
        &self,
        token: Address,
        height: u64,
        recipients: &[Address],
    ) -> Result<Vec<TokenTransfer>, ChainPayError>;

    async fn native_balance(&self, address: Address) -> Result<U256, ChainPayError>;

    async fn token_balance(&self, token: Address, address: Address)
        -> Result<U256, ChainPayError>;

    /// Current nonce of an account; used when signing a delegation.
    async fn transaction_count(&self, address: Address) -> Result<u64, ChainPayError>;

    async fn estimate_native_fee(
        &self,
        from: Address,
        to: Address,
    ) -> Result<FeeEstimate, ChainPayError>;

    /// Submit a native transfer signed by the (re-derived) one-time key.
    /// Submission failures surface as `TransferRejected`.
    async fn send_native_transfer(
        &self,
        wallet: LocalWallet,
        to: Address,
        value: U256,
        fee: &FeeEstimate,
    ) -> Result<H256, ChainPayError>;

    /// Call the sweep contract through the stored delegation: one type-4
    /// transaction from the treasury, addressed to the delegated one-time
    /// address, moving every listed token balance to `treasury`.
    async fn sweep_tokens(
        &self,
        delegation: &SignedDelegation,
        delegated: Address,
        tokens: &[Address],
        treasury: Address,
    ) -> Result<H256, ChainPayError>;
}

pub struct EthersChainClient {
    provider: Arc<Provider<Http>>,
    treasury_wallet: LocalWallet,
    chain_id: u64,
}

impl EthersChainClient {
    pub async fn new(
        rpc_url: &str,
        treasury_wallet: LocalWallet,
        chain_id: u64,
    ) -> anyhow::Result<Self> {
        let provider = Arc::new(Provider::<Http>::try_from(rpc_url)?);

        // Test connection
        let block_number = provider.get_block_number().await?;
        tracing::info!("Chain RPC connected, current block: {}", block_number);

        Ok(Self {
            provider,
            treasury_wallet: treasury_wallet.with_chain_id(chain_id),
            chain_id,
        })
    }

    pub fn treasury_address(&self) -> Address {
        self.treasury_wallet.address()
    }

    /// RLP body of the type-4 sweep transaction, without the outer
    /// signature fields.
    fn sweep_tx_payload(
        &self,
        stream: &mut RlpStream,
        delegation: &SignedDelegation,
        to: Address,
        calldata: &Vec<u8>,
        nonce: U256,
        max_fee: U256,
        max_priority: U256,
    ) {
        stream.append(&self.chain_id);
        stream.append(&nonce);
        stream.append(&max_priority);
        stream.append(&max_fee);
        stream.append(&U256::from(SWEEP_GAS_LIMIT));
        stream.append(&to);
        stream.append(&U256::zero());
        stream.append(calldata);
        stream.begin_list(0); // no access list
        stream.begin_list(1);
        stream.begin_list(6);
        stream.append(&delegation.chain_id);
        stream.append(&delegation.address);
        stream.append(&delegation.nonce);
        stream.append(&u64::from(delegation.y_parity));
        stream.append(&delegation.r);
        stream.append(&delegation.s);
    }

    fn encode_sweep_tx(
        &self,
        delegation: &SignedDelegation,
        to: Address,
        calldata: Vec<u8>,
        nonce: U256,
        max_fee: U256,
        max_priority: U256,
    ) -> Result<Vec<u8>, ChainPayError> {
        let mut unsigned = RlpStream::new_list(10);
        self.sweep_tx_payload(
            &mut unsigned,
            delegation,
            to,
            &calldata,
            nonce,
            max_fee,
            max_priority,
        );

        let mut preimage = vec![SWEEP_TX_TYPE];
        preimage.extend_from_slice(unsigned.as_raw());
        let signature = self
            .treasury_wallet
            .sign_hash(H256::from(keccak256(&preimage)))
            .map_err(|e| ChainPayError::WalletError(e.to_string()))?;

        let mut signed = RlpStream::new_list(13);
        self.sweep_tx_payload(
            &mut signed,
            delegation,
            to,
            &calldata,
            nonce,
            max_fee,
            max_priority,
        );
        signed.append(&(signature.v - 27));
        signed.append(&signature.r);
        signed.append(&signature.s);

        let mut raw = vec![SWEEP_TX_TYPE];
        raw.extend_from_slice(signed.as_raw());
        Ok(raw)
    }
}

#[async_trait]
impl ChainClient for EthersChainClient {
    async fn head_height(&self) -> Result<u64, ChainPayError> {
        Ok(self.provider.get_block_number().await?.as_u64())
    }

    async fn block_transfers(&self, height: u64) -> Result<Vec<NativeTransfer>, ChainPayError> {
        let block = self
            .provider
            .get_block_with_txs(height)
            .await?
            .ok_or_else(|| {
                ChainPayError::RpcError(ProviderError::CustomError(format!(
                    "block {} not available",
                    height
                )))
            })?;

        Ok(block
            .transactions
            .into_iter()
            .filter_map(|tx| {
                tx.to.map(|to| NativeTransfer {
                    to,
                    value: tx.value,
                })
            })
            .collect())
    }

    async fn token_transfers(
        &self,
        token: Address,
        height: u64,
        recipients: &[Address],
    ) -> Result<Vec<TokenTransfer>, ChainPayError> {
        let recipient_topics: Vec<Option<H256>> = recipients
            .iter()
            .map(|a| Some(H256::from(*a)))
            .collect();

        let filter = Filter::new()
            .address(token)
            .event("Transfer(address,address,uint256)")
            .topic2(ValueOrArray::Array(recipient_topics))
            .from_block(height)
            .to_block(height);

        let logs = self.provider.get_logs(&filter).await?;

        Ok(logs
            .into_iter()
            .filter_map(|log| {
                if log.topics.len() < 3 || log.data.len() < 32 {
                    return None;
                }
                Some(TokenTransfer {
                    to: Address::from(log.topics[2]),
                    value: U256::from_big_endian(&log.data[..32]),
                })
            })
            .collect())
    }

    async fn native_balance(&self, address: Address) -> Result<U256, ChainPayError> {
        Ok(self.provider.get_balance(address, None).await?)
    }

    async fn token_balance(
        &self,
        token: Address,
        address: Address,
    ) -> Result<U256, ChainPayError> {
        let calldata = BalanceOfCall { account: address }.encode();
        let tx = TransactionRequest::new().to(token).data(calldata);
        let result = self.provider.call(&tx.into(), None).await?;
        Ok(U256::from_big_endian(&result))
    }

    async fn transaction_count(&self, address: Address) -> Result<u64, ChainPayError> {
        Ok(self
            .provider
            .get_transaction_count(address, None)
            .await?
            .as_u64())
    }

    async fn estimate_native_fee(
        &self,
        from: Address,
        to: Address,
    ) -> Result<FeeEstimate, ChainPayError> {
        let tx = Eip1559TransactionRequest::new()
            .from(from)
            .to(to)
            .value(U256::zero());
        let gas = self.provider.estimate_gas(&tx.into(), None).await?;
        let (max_fee_per_gas, max_priority_fee_per_gas) =
            self.provider.estimate_eip1559_fees(None).await?;

        Ok(FeeEstimate {
            gas,
            max_fee_per_gas,
            max_priority_fee_per_gas,
        })
    }

    async fn send_native_transfer(
        &self,
        wallet: LocalWallet,
        to: Address,
        value: U256,
        fee: &FeeEstimate,
    ) -> Result<H256, ChainPayError> {
        use ethers::middleware::SignerMiddleware;

        let wallet = wallet.with_chain_id(self.chain_id);
        let client = SignerMiddleware::new(self.provider.clone(), wallet);

        let tx = Eip1559TransactionRequest::new()
            .to(to)
            .value(value)
            .gas(fee.gas)
            .max_fee_per_gas(fee.max_fee_per_gas)
            .max_priority_fee_per_gas(fee.max_priority_fee_per_gas);

        let pending = client
            .send_transaction(tx, None)
            .await
            .map_err(|e| ChainPayError::TransferRejected(e.to_string()))?;

        Ok(pending.tx_hash())
    }

    async fn sweep_tokens(
        &self,
        delegation: &SignedDelegation,
        delegated: Address,
        tokens: &[Address],
        treasury: Address,
    ) -> Result<H256, ChainPayError> {
        let calldata = SweepCall {
            tokens: tokens.to_vec(),
            recipient: treasury,
        }
        .encode();

        let nonce = self
            .provider
            .get_transaction_count(self.treasury_wallet.address(), None)
            .await?;
        let (max_fee, max_priority) = self.provider.estimate_eip1559_fees(None).await?;

        let raw = self.encode_sweep_tx(delegation, delegated, calldata, nonce, max_fee, max_priority)?;
        let pending = self.provider.send_raw_transaction(Bytes::from(raw)).await?;

        Ok(pending.tx_hash())
    }
}
