use crate::{error::ChainPayError, models::SignedDelegation};
use ethers::{
    signers::{coins_bip39::English, LocalWallet, MnemonicBuilder, Signer},
    types::{Address, H256},
    utils::{keccak256, rlp::RlpStream},
};
use sha2::{Digest, Sha256};

/// Size of the derivation index space. An invoice id is hashed and reduced
/// modulo this value, so two ids can collide on the same child key; see
/// DESIGN.md for why that is left unhandled.
pub const DERIVATION_INDEX_SPACE: u32 = 1_000_000;

/// EIP-7702 authorization signing domain.
const DELEGATION_MAGIC: u8 = 0x05;

/// Deterministic one-time key derivation and delegation signing over a
/// single master mnemonic. Treasury is child 0; invoices map to children
/// `1..DERIVATION_INDEX_SPACE` of the same tree.
pub struct WalletService {
    mnemonic: String,
    chain_id: u64,
    sweep_contract: Address,
}

impl WalletService {
    pub fn new(
        mnemonic: String,
        chain_id: u64,
        sweep_contract: Address,
    ) -> anyhow::Result<Self> {
        let service = Self {
            mnemonic,
            chain_id,
            sweep_contract,
        };
        // Fail fast on an invalid phrase.
        let treasury = service.treasury()?;
        tracing::info!("Treasury address: {:#x}", treasury.address());
        Ok(service)
    }

    /// The treasury keypair (derivation index 0).
    pub fn treasury(&self) -> Result<LocalWallet, ChainPayError> {
        self.wallet_at(0)
    }

    pub fn sweep_contract(&self) -> Address {
        self.sweep_contract
    }

    /// Bounded derivation index for an invoice id: first four bytes of
    /// SHA-256(id), big-endian, modulo `DERIVATION_INDEX_SPACE`.
    pub fn derivation_index(id: &str) -> u32 {
        let digest = Sha256::digest(id.as_bytes());
        let mut prefix = [0u8; 4];
        prefix.copy_from_slice(&digest[..4]);
        u32::from_be_bytes(prefix) % DERIVATION_INDEX_SPACE
    }

    /// Derive the one-time receiving keypair for an invoice id. Pure: the
    /// same id and mnemonic always yield the same address, which is how the
    /// sweeper recovers the signing key without ever persisting it.
    pub fn derive(&self, id: &str) -> Result<(Address, LocalWallet), ChainPayError> {
        let wallet = self.wallet_at(Self::derivation_index(id))?;
        Ok((wallet.address(), wallet))
    }

    /// Sign a delegation authorizing the configured sweep contract to act
    /// for `wallet`'s address: the EIP-7702 tuple over
    /// `keccak256(0x05 ‖ rlp([chain_id, contract, nonce]))`.
    pub fn sign_delegation(
        &self,
        wallet: &LocalWallet,
        nonce: u64,
    ) -> Result<SignedDelegation, ChainPayError> {
        let mut stream = RlpStream::new_list(3);
        stream.append(&self.chain_id);
        stream.append(&self.sweep_contract);
        stream.append(&nonce);

        let mut preimage = vec![DELEGATION_MAGIC];
        preimage.extend_from_slice(stream.as_raw());

        let signature = wallet
            .sign_hash(H256::from(keccak256(&preimage)))
            .map_err(|e| ChainPayError::WalletError(e.to_string()))?;

        Ok(SignedDelegation {
            chain_id: self.chain_id,
            address: self.sweep_contract,
            nonce,
            y_parity: (signature.v - 27) as u8,
            r: signature.r,
            s: signature.s,
        })
    }

    fn wallet_at(&self, index: u32) -> Result<LocalWallet, ChainPayError> {
        MnemonicBuilder::<English>::default()
            .phrase(self.mnemonic.as_str())
            .index(index)
            .map_err(|e| ChainPayError::WalletError(e.to_string()))?
            .build()
            .map_err(|e| ChainPayError::WalletError(e.to_string()))
    }
}
