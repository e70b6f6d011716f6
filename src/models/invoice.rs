use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};

/// The asset an invoice is denominated in: the chain's native coin, or a
/// configured ERC-20 token identified by symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Asset {
    Native,
    Token(String),
}

impl Asset {
    /// Storage/API representation: "NATIVE" for the native coin, otherwise
    /// the token symbol.
    pub fn as_str(&self) -> &str {
        match self {
            Asset::Native => "NATIVE",
            Asset::Token(symbol) => symbol,
        }
    }

    pub fn parse(s: &str) -> Asset {
        let upper = s.to_uppercase();
        if upper == "NATIVE" {
            Asset::Native
        } else {
            Asset::Token(upper)
        }
    }
}

impl std::fmt::Display for Asset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signed grant allowing the fixed sweep contract to act on behalf of a
/// derived one-time address (EIP-7702 authorization tuple).
///
/// Stored as a structured record with fixed-width fields so it can be
/// replayed verbatim at sweep time, however much later that happens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedDelegation {
    pub chain_id: u64,
    /// The sweep contract being authorized.
    pub address: Address,
    /// Nonce of the delegating account at signing time.
    pub nonce: u64,
    pub y_parity: u8,
    pub r: U256,
    pub s: U256,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    /// Requested amount in the smallest on-chain unit.
    pub amount: U256,
    pub asset: Asset,
    /// One-time receiving address, derived deterministically from `id`.
    pub receiving_address: Address,
    /// Present for token invoices; native sweeps re-derive the signing key.
    pub authorization: Option<SignedDelegation>,
    /// Absolute unix-millisecond deadline for payment.
    pub expiration: i64,
    pub description: Option<String>,
    pub fulfilled: bool,
    pub swept: bool,
    /// Unix-millisecond creation time.
    pub created_at: i64,
}

impl Invoice {
    /// Eligible for transfer matching: unfulfilled and not yet expired.
    pub fn is_pending(&self, now_ms: i64) -> bool {
        !self.fulfilled && now_ms <= self.expiration
    }

    /// Eligible for sweeping: fulfilled but not yet consolidated.
    pub fn is_sweep_candidate(&self) -> bool {
        self.fulfilled && !self.swept
    }
}
