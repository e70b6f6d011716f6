use anyhow::{bail, Context, Result};
use ethers::types::Address;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    // Chain
    pub rpc_url: String,
    pub chain_id: u64,
    pub mnemonic: String,
    pub sweep_contract: Address,

    /// Configured token assets: symbol -> ERC-20 contract address.
    /// Sorted by symbol so the sweep-contract token list is stable.
    pub tokens: Vec<(String, Address)>,

    // Scanning & sweeping
    pub start_block: u64,
    pub observer_interval_secs: u64,
    pub sweep_interval_secs: u64,

    // Invoices
    pub invoice_ttl_secs: u64,

    // Storage
    pub db_path: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .context("Invalid PORT")?,

            rpc_url: std::env::var("RPC_URL").context("RPC_URL required")?,
            chain_id: std::env::var("CHAIN_ID")
                .context("CHAIN_ID required")?
                .parse()
                .context("Invalid CHAIN_ID")?,
            mnemonic: std::env::var("MNEMONIC").context("MNEMONIC required")?,
            sweep_contract: Self::parse_address("SWEEP_CONTRACT_ADDRESS")?,

            tokens: Self::parse_tokens()?,

            start_block: std::env::var("START_BLOCK")
                .unwrap_or_else(|_| "0".to_string())
                .parse()
                .context("Invalid START_BLOCK")?,
            observer_interval_secs: std::env::var("OBSERVER_INTERVAL_SECS")
                .unwrap_or_else(|_| "2".to_string())
                .parse()
                .context("Invalid OBSERVER_INTERVAL_SECS")?,
            sweep_interval_secs: std::env::var("SWEEP_INTERVAL_SECS")
                .unwrap_or_else(|_| "86400".to_string())
                .parse()
                .context("Invalid SWEEP_INTERVAL_SECS")?,

            invoice_ttl_secs: std::env::var("INVOICE_TTL_SECS")
                .unwrap_or_else(|_| "900".to_string())
                .parse()
                .context("Invalid INVOICE_TTL_SECS")?,

            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "chainpay.db".to_string()),
        };

        config.validate()?;
        Ok(config)
    }

    /// TOKENS is a comma-separated list of `SYMBOL=0xaddress` pairs.
    fn parse_tokens() -> Result<Vec<(String, Address)>> {
        Self::parse_tokens_from(&std::env::var("TOKENS").unwrap_or_default())
    }

    fn parse_tokens_from(raw: &str) -> Result<Vec<(String, Address)>> {
        let mut tokens = Vec::new();
        for entry in raw.split(',').filter(|s| !s.trim().is_empty()) {
            let (symbol, addr) = entry
                .split_once('=')
                .with_context(|| format!("Invalid TOKENS entry: {}", entry))?;
            let address = Address::from_str(addr.trim())
                .with_context(|| format!("Invalid token address for {}", symbol))?;
            tokens.push((symbol.trim().to_uppercase(), address));
        }
        tokens.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(tokens)
    }

    fn parse_address(var: &str) -> Result<Address> {
        let addr_str = std::env::var(var).with_context(|| format!("{} required", var))?;
        Address::from_str(&addr_str).with_context(|| format!("Invalid address for {}", var))
    }

    pub fn token_address(&self, symbol: &str) -> Option<Address> {
        self.tokens
            .iter()
            .find(|(s, _)| s == symbol)
            .map(|(_, a)| *a)
    }

    pub fn token_addresses(&self) -> Vec<Address> {
        self.tokens.iter().map(|(_, a)| *a).collect()
    }

    fn validate(&self) -> Result<()> {
        if !self.rpc_url.starts_with("http") {
            bail!("RPC_URL must be HTTP(S) URL");
        }
        if self.mnemonic.split_whitespace().count() < 12 {
            bail!("MNEMONIC must be a BIP-39 phrase of at least 12 words");
        }
        if self.observer_interval_secs == 0 || self.sweep_interval_secs == 0 {
            bail!("poll intervals must be non-zero");
        }

        tracing::info!(
            "Configuration validated: chain_id={}, {} token(s) configured",
            self.chain_id,
            self.tokens.len()
        );

        Ok(())
    }
}
