//! Typed configuration assembled from environment variables.
//!
//! The boot wrapper (CLI or shell script) populates the environment; this
//! module turns it into a `ProxyConfig` once, at startup. Invalid or missing
//! required values surface as `RouterError::Config` and abort with exit 1.

use crate::error::RouterError;
use crate::payment::wallet;
use std::fmt;
use std::time::Duration;

/// Base mainnet, the settlement chain for wallet-mode payments.
pub const DEFAULT_CHAIN_ID: u64 = 8453;

/// USDC contract on Base, the default payment asset.
pub const BASE_USDC_ASSET: &str = "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913";

const DEFAULT_PORT: u16 = 8402;
const DEFAULT_UPSTREAM_URL: &str = "https://api.blockrun.ai";
const DEFAULT_CLAWCREDIT_URL: &str = "https://api.claw.credit";
const DEFAULT_PIN_TTL_SECS: u64 = 600;
const DEFAULT_DEDUP_TTL_SECS: u64 = 30;
const DEFAULT_BALANCE_POLL_SECS: u64 = 60;
const DEFAULT_REQUEST_DEADLINE_SECS: u64 = 120;

/// Which payment backend attaches credentials to upstream calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentMode {
    Wallet,
    ClawCredit,
}

impl std::str::FromStr for PaymentMode {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "wallet" => Ok(PaymentMode::Wallet),
            "clawcredit" => Ok(PaymentMode::ClawCredit),
            other => Err(RouterError::Config(format!(
                "invalid BLOCKRUN_PAYMENT_MODE '{}', expected: wallet, clawcredit",
                other
            ))),
        }
    }
}

/// Wallet-mode payment context. Owned by the payment backend; the private
/// key must never be logged or serialized.
#[derive(Clone)]
pub struct WalletConfig {
    pub private_key: String,
    pub address: String,
    pub chain_id: u64,
    pub asset: String,
}

impl fmt::Debug for WalletConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletConfig")
            .field("private_key", &"<redacted>")
            .field("address", &self.address)
            .field("chain_id", &self.chain_id)
            .field("asset", &self.asset)
            .finish()
    }
}

/// ClawCredit custodial payment context. Same redaction rules.
#[derive(Clone)]
pub struct ClawCreditConfig {
    pub base_url: String,
    pub api_token: String,
    pub chain: String,
    pub asset: String,
}

impl fmt::Debug for ClawCreditConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClawCreditConfig")
            .field("base_url", &self.base_url)
            .field("api_token", &"<redacted>")
            .field("chain", &self.chain)
            .field("asset", &self.asset)
            .finish()
    }
}

/// Complete proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub payment_mode: PaymentMode,
    pub port: u16,
    pub upstream_url: String,
    pub wallet: Option<WalletConfig>,
    pub clawcredit: Option<ClawCreditConfig>,
    pub pin_ttl: Duration,
    pub dedup_ttl: Duration,
    pub balance_poll_interval: Duration,
    pub request_deadline: Duration,
}

impl ProxyConfig {
    /// Build from the process environment, generating and persisting a
    /// wallet key if none is configured.
    pub fn from_env() -> Result<Self, RouterError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source (tests pass a map).
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, RouterError> {
        let payment_mode: PaymentMode = get("BLOCKRUN_PAYMENT_MODE")
            .as_deref()
            .unwrap_or("wallet")
            .parse()?;

        let port = match get("BLOCKRUN_PROXY_PORT") {
            Some(raw) => raw.parse::<u16>().map_err(|_| {
                RouterError::Config(format!("invalid BLOCKRUN_PROXY_PORT '{}'", raw))
            })?,
            None => DEFAULT_PORT,
        };

        let upstream_url = get("BLOCKRUN_API_URL")
            .unwrap_or_else(|| DEFAULT_UPSTREAM_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let pin_ttl_secs = match get("BLOCKRUN_PIN_TTL_SECS") {
            Some(raw) => raw.parse::<u64>().map_err(|_| {
                RouterError::Config(format!("invalid BLOCKRUN_PIN_TTL_SECS '{}'", raw))
            })?,
            None => DEFAULT_PIN_TTL_SECS,
        };

        let wallet = match payment_mode {
            PaymentMode::Wallet => {
                let private_key = match get("BLOCKRUN_WALLET_KEY") {
                    Some(key) => key,
                    None => wallet::load_or_create_key()?,
                };
                let address = wallet::address_from_private_key(&private_key)?;
                Some(WalletConfig {
                    private_key,
                    address,
                    chain_id: DEFAULT_CHAIN_ID,
                    asset: BASE_USDC_ASSET.to_string(),
                })
            }
            PaymentMode::ClawCredit => None,
        };

        let clawcredit = match payment_mode {
            PaymentMode::ClawCredit => {
                let api_token = get("CLAWCREDIT_API_TOKEN").ok_or_else(|| {
                    RouterError::Config(
                        "CLAWCREDIT_API_TOKEN is required when BLOCKRUN_PAYMENT_MODE=clawcredit"
                            .to_string(),
                    )
                })?;
                Some(ClawCreditConfig {
                    base_url: get("CLAWCREDIT_BASE_URL")
                        .unwrap_or_else(|| DEFAULT_CLAWCREDIT_URL.to_string())
                        .trim_end_matches('/')
                        .to_string(),
                    api_token,
                    chain: get("CLAWCREDIT_PAYMENT_CHAIN")
                        .unwrap_or_else(|| "BASE".to_string())
                        .to_uppercase(),
                    asset: get("CLAWCREDIT_PAYMENT_ASSET")
                        .unwrap_or_else(|| BASE_USDC_ASSET.to_string()),
                })
            }
            PaymentMode::Wallet => None,
        };

        Ok(ProxyConfig {
            payment_mode,
            port,
            upstream_url,
            wallet,
            clawcredit,
            pin_ttl: Duration::from_secs(pin_ttl_secs),
            dedup_ttl: Duration::from_secs(DEFAULT_DEDUP_TTL_SECS),
            balance_poll_interval: Duration::from_secs(DEFAULT_BALANCE_POLL_SECS),
            request_deadline: Duration::from_secs(DEFAULT_REQUEST_DEADLINE_SECS),
        })
    }

    /// Wallet address for `/health`, if wallet mode is active.
    pub fn wallet_address(&self) -> Option<&str> {
        self.wallet.as_ref().map(|w| w.address.as_str())
    }
}
