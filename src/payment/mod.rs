//! Payment attachment for upstream calls.
//!
//! Two concrete strategies behind one tagged variant, selected once at
//! startup: `Wallet` signs an x402 payment header and calls the inference
//! endpoint directly; `ClawCredit` wraps the whole request in a custodial
//! pay-call envelope. No dynamic plugin loading.

pub mod clawcredit;
pub mod wallet;

pub use clawcredit::ClawCreditBackend;
pub use wallet::WalletBackend;

use crate::config::{PaymentMode, ProxyConfig};
use crate::error::RouterError;
use serde_json::Value;
use std::time::Duration;

/// Buffered reply from one upstream attempt, before outcome classification.
#[derive(Debug, Clone)]
pub struct UpstreamReply {
    pub status: u16,
    pub body: String,
}

/// Reply shape: buffered JSON, or a live response for SSE pass-through.
pub enum PaymentReply {
    Buffered(UpstreamReply),
    Stream(reqwest::Response),
}

/// The payment strategy attached to every upstream call.
pub enum PaymentBackend {
    Wallet(WalletBackend),
    ClawCredit(ClawCreditBackend),
}

impl PaymentBackend {
    pub fn from_config(config: &ProxyConfig) -> Result<Self, RouterError> {
        match config.payment_mode {
            PaymentMode::Wallet => {
                let wallet_cfg = config.wallet.as_ref().ok_or_else(|| {
                    RouterError::Config("wallet mode selected without wallet config".to_string())
                })?;
                Ok(PaymentBackend::Wallet(WalletBackend::new(wallet_cfg)?))
            }
            PaymentMode::ClawCredit => {
                let cc_cfg = config.clawcredit.as_ref().ok_or_else(|| {
                    RouterError::Config(
                        "clawcredit mode selected without clawcredit config".to_string(),
                    )
                })?;
                Ok(PaymentBackend::ClawCredit(ClawCreditBackend::new(cc_cfg)))
            }
        }
    }

    pub fn is_wallet(&self) -> bool {
        matches!(self, PaymentBackend::Wallet(_))
    }

    /// Execute one paid upstream call.
    ///
    /// `pre_auth_micro_usd` is the estimated amount the backend reserves
    /// before the call. Streaming is honored by the wallet backend; the
    /// custodial backend always buffers (the pay service returns the
    /// merchant payload as JSON).
    pub async fn invoke(
        &self,
        url: &str,
        body: &Value,
        pre_auth_micro_usd: u64,
        timeout: Duration,
        stream: bool,
    ) -> Result<PaymentReply, RouterError> {
        match self {
            PaymentBackend::Wallet(backend) => {
                backend.invoke(url, body, pre_auth_micro_usd, timeout, stream).await
            }
            PaymentBackend::ClawCredit(backend) => backend
                .invoke(url, body, pre_auth_micro_usd, timeout)
                .await
                .map(PaymentReply::Buffered),
        }
    }
}
