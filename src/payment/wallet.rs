//! x402 wallet payment backend.
//!
//! Signs a per-request payment authorization with the local Ethereum key
//! (EIP-191 over the canonical payload) and attaches it as an `X-Payment`
//! header on the direct call to the inference endpoint. The private key
//! never leaves this module and never appears in logs.

use crate::config::WalletConfig;
use crate::error::RouterError;
use crate::payment::{PaymentReply, UpstreamReply};
use alloy::primitives::B256;
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::Signer;
use base64::Engine;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;

/// Seconds a signed payment authorization stays valid.
const PAYMENT_VALIDITY_SECS: i64 = 300;

/// Direct-call wallet backend.
pub struct WalletBackend {
    signer: PrivateKeySigner,
    address: String,
    chain_id: u64,
    asset: String,
    client: reqwest::Client,
}

impl WalletBackend {
    pub fn new(config: &WalletConfig) -> Result<Self, RouterError> {
        let signer = signer_from_hex(&config.private_key)?;
        Ok(Self {
            signer,
            address: config.address.clone(),
            chain_id: config.chain_id,
            asset: config.asset.clone(),
            client: reqwest::Client::new(),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Sign the payment and issue the upstream call.
    pub async fn invoke(
        &self,
        url: &str,
        body: &Value,
        pre_auth_micro_usd: u64,
        timeout: Duration,
        stream: bool,
    ) -> Result<PaymentReply, RouterError> {
        let header = self.payment_header(pre_auth_micro_usd).await?;

        let response = self
            .client
            .post(url)
            .header("X-Payment", header)
            .header("Content-Type", "application/json")
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| RouterError::Transport(transport_message(&e)))?;

        if stream {
            return Ok(PaymentReply::Stream(response));
        }

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| RouterError::Transport(transport_message(&e)))?;
        Ok(PaymentReply::Buffered(UpstreamReply { status, body: text }))
    }

    /// Build the base64 `X-Payment` header value: the signed authorization
    /// for `amount` micro-USD against the configured chain and asset.
    async fn payment_header(&self, amount_micro_usd: u64) -> Result<String, RouterError> {
        let payload = json!({
            "scheme": "exact",
            "chain_id": self.chain_id,
            "asset": self.asset,
            "payer": self.address,
            "amount_micro_usd": amount_micro_usd,
            "valid_until": chrono::Utc::now().timestamp() + PAYMENT_VALIDITY_SECS,
            "nonce": uuid::Uuid::new_v4().to_string(),
        });
        let canonical = serde_json::to_string(&payload).expect("payment payload serializes");

        let signature = self
            .signer
            .sign_message(canonical.as_bytes())
            .await
            .map_err(|e| RouterError::Transport(format!("payment signing failed: {}", e)))?;

        let envelope = json!({
            "payload": payload,
            "signature": format!("0x{}", hex_encode(&signature.as_bytes())),
        });
        Ok(base64::engine::general_purpose::STANDARD
            .encode(serde_json::to_string(&envelope).expect("envelope serializes")))
    }
}

fn transport_message(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        "upstream request timed out".to_string()
    } else if e.is_connect() {
        format!("connection failed: {}", e)
    } else {
        e.to_string()
    }
}

// --- key handling ---------------------------------------------------------

/// Generate a fresh random keypair, returning `(private_key_hex, address)`.
pub fn generate_keypair() -> (String, String) {
    let signer = PrivateKeySigner::random();
    let address = format!("{:#x}", signer.address());
    let private_key = format!("0x{}", hex_encode(signer.credential().to_bytes().as_ref()));
    (private_key, address)
}

/// Derive the checksummed-lowercase address from a hex private key
/// (with or without `0x` prefix).
pub fn address_from_private_key(private_key_hex: &str) -> Result<String, RouterError> {
    let signer = signer_from_hex(private_key_hex)?;
    Ok(format!("{:#x}", signer.address()))
}

fn signer_from_hex(private_key_hex: &str) -> Result<PrivateKeySigner, RouterError> {
    let key_hex = private_key_hex
        .strip_prefix("0x")
        .unwrap_or(private_key_hex);
    let key_bytes = hex_decode(key_hex)
        .map_err(|_| RouterError::Config("invalid wallet private key".to_string()))?;
    if key_bytes.len() != 32 {
        return Err(RouterError::Config(
            "wallet private key must be 32 bytes".to_string(),
        ));
    }
    PrivateKeySigner::from_bytes(&B256::from_slice(&key_bytes))
        .map_err(|e| RouterError::Config(format!("invalid wallet private key: {}", e)))
}

fn wallet_key_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".clawrouter")
        .join("wallet.key")
}

/// Load the persisted wallet key, generating and saving one on first run.
pub fn load_or_create_key() -> Result<String, RouterError> {
    let path = wallet_key_path();
    if let Ok(existing) = std::fs::read_to_string(&path) {
        let trimmed = existing.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }

    let (private_key, address) = generate_keypair();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| RouterError::Config(format!("cannot create {}: {}", parent.display(), e)))?;
    }
    std::fs::write(&path, &private_key)
        .map_err(|e| RouterError::Config(format!("cannot write {}: {}", path.display(), e)))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600));
    }
    eprintln!("[wallet] generated new wallet {}", address);
    Ok(private_key)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn hex_decode(hex: &str) -> Result<Vec<u8>, ()> {
    if hex.len() % 2 != 0 {
        return Err(());
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| ()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_CHAIN_ID;

    #[test]
    fn test_generate_keypair_roundtrip() {
        let (key, addr) = generate_keypair();
        assert!(key.starts_with("0x"));
        assert_eq!(addr.len(), 42);
        assert_eq!(address_from_private_key(&key).unwrap(), addr);
    }

    #[test]
    fn test_address_derivation_accepts_unprefixed_key() {
        let (key, addr) = generate_keypair();
        let bare = key.strip_prefix("0x").unwrap();
        assert_eq!(address_from_private_key(bare).unwrap(), addr);
    }

    #[test]
    fn test_invalid_key_rejected() {
        assert!(address_from_private_key("0xzz").is_err());
        assert!(address_from_private_key("0xabcd").is_err());
    }

    #[tokio::test]
    async fn test_payment_header_is_signed_base64() {
        let (key, addr) = generate_keypair();
        let backend = WalletBackend::new(&WalletConfig {
            private_key: key,
            address: addr.clone(),
            chain_id: DEFAULT_CHAIN_ID,
            asset: "0xusdc".to_string(),
        })
        .unwrap();

        let header = backend.payment_header(42_000).await.unwrap();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&header)
            .unwrap();
        let envelope: Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(envelope["payload"]["amount_micro_usd"], 42_000);
        assert_eq!(envelope["payload"]["payer"], addr.as_str());
        assert_eq!(envelope["payload"]["chain_id"], DEFAULT_CHAIN_ID);
        let sig = envelope["signature"].as_str().unwrap();
        assert!(sig.starts_with("0x"));
        assert!(sig.len() > 100, "65-byte signature hex expected");
    }
}
