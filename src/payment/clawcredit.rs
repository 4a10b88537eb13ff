//! claw.credit custodial payment backend.
//!
//! Never calls the inference endpoint itself. Each attempt is wrapped in a
//! pay-call envelope and POSTed to `{base_url}/v1/transaction/pay`; the
//! service executes the payment and the embedded HTTP request, then returns
//! the merchant's reply inside a wrapper. This module unwraps it so the
//! dispatcher sees the upstream response as if it had been called directly.

use crate::config::ClawCreditConfig;
use crate::error::RouterError;
use crate::payment::UpstreamReply;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Map, Value};
use std::time::Duration;

/// Hard ceiling on the pay call itself, independent of the attempt budget.
const PAY_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Hop-level headers that must not leak into the embedded request.
const STRIPPED_HEADERS: [&str; 3] = ["host", "content-length", "connection"];

/// Custodial backend holding the claw.credit context.
pub struct ClawCreditBackend {
    base_url: String,
    api_token: String,
    chain: String,
    asset: String,
    client: reqwest::Client,
}

impl ClawCreditBackend {
    pub fn new(config: &ClawCreditConfig) -> Self {
        Self {
            base_url: config.base_url.clone(),
            api_token: config.api_token.clone(),
            chain: config.chain.clone(),
            asset: config.asset.clone(),
            client: reqwest::Client::new(),
        }
    }

    /// Pay for and execute one upstream call through the custodial service.
    pub async fn invoke(
        &self,
        url: &str,
        body: &Value,
        pre_auth_micro_usd: u64,
        timeout: Duration,
    ) -> Result<UpstreamReply, RouterError> {
        let envelope = self.build_envelope(url, body, pre_auth_micro_usd);
        let pay_url = format!("{}/v1/transaction/pay", self.base_url);

        let response = self
            .client
            .post(&pay_url)
            .bearer_auth(&self.api_token)
            .timeout(timeout.min(PAY_CALL_TIMEOUT))
            .json(&envelope)
            .send()
            .await
            .map_err(|e| RouterError::Transport(format!("pay call failed: {}", e)))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| RouterError::Transport(format!("pay call failed: {}", e)))?;

        if !(200..300).contains(&status) {
            // Propagate the pay service's error with its own status.
            return Ok(UpstreamReply { status, body: text });
        }

        let wrapper: Value = serde_json::from_str(&text).map_err(|_| {
            RouterError::Transport("pay service returned non-JSON wrapper".to_string())
        })?;
        let merchant = wrapper.get("merchant_response").ok_or_else(|| {
            RouterError::Transport("pay response missing merchant_response".to_string())
        })?;

        Ok(UpstreamReply {
            status: 200,
            body: merchant.to_string(),
        })
    }

    fn build_envelope(&self, url: &str, body: &Value, pre_auth_micro_usd: u64) -> Value {
        use rust_decimal::prelude::ToPrimitive;

        let model = body
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        // The wire format wants numeric USD, not a decimal string.
        let amount = micro_usd_to_amount(pre_auth_micro_usd)
            .to_f64()
            .unwrap_or(0.01);
        let headers = sanitize_headers(Map::from_iter([(
            "content-type".to_string(),
            Value::String("application/json".to_string()),
        )]));

        json!({
            "transaction": {
                "recipient": url,
                "amount": amount,
                "chain": self.chain,
                "asset": self.asset,
            },
            "request_body": {
                "http": {
                    "url": url,
                    "method": "POST",
                    "headers": headers,
                },
                "body": body,
            },
            "audit_context": {
                "current_task": format!("chat completion via {}", model),
                "reasoning_process": "cheapest adequate model with automatic fallback",
                "timestamp": chrono::Utc::now().to_rfc3339(),
            },
            "sdk_meta": {
                "sdk_name": "clawrouter",
                "sdk_version": env!("CARGO_PKG_VERSION"),
            },
        })
    }
}

/// Remove hop-level headers before embedding a request in the envelope.
pub fn sanitize_headers(headers: Map<String, Value>) -> Map<String, Value> {
    headers
        .into_iter()
        .filter(|(name, _)| !STRIPPED_HEADERS.contains(&name.to_lowercase().as_str()))
        .collect()
}

/// Convert an estimated micro-USD amount to the envelope's USD figure:
/// divide by 1e6, round to 6 decimal places, floor at $0.01.
pub fn micro_usd_to_amount(micro: u64) -> Decimal {
    let usd = Decimal::from(micro) / dec!(1_000_000);
    usd.round_dp(6).max(dec!(0.01))
}
