//! Upstream dispatcher: one candidate, one attempt.
//!
//! Rewrites the outgoing body to carry the candidate model id, hands the
//! call to the payment backend, and classifies what came back. The wrapped
//! payment marker is matched against the raw body text regardless of HTTP
//! status; relying on `status == 402` alone misses failures surfaced inside
//! provider-error envelopes.

use crate::error::RouterError;
use crate::payment::{PaymentBackend, PaymentReply, UpstreamReply};
use crate::stats::StatsRegistry;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Literal marker of an x402 failure wrapped in another error body.
const WRAPPED_PAYMENT_MARKER: &str = "x402_payment_failed";

/// How one attempt ended, from the fallback executor's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptKind {
    Success,
    /// Recoverable: direct 402 or wrapped marker.
    PaymentFailed,
    /// Recoverable: upstream 5xx, or 4xx carrying provider/billing language.
    ProviderError,
    /// Fatal: the caller's request is malformed; no fallback.
    ClientError,
    /// Recoverable: the response never arrived.
    Transport,
}

impl AttemptKind {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, AttemptKind::Success | AttemptKind::ClientError)
    }
}

/// Classified result of one attempt.
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    pub kind: AttemptKind,
    pub status: u16,
    pub body: Value,
    pub message: String,
}

/// A dispatch either finished with a buffered outcome or opened a stream.
pub enum DispatchReply {
    Outcome(AttemptOutcome),
    /// 2xx streaming response, ready for SSE pass-through.
    Stream(reqwest::Response),
}

/// Executes single upstream attempts through the payment backend.
pub struct Dispatcher {
    backend: PaymentBackend,
    chat_url: String,
    stats: Arc<StatsRegistry>,
}

impl Dispatcher {
    pub fn new(backend: PaymentBackend, upstream_url: &str, stats: Arc<StatsRegistry>) -> Self {
        Self {
            backend,
            chat_url: format!("{}/v1/chat/completions", upstream_url),
            stats,
        }
    }

    pub fn is_wallet_mode(&self) -> bool {
        self.backend.is_wallet()
    }

    /// One attempt against `model`. Only the `model` field of the caller's
    /// body is mutated; everything else is forwarded untouched.
    pub async fn dispatch(
        &self,
        model: &str,
        body: &Value,
        pre_auth_micro_usd: u64,
        timeout: Duration,
        stream: bool,
    ) -> DispatchReply {
        let mut attempt_body = body.clone();
        attempt_body["model"] = Value::String(model.to_string());

        self.stats.record_attempt(model);

        let reply = self
            .backend
            .invoke(&self.chat_url, &attempt_body, pre_auth_micro_usd, timeout, stream)
            .await;

        match reply {
            Ok(PaymentReply::Stream(response)) => {
                let status = response.status().as_u16();
                if (200..300).contains(&status) {
                    self.stats.record_success(model);
                    return DispatchReply::Stream(response);
                }
                // Failed before any event flowed; buffer and classify so the
                // fallback chain can continue.
                let text = response.text().await.unwrap_or_default();
                DispatchReply::Outcome(self.classify(model, UpstreamReply { status, body: text }))
            }
            Ok(PaymentReply::Buffered(reply)) => {
                let outcome = self.classify(model, reply);
                if outcome.kind == AttemptKind::Success {
                    self.stats.record_success(model);
                }
                DispatchReply::Outcome(outcome)
            }
            Err(RouterError::Transport(message)) => DispatchReply::Outcome(AttemptOutcome {
                kind: AttemptKind::Transport,
                status: 502,
                body: error_body(&message, "transport_error"),
                message,
            }),
            Err(other) => {
                let message = other.to_string();
                DispatchReply::Outcome(AttemptOutcome {
                    kind: AttemptKind::Transport,
                    status: 502,
                    body: error_body(&message, other.kind()),
                    message,
                })
            }
        }
    }

    fn classify(&self, model: &str, reply: UpstreamReply) -> AttemptOutcome {
        let UpstreamReply { status, body: text } = reply;
        let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
        let message = extract_message(&body, &text);

        let wrapped = text.contains(WRAPPED_PAYMENT_MARKER);
        if wrapped && status != 402 {
            self.stats.record_wrapped_payment_failure(model);
        }

        let kind = if wrapped || status == 402 {
            AttemptKind::PaymentFailed
        } else if (200..300).contains(&status) {
            AttemptKind::Success
        } else if status >= 500 || status == 429 || is_provider_error(&body, &text) {
            AttemptKind::ProviderError
        } else {
            AttemptKind::ClientError
        };

        // A success we cannot parse is not a success the client can use.
        if kind == AttemptKind::Success && body.is_null() {
            let message = "upstream returned a non-JSON success body".to_string();
            return AttemptOutcome {
                kind: AttemptKind::Transport,
                status,
                body: error_body(&message, "transport_error"),
                message,
            };
        }

        let body = if body.is_null() {
            error_body(&message, kind_name(kind))
        } else {
            body
        };

        AttemptOutcome {
            kind,
            status,
            body,
            message,
        }
    }
}

fn kind_name(kind: AttemptKind) -> &'static str {
    match kind {
        AttemptKind::Success => "success",
        AttemptKind::PaymentFailed => "payment_failed",
        AttemptKind::ProviderError => "provider_error",
        AttemptKind::ClientError => "client_error",
        AttemptKind::Transport => "transport_error",
    }
}

fn error_body(message: &str, kind: &str) -> Value {
    json!({ "error": { "message": message, "type": kind } })
}

/// Billing/credit language marking a recoverable provider-side failure.
fn is_provider_error(body: &Value, text: &str) -> bool {
    let typed = body
        .pointer("/error/type")
        .or_else(|| body.get("type"))
        .and_then(Value::as_str)
        .is_some_and(|t| t == "provider_error");
    if typed {
        return true;
    }
    let lower = text.to_lowercase();
    ["insufficient", "billing", "credit", "quota", "rate limit"]
        .iter()
        .any(|marker| lower.contains(marker))
}

fn extract_message(body: &Value, text: &str) -> String {
    body.pointer("/error/message")
        .or_else(|| body.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| {
            let trimmed = text.trim();
            let mut cut = trimmed.len().min(200);
            while !trimmed.is_char_boundary(cut) {
                cut -= 1;
            }
            trimmed[..cut].to_string()
        })
}
