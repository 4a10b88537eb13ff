//! Error kinds for the proxy core.
//!
//! The fallback executor only ever needs to answer one question about an
//! error: can the next candidate in the chain recover from it? Recoverable
//! kinds (payment, provider, transport) advance the chain; client errors are
//! returned to the caller verbatim; config errors abort startup.

use thiserror::Error;

/// All error kinds the routing/dispatch pipeline can produce.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Direct 402 or a wrapped `x402_payment_failed` marker in the body.
    #[error("payment failed (status {status}): {message}")]
    PaymentFailed { status: u16, message: String },

    /// Upstream 4xx/5xx carrying provider/billing language.
    #[error("provider error (status {status}): {message}")]
    ProviderError { status: u16, message: String },

    /// TCP/TLS/timeout failure before a response was read.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed request the caller must fix. Never triggers fallback.
    #[error("client error (status {status}): {message}")]
    ClientError { status: u16, message: String },

    /// Missing or invalid configuration at startup. Fatal.
    #[error("config error: {0}")]
    Config(String),

    /// Wallet drained and every candidate exhausted.
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
}

impl RouterError {
    /// Whether the fallback executor may try the next candidate.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RouterError::PaymentFailed { .. }
                | RouterError::ProviderError { .. }
                | RouterError::Transport(_)
                | RouterError::InsufficientFunds(_)
        )
    }

    /// Stable wire name for the `error.type` field of client responses.
    pub fn kind(&self) -> &'static str {
        match self {
            RouterError::PaymentFailed { .. } => "payment_failed",
            RouterError::ProviderError { .. } => "provider_error",
            RouterError::Transport(_) => "transport_error",
            RouterError::ClientError { .. } => "client_error",
            RouterError::Config(_) => "config_error",
            RouterError::InsufficientFunds(_) => "insufficient_funds",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_kinds() {
        assert!(RouterError::PaymentFailed {
            status: 402,
            message: "no funds".into()
        }
        .is_recoverable());
        assert!(RouterError::ProviderError {
            status: 503,
            message: "overloaded".into()
        }
        .is_recoverable());
        assert!(RouterError::Transport("connection reset".into()).is_recoverable());
        assert!(!RouterError::ClientError {
            status: 400,
            message: "bad json".into()
        }
        .is_recoverable());
        assert!(!RouterError::Config("missing token".into()).is_recoverable());
    }

    #[test]
    fn test_wire_kind_names() {
        assert_eq!(
            RouterError::Transport("x".into()).kind(),
            "transport_error"
        );
        assert_eq!(
            RouterError::PaymentFailed {
                status: 400,
                message: String::new()
            }
            .kind(),
            "payment_failed"
        );
    }
}
