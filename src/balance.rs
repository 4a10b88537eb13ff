//! Wallet balance monitor.
//!
//! Polls the marketplace balance endpoint on an interval and publishes the
//! latest snapshot through a watch channel: one writer, any number of
//! readers, never blocking the request path. The monitor is advisory: a
//! missing or stale snapshot means "unknown, proceed".

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::watch;

/// Balance at or below this is "empty": auto routing collapses to free.
const EMPTY_THRESHOLD: Decimal = dec!(0.01);
/// Balance at or below this is "low": logged once per transition.
const LOW_THRESHOLD: Decimal = dec!(1.00);

const BALANCE_RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// One observation of the wallet's USD balance.
#[derive(Debug, Clone, Serialize)]
pub struct BalanceSnapshot {
    pub balance_usd: Decimal,
    pub is_low: bool,
    pub is_empty: bool,
    pub sampled_at: DateTime<Utc>,
}

impl BalanceSnapshot {
    pub fn from_balance(balance_usd: Decimal) -> Self {
        Self {
            balance_usd,
            is_low: balance_usd <= LOW_THRESHOLD,
            is_empty: balance_usd <= EMPTY_THRESHOLD,
            sampled_at: Utc::now(),
        }
    }
}

/// Published monitor state: the latest snapshot plus the last RPC error.
#[derive(Debug, Clone, Default)]
pub struct BalanceState {
    pub snapshot: Option<BalanceSnapshot>,
    pub last_error: Option<String>,
}

/// Handle on the polling task. Dropping does not stop the task; call
/// `shutdown` (the proxy does, on close).
pub struct BalanceMonitor {
    rx: watch::Receiver<BalanceState>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl BalanceMonitor {
    /// Spawn the poller for a wallet address.
    pub fn spawn(upstream_url: String, address: String, interval: Duration) -> Self {
        let (tx, rx) = watch::channel(BalanceState::default());
        let handle = tokio::spawn(async move {
            let client = reqwest::Client::new();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let previous = tx.borrow().snapshot.clone();
                match fetch_balance(&client, &upstream_url, &address).await {
                    Ok(balance) => {
                        let snapshot = BalanceSnapshot::from_balance(balance);
                        log_transitions(previous.as_ref(), &snapshot);
                        tx.send_replace(BalanceState {
                            snapshot: Some(snapshot),
                            last_error: None,
                        });
                    }
                    Err(message) => {
                        // Keep the previous snapshot; only record the error.
                        tx.send_replace(BalanceState {
                            snapshot: previous,
                            last_error: Some(message),
                        });
                    }
                }
            }
        });
        Self {
            rx,
            handle: Some(handle),
        }
    }

    /// A monitor that never polls (custodial mode has no wallet to watch).
    pub fn disabled() -> Self {
        let (_tx, rx) = watch::channel(BalanceState::default());
        Self { rx, handle: None }
    }

    pub fn state(&self) -> BalanceState {
        self.rx.borrow().clone()
    }

    /// Advisory emptiness: unknown balance is not empty.
    pub fn is_empty(&self) -> bool {
        self.rx
            .borrow()
            .snapshot
            .as_ref()
            .is_some_and(|s| s.is_empty)
    }

    pub fn shutdown(&self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

fn log_transitions(previous: Option<&BalanceSnapshot>, current: &BalanceSnapshot) {
    let was_low = previous.is_some_and(|s| s.is_low);
    let was_empty = previous.is_some_and(|s| s.is_empty);
    if current.is_empty && !was_empty {
        eprintln!(
            "[balance] insufficient funds: ${}, routing to free models",
            current.balance_usd
        );
    } else if current.is_low && !was_low {
        eprintln!("[balance] low balance: ${}", current.balance_usd);
    }
}

/// One balance RPC. Accepts `balance_usd` as a JSON string or number.
pub async fn fetch_balance(
    client: &reqwest::Client,
    upstream_url: &str,
    address: &str,
) -> Result<Decimal, String> {
    let url = format!("{}/v1/wallet/{}/balance", upstream_url, address);
    let response = client
        .get(&url)
        .timeout(BALANCE_RPC_TIMEOUT)
        .send()
        .await
        .map_err(|e| format!("balance rpc failed: {}", e))?;

    if !response.status().is_success() {
        return Err(format!("balance rpc returned {}", response.status()));
    }

    let body: Value = response
        .json()
        .await
        .map_err(|e| format!("balance rpc returned invalid JSON: {}", e))?;

    parse_balance(&body).ok_or_else(|| "balance rpc response missing balance_usd".to_string())
}

fn parse_balance(body: &Value) -> Option<Decimal> {
    match body.get("balance_usd") {
        Some(Value::String(s)) => s.parse().ok(),
        Some(Value::Number(n)) => n.to_string().parse().ok(),
        _ => None,
    }
}
