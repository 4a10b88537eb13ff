//! Shared test helpers: a scriptable mock of the BlockRun marketplace
//! (chat completions, custodial pay endpoint, balance RPC) listening on an
//! ephemeral port, plus request builders.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One scripted reply, consumed FIFO; absent a script the mock succeeds.
#[derive(Debug, Clone)]
pub struct MockReply {
    pub status: u16,
    pub body: Value,
    pub delay: Option<Duration>,
}

#[derive(Default)]
struct MockState {
    calls: Mutex<Vec<String>>,
    script: Mutex<VecDeque<MockReply>>,
    pay_envelopes: Mutex<Vec<Value>>,
    pay_auth_headers: Mutex<Vec<String>>,
    balance_usd: Mutex<String>,
}

/// Mock marketplace server. Records every model attempted (in order) and
/// every pay envelope received.
pub struct MockUpstream {
    pub addr: SocketAddr,
    pub base_url: String,
    state: Arc<MockState>,
}

impl MockUpstream {
    pub async fn start() -> Self {
        let state = Arc::new(MockState {
            balance_usd: Mutex::new("5.00".to_string()),
            ..Default::default()
        });

        let app = Router::new()
            .route("/v1/chat/completions", post(chat_handler))
            .route("/v1/transaction/pay", post(pay_handler))
            .route("/v1/wallet/{address}/balance", get(balance_handler))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("mock upstream bind");
        let addr = listener.local_addr().expect("mock upstream addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            addr,
            base_url: format!("http://{}", addr),
            state,
        }
    }

    /// Queue a reply for the next chat call, regardless of model.
    pub fn push_reply(&self, status: u16, body: Value) {
        self.state.script.lock().unwrap().push_back(MockReply {
            status,
            body,
            delay: None,
        });
    }

    /// Queue a reply that arrives after `delay` (for coalescing tests).
    pub fn push_delayed_reply(&self, status: u16, body: Value, delay: Duration) {
        self.state.script.lock().unwrap().push_back(MockReply {
            status,
            body,
            delay: Some(delay),
        });
    }

    pub fn set_balance(&self, balance: &str) {
        *self.state.balance_usd.lock().unwrap() = balance.to_string();
    }

    /// Model ids of every chat attempt, in arrival order.
    pub fn calls(&self) -> Vec<String> {
        self.state.calls.lock().unwrap().clone()
    }

    /// Envelopes received on `/v1/transaction/pay`.
    pub fn pay_envelopes(&self) -> Vec<Value> {
        self.state.pay_envelopes.lock().unwrap().clone()
    }

    /// `Authorization` header values seen on `/v1/transaction/pay`.
    pub fn pay_auth_headers(&self) -> Vec<String> {
        self.state.pay_auth_headers.lock().unwrap().clone()
    }

    /// The canonical success body the mock produces for `model`.
    pub fn success_body(model: &str) -> Value {
        json!({
            "id": "chatcmpl-mock",
            "object": "chat.completion",
            "model": model,
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": format!("Response from {}", model),
                },
                "finish_reason": "stop",
            }],
        })
    }
}

async fn chat_handler(
    State(state): State<Arc<MockState>>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or("missing")
        .to_string();
    state.calls.lock().unwrap().push(model.clone());

    let scripted = state.script.lock().unwrap().pop_front();
    match scripted {
        Some(reply) => {
            if let Some(delay) = reply.delay {
                tokio::time::sleep(delay).await;
            }
            (
                StatusCode::from_u16(reply.status).unwrap(),
                Json(reply.body),
            )
        }
        None => (StatusCode::OK, Json(MockUpstream::success_body(&model))),
    }
}

async fn pay_handler(
    State(state): State<Arc<MockState>>,
    headers: axum::http::HeaderMap,
    Json(envelope): Json<Value>,
) -> impl IntoResponse {
    state.pay_envelopes.lock().unwrap().push(envelope.clone());
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        state
            .pay_auth_headers
            .lock()
            .unwrap()
            .push(auth.to_string());
    }

    let model = envelope
        .pointer("/request_body/body/model")
        .and_then(Value::as_str)
        .unwrap_or("missing")
        .to_string();
    state.calls.lock().unwrap().push(model.clone());

    let scripted = state.script.lock().unwrap().pop_front();
    match scripted {
        Some(reply) => (
            StatusCode::from_u16(reply.status).unwrap(),
            Json(reply.body),
        ),
        None => (
            StatusCode::OK,
            Json(json!({
                "transaction_id": "txn_mock",
                "merchant_response": MockUpstream::success_body(&model),
            })),
        ),
    }
}

async fn balance_handler(
    State(state): State<Arc<MockState>>,
    Path(_address): Path<String>,
) -> impl IntoResponse {
    let balance = state.balance_usd.lock().unwrap().clone();
    Json(json!({ "balance_usd": balance }))
}

/// Deterministic, never-funded private key for wallet-mode tests.
pub const TEST_WALLET_KEY: &str =
    "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

/// Minimal chat body builder.
pub fn chat_body(model: &str, prompt: &str) -> Value {
    json!({
        "model": model,
        "messages": [{"role": "user", "content": prompt}],
        "max_tokens": 256,
    })
}
