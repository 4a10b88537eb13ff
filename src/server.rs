//! HTTP surface and proxy lifecycle.
//!
//! Exposes the OpenAI-compatible endpoints on localhost and wires the whole
//! pipeline together: classify → route → dedup → fallback dispatch →
//! pin/cache bookkeeping. Clients talk to this as if it were OpenAI; model
//! selection, payments, and fallbacks stay invisible.

use crate::balance::BalanceMonitor;
use crate::catalog;
use crate::classify::classify;
use crate::config::{PaymentMode, ProxyConfig};
use crate::dedup::{fingerprint, Claim, DedupCache, DedupOutcome};
use crate::error::RouterError;
use crate::fallback::{run_chain, ChainReply};
use crate::payment::PaymentBackend;
use crate::pins::SessionPinStore;
use crate::router::{route, RouteInput, TierProfile};
use crate::stats::StatsRegistry;
use crate::upstream::{AttemptKind, Dispatcher};
use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

/// Long-lived proxy state, created at start and torn down at close.
pub struct ProxyState {
    config: ProxyConfig,
    dispatcher: Dispatcher,
    pins: SessionPinStore,
    dedup: DedupCache,
    stats: Arc<StatsRegistry>,
    balance: BalanceMonitor,
}

impl ProxyState {
    fn new(config: ProxyConfig) -> Result<Arc<Self>, RouterError> {
        let stats = Arc::new(StatsRegistry::new());
        let backend = PaymentBackend::from_config(&config)?;
        let dispatcher = Dispatcher::new(backend, &config.upstream_url, Arc::clone(&stats));

        let balance = match (&config.payment_mode, config.wallet_address()) {
            (PaymentMode::Wallet, Some(address)) => BalanceMonitor::spawn(
                config.upstream_url.clone(),
                address.to_string(),
                config.balance_poll_interval,
            ),
            _ => BalanceMonitor::disabled(),
        };

        Ok(Arc::new(Self {
            pins: SessionPinStore::new(config.pin_ttl),
            dedup: DedupCache::new(config.dedup_ttl),
            dispatcher,
            stats,
            balance,
            config,
        }))
    }
}

/// Running proxy handle.
pub struct Proxy {
    addr: SocketAddr,
    state: Arc<ProxyState>,
    shutdown: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

impl Proxy {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Stop accepting connections and tear down background tasks.
    pub async fn close(self) {
        let _ = self.shutdown.send(true);
        self.state.balance.shutdown();
        let _ = self.handle.await;
        eprintln!("[proxy] closed");
    }
}

/// Bind and serve. `config.port == 0` picks an ephemeral port.
pub async fn start(config: ProxyConfig) -> Result<Proxy, RouterError> {
    let mode = config.payment_mode;
    let state = ProxyState::new(config)?;

    let app = router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", state.config.port))
        .await
        .map_err(|e| RouterError::Config(format!("cannot bind port {}: {}", state.config.port, e)))?;
    let addr = listener
        .local_addr()
        .map_err(|e| RouterError::Config(e.to_string()))?;

    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            })
            .await;
        if let Err(e) = served {
            eprintln!("[proxy] server error: {}", e);
        }
    });

    eprintln!("[proxy] listening on {} (payment mode: {:?})", addr, mode);
    Ok(Proxy {
        addr,
        state,
        shutdown,
        handle,
    })
}

fn router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .fallback(not_found)
        .with_state(state)
}

// --- /v1/chat/completions -------------------------------------------------

async fn chat_completions(
    State(state): State<Arc<ProxyState>>,
    headers: HeaderMap,
    raw: Bytes,
) -> Response {
    let body: Value = match serde_json::from_slice(&raw) {
        Ok(v) => v,
        Err(e) => {
            return client_error(format!("invalid JSON body: {}", e));
        }
    };

    let Some(messages) = body.get("messages").and_then(Value::as_array).cloned() else {
        return client_error("'messages' must be a non-empty array".to_string());
    };
    if messages.is_empty() {
        return client_error("'messages' must be a non-empty array".to_string());
    }

    let model_field = body
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or("auto")
        .to_string();
    let max_tokens = body.get("max_tokens").and_then(Value::as_u64);
    let temperature = body.get("temperature").and_then(Value::as_f64);
    let seed = body.get("seed").and_then(Value::as_i64);
    let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let session_id = headers
        .get("x-session-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let request_id = uuid::Uuid::new_v4().to_string()[..8].to_string();

    let classification = classify(&messages);
    let decision = route(
        &RouteInput {
            requested_model: &model_field,
            classification,
            session_id: session_id.as_deref(),
            max_tokens,
            balance_empty: state.balance.is_empty(),
            wallet_mode: state.dispatcher.is_wallet_mode(),
        },
        &state.pins,
    );
    eprintln!("[router] {} {}", request_id, decision.reasoning);

    let pre_auth = decision.pre_auth_micro_usd();

    // Streaming bypasses the dedup cache entirely: SSE pass-through.
    if stream {
        let reply = run_chain(
            &state.dispatcher,
            &decision.chain,
            &body,
            pre_auth,
            state.config.request_deadline,
            true,
            &state.stats,
            &request_id,
        )
        .await;
        return match reply {
            ChainReply::Stream {
                model,
                response,
                attempted,
            } => {
                finish_success(&state, &session_id, &decision.profile, &model, &attempted);
                sse_passthrough(response)
            }
            ChainReply::Buffered(result) => buffered_response(&state, &session_id, &decision.profile, result),
        };
    }

    let canonical_model = match &decision.profile {
        TierProfile::Explicit(id) => id.clone(),
        alias => alias.key(),
    };
    let fp = fingerprint(&canonical_model, &messages, max_tokens, temperature, seed);

    match state.dedup.claim(&fp) {
        Claim::Hit(outcome) => {
            eprintln!("[dedup] {} served from cache", request_id);
            outcome_response(&outcome)
        }
        Claim::Follower(rx) => {
            eprintln!("[dedup] {} coalesced onto in-flight request", request_id);
            match DedupCache::await_follower(rx).await {
                Ok(outcome) => outcome_response(&outcome),
                Err(_) => error_response(
                    502,
                    "coalesced request was cancelled by its originator",
                    "transport_error",
                ),
            }
        }
        Claim::Leader(guard) => {
            let reply = run_chain(
                &state.dispatcher,
                &decision.chain,
                &body,
                pre_auth,
                state.config.request_deadline,
                false,
                &state.stats,
                &request_id,
            )
            .await;
            let result = match reply {
                ChainReply::Buffered(result) => result,
                ChainReply::Stream { .. } => unreachable!("stream=false dispatch never streams"),
            };

            let response = buffered_response(&state, &session_id, &decision.profile, result.clone());
            let outcome = DedupOutcome {
                status: response_status(&response),
                body: final_body(&state, &result),
                model: (result.outcome.kind == AttemptKind::Success).then(|| result.model.clone()),
            };
            guard.complete(outcome);
            response
        }
    }
}

/// Map a finished chain walk onto the client response, writing the session
/// pin on success.
fn buffered_response(
    state: &Arc<ProxyState>,
    session_id: &Option<String>,
    profile: &TierProfile,
    result: crate::fallback::ChainResult,
) -> Response {
    match result.outcome.kind {
        AttemptKind::Success => {
            finish_success(state, session_id, profile, &result.model, &result.attempted);
            json_response(result.outcome.status, &result.outcome.body)
        }
        // Fatal: the upstream's own words, the upstream's own status.
        AttemptKind::ClientError => json_response(result.outcome.status, &result.outcome.body),
        _ => {
            let error = exhausted_error(state, &result);
            eprintln!(
                "[fallback] chain exhausted after {} attempt(s), last model {}: {}",
                result.attempted.len(),
                result.model,
                error
            );
            json_response(result.outcome.status, &exhausted_body(&error))
        }
    }
}

/// Exhausting the chain while the balance monitor reports an empty wallet is
/// an insufficient-funds condition; otherwise it is the last provider error.
fn exhausted_error(state: &Arc<ProxyState>, result: &crate::fallback::ChainResult) -> RouterError {
    if state.dispatcher.is_wallet_mode() && state.balance.is_empty() {
        RouterError::InsufficientFunds(result.outcome.message.clone())
    } else {
        RouterError::ProviderError {
            status: result.outcome.status,
            message: result.outcome.message.clone(),
        }
    }
}

/// Either way the client sees `provider_error`, keeping the surface
/// OpenAI-shaped; insufficient funds only changes the message.
fn exhausted_body(error: &RouterError) -> Value {
    let message = match error {
        RouterError::InsufficientFunds(last) => format!("insufficient funds: {}", last),
        RouterError::ProviderError { message, .. } => message.clone(),
        other => other.to_string(),
    };
    json!({ "error": { "message": message, "type": "provider_error" } })
}

fn finish_success(
    state: &Arc<ProxyState>,
    session_id: &Option<String>,
    profile: &TierProfile,
    model: &str,
    attempted: &[String],
) {
    if let Some(sid) = session_id {
        state.pins.set(sid, &profile.key(), model);
    }
    if attempted.len() > 1 {
        eprintln!(
            "[fallback] served by {} after {} failed attempt(s)",
            model,
            attempted.len() - 1
        );
    }
}

fn final_body(state: &Arc<ProxyState>, result: &crate::fallback::ChainResult) -> Value {
    match result.outcome.kind {
        AttemptKind::Success | AttemptKind::ClientError => result.outcome.body.clone(),
        _ => exhausted_body(&exhausted_error(state, result)),
    }
}

fn sse_passthrough(upstream: reqwest::Response) -> Response {
    let content_type = upstream
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("text/event-stream")
        .to_string();
    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::OK);
    Response::builder()
        .status(status)
        .header("content-type", content_type)
        .body(Body::from_stream(upstream.bytes_stream()))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

// --- auxiliary endpoints --------------------------------------------------

async fn list_models() -> Response {
    let mut data: Vec<Value> = ["auto", "eco", "premium", "free"]
        .iter()
        .map(|alias| {
            json!({
                "id": alias,
                "object": "model",
                "owned_by": "clawrouter",
            })
        })
        .collect();

    for model in catalog::all_models() {
        use rust_decimal::prelude::ToPrimitive;
        data.push(json!({
            "id": model.id,
            "object": "model",
            "owned_by": model.id.split('/').next().unwrap_or("unknown"),
            "tier": model.tier.as_str(),
            "price_per_million": model.price_per_million.to_f64().unwrap_or(0.0),
        }));
    }

    Json(json!({ "object": "list", "data": data })).into_response()
}

async fn health(
    State(state): State<Arc<ProxyState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let mut body = json!({
        "status": "ok",
        "wallet": state.config.wallet_address(),
    });

    if params.get("full").map(String::as_str) == Some("true") {
        let balance = state.balance.state();
        match (balance.snapshot, balance.last_error) {
            (Some(snapshot), _) => {
                body["balance"] = serde_json::to_value(&snapshot).unwrap_or(Value::Null);
            }
            (None, Some(error)) => {
                body["balanceError"] = Value::String(error);
            }
            (None, None) => {
                body["balance"] = Value::Null;
            }
        }
    }

    Json(body).into_response()
}

async fn stats(State(state): State<Arc<ProxyState>>) -> Response {
    Json(state.stats.snapshot()).into_response()
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Not found" }))).into_response()
}

// --- response helpers -----------------------------------------------------

fn json_response(status: u16, body: &Value) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    (status, Json(body.clone())).into_response()
}

fn error_response(status: u16, message: &str, kind: &str) -> Response {
    json_response(
        status,
        &json!({ "error": { "message": message, "type": kind } }),
    )
}

fn client_error(message: String) -> Response {
    error_response(400, &message, "client_error")
}

fn response_status(response: &Response) -> u16 {
    response.status().as_u16()
}

fn outcome_response(outcome: &DedupOutcome) -> Response {
    json_response(outcome.status, &outcome.body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{chat_body, MockUpstream, TEST_WALLET_KEY};
    use serde_json::json;
    use std::time::Duration;

    const EMERGENCY: &str = "nvidia/gpt-oss-120b";

    async fn start_wallet_proxy(mock: &MockUpstream) -> Proxy {
        let upstream = mock.base_url.clone();
        let config = ProxyConfig::from_lookup(move |name| match name {
            "BLOCKRUN_WALLET_KEY" => Some(TEST_WALLET_KEY.to_string()),
            "BLOCKRUN_PROXY_PORT" => Some("0".to_string()),
            "BLOCKRUN_API_URL" => Some(upstream.clone()),
            _ => None,
        })
        .unwrap();
        start(config).await.unwrap()
    }

    async fn start_clawcredit_proxy(mock: &MockUpstream) -> Proxy {
        let upstream = mock.base_url.clone();
        let config = ProxyConfig::from_lookup(move |name| match name {
            "BLOCKRUN_PAYMENT_MODE" => Some("clawcredit".to_string()),
            "BLOCKRUN_PROXY_PORT" => Some("0".to_string()),
            "BLOCKRUN_API_URL" => Some(upstream.clone()),
            "CLAWCREDIT_API_TOKEN" => Some("tok_scenario".to_string()),
            "CLAWCREDIT_BASE_URL" => Some(upstream.clone()),
            _ => None,
        })
        .unwrap();
        start(config).await.unwrap()
    }

    async fn post_chat(proxy: &Proxy, body: &Value, session: Option<&str>) -> (u16, Value) {
        let client = reqwest::Client::new();
        let mut request = client
            .post(format!("{}/v1/chat/completions", proxy.base_url()))
            .json(body);
        if let Some(sid) = session {
            request = request.header("x-session-id", sid);
        }
        let response = request.send().await.unwrap();
        let status = response.status().as_u16();
        let body: Value = response.json().await.unwrap();
        (status, body)
    }

    fn content(body: &Value) -> &str {
        body.pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    #[tokio::test]
    async fn test_scenario_primary_succeeds() {
        let mock = MockUpstream::start().await;
        let proxy = start_wallet_proxy(&mock).await;

        let (status, body) = post_chat(&proxy, &chat_body("auto", "Hello"), None).await;
        assert_eq!(status, 200);

        let calls = mock.calls();
        assert_eq!(calls.len(), 1, "exactly one upstream call");
        assert_eq!(content(&body), format!("Response from {}", calls[0]));

        proxy.close().await;
    }

    #[tokio::test]
    async fn test_scenario_first_fallback_succeeds() {
        let mock = MockUpstream::start().await;
        mock.push_reply(
            503,
            json!({"error": {"message": "capacity exhausted", "type": "provider_error"}}),
        );
        let proxy = start_wallet_proxy(&mock).await;

        let (status, body) = post_chat(
            &proxy,
            &chat_body("auto", "Prove sqrt(2) is irrational"),
            None,
        )
        .await;
        assert_eq!(status, 200);

        let calls = mock.calls();
        assert_eq!(calls.len(), 2, "primary fails, first fallback succeeds");
        assert_ne!(calls[0], calls[1], "never retry the same model");
        assert_eq!(content(&body), format!("Response from {}", calls[1]));

        proxy.close().await;
    }

    #[tokio::test]
    async fn test_scenario_wrapped_payment_failure() {
        let mock = MockUpstream::start().await;
        mock.push_reply(
            400,
            json!({"error": {
                "message": "x402_payment_failed: settlement rejected",
                "type": "provider_error",
            }}),
        );
        let proxy = start_wallet_proxy(&mock).await;

        let (status, _body) = post_chat(
            &proxy,
            &chat_body("xai/grok-code-fast-1", "write a sort function"),
            None,
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(
            mock.calls(),
            vec!["xai/grok-code-fast-1".to_string(), EMERGENCY.to_string()],
            "wrapped 400 must fall back exactly like a direct 402"
        );

        // The wrapped failure shows up in /stats.
        let client = reqwest::Client::new();
        let stats: Value = client
            .get(format!("{}/stats", proxy.base_url()))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(
            stats["models"]["xai/grok-code-fast-1"]["wrapped_payment_failures"],
            1
        );

        proxy.close().await;
    }

    #[tokio::test]
    async fn test_scenario_all_models_fail() {
        let mock = MockUpstream::start().await;
        // Explicit-model chains have exactly two candidates.
        for _ in 0..2 {
            mock.push_reply(
                503,
                json!({"error": {"message": "all lanes busy", "type": "provider_error"}}),
            );
        }
        let proxy = start_wallet_proxy(&mock).await;

        let (status, body) = post_chat(
            &proxy,
            &chat_body("xai/grok-code-fast-1", "anything at all"),
            None,
        )
        .await;
        assert_eq!(status, 503, "status mirrors the last upstream status");
        assert_eq!(body["error"]["type"], "provider_error");
        assert_eq!(body["error"]["message"], "all lanes busy");
        assert!(!mock.calls().is_empty());

        proxy.close().await;
    }

    #[tokio::test]
    async fn test_scenario_session_switch_across_tiers() {
        let mock = MockUpstream::start().await;
        let proxy = start_wallet_proxy(&mock).await;

        let (status, _) = post_chat(
            &proxy,
            &chat_body("premium", "summarize the plan"),
            Some("session-42"),
        )
        .await;
        assert_eq!(status, 200);

        let (status, _) = post_chat(
            &proxy,
            &chat_body("eco", "summarize the plan again, briefly"),
            Some("session-42"),
        )
        .await;
        assert_eq!(status, 200);

        let calls = mock.calls();
        assert_eq!(calls.len(), 2);
        assert_ne!(
            calls[1], calls[0],
            "premium pin must not be honored under the eco profile"
        );

        proxy.close().await;
    }

    #[tokio::test]
    async fn test_scenario_session_pin_reused_within_profile() {
        let mock = MockUpstream::start().await;
        let proxy = start_wallet_proxy(&mock).await;

        post_chat(&proxy, &chat_body("auto", "first question"), Some("s-7")).await;
        post_chat(&proxy, &chat_body("auto", "second question"), Some("s-7")).await;

        let calls = mock.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], calls[1], "same profile sticks to the pinned model");

        proxy.close().await;
    }

    #[tokio::test]
    async fn test_scenario_explicit_model_normalization() {
        let mock = MockUpstream::start().await;
        let proxy = start_wallet_proxy(&mock).await;

        let (status, _) = post_chat(
            &proxy,
            &chat_body("  DEEPSEEK/deepseek-chat  ", "translate hi to french"),
            None,
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(mock.calls(), vec!["deepseek/deepseek-chat".to_string()]);

        // And with a failing primary: exactly normalized id then emergency.
        mock.push_reply(
            503,
            json!({"error": {"message": "down", "type": "provider_error"}}),
        );
        let (status, _) = post_chat(
            &proxy,
            &chat_body("  DEEPSEEK/deepseek-chat  ", "translate hi to german"),
            None,
        )
        .await;
        assert_eq!(status, 200);
        let calls = mock.calls();
        assert_eq!(
            calls[1..],
            [
                "deepseek/deepseek-chat".to_string(),
                EMERGENCY.to_string()
            ]
        );

        proxy.close().await;
    }

    #[tokio::test]
    async fn test_scenario_clawcredit_passthrough() {
        let mock = MockUpstream::start().await;
        let proxy = start_clawcredit_proxy(&mock).await;

        let (status, body) = post_chat(
            &proxy,
            &chat_body("deepseek/deepseek-chat", "hello custodial world"),
            None,
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(content(&body), "Response from deepseek/deepseek-chat");

        let envelopes = mock.pay_envelopes();
        assert_eq!(envelopes.len(), 1);
        let tx = &envelopes[0]["transaction"];
        assert_eq!(tx["chain"], "BASE");
        assert_eq!(tx["asset"], crate::config::BASE_USDC_ASSET);
        assert!(tx["amount"].as_f64().unwrap() > 0.0);
        let recipient = tx["recipient"].as_str().unwrap();
        assert!(recipient.ends_with("/v1/chat/completions"));
        assert_eq!(
            envelopes[0]["request_body"]["http"]["url"].as_str().unwrap(),
            recipient
        );

        let auth = mock.pay_auth_headers();
        assert_eq!(auth, vec!["Bearer tok_scenario".to_string()]);

        proxy.close().await;
    }

    #[tokio::test]
    async fn test_concurrent_identical_requests_coalesce() {
        let mock = MockUpstream::start().await;
        mock.push_delayed_reply(
            200,
            MockUpstream::success_body("moonshot/kimi-k2.5"),
            Duration::from_millis(300),
        );
        let proxy = start_wallet_proxy(&mock).await;

        let body = chat_body("auto", "identical twin request");
        let (a, b) = tokio::join!(
            post_chat(&proxy, &body, None),
            post_chat(&proxy, &body, None)
        );
        assert_eq!(a.0, 200);
        assert_eq!(a, b, "both callers observe the identical result");
        assert_eq!(mock.calls().len(), 1, "one upstream call per fingerprint");

        proxy.close().await;
    }

    #[tokio::test]
    async fn test_cached_response_served_within_ttl() {
        let mock = MockUpstream::start().await;
        let proxy = start_wallet_proxy(&mock).await;

        let body = chat_body("auto", "cache me");
        let first = post_chat(&proxy, &body, None).await;
        let second = post_chat(&proxy, &body, None).await;
        assert_eq!(first, second);
        assert_eq!(mock.calls().len(), 1, "second request served from cache");

        proxy.close().await;
    }

    #[tokio::test]
    async fn test_differing_requests_miss_cache() {
        let mock = MockUpstream::start().await;
        let proxy = start_wallet_proxy(&mock).await;

        let mut body = chat_body("auto", "same words");
        post_chat(&proxy, &body, None).await;
        body["temperature"] = json!(0.9);
        post_chat(&proxy, &body, None).await;
        assert_eq!(mock.calls().len(), 2, "temperature is part of the fingerprint");

        proxy.close().await;
    }

    #[tokio::test]
    async fn test_error_results_are_not_cached() {
        let mock = MockUpstream::start().await;
        // Fail the entire explicit chain once.
        for _ in 0..2 {
            mock.push_reply(
                503,
                json!({"error": {"message": "flaky", "type": "provider_error"}}),
            );
        }
        let proxy = start_wallet_proxy(&mock).await;

        let body = chat_body("deepseek/deepseek-chat", "retry me");
        let (status, _) = post_chat(&proxy, &body, None).await;
        assert_eq!(status, 503);

        // Same request again: the mock now succeeds, so a cached error
        // would be visible here.
        let (status, _) = post_chat(&proxy, &body, None).await;
        assert_eq!(status, 200);

        proxy.close().await;
    }

    #[tokio::test]
    async fn test_streaming_bypasses_dedup() {
        let mock = MockUpstream::start().await;
        let proxy = start_wallet_proxy(&mock).await;

        let mut body = chat_body("auto", "stream this");
        body["stream"] = json!(true);

        let client = reqwest::Client::new();
        for _ in 0..2 {
            let response = client
                .post(format!("{}/v1/chat/completions", proxy.base_url()))
                .json(&body)
                .send()
                .await
                .unwrap();
            assert_eq!(response.status().as_u16(), 200);
            let passthrough: Value = serde_json::from_str(&response.text().await.unwrap()).unwrap();
            assert!(passthrough["choices"].is_array());
        }
        assert_eq!(
            mock.calls().len(),
            2,
            "identical streaming requests must not coalesce"
        );

        proxy.close().await;
    }

    #[tokio::test]
    async fn test_empty_balance_collapses_auto_to_free() {
        let mock = MockUpstream::start().await;
        mock.set_balance("0.005");
        let proxy = start_wallet_proxy(&mock).await;
        wait_for_balance(&proxy).await;

        let (status, _) = post_chat(&proxy, &chat_body("auto", "Hello"), None).await;
        assert_eq!(status, 200);
        assert_eq!(mock.calls(), vec![EMERGENCY.to_string()]);

        proxy.close().await;
    }

    #[tokio::test]
    async fn test_empty_balance_short_circuits_explicit_model() {
        let mock = MockUpstream::start().await;
        mock.set_balance("0.005");
        let proxy = start_wallet_proxy(&mock).await;
        wait_for_balance(&proxy).await;

        let (status, _) = post_chat(
            &proxy,
            &chat_body("xai/grok-code-fast-1", "Hello"),
            None,
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(
            mock.calls(),
            vec![EMERGENCY.to_string()],
            "no attempt on the unpayable explicit model"
        );

        proxy.close().await;
    }

    #[tokio::test]
    async fn test_insufficient_funds_reported_on_exhaustion() {
        let mock = MockUpstream::start().await;
        mock.set_balance("0.005");
        // The drained-wallet chain is the emergency model alone; fail it.
        mock.push_reply(
            503,
            json!({"error": {"message": "free lane down", "type": "provider_error"}}),
        );
        let proxy = start_wallet_proxy(&mock).await;
        wait_for_balance(&proxy).await;

        let (status, body) = post_chat(&proxy, &chat_body("auto", "Hello"), None).await;
        assert_eq!(status, 503, "status mirrors the last upstream status");
        assert_eq!(body["error"]["type"], "provider_error");
        let message = body["error"]["message"].as_str().unwrap();
        assert!(
            message.starts_with("insufficient funds:"),
            "unexpected message: {}",
            message
        );
        assert!(message.contains("free lane down"));

        proxy.close().await;
    }

    async fn wait_for_balance(proxy: &Proxy) {
        let client = reqwest::Client::new();
        for _ in 0..50 {
            let health: Value = client
                .get(format!("{}/health?full=true", proxy.base_url()))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if health.get("balance").map(|b| !b.is_null()).unwrap_or(false) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("balance snapshot never appeared");
    }

    #[tokio::test]
    async fn test_health_reports_wallet_and_balance() {
        let mock = MockUpstream::start().await;
        mock.set_balance("0.50");
        let proxy = start_wallet_proxy(&mock).await;
        wait_for_balance(&proxy).await;

        let client = reqwest::Client::new();
        let health: Value = client
            .get(format!("{}/health?full=true", proxy.base_url()))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");
        assert!(health["wallet"].as_str().unwrap().starts_with("0x"));
        assert_eq!(health["balance"]["is_low"], true);
        assert_eq!(health["balance"]["is_empty"], false);

        proxy.close().await;
    }

    #[tokio::test]
    async fn test_models_lists_aliases_and_catalog() {
        let mock = MockUpstream::start().await;
        let proxy = start_wallet_proxy(&mock).await;

        let client = reqwest::Client::new();
        let models: Value = client
            .get(format!("{}/v1/models", proxy.base_url()))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let ids: Vec<&str> = models["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["id"].as_str().unwrap())
            .collect();
        for alias in ["auto", "eco", "premium", "free"] {
            assert!(ids.contains(&alias), "missing alias {}", alias);
        }
        assert!(ids.contains(&EMERGENCY));

        proxy.close().await;
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let mock = MockUpstream::start().await;
        let proxy = start_wallet_proxy(&mock).await;

        let client = reqwest::Client::new();
        let response = client
            .get(format!("{}/v2/everything", proxy.base_url()))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 404);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"], "Not found");

        proxy.close().await;
    }

    #[tokio::test]
    async fn test_malformed_json_is_client_error() {
        let mock = MockUpstream::start().await;
        let proxy = start_wallet_proxy(&mock).await;

        let client = reqwest::Client::new();
        let response = client
            .post(format!("{}/v1/chat/completions", proxy.base_url()))
            .header("content-type", "application/json")
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 400);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"]["type"], "client_error");
        assert!(mock.calls().is_empty(), "nothing reaches upstream");

        proxy.close().await;
    }

    #[tokio::test]
    async fn test_missing_messages_is_client_error() {
        let mock = MockUpstream::start().await;
        let proxy = start_wallet_proxy(&mock).await;

        let (status, body) = post_chat(&proxy, &json!({"model": "auto"}), None).await;
        assert_eq!(status, 400);
        assert_eq!(body["error"]["type"], "client_error");
        assert!(mock.calls().is_empty());

        proxy.close().await;
    }
}
