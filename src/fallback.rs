//! Fallback executor.
//!
//! Walks the candidate chain strictly sequentially: abort on first success,
//! return client errors verbatim, advance on anything recoverable. Attempts
//! never fan out in parallel and a model is never retried within one
//! request, so a request can be charged at most once per candidate.

use crate::stats::StatsRegistry;
use crate::upstream::{AttemptKind, AttemptOutcome, DispatchReply, Dispatcher};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

const MIN_ATTEMPT_BUDGET: Duration = Duration::from_secs(10);
const MAX_ATTEMPT_BUDGET: Duration = Duration::from_secs(60);

/// Result of walking a chain to completion (non-streaming).
#[derive(Debug, Clone)]
pub struct ChainResult {
    pub outcome: AttemptOutcome,
    /// Model that produced the final outcome.
    pub model: String,
    /// Every model attempted, in order.
    pub attempted: Vec<String>,
}

/// A chain walk either finished buffered or handed back a live stream.
pub enum ChainReply {
    Buffered(ChainResult),
    Stream {
        model: String,
        response: reqwest::Response,
        attempted: Vec<String>,
    },
}

/// Walk `chain` until success, fatal error, exhaustion, or deadline.
pub async fn run_chain(
    dispatcher: &Dispatcher,
    chain: &[String],
    body: &Value,
    pre_auth_micro_usd: u64,
    deadline: Duration,
    stream: bool,
    stats: &Arc<StatsRegistry>,
    request_id: &str,
) -> ChainReply {
    let started = Instant::now();
    let mut attempted: Vec<String> = Vec::new();
    let mut last: Option<(String, AttemptOutcome)> = None;

    for (index, model) in chain.iter().enumerate() {
        let remaining = deadline.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            break;
        }
        let candidates_left = (chain.len() - index) as u32;
        let attempt_budget = (remaining / candidates_left)
            .clamp(MIN_ATTEMPT_BUDGET, MAX_ATTEMPT_BUDGET)
            .min(remaining);

        attempted.push(model.clone());
        let reply = dispatcher
            .dispatch(model, body, pre_auth_micro_usd, attempt_budget, stream)
            .await;

        match reply {
            DispatchReply::Stream(response) => {
                return ChainReply::Stream {
                    model: model.clone(),
                    response,
                    attempted,
                };
            }
            DispatchReply::Outcome(outcome) => match outcome.kind {
                AttemptKind::Success => {
                    return ChainReply::Buffered(ChainResult {
                        outcome,
                        model: model.clone(),
                        attempted,
                    });
                }
                AttemptKind::ClientError => {
                    // The request itself is broken; retrying elsewhere
                    // cannot help and would double-bill a doomed call.
                    return ChainReply::Buffered(ChainResult {
                        outcome,
                        model: model.clone(),
                        attempted,
                    });
                }
                kind => {
                    stats.record_fallback(model);
                    eprintln!(
                        "[fallback] {} {} on {} ({}), trying next candidate",
                        request_id,
                        kind_label(kind),
                        model,
                        outcome.status,
                    );
                    last = Some((model.clone(), outcome));
                }
            },
        }
    }

    let (model, outcome) = last.unwrap_or_else(|| {
        // Deadline elapsed before any attempt completed.
        (
            chain.first().cloned().unwrap_or_default(),
            AttemptOutcome {
                kind: AttemptKind::Transport,
                status: 504,
                body: serde_json::json!({
                    "error": { "message": "request deadline exhausted", "type": "transport_error" }
                }),
                message: "request deadline exhausted".to_string(),
            },
        )
    });
    ChainReply::Buffered(ChainResult {
        outcome,
        model,
        attempted,
    })
}

fn kind_label(kind: AttemptKind) -> &'static str {
    match kind {
        AttemptKind::PaymentFailed => "payment failure",
        AttemptKind::ProviderError => "provider error",
        AttemptKind::Transport => "transport error",
        AttemptKind::Success | AttemptKind::ClientError => "unexpected",
    }
}
