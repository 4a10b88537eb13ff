//! Routing engine.
//!
//! Turns a classified request into an ordered candidate chain. Aliases
//! (`auto`, `eco`, `premium`, `free`) resolve through the catalog; explicit
//! ids are normalized and forwarded even when unknown. Every chain ends with
//! the emergency free model so a response exists even with a drained wallet.

use crate::catalog::{self, Capabilities, ModelEntry, ModelTier};
use crate::classify::Classification;
use crate::pins::SessionPinStore;
use rust_decimal::Decimal;

const DEFAULT_MAX_TOKENS: u64 = 1024;
const MICRO_PER_USD: u64 = 1_000_000;

/// The semantic routing bucket of one request; scopes session pins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TierProfile {
    Auto,
    Eco,
    Premium,
    Free,
    Explicit(String),
}

impl TierProfile {
    /// Parse the request's `model` field into a profile.
    pub fn parse(model_field: &str) -> Self {
        match model_field.trim().to_lowercase().as_str() {
            "auto" => TierProfile::Auto,
            "eco" => TierProfile::Eco,
            "premium" => TierProfile::Premium,
            "free" => TierProfile::Free,
            _ => TierProfile::Explicit(catalog::normalize_model_id(model_field)),
        }
    }

    /// Stable key scoping session pins; pins written under one profile are
    /// invisible to every other.
    pub fn key(&self) -> String {
        match self {
            TierProfile::Auto => "auto".to_string(),
            TierProfile::Eco => "eco".to_string(),
            TierProfile::Premium => "premium".to_string(),
            TierProfile::Free => "free".to_string(),
            TierProfile::Explicit(id) => format!("explicit:{}", id),
        }
    }
}

/// One routing decision; built per request, never persisted.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub profile: TierProfile,
    pub tier: ModelTier,
    pub primary: String,
    pub chain: Vec<String>,
    pub reasoning: String,
    /// Estimated USD cost of the primary attempt.
    pub cost_estimate: Decimal,
    /// Fraction saved versus the premium reference model, in [0, 1].
    pub savings: f64,
}

impl RoutingDecision {
    /// Pre-authorization amount in micro-USD for the payment backend.
    pub fn pre_auth_micro_usd(&self) -> u64 {
        use rust_decimal::prelude::ToPrimitive;
        let micro = self.cost_estimate * Decimal::from(MICRO_PER_USD);
        micro.to_u64().unwrap_or(0).max(1)
    }
}

/// Everything the router needs about one request.
#[derive(Debug)]
pub struct RouteInput<'a> {
    pub requested_model: &'a str,
    pub classification: Classification,
    pub session_id: Option<&'a str>,
    pub max_tokens: Option<u64>,
    /// Latest balance snapshot says the wallet is drained.
    pub balance_empty: bool,
    /// Wallet-mode only: a drained balance downgrades `auto` to free and
    /// short-circuits explicit chains to the emergency model.
    pub wallet_mode: bool,
}

/// Build the routing decision for one request.
pub fn route(input: &RouteInput<'_>, pins: &SessionPinStore) -> RoutingDecision {
    let profile = TierProfile::parse(input.requested_model);

    let (tier, mut chain) = match &profile {
        TierProfile::Explicit(_) if input.wallet_mode && input.balance_empty => {
            // The wallet cannot pay for the explicit model anyway; skip the
            // doomed attempt and go straight to the emergency model.
            (ModelTier::Free, Vec::new())
        }
        TierProfile::Explicit(id) => {
            // Catalog is advisory for explicit ids: unknown models are still
            // forwarded, backed only by the emergency model.
            let tier = catalog::lookup(id)
                .map(|m| m.tier)
                .unwrap_or(ModelTier::Standard);
            (tier, vec![id.clone()])
        }
        alias => {
            let tier = resolve_alias_tier(alias, &input.classification, input);
            // Only the premium alias asks for quality-first; auto requests
            // that land in the premium tier still lead with the cheapest
            // adequate model.
            let prefer_quality = matches!(alias, TierProfile::Premium);
            (tier, tier_chain(tier, &input.classification, prefer_quality))
        }
    };

    chain.push(catalog::emergency_model().id.to_string());
    dedupe_in_place(&mut chain);

    let mut pinned = false;
    if let Some(session_id) = input.session_id {
        if let Some(pin) = pins.get(session_id, &profile.key()) {
            if pin_is_compatible(&pin, &input.classification) {
                chain.retain(|m| m != &pin);
                chain.insert(0, pin);
                pinned = true;
            }
        }
    }

    let primary = chain[0].clone();
    let max_tokens = input.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
    let cost_estimate = model_cost(&primary, max_tokens);
    let premium_cost = premium_reference_cost(&input.classification, max_tokens);
    let savings = if premium_cost > Decimal::ZERO {
        use rust_decimal::prelude::ToPrimitive;
        let ratio = (cost_estimate / premium_cost).to_f64().unwrap_or(1.0);
        (1.0 - ratio).clamp(0.0, 1.0)
    } else {
        0.0
    };

    let reasoning = format!(
        "tags=[{}] profile={} tier={} primary={} candidates={}{}",
        input.classification.tags().join(","),
        profile.key(),
        tier.as_str(),
        primary,
        chain.len(),
        if pinned { " pinned" } else { "" },
    );

    RoutingDecision {
        profile,
        tier,
        primary,
        chain,
        reasoning,
        cost_estimate,
        savings,
    }
}

fn resolve_alias_tier(
    alias: &TierProfile,
    classification: &Classification,
    input: &RouteInput<'_>,
) -> ModelTier {
    match alias {
        TierProfile::Auto => {
            // Only auto downgrades on a drained wallet; the other aliases
            // keep their own resolution and rely on the emergency tail.
            if input.wallet_mode && input.balance_empty {
                ModelTier::Free
            } else if classification.wants_premium() {
                ModelTier::Premium
            } else {
                ModelTier::Standard
            }
        }
        TierProfile::Eco => ModelTier::Eco,
        TierProfile::Premium => ModelTier::Premium,
        TierProfile::Free => ModelTier::Free,
        TierProfile::Explicit(_) => unreachable!("explicit ids resolve before alias tiers"),
    }
}

/// Candidates within a tier that satisfy the classification, primary first.
///
/// The premium alias picks the highest-quality (highest-priced) primary;
/// everything else is cheapest-adequate. The remainder is always appended by
/// ascending price.
fn tier_chain(
    tier: ModelTier,
    classification: &Classification,
    prefer_quality: bool,
) -> Vec<String> {
    let mut candidates: Vec<&ModelEntry> = catalog::all_models()
        .iter()
        .filter(|m| m.tier == tier && satisfies(&m.capabilities, classification))
        .collect();
    candidates.sort_by_key(|m| m.price_per_million);

    let primary = if prefer_quality {
        candidates.last().copied()
    } else {
        candidates.first().copied()
    };

    let mut chain = Vec::with_capacity(candidates.len());
    if let Some(primary) = primary {
        chain.push(primary.id.to_string());
    }
    for candidate in &candidates {
        chain.push(candidate.id.to_string());
    }
    chain
}

fn satisfies(caps: &Capabilities, classification: &Classification) -> bool {
    (!classification.reasoning || caps.reasoning)
        && (!classification.code || caps.code)
        && (!classification.vision || caps.vision)
        && (!classification.long_context || caps.long_context)
}

/// A pinned model off the catalog (explicit ids) is assumed compatible.
fn pin_is_compatible(model_id: &str, classification: &Classification) -> bool {
    match catalog::lookup(model_id) {
        Some(entry) => satisfies(&entry.capabilities, classification),
        None => true,
    }
}

fn dedupe_in_place(chain: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    chain.retain(|m| seen.insert(m.clone()));
}

fn model_cost(model_id: &str, max_tokens: u64) -> Decimal {
    let price = catalog::lookup(model_id)
        .map(|m| m.price_per_million)
        .unwrap_or(Decimal::ZERO);
    price * Decimal::from(max_tokens) / Decimal::from(MICRO_PER_USD)
}

/// Cost of the most expensive catalog model able to serve this request;
/// the baseline for the savings fraction.
fn premium_reference_cost(classification: &Classification, max_tokens: u64) -> Decimal {
    catalog::all_models()
        .iter()
        .filter(|m| satisfies(&m.capabilities, classification))
        .map(|m| m.price_per_million)
        .max()
        .map(|price| price * Decimal::from(max_tokens) / Decimal::from(MICRO_PER_USD))
        .unwrap_or(Decimal::ZERO)
}
