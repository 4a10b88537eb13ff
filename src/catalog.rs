//! Static model catalog for the BlockRun marketplace.
//!
//! The catalog is advisory: it drives tier selection, pricing, and fallback
//! ordering, but an explicit model id absent from the catalog is still
//! forwarded upstream unchanged.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::sync::LazyLock;

/// Price/quality tier a model belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Free,
    Eco,
    Standard,
    Premium,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Free => "free",
            ModelTier::Eco => "eco",
            ModelTier::Standard => "standard",
            ModelTier::Premium => "premium",
        }
    }
}

/// Capability flags a model advertises.
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    pub reasoning: bool,
    pub code: bool,
    pub vision: bool,
    pub long_context: bool,
}

/// One marketplace model.
#[derive(Debug, Clone)]
pub struct ModelEntry {
    pub id: &'static str,
    pub name: &'static str,
    pub tier: ModelTier,
    /// Blended USD price per million tokens. Zero for free models.
    pub price_per_million: Decimal,
    pub capabilities: Capabilities,
    pub requires_payment: bool,
    /// The guaranteed last step of every fallback chain.
    pub emergency_free: bool,
}

fn me(
    id: &'static str,
    name: &'static str,
    tier: ModelTier,
    price: Decimal,
    reasoning: bool,
    code: bool,
    vision: bool,
    long_context: bool,
) -> ModelEntry {
    ModelEntry {
        id,
        name,
        tier,
        price_per_million: price,
        capabilities: Capabilities {
            reasoning,
            code,
            vision,
            long_context,
        },
        requires_payment: price > Decimal::ZERO,
        emergency_free: false,
    }
}

static CATALOG: LazyLock<Vec<ModelEntry>> = LazyLock::new(|| {
    let mut models = vec![
        // Premium
        me("anthropic/claude-opus-4.6", "Claude Opus 4.6", ModelTier::Premium, dec!(15.0), true, true, true, true),
        me("openai/gpt-5.2", "GPT-5.2", ModelTier::Premium, dec!(10.0), true, false, true, true),
        me("google/gemini-3-pro-preview", "Gemini 3 Pro", ModelTier::Premium, dec!(8.0), true, false, true, true),
        me("openai/gpt-5.3-codex", "GPT-5.3 Codex", ModelTier::Premium, dec!(7.25), true, true, false, false),
        // Standard
        me("anthropic/claude-sonnet-4", "Claude Sonnet 4", ModelTier::Standard, dec!(6.0), true, true, false, false),
        me("google/gemini-2.5-pro", "Gemini 2.5 Pro", ModelTier::Standard, dec!(4.5), true, false, true, true),
        me("anthropic/claude-haiku-4.5", "Claude Haiku 4.5", ModelTier::Standard, dec!(2.0), false, true, false, false),
        me("moonshot/kimi-k2.5", "Kimi K2.5", ModelTier::Standard, dec!(1.45), true, true, true, false),
        // Eco
        me("openai/gpt-5-mini", "GPT-5 Mini", ModelTier::Eco, dec!(1.125), false, false, false, false),
        me("xai/grok-code-fast-1", "Grok Code Fast", ModelTier::Eco, dec!(0.85), false, true, false, false),
        me("google/gemini-2.5-flash", "Gemini 2.5 Flash", ModelTier::Eco, dec!(0.375), false, false, true, true),
        me("xai/grok-4-1-fast-reasoning", "Grok 4.1 Fast Reasoning", ModelTier::Eco, dec!(0.35), true, false, false, false),
        me("deepseek/deepseek-reasoner", "DeepSeek Reasoner", ModelTier::Eco, dec!(0.35), true, false, false, false),
        me("deepseek/deepseek-chat", "DeepSeek V3.2", ModelTier::Eco, dec!(0.28), false, true, false, false),
        me("openai/gpt-5-nano", "GPT-5 Nano", ModelTier::Eco, dec!(0.225), false, false, false, false),
    ];
    // Free tier; the emergency model terminates every chain
    let mut emergency = me(
        "nvidia/gpt-oss-120b",
        "NVIDIA GPT-OSS 120B",
        ModelTier::Free,
        dec!(0.0),
        false,
        true,
        false,
        false,
    );
    emergency.emergency_free = true;
    models.push(emergency);
    models
});

/// All catalog entries in declaration order (descending price within tier).
pub fn all_models() -> &'static [ModelEntry] {
    &CATALOG
}

/// Look up a model by its already-normalized id.
pub fn lookup(id: &str) -> Option<&'static ModelEntry> {
    CATALOG.iter().find(|m| m.id == id)
}

/// The cheapest model tagged `emergency_free`.
///
/// Exactly one model carries the tag today, but selection stays
/// price-ordered so adding a second free model cannot change the guarantee.
pub fn emergency_model() -> &'static ModelEntry {
    CATALOG
        .iter()
        .filter(|m| m.emergency_free)
        .min_by_key(|m| m.price_per_million)
        .expect("catalog must contain an emergency free model")
}

/// Normalize a client-supplied model id.
///
/// Trims surrounding whitespace and lowercases the vendor segment before the
/// first `/`; the rest of the id is preserved byte for byte. Idempotent.
pub fn normalize_model_id(raw: &str) -> String {
    let trimmed = raw.trim();
    match trimmed.split_once('/') {
        Some((vendor, rest)) => format!("{}/{}", vendor.to_lowercase(), rest),
        None => trimmed.to_string(),
    }
}
