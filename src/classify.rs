//! Prompt classifier.
//!
//! Pure and deterministic: the same message list always produces the same
//! tag set. The primary tag is decided first-match-wins (vision, then code,
//! then reasoning, then general); `long-context` is additive and applies
//! whenever the total prompt length crosses the threshold.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

/// Prompt length (chars) above which `long-context` is added.
const LONG_CONTEXT_THRESHOLD: usize = 32 * 1024;

static CODE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?x)
        ``` |                                        # fenced block
        \b\w+\.(rs|py|js|ts|go|java|c|cpp|h|rb|sh|toml|json|yaml|yml)\b |
        \b(fn|def|class|impl|struct|enum|import|include|async|await|const|let|var|return)\s |
        =>|::|\{\}|\(\)
        "#,
    )
    .unwrap()
});

static REASONING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?xi)
        \b(proof|prove|theorem|derive|deduce|step\ by\ step|chain\ of\ thought|
           reason|logically|explain\ why|formally)\b |
        \d\s*[\+\-\*/=^]\s*\d |
        sqrt|√|∫|Σ
        ",
    )
    .unwrap()
});

/// Tag set inferred for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Classification {
    pub vision: bool,
    pub code: bool,
    pub reasoning: bool,
    pub long_context: bool,
    pub general: bool,
}

impl Classification {
    /// Tag names, for routing-decision reasoning strings and logs.
    pub fn tags(&self) -> Vec<&'static str> {
        let mut tags = Vec::new();
        if self.vision {
            tags.push("vision");
        }
        if self.code {
            tags.push("code");
        }
        if self.reasoning {
            tags.push("reasoning");
        }
        if self.long_context {
            tags.push("long-context");
        }
        if self.general {
            tags.push("general");
        }
        tags
    }

    /// Whether any tag beyond `general` demands a premium-tier model.
    pub fn wants_premium(&self) -> bool {
        self.reasoning || self.code || self.long_context
    }
}

/// Classify a chat request's messages.
pub fn classify(messages: &[Value]) -> Classification {
    let mut out = Classification::default();

    let has_non_text = messages.iter().any(message_has_non_text_part);
    let text = concatenated_text(messages);

    if text.len() > LONG_CONTEXT_THRESHOLD {
        out.long_context = true;
    }

    if has_non_text {
        out.vision = true;
    } else if CODE_RE.is_match(&text) {
        out.code = true;
    } else if REASONING_RE.is_match(&text) {
        out.reasoning = true;
    } else {
        out.general = true;
    }

    out
}

fn message_has_non_text_part(message: &Value) -> bool {
    match message.get("content") {
        Some(Value::Array(parts)) => parts.iter().any(|part| {
            part.get("type")
                .and_then(Value::as_str)
                .is_some_and(|t| t != "text")
        }),
        _ => false,
    }
}

/// Concatenate every textual content fragment across all messages.
fn concatenated_text(messages: &[Value]) -> String {
    let mut text = String::new();
    for message in messages {
        match message.get("content") {
            Some(Value::String(s)) => {
                text.push_str(s);
                text.push('\n');
            }
            Some(Value::Array(parts)) => {
                for part in parts {
                    if let Some(s) = part.get("text").and_then(Value::as_str) {
                        text.push_str(s);
                        text.push('\n');
                    }
                }
            }
            _ => {}
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user(content: &str) -> Value {
        json!({"role": "user", "content": content})
    }

    #[test]
    fn test_greeting_is_general() {
        let c = classify(&[user("Hello there, how are you today?")]);
        assert!(c.general);
        assert!(!c.code && !c.reasoning && !c.vision && !c.long_context);
    }

    #[test]
    fn test_fenced_block_is_code() {
        let c = classify(&[user("Why does this fail?\n```\nlet x = 1;\n```")]);
        assert!(c.code);
        assert!(!c.general);
    }

    #[test]
    fn test_filename_is_code() {
        let c = classify(&[user("There is a bug somewhere in main.rs")]);
        assert!(c.code);
    }

    #[test]
    fn test_proof_request_is_reasoning() {
        let c = classify(&[user("Prove sqrt(2) is irrational")]);
        assert!(c.reasoning);
        assert!(!c.general);
    }

    #[test]
    fn test_image_part_is_vision() {
        let msg = json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "what is in this picture?"},
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,xxxx"}}
            ]
        });
        let c = classify(&[msg]);
        assert!(c.vision);
        // vision wins even though "picture" text alone would be general
        assert!(!c.general);
    }

    #[test]
    fn test_vision_shadows_code() {
        let msg = json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "transcribe the code in ```this``` screenshot"},
                {"type": "image_url", "image_url": {"url": "https://example.com/s.png"}}
            ]
        });
        let c = classify(&[msg]);
        assert!(c.vision);
        assert!(!c.code);
    }

    #[test]
    fn test_long_context_is_additive() {
        let big = "a".repeat(40 * 1024);
        let c = classify(&[user(&big)]);
        assert!(c.long_context);
        assert!(c.general, "long-context stacks on the primary tag");
    }

    #[test]
    fn test_deterministic() {
        let messages = vec![user("derive the closed form step by step")];
        assert_eq!(classify(&messages), classify(&messages));
    }
}
