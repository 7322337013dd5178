//! Pre-flight token estimation for chat completion requests

use serde_json::Value;
use std::sync::OnceLock;
use tiktoken_rs::CoreBPE;

/// Tokens added per message by the chat format
const TOKENS_PER_MESSAGE: u64 = 3;
/// Tokens priming the assistant reply
const REPLY_PRIMING_TOKENS: u64 = 3;

fn bpe() -> Option<&'static CoreBPE> {
    static BPE: OnceLock<Option<CoreBPE>> = OnceLock::new();
    BPE.get_or_init(|| match tiktoken_rs::cl100k_base() {
        Ok(bpe) => Some(bpe),
        Err(e) => {
            tracing::warn!(error = %e, "Tokenizer unavailable, falling back to character estimate");
            None
        }
    })
    .as_ref()
}

fn count_text(text: &str) -> u64 {
    match bpe() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len() as u64,
        // Roughly four characters per token
        None => (text.chars().count() as u64).div_ceil(4),
    }
}

fn count_content(content: &Value) -> u64 {
    match content {
        Value::String(text) => count_text(text),
        Value::Array(parts) => parts
            .iter()
            .map(|part| match part {
                Value::String(text) => count_text(text),
                Value::Object(obj) => obj.get("text").and_then(Value::as_str).map(count_text).unwrap_or(0),
                _ => 0,
            })
            .sum(),
        Value::Null => 0,
        other => count_text(&other.to_string()),
    }
}

/// Estimated prompt tokens of a chat completion request body
pub fn prompt_tokens(request: &Value) -> u64 {
    let Some(messages) = request.get("messages").and_then(Value::as_array) else {
        return 0;
    };

    let mut tokens = REPLY_PRIMING_TOKENS;
    for message in messages {
        tokens += TOKENS_PER_MESSAGE;
        if let Some(role) = message.get("role").and_then(Value::as_str) {
            tokens += count_text(role);
        }
        if let Some(name) = message.get("name").and_then(Value::as_str) {
            tokens += count_text(name) + 1;
        }
        if let Some(content) = message.get("content") {
            tokens += count_content(content);
        }
    }

    // Tool definitions count against the prompt
    if let Some(tools) = request.get("tools") {
        tokens += count_text(&tools.to_string());
    }

    tokens
}

/// Completion budget: `max_tokens` (or `max_completion_tokens`) when given
pub fn completion_tokens(request: &Value, default_completion_tokens: u32) -> u64 {
    request
        .get("max_tokens")
        .or_else(|| request.get("max_completion_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(default_completion_tokens as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_prompt_tokens_grow_with_content() {
        let short = json!({"messages": [{"role": "user", "content": "Hi"}]});
        let long = json!({"messages": [
            {"role": "system", "content": "You are a helpful assistant."},
            {"role": "user", "content": "Explain the difference between a mutex and a semaphore in detail."}
        ]});

        let short_count = prompt_tokens(&short);
        assert!(short_count > REPLY_PRIMING_TOKENS);
        assert!(prompt_tokens(&long) > short_count);
    }

    #[test]
    fn test_multipart_content() {
        let request = json!({"messages": [{"role": "user", "content": [
            {"type": "text", "text": "What is in this image?"},
            {"type": "image_url", "image_url": {"url": "https://example.com/a.png"}}
        ]}]});
        let text_only = json!({"messages": [{"role": "user", "content": "What is in this image?"}]});

        assert_eq!(prompt_tokens(&request), prompt_tokens(&text_only));
    }

    #[test]
    fn test_missing_messages() {
        assert_eq!(prompt_tokens(&json!({"model": "x"})), 0);
    }

    #[test]
    fn test_completion_tokens() {
        assert_eq!(completion_tokens(&json!({"max_tokens": 200}), 1024), 200);
        assert_eq!(completion_tokens(&json!({"max_completion_tokens": 50}), 1024), 50);
        assert_eq!(completion_tokens(&json!({}), 1024), 1024);
    }
}
