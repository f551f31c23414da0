// Guards for LLM inputs: payloads are sized with a conservative
// chars-per-token heuristic, truncated with an explicit marker when over
// budget, and untrusted text is delimited so prompts can treat it as data.

use crate::atoms::constants::{DEFAULT_CHARS_PER_TOKEN, TRUNCATION_MARKER};

/// Approximate token count from character length.
pub fn estimate_tokens(text: &str, chars_per_token: usize) -> usize {
    let chars_per_token = chars_per_token.max(1);
    if text.is_empty() {
        return 0;
    }
    text.len().div_ceil(chars_per_token).max(1)
}

/// Truncate text to an approximate token budget, appending the marker.
pub fn truncate_to_token_limit(text: &str, max_tokens: usize, chars_per_token: usize) -> String {
    let normalized = text.trim();
    if max_tokens == 0 {
        return TRUNCATION_MARKER.to_string();
    }
    if normalized.is_empty() {
        return String::new();
    }
    if estimate_tokens(normalized, chars_per_token) <= max_tokens {
        return normalized.to_string();
    }

    let max_chars = max_tokens * chars_per_token.max(1);
    if max_chars <= TRUNCATION_MARKER.len() {
        return TRUNCATION_MARKER.to_string();
    }
    let keep_chars = (max_chars - TRUNCATION_MARKER.len() - 1).max(1);
    // Cut on a char boundary at or below the budget.
    let mut cut = keep_chars.min(normalized.len());
    while cut > 0 && !normalized.is_char_boundary(cut) {
        cut -= 1;
    }
    let truncated = normalized[..cut].trim_end();
    format!("{truncated} {TRUNCATION_MARKER}")
}

/// Delimit untrusted text inside `<TAG>…</TAG>` so the model cannot use it
/// to hijack instructions.
pub fn wrap_untrusted_text(text: &str, tag: &str) -> String {
    let safe_tag = tag.trim().to_uppercase().replace('-', "_");
    let normalized = text.trim();
    format!("<{safe_tag}>\n{normalized}\n</{safe_tag}>")
}

/// Serialize a payload, truncate it to the token budget, and wrap it.
pub fn build_safe_payload_content(
    payload: &serde_json::Value,
    tag: &str,
    max_tokens: usize,
) -> String {
    let raw = payload.to_string();
    let sized = if estimate_tokens(&raw, DEFAULT_CHARS_PER_TOKEN) > max_tokens {
        log::warn!(
            "[llm] Payload over token budget (est {} > {}), truncating",
            estimate_tokens(&raw, DEFAULT_CHARS_PER_TOKEN),
            max_tokens
        );
        truncate_to_token_limit(&raw, max_tokens, DEFAULT_CHARS_PER_TOKEN)
    } else {
        raw
    };
    wrap_untrusted_text(&sized, tag)
}
