//! Structured-output extraction from free-form LLM text.
//!
//! Models often wrap JSON in markdown fences or surround it with prose.
//! Parsing tries, in order: the whole text, the first fenced block, then the
//! first balanced `{...}` or `[...]` span.

use serde_json::Value;

use crate::error::AiError;

/// Parse a JSON document out of an LLM response.
pub fn parse_json_response(raw: &str) -> Result<Value, AiError> {
    let trimmed = raw.trim();

    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    if let Some(inner) = fenced_block(trimmed)
        && let Ok(value) = serde_json::from_str(inner)
    {
        return Ok(value);
    }

    if let Some(span) = balanced_span(trimmed)
        && let Ok(value) = serde_json::from_str(span)
    {
        return Ok(value);
    }

    Err(AiError::Parse(format!(
        "no JSON document found in response: {}",
        preview(trimmed)
    )))
}

/// Contents of the first ```` ```json ```` or bare ```` ``` ```` block.
fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    // Skip the language tag line, if any.
    let body = match after.find('\n') {
        Some(nl) if after[..nl].trim().chars().all(|c| c.is_ascii_alphanumeric()) => {
            &after[nl + 1..]
        }
        _ => after,
    };
    let end = body.find("```")?;
    Some(body[..end].trim())
}

/// The first `{...}` (or `[...]`) span whose brackets balance, ignoring
/// brackets inside string literals.
fn balanced_span(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let open = text[start..].chars().next()?;
    let close = if open == '{' { '}' } else { ']' };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

fn preview(text: &str) -> String {
    const MAX: usize = 120;
    if text.chars().count() <= MAX {
        return text.to_string();
    }
    let cut: String = text.chars().take(MAX).collect();
    format!("{cut}...")
}
