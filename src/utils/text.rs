use sha2::{Digest, Sha256};

/// Removes a Markdown code fence wrapping the whole text, whatever its language tag.
/// Text holding more than one fenced block is returned trimmed but otherwise intact.
pub fn strip_code_blocks(s: &str) -> String {
    let s = s.trim();
    if !s.starts_with("```") || !s.ends_with("```") || s.len() < 6 {
        return s.to_string();
    }

    let inner = &s[3..s.len() - 3];
    if inner.contains("```") {
        return s.to_string();
    }
    // Drop the info string ("json", "markdown", ...) on the opening line.
    let body = match inner.find('\n') {
        Some(pos) if !inner[..pos].trim().contains(' ') => &inner[pos + 1..],
        Some(_) => inner,
        None => inner.trim_start_matches(|c: char| c.is_ascii_alphanumeric()),
    };
    body.trim().to_string()
}

/// Lowercase ASCII letters, digits, `_` and `-`, not starting with a separator.
pub fn is_safe_identifier(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
        && !id.starts_with(['_', '-'])
}

/// First `len` hex characters of the SHA-256 of `input`.
pub fn short_digest(input: &str, len: usize) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex.chars().take(len).collect()
}
