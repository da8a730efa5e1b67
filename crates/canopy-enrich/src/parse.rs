use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;

#[derive(Debug, Deserialize)]
struct DescriptionResponse {
    description: String,
}

fn quoted_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            Regex::new(r#""description"\s*:\s*"((?:[^"\\]|\\.)*)""#).expect("valid regex"),
            Regex::new(r#"(?i)description['"]?\s*[:=]\s*['"]([^'"\n]+)['"]"#).expect("valid regex"),
            Regex::new(r#"(?m)^\s*["'`]([^"'`\n]{3,})["'`]\s*$"#).expect("valid regex"),
        ]
    })
}

/// Extracts the description from a completion response, trying strict JSON,
/// then the first `{...}` object inside the text, then quoted-value patterns
/// of decreasing strictness. Returns the normalized text, or `None` when
/// nothing usable was found.
pub fn parse_description(raw: &str, max_words: usize) -> Option<String> {
    let text = strip_code_fence(raw.trim());

    if let Ok(parsed) = serde_json::from_str::<DescriptionResponse>(text) {
        return normalize_description(&parsed.description, max_words);
    }
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            if let Ok(parsed) = serde_json::from_str::<DescriptionResponse>(&text[start..=end]) {
                return normalize_description(&parsed.description, max_words);
            }
        }
    }
    for pattern in quoted_patterns() {
        if let Some(captured) = pattern.captures(text).and_then(|captures| captures.get(1)) {
            let value = unescape(captured.as_str());
            if let Some(description) = normalize_description(&value, max_words) {
                return Some(description);
            }
        }
    }
    None
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.split_once('\n').map(|(_, body)| body).unwrap_or(rest);
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

fn unescape(value: &str) -> String {
    serde_json::from_str::<String>(&format!("\"{value}\"")).unwrap_or_else(|_| value.to_string())
}

/// First non-empty line, whitespace collapsed, a leading marker glyph
/// separated from the text by one space, capped at `max_words` words after
/// the marker.
pub fn normalize_description(text: &str, max_words: usize) -> Option<String> {
    let line = text.lines().map(str::trim).find(|line| !line.is_empty())?;
    let line = line.trim_matches(|c| c == '"' || c == '\'' || c == '`').trim();

    let marker_len: usize = line
        .chars()
        .take_while(|c| is_marker_char(*c))
        .map(char::len_utf8)
        .sum();
    let (marker, rest) = line.split_at(marker_len);
    let words: Vec<&str> = rest.split_whitespace().take(max_words.max(1)).collect();

    let mut out = String::new();
    if !marker.is_empty() {
        out.push_str(marker);
    }
    if !words.is_empty() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(&words.join(" "));
    }
    if out.is_empty() || words.is_empty() {
        return None;
    }
    Some(out)
}

fn is_marker_char(c: char) -> bool {
    !c.is_ascii() && !c.is_alphanumeric() && !c.is_whitespace()
}
