//! Utility helpers shared across the crate.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;

// === Identifiers ===

/// Short random identifier: the first 8 hex chars of a v4 UUID.
#[must_use]
pub fn short_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

/// Replace every character that is not ASCII alphanumeric with `-`.
#[must_use]
pub fn sanitize_path_component(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

// === Filesystem Helpers ===

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))
}

// === Text Helpers ===

/// Render JSON with pretty formatting, falling back to a compact string on error.
#[must_use]
pub fn pretty_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Prefix of `s` holding at most `max_chars` characters.
#[must_use]
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Truncate a string to a maximum number of characters, adding an ellipsis if truncated
#[must_use]
pub fn truncate_with_ellipsis(s: &str, max_chars: usize, ellipsis: &str) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let keep = max_chars.saturating_sub(ellipsis.chars().count());
    format!("{}{}", truncate_chars(s, keep), ellipsis)
}

/// First non-empty line of `text`, collapsed and capped for one-line listings.
#[must_use]
pub fn summarize_text(text: &str, max_chars: usize) -> String {
    let line = text
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("");
    let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_with_ellipsis(&collapsed, max_chars, "...")
}
