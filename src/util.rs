//! Workflow id helpers: slug generation and validation.

use regex::Regex;
use std::sync::LazyLock;

use crate::errors::{Result, StageflowError};

/// Longest slug produced from a description.
pub const MAX_SLUG_LEN: usize = 50;

static INTENT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(we|i)\s+want\s+to\b").unwrap());

static FILLER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(get|to|with|for|the|a|an)\b").unwrap());

static NON_ALNUM_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

/// Derive a stable workflow id from a free-text feature description.
///
/// "We want to add the user dashboard" → `add-user-dashboard`.
pub fn slugify(description: &str) -> Result<String> {
    let lower = description.to_lowercase();
    let without_intent = INTENT_REGEX.replace_all(&lower, "");
    let without_filler = FILLER_REGEX.replace_all(&without_intent, "");
    let dashed = NON_ALNUM_REGEX.replace_all(&without_filler, "-");

    let trimmed = dashed.trim_matches('-');
    let capped: String = trimmed.chars().take(MAX_SLUG_LEN).collect();
    let slug = capped.trim_end_matches('-').to_string();

    validate_id(&slug)?;
    Ok(slug)
}

/// Reject ids that are empty or could escape the state directory.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty()
        || id.contains("..")
        || id.contains('/')
        || id.contains('\\')
        || id.starts_with('.')
    {
        return Err(StageflowError::InvalidSlug(id.to_string()));
    }
    Ok(())
}
