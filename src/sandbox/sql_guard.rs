//! Read-only SQL validation for the sandbox `db.*` surface
//!
//! Read-only is defined as: a single top-level `SELECT` after trimming,
//! with no `INTO`, `ATTACH` or `PRAGMA`.

use regex::Regex;
use std::sync::OnceLock;

fn forbidden_keywords() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // Unwrap is fine for a static pattern; a bad pattern is a build bug.
        #[allow(clippy::unwrap_used)]
        Regex::new(r"(?i)\b(INTO|ATTACH|PRAGMA)\b").unwrap()
    })
}

/// Validate a statement for the sandbox. Returns the trimmed statement on
/// success and a human-readable reason on rejection.
pub fn check_read_only(sql: &str) -> Result<String, String> {
    let trimmed = sql.trim().trim_end_matches(';').trim();

    if trimmed.is_empty() {
        return Err("empty statement".to_string());
    }

    // A semicolon left after trimming trailing ones means multiple
    // statements were supplied.
    if trimmed.contains(';') {
        return Err("multiple statements are not allowed".to_string());
    }

    if !trimmed[..trimmed.len().min(7)].eq_ignore_ascii_case("select ")
        && !trimmed.eq_ignore_ascii_case("select")
    {
        return Err("only SELECT statements are allowed".to_string());
    }

    if let Some(m) = forbidden_keywords().find(trimmed) {
        return Err(format!("forbidden keyword: {}", m.as_str().to_uppercase()));
    }

    Ok(trimmed.to_string())
}
