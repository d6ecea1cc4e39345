//! Quota / rate-limit signal detection.
//!
//! Two tiers: structured JSON events are inspected by the adapters, which
//! call into the keyword helpers here; plain-text backends fall back to the
//! keyword scan plus a strict 429 pattern that refuses to fire on bare
//! occurrences of the number (e.g. line ranges in file references).

use regex::Regex;
use std::sync::OnceLock;

/// Keywords that indicate the provider refused the call on rate/usage
/// grounds. Scanned case-insensitively.
pub const QUOTA_KEYWORDS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "quota exceeded",
    "insufficient credit",
    "billing error",
    "usage limit",
    "overloaded",
    "too many requests",
];

/// Substrings in a structured error `type` field that mark a quota error.
pub const QUOTA_ERROR_TYPES: &[&str] = &["rate_limit", "overloaded", "billing", "quota"];

/// Substrings in a structured error message that mark a quota error.
pub const QUOTA_MESSAGE_KEYWORDS: &[&str] = &[
    "rate limit",
    "quota",
    "insufficient credit",
    "billing",
    "usage limit",
    "overloaded",
    "too many requests",
];

fn http_429_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:http|status|error|code)\s*[:=-]?\s*429\b").unwrap()
    })
}

fn contextual_429_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b429\b.*\b(?:too many requests|rate limit|quota)\b").unwrap()
    })
}

/// Case-insensitive scan for the plain quota keyword set.
pub fn contains_quota_keyword(text: &str) -> bool {
    let lower = text.to_lowercase();
    QUOTA_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

/// True when a structured error `type` marks a quota condition.
pub fn is_quota_error_type(error_type: &str) -> bool {
    QUOTA_ERROR_TYPES.iter().any(|kw| error_type.contains(kw))
}

/// Case-insensitive scan of a structured error message.
pub fn message_has_quota_signal(message: &str) -> bool {
    let lower = message.to_lowercase();
    QUOTA_MESSAGE_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

/// Detect an HTTP 429 with the disambiguation contract: the number must be
/// introduced by an http/status/error/code marker, or be followed by a
/// rate-limit phrase. A bare "429" (line numbers, ids) never matches.
pub fn is_http_429(text: &str) -> bool {
    http_429_re().is_match(text) || contextual_429_re().is_match(text)
}

/// Full plain-text scan for text-only backends: keywords plus strict 429.
pub fn scan_plain_text(text: &str) -> bool {
    contains_quota_keyword(text) || is_http_429(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_scan_hits_rate_limit() {
        assert!(contains_quota_keyword("Error: Rate limit exceeded, retry later"));
        assert!(contains_quota_keyword("usage limit reached for this billing period"));
        assert!(!contains_quota_keyword("wrote 200 lines to main.rs"));
    }

    #[test]
    fn bare_429_in_line_range_does_not_fire() {
        assert!(!scan_plain_text("Read docs/FRONTEND.md lines 429-431"));
        assert!(!scan_plain_text("issue #429 closed"));
    }

    #[test]
    fn real_429_signals_fire() {
        assert!(scan_plain_text("HTTP 429 Too Many Requests"));
        assert!(scan_plain_text("status: 429"));
        assert!(scan_plain_text("error code 429"));
        assert!(scan_plain_text("got 429 because the rate limit was hit"));
    }

    #[test]
    fn structured_error_type_detection() {
        assert!(is_quota_error_type("rate_limit_error"));
        assert!(is_quota_error_type("overloaded_error"));
        assert!(!is_quota_error_type("invalid_request_error"));
    }

    #[test]
    fn structured_message_detection() {
        assert!(message_has_quota_signal("Insufficient credit balance"));
        assert!(!message_has_quota_signal("file not found"));
    }
}
