//! PII redaction for log surfaces.
//!
//! A process-wide toggle; when enabled, [`text`] masks email addresses and
//! phone numbers before they reach any log or observer sink.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use regex::Regex;

static ENABLED: AtomicBool = AtomicBool::new(false);

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)[a-z0-9._%+\-]+@[a-z0-9.\-]+\.[a-z]{2,}").unwrap())
}

fn phone_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\+?\d[\d\s\-]{7,}\d").unwrap())
}

pub fn set_enabled(v: bool) {
    ENABLED.store(v, Ordering::Relaxed);
}

pub fn enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

/// Masks emails and phone numbers when redaction is enabled.
pub fn text(input: &str) -> String {
    if !enabled() || input.trim().is_empty() {
        return input.to_string();
    }
    let out = email_re().replace_all(input, "[REDACTED_EMAIL]");
    phone_re().replace_all(&out, "[REDACTED_PHONE]").into_owned()
}

/// Clips text for log lines, keeping the first 120 bytes on a char boundary.
pub fn clip(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.len() <= 120 {
        return trimmed.to_string();
    }
    let mut end = 120;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &trimmed[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_email_and_phone_when_enabled() {
        set_enabled(true);
        let out = text("mail budi@example.com or call +62 812-3456-7890");
        assert!(out.contains("[REDACTED_EMAIL]"));
        assert!(out.contains("[REDACTED_PHONE]"));
        set_enabled(false);
    }

    #[test]
    fn passthrough_when_disabled() {
        set_enabled(false);
        let raw = "budi@example.com";
        assert_eq!(text(raw), raw);
    }

    #[test]
    fn clip_limits_long_text() {
        let long = "x".repeat(200);
        let out = clip(&long);
        assert!(out.len() <= 124);
        assert!(out.ends_with("..."));
    }
}
