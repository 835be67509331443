//! `Source:` backlink management.
//!
//! Each synchronized description carries, on its first line, a backlink to
//! the counterpart issue: `Source: <absolute-url>`, followed by a blank line
//! when a body remains. All writes go through [`apply`], all comparisons
//! through [`strip`], so description equality is over the payload and never
//! over a stale URL. Both operations are pure and idempotent.

use std::sync::LazyLock;

use regex::Regex;

static SOURCE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^source:").expect("backlink regex compiles"));

fn is_source_line(line: &str) -> bool {
    SOURCE_LINE.is_match(line)
}

/// Remove leading `Source:` lines (and their blank separators) from a
/// description, returning the payload. Collapses accidental duplicates.
pub fn strip(description: &str) -> String {
    let lines: Vec<&str> = description.lines().collect();
    let mut idx = 0;
    loop {
        if idx < lines.len() && is_source_line(lines[idx]) {
            idx += 1;
            while idx < lines.len() && lines[idx].trim().is_empty() {
                idx += 1;
            }
        } else {
            break;
        }
    }
    lines[idx..].join("\n")
}

/// Payload of an optional description; absence is an empty payload.
pub fn payload(description: Option<&str>) -> String {
    description.map(strip).unwrap_or_default()
}

/// Prepend a fresh `Source:` line for the counterpart, replacing whatever
/// backlink the incoming description carried.
pub fn apply(counterpart_url: &str, description: Option<&str>) -> String {
    let body = payload(description);
    if body.trim().is_empty() {
        format!("Source: {counterpart_url}")
    } else {
        format!("Source: {counterpart_url}\n\n{body}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://gitlab.example.com/group/alpha/-/issues/3";

    #[test]
    fn test_apply_to_plain_body() {
        let result = apply(URL, Some("fix the login flow"));
        assert_eq!(result, format!("Source: {URL}\n\nfix the login flow"));
    }

    #[test]
    fn test_apply_to_absent_description() {
        assert_eq!(apply(URL, None), format!("Source: {URL}"));
        assert_eq!(apply(URL, Some("")), format!("Source: {URL}"));
    }

    #[test]
    fn test_apply_replaces_stale_backlink() {
        let stale = "Source: https://old.example.com/issues/9\n\nbody text";
        assert_eq!(apply(URL, Some(stale)), format!("Source: {URL}\n\nbody text"));
    }

    #[test]
    fn test_apply_is_idempotent() {
        let inputs = [
            None,
            Some("plain body"),
            Some("Source: https://old.example.com/x\n\nbody"),
            Some("Source: a\nSource: b\n\nbody"),
            Some("line one\n\nline three"),
        ];
        for input in inputs {
            let once = apply(URL, input);
            let mut again = once.clone();
            for _ in 0..3 {
                again = apply(URL, Some(&again));
            }
            assert_eq!(again, once, "normalization must be idempotent for {input:?}");
        }
    }

    #[test]
    fn test_strip_collapses_duplicate_source_lines() {
        let doubled = "Source: a\n\nSource: b\n\nbody";
        assert_eq!(strip(doubled), "body");
    }

    #[test]
    fn test_strip_preserves_interior_blank_lines() {
        let body = "Source: a\n\nfirst paragraph\n\nsecond paragraph";
        assert_eq!(strip(body), "first paragraph\n\nsecond paragraph");
    }

    #[test]
    fn test_strip_keeps_non_leading_source_mention() {
        let body = "see below\nSource: not a backlink";
        assert_eq!(strip(body), body);
    }

    #[test]
    fn test_strip_is_case_insensitive() {
        assert_eq!(strip("SOURCE: https://x\n\nbody"), "body");
        assert_eq!(strip("source: https://x\n\nbody"), "body");
    }

    #[test]
    fn test_payload_of_pure_backlink_is_empty() {
        assert_eq!(payload(Some("Source: https://x")), "");
        assert_eq!(payload(None), "");
    }
}
