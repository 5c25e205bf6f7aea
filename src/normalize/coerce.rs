use std::sync::LazyLock;

use itertools::Itertools;
use regex::Regex;

use crate::error::RejectionReason;
use crate::extract::clean::collapse_ws;

static COUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(\d{1,3}(?:,\d{3})+|\d+(?:\.\d+)?)\s*([KMB])?(?:\s+downloads?)?$").unwrap()
});

static A11Y_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:\s*[(\[]?\s*(?:link\s+)?opens?\s+in\s+(?:a\s+)?new\s+(?:window|tab)\s*[)\]]?\s*)+$",
    )
    .unwrap()
});

const LIST_DELIMITERS: &[char] = &[',', ';', '|', '\n', '•'];
const NO_USAGE_GUIDE: &str = "does not have a usage guide yet";

/// Largest count the SQLite INTEGER column holds.
const MAX_COUNT: u64 = i64::MAX as u64;

/// `1,234`, `1.2K`, `3M`, `1B`, `512 downloads`. A bare fraction is a ratio, not a count,
/// and anything above `i64::MAX` is not a count either.
pub fn parse_count(raw: &str) -> Option<u64> {
    let caps = COUNT.captures(raw.trim())?;
    let number = caps[1].replace(',', "");
    let multiplier = match caps.get(2).map(|m| m.as_str().to_ascii_uppercase()) {
        Some(s) if s == "K" => 1_000.0,
        Some(s) if s == "M" => 1_000_000.0,
        Some(s) if s == "B" => 1_000_000_000.0,
        _ => {
            if number.contains('.') {
                return None;
            }
            return number.parse::<u64>().ok().filter(|n| *n <= MAX_COUNT);
        }
    };
    let value: f64 = number.parse().ok()?;
    let scaled = (value * multiplier).round();
    if !scaled.is_finite() || scaled >= MAX_COUNT as f64 {
        return None;
    }
    Some(scaled as u64)
}

pub fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "yes" | "true" | "y" => Some(true),
        "no" | "false" | "n" => Some(false),
        _ => None,
    }
}

/// Lowercased tag with screen-reader suffixes removed.
pub fn clean_tag(raw: &str) -> String {
    let stripped = A11Y_SUFFIX.replace(raw, "");
    collapse_ws(&stripped).to_lowercase()
}

/// Case-insensitive de-duplication in first-seen order.
pub fn dedupe_tags<I, S>(raw: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    raw.into_iter()
        .map(|t| clean_tag(t.as_ref()))
        .filter(|t| !t.is_empty())
        .unique()
        .collect()
}

/// Split a delimiter-joined value into trimmed, non-empty, unique entries.
pub fn split_list(text: &str) -> Vec<String> {
    text.split(LIST_DELIMITERS)
        .map(collapse_ws)
        .filter(|s| !s.is_empty())
        .unique()
        .collect()
}

/// Entries already split by the page structure; only line breaks split further.
pub fn flatten_list(entries: &[String]) -> Vec<String> {
    entries
        .iter()
        .flat_map(|e| e.split('\n'))
        .map(collapse_ws)
        .filter(|s| !s.is_empty())
        .unique()
        .collect()
}

pub fn is_usage_placeholder(text: &str) -> bool {
    text.to_lowercase().contains(NO_USAGE_GUIDE)
}

/// Well-formed http(s) URL with a host, fragment dropped, no trailing slash.
pub fn canonical_url(raw: &str) -> Result<String, RejectionReason> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(RejectionReason::MissingSourceUrl);
    }
    let malformed = || RejectionReason::MalformedSourceUrl {
        raw: raw.to_string(),
    };
    let mut url = url::Url::parse(raw).map_err(|_| malformed())?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().map_or(true, str::is_empty) {
        return Err(malformed());
    }
    url.set_fragment(None);
    let s = url.to_string();
    Ok(match s.strip_suffix('/') {
        Some(trimmed) if url.path() != "/" => trimmed.to_string(),
        _ => s,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts() {
        assert_eq!(parse_count("1,234"), Some(1234));
        assert_eq!(parse_count("1.2K"), Some(1200));
        assert_eq!(parse_count("3m"), Some(3_000_000));
        assert_eq!(parse_count("1B"), Some(1_000_000_000));
        assert_eq!(parse_count("512 downloads"), Some(512));
        assert_eq!(parse_count("0"), Some(0));
        assert_eq!(parse_count("0.95"), None);
        assert_eq!(parse_count("12,34"), None);
        assert_eq!(parse_count("lots"), None);
        assert_eq!(parse_count(""), None);
    }

    #[test]
    fn counts_beyond_i64_are_rejected() {
        assert_eq!(parse_count("99999999999B"), None);
        assert_eq!(parse_count("18446744073709551615"), None);
        assert_eq!(parse_count("9223372036854775807"), Some(i64::MAX as u64));
        assert_eq!(parse_count("9,000,000B"), Some(9_000_000_000_000_000));
    }

    #[test]
    fn flags_are_strict() {
        assert_eq!(parse_flag(" Yes "), Some(true));
        assert_eq!(parse_flag("false"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
        assert_eq!(parse_flag("Apache 2.0"), None);
    }

    #[test]
    fn tags_fold_case_and_drop_suffixes() {
        assert_eq!(dedupe_tags(["BERT", "bert", "Bert"]), vec!["bert"]);
        assert_eq!(
            dedupe_tags(["NLP (opens in new window)", "nlp", " Text  Generation ", ""]),
            vec!["nlp", "text generation"]
        );
        assert_eq!(clean_tag("Vision (opens in new window) (opens in new window)"), "vision");
        assert_eq!(clean_tag("Audio [opens in a new tab](opens in new window)"), "audio");
    }

    #[test]
    fn lists_strip_empty_entries() {
        assert_eq!(split_list("Alice, , Bob;Alice |  "), vec!["Alice", "Bob"]);
        assert_eq!(
            flatten_list(&["Google\nDeepMind".into(), "  ".into(), "Google".into()]),
            vec!["Google", "DeepMind"]
        );
    }

    #[test]
    fn canonical_urls() {
        assert_eq!(
            canonical_url("https://www.kaggle.com/models/google/gemma/#top").unwrap(),
            "https://www.kaggle.com/models/google/gemma"
        );
        assert_eq!(canonical_url("  "), Err(RejectionReason::MissingSourceUrl));
        assert!(matches!(
            canonical_url("ftp://x.test/a"),
            Err(RejectionReason::MalformedSourceUrl { .. })
        ));
        assert!(canonical_url("not a url").is_err());
        let once = canonical_url("https://build.nvidia.com/meta/llama").unwrap();
        assert_eq!(canonical_url(&once).unwrap(), once);
    }
}
