//! Text normalization helpers

use std::borrow::Cow;
use regex::Regex;
use lazy_static::lazy_static;

lazy_static! {
    static ref WHITESPACE_REGEX: Regex = Regex::new(r"\s+").unwrap();
    static ref TRAILING_PUNCT_REGEX: Regex = Regex::new(r"[\s\p{P}]+$").unwrap();
}

pub struct TextUtils;

impl TextUtils {
    /// Case-insensitive substring test
    pub fn contains_ignore_case(text: &str, pattern: &str) -> bool {
        if pattern.is_empty() {
            return true;
        }
        text.to_lowercase().contains(&pattern.to_lowercase())
    }

    /// Collapse runs of whitespace into single spaces and trim the ends
    pub fn normalize_whitespace(text: &str) -> Cow<'_, str> {
        if WHITESPACE_REGEX.find_iter(text).any(|m| m.as_str() != " ") || text.trim() != text {
            Cow::Owned(WHITESPACE_REGEX.replace_all(text, " ").trim().to_string())
        } else {
            Cow::Borrowed(text)
        }
    }

    /// Key under which identical queries are merged: lowercased, whitespace
    /// collapsed, trailing punctuation removed.
    pub fn dedup_key(query: &str) -> String {
        let lowered = query.to_lowercase();
        let collapsed = Self::normalize_whitespace(&lowered);
        TRAILING_PUNCT_REGEX.replace(&collapsed, "").into_owned()
    }

    /// Truncate to at most `max_chars` characters, ending with "..." when cut.
    pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> Cow<'_, str> {
        if text.chars().count() <= max_chars {
            Cow::Borrowed(text)
        } else if max_chars <= 3 {
            Cow::Borrowed("...")
        } else {
            let mut result: String = text.chars().take(max_chars - 3).collect();
            result.push_str("...");
            Cow::Owned(result)
        }
    }
}
