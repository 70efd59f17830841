//! Keyword extraction and set-overlap similarity shared by lookup, context and analytics

use lazy_static::lazy_static;
use std::collections::{BTreeSet, HashSet};

lazy_static! {
    static ref STOP_WORDS: HashSet<&'static str> = [
        "the", "an", "and", "or", "but", "in", "on", "at", "to", "for",
        "of", "with", "by", "is", "am", "are", "was", "were", "be", "been",
        "being", "have", "has", "had", "do", "does", "did", "will", "would",
        "shall", "should", "may", "might", "must", "can", "could", "you",
        "he", "she", "it", "we", "they", "me", "him", "her", "us", "them",
        "my", "your", "his", "its", "our", "their", "mine", "yours", "hers",
        "ours", "theirs", "this", "that", "these", "those", "what", "how",
        "why", "when", "where", "who", "whom", "which", "explain", "tell",
        "define", "describe", "please", "about", "give", "show", "know",
        "want", "need", "just", "also", "some", "any", "there", "here",
        "so", "if", "then", "than", "not", "no", "from", "into", "as",
        "all", "more", "most", "very", "too", "whats", "hows",
    ]
    .into_iter()
    .collect();
}

/// Tokens shorter than this are ignored.
const MIN_TOKEN_LEN: usize = 2;

/// Weight given to a query keyword found only in an entry's secondary text.
pub const SECONDARY_WEIGHT: f32 = 0.5;

/// Normalized keyword set. Ordered so that stored keyword lists are deterministic.
pub type KeywordSet = BTreeSet<String>;

/// Lowercased alphanumeric tokens in order of appearance, stopwords included.
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

/// Normalized keyword set for a piece of text: lowercase, stopwords and short tokens removed.
pub fn extract_keywords(text: &str) -> KeywordSet {
    tokenize(text)
        .filter(|t| t.chars().count() >= MIN_TOKEN_LEN && !STOP_WORDS.contains(t.as_str()))
        .collect()
}

/// Weighted Jaccard ratio of `query` against a target described by a primary
/// keyword set and a secondary one.
///
/// Each query keyword scores 1.0 when it is primary, [`SECONDARY_WEIGHT`] when it is
/// only secondary, and 0 otherwise. The sum is divided by `|query ∪ primary|`, so a
/// query identical to the primary text scores exactly 1.0.
pub fn weighted_similarity(query: &KeywordSet, primary: &KeywordSet, secondary: &KeywordSet) -> f32 {
    let union = query.union(primary).count();
    if union == 0 {
        return 0.0;
    }

    let matched: f32 = query
        .iter()
        .map(|q| {
            if primary.contains(q) {
                1.0
            } else if secondary.contains(q) {
                SECONDARY_WEIGHT
            } else {
                0.0
            }
        })
        .sum();

    (matched / union as f32).min(1.0)
}

/// True when the two sets share at least one keyword.
pub fn overlaps(a: &KeywordSet, b: &KeywordSet) -> bool {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    small.iter().any(|k| large.contains(k))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(words: &[&str]) -> KeywordSet {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn test_extract_keywords_strips_stopwords_and_case() {
        let keywords = extract_keywords("What is the Heisenberg Uncertainty principle?");
        assert_eq!(keywords, set(&["heisenberg", "principle", "uncertainty"]));
    }

    #[test]
    fn test_extract_keywords_drops_short_tokens() {
        let keywords = extract_keywords("a b c DNA x-ray");
        assert_eq!(keywords, set(&["dna", "ray"]));
    }

    #[test]
    fn test_extract_keywords_is_deterministic() {
        let text = "Explain photosynthesis in plants, plants need light";
        assert_eq!(extract_keywords(text), extract_keywords(text));
        assert_eq!(extract_keywords(text), set(&["light", "photosynthesis", "plants"]));
    }

    #[test]
    fn test_identical_primary_scores_one() {
        let q = set(&["gravity"]);
        assert_eq!(weighted_similarity(&q, &q, &set(&["force", "mass"])), 1.0);
    }

    #[test]
    fn test_secondary_matches_score_half() {
        let q = set(&["mass"]);
        let primary = set(&["gravity"]);
        let secondary = set(&["mass", "force"]);
        // 0.5 / |{mass, gravity}|
        assert!((weighted_similarity(&q, &primary, &secondary) - 0.25).abs() < f32::EPSILON);
    }

    #[test]
    fn test_disjoint_sets_score_zero() {
        let q = set(&["history"]);
        assert_eq!(weighted_similarity(&q, &set(&["gravity"]), &set(&["force"])), 0.0);
        assert_eq!(weighted_similarity(&KeywordSet::new(), &KeywordSet::new(), &KeywordSet::new()), 0.0);
    }

    #[test]
    fn test_extra_query_words_lower_similarity() {
        let q = set(&["gravity", "moon"]);
        let primary = set(&["gravity"]);
        assert!((weighted_similarity(&q, &primary, &KeywordSet::new()) - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_overlaps() {
        assert!(overlaps(&set(&["a1", "b2"]), &set(&["b2"])));
        assert!(!overlaps(&set(&["a1"]), &set(&["b2"])));
    }
}
