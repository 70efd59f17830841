//! Utilities module - text normalization and keyword extraction

pub mod keywords;
pub mod text_utils;

// Re-export commonly used utilities
pub use keywords::{extract_keywords, weighted_similarity, KeywordSet};
pub use text_utils::TextUtils;
