//! Knowledge entry records and insertion requests

use crate::error::ValidationError;
use crate::utils::keywords::{extract_keywords, KeywordSet};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const DEFAULT_CATEGORY: &str = "general";
pub const DEFAULT_DIFFICULTY: &str = "intermediate";
pub const DEFAULT_FIELD: &str = "General";

/// A stored question/answer pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub id: String,
    pub category: String,
    pub question: String,
    pub answer: String,
    /// Sorted keywords of question and answer text combined
    pub keywords: Vec<String>,
    pub source: String,
    pub confidence: f32,
    pub difficulty_level: String,
    pub academic_field: String,
    pub citation: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl KnowledgeEntry {
    pub fn from_new(id: String, new: NewKnowledgeEntry, created_at: DateTime<Utc>) -> Self {
        let keywords = entry_keywords(&new.question, &new.answer).into_iter().collect();
        Self {
            id,
            category: new.category,
            question: new.question,
            answer: new.answer,
            keywords,
            source: new.source,
            confidence: new.confidence,
            difficulty_level: new.difficulty_level,
            academic_field: new.academic_field,
            citation: new.citation,
            created_at,
        }
    }
}

/// Keywords stored with an entry
pub fn entry_keywords(question: &str, answer: &str) -> KeywordSet {
    let mut keywords = extract_keywords(question);
    keywords.extend(extract_keywords(answer));
    keywords
}

pub fn validate_confidence(confidence: f32) -> Result<(), ValidationError> {
    if confidence.is_finite() && (0.0..=1.0).contains(&confidence) {
        Ok(())
    } else {
        Err(ValidationError::ConfidenceOutOfRange(confidence))
    }
}

/// Request to add an entry. Ids, keywords and timestamps are assigned by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewKnowledgeEntry {
    pub question: String,
    pub answer: String,
    pub source: String,
    pub confidence: f32,
    pub category: String,
    pub difficulty_level: String,
    pub academic_field: String,
    pub citation: Option<String>,
}

impl NewKnowledgeEntry {
    pub fn new(
        question: impl Into<String>,
        answer: impl Into<String>,
        source: impl Into<String>,
        confidence: f32,
    ) -> Self {
        Self {
            question: question.into(),
            answer: answer.into(),
            source: source.into(),
            confidence,
            category: DEFAULT_CATEGORY.to_string(),
            difficulty_level: DEFAULT_DIFFICULTY.to_string(),
            academic_field: DEFAULT_FIELD.to_string(),
            citation: None,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_field(mut self, academic_field: impl Into<String>) -> Self {
        self.academic_field = academic_field.into();
        self
    }

    pub fn with_citation(mut self, citation: impl Into<String>) -> Self {
        self.citation = Some(citation.into());
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_confidence(self.confidence)?;
        if self.question.trim().is_empty() {
            return Err(ValidationError::EmptyQuestion);
        }
        if self.answer.trim().is_empty() {
            return Err(ValidationError::EmptyAnswer);
        }
        Ok(())
    }
}

/// Best candidate for a lookup.
#[derive(Debug, Clone)]
pub struct KnowledgeMatch {
    pub entry: Arc<KnowledgeEntry>,
    /// Keyword similarity in [0, 1]
    pub similarity: f32,
    /// similarity × confidence
    pub score: f32,
}
