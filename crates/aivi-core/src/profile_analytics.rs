//! Learning statistics derived from conversation memory.
//!
//! Nothing here owns durable state: topic and question-type counters live on the
//! [`UserProfile`], everything else is recomputed from sessions on demand.

use crate::memory::{ConversationSession, MessageMetadata, Role, SuccessPattern, UserProfile};
use crate::utils::keywords::tokenize;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

pub const GENERAL_TOPIC: &str = "general";

lazy_static! {
    static ref TOPIC_KEYWORDS: Vec<(&'static str, HashSet<&'static str>)> = vec![
        ("math", ["math", "maths", "mathematics", "calculate", "calculus", "equation", "algebra", "geometry"].into_iter().collect()),
        ("science", ["science", "physics", "chemistry", "biology", "atom", "cell", "energy", "gravity"].into_iter().collect()),
        ("english", ["english", "grammar", "writing", "literature", "poetry", "noun", "verb"].into_iter().collect()),
        ("history", ["history", "historical", "ancient", "medieval", "war", "revolution"].into_iter().collect()),
        ("programming", ["code", "coding", "programming", "python", "javascript", "rust", "algorithm"].into_iter().collect()),
    ];
}

const DEFINITION_WORDS: &[&str] = &["what", "define", "definition", "meaning", "means"];
const EXPLANATION_WORDS: &[&str] = &["how", "why", "steps", "process", "explain"];
const PROBLEM_WORDS: &[&str] = &["solve", "calculate", "find", "compute"];

/// Topics a message touches, or `["general"]` when none match.
pub fn tag_topics(text: &str) -> Vec<&'static str> {
    let tokens: HashSet<String> = tokenize(text).collect();
    let topics: Vec<&'static str> = TOPIC_KEYWORDS
        .iter()
        .filter(|(_, words)| tokens.iter().any(|t| words.contains(t.as_str())))
        .map(|(topic, _)| *topic)
        .collect();

    if topics.is_empty() {
        vec![GENERAL_TOPIC]
    } else {
        topics
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    Definition,
    Explanation,
    ProblemSolving,
    Other,
}

impl QuestionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionType::Definition => "definition",
            QuestionType::Explanation => "explanation",
            QuestionType::ProblemSolving => "problem_solving",
            QuestionType::Other => "other",
        }
    }
}

pub fn classify_question(text: &str) -> QuestionType {
    let tokens: Vec<String> = tokenize(text).collect();
    let has_any = |words: &[&str]| tokens.iter().any(|t| words.contains(&t.as_str()));

    if has_any(DEFINITION_WORDS) {
        QuestionType::Definition
    } else if has_any(EXPLANATION_WORDS) {
        QuestionType::Explanation
    } else if has_any(PROBLEM_WORDS) {
        QuestionType::ProblemSolving
    } else {
        QuestionType::Other
    }
}

/// Scored messages kept per profile.
pub const SUCCESS_PATTERN_LIMIT: usize = 100;
/// Characters of message text kept with each pattern.
pub const SUCCESS_PATTERN_EXCERPT: usize = 100;

/// Folds one user message into the profile's topic and question-type counters.
///
/// A numeric `satisfaction` entry in `metadata` is also appended to the profile's
/// success patterns, which keep only the latest [`SUCCESS_PATTERN_LIMIT`].
pub fn record_user_message(
    profile: &mut UserProfile,
    text: &str,
    metadata: &MessageMetadata,
    timestamp: DateTime<Utc>,
) {
    for topic in tag_topics(text) {
        *profile.favorite_topics.entry(topic.to_string()).or_insert(0) += 1;
    }
    let kind = classify_question(text);
    *profile.question_types.entry(kind.as_str().to_string()).or_insert(0) += 1;

    if let Some(satisfaction) = metadata.get("satisfaction").and_then(|v| v.as_f64()) {
        profile.success_patterns.push(SuccessPattern {
            content: text.chars().take(SUCCESS_PATTERN_EXCERPT).collect(),
            satisfaction,
            timestamp,
        });
        let overflow = profile.success_patterns.len().saturating_sub(SUCCESS_PATTERN_LIMIT);
        profile.success_patterns.drain(..overflow);
    }
}

/// Mean satisfaction over the retained success patterns.
pub fn average_satisfaction(profile: &UserProfile) -> Option<f64> {
    if profile.success_patterns.is_empty() {
        return None;
    }
    let total: f64 = profile.success_patterns.iter().map(|p| p.satisfaction).sum();
    Some(total / profile.success_patterns.len() as f64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressLevel {
    JustStarted,
    BuildingKnowledge,
    ProgressingWell,
    AdvancedLearner,
}

impl ProgressLevel {
    /// Bands are inclusive on their lower bound: <10, 10-49, 50-199, 200+.
    pub fn from_query_count(total_queries: u64) -> Self {
        match total_queries {
            0..=9 => ProgressLevel::JustStarted,
            10..=49 => ProgressLevel::BuildingKnowledge,
            50..=199 => ProgressLevel::ProgressingWell,
            _ => ProgressLevel::AdvancedLearner,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressLevel::JustStarted => "just_started",
            ProgressLevel::BuildingKnowledge => "building_knowledge",
            ProgressLevel::ProgressingWell => "progressing_well",
            ProgressLevel::AdvancedLearner => "advanced_learner",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpertiseLevel {
    Beginner,
    Intermediate,
    Advanced,
}

impl ExpertiseLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpertiseLevel::Beginner => "beginner",
            ExpertiseLevel::Intermediate => "intermediate",
            ExpertiseLevel::Advanced => "advanced",
        }
    }
}

/// How familiar the user is with the topics of `query`, judged by how often they came up before.
pub fn estimate_expertise(profile: &UserProfile, query: &str) -> ExpertiseLevel {
    let seen: u64 = tag_topics(query)
        .iter()
        .filter(|t| **t != GENERAL_TOPIC)
        .map(|t| profile.favorite_topics.get(*t).copied().unwrap_or(0))
        .sum();

    if seen > 50 {
        ExpertiseLevel::Advanced
    } else if seen > 20 {
        ExpertiseLevel::Intermediate
    } else {
        ExpertiseLevel::Beginner
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GreetingKind {
    FirstTime,
    Returning,
    Advanced,
}

pub const ADVANCED_CONVERSATIONS: u64 = 50;

pub fn greeting_kind(profile: &UserProfile) -> GreetingKind {
    match profile.total_conversations {
        0 => GreetingKind::FirstTime,
        n if n >= ADVANCED_CONVERSATIONS => GreetingKind::Advanced,
        _ => GreetingKind::Returning,
    }
}

/// Most frequent topic other than `general`; ties go to the alphabetically first.
fn greeting_topic(profile: &UserProfile) -> Option<&str> {
    profile
        .favorite_topics
        .iter()
        .filter(|(topic, _)| topic.as_str() != GENERAL_TOPIC)
        .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(topic, _)| topic.as_str())
}

pub fn personalized_greeting(profile: &UserProfile) -> String {
    let name = profile
        .name
        .as_deref()
        .map(|n| format!(", {}", n))
        .unwrap_or_default();
    let topic = greeting_topic(profile);
    let conversations = profile.total_conversations;

    match greeting_kind(profile) {
        GreetingKind::FirstTime => format!(
            "Hello{}! I'm AIVI, your learning assistant. What would you like to learn today?",
            name
        ),
        GreetingKind::Returning => match topic {
            Some(topic) => format!(
                "Welcome back{}! We've had {} conversations together. Shall we continue with {}?",
                name, conversations, topic
            ),
            None => format!(
                "Welcome back{}! We've had {} conversations together. How can I help you today?",
                name, conversations
            ),
        },
        GreetingKind::Advanced => match topic {
            Some(topic) => format!(
                "Welcome back{}! After {} conversations you're becoming a real expert in {}. What shall we explore next?",
                name, conversations, topic
            ),
            None => format!(
                "Welcome back{}! After {} conversations you're becoming a real expert. What shall we explore next?",
                name, conversations
            ),
        },
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LearningStats {
    pub user_id: String,
    pub total_conversations: u64,
    pub total_messages: u64,
    pub total_queries: u64,
    pub member_since: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    /// Up to five topics, most frequent first
    pub favorite_topics: Vec<(String, u64)>,
    /// Up to three question types, most frequent first
    pub question_types: Vec<(String, u64)>,
    /// Mean of recorded satisfaction scores, if any were given
    pub average_satisfaction: Option<f64>,
    pub progress: ProgressLevel,
}

fn top_n(counts: &BTreeMap<String, u64>, n: usize) -> Vec<(String, u64)> {
    let mut ranked: Vec<(String, u64)> = counts.iter().map(|(k, v)| (k.clone(), *v)).collect();
    // BTreeMap order is alphabetical and the sort is stable, so ties stay alphabetical
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    ranked.truncate(n);
    ranked
}

/// Statistics over every session the user has, open ones included.
pub fn learning_stats<'a>(
    profile: &UserProfile,
    sessions: impl IntoIterator<Item = &'a ConversationSession>,
) -> LearningStats {
    let mut total_conversations = 0;
    let mut total_messages = 0;
    let mut total_queries = 0;
    for session in sessions {
        if !session.is_open() {
            total_conversations += 1;
        }
        total_messages += session.messages.len() as u64;
        total_queries += session.count_role(Role::User) as u64;
    }

    LearningStats {
        user_id: profile.user_id.clone(),
        total_conversations,
        total_messages,
        total_queries,
        member_since: profile.created_at,
        last_active: profile.last_active,
        favorite_topics: top_n(&profile.favorite_topics, 5),
        question_types: top_n(&profile.question_types, 3),
        average_satisfaction: average_satisfaction(profile),
        progress: ProgressLevel::from_query_count(total_queries),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ConversationMessage, MessageMetadata};

    fn profile() -> UserProfile {
        UserProfile::new("learner", Utc::now())
    }

    fn session_with(user_messages: usize, closed: bool) -> ConversationSession {
        let now = Utc::now();
        let mut session = ConversationSession::new(uuid::Uuid::new_v4().to_string(), "learner".into(), now);
        for i in 0..user_messages {
            for role in [Role::User, Role::Assistant] {
                session.messages.push(ConversationMessage {
                    role,
                    content: format!("message {}", i),
                    timestamp: now,
                    metadata: MessageMetadata::new(),
                });
            }
        }
        if closed {
            session.ended_at = Some(now);
        }
        session
    }

    // ===== Classification Tests =====

    #[test]
    fn test_tag_topics() {
        assert_eq!(tag_topics("Can you help with algebra homework"), vec!["math"]);
        assert_eq!(tag_topics("Physics and Python"), vec!["science", "programming"]);
        assert_eq!(tag_topics("tell me a joke"), vec![GENERAL_TOPIC]);
    }

    #[test]
    fn test_classify_question() {
        assert_eq!(classify_question("What is a noun?"), QuestionType::Definition);
        assert_eq!(classify_question("Why is the sky blue"), QuestionType::Explanation);
        assert_eq!(classify_question("explain the Heisenberg uncertainty principle"), QuestionType::Explanation);
        assert_eq!(classify_question("Solve x plus 3 equals 7"), QuestionType::ProblemSolving);
        assert_eq!(classify_question("Good morning"), QuestionType::Other);
    }

    #[test]
    fn test_record_user_message_updates_counters() {
        let mut p = profile();
        record_user_message(&mut p, "What is algebra?", &MessageMetadata::new(), Utc::now());
        record_user_message(&mut p, "How does geometry work", &MessageMetadata::new(), Utc::now());
        assert_eq!(p.favorite_topics.get("math"), Some(&2));
        assert_eq!(p.question_types.get("definition"), Some(&1));
        assert_eq!(p.question_types.get("explanation"), Some(&1));
        assert!(p.success_patterns.is_empty());
    }

    #[test]
    fn test_satisfaction_feeds_bounded_success_patterns() {
        let mut p = profile();
        for i in 0..(SUCCESS_PATTERN_LIMIT + 20) {
            let mut metadata = MessageMetadata::new();
            metadata.insert("satisfaction".into(), serde_json::json!(i % 5));
            record_user_message(&mut p, &format!("question {}", i), &metadata, Utc::now());
        }

        assert_eq!(p.success_patterns.len(), SUCCESS_PATTERN_LIMIT);
        assert_eq!(p.success_patterns[0].content, "question 20");
        assert_eq!(p.success_patterns.last().unwrap().content, "question 119");
        // 20..120 covers each score 0-4 twenty times
        assert_eq!(average_satisfaction(&p), Some(2.0));
    }

    #[test]
    fn test_success_pattern_ignores_non_numeric_satisfaction() {
        let mut p = profile();
        let mut metadata = MessageMetadata::new();
        metadata.insert("satisfaction".into(), serde_json::json!("great"));
        record_user_message(&mut p, "thanks", &metadata, Utc::now());
        assert!(p.success_patterns.is_empty());

        let long = "é".repeat(150);
        metadata.insert("satisfaction".into(), serde_json::json!(4.5));
        record_user_message(&mut p, &long, &metadata, Utc::now());
        assert_eq!(p.success_patterns[0].content.chars().count(), SUCCESS_PATTERN_EXCERPT);
        assert_eq!(learning_stats(&p, std::iter::empty()).average_satisfaction, Some(4.5));
    }

    // ===== Progress Tests =====

    #[test]
    fn test_progress_level_boundaries() {
        assert_eq!(ProgressLevel::from_query_count(0), ProgressLevel::JustStarted);
        assert_eq!(ProgressLevel::from_query_count(9), ProgressLevel::JustStarted);
        assert_eq!(ProgressLevel::from_query_count(10), ProgressLevel::BuildingKnowledge);
        assert_eq!(ProgressLevel::from_query_count(49), ProgressLevel::BuildingKnowledge);
        assert_eq!(ProgressLevel::from_query_count(50), ProgressLevel::ProgressingWell);
        assert_eq!(ProgressLevel::from_query_count(199), ProgressLevel::ProgressingWell);
        assert_eq!(ProgressLevel::from_query_count(200), ProgressLevel::AdvancedLearner);
    }

    #[test]
    fn test_learning_stats_counts_user_queries() {
        let p = profile();
        let sessions = vec![session_with(4, true), session_with(5, true), session_with(1, false)];
        let stats = learning_stats(&p, &sessions);
        assert_eq!(stats.total_conversations, 2);
        assert_eq!(stats.total_messages, 20);
        assert_eq!(stats.total_queries, 10);
        assert_eq!(stats.progress, ProgressLevel::BuildingKnowledge);

        let stats = learning_stats(&p, &sessions[..2]);
        assert_eq!(stats.total_queries, 9);
        assert_eq!(stats.progress, ProgressLevel::JustStarted);
    }

    #[test]
    fn test_learning_stats_top_lists_are_bounded() {
        let mut p = profile();
        for (i, topic) in ["a1", "b2", "c3", "d4", "e5", "f6"].iter().enumerate() {
            p.favorite_topics.insert(topic.to_string(), i as u64 + 1);
        }
        p.question_types.insert("definition".into(), 5);
        p.question_types.insert("explanation".into(), 5);
        p.question_types.insert("other".into(), 1);
        p.question_types.insert("problem_solving".into(), 2);

        let stats = learning_stats(&p, std::iter::empty());
        assert_eq!(stats.favorite_topics.len(), 5);
        assert_eq!(stats.favorite_topics[0], ("f6".to_string(), 6));
        assert_eq!(
            stats.question_types,
            vec![
                ("definition".to_string(), 5),
                ("explanation".to_string(), 5),
                ("problem_solving".to_string(), 2),
            ]
        );
    }

    // ===== Greeting Tests =====

    #[test]
    fn test_greeting_kinds() {
        let mut p = profile();
        assert_eq!(greeting_kind(&p), GreetingKind::FirstTime);
        p.total_conversations = 3;
        assert_eq!(greeting_kind(&p), GreetingKind::Returning);
        p.total_conversations = 50;
        assert_eq!(greeting_kind(&p), GreetingKind::Advanced);
    }

    #[test]
    fn test_greeting_uses_name_and_top_topic() {
        let mut p = profile();
        p.name = Some("Maya".into());
        assert!(personalized_greeting(&p).starts_with("Hello, Maya!"));

        p.total_conversations = 4;
        p.favorite_topics.insert("history".into(), 7);
        let greeting = personalized_greeting(&p);
        assert!(greeting.contains("Welcome back, Maya!"));
        assert!(greeting.contains("4 conversations"));
        assert!(greeting.contains("history"));
    }

    #[test]
    fn test_greeting_is_deterministic_and_skips_general() {
        let mut p = profile();
        p.total_conversations = 60;
        p.favorite_topics.insert(GENERAL_TOPIC.into(), 99);
        let greeting = personalized_greeting(&p);
        assert_eq!(greeting, personalized_greeting(&p));
        assert!(!greeting.contains(GENERAL_TOPIC));
        assert!(greeting.contains("expert"));
    }

    #[test]
    fn test_greeting_names_top_topic_behind_general() {
        let mut p = profile();
        p.total_conversations = 5;
        p.favorite_topics.insert(GENERAL_TOPIC.into(), 40);
        p.favorite_topics.insert("history".into(), 3);
        p.favorite_topics.insert("science".into(), 9);
        let greeting = personalized_greeting(&p);
        assert!(greeting.contains("continue with science"));
        assert!(!greeting.contains(GENERAL_TOPIC));
    }

    #[test]
    fn test_estimate_expertise() {
        let mut p = profile();
        assert_eq!(estimate_expertise(&p, "algebra"), ExpertiseLevel::Beginner);
        p.favorite_topics.insert("math".into(), 21);
        assert_eq!(estimate_expertise(&p, "algebra"), ExpertiseLevel::Intermediate);
        p.favorite_topics.insert("math".into(), 51);
        assert_eq!(estimate_expertise(&p, "algebra"), ExpertiseLevel::Advanced);
        assert_eq!(estimate_expertise(&p, "tell me a joke"), ExpertiseLevel::Beginner);
    }
}
