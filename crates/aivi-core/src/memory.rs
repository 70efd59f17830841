//! Conversation memory records and the storage seam behind them

use crate::error::{LoadError, StorageError, ValidationError};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Open-ended per-message annotations, such as a satisfaction score.
pub type MessageMetadata = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: MessageMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSession {
    pub id: String,
    pub user_id: String,
    pub messages: Vec<ConversationMessage>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl ConversationSession {
    pub fn new(id: String, user_id: String, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            user_id,
            messages: Vec::new(),
            started_at,
            ended_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    /// Latest timestamp seen in this session.
    pub fn last_timestamp(&self) -> DateTime<Utc> {
        self.messages
            .last()
            .map(|m| m.timestamp)
            .unwrap_or(self.started_at)
    }

    pub fn count_role(&self, role: Role) -> usize {
        self.messages.iter().filter(|m| m.role == role).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LearningStyle {
    Visual,
    Auditory,
    Kinesthetic,
    Mixed,
    #[default]
    Unset,
}

impl LearningStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            LearningStyle::Visual => "visual",
            LearningStyle::Auditory => "auditory",
            LearningStyle::Kinesthetic => "kinesthetic",
            LearningStyle::Mixed => "mixed",
            LearningStyle::Unset => "unset",
        }
    }
}

impl FromStr for LearningStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "visual" => Ok(LearningStyle::Visual),
            "auditory" => Ok(LearningStyle::Auditory),
            "kinesthetic" => Ok(LearningStyle::Kinesthetic),
            "mixed" => Ok(LearningStyle::Mixed),
            "unset" | "unknown" | "" => Ok(LearningStyle::Unset),
            other => Err(format!("unknown learning style '{}'", other)),
        }
    }
}

/// A user message that carried a satisfaction score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessPattern {
    /// Leading excerpt of the message
    pub content: String,
    pub satisfaction: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub name: Option<String>,
    #[serde(default)]
    pub learning_style: LearningStyle,
    #[serde(default)]
    pub accessibility_needs: BTreeSet<String>,
    /// topic -> number of user messages tagged with it
    #[serde(default)]
    pub favorite_topics: BTreeMap<String, u64>,
    /// question class -> number of user messages in it
    #[serde(default)]
    pub question_types: BTreeMap<String, u64>,
    /// Most recent scored messages, oldest first
    #[serde(default)]
    pub success_patterns: Vec<SuccessPattern>,
    pub difficulty_level: String,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub total_conversations: u64,
    pub total_messages: u64,
}

impl UserProfile {
    pub fn new(user_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            name: None,
            learning_style: LearningStyle::Unset,
            accessibility_needs: BTreeSet::new(),
            favorite_topics: BTreeMap::new(),
            question_types: BTreeMap::new(),
            success_patterns: Vec::new(),
            difficulty_level: "intermediate".to_string(),
            created_at: now,
            last_active: now,
            total_conversations: 0,
            total_messages: 0,
        }
    }

    /// Most frequent topic; ties go to the alphabetically first.
    pub fn top_topic(&self) -> Option<&str> {
        self.favorite_topics
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(topic, _)| topic.as_str())
    }
}

/// Everything persisted for one user.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StoredUser {
    pub profile: Option<UserProfile>,
    /// Sessions in start order
    pub sessions: Vec<ConversationSession>,
}

/// One atomic write for a user.
#[derive(Debug, Clone)]
pub struct UserCheckpoint {
    pub profile: UserProfile,
    /// Sessions to write. Each replaces any stored session with the same id.
    pub sessions: Vec<ConversationSession>,
    /// Drop everything stored for this user before writing.
    pub reset: bool,
}

/// Blocking storage backend for conversation memory. Callers run these methods
/// off the async runtime.
pub trait ConversationRepository: Send + Sync {
    /// `Ok(None)` when nothing is stored for the user.
    fn load_user(&self, user_id: &str) -> Result<Option<StoredUser>, LoadError>;
    /// Applies the checkpoint in a single all-or-nothing commit.
    fn save_user(&self, checkpoint: &UserCheckpoint) -> Result<(), StorageError>;
}

/// Non-durable repository, used when no database is configured and in tests.
#[derive(Clone, Default)]
pub struct InMemoryConversationRepository {
    store: Arc<DashMap<String, StoredUser>>,
}

impl InMemoryConversationRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConversationRepository for InMemoryConversationRepository {
    fn load_user(&self, user_id: &str) -> Result<Option<StoredUser>, LoadError> {
        Ok(self.store.get(user_id).map(|u| u.clone()))
    }

    fn save_user(&self, checkpoint: &UserCheckpoint) -> Result<(), StorageError> {
        let mut entry = self.store.entry(checkpoint.profile.user_id.clone()).or_default();
        if checkpoint.reset {
            *entry = StoredUser::default();
        }
        entry.profile = Some(checkpoint.profile.clone());
        for session in &checkpoint.sessions {
            match entry.sessions.iter_mut().find(|s| s.id == session.id) {
                Some(existing) => *existing = session.clone(),
                None => entry.sessions.push(session.clone()),
            }
        }
        entry.sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(())
    }
}

pub fn validate_user_id(user_id: &str) -> Result<(), ValidationError> {
    if user_id.trim().is_empty() {
        Err(ValidationError::EmptyUserId)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trips_through_str() {
        for role in [Role::User, Role::Assistant] {
            assert_eq!(role.as_str().parse::<Role>(), Ok(role));
        }
        assert!("system".parse::<Role>().is_err());
    }

    #[test]
    fn test_learning_style_parsing() {
        assert_eq!("Visual".parse::<LearningStyle>(), Ok(LearningStyle::Visual));
        assert_eq!("unknown".parse::<LearningStyle>(), Ok(LearningStyle::Unset));
        assert!("telepathic".parse::<LearningStyle>().is_err());
    }

    #[test]
    fn test_top_topic_breaks_ties_alphabetically() {
        let mut profile = UserProfile::new("u1", Utc::now());
        assert_eq!(profile.top_topic(), None);
        profile.favorite_topics.insert("science".into(), 3);
        profile.favorite_topics.insert("math".into(), 3);
        profile.favorite_topics.insert("history".into(), 1);
        assert_eq!(profile.top_topic(), Some("math"));
    }

    #[test]
    fn test_in_memory_save_replaces_session_by_id() {
        let repo = InMemoryConversationRepository::new();
        let now = Utc::now();
        let profile = UserProfile::new("u1", now);
        let mut session = ConversationSession::new("s1".into(), "u1".into(), now);

        repo.save_user(&UserCheckpoint {
            profile: profile.clone(),
            sessions: vec![session.clone()],
            reset: false,
        })
        .unwrap();

        session.messages.push(ConversationMessage {
            role: Role::User,
            content: "hello".into(),
            timestamp: now,
            metadata: MessageMetadata::new(),
        });
        repo.save_user(&UserCheckpoint {
            profile,
            sessions: vec![session.clone()],
            reset: false,
        })
        .unwrap();

        let stored = repo.load_user("u1").unwrap().unwrap();
        assert_eq!(stored.sessions, vec![session]);
    }

    #[test]
    fn test_validate_user_id() {
        assert!(validate_user_id("alice").is_ok());
        assert_eq!(validate_user_id("  "), Err(ValidationError::EmptyUserId));
    }
}
