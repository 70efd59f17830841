use crate::error::{DataIntegrityError, LoadError, StorageError};
use crate::memory::{
    ConversationMessage, ConversationRepository, ConversationSession, LearningStyle, MessageMetadata,
    StoredUser, SuccessPattern, UserCheckpoint, UserProfile,
};
use crate::memory_db::knowledge_table::classify_row_error;
use crate::memory_db::schema::{decode_json, decode_timestamp, encode_timestamp, integrity};
use crate::memory_db::DbPool;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Profiles, sessions and messages in SQLite.
///
/// A checkpoint for one user is written in a single transaction. Each session in it
/// replaces that session's stored messages wholesale, so a reader never sees a session
/// half written or mixed with another session's rows.
pub struct ConversationStore {
    pool: DbPool,
}

struct RawProfile {
    name: Option<String>,
    learning_style: String,
    accessibility_needs: String,
    favorite_topics: String,
    question_types: String,
    success_patterns: String,
    difficulty_level: String,
    created_at: String,
    last_active: String,
    total_conversations: i64,
    total_messages: i64,
}

impl RawProfile {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            name: row.get(0)?,
            learning_style: row.get(1)?,
            accessibility_needs: row.get(2)?,
            favorite_topics: row.get(3)?,
            question_types: row.get(4)?,
            success_patterns: row.get(5)?,
            difficulty_level: row.get(6)?,
            created_at: row.get(7)?,
            last_active: row.get(8)?,
            total_conversations: row.get(9)?,
            total_messages: row.get(10)?,
        })
    }

    fn decode(self, user_id: &str) -> Result<UserProfile, DataIntegrityError> {
        let learning_style: LearningStyle = self
            .learning_style
            .parse()
            .map_err(|e: String| integrity(user_id, e))?;
        let accessibility_needs: BTreeSet<String> =
            decode_json(user_id, "accessibility_needs", &self.accessibility_needs)?;
        let favorite_topics: BTreeMap<String, u64> =
            decode_json(user_id, "favorite_topics", &self.favorite_topics)?;
        let question_types: BTreeMap<String, u64> =
            decode_json(user_id, "question_types", &self.question_types)?;
        let success_patterns: Vec<SuccessPattern> =
            decode_json(user_id, "success_patterns", &self.success_patterns)?;

        let non_negative = |column: &str, v: i64| {
            u64::try_from(v).map_err(|_| integrity(user_id, format!("{}: negative count {}", column, v)))
        };

        Ok(UserProfile {
            user_id: user_id.to_string(),
            name: self.name,
            learning_style,
            accessibility_needs,
            favorite_topics,
            question_types,
            success_patterns,
            difficulty_level: self.difficulty_level,
            created_at: decode_timestamp(user_id, "created_at", &self.created_at)?,
            last_active: decode_timestamp(user_id, "last_active", &self.last_active)?,
            total_conversations: non_negative("total_conversations", self.total_conversations)?,
            total_messages: non_negative("total_messages", self.total_messages)?,
        })
    }
}

impl ConversationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn load_profile(conn: &Connection, user_id: &str) -> Result<Option<UserProfile>, LoadError> {
        let raw = conn
            .query_row(
                "SELECT name, learning_style, accessibility_needs, favorite_topics, question_types,
                        success_patterns, difficulty_level, created_at, last_active, total_conversations, total_messages
                 FROM user_profiles WHERE user_id = ?1",
                [user_id],
                RawProfile::from_row,
            )
            .optional()
            .map_err(|e| classify_row_error(user_id, e))?;

        match raw {
            Some(raw) => Ok(Some(raw.decode(user_id)?)),
            None => Ok(None),
        }
    }

    fn load_sessions(conn: &Connection, user_id: &str) -> Result<Vec<ConversationSession>, LoadError> {
        let mut stmt = conn
            .prepare(
                "SELECT id, started_at, ended_at FROM conversation_sessions
                 WHERE user_id = ?1 ORDER BY started_at, rowid",
            )
            .map_err(StorageError::from)?;
        let rows = stmt
            .query_map([user_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })
            .map_err(StorageError::from)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| classify_row_error(user_id, e))?;

        let mut sessions = Vec::with_capacity(rows.len());
        for (id, started_at, ended_at) in rows {
            let mut session = ConversationSession::new(
                id,
                user_id.to_string(),
                decode_timestamp(user_id, "started_at", &started_at)?,
            );
            session.ended_at = ended_at
                .map(|raw| decode_timestamp(user_id, "ended_at", &raw))
                .transpose()?;
            session.messages = Self::load_messages(conn, user_id, &session.id)?;
            sessions.push(session);
        }
        Ok(sessions)
    }

    fn load_messages(conn: &Connection, user_id: &str, session_id: &str) -> Result<Vec<ConversationMessage>, LoadError> {
        let mut stmt = conn
            .prepare_cached(
                "SELECT role, content, timestamp, metadata FROM conversation_messages
                 WHERE session_id = ?1 ORDER BY seq",
            )
            .map_err(StorageError::from)?;
        let rows = stmt
            .query_map([session_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(StorageError::from)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| classify_row_error(user_id, e))?;

        let mut messages = Vec::with_capacity(rows.len());
        for (role, content, timestamp, metadata) in rows {
            messages.push(ConversationMessage {
                role: role.parse().map_err(|e: String| integrity(user_id, e))?,
                content,
                timestamp: decode_timestamp(user_id, "timestamp", &timestamp)?,
                metadata: decode_json::<MessageMetadata>(user_id, "metadata", &metadata)?,
            });
        }
        Ok(messages)
    }

    fn write_profile(conn: &Connection, profile: &UserProfile) -> Result<(), StorageError> {
        conn.execute(
            "INSERT INTO user_profiles
             (user_id, name, learning_style, accessibility_needs, favorite_topics, question_types,
              success_patterns, difficulty_level, created_at, last_active, total_conversations,
              total_messages)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(user_id) DO UPDATE SET
                name = excluded.name,
                learning_style = excluded.learning_style,
                accessibility_needs = excluded.accessibility_needs,
                favorite_topics = excluded.favorite_topics,
                question_types = excluded.question_types,
                success_patterns = excluded.success_patterns,
                difficulty_level = excluded.difficulty_level,
                created_at = excluded.created_at,
                last_active = excluded.last_active,
                total_conversations = excluded.total_conversations,
                total_messages = excluded.total_messages",
            params![
                profile.user_id,
                profile.name,
                profile.learning_style.as_str(),
                serde_json::to_string(&profile.accessibility_needs)?,
                serde_json::to_string(&profile.favorite_topics)?,
                serde_json::to_string(&profile.question_types)?,
                serde_json::to_string(&profile.success_patterns)?,
                profile.difficulty_level,
                encode_timestamp(&profile.created_at),
                encode_timestamp(&profile.last_active),
                profile.total_conversations as i64,
                profile.total_messages as i64,
            ],
        )?;
        Ok(())
    }

    fn write_session(conn: &Connection, session: &ConversationSession) -> Result<(), StorageError> {
        // Upsert rather than REPLACE so the message cascade is not triggered
        conn.execute(
            "INSERT INTO conversation_sessions (id, user_id, started_at, ended_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                user_id = excluded.user_id,
                started_at = excluded.started_at,
                ended_at = excluded.ended_at",
            params![
                session.id,
                session.user_id,
                encode_timestamp(&session.started_at),
                session.ended_at.as_ref().map(encode_timestamp),
            ],
        )?;
        conn.execute("DELETE FROM conversation_messages WHERE session_id = ?1", [&session.id])?;

        let mut stmt = conn.prepare_cached(
            "INSERT INTO conversation_messages (session_id, seq, role, content, timestamp, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for (seq, message) in session.messages.iter().enumerate() {
            stmt.execute(params![
                session.id,
                seq as i64,
                message.role.as_str(),
                message.content,
                encode_timestamp(&message.timestamp),
                serde_json::to_string(&message.metadata)?,
            ])?;
        }
        Ok(())
    }
}

impl ConversationRepository for ConversationStore {
    fn load_user(&self, user_id: &str) -> Result<Option<StoredUser>, LoadError> {
        let conn = self.pool.get().map_err(StorageError::from)?;
        let profile = Self::load_profile(&conn, user_id)?;
        let sessions = Self::load_sessions(&conn, user_id)?;

        if profile.is_none() && sessions.is_empty() {
            return Ok(None);
        }
        debug!("Loaded {} sessions for user {}", sessions.len(), user_id);
        Ok(Some(StoredUser { profile, sessions }))
    }

    fn save_user(&self, checkpoint: &UserCheckpoint) -> Result<(), StorageError> {
        let user_id = &checkpoint.profile.user_id;
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        if checkpoint.reset {
            tx.execute(
                "DELETE FROM conversation_messages WHERE session_id IN
                 (SELECT id FROM conversation_sessions WHERE user_id = ?1)",
                [user_id],
            )?;
            tx.execute("DELETE FROM conversation_sessions WHERE user_id = ?1", [user_id])?;
            tx.execute("DELETE FROM user_profiles WHERE user_id = ?1", [user_id])?;
        }

        Self::write_profile(&tx, &checkpoint.profile)?;
        for session in &checkpoint.sessions {
            Self::write_session(&tx, session)?;
        }

        tx.commit()?;
        debug!(
            "Checkpointed user {} ({} sessions written)",
            user_id,
            checkpoint.sessions.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Role;
    use crate::memory_db::MemoryDatabase;
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn session_for(user_id: &str, contents: &[&str]) -> ConversationSession {
        let start = Utc::now();
        let mut session = ConversationSession::new(uuid::Uuid::new_v4().to_string(), user_id.into(), start);
        for (i, content) in contents.iter().enumerate() {
            let mut metadata = MessageMetadata::new();
            metadata.insert("index".into(), json!(i));
            session.messages.push(ConversationMessage {
                role: if i % 2 == 0 { Role::User } else { Role::Assistant },
                content: content.to_string(),
                timestamp: start + Duration::nanoseconds(i as i64 * 1_001),
                metadata,
            });
        }
        session
    }

    fn checkpoint(profile: &UserProfile, sessions: Vec<ConversationSession>, reset: bool) -> UserCheckpoint {
        UserCheckpoint {
            profile: profile.clone(),
            sessions,
            reset,
        }
    }

    #[test]
    fn test_session_round_trip_is_exact() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let mut profile = UserProfile::new("alice", Utc::now());
        profile.name = Some("Alice".into());
        profile.learning_style = LearningStyle::Auditory;
        profile.accessibility_needs.insert("screen_reader".into());
        profile.favorite_topics.insert("science".into(), 2);

        let mut session = session_for("alice", &["What is an atom?", "The smallest unit of matter.", "Thanks!"]);
        session.ended_at = Some(Utc::now());
        db.conversations
            .save_user(&checkpoint(&profile, vec![session.clone()], false))
            .unwrap();

        let stored = db.conversations.load_user("alice").unwrap().unwrap();
        assert_eq!(stored.profile, Some(profile));
        assert_eq!(stored.sessions, vec![session]);
    }

    #[test]
    fn test_rewriting_session_replaces_messages() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let profile = UserProfile::new("bob", Utc::now());
        let mut session = session_for("bob", &["one", "two", "three"]);
        let other = session_for("bob", &["untouched"]);
        db.conversations
            .save_user(&checkpoint(&profile, vec![session.clone(), other.clone()], false))
            .unwrap();

        session.messages.truncate(1);
        db.conversations
            .save_user(&checkpoint(&profile, vec![session.clone()], false))
            .unwrap();

        let stored = db.conversations.load_user("bob").unwrap().unwrap();
        let reloaded = stored.sessions.iter().find(|s| s.id == session.id).unwrap();
        assert_eq!(reloaded.messages.len(), 1);
        let untouched = stored.sessions.iter().find(|s| s.id == other.id).unwrap();
        assert_eq!(untouched, &other);
    }

    #[test]
    fn test_reset_removes_previous_rows() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let profile = UserProfile::new("carol", Utc::now());
        db.conversations
            .save_user(&checkpoint(&profile, vec![session_for("carol", &["old"])], false))
            .unwrap();
        db.conversations.save_user(&checkpoint(&profile, vec![], true)).unwrap();

        let stored = db.conversations.load_user("carol").unwrap().unwrap();
        assert!(stored.sessions.is_empty());
        assert!(stored.profile.is_some());
    }

    #[test]
    fn test_unknown_user_loads_none() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        assert_eq!(db.conversations.load_user("nobody").unwrap(), None);
    }

    #[test]
    fn test_corrupted_profile_is_integrity_error_for_that_user_only() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        for user in ["dave", "erin"] {
            db.conversations
                .save_user(&checkpoint(&UserProfile::new(user, Utc::now()), vec![], false))
                .unwrap();
        }
        {
            let conn = db.conversations.pool.get().unwrap();
            conn.execute(
                "UPDATE user_profiles SET favorite_topics = '{not json' WHERE user_id = 'dave'",
                [],
            )
            .unwrap();
        }

        match db.conversations.load_user("dave") {
            Err(LoadError::Integrity(e)) => assert_eq!(e.owner, "dave"),
            other => panic!("expected integrity error, got {:?}", other),
        }
        assert!(db.conversations.load_user("erin").unwrap().is_some());
    }
}
