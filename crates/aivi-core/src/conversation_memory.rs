//! Per-user conversation memory.
//!
//! Each user is an immutable [`UserMemory`] snapshot published through an `ArcSwap`.
//! Every mutation goes through one async writer lock, which builds the next snapshot
//! and records what needs writing. Durable writes happen on `end_session` and
//! `checkpoint`; anything that fails to write stays in memory and stays dirty.

use crate::config::Config;
use crate::error::{LoadError, MemoryError, StorageError, ValidationError};
use crate::memory::{
    validate_user_id, ConversationMessage, ConversationRepository, ConversationSession, LearningStyle,
    MessageMetadata, Role, StoredUser, UserCheckpoint, UserProfile,
};
use crate::metrics;
use crate::profile_analytics::{learning_stats, record_user_message, LearningStats};
use crate::utils::TextUtils;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Snapshot of everything held for one user.
#[derive(Debug, Clone)]
pub struct UserMemory {
    pub profile: UserProfile,
    /// Sessions in start order. Only the last one may be open.
    pub sessions: Vec<Arc<ConversationSession>>,
}

impl UserMemory {
    fn new(profile: UserProfile) -> Self {
        Self {
            profile,
            sessions: Vec::new(),
        }
    }

    pub fn open_session(&self) -> Option<&Arc<ConversationSession>> {
        self.sessions.last().filter(|s| s.is_open())
    }

    /// Every message, oldest first, with the id of its session.
    pub fn messages(&self) -> impl Iterator<Item = (&str, &ConversationMessage)> {
        self.sessions
            .iter()
            .flat_map(|s| s.messages.iter().map(move |m| (s.id.as_str(), m)))
    }

    pub fn stats(&self) -> LearningStats {
        learning_stats(&self.profile, self.sessions.iter().map(|s| s.as_ref()))
    }

    fn refresh_aggregates(&mut self) {
        self.profile.total_conversations = self.sessions.iter().filter(|s| !s.is_open()).count() as u64;
        self.profile.total_messages = self.sessions.iter().map(|s| s.messages.len() as u64).sum();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchMatch {
    pub session_id: String,
    pub message: ConversationMessage,
}

/// Full dump of a user's memory.
#[derive(Debug, Clone, Serialize)]
pub struct UserExport {
    pub profile: UserProfile,
    pub sessions: Vec<ConversationSession>,
    pub stats: LearningStats,
    pub exported_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct DirtyUser {
    sessions: HashSet<String>,
    /// Stored rows are corrupt and must be dropped before the next write.
    reset: bool,
}

#[derive(Default)]
struct WriterState {
    dirty: HashMap<String, DirtyUser>,
    failures: HashMap<String, u32>,
    /// open session id -> user id
    open_sessions: HashMap<String, String>,
}

pub struct ConversationMemory {
    users: ArcSwap<HashMap<String, Arc<UserMemory>>>,
    writer: Mutex<WriterState>,
    repository: Arc<dyn ConversationRepository>,
    changed: Arc<Notify>,
    max_write_failures: u32,
    max_metadata_entries: usize,
}

impl ConversationMemory {
    pub fn new(repository: Arc<dyn ConversationRepository>, max_write_failures: u32, max_metadata_entries: usize) -> Self {
        Self {
            users: ArcSwap::from_pointee(HashMap::new()),
            writer: Mutex::new(WriterState::default()),
            repository,
            changed: Arc::new(Notify::new()),
            max_write_failures: max_write_failures.max(1),
            max_metadata_entries,
        }
    }

    pub fn from_config(repository: Arc<dyn ConversationRepository>, config: &Config) -> Self {
        Self::new(repository, config.max_write_failures, config.max_metadata_entries)
    }

    /// Signalled when profile changes want an early checkpoint.
    pub fn change_notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.changed)
    }

    // ===== Readers =====

    /// Last published snapshot for a loaded user.
    pub fn snapshot(&self, user_id: &str) -> Option<Arc<UserMemory>> {
        self.users.load().get(user_id).cloned()
    }

    /// The `n` most recent sessions, oldest first.
    pub fn get_recent(&self, user_id: &str, n: usize) -> Vec<Arc<ConversationSession>> {
        match self.snapshot(user_id) {
            Some(memory) => {
                let skip = memory.sessions.len().saturating_sub(n);
                memory.sessions[skip..].to_vec()
            }
            None => Vec::new(),
        }
    }

    /// The `n` most recent messages across sessions, oldest first.
    pub fn recent_messages(&self, user_id: &str, n: usize) -> Vec<ConversationMessage> {
        let Some(memory) = self.snapshot(user_id) else {
            return Vec::new();
        };
        let all: Vec<&ConversationMessage> = memory.messages().map(|(_, m)| m).collect();
        let skip = all.len().saturating_sub(n);
        all[skip..].iter().map(|m| (*m).clone()).collect()
    }

    /// Case-insensitive substring search over all of a user's messages.
    pub fn search(&self, user_id: &str, keyword: &str) -> Vec<SearchMatch> {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            return Vec::new();
        }
        let Some(memory) = self.snapshot(user_id) else {
            return Vec::new();
        };
        memory
            .messages()
            .filter(|(_, m)| TextUtils::contains_ignore_case(&m.content, keyword))
            .map(|(session_id, m)| SearchMatch {
                session_id: session_id.to_string(),
                message: m.clone(),
            })
            .collect()
    }

    pub fn learning_stats(&self, user_id: &str) -> Option<LearningStats> {
        self.snapshot(user_id).map(|m| m.stats())
    }

    // ===== Loading =====

    /// Loads the user from storage if needed and returns the current snapshot.
    ///
    /// A user with corrupted records starts over from a default profile; the stale
    /// rows are replaced at the next checkpoint.
    pub async fn load(&self, user_id: &str) -> Result<Arc<UserMemory>, MemoryError> {
        validate_user_id(user_id)?;
        if let Some(memory) = self.snapshot(user_id) {
            return Ok(memory);
        }
        let mut writer = self.writer.lock().await;
        self.ensure_loaded(&mut writer, user_id).await
    }

    async fn ensure_loaded(&self, writer: &mut WriterState, user_id: &str) -> Result<Arc<UserMemory>, MemoryError> {
        if let Some(memory) = self.snapshot(user_id) {
            return Ok(memory);
        }

        let repository = Arc::clone(&self.repository);
        let id = user_id.to_string();
        let loaded = tokio::task::spawn_blocking(move || repository.load_user(&id))
            .await
            .unwrap_or_else(|e| Err(LoadError::Storage(StorageError::new(format!("memory load task failed: {}", e)))));

        let now = Utc::now();
        let memory = match loaded {
            Ok(Some(stored)) => self.restore(writer, user_id, stored, now),
            Ok(None) => {
                debug!("No stored memory for user {}, starting fresh", user_id);
                UserMemory::new(UserProfile::new(user_id, now))
            }
            Err(LoadError::Integrity(e)) => {
                warn!("Conversation memory for user {} is corrupted ({}), resetting to defaults", user_id, e);
                writer.dirty.entry(user_id.to_string()).or_default().reset = true;
                UserMemory::new(UserProfile::new(user_id, now))
            }
            Err(LoadError::Storage(e)) => {
                warn!("Could not read conversation memory for user {}: {}", user_id, e);
                return Err(MemoryError::Storage(e));
            }
        };

        Ok(self.publish(user_id, memory))
    }

    fn restore(&self, writer: &mut WriterState, user_id: &str, stored: StoredUser, now: DateTime<Utc>) -> UserMemory {
        let profile = stored
            .profile
            .unwrap_or_else(|| UserProfile::new(user_id, now));
        let mut memory = UserMemory::new(profile);

        for mut session in stored.sessions {
            if session.is_open() {
                // Left open by a previous run; it ends at its last message
                session.ended_at = Some(session.last_timestamp());
                writer
                    .dirty
                    .entry(user_id.to_string())
                    .or_default()
                    .sessions
                    .insert(session.id.clone());
                debug!("Closed interrupted session {} for user {}", session.id, user_id);
            }
            memory.sessions.push(Arc::new(session));
        }
        memory.refresh_aggregates();
        info!(
            "Loaded memory for user {} ({} sessions, {} messages)",
            user_id, memory.profile.total_conversations, memory.profile.total_messages
        );
        memory
    }

    fn publish(&self, user_id: &str, memory: UserMemory) -> Arc<UserMemory> {
        let memory = Arc::new(memory);
        let mut users = HashMap::clone(&self.users.load());
        users.insert(user_id.to_string(), Arc::clone(&memory));
        self.users.store(Arc::new(users));
        memory
    }

    // ===== Writers =====

    /// Opens a session for the user, or returns the one already open.
    pub async fn start_session(&self, user_id: &str) -> Result<String, MemoryError> {
        validate_user_id(user_id)?;
        let mut writer = self.writer.lock().await;
        let current = self.ensure_loaded(&mut writer, user_id).await?;

        if let Some(open) = current.open_session() {
            return Ok(open.id.clone());
        }

        let now = Utc::now();
        let mut session_id = Uuid::new_v4().to_string();
        while writer.open_sessions.contains_key(&session_id) || current.sessions.iter().any(|s| s.id == session_id) {
            session_id = Uuid::new_v4().to_string();
        }

        let mut memory = UserMemory::clone(&current);
        memory
            .sessions
            .push(Arc::new(ConversationSession::new(session_id.clone(), user_id.to_string(), now)));
        memory.profile.last_active = now;

        writer.open_sessions.insert(session_id.clone(), user_id.to_string());
        writer
            .dirty
            .entry(user_id.to_string())
            .or_default()
            .sessions
            .insert(session_id.clone());
        self.publish(user_id, memory);

        metrics::inc_sessions();
        debug!("Started session {} for user {}", session_id, user_id);
        Ok(session_id)
    }

    pub async fn append_message(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
        metadata: MessageMetadata,
    ) -> Result<ConversationMessage, MemoryError> {
        if content.trim().is_empty() {
            return Err(ValidationError::EmptyContent.into());
        }
        if metadata.len() > self.max_metadata_entries {
            return Err(ValidationError::MetadataTooLarge {
                count: metadata.len(),
                max: self.max_metadata_entries,
            }
            .into());
        }

        let mut writer = self.writer.lock().await;
        let user_id = writer
            .open_sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| MemoryError::UnknownSession(session_id.to_string()))?;
        let current = self.ensure_loaded(&mut writer, &user_id).await?;

        let mut memory = UserMemory::clone(&current);
        let session = memory
            .sessions
            .iter_mut()
            .rev()
            .find(|s| s.id == session_id && s.is_open())
            .ok_or_else(|| MemoryError::UnknownSession(session_id.to_string()))?;
        let session = Arc::make_mut(session);

        let timestamp = Utc::now().max(session.last_timestamp());
        let message = ConversationMessage {
            role,
            content: content.to_string(),
            timestamp,
            metadata,
        };
        session.messages.push(message.clone());

        if role == Role::User {
            record_user_message(&mut memory.profile, content, &message.metadata, timestamp);
        }
        memory.profile.last_active = timestamp;

        writer
            .dirty
            .entry(user_id.clone())
            .or_default()
            .sessions
            .insert(session_id.to_string());
        self.publish(&user_id, memory);

        metrics::inc_messages(role.as_str());
        Ok(message)
    }

    /// Closes the session and writes it, with the user's updated profile, in one commit.
    pub async fn end_session(&self, session_id: &str) -> Result<(), MemoryError> {
        let mut writer = self.writer.lock().await;
        let user_id = writer
            .open_sessions
            .remove(session_id)
            .ok_or_else(|| MemoryError::UnknownSession(session_id.to_string()))?;
        let current = self.ensure_loaded(&mut writer, &user_id).await?;

        let mut memory = UserMemory::clone(&current);
        if let Some(session) = memory.sessions.iter_mut().rev().find(|s| s.id == session_id) {
            let session = Arc::make_mut(session);
            session.ended_at = Some(Utc::now().max(session.last_timestamp()));
        }
        memory.refresh_aggregates();
        writer
            .dirty
            .entry(user_id.clone())
            .or_default()
            .sessions
            .insert(session_id.to_string());
        self.publish(&user_id, memory);
        metrics::dec_sessions();

        self.flush_user(&mut writer, &user_id).await.map(|_| ())
    }

    /// Writes every user with unsaved changes. Returns how many users were written.
    ///
    /// All dirty users are attempted even when one fails; the first surfaced
    /// write error is returned afterwards.
    pub async fn checkpoint(&self) -> Result<usize, MemoryError> {
        let mut writer = self.writer.lock().await;
        let mut users: Vec<String> = writer.dirty.keys().cloned().collect();
        users.sort();

        let mut written = 0;
        let mut first_error = None;
        for user_id in users {
            match self.flush_user(&mut writer, &user_id).await {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    /// Returns Ok(false) when the write failed but the failure bound is not reached yet.
    async fn flush_user(&self, writer: &mut WriterState, user_id: &str) -> Result<bool, MemoryError> {
        let Some(dirty) = writer.dirty.get(user_id) else {
            return Ok(true);
        };
        let Some(current) = self.snapshot(user_id) else {
            return Ok(true);
        };

        let mut memory = UserMemory::clone(&current);
        memory.refresh_aggregates();
        let checkpoint = UserCheckpoint {
            profile: memory.profile.clone(),
            sessions: memory
                .sessions
                .iter()
                .filter(|s| dirty.reset || dirty.sessions.contains(&s.id))
                .map(|s| ConversationSession::clone(s))
                .collect(),
            reset: dirty.reset,
        };
        self.publish(user_id, memory);

        let repository = Arc::clone(&self.repository);
        let result = tokio::task::spawn_blocking(move || repository.save_user(&checkpoint))
            .await
            .unwrap_or_else(|e| Err(StorageError::new(format!("memory write task failed: {}", e))));

        match result {
            Ok(()) => {
                writer.dirty.remove(user_id);
                writer.failures.remove(user_id);
                Ok(true)
            }
            Err(source) => {
                let attempts = {
                    let count = writer.failures.entry(user_id.to_string()).or_insert(0);
                    *count += 1;
                    *count
                };
                metrics::inc_persist_failure("conversation");
                warn!(
                    "Failed to write conversation memory for user {} (attempt {}): {}",
                    user_id, attempts, source
                );
                if attempts >= self.max_write_failures {
                    Err(MemoryError::Write {
                        user_id: user_id.to_string(),
                        attempts,
                        source,
                    })
                } else {
                    Ok(false)
                }
            }
        }
    }

    async fn update_profile<F>(&self, user_id: &str, update: F) -> Result<UserProfile, MemoryError>
    where
        F: FnOnce(&mut UserProfile),
    {
        validate_user_id(user_id)?;
        let mut writer = self.writer.lock().await;
        let current = self.ensure_loaded(&mut writer, user_id).await?;

        let mut memory = UserMemory::clone(&current);
        update(&mut memory.profile);
        let profile = memory.profile.clone();
        writer.dirty.entry(user_id.to_string()).or_default();
        self.publish(user_id, memory);
        drop(writer);

        self.changed.notify_one();
        Ok(profile)
    }

    pub async fn set_user_name(&self, user_id: &str, name: &str) -> Result<UserProfile, MemoryError> {
        let name = name.trim().to_string();
        self.update_profile(user_id, move |p| p.name = (!name.is_empty()).then_some(name))
            .await
    }

    pub async fn set_learning_style(&self, user_id: &str, style: LearningStyle) -> Result<UserProfile, MemoryError> {
        self.update_profile(user_id, move |p| p.learning_style = style).await
    }

    pub async fn add_accessibility_need(&self, user_id: &str, need: &str) -> Result<UserProfile, MemoryError> {
        let need = need.trim().to_lowercase();
        if need.is_empty() {
            return Err(ValidationError::EmptyContent.into());
        }
        self.update_profile(user_id, move |p| {
            p.accessibility_needs.insert(need);
        })
        .await
    }

    pub async fn set_difficulty_level(&self, user_id: &str, level: &str) -> Result<UserProfile, MemoryError> {
        let level = level.trim().to_lowercase();
        if level.is_empty() {
            return Err(ValidationError::EmptyContent.into());
        }
        self.update_profile(user_id, move |p| p.difficulty_level = level).await
    }

    // ===== Export =====

    pub async fn export_all(&self, user_id: &str) -> Result<UserExport, MemoryError> {
        let memory = self.load(user_id).await?;
        Ok(UserExport {
            profile: memory.profile.clone(),
            sessions: memory.sessions.iter().map(|s| ConversationSession::clone(s)).collect(),
            stats: memory.stats(),
            exported_at: Utc::now(),
        })
    }

    /// Writes `conversations.json`, `profile.json` and `statistics.json` into `dir`,
    /// each replaced atomically.
    pub async fn export_to_dir(&self, user_id: &str, dir: &Path) -> Result<Vec<PathBuf>, MemoryError> {
        let export = self.export_all(user_id).await?;
        let dir = dir.to_path_buf();

        let paths = tokio::task::spawn_blocking(move || -> Result<Vec<PathBuf>, StorageError> {
            std::fs::create_dir_all(&dir)?;
            Ok(vec![
                write_json_atomic(&dir, "conversations.json", &export.sessions)?,
                write_json_atomic(&dir, "profile.json", &export.profile)?,
                write_json_atomic(&dir, "statistics.json", &export.stats)?,
            ])
        })
        .await
        .unwrap_or_else(|e| Err(StorageError::new(format!("export task failed: {}", e))))?;

        info!("Exported memory for user {} to {}", user_id, paths[0].parent().map(|p| p.display().to_string()).unwrap_or_default());
        Ok(paths)
    }
}

fn write_json_atomic<T: Serialize>(dir: &Path, name: &str, value: &T) -> Result<PathBuf, StorageError> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, value)?;
    tmp.as_file().sync_all()?;
    let path = dir.join(name);
    tmp.persist(&path).map_err(|e| StorageError::from(e.error))?;
    Ok(path)
}
