//! Assistant service object
//!
//! Built once at startup, it owns the knowledge store, conversation memory, query
//! router and checkpoint worker, and is the surface the presentation layer talks to.

use crate::answer_service::AnswerService;
use crate::config::Config;
use crate::context_engine::{ContextBuilder, ContextBundle};
use crate::conversation_memory::{ConversationMemory, SearchMatch};
use crate::error::{MemoryError, RouterError, StorageError};
use crate::knowledge::{KnowledgeRepository, KnowledgeStats, KnowledgeStore};
use crate::memory::{ConversationMessage, ConversationRepository, MessageMetadata, Role};
use crate::memory_db::{DatabaseStats, MemoryDatabase};
use crate::profile_analytics::{personalized_greeting, LearningStats};
use crate::query_router::{Answer, QueryRouter, RouterSettings, RouterStats};
use crate::worker_threads::{flush_all, CheckpointWorker, FlushReport, HttpAnswerService};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tracing::{info, warn};

#[derive(Clone)]
pub struct Assistant {
    config: Arc<Config>,
    database: Option<Arc<MemoryDatabase>>,
    knowledge: Arc<KnowledgeStore>,
    memory: Arc<ConversationMemory>,
    router: Arc<QueryRouter>,
    context: Arc<ContextBuilder>,
    worker: Arc<Mutex<Option<CheckpointWorker>>>,
}

impl Assistant {
    /// Opens the SQLite database and the HTTP answer service named in `config`.
    /// Falls back to an in-memory database if the file cannot be opened.
    pub async fn start(config: Config) -> anyhow::Result<Self> {
        let database = match MemoryDatabase::new(&config.database_path) {
            Ok(db) => Arc::new(db),
            Err(e) => {
                warn!(
                    "Failed to open database at {}: {}. Falling back to in-memory.",
                    config.database_path.display(),
                    e
                );
                Arc::new(MemoryDatabase::new_in_memory()?)
            }
        };
        let service = Arc::new(HttpAnswerService::new(&config));

        let mut assistant = Self::with_parts(
            config,
            database.knowledge.clone(),
            database.conversations.clone(),
            service,
        )
        .await;
        assistant.database = Some(database);
        Ok(assistant)
    }

    pub async fn with_parts(
        config: Config,
        knowledge_repository: Arc<dyn KnowledgeRepository>,
        conversation_repository: Arc<dyn ConversationRepository>,
        service: Arc<dyn AnswerService>,
    ) -> Self {
        let knowledge = Arc::new(KnowledgeStore::open(knowledge_repository, &config).await);
        let memory = Arc::new(ConversationMemory::from_config(conversation_repository, &config));
        let router = Arc::new(QueryRouter::new(
            Arc::clone(&knowledge),
            service,
            RouterSettings::from_config(&config),
        ));
        let context = Arc::new(ContextBuilder::new(config.context.clone()));
        let worker = CheckpointWorker::spawn(Arc::clone(&knowledge), Arc::clone(&memory), config.checkpoint_interval);

        info!("Assistant ready with {} knowledge entries", knowledge.len());
        Self {
            config: Arc::new(config),
            database: None,
            knowledge,
            memory,
            router,
            context,
            worker: Arc::new(Mutex::new(Some(worker))),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn knowledge(&self) -> &Arc<KnowledgeStore> {
        &self.knowledge
    }

    pub fn memory(&self) -> &Arc<ConversationMemory> {
        &self.memory
    }

    pub async fn get_or_create_memory(&self, user_id: &str) -> Result<UserMemoryHandle, MemoryError> {
        self.memory.load(user_id).await?;
        Ok(UserMemoryHandle {
            user_id: user_id.to_string(),
            memory: Arc::clone(&self.memory),
            knowledge: Arc::clone(&self.knowledge),
            context: Arc::clone(&self.context),
        })
    }

    pub async fn get_stats(&self, user_id: &str) -> Result<LearningStats, MemoryError> {
        Ok(self.memory.load(user_id).await?.stats())
    }

    /// Answers `query` for `user_id` and records the exchange in the user's memory.
    ///
    /// Memory problems are logged and do not prevent an answer.
    pub async fn answer(&self, query: &str, user_id: &str) -> Result<Answer, RouterError> {
        let handle = match self.get_or_create_memory(user_id).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Answering without memory for user {}: {}", user_id, e);
                None
            }
        };
        let context = match &handle {
            Some(handle) => handle.get_context(query),
            None => {
                let related = self.knowledge.related(query, None, self.config.context.knowledge_snippets);
                self.context.build(query, None, &related)
            }
        };

        let result = self.router.answer(query, &context).await;

        if let Some(handle) = handle {
            if let Err(e) = handle.record_exchange(query, &result).await {
                warn!("Failed to record exchange for user {}: {}", user_id, e);
            }
        }
        result
    }

    /// Runs [`Assistant::answer`] on its own task. The caller never waits on it.
    pub fn request_answer(&self, query: &str, user_id: &str) -> oneshot::Receiver<Result<Answer, RouterError>> {
        let (tx, rx) = oneshot::channel();
        let assistant = self.clone();
        let query = query.to_string();
        let user_id = user_id.to_string();
        tokio::spawn(async move {
            let result = assistant.answer(&query, &user_id).await;
            let _ = tx.send(result);
        });
        rx
    }

    /// Writes the user's conversations, profile and statistics under the export directory.
    pub async fn export_user(&self, user_id: &str) -> Result<Vec<PathBuf>, MemoryError> {
        let dir = self.config.export_dir.join(safe_dir_name(user_id));
        self.memory.export_to_dir(user_id, &dir).await
    }

    pub async fn checkpoint(&self) -> FlushReport {
        flush_all(&self.knowledge, &self.memory).await
    }

    pub fn knowledge_stats(&self) -> KnowledgeStats {
        self.knowledge.stats()
    }

    pub fn router_stats(&self) -> RouterStats {
        self.router.stats()
    }

    /// Row counts of the SQLite database, or `None` when running on injected repositories.
    pub async fn storage_stats(&self) -> Option<Result<DatabaseStats, StorageError>> {
        let database = self.database.clone()?;
        let stats = tokio::task::spawn_blocking(move || database.get_stats())
            .await
            .unwrap_or_else(|e| Err(StorageError::new(format!("stats task failed: {}", e))));
        Some(stats)
    }

    /// Stops the checkpoint worker, then runs one last flush bounded by
    /// `shutdown_flush_timeout`.
    pub async fn shutdown(&self) -> FlushReport {
        if let Some(worker) = self.worker.lock().await.take() {
            worker.stop().await;
        }

        match tokio::time::timeout(self.config.shutdown_flush_timeout, self.checkpoint()).await {
            Ok(report) => {
                if report.is_clean() {
                    info!("Final checkpoint complete");
                } else {
                    warn!("Final checkpoint finished with {} errors", report.errors.len());
                }
                report
            }
            Err(_) => {
                warn!("Final checkpoint timed out after {:?}", self.config.shutdown_flush_timeout);
                FlushReport {
                    errors: vec![format!(
                        "final checkpoint timed out after {:?}",
                        self.config.shutdown_flush_timeout
                    )],
                    ..FlushReport::default()
                }
            }
        }
    }
}

fn safe_dir_name(user_id: &str) -> String {
    user_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// One user's view of the assistant memory.
pub struct UserMemoryHandle {
    user_id: String,
    memory: Arc<ConversationMemory>,
    knowledge: Arc<KnowledgeStore>,
    context: Arc<ContextBuilder>,
}

impl UserMemoryHandle {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Appends to the open session, starting one if needed.
    pub async fn add_user_message(
        &self,
        content: &str,
        metadata: MessageMetadata,
    ) -> Result<ConversationMessage, MemoryError> {
        let session = self.memory.start_session(&self.user_id).await?;
        self.memory.append_message(&session, Role::User, content, metadata).await
    }

    pub async fn add_assistant_message(
        &self,
        content: &str,
        metadata: MessageMetadata,
    ) -> Result<ConversationMessage, MemoryError> {
        let session = self.memory.start_session(&self.user_id).await?;
        self.memory.append_message(&session, Role::Assistant, content, metadata).await
    }

    /// Ends and persists the open session. Returns false when none was open.
    pub async fn save_session(&self) -> Result<bool, MemoryError> {
        let open = self
            .memory
            .snapshot(&self.user_id)
            .and_then(|m| m.open_session().map(|s| s.id.clone()));
        match open {
            Some(session_id) => {
                self.memory.end_session(&session_id).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn get_context(&self, query: &str) -> ContextBundle {
        let snapshot = self.memory.snapshot(&self.user_id);
        let related = self.knowledge.related(query, None, self.context.config().knowledge_snippets);
        self.context.build(query, snapshot.as_deref(), &related)
    }

    pub fn greeting(&self) -> String {
        match self.memory.snapshot(&self.user_id) {
            Some(memory) => personalized_greeting(&memory.profile),
            None => personalized_greeting(&crate::memory::UserProfile::new(self.user_id.clone(), chrono::Utc::now())),
        }
    }

    pub fn stats(&self) -> Option<LearningStats> {
        self.memory.learning_stats(&self.user_id)
    }

    pub fn search(&self, keyword: &str) -> Vec<SearchMatch> {
        self.memory.search(&self.user_id, keyword)
    }

    async fn record_exchange(&self, query: &str, result: &Result<Answer, RouterError>) -> Result<(), MemoryError> {
        if query.trim().is_empty() {
            return Ok(());
        }
        self.add_user_message(query, MessageMetadata::new()).await?;
        if let Ok(answer) = result {
            let mut metadata = MessageMetadata::new();
            metadata.insert("source".to_string(), json!(answer.source.as_str()));
            metadata.insert("latency".to_string(), json!(answer.latency));
            self.add_assistant_message(&answer.text, metadata).await?;
        }
        Ok(())
    }
}
