pub mod answer_service;
pub mod assistant;
pub mod config;
pub mod context_engine;
pub mod conversation_memory;
pub mod error;
pub mod knowledge;
pub mod memory;
pub mod memory_db;
pub mod metrics;
pub mod profile_analytics;
pub mod query_router;
pub mod telemetry;
pub mod utils;
pub mod worker_threads;

// Public API exports
pub use answer_service::{AnswerService, GeneratedAnswer};
pub use assistant::{Assistant, UserMemoryHandle};
pub use config::Config;
pub use context_engine::{ContextBuilder, ContextBundle};
pub use conversation_memory::{ConversationMemory, SearchMatch, UserExport, UserMemory};
pub use error::{
    DataIntegrityError, KnowledgeError, LoadError, MemoryError, RouterError, ServiceError, StorageError,
    ValidationError,
};
pub use knowledge::{KnowledgeEntry, KnowledgeStore, NewKnowledgeEntry};
pub use memory::{ConversationMessage, ConversationSession, LearningStyle, MessageMetadata, Role, UserProfile};
pub use memory_db::MemoryDatabase;
pub use profile_analytics::{LearningStats, ProgressLevel};
pub use query_router::{Answer, LatencyClass, QueryRouter, Resolution, SourceTag};
