//! Knowledge store - confidence-scored question/answer entries with keyword lookup

pub mod entry;
pub mod repository;
pub mod seed;
pub mod store;

pub use entry::{KnowledgeEntry, KnowledgeMatch, NewKnowledgeEntry};
pub use repository::{InMemoryKnowledgeRepository, KnowledgeRepository};
pub use store::{KnowledgeStats, KnowledgeStore, ReloadOutcome, SeedReason};
