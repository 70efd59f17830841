//! Durable storage seam for knowledge entries

use super::entry::KnowledgeEntry;
use crate::error::{LoadError, StorageError};
use dashmap::DashMap;
use std::sync::Arc;

/// Blocking storage backend. Callers run these methods off the async runtime.
pub trait KnowledgeRepository: Send + Sync {
    /// Every stored entry, oldest first.
    fn load_all(&self) -> Result<Vec<KnowledgeEntry>, LoadError>;
    /// Insert or update the given entries by id, all or nothing.
    fn save(&self, entries: &[KnowledgeEntry]) -> Result<(), StorageError>;
    /// Replace the whole collection with `entries`, all or nothing.
    fn replace_all(&self, entries: &[KnowledgeEntry]) -> Result<(), StorageError>;
}

/// Non-durable repository, used when no database is configured and in tests.
#[derive(Clone, Default)]
pub struct InMemoryKnowledgeRepository {
    store: Arc<DashMap<String, KnowledgeEntry>>,
}

impl InMemoryKnowledgeRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<KnowledgeEntry> {
        self.store.get(id).map(|e| e.clone())
    }
}

impl KnowledgeRepository for InMemoryKnowledgeRepository {
    fn load_all(&self) -> Result<Vec<KnowledgeEntry>, LoadError> {
        let mut entries: Vec<KnowledgeEntry> = self.store.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(entries)
    }

    fn save(&self, entries: &[KnowledgeEntry]) -> Result<(), StorageError> {
        for entry in entries {
            self.store.insert(entry.id.clone(), entry.clone());
        }
        Ok(())
    }

    fn replace_all(&self, entries: &[KnowledgeEntry]) -> Result<(), StorageError> {
        self.store.clear();
        self.save(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::seed::default_entries;
    use chrono::Utc;

    #[test]
    fn test_in_memory_save_is_upsert() {
        let repo = InMemoryKnowledgeRepository::new();
        let mut seeds = default_entries(Utc::now());
        repo.save(&seeds).unwrap();
        seeds[0].confidence = 0.5;
        repo.save(&seeds[..1]).unwrap();
        assert_eq!(repo.len(), 3);
        assert_eq!(repo.get("seed-1").map(|e| e.confidence), Some(0.5));
    }

    #[test]
    fn test_in_memory_replace_all_drops_old_rows() {
        let repo = InMemoryKnowledgeRepository::new();
        let seeds = default_entries(Utc::now());
        repo.save(&seeds).unwrap();
        repo.replace_all(&seeds[2..]).unwrap();
        let loaded = repo.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "seed-3");
    }
}
