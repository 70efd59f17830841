//! Confidence-gated question/answer store.
//!
//! Readers work against an immutable snapshot swapped in by the single writer, so a
//! lookup never waits on an insert or a flush in progress. Inserts land in memory
//! immediately and are queued for the next [`KnowledgeStore::persist`].

use super::entry::{KnowledgeEntry, KnowledgeMatch, NewKnowledgeEntry};
use super::repository::KnowledgeRepository;
use super::seed::default_entries;
use crate::config::Config;
use crate::error::{KnowledgeError, LoadError, StorageError};
use crate::metrics;
use crate::utils::keywords::{extract_keywords, overlaps, weighted_similarity, KeywordSet};
use crate::utils::TextUtils;
use arc_swap::ArcSwap;
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

struct IndexedEntry {
    entry: Arc<KnowledgeEntry>,
    question_key: String,
    question_keywords: KeywordSet,
    answer_keywords: KeywordSet,
    all_keywords: KeywordSet,
}

impl IndexedEntry {
    fn new(entry: Arc<KnowledgeEntry>) -> Self {
        let question_key = TextUtils::dedup_key(&entry.question);
        let question_keywords = extract_keywords(&entry.question);
        let answer_keywords = extract_keywords(&entry.answer);
        let all_keywords = question_keywords.union(&answer_keywords).cloned().collect();
        Self {
            entry,
            question_key,
            question_keywords,
            answer_keywords,
            all_keywords,
        }
    }

    fn in_category(&self, category: Option<&str>) -> bool {
        category.map_or(true, |c| self.entry.category.eq_ignore_ascii_case(c))
    }

    fn exact_match(&self) -> KnowledgeMatch {
        KnowledgeMatch {
            entry: Arc::clone(&self.entry),
            similarity: 1.0,
            score: self.entry.confidence,
        }
    }

    fn score(&self, query: &KeywordSet) -> Option<KnowledgeMatch> {
        if !overlaps(query, &self.all_keywords) {
            return None;
        }
        let similarity = weighted_similarity(query, &self.question_keywords, &self.answer_keywords);
        Some(KnowledgeMatch {
            entry: Arc::clone(&self.entry),
            similarity,
            score: similarity * self.entry.confidence,
        })
    }
}

#[derive(Default, Clone)]
struct KnowledgeSnapshot {
    entries: Vec<Arc<IndexedEntry>>,
    ids: HashSet<String>,
    /// Normalized question text -> position in `entries`. Questions with no
    /// keywords at all are only reachable through this index.
    questions: HashMap<String, usize>,
}

impl KnowledgeSnapshot {
    fn from_entries(entries: impl IntoIterator<Item = Arc<KnowledgeEntry>>) -> Self {
        let mut snapshot = Self::default();
        for entry in entries {
            if snapshot.ids.contains(&entry.id) {
                warn!("Skipping duplicate knowledge entry id {}", entry.id);
            } else {
                snapshot.push(entry);
            }
        }
        snapshot
    }

    fn with_entry(&self, entry: Arc<KnowledgeEntry>) -> Self {
        let mut next = self.clone();
        next.push(entry);
        next
    }

    fn push(&mut self, entry: Arc<KnowledgeEntry>) {
        let indexed = IndexedEntry::new(entry);
        let position = self.entries.len();
        let keep_existing = self
            .questions
            .get(&indexed.question_key)
            .is_some_and(|&i| self.entries[i].entry.confidence >= indexed.entry.confidence);
        if !keep_existing {
            self.questions.insert(indexed.question_key.clone(), position);
        }
        self.ids.insert(indexed.entry.id.clone());
        self.entries.push(Arc::new(indexed));
    }

    fn all(&self) -> impl Iterator<Item = &Arc<KnowledgeEntry>> {
        self.entries.iter().map(|e| &e.entry)
    }

    /// Exact question match first, then every keyword match not already listed.
    fn candidates(&self, query: &str, category: Option<&str>) -> Vec<KnowledgeMatch> {
        let exact = self
            .questions
            .get(&TextUtils::dedup_key(query))
            .map(|&i| &self.entries[i])
            .filter(|e| e.in_category(category));
        let exact_id = exact.map(|e| e.entry.id.as_str());

        let keywords = extract_keywords(query);
        let mut matches: Vec<KnowledgeMatch> = exact.map(|e| e.exact_match()).into_iter().collect();
        if !keywords.is_empty() {
            matches.extend(
                self.entries
                    .iter()
                    .filter(|e| e.in_category(category) && Some(e.entry.id.as_str()) != exact_id)
                    .filter_map(|e| e.score(&keywords)),
            );
        }
        matches
    }
}

/// How often an entry has been served.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccessCount {
    pub id: String,
    pub question: String,
    pub count: u64,
}

/// Entries listed under [`KnowledgeStats::most_accessed`].
pub const MOST_ACCESSED_LIMIT: usize = 5;

#[derive(Default)]
struct WriterState {
    pending: Vec<Arc<KnowledgeEntry>>,
    consecutive_failures: u32,
    /// Storage held corrupted data; the next flush rewrites the whole collection.
    replace_on_persist: bool,
}

/// Why the store fell back to its built-in entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedReason {
    Empty,
    Unreadable,
    Corrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    Loaded(usize),
    Seeded(SeedReason),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct KnowledgeStats {
    pub total_entries: usize,
    pub pending_writes: usize,
    pub categories: BTreeSet<String>,
    pub by_source: BTreeMap<String, usize>,
    /// Most served entries first; ties go to the oldest entry
    pub most_accessed: Vec<AccessCount>,
}

pub struct KnowledgeStore {
    snapshot: ArcSwap<KnowledgeSnapshot>,
    writer: Mutex<WriterState>,
    repository: Arc<dyn KnowledgeRepository>,
    changed: Arc<Notify>,
    pending_writes: AtomicUsize,
    /// entry id -> times served. Kept beside the snapshot so counting never rewrites it.
    access_counts: DashMap<String, u64>,
    hit_threshold: f32,
    max_write_failures: u32,
}

impl KnowledgeStore {
    /// Empty store. Call [`reload`](Self::reload) to pull in durable entries.
    pub fn new(repository: Arc<dyn KnowledgeRepository>, hit_threshold: f32, max_write_failures: u32) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(KnowledgeSnapshot::default()),
            writer: Mutex::new(WriterState::default()),
            repository,
            changed: Arc::new(Notify::new()),
            pending_writes: AtomicUsize::new(0),
            access_counts: DashMap::new(),
            hit_threshold,
            max_write_failures: max_write_failures.max(1),
        }
    }

    /// Store built from configuration and loaded from `repository`.
    pub async fn open(repository: Arc<dyn KnowledgeRepository>, config: &Config) -> Self {
        let store = Self::new(repository, config.hit_threshold, config.max_write_failures);
        store.reload().await;
        store
    }

    pub fn hit_threshold(&self) -> f32 {
        self.hit_threshold
    }

    /// Signalled whenever an insert leaves unwritten entries behind.
    pub fn change_notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.changed)
    }

    /// Best entry for `query`, scored by similarity × confidence.
    ///
    /// A question stored with the same normalized text counts as similarity 1.0, so
    /// queries made only of stopwords still find their own cached answer. Otherwise a
    /// candidate must share at least one keyword with the query.
    pub fn lookup(&self, query: &str, category: Option<&str>) -> Option<KnowledgeMatch> {
        let snapshot = self.snapshot.load();
        let mut best: Option<KnowledgeMatch> = None;
        for candidate in snapshot.candidates(query, category) {
            let better = match &best {
                None => true,
                Some(current) => {
                    candidate.score > current.score
                        || (candidate.score == current.score
                            && candidate.entry.confidence > current.entry.confidence)
                }
            };
            if better {
                best = Some(candidate);
            }
        }
        best
    }

    /// Up to `limit` candidates for `query`, best first.
    pub fn related(&self, query: &str, category: Option<&str>, limit: usize) -> Vec<KnowledgeMatch> {
        if limit == 0 {
            return Vec::new();
        }
        let mut matches = self.snapshot.load().candidates(query, category);
        matches.sort_by(|a, b| b.score.total_cmp(&a.score));
        matches.truncate(limit);
        matches
    }

    /// Counts one use of an entry's answer.
    pub fn record_access(&self, id: &str) {
        *self.access_counts.entry(id.to_string()).or_insert(0) += 1;
    }

    pub fn access_count(&self, id: &str) -> u64 {
        self.access_counts.get(id).map(|c| *c).unwrap_or(0)
    }

    pub fn is_hit(&self, candidate: &KnowledgeMatch) -> bool {
        candidate.score >= self.hit_threshold
    }

    pub async fn insert(&self, new: NewKnowledgeEntry) -> Result<Arc<KnowledgeEntry>, KnowledgeError> {
        new.validate()?;

        let mut writer = self.writer.lock().await;
        let current = self.snapshot.load_full();

        let mut id = Uuid::new_v4().to_string();
        while current.ids.contains(&id) {
            id = Uuid::new_v4().to_string();
        }

        let entry = Arc::new(KnowledgeEntry::from_new(id, new, Utc::now()));
        self.snapshot.store(Arc::new(current.with_entry(Arc::clone(&entry))));
        writer.pending.push(Arc::clone(&entry));
        self.pending_writes.store(writer.pending.len(), Ordering::Relaxed);
        drop(writer);

        debug!(
            "Inserted knowledge entry {} ({}, confidence {:.2})",
            entry.id, entry.category, entry.confidence
        );
        metrics::inc_knowledge_insert(&entry.source);
        metrics::set_knowledge_entries(self.len());
        self.changed.notify_one();
        Ok(entry)
    }

    /// Writes entries not yet on durable storage. Returns how many were written.
    ///
    /// A failed write keeps the entries queued. The failure is returned as an
    /// error only once `max_write_failures` consecutive attempts have failed.
    pub async fn persist(&self) -> Result<usize, KnowledgeError> {
        let mut writer = self.writer.lock().await;
        if writer.pending.is_empty() && !writer.replace_on_persist {
            return Ok(0);
        }

        let replace = writer.replace_on_persist;
        let batch: Vec<KnowledgeEntry> = if replace {
            self.snapshot.load().all().map(|e| (**e).clone()).collect()
        } else {
            writer.pending.iter().map(|e| (**e).clone()).collect()
        };
        let count = batch.len();

        let repository = Arc::clone(&self.repository);
        let result = tokio::task::spawn_blocking(move || {
            if replace {
                repository.replace_all(&batch)
            } else {
                repository.save(&batch)
            }
        })
        .await
        .unwrap_or_else(|e| Err(StorageError::new(format!("knowledge write task failed: {}", e))));

        match result {
            Ok(()) => {
                writer.pending.clear();
                writer.replace_on_persist = false;
                writer.consecutive_failures = 0;
                self.pending_writes.store(0, Ordering::Relaxed);
                debug!("Persisted {} knowledge entries", count);
                Ok(count)
            }
            Err(source) => {
                writer.consecutive_failures += 1;
                let attempts = writer.consecutive_failures;
                metrics::inc_persist_failure("knowledge");
                warn!(
                    "Failed to persist {} knowledge entries (attempt {}): {}",
                    count, attempts, source
                );
                if attempts >= self.max_write_failures {
                    Err(KnowledgeError::Storage { attempts, source })
                } else {
                    Ok(0)
                }
            }
        }
    }

    /// Replaces the in-memory collection with durable contents.
    ///
    /// Empty, unreadable or corrupted storage falls back to the built-in entries.
    /// Entries still waiting to be written are kept either way.
    pub async fn reload(&self) -> ReloadOutcome {
        let mut writer = self.writer.lock().await;

        let repository = Arc::clone(&self.repository);
        let loaded = tokio::task::spawn_blocking(move || repository.load_all())
            .await
            .unwrap_or_else(|e| {
                Err(LoadError::Storage(StorageError::new(format!(
                    "knowledge load task failed: {}",
                    e
                ))))
            });

        let outcome = match loaded {
            Ok(entries) if !entries.is_empty() => {
                let count = entries.len();
                let loaded: Vec<Arc<KnowledgeEntry>> = entries.into_iter().map(Arc::new).collect();
                let known: HashSet<&str> = loaded.iter().map(|e| e.id.as_str()).collect();
                let unwritten: Vec<Arc<KnowledgeEntry>> = writer
                    .pending
                    .iter()
                    .filter(|e| !known.contains(e.id.as_str()))
                    .cloned()
                    .collect();
                let snapshot = KnowledgeSnapshot::from_entries(loaded.into_iter().chain(unwritten));
                self.snapshot.store(Arc::new(snapshot));
                info!("Loaded {} knowledge entries from storage", count);
                ReloadOutcome::Loaded(count)
            }
            Ok(_) => {
                info!("Knowledge storage is empty, seeding built-in entries");
                self.seed(&mut writer, false);
                ReloadOutcome::Seeded(SeedReason::Empty)
            }
            Err(LoadError::Integrity(e)) => {
                warn!("Knowledge storage is corrupted ({}), reinitializing from built-in entries", e);
                self.seed(&mut writer, true);
                ReloadOutcome::Seeded(SeedReason::Corrupted)
            }
            Err(LoadError::Storage(e)) => {
                warn!("Knowledge storage is unreadable ({}), starting from built-in entries", e);
                self.seed(&mut writer, false);
                ReloadOutcome::Seeded(SeedReason::Unreadable)
            }
        };

        self.pending_writes.store(writer.pending.len(), Ordering::Relaxed);
        metrics::set_knowledge_entries(self.len());
        outcome
    }

    fn seed(&self, writer: &mut WriterState, replace: bool) {
        let seeds: Vec<Arc<KnowledgeEntry>> = default_entries(Utc::now()).into_iter().map(Arc::new).collect();
        let unwritten = std::mem::take(&mut writer.pending);

        let mut pending = seeds.clone();
        pending.extend(unwritten.iter().cloned());
        self.snapshot
            .store(Arc::new(KnowledgeSnapshot::from_entries(seeds.into_iter().chain(unwritten))));
        writer.pending = pending;
        writer.replace_on_persist |= replace;
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<Arc<KnowledgeEntry>> {
        self.snapshot.load().all().find(|e| e.id == id).cloned()
    }

    /// All entries in insertion order.
    pub fn entries(&self) -> Vec<Arc<KnowledgeEntry>> {
        self.snapshot.load().all().cloned().collect()
    }

    pub fn stats(&self) -> KnowledgeStats {
        let snapshot = self.snapshot.load();
        let mut stats = KnowledgeStats {
            total_entries: snapshot.entries.len(),
            pending_writes: self.pending_writes.load(Ordering::Relaxed),
            ..Default::default()
        };
        for entry in snapshot.all() {
            stats.categories.insert(entry.category.clone());
            *stats.by_source.entry(entry.source.clone()).or_insert(0) += 1;

            let count = self.access_count(&entry.id);
            if count > 0 {
                stats.most_accessed.push(AccessCount {
                    id: entry.id.clone(),
                    question: entry.question.clone(),
                    count,
                });
            }
        }
        // Stable sort over insertion order
        stats.most_accessed.sort_by(|a, b| b.count.cmp(&a.count));
        stats.most_accessed.truncate(MOST_ACCESSED_LIMIT);
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DataIntegrityError, ValidationError};
    use crate::knowledge::repository::InMemoryKnowledgeRepository;
    use std::sync::atomic::{AtomicBool, AtomicU32};

    /// Repository whose reads and writes can be made to fail on demand.
    #[derive(Default)]
    struct FlakyRepository {
        inner: InMemoryKnowledgeRepository,
        fail_writes: AtomicBool,
        corrupt: AtomicBool,
        unreadable: AtomicBool,
        replace_calls: AtomicU32,
    }

    impl KnowledgeRepository for FlakyRepository {
        fn load_all(&self) -> Result<Vec<KnowledgeEntry>, LoadError> {
            if self.corrupt.load(Ordering::SeqCst) {
                return Err(DataIntegrityError {
                    owner: "knowledge_entries".into(),
                    detail: "confidence 7.0 out of range".into(),
                }
                .into());
            }
            if self.unreadable.load(Ordering::SeqCst) {
                return Err(StorageError::new("disk unavailable").into());
            }
            self.inner.load_all()
        }

        fn save(&self, entries: &[KnowledgeEntry]) -> Result<(), StorageError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StorageError::new("read-only filesystem"));
            }
            self.inner.save(entries)
        }

        fn replace_all(&self, entries: &[KnowledgeEntry]) -> Result<(), StorageError> {
            self.replace_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StorageError::new("read-only filesystem"));
            }
            self.inner.replace_all(entries)
        }
    }

    fn empty_store() -> (KnowledgeStore, Arc<FlakyRepository>) {
        let repo = Arc::new(FlakyRepository::default());
        let store = KnowledgeStore::new(repo.clone(), 0.85, 3);
        (store, repo)
    }

    #[tokio::test]
    async fn test_insert_rejects_out_of_range_confidence() {
        let (store, _) = empty_store();
        store
            .insert(NewKnowledgeEntry::new("What is DNA?", "A molecule.", "test", 0.8))
            .await
            .unwrap();

        for bad in [1.2_f32, -0.1] {
            let err = store
                .insert(NewKnowledgeEntry::new("What is RNA?", "Another molecule.", "test", bad))
                .await
                .unwrap_err();
            assert_eq!(err, KnowledgeError::Validation(ValidationError::ConfidenceOutOfRange(bad)));
        }

        assert_eq!(store.len(), 1);
        assert_eq!(store.stats().pending_writes, 1);
    }

    #[tokio::test]
    async fn test_score_boundary_around_threshold() {
        let (below, _) = empty_store();
        below
            .insert(NewKnowledgeEntry::new("quantum tunneling barrier", "Particles cross it.", "test", 0.84))
            .await
            .unwrap();
        let miss = below.lookup("quantum tunneling barrier", None).unwrap();
        assert!((miss.score - 0.84).abs() < 1e-6);
        assert!(!below.is_hit(&miss));

        let (above, _) = empty_store();
        above
            .insert(NewKnowledgeEntry::new("quantum tunneling barrier", "Particles cross it.", "test", 0.86))
            .await
            .unwrap();
        let hit = above.lookup("quantum tunneling barrier", None).unwrap();
        assert!((hit.score - 0.86).abs() < 1e-6);
        assert!(above.is_hit(&hit));
    }

    #[tokio::test]
    async fn test_lookup_none_without_shared_keyword() {
        let (store, _) = empty_store();
        store
            .insert(NewKnowledgeEntry::new("What is gravity?", "A force.", "test", 0.9))
            .await
            .unwrap();
        assert!(store.lookup("medieval poetry", None).is_none());
        assert!(store.lookup("what is the", None).is_none());
        assert!(store.lookup("what is it?", None).is_none());
    }

    #[tokio::test]
    async fn test_lookup_prefers_highest_composite_score() {
        let (store, _) = empty_store();
        store
            .insert(NewKnowledgeEntry::new("gravity on the moon", "Weaker than on earth.", "test", 0.9))
            .await
            .unwrap();
        let best = store
            .insert(NewKnowledgeEntry::new("What is gravity?", "A force.", "test", 0.9))
            .await
            .unwrap();

        let found = store.lookup("gravity", None).unwrap();
        assert_eq!(found.entry.id, best.id);
        assert_eq!(found.similarity, 1.0);
    }

    #[tokio::test]
    async fn test_related_returns_best_first() {
        let (store, _) = empty_store();
        store.insert(NewKnowledgeEntry::new("gravity waves", "Ripples.", "t", 0.5)).await.unwrap();
        store.insert(NewKnowledgeEntry::new("gravity", "A force.", "t", 0.9)).await.unwrap();
        store.insert(NewKnowledgeEntry::new("poetry", "Verse.", "t", 0.9)).await.unwrap();

        let related = store.related("gravity", None, 5);
        assert_eq!(related.len(), 2);
        assert_eq!(related[0].entry.question, "gravity");
        assert!(store.related("gravity", None, 0).is_empty());
    }

    #[tokio::test]
    async fn test_persist_flushes_pending_once() {
        let (store, repo) = empty_store();
        store.insert(NewKnowledgeEntry::new("What is DNA?", "A molecule.", "test", 0.8)).await.unwrap();
        store.insert(NewKnowledgeEntry::new("What is RNA?", "A molecule.", "test", 0.8)).await.unwrap();

        assert_eq!(store.persist().await.unwrap(), 2);
        assert_eq!(repo.inner.len(), 2);
        assert_eq!(store.persist().await.unwrap(), 0);
        assert_eq!(store.stats().pending_writes, 0);
    }

    #[tokio::test]
    async fn test_persist_retries_and_surfaces_repeated_failure() {
        let (store, repo) = empty_store();
        repo.fail_writes.store(true, Ordering::SeqCst);
        store.insert(NewKnowledgeEntry::new("What is DNA?", "A molecule.", "test", 0.8)).await.unwrap();

        assert_eq!(store.persist().await.unwrap(), 0);
        assert_eq!(store.persist().await.unwrap(), 0);
        let err = store.persist().await.unwrap_err();
        assert!(matches!(err, KnowledgeError::Storage { attempts: 3, .. }));

        // Still served from memory and still queued
        assert!(store.lookup("DNA", None).is_some());
        assert_eq!(store.stats().pending_writes, 1);

        repo.fail_writes.store(false, Ordering::SeqCst);
        assert_eq!(store.persist().await.unwrap(), 1);
        assert_eq!(repo.inner.len(), 1);
    }

    #[tokio::test]
    async fn test_reload_seeds_empty_storage() {
        let (store, repo) = empty_store();
        assert_eq!(store.reload().await, ReloadOutcome::Seeded(SeedReason::Empty));
        assert_eq!(store.len(), 3);
        assert!(store.get("seed-2").is_some());

        store.persist().await.unwrap();
        assert_eq!(repo.inner.len(), 3);
        assert_eq!(store.reload().await, ReloadOutcome::Loaded(3));
    }

    #[tokio::test]
    async fn test_reload_recovers_from_corruption() {
        let (store, repo) = empty_store();
        repo.corrupt.store(true, Ordering::SeqCst);

        assert_eq!(store.reload().await, ReloadOutcome::Seeded(SeedReason::Corrupted));
        assert!(store.lookup("What is photosynthesis?", None).is_some());

        repo.corrupt.store(false, Ordering::SeqCst);
        store.persist().await.unwrap();
        assert_eq!(repo.replace_calls.load(Ordering::SeqCst), 1);
        assert_eq!(repo.inner.len(), 3);
    }

    #[tokio::test]
    async fn test_reload_keeps_unwritten_entries() {
        let (store, repo) = empty_store();
        repo.unreadable.store(true, Ordering::SeqCst);
        store.insert(NewKnowledgeEntry::new("What is DNA?", "A molecule.", "test", 0.8)).await.unwrap();

        assert_eq!(store.reload().await, ReloadOutcome::Seeded(SeedReason::Unreadable));
        assert_eq!(store.len(), 4);
        assert!(store.lookup("DNA", None).is_some());
    }

    #[tokio::test]
    async fn test_insert_signals_change() {
        let (store, _) = empty_store();
        let notify = store.change_notifier();
        store.insert(NewKnowledgeEntry::new("What is DNA?", "A molecule.", "test", 0.8)).await.unwrap();
        // notify_one stores a permit when nobody is waiting
        tokio::time::timeout(std::time::Duration::from_millis(100), notify.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stats_group_by_source_and_category() {
        let (store, _) = empty_store();
        store.reload().await;
        store
            .insert(NewKnowledgeEntry::new("What is DNA?", "A molecule.", "llm", 0.9).with_category("biology"))
            .await
            .unwrap();
        let stats = store.stats();
        assert_eq!(stats.total_entries, 4);
        assert_eq!(stats.by_source.get("builtin"), Some(&3));
        assert_eq!(stats.by_source.get("llm"), Some(&1));
        assert!(stats.categories.contains("biology"));
    }

    #[tokio::test]
    async fn test_lookup_matches_stopword_only_question_exactly() {
        let (store, _) = empty_store();
        let entry = store
            .insert(NewKnowledgeEntry::new("How are you?", "Ready to study.", "test", 0.9))
            .await
            .unwrap();

        let found = store.lookup("  how ARE you ", None).unwrap();
        assert_eq!(found.entry.id, entry.id);
        assert_eq!(found.similarity, 1.0);
        assert!(store.is_hit(&found));
        assert!(store.lookup("are you", None).is_none());
        assert_eq!(store.related("How are you?", None, 3).len(), 1);
    }

    #[tokio::test]
    async fn test_exact_match_prefers_most_confident_duplicate() {
        let (store, _) = empty_store();
        store.insert(NewKnowledgeEntry::new("What is it?", "Low.", "test", 0.5)).await.unwrap();
        let best = store
            .insert(NewKnowledgeEntry::new("what is it", "High.", "test", 0.95))
            .await
            .unwrap();
        store.insert(NewKnowledgeEntry::new("What is it!", "Mid.", "test", 0.7)).await.unwrap();

        assert_eq!(store.lookup("What is it?", None).unwrap().entry.id, best.id);
    }

    #[tokio::test]
    async fn test_category_filter_limits_candidates() {
        let (store, _) = empty_store();
        let physics = store
            .insert(NewKnowledgeEntry::new("What is gravity?", "A force.", "t", 0.9).with_category("physics"))
            .await
            .unwrap();
        store
            .insert(NewKnowledgeEntry::new("gravity of a situation", "Seriousness.", "t", 0.9).with_category("english"))
            .await
            .unwrap();

        assert_eq!(store.lookup("gravity", Some("Physics")).unwrap().entry.id, physics.id);
        assert!(store.lookup("What is gravity?", Some("english")).unwrap().entry.id != physics.id);
        assert!(store.lookup("gravity", Some("history")).is_none());
        assert_eq!(store.related("gravity", None, 5).len(), 2);
        assert_eq!(store.related("gravity", Some("english"), 5).len(), 1);
    }

    #[tokio::test]
    async fn test_access_counts_feed_most_accessed() {
        let (store, _) = empty_store();
        store.reload().await;
        assert!(store.stats().most_accessed.is_empty());

        store.record_access("seed-2");
        store.record_access("seed-2");
        store.record_access("seed-3");
        store.record_access("missing");

        let stats = store.stats();
        let ranked: Vec<(&str, u64)> = stats.most_accessed.iter().map(|a| (a.id.as_str(), a.count)).collect();
        assert_eq!(ranked, vec![("seed-2", 2), ("seed-3", 1)]);
        assert_eq!(store.access_count("seed-1"), 0);
        // Counting leaves scoring alone
        assert_eq!(store.get("seed-2").unwrap().confidence, 0.95);
    }
}
