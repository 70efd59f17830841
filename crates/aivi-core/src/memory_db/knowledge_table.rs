use crate::error::{DataIntegrityError, LoadError, StorageError};
use crate::knowledge::entry::{entry_keywords, validate_confidence, KnowledgeEntry};
use crate::knowledge::KnowledgeRepository;
use crate::memory_db::schema::{decode_timestamp, encode_keywords, encode_timestamp, integrity};
use crate::memory_db::DbPool;
use rusqlite::{params, Connection, Row};
use tracing::debug;

const OWNER: &str = "knowledge_entries";

/// `knowledge_entries` table access
pub struct KnowledgeTable {
    pool: DbPool,
}

impl KnowledgeTable {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn write_entries(conn: &Connection, entries: &[KnowledgeEntry]) -> rusqlite::Result<()> {
        let mut stmt = conn.prepare_cached(
            "INSERT INTO knowledge_entries
             (id, category, question, answer, keywords, source, timestamp, confidence,
              difficulty_level, academic_field, citation)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                category = excluded.category,
                question = excluded.question,
                answer = excluded.answer,
                keywords = excluded.keywords,
                source = excluded.source,
                timestamp = excluded.timestamp,
                confidence = excluded.confidence,
                difficulty_level = excluded.difficulty_level,
                academic_field = excluded.academic_field,
                citation = excluded.citation",
        )?;

        for entry in entries {
            stmt.execute(params![
                entry.id,
                entry.category,
                entry.question,
                entry.answer,
                encode_keywords(&entry.keywords),
                entry.source,
                encode_timestamp(&entry.created_at),
                entry.confidence as f64,
                entry.difficulty_level,
                entry.academic_field,
                entry.citation,
            ])?;
        }
        Ok(())
    }
}

struct RawEntry {
    id: String,
    category: String,
    question: String,
    answer: String,
    source: String,
    timestamp: String,
    confidence: f64,
    difficulty_level: String,
    academic_field: String,
    citation: Option<String>,
}

impl RawEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            category: row.get(1)?,
            question: row.get(2)?,
            answer: row.get(3)?,
            source: row.get(4)?,
            timestamp: row.get(5)?,
            confidence: row.get(6)?,
            difficulty_level: row.get(7)?,
            academic_field: row.get(8)?,
            citation: row.get(9)?,
        })
    }

    fn decode(self) -> Result<KnowledgeEntry, DataIntegrityError> {
        let confidence = self.confidence as f32;
        validate_confidence(confidence).map_err(|e| integrity(OWNER, format!("entry {}: {}", self.id, e)))?;
        let created_at = decode_timestamp(OWNER, "timestamp", &self.timestamp)?;
        // Keywords are a function of the text, so they are rebuilt rather than trusted
        let keywords = entry_keywords(&self.question, &self.answer).into_iter().collect();

        Ok(KnowledgeEntry {
            id: self.id,
            category: self.category,
            question: self.question,
            answer: self.answer,
            keywords,
            source: self.source,
            confidence,
            difficulty_level: self.difficulty_level,
            academic_field: self.academic_field,
            citation: self.citation,
            created_at,
        })
    }
}

/// Column type mismatches mean the row itself is bad; anything else is the medium.
pub(crate) fn classify_row_error(owner: &str, e: rusqlite::Error) -> LoadError {
    match e {
        rusqlite::Error::InvalidColumnType(..)
        | rusqlite::Error::FromSqlConversionFailure(..)
        | rusqlite::Error::IntegralValueOutOfRange(..) => integrity(owner, e.to_string()).into(),
        other => LoadError::Storage(other.into()),
    }
}

impl KnowledgeRepository for KnowledgeTable {
    fn load_all(&self) -> Result<Vec<KnowledgeEntry>, LoadError> {
        let conn = self.pool.get().map_err(StorageError::from)?;
        let mut stmt = conn
            .prepare(
                "SELECT id, category, question, answer, source, timestamp, confidence,
                        difficulty_level, academic_field, citation
                 FROM knowledge_entries
                 ORDER BY rowid",
            )
            .map_err(StorageError::from)?;

        let raw = stmt
            .query_map([], RawEntry::from_row)
            .map_err(StorageError::from)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| classify_row_error(OWNER, e))?;

        let entries = raw
            .into_iter()
            .map(RawEntry::decode)
            .collect::<Result<Vec<_>, _>>()?;
        debug!("Loaded {} knowledge rows", entries.len());
        Ok(entries)
    }

    fn save(&self, entries: &[KnowledgeEntry]) -> Result<(), StorageError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        Self::write_entries(&tx, entries)?;
        tx.commit()?;
        Ok(())
    }

    fn replace_all(&self, entries: &[KnowledgeEntry]) -> Result<(), StorageError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM knowledge_entries", [])?;
        Self::write_entries(&tx, entries)?;
        tx.commit()?;
        Ok(())
    }
}
