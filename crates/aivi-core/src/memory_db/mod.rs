//! Memory database module - SQLite-backed storage for knowledge entries, profiles and sessions

pub mod conversation_store;
pub mod knowledge_table;
pub mod migration;
pub mod schema;

pub use conversation_store::ConversationStore;
pub use knowledge_table::KnowledgeTable;
pub use migration::MigrationManager;
pub use schema::DatabaseStats;

use crate::error::StorageError;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub type DbPool = Arc<Pool<SqliteConnectionManager>>;

const CONNECTION_PRAGMAS: &str = "PRAGMA foreign_keys = ON;
     PRAGMA synchronous = NORMAL;
     PRAGMA busy_timeout = 5000;";

/// Connection pool plus the two repositories that share it
pub struct MemoryDatabase {
    pub knowledge: Arc<KnowledgeTable>,
    pub conversations: Arc<ConversationStore>,
    pool: DbPool,
}

impl MemoryDatabase {
    pub fn new(db_path: &Path) -> anyhow::Result<Self> {
        info!("Opening memory database at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                    | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .with_init(|conn| conn.execute_batch(CONNECTION_PRAGMAS));
        let pool = Pool::builder()
            .max_size(8)
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;

        {
            let mut conn = pool.get()?;
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
            let mut migrator = MigrationManager::new(&mut conn);
            migrator.initialize_database()?;
        }

        info!("Memory database initialized successfully");
        Ok(Self::from_pool(Arc::new(pool)))
    }

    /// Private in-memory database. A single connection keeps every caller on the same data.
    pub fn new_in_memory() -> anyhow::Result<Self> {
        let manager = SqliteConnectionManager::memory().with_init(|conn| conn.execute_batch(CONNECTION_PRAGMAS));
        let pool = Pool::builder().max_size(1).build(manager)?;
        {
            let mut conn = pool.get()?;
            MigrationManager::new(&mut conn).initialize_database()?;
        }
        Ok(Self::from_pool(Arc::new(pool)))
    }

    fn from_pool(pool: DbPool) -> Self {
        Self {
            knowledge: Arc::new(KnowledgeTable::new(Arc::clone(&pool))),
            conversations: Arc::new(ConversationStore::new(Arc::clone(&pool))),
            pool,
        }
    }

    pub fn get_stats(&self) -> Result<DatabaseStats, StorageError> {
        let conn = self.pool.get()?;
        Ok(migration::get_database_stats(&conn)?)
    }
}

impl Drop for MemoryDatabase {
    fn drop(&mut self) {
        if let Ok(conn) = self.pool.get() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::seed::default_entries;
    use crate::knowledge::KnowledgeRepository;
    use chrono::Utc;

    #[test]
    fn test_file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("aivi.db");

        {
            let db = MemoryDatabase::new(&path).unwrap();
            db.knowledge.save(&default_entries(Utc::now())).unwrap();
        }

        let db = MemoryDatabase::new(&path).unwrap();
        assert_eq!(db.knowledge.load_all().unwrap().len(), 3);
        assert_eq!(db.get_stats().unwrap().total_knowledge_entries, 3);
    }

    #[test]
    fn test_in_memory_database_shares_one_connection() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        db.knowledge.save(&default_entries(Utc::now())).unwrap();
        assert_eq!(db.knowledge.load_all().unwrap().len(), 3);
    }
}
