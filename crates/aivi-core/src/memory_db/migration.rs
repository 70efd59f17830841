//! Versioned schema migrations

use rusqlite::{Connection, Result};
use tracing::{error, info, warn};

use crate::memory_db::schema::DatabaseStats;

/// Applies pending schema migrations to a connection
pub struct MigrationManager<'a> {
    conn: &'a mut Connection,
}

impl<'a> MigrationManager<'a> {
    pub fn new(conn: &'a mut Connection) -> Self {
        Self { conn }
    }

    /// Bring the schema up to the latest version
    pub fn initialize_database(&mut self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        let current_version = self.get_current_version()?;
        let latest = latest_version();
        info!("Current database schema version: {} (latest {})", current_version, latest);
        if current_version >= latest {
            return Ok(());
        }

        self.apply_migrations(current_version)
    }

    fn apply_migrations(&mut self, current_version: i32) -> Result<()> {
        for (version, migration_sql) in get_migrations() {
            if version <= current_version {
                continue;
            }
            info!("Applying migration {}...", version);

            let tx = self.conn.transaction()?;
            if let Err(e) = tx.execute_batch(migration_sql) {
                error!("Failed to apply migration {}: {}", version, e);
                return Err(e);
            }
            tx.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
            tx.commit()?;

            info!("Migration {} applied successfully", version);
        }
        Ok(())
    }

    pub fn get_current_version(&self) -> Result<i32> {
        self.conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
    }

}

fn get_migrations() -> Vec<(i32, &'static str)> {
    vec![
        (1, include_str!("migrations/001_initial.sql")),
        (2, include_str!("migrations/002_success_patterns.sql")),
    ]
}

fn latest_version() -> i32 {
    get_migrations().iter().map(|(v, _)| *v).max().unwrap_or(0)
}

/// Row counts and file size. Missing tables count as empty.
pub fn get_database_stats(conn: &Connection) -> Result<DatabaseStats> {
    fn get_table_count(conn: &Connection, table_name: &str) -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table_name), [], |row| row.get(0))
            .unwrap_or_else(|e| {
                warn!("Failed to get count from table {}: {}", table_name, e);
                0
            })
    }

    let database_size_bytes: i64 = conn
        .query_row(
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok(DatabaseStats {
        total_knowledge_entries: get_table_count(conn, "knowledge_entries"),
        total_users: get_table_count(conn, "user_profiles"),
        total_sessions: get_table_count(conn, "conversation_sessions"),
        total_messages: get_table_count(conn, "conversation_messages"),
        database_size_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_database_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        {
            let mut migrator = MigrationManager::new(&mut conn);
            migrator.initialize_database().unwrap();
            migrator.initialize_database().unwrap();
            assert_eq!(migrator.get_current_version().unwrap(), 2);
        }
        let applied: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(applied, 2);

        let stats = get_database_stats(&conn).unwrap();
        assert_eq!(stats.total_knowledge_entries, 0);
        assert_eq!(stats.total_sessions, 0);
    }

    #[test]
    fn test_upgrade_from_first_version_keeps_profiles() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE schema_version (version INTEGER PRIMARY KEY, applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP);
             INSERT INTO schema_version (version) VALUES (1);",
        )
        .unwrap();
        conn.execute_batch(include_str!("migrations/001_initial.sql")).unwrap();
        conn.execute(
            "INSERT INTO user_profiles (user_id, difficulty_level, created_at, last_active)
             VALUES ('alice', 'intermediate', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')",
            [],
        )
        .unwrap();

        MigrationManager::new(&mut conn).initialize_database().unwrap();
        let patterns: String = conn
            .query_row("SELECT success_patterns FROM user_profiles WHERE user_id = 'alice'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(patterns, "[]");
    }

    #[test]
    fn test_stats_tolerate_missing_tables() {
        let conn = Connection::open_in_memory().unwrap();
        let stats = get_database_stats(&conn).unwrap();
        assert_eq!(stats.total_users, 0);
        assert_eq!(stats.total_messages, 0);
    }
}
