use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::SyncResult;
use crate::types::{DbNodeId, NodeId, SyncTime};

/// Enumerated keys of the `app_state` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppStateKey {
    LogUploadState,
    LastSuccessfulLogUploadDate,
    LastLogUploadArchivePath,
    SyncHasFullyCompleted,
}

impl AppStateKey {
    fn as_str(&self) -> &'static str {
        match self {
            AppStateKey::LogUploadState => "LogUploadState",
            AppStateKey::LastSuccessfulLogUploadDate => "LastSuccessfulLogUploadDate",
            AppStateKey::LastLogUploadArchivePath => "LastLogUploadArchivePath",
            AppStateKey::SyncHasFullyCompleted => "SyncHasFullyCompleted",
        }
    }
}

/// One configured sync pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub db_id: DbNodeId,
    pub drive_db_id: DbNodeId,
    pub local_path: String,
    pub local_node_id: NodeId,
    pub target_path: String,
    pub target_node_id: NodeId,
    pub db_path: String,
    pub paused: bool,
    pub listing_cursor: Option<String>,
    pub listing_cursor_ts: SyncTime,
    pub has_fully_completed: bool,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS user (
    db_id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    email TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS account (
    db_id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id INTEGER NOT NULL,
    user_db_id INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS drive (
    db_id INTEGER PRIMARY KEY AUTOINCREMENT,
    drive_id INTEGER NOT NULL,
    account_db_id INTEGER NOT NULL,
    name TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS sync (
    db_id INTEGER PRIMARY KEY AUTOINCREMENT,
    drive_db_id INTEGER NOT NULL,
    local_path TEXT NOT NULL,
    local_node_id TEXT NOT NULL,
    target_path TEXT NOT NULL,
    target_node_id TEXT NOT NULL,
    db_path TEXT NOT NULL,
    paused INTEGER NOT NULL DEFAULT 0,
    listing_cursor TEXT,
    listing_cursor_ts INTEGER NOT NULL DEFAULT 0,
    has_fully_completed INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS app_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS exclusion_template (
    template TEXT PRIMARY KEY
);
";

/// Process-wide parameter store. Mutex-guarded and read-mostly.
pub struct ParmsDb {
    conn: Mutex<Connection>,
}

impl ParmsDb {
    pub fn open(path: &Path) -> SyncResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> SyncResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn app_state(&self, key: AppStateKey) -> SyncResult<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let value = conn
            .query_row(
                "SELECT value FROM app_state WHERE key = ?1",
                params![key.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_app_state(&self, key: AppStateKey, value: &str) -> SyncResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO app_state (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key.as_str(), value],
        )?;
        Ok(())
    }

    pub fn insert_sync(&self, sync: &SyncConfig) -> SyncResult<DbNodeId> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sync (drive_db_id, local_path, local_node_id, target_path, \
             target_node_id, db_path, paused, listing_cursor, listing_cursor_ts, \
             has_fully_completed) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                sync.drive_db_id,
                sync.local_path,
                sync.local_node_id.as_str(),
                sync.target_path,
                sync.target_node_id.as_str(),
                sync.db_path,
                sync.paused,
                sync.listing_cursor,
                sync.listing_cursor_ts,
                sync.has_fully_completed,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn sync_by_db_id(&self, db_id: DbNodeId) -> SyncResult<Option<SyncConfig>> {
        let conn = self.conn.lock().unwrap();
        let sync = conn
            .query_row(
                "SELECT db_id, drive_db_id, local_path, local_node_id, target_path, \
                 target_node_id, db_path, paused, listing_cursor, listing_cursor_ts, \
                 has_fully_completed FROM sync WHERE db_id = ?1",
                params![db_id],
                Self::sync_from_row,
            )
            .optional()?;
        Ok(sync)
    }

    pub fn all_syncs(&self) -> SyncResult<Vec<SyncConfig>> {
        let conn = self.conn.lock().unwrap();
        let mut statement = conn.prepare(
            "SELECT db_id, drive_db_id, local_path, local_node_id, target_path, \
             target_node_id, db_path, paused, listing_cursor, listing_cursor_ts, \
             has_fully_completed FROM sync ORDER BY db_id",
        )?;
        let syncs = statement
            .query_map([], Self::sync_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(syncs)
    }

    pub fn set_sync_paused(&self, db_id: DbNodeId, paused: bool) -> SyncResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sync SET paused = ?2 WHERE db_id = ?1",
            params![db_id, paused],
        )?;
        Ok(())
    }

    pub fn set_sync_fully_completed(&self, db_id: DbNodeId, completed: bool) -> SyncResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sync SET has_fully_completed = ?2 WHERE db_id = ?1",
            params![db_id, completed],
        )?;
        Ok(())
    }

    fn sync_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncConfig> {
        Ok(SyncConfig {
            db_id: row.get(0)?,
            drive_db_id: row.get(1)?,
            local_path: row.get(2)?,
            local_node_id: NodeId::new(row.get::<_, String>(3)?),
            target_path: row.get(4)?,
            target_node_id: NodeId::new(row.get::<_, String>(5)?),
            db_path: row.get(6)?,
            paused: row.get(7)?,
            listing_cursor: row.get(8)?,
            listing_cursor_ts: row.get(9)?,
            has_fully_completed: row.get(10)?,
        })
    }

    pub fn add_exclusion_template(&self, template: &str) -> SyncResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO exclusion_template (template) VALUES (?1)",
            params![template],
        )?;
        Ok(())
    }

    pub fn exclusion_templates(&self) -> SyncResult<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut statement =
            conn.prepare("SELECT template FROM exclusion_template ORDER BY template")?;
        let templates = statement
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(templates)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn app_state_upsert_round_trip() {
        let db = ParmsDb::open_in_memory().unwrap();
        assert!(db
            .app_state(AppStateKey::SyncHasFullyCompleted)
            .unwrap()
            .is_none());

        db.set_app_state(AppStateKey::SyncHasFullyCompleted, "1")
            .unwrap();
        db.set_app_state(AppStateKey::SyncHasFullyCompleted, "0")
            .unwrap();

        assert_eq!(
            db.app_state(AppStateKey::SyncHasFullyCompleted)
                .unwrap()
                .as_deref(),
            Some("0")
        );
    }

    #[test]
    fn sync_config_round_trip() {
        let db = ParmsDb::open_in_memory().unwrap();
        let sync = SyncConfig {
            db_id: 0,
            drive_db_id: 1,
            local_path: "/home/user/Drive".into(),
            local_node_id: NodeId::from("local-root"),
            target_path: "/".into(),
            target_node_id: NodeId::from("remote-root"),
            db_path: "/home/user/.keel/sync1.db".into(),
            paused: false,
            listing_cursor: None,
            listing_cursor_ts: 0,
            has_fully_completed: false,
        };

        let db_id = db.insert_sync(&sync).unwrap();
        let loaded = db.sync_by_db_id(db_id).unwrap().unwrap();
        assert_eq!(loaded.local_node_id, NodeId::from("local-root"));
        assert!(!loaded.paused);

        db.set_sync_paused(db_id, true).unwrap();
        assert!(db.sync_by_db_id(db_id).unwrap().unwrap().paused);
    }

    #[test]
    fn exclusion_templates_are_deduplicated() {
        let db = ParmsDb::open_in_memory().unwrap();
        db.add_exclusion_template("*.tmp").unwrap();
        db.add_exclusion_template("*.tmp").unwrap();
        db.add_exclusion_template(".DS_Store").unwrap();

        assert_eq!(
            db.exclusion_templates().unwrap(),
            vec!["*.tmp".to_string(), ".DS_Store".to_string()]
        );
    }
}
