use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{ExitCause, ExitCode, ExitInfo, SyncResult};
use crate::types::{DbNodeId, NodeId, NodeType, ReplicaSide, SyncPath, SyncTime};

/// Sync status of a persisted node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeStatus {
    #[default]
    Pending,
    Synced,
    ConflictOpGenerated,
}

impl NodeStatus {
    fn to_i64(self) -> i64 {
        match self {
            NodeStatus::Pending => 0,
            NodeStatus::Synced => 1,
            NodeStatus::ConflictOpGenerated => 2,
        }
    }

    fn from_i64(value: i64) -> Self {
        match value {
            1 => NodeStatus::Synced,
            2 => NodeStatus::ConflictOpGenerated,
            _ => NodeStatus::Pending,
        }
    }
}

/// The last-synced state of one item, present on both replicas. This is the
/// oracle the op computer diffs against and the executor commits into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbNode {
    pub db_id: DbNodeId,
    /// 0 for children of the sync root.
    pub parent_db_id: DbNodeId,
    pub name_local: String,
    pub name_remote: String,
    pub node_id_local: NodeId,
    pub node_id_remote: NodeId,
    pub created: SyncTime,
    pub modified_local: SyncTime,
    pub modified_remote: SyncTime,
    pub size: i64,
    pub node_type: NodeType,
    pub checksum: Option<String>,
    pub status: NodeStatus,
}

impl DbNode {
    pub fn name_on(&self, side: ReplicaSide) -> &str {
        match side {
            ReplicaSide::Remote => &self.name_remote,
            _ => &self.name_local,
        }
    }

    pub fn node_id_on(&self, side: ReplicaSide) -> &NodeId {
        match side {
            ReplicaSide::Remote => &self.node_id_remote,
            _ => &self.node_id_local,
        }
    }

    pub fn modified_on(&self, side: ReplicaSide) -> SyncTime {
        match side {
            ReplicaSide::Remote => self.modified_remote,
            _ => self.modified_local,
        }
    }
}

fn node_type_to_i64(node_type: NodeType) -> i64 {
    match node_type {
        NodeType::File => 0,
        NodeType::Directory => 1,
        NodeType::Unknown => 2,
    }
}

fn node_type_from_i64(value: i64) -> NodeType {
    match value {
        0 => NodeType::File,
        1 => NodeType::Directory,
        _ => NodeType::Unknown,
    }
}

/// Remote node ids the user singled out: excluded from sync entirely, or
/// chosen as selective-sync roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum SyncNodeKind {
    UserBlacklist = 0,
    SelectiveSyncRoot = 1,
}

/// Per-sync database. All access is serialized behind one mutex; the master
/// thread and executor-launched jobs share the handle.
pub struct SyncDb {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS node (
    db_id INTEGER PRIMARY KEY AUTOINCREMENT,
    parent_db_id INTEGER NOT NULL,
    name_local TEXT NOT NULL,
    name_remote TEXT NOT NULL,
    node_id_local TEXT NOT NULL,
    node_id_remote TEXT NOT NULL,
    created INTEGER NOT NULL,
    modified_local INTEGER NOT NULL,
    modified_remote INTEGER NOT NULL,
    size INTEGER NOT NULL,
    node_type INTEGER NOT NULL,
    checksum TEXT,
    status INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS node_local_idx ON node (node_id_local);
CREATE INDEX IF NOT EXISTS node_remote_idx ON node (node_id_remote);
CREATE TABLE IF NOT EXISTS upload_session_token (
    db_id INTEGER PRIMARY KEY AUTOINCREMENT,
    token TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS sync_node (
    sync_db_id INTEGER PRIMARY KEY AUTOINCREMENT,
    node_id TEXT NOT NULL,
    node_kind INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS sync_kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

const CURSOR_KEY: &str = "listing_cursor";

impl SyncDb {
    pub fn open(path: &Path) -> SyncResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database, used by tests and dry runs.
    pub fn open_in_memory() -> SyncResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn insert_node(&self, node: &DbNode) -> SyncResult<DbNodeId> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO node (parent_db_id, name_local, name_remote, node_id_local, \
             node_id_remote, created, modified_local, modified_remote, size, node_type, \
             checksum, status) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                node.parent_db_id,
                node.name_local,
                node.name_remote,
                node.node_id_local.as_str(),
                node.node_id_remote.as_str(),
                node.created,
                node.modified_local,
                node.modified_remote,
                node.size,
                node_type_to_i64(node.node_type),
                node.checksum,
                node.status.to_i64(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn update_node(&self, node: &DbNode) -> SyncResult<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE node SET parent_db_id = ?2, name_local = ?3, name_remote = ?4, \
             node_id_local = ?5, node_id_remote = ?6, created = ?7, modified_local = ?8, \
             modified_remote = ?9, size = ?10, node_type = ?11, checksum = ?12, status = ?13 \
             WHERE db_id = ?1",
            params![
                node.db_id,
                node.parent_db_id,
                node.name_local,
                node.name_remote,
                node.node_id_local.as_str(),
                node.node_id_remote.as_str(),
                node.created,
                node.modified_local,
                node.modified_remote,
                node.size,
                node_type_to_i64(node.node_type),
                node.checksum,
                node.status.to_i64(),
            ],
        )?;
        if updated == 0 {
            return Err(ExitInfo::new(ExitCode::DbError, ExitCause::DbEntryNotFound));
        }
        Ok(())
    }

    pub fn delete_node(&self, db_id: DbNodeId) -> SyncResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM node WHERE db_id = ?1", params![db_id])?;
        Ok(())
    }

    fn node_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbNode> {
        Ok(DbNode {
            db_id: row.get(0)?,
            parent_db_id: row.get(1)?,
            name_local: row.get(2)?,
            name_remote: row.get(3)?,
            node_id_local: NodeId::new(row.get::<_, String>(4)?),
            node_id_remote: NodeId::new(row.get::<_, String>(5)?),
            created: row.get(6)?,
            modified_local: row.get(7)?,
            modified_remote: row.get(8)?,
            size: row.get(9)?,
            node_type: node_type_from_i64(row.get(10)?),
            checksum: row.get(11)?,
            status: NodeStatus::from_i64(row.get(12)?),
        })
    }

    const SELECT: &'static str = "SELECT db_id, parent_db_id, name_local, name_remote, \
         node_id_local, node_id_remote, created, modified_local, modified_remote, size, \
         node_type, checksum, status FROM node";

    pub fn node_by_db_id(&self, db_id: DbNodeId) -> SyncResult<Option<DbNode>> {
        let conn = self.conn.lock().unwrap();
        let query = format!("{} WHERE db_id = ?1", Self::SELECT);
        let node = conn
            .query_row(&query, params![db_id], Self::node_from_row)
            .optional()?;
        Ok(node)
    }

    pub fn node_by_id(&self, side: ReplicaSide, id: &NodeId) -> SyncResult<Option<DbNode>> {
        let column = match side {
            ReplicaSide::Remote => "node_id_remote",
            _ => "node_id_local",
        };
        let conn = self.conn.lock().unwrap();
        let query = format!("{} WHERE {} = ?1", Self::SELECT, column);
        let node = conn
            .query_row(&query, params![id.as_str()], Self::node_from_row)
            .optional()?;
        Ok(node)
    }

    pub fn node_by_parent_and_name(
        &self,
        parent_db_id: DbNodeId,
        side: ReplicaSide,
        name: &str,
    ) -> SyncResult<Option<DbNode>> {
        let column = match side {
            ReplicaSide::Remote => "name_remote",
            _ => "name_local",
        };
        let conn = self.conn.lock().unwrap();
        let query = format!(
            "{} WHERE parent_db_id = ?1 AND {} = ?2",
            Self::SELECT,
            column
        );
        let node = conn
            .query_row(&query, params![parent_db_id, name], Self::node_from_row)
            .optional()?;
        Ok(node)
    }

    pub fn all_nodes(&self) -> SyncResult<Vec<DbNode>> {
        let conn = self.conn.lock().unwrap();
        let query = format!("{} ORDER BY db_id", Self::SELECT);
        let mut statement = conn.prepare(&query)?;
        let nodes = statement
            .query_map([], Self::node_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(nodes)
    }

    /// Reconstruct the relative path of a node on one side by walking
    /// `parent_db_id` links up to the root.
    pub fn path_of(&self, db_id: DbNodeId, side: ReplicaSide) -> SyncResult<Option<SyncPath>> {
        let mut components = Vec::new();
        let mut current = db_id;

        while current != 0 {
            let Some(node) = self.node_by_db_id(current)? else {
                return Ok(None);
            };
            components.push(node.name_on(side).to_owned());
            current = node.parent_db_id;
        }

        let mut path = SyncPath::root();
        for name in components.iter().rev() {
            path = path.join(name);
        }
        Ok(Some(path))
    }

    pub fn insert_upload_session_token(&self, token: &str) -> SyncResult<DbNodeId> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO upload_session_token (token) VALUES (?1)",
            params![token],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn delete_upload_session_token(&self, db_id: DbNodeId) -> SyncResult<bool> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM upload_session_token WHERE db_id = ?1",
            params![db_id],
        )?;
        Ok(deleted > 0)
    }

    /// All persisted upload-session tokens. Non-empty after a crash mid
    /// session; the engine cancels each on the server before retrying.
    pub fn upload_session_tokens(&self) -> SyncResult<Vec<(DbNodeId, String)>> {
        let conn = self.conn.lock().unwrap();
        let mut statement =
            conn.prepare("SELECT db_id, token FROM upload_session_token ORDER BY db_id")?;
        let tokens = statement
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tokens)
    }

    pub fn insert_sync_node(&self, node_id: &NodeId, kind: SyncNodeKind) -> SyncResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sync_node (node_id, node_kind) VALUES (?1, ?2)",
            params![node_id.as_str(), kind as i64],
        )?;
        Ok(())
    }

    pub fn delete_sync_node(&self, node_id: &NodeId, kind: SyncNodeKind) -> SyncResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM sync_node WHERE node_id = ?1 AND node_kind = ?2",
            params![node_id.as_str(), kind as i64],
        )?;
        Ok(())
    }

    pub fn sync_nodes(&self, kind: SyncNodeKind) -> SyncResult<Vec<NodeId>> {
        let conn = self.conn.lock().unwrap();
        let mut statement = conn.prepare(
            "SELECT node_id FROM sync_node WHERE node_kind = ?1 ORDER BY sync_db_id",
        )?;
        let nodes = statement
            .query_map(params![kind as i64], |row| {
                Ok(NodeId::new(row.get::<_, String>(0)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(nodes)
    }

    pub fn listing_cursor(&self) -> SyncResult<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let cursor = conn
            .query_row(
                "SELECT value FROM sync_kv WHERE key = ?1",
                params![CURSOR_KEY],
                |row| row.get(0),
            )
            .optional()?;
        Ok(cursor)
    }

    pub fn set_listing_cursor(&self, cursor: &str) -> SyncResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sync_kv (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![CURSOR_KEY, cursor],
        )?;
        Ok(())
    }

    pub fn clear_listing_cursor(&self) -> SyncResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM sync_kv WHERE key = ?1", params![CURSOR_KEY])?;
        Ok(())
    }
}
