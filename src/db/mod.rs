//! Persistence boundaries of the engine.
//!
//! Two stores exist: a per-sync database ([`SyncDb`]) holding the
//! last-synced state of every item plus upload-session tokens and the remote
//! listing cursor, and a process-wide parameter store ([`ParmsDb`]) holding
//! user/account/drive/sync configuration and app state flags.
//!
//! Both expose synchronous CRUD by primary key. "Row not found" on lookup is
//! not an error; it means the identity is absent from the replica. Write
//! failures surface as `DbError` and pause the sync.

mod parms_db;
mod sync_db;

pub use parms_db::{AppStateKey, ParmsDb, SyncConfig};
pub use sync_db::{DbNode, NodeStatus, SyncDb, SyncNodeKind};
