//! The reconciliation pipeline.
//!
//! Each pass turns two frozen snapshots plus the sync DB into an ordered,
//! executable plan:
//!
//! 1. [`compute`] diffs each snapshot against the DB into per-side
//!    operation sets.
//! 2. [`tree`] materializes the affected subtrees per side.
//! 3. [`platform`] rejects or renames names the local platform cannot
//!    represent.
//! 4. [`conflict`] pairs colliding operations and [`resolve`] applies the
//!    deterministic resolution policy.
//! 5. [`generate`] converts the surviving tree operations into sync
//!    operations targeting the opposite side.
//! 6. [`sort`] orders them so each is safe to apply.

pub mod compute;
pub mod conflict;
pub mod generate;
pub mod platform;
pub mod resolve;
pub mod sort;
pub mod tree;

pub use compute::{compute_operations, FsOpType, FsOperation, FsOperationSet};
pub use conflict::{find_conflicts, Conflict};
pub use generate::{generate_operations, SyncOp, SyncOpType};
pub use platform::check_platform_inconsistencies;
pub use resolve::{resolve_conflicts, Resolution};
pub use sort::sort_operations;
pub use tree::{ChangeType, UpdateNode, UpdateTree};
