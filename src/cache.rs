//! Cache and temp directory resolution, plus the free-space safety floor
//! that download jobs check before writing.

use std::env;
use std::path::{Path, PathBuf};

use crate::error::{ExitCause, ExitCode, ExitInfo, SyncResult};

/// Bytes that must remain free after a download completes.
pub const DISK_SPACE_SAFETY_FLOOR: u64 = 512 * 1024 * 1024;

/// Resolve the cache directory root.
///
/// `KDRIVE_CACHE_PATH` overrides everything. On Linux the fallback chain is
/// `XDG_CACHE_HOME`, then `HOME/.cache`; elsewhere the system temp
/// directory is used.
pub fn cache_dir() -> PathBuf {
    if let Ok(path) = env::var("KDRIVE_CACHE_PATH") {
        if !path.is_empty() {
            return PathBuf::from(path).join("keel");
        }
    }

    if cfg!(target_os = "linux") {
        if let Ok(xdg) = env::var("XDG_CACHE_HOME") {
            if !xdg.is_empty() {
                return PathBuf::from(xdg).join("keel");
            }
        }
        if let Ok(home) = env::var("HOME") {
            if !home.is_empty() {
                return PathBuf::from(home).join(".cache").join("keel");
            }
        }
    }

    env::temp_dir().join("keel-cache")
}

/// Resolve the temp directory root. `KDRIVE_TMP_PATH` overrides (used by
/// tests); otherwise the system temp directory.
pub fn tmp_dir() -> PathBuf {
    if let Ok(path) = env::var("KDRIVE_TMP_PATH") {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    env::temp_dir()
}

/// Whether created local files should be written by copy-over instead of
/// rename, preserving existing ACLs of the target path.
pub fn preserve_permissions_on_create() -> bool {
    env::var("KDRIVE_PRESERVE_PERMISSIONS_ON_CREATE")
        .map(|value| value == "1")
        .unwrap_or(false)
}

/// Check that writing `needed_bytes` into both `temp_dir` and `dest_dir`
/// leaves at least the safety floor free on each. The smaller of the two
/// free-space figures governs.
pub fn check_disk_space(temp_dir: &Path, dest_dir: &Path, needed_bytes: u64) -> SyncResult<()> {
    let free = free_space(temp_dir).min(free_space(dest_dir));

    if free < needed_bytes.saturating_add(DISK_SPACE_SAFETY_FLOOR) {
        log::warn!(
            "Not enough disk space: {} bytes free, {} needed plus safety floor",
            free,
            needed_bytes
        );
        return Err(ExitInfo::new(
            ExitCode::SystemError,
            ExitCause::NotEnoughDiskSpace,
        ));
    }
    Ok(())
}

fn free_space(path: &Path) -> u64 {
    // Walk up until an existing ancestor answers; a missing path would
    // otherwise read as zero free space.
    for candidate in path.ancestors() {
        if let Ok(space) = fs2::available_space(candidate) {
            return space;
        }
    }
    0
}
