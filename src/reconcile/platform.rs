//! Platform inconsistency checker.
//!
//! Names arriving from the remote replica may not be representable on the
//! local platform: reserved device names, illegal characters, excessive
//! path length, or names that collide once the local filesystem folds case
//! or Unicode normalization. Representable-but-colliding names are renamed
//! with a disambiguating suffix (the op becomes `TmpFileName`); hopeless
//! ones are blacklisted and surfaced as an error.

use std::collections::HashMap;

use crate::blacklist::TmpBlacklist;
use crate::error::{report, ErrorSink, ExitCause, ExitCode, ExitInfo, SyncError};
use crate::types::ReplicaSide;

use super::tree::{ChangeType, UpdateTree};

/// Conservative cross-platform path length cap, in bytes.
const MAX_PATH_LENGTH: usize = 4096;
const MAX_NAME_LENGTH: usize = 255;

const RESERVED_WINDOWS_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

fn has_illegal_characters(name: &str) -> bool {
    name.chars()
        .any(|c| matches!(c, '<' | '>' | ':' | '"' | '|' | '?' | '*' | '\\' | '/') || c.is_control())
}

fn is_reserved_name(name: &str) -> bool {
    let stem = name.split('.').next().unwrap_or(name);
    RESERVED_WINDOWS_NAMES
        .iter()
        .any(|reserved| stem.eq_ignore_ascii_case(reserved))
}

fn has_trailing_dot_or_space(name: &str) -> bool {
    name.ends_with('.') || name.ends_with(' ')
}

/// Replace every character the platform cannot represent.
fn sanitized(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if matches!(c, '<' | '>' | ':' | '"' | '|' | '?' | '*' | '\\' | '/') || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();
    cleaned.trim_end_matches([' ', '.']).to_owned()
}

fn disambiguated(name: &str, attempt: u32) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem} ({attempt}).{ext}"),
        _ => format!("{name} ({attempt})"),
    }
}

/// Check the tree arriving from `tree.side` against local platform rules.
/// Only ops that will materialize a name locally matter, so the remote
/// tree gets the full treatment; the local tree's names already exist.
pub fn check_platform_inconsistencies(
    tree: &mut UpdateTree,
    blacklist: &TmpBlacklist,
    errors: &ErrorSink,
) {
    if tree.side != ReplicaSide::Remote {
        return;
    }

    // Names already claimed per parent, folded the way a case-insensitive
    // NFC-normalizing filesystem would fold them.
    let mut claimed: HashMap<(Option<usize>, String), usize> = HashMap::new();
    for index in tree.preorder() {
        let node = tree.node(index);
        if node.change == ChangeType::None {
            claimed.insert((node.parent, node.name.to_lowercase()), index);
        }
    }

    for index in tree.changed_nodes() {
        let node = tree.node(index);
        if !matches!(node.change, ChangeType::Create | ChangeType::MoveDest) {
            continue;
        }

        let name = node.name.clone();
        let path = node.path.clone();
        let id = node.id.clone();
        let parent = node.parent;

        if path.as_path().as_os_str().len() > MAX_PATH_LENGTH || name.len() > MAX_NAME_LENGTH {
            log::warn!("Path too long for the local platform: {}", path);
            blacklist.touch(ReplicaSide::Remote, None, &path);
            blacklist.record_error(ReplicaSide::Remote, &id, &path);
            report(
                errors,
                SyncError::node(
                    ReplicaSide::Remote,
                    path,
                    ExitInfo::new(ExitCode::InvalidOperation, ExitCause::InvalidName),
                ),
            );
            tree.clear_subtree(index);
            continue;
        }

        let mut new_name = None;
        if has_illegal_characters(&name) || has_trailing_dot_or_space(&name) {
            let cleaned = sanitized(&name);
            if cleaned.is_empty() {
                report(
                    errors,
                    SyncError::node(
                        ReplicaSide::Remote,
                        path.clone(),
                        ExitInfo::new(ExitCode::InvalidOperation, ExitCause::InvalidName),
                    ),
                );
                tree.clear_subtree(index);
                continue;
            }
            new_name = Some(cleaned);
        } else if is_reserved_name(&name) {
            new_name = Some(format!("_{name}"));
        }

        // Case / normalization collision with an existing sibling or an
        // earlier op in this pass.
        let mut candidate = new_name.clone().unwrap_or_else(|| name.clone());
        let mut attempt = 1;
        while claimed
            .get(&(parent, candidate.to_lowercase()))
            .is_some_and(|&holder| holder != index)
        {
            candidate = disambiguated(new_name.as_deref().unwrap_or(&name), attempt);
            attempt += 1;
        }
        if candidate != name {
            new_name = Some(candidate);
        }

        if let Some(new_name) = new_name {
            log::info!(
                "Renaming platform-inconsistent name {:?} to {:?}",
                name,
                new_name
            );
            tree.rename_node(index, &new_name);
            tree.node_mut(index).change = ChangeType::TmpFileName;
            let node = tree.node(index);
            claimed.insert((node.parent, node.name.to_lowercase()), index);
        } else {
            claimed.insert((parent, name.to_lowercase()), index);
        }
    }
}
