//! Exclusion templates.
//!
//! Glob-style patterns from the parameter store that hide items from the
//! engine entirely: the local observer drops events for them and the op
//! computer never sees them.

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::types::SyncPath;

/// Names excluded on every platform regardless of user configuration.
const BUILTIN_TEMPLATES: &[&str] = &[
    ".DS_Store",
    "._*",
    "Thumbs.db",
    "desktop.ini",
    "*.tmp",
    "~$*",
    ".~lock.*",
    "*.crdownload",
    "*.part",
];

pub struct ExclusionTemplates {
    set: GlobSet,
}

impl ExclusionTemplates {
    /// Build from user templates plus the built-in set. Invalid patterns
    /// are skipped with a warning rather than failing the sync.
    pub fn new(user_templates: &[String]) -> Self {
        let mut builder = GlobSetBuilder::new();

        for template in BUILTIN_TEMPLATES
            .iter()
            .map(|template| template.to_string())
            .chain(user_templates.iter().cloned())
        {
            match Glob::new(&template) {
                Ok(glob) => {
                    builder.add(glob);
                }
                Err(err) => {
                    log::warn!("Ignoring invalid exclusion template {:?}: {}", template, err);
                }
            }
        }

        let set = builder.build().unwrap_or_else(|err| {
            log::error!("Failed to build exclusion set: {}", err);
            GlobSet::empty()
        });

        Self { set }
    }

    pub fn builtin() -> Self {
        Self::new(&[])
    }

    /// Whether the item at `path` is excluded from sync. Matches against
    /// the file name, so a template excludes items at any depth.
    pub fn is_excluded(&self, path: &SyncPath) -> bool {
        if path.is_root() {
            return false;
        }
        self.set.is_match(path.name())
    }
}
