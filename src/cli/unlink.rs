use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use watchfs::Fs;

use crate::cli::resolve_path;
use crate::vfs::{NoopVfs, VirtualFilesCleaner};

/// Stops synchronizing a directory: clears virtual-file state from every
/// entry so the tree is left as plain files, and optionally deletes the
/// engine state under `.keel`.
#[derive(Debug, Parser)]
pub struct UnlinkCommand {
    /// Local directory to stop synchronizing.
    #[clap(long = "local")]
    pub local_path: PathBuf,

    /// Also delete the sync database, cursor, and logs under `.keel`.
    #[clap(long)]
    pub purge_state: bool,
}

impl UnlinkCommand {
    pub fn run(self) -> anyhow::Result<()> {
        let local_root = resolve_path(&self.local_path).into_owned();
        if !local_root.is_dir() {
            bail!("{} is not a directory", local_root.display());
        }

        let fs = Fs::new_default();
        fs.set_watch_enabled(false);

        // No platform VFS is registered for a CLI-driven unlink; the
        // cleaner then only removes dehydrated placeholders a previous
        // VFS-backed run may have left behind.
        let removed = VirtualFilesCleaner::new(&NoopVfs, &fs)
            .clean_root(&local_root)
            .map_err(|exit| anyhow::anyhow!("virtual file cleanup failed: {exit}"))?;
        for path in &removed {
            log::info!("Removed dehydrated placeholder {}", path.display());
        }

        if self.purge_state {
            let state_dir = local_root.join(".keel");
            if state_dir.is_dir() {
                std::fs::remove_dir_all(&state_dir)
                    .with_context(|| format!("could not delete {}", state_dir.display()))?;
                log::info!("Deleted engine state at {}", state_dir.display());
            }
        }

        println!(
            "Unlinked {} ({} placeholders removed)",
            local_root.display(),
            removed.len()
        );
        Ok(())
    }
}
