use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use crate::db::{AppStateKey, ParmsDb};

/// Shows the configured syncs and their state from the parameter store.
#[derive(Debug, Parser)]
pub struct StatusCommand {
    /// Parameter store path.
    #[clap(long)]
    pub parms_db: PathBuf,
}

impl StatusCommand {
    pub fn run(self) -> anyhow::Result<()> {
        let parms = ParmsDb::open(&self.parms_db)
            .map_err(|exit| anyhow::anyhow!("Could not open parameter store: {exit}"))
            .with_context(|| format!("at {}", self.parms_db.display()))?;

        let syncs = parms
            .all_syncs()
            .map_err(|exit| anyhow::anyhow!("Could not list syncs: {exit}"))?;

        if syncs.is_empty() {
            println!("No syncs configured.");
            return Ok(());
        }

        for sync in syncs {
            println!(
                "sync {}: {} <-> drive {} ({}{})",
                sync.db_id,
                sync.local_path,
                sync.drive_db_id,
                if sync.paused { "paused" } else { "active" },
                if sync.has_fully_completed {
                    ", fully synced"
                } else {
                    ""
                },
            );
        }

        if let Some(completed) = parms
            .app_state(AppStateKey::SyncHasFullyCompleted)
            .map_err(|exit| anyhow::anyhow!("Could not read app state: {exit}"))?
        {
            println!("All syncs fully completed: {}", completed == "1");
        }

        Ok(())
    }
}
