use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use thiserror::Error;
use watchfs::{Fs, StdBackend};

use crate::cli::resolve_path;
use crate::db::{ParmsDb, SyncDb};
use crate::engine::{EngineOptions, EngineParams, SyncEngine, SyncState};
use crate::error::log_error_sink;
use crate::exclusion::ExclusionTemplates;
use crate::jobs::manager::JobManager;
use crate::remote_api::{AuthClient, HttpDrive, TokenPair};
use crate::types::NodeId;
use crate::vfs::NoopVfs;

/// Runs one sync pair against a remote drive until interrupted.
#[derive(Debug, Parser)]
pub struct SyncCommand {
    /// Local directory to synchronize.
    #[clap(long = "local")]
    pub local_path: PathBuf,

    /// Base URL of the drive API, e.g. https://api.example.com/3.
    #[clap(long)]
    pub drive_url: String,

    /// Drive identifier.
    #[clap(long)]
    pub drive_id: String,

    /// Id of the remote directory to use as the sync root.
    #[clap(long)]
    pub remote_root: String,

    /// JSON file holding the OAuth token pair ({"access": ..,
    /// "refresh": ..}).
    #[clap(long)]
    pub token_file: PathBuf,

    /// OAuth token endpoint used for refreshes.
    #[clap(long)]
    pub token_url: String,

    /// OAuth client id.
    #[clap(long)]
    pub client_id: String,

    /// Sync database path. Defaults to `.keel/sync.db` under the local
    /// directory.
    #[clap(long)]
    pub sync_db: Option<PathBuf>,

    /// Parameter store path; exclusion templates are read from it.
    #[clap(long)]
    pub parms_db: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum TokenFileError {
    #[error("could not read token file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("token file {path} does not hold an access/refresh token pair")]
    Parse { path: String },
}

fn load_tokens(path: &Path) -> Result<TokenPair, TokenFileError> {
    let bytes = std::fs::read(path).map_err(|source| TokenFileError::Read {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|_| TokenFileError::Parse {
        path: path.display().to_string(),
    })
}

impl SyncCommand {
    pub fn run(self) -> anyhow::Result<()> {
        let local_root = resolve_path(&self.local_path).into_owned();
        if !local_root.is_dir() {
            bail!("Local sync root {} is not a directory", local_root.display());
        }

        let state_dir = local_root.join(".keel");
        std::fs::create_dir_all(&state_dir)
            .with_context(|| format!("Could not create {}", state_dir.display()))?;

        let tokens = load_tokens(&self.token_file)?;

        let db_path = self.sync_db.unwrap_or_else(|| state_dir.join("sync.db"));
        let db = Arc::new(
            SyncDb::open(&db_path)
                .map_err(|exit| anyhow::anyhow!("Could not open sync DB: {exit}"))?,
        );

        let user_templates = match &self.parms_db {
            Some(path) => {
                let parms = ParmsDb::open(path)
                    .map_err(|exit| anyhow::anyhow!("Could not open parameter store: {exit}"))?;
                parms
                    .exclusion_templates()
                    .map_err(|exit| anyhow::anyhow!("Could not read exclusion templates: {exit}"))?
            }
            None => Vec::new(),
        };
        let exclusions = Arc::new(ExclusionTemplates::new(&user_templates));

        let backend = StdBackend::new();
        let fault_receiver = backend.fault_receiver();
        let fs = Arc::new(Fs::new(backend));

        let root_meta = fs
            .metadata(&local_root)
            .with_context(|| format!("Could not stat {}", local_root.display()))?;
        let local_root_id = NodeId::from(root_meta.file_id);

        let auth = AuthClient::new(self.token_url, self.client_id);
        let api = Arc::new(HttpDrive::new(self.drive_url, self.drive_id, auth, tokens));

        let manager = JobManager::new();

        let mut engine = SyncEngine::new(EngineParams {
            fs,
            api,
            vfs: Arc::new(NoopVfs),
            db,
            manager: Arc::clone(&manager),
            errors: log_error_sink(),
            local_root: local_root.clone(),
            local_root_id,
            remote_root_id: NodeId::new(self.remote_root),
            exclusions,
            fault_receiver: Some(fault_receiver),
            options: EngineOptions::default(),
        })
        .map_err(|exit| anyhow::anyhow!("Could not start sync engine: {exit}"))?;

        log::info!("Synchronizing {}", local_root.display());
        engine.start();

        loop {
            std::thread::sleep(Duration::from_secs(1));
            match engine.state() {
                SyncState::Error => {
                    engine.stop();
                    manager.stop();
                    bail!("Sync stopped after an unrecoverable error; see the log for details");
                }
                SyncState::Stopped => {
                    manager.stop();
                    return Ok(());
                }
                _ => {}
            }
        }
    }
}
