//! Download job.
//!
//! Streams one remote file into a temp file in the cache directory, then
//! either renames it atomically into place (create, full hydration) or
//! copies it over the existing target so the local id survives (edit).
//! Placeholder fetch progress is pushed through the VFS at most once per
//! second and once on completion.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use watchfs::Fs;

use crate::cache;
use crate::error::{ExitCause, ExitCode, ExitInfo, SyncResult};
use crate::jobs::{Job, JobState};
use crate::remote_api::DriveApi;
use crate::types::{LinkType, NodeId};
use crate::vfs::Vfs;

/// Transfer buffer granularity; also the abort-poll interval.
pub const DOWNLOAD_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Short reads are retried this many times before the stream counts as
/// truncated.
const EOF_RETRIES: u32 = 3;

const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// How the downloaded bytes reach their final path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadTarget {
    /// New local item: atomic rename of the temp file.
    Create,
    /// Existing local item: copy over it so its id and ACLs survive.
    Edit,
}

pub struct DownloadJob {
    state: JobState,
    api: Arc<dyn DriveApi>,
    fs: Arc<Fs>,
    vfs: Arc<dyn Vfs>,
    remote_id: NodeId,
    target_abs_path: PathBuf,
    target_kind: DownloadTarget,
    expected_size: u64,
    /// Link type detected from the response's sentinel MIME type.
    link_type: Mutex<LinkType>,
}

impl DownloadJob {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<dyn DriveApi>,
        fs: Arc<Fs>,
        vfs: Arc<dyn Vfs>,
        remote_id: NodeId,
        target_abs_path: PathBuf,
        target_kind: DownloadTarget,
        expected_size: u64,
    ) -> Self {
        Self {
            state: JobState::new(),
            api,
            fs,
            vfs,
            remote_id,
            target_abs_path,
            target_kind,
            expected_size,
            link_type: Mutex::new(LinkType::None),
        }
    }

    pub fn link_type(&self) -> LinkType {
        *self.link_type.lock().unwrap()
    }

    fn temp_path(&self) -> PathBuf {
        let name = format!("keel-dl-{}-{}", self.state.id(), self.remote_id);
        cache::cache_dir().join(name)
    }

    /// Read the whole stream in buffer-sized chunks, reporting fetch
    /// progress and polling the abort flag between chunks.
    fn read_stream(
        &self,
        reader: &mut dyn Read,
        content_length: Option<u64>,
        temp_path: &Path,
    ) -> SyncResult<Vec<u8>> {
        let expected = content_length.unwrap_or(self.expected_size);
        self.state.set_expected_progress(expected);

        let mut data = Vec::with_capacity(expected.min(DOWNLOAD_CHUNK_SIZE as u64) as usize);
        let mut buffer = vec![0u8; DOWNLOAD_CHUNK_SIZE.min(1024 * 1024)];
        let mut eof_retries = 0;
        let mut last_progress = Instant::now();

        loop {
            if self.state.is_aborted() {
                return Err(ExitInfo::new(
                    ExitCode::OperationCanceled,
                    ExitCause::OperationCanceled,
                ));
            }

            let read = reader.read(&mut buffer).map_err(ExitInfo::from)?;
            if read == 0 {
                if (data.len() as u64) < expected {
                    // EOF before the declared Content-Length; retry a few
                    // times in case the stream is just slow to flush.
                    eof_retries += 1;
                    if eof_retries > EOF_RETRIES {
                        log::warn!(
                            "Download of {} truncated at {} of {} bytes",
                            self.remote_id,
                            data.len(),
                            expected
                        );
                        return Err(ExitInfo::from(ExitCode::NetworkError));
                    }
                    std::thread::sleep(Duration::from_millis(100));
                    continue;
                }
                break;
            }

            eof_retries = 0;
            data.extend_from_slice(&buffer[..read]);
            self.state.set_progress(data.len() as u64);

            if last_progress.elapsed() >= PROGRESS_INTERVAL {
                last_progress = Instant::now();
                let fetch = self.vfs.update_fetch_status(
                    temp_path,
                    &self.target_abs_path,
                    data.len() as u64,
                )?;
                if fetch.canceled {
                    return Err(ExitInfo::new(
                        ExitCode::OperationCanceled,
                        ExitCause::OperationCanceled,
                    ));
                }
            }
        }

        Ok(data)
    }

    fn install(&self, temp_path: &Path) -> SyncResult<()> {
        let copy_over = match self.target_kind {
            DownloadTarget::Edit => true,
            DownloadTarget::Create => {
                cache::preserve_permissions_on_create() && self.fs.exists(&self.target_abs_path)?
            }
        };

        if copy_over {
            self.fs.copy(temp_path, &self.target_abs_path)?;
            self.fs.remove_file(temp_path)?;
        } else {
            self.fs.rename(temp_path, &self.target_abs_path)?;
        }
        Ok(())
    }
}

impl Job for DownloadJob {
    fn state(&self) -> &JobState {
        &self.state
    }

    fn execute(&self) -> SyncResult<()> {
        let dest_dir = self
            .target_abs_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));
        cache::check_disk_space(&cache::cache_dir(), &dest_dir, self.expected_size)?;

        let temp_path = self.temp_path();
        if let Some(parent) = temp_path.parent() {
            self.fs.create_dir_all(parent)?;
        }

        let mut stream = self.api.download(&self.remote_id)?;

        if let Some(mime) = stream.mime_type.as_deref() {
            let link_type = LinkType::from_mime(mime);
            if link_type != LinkType::None {
                *self.link_type.lock().unwrap() = link_type;
            }
        }

        let result = self.read_stream(&mut stream.reader, stream.content_length, &temp_path);
        let data = match result {
            Ok(data) => data,
            Err(exit) => {
                // Failed or canceled: drop the partial temp file and reset
                // any hydrate state the platform may be showing.
                let _ = self.fs.remove_file(&temp_path);
                if exit.code() == ExitCode::OperationCanceled {
                    let _ = self.vfs.cancel_hydrate(&self.target_abs_path);
                }
                return Err(exit);
            }
        };

        self.fs.write(&temp_path, &data)?;
        self.install(&temp_path)?;

        if let Err(exit) =
            self.vfs
                .update_fetch_status(&temp_path, &self.target_abs_path, data.len() as u64)
        {
            log::warn!(
                "VFS fetch-status update failed for {}: {}",
                self.target_abs_path.display(),
                exit
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jobs::run_sync;
    use crate::remote_api::InMemoryDrive;
    use crate::vfs::NoopVfs;
    use watchfs::InMemoryFs;

    fn fixture(contents: &[u8]) -> (InMemoryDrive, Arc<Fs>, NodeId) {
        let drive = InMemoryDrive::new();
        let root = drive.root_id();
        let remote_id = drive.remote_write(&root, "a.bin", contents);

        let fs = Arc::new(Fs::new(InMemoryFs::new()));
        fs.create_dir_all("/sync").unwrap();
        // The in-memory fs needs the cache directory to exist too.
        fs.create_dir_all(cache::cache_dir()).unwrap();
        (drive, fs, remote_id)
    }

    #[test]
    fn create_download_lands_at_target() {
        let (drive, fs, remote_id) = fixture(b"downloaded bytes");

        let job = DownloadJob::new(
            Arc::new(drive),
            Arc::clone(&fs),
            Arc::new(NoopVfs),
            remote_id,
            "/sync/a.bin".into(),
            DownloadTarget::Create,
            16,
        );

        assert!(run_sync(&job).is_ok());
        assert_eq!(fs.read("/sync/a.bin").unwrap(), b"downloaded bytes");
        assert_eq!(job.state().progress().0, 16);
    }

    #[test]
    fn edit_download_preserves_target_identity() {
        let (drive, fs, remote_id) = fixture(b"new content");
        fs.write("/sync/a.bin", b"old").unwrap();
        let id_before = fs.metadata("/sync/a.bin").unwrap().file_id;

        let job = DownloadJob::new(
            Arc::new(drive),
            Arc::clone(&fs),
            Arc::new(NoopVfs),
            remote_id,
            "/sync/a.bin".into(),
            DownloadTarget::Edit,
            11,
        );

        assert!(run_sync(&job).is_ok());
        assert_eq!(fs.read("/sync/a.bin").unwrap(), b"new content");
        assert_eq!(fs.metadata("/sync/a.bin").unwrap().file_id, id_before);
    }

    #[test]
    fn missing_remote_file_is_not_found() {
        let (drive, fs, _remote_id) = fixture(b"x");
        drop(drive);

        let drive = InMemoryDrive::new();
        let job = DownloadJob::new(
            Arc::new(drive),
            fs,
            Arc::new(NoopVfs),
            NodeId::from("ghost"),
            "/sync/a.bin".into(),
            DownloadTarget::Create,
            1,
        );

        assert_eq!(run_sync(&job).cause(), ExitCause::NotFound);
    }
}
