//! Listing jobs used by the remote observer.

use std::sync::{Arc, Mutex};

use crate::error::SyncResult;
use crate::jobs::{Job, JobState};
use crate::remote_api::{ChangeBatch, DriveApi, ListingPage};

/// Fetches one page of the bootstrap full listing.
pub struct InitFileListJob {
    state: JobState,
    api: Arc<dyn DriveApi>,
    cursor: Option<String>,
    limit: usize,
    page: Mutex<Option<ListingPage>>,
}

impl InitFileListJob {
    pub fn new(api: Arc<dyn DriveApi>, cursor: Option<String>, limit: usize) -> Self {
        Self {
            state: JobState::new(),
            api,
            cursor,
            limit,
            page: Mutex::new(None),
        }
    }

    pub fn take_page(&self) -> Option<ListingPage> {
        self.page.lock().unwrap().take()
    }
}

impl Job for InitFileListJob {
    fn state(&self) -> &JobState {
        &self.state
    }

    fn execute(&self) -> SyncResult<()> {
        let page = self
            .api
            .bootstrap_listing(self.cursor.as_deref(), self.limit)?;
        *self.page.lock().unwrap() = Some(page);
        Ok(())
    }
}

/// Long-polls the change feed from a cursor.
pub struct ContinueFileListJob {
    state: JobState,
    api: Arc<dyn DriveApi>,
    cursor: String,
    batch: Mutex<Option<ChangeBatch>>,
}

impl ContinueFileListJob {
    pub fn new(api: Arc<dyn DriveApi>, cursor: String) -> Self {
        Self {
            state: JobState::new(),
            api,
            cursor,
            batch: Mutex::new(None),
        }
    }

    pub fn take_batch(&self) -> Option<ChangeBatch> {
        self.batch.lock().unwrap().take()
    }
}

impl Job for ContinueFileListJob {
    fn state(&self) -> &JobState {
        &self.state
    }

    fn execute(&self) -> SyncResult<()> {
        let batch = self.api.continue_listing(&self.cursor)?;
        *self.batch.lock().unwrap() = Some(batch);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jobs::run_sync;
    use crate::remote_api::InMemoryDrive;

    #[test]
    fn init_then_continue_round_trip() {
        let drive = InMemoryDrive::new();
        let root = drive.root_id();
        drive.remote_write(&root, "a.txt", b"x");

        let api: Arc<dyn DriveApi> = Arc::new(drive.clone());
        let init = InitFileListJob::new(Arc::clone(&api), None, 100);
        assert!(run_sync(&init).is_ok());
        let page = init.take_page().unwrap();
        assert_eq!(page.items.len(), 1);

        drive.remote_write(&root, "b.txt", b"y");
        let poll = ContinueFileListJob::new(api, page.cursor);
        assert!(run_sync(&poll).is_ok());
        let batch = poll.take_batch().unwrap();
        assert_eq!(batch.changes.len(), 1);
        assert_eq!(batch.changes[0].item.name, "b.txt");
    }
}
