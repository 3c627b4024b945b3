//! Lifecycle wrapper around one segment file: Active -> Stub -> Removed.

use std::path::Path;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::active::ActiveSegment;
use crate::error::{Error, Result};
use crate::segment::segment_path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileState {
    /// Open for appends, owns the active segment.
    Active,
    /// Drained (or draining); the on-disk file remains, eligible for
    /// removal.
    Stub,
    /// The on-disk file is gone.
    Removed,
}

pub(crate) struct AppendFile {
    id: u64,
    state: FileState,
    segment: Option<Arc<ActiveSegment>>,
}

impl std::fmt::Debug for AppendFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppendFile")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl AppendFile {
    pub(crate) fn create(base: &Path, id: u64) -> Result<Self> {
        Ok(Self {
            id,
            state: FileState::Active,
            segment: Some(ActiveSegment::create(segment_path(base, id))?),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Handle for appending; `None` once the file has left the active
    /// state.
    pub(crate) fn segment(&self) -> Option<Arc<ActiveSegment>> {
        match self.state {
            FileState::Active => self.segment.clone(),
            _ => None,
        }
    }

    /// Starts the asynchronous drain of the owned segment and becomes a
    /// stub. Closing a non-active file completes immediately.
    pub(crate) fn close(&mut self) -> JoinHandle<Result<()>> {
        if self.state != FileState::Active {
            return tokio::spawn(async { Ok(()) });
        }
        self.state = FileState::Stub;
        let segment = self.segment.take().expect("active file owns its segment");
        tokio::spawn(segment.close())
    }

    /// Deletes the on-disk file. Legal only for stubs.
    pub(crate) fn remove(&mut self, base: &Path) -> Result<()> {
        if self.state != FileState::Stub {
            return Err(Error::InvalidState("remove on a journal file that is not a closed stub"));
        }
        self.state = FileState::Removed;
        std::fs::remove_file(segment_path(base, self.id))?;
        Ok(())
    }
}
