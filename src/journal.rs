//! The segment chain: rotation on overflow, checkpoints, retention, close.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use futures_util::future::join_all;
use tokio::task::JoinHandle;

use crate::active::ActiveSegment;
use crate::append_file::AppendFile;
use crate::error::{Error, Result};
use crate::frame::{LinkRecord, FRAME_HEADER_LEN, KIND_CHECK, KIND_DATA, MAX_RECORD_SIZE};
use crate::segment::{prepare_dir, scan_segments};

/// An append-only journal over rotating segment files.
///
/// Appends from many tasks run concurrently; the journal's own lock is held
/// only to pick or rotate the tail segment, never across I/O. Each append
/// resolves once its bytes have been handed to the file write, not after an
/// fsync.
#[derive(Debug)]
pub struct AppendJournal {
    base: PathBuf,
    state: Mutex<JournalState>,
}

#[derive(Debug)]
struct JournalState {
    /// No user record has been appended since the last checkpoint (or ever).
    /// Checkpoints never advance over an empty stretch.
    segment_empty: bool,
    /// Ascending by id; only the back file is ever active.
    files: VecDeque<AppendFile>,
    /// Live checkpoint id -> id of the segment that was the tail when the
    /// checkpoint was registered.
    checkpoints: BTreeMap<u64, u64>,
    next_file: u64,
    next_checkpoint: u64,
}

/// Everything a producer needs after rotating, captured under the journal
/// lock and consumed outside it.
struct Rotation {
    id: u64,
    to_close: Option<JoinHandle<Result<()>>>,
    link: LinkRecord,
    segment: Arc<ActiveSegment>,
}

impl JournalState {
    fn last_checkpoint(&self) -> u64 {
        self.checkpoints.keys().next().copied().unwrap_or(0)
    }

    fn current_checkpoint(&self) -> u64 {
        self.next_checkpoint
    }

    fn link_record(&self) -> LinkRecord {
        LinkRecord::new(self.last_checkpoint(), self.current_checkpoint())
    }
}

impl AppendJournal {
    /// Opens a journal over an empty (possibly freshly created) directory.
    ///
    /// Directories holding segments from an earlier run are consumed with
    /// [`crate::JournalReader`], never reopened for appending; any
    /// pre-existing segment file fails construction.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let base = prepare_dir(path.as_ref())?;
        if let Some((first, last)) = scan_segments(&base)? {
            return Err(Error::Config(format!(
                "journal directory {} already holds segments {first}..={last}",
                base.display()
            )));
        }
        Ok(Self {
            base,
            state: Mutex::new(JournalState {
                segment_empty: true,
                files: VecDeque::new(),
                checkpoints: BTreeMap::new(),
                next_file: 0,
                next_checkpoint: 0,
            }),
        })
    }

    /// Appends one opaque record. Resolves when the record's batch reaches
    /// the file.
    pub async fn append(&self, record: &[u8]) -> Result<()> {
        if record.len() + FRAME_HEADER_LEN > MAX_RECORD_SIZE {
            return Err(Error::RecordTooLarge(record.len()));
        }
        self.append_internal(KIND_DATA, record).await
    }

    async fn append_internal(&self, kind: u8, record: &[u8]) -> Result<()> {
        let mut refused_tail: Option<u64> = None;
        let rotation = loop {
            // The lock is held only to pick the tail or to rotate, never
            // across the append or its await.
            let (tail_id, segment) = {
                let mut state = self
                    .state
                    .lock()
                    .map_err(|_| Error::Corrupt("journal lock poisoned"))?;
                if kind == KIND_DATA {
                    state.segment_empty = false;
                }
                if refused_tail.is_some() && state.files.back().map(AppendFile::id) == refused_tail
                {
                    // The file that refused us is still the tail: schedule
                    // its close and rotate under this same lock hold.
                    let close = state.files.back_mut().expect("tail present").close();
                    break self.rotate(&mut state, Some(close));
                }
                match state.files.back() {
                    Some(tail) => (tail.id(), tail.segment()),
                    None => break self.rotate(&mut state, None),
                }
            };
            if let Some(segment) = segment {
                if let Some(batch) = segment.append(kind, record)? {
                    return batch.wait().await;
                }
            }
            // Full (or no longer active). If another producer rotates
            // first, the next pass retries against the new tail instead.
            refused_tail = Some(tail_id);
        };
        let rotation = rotation?;

        log::debug!("rotated journal to segment {}", rotation.id);
        // A fresh segment always has room for the link frame plus one
        // record: the file size covers two maximum records and change.
        let link_commit = rotation
            .segment
            .append(KIND_CHECK, rotation.link.as_bytes())?
            .expect("fresh segment takes the link record");
        let record_commit = rotation
            .segment
            .append(kind, record)?
            .expect("fresh segment takes its first record");
        if let Some(close) = rotation.to_close {
            let (close_flush, link_flush, record_flush) =
                tokio::join!(close, link_commit.wait(), record_commit.wait());
            if let Ok(closed) = close_flush {
                closed?;
            }
            link_flush?;
            record_flush?;
        } else {
            let (link_flush, record_flush) =
                tokio::join!(link_commit.wait(), record_commit.wait());
            link_flush?;
            record_flush?;
        }
        Ok(())
    }

    /// Appends a fresh file to the chain and captures everything the
    /// caller needs once the lock is gone.
    fn rotate(
        &self,
        state: &mut JournalState,
        to_close: Option<JoinHandle<Result<()>>>,
    ) -> Result<Rotation> {
        let id = state.next_file;
        let file = AppendFile::create(&self.base, id)?;
        state.next_file += 1;
        state.files.push_back(file);
        Ok(Rotation {
            id,
            to_close,
            link: state.link_record(),
            segment: state
                .files
                .back()
                .and_then(AppendFile::segment)
                .expect("fresh file is active"),
        })
    }

    /// Registers a retention checkpoint anchored at the current tail
    /// segment and records a link frame for it. Returns the advanced
    /// checkpoint id; calling again with no intervening append returns the
    /// same id without side effects.
    pub async fn register_checkpoint(&self) -> Result<u64> {
        let (link, current) = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| Error::Corrupt("journal lock poisoned"))?;
            if state.segment_empty {
                return Ok(state.current_checkpoint());
            }
            state.segment_empty = true;
            let id = state.next_checkpoint;
            state.next_checkpoint += 1;
            let anchor = state
                .files
                .back()
                .map(AppendFile::id)
                .expect("journal with appended records has a tail");
            state.checkpoints.insert(id, anchor);
            (state.link_record(), state.current_checkpoint())
        };
        self.append_internal(KIND_CHECK, link.as_bytes()).await?;
        Ok(current)
    }

    /// Reclaims every segment older than the oldest surviving checkpoint's
    /// anchor, consumes that checkpoint, and records the updated link
    /// frame. At least one checkpoint must have been registered.
    pub async fn check_checkpoint(&self) -> Result<()> {
        // Pop the reclaimable stubs under the lock; the file deletions run
        // with the lock released.
        let (oldest, mut reclaim) = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| Error::Corrupt("journal lock poisoned"))?;
            let Some((&oldest, &keep_from)) = state.checkpoints.iter().next() else {
                return Err(Error::InvalidState(
                    "check_checkpoint without a registered checkpoint",
                ));
            };
            let mut reclaim = Vec::new();
            // Only the tail is ever active, so everything we pop here is a
            // drained stub.
            while state.files.front().is_some_and(|file| file.id() < keep_from) {
                reclaim.push(state.files.pop_front().expect("front checked above"));
            }
            (oldest, reclaim)
        };
        for file in &mut reclaim {
            file.remove(&self.base)?;
            log::debug!("reclaimed journal segment {}", file.id());
        }
        let link = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| Error::Corrupt("journal lock poisoned"))?;
            state.checkpoints.remove(&oldest);
            state.link_record()
        };
        self.append_internal(KIND_CHECK, link.as_bytes()).await
    }

    /// Closes every segment in the chain in parallel and waits for the
    /// drains to finish. No on-disk cleanup happens here.
    pub async fn close(&self) -> Result<()> {
        let closing: Vec<_> = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| Error::Corrupt("journal lock poisoned"))?;
            state.files.iter_mut().map(AppendFile::close).collect()
        };
        for closed in join_all(closing).await {
            if let Ok(drained) = closed {
                drained?;
            }
        }
        Ok(())
    }
}
