//! Single-segment append engine.
//!
//! Many producers share one 4 MiB staging buffer. A reservation is a CAS on
//! `allocation_offset`; the payload copy runs unsynchronized inside the
//! reserved window; a short sequenced spin publishes `commit_offset` in
//! reservation order so the committed prefix stays contiguous. A lone batch
//! writer task drains newly committed prefixes to the file in single
//! positioned writes and resolves one shared completion future per batch.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::block::{self, LazyFile};
use crate::buffer::{self, PooledBuffer};
use crate::error::{Error, Result};
use crate::frame::{encode_header, FRAME_HEADER_LEN, MAX_FILE_SIZE};
use crate::wait::SpinWait;

type BatchSignal = Option<std::result::Result<(), Arc<io::Error>>>;

/// Completion of one flush batch, shared by every producer whose record is
/// part of it. Resolved exactly once by the batch writer.
#[derive(Clone)]
pub(crate) struct BatchFuture {
    rx: watch::Receiver<BatchSignal>,
}

impl BatchFuture {
    pub(crate) async fn wait(mut self) -> Result<()> {
        let resolved = self
            .rx
            .wait_for(|signal| signal.is_some())
            .await
            .map_err(|_| Error::WriterLost)?;
        match resolved.as_ref().expect("resolved batch carries a result") {
            Ok(()) => Ok(()),
            Err(err) => Err(Error::Flush(Arc::clone(err))),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum WriterStage {
    /// No writer task exists.
    None,
    /// A writer task is flushing a taken batch.
    Live,
    /// A writer task exists and another flush is armed behind it.
    Pending,
}

struct BatchState {
    stage: WriterStage,
    /// Highest committed end offset made visible to the writer. Updated
    /// under this lock, after the producer's sequenced publish, so a taken
    /// batch never covers a torn prefix.
    batch_offset: usize,
    /// Bytes durably handed to the file; never advanced by a failed write.
    file_offset: usize,
    promise: Option<watch::Sender<BatchSignal>>,
    future: Option<BatchFuture>,
    last_writer: Option<JoinHandle<()>>,
}

pub(crate) struct ActiveSegment {
    file: LazyFile,
    staging: Arc<PooledBuffer>,
    allocation_offset: AtomicUsize,
    commit_offset: AtomicUsize,
    batch: Mutex<BatchState>,
}

impl std::fmt::Debug for ActiveSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveSegment").finish_non_exhaustive()
    }
}

impl ActiveSegment {
    pub(crate) fn create(path: PathBuf) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            file: LazyFile::new(path),
            staging: Arc::new(buffer::acquire()?),
            allocation_offset: AtomicUsize::new(0),
            commit_offset: AtomicUsize::new(0),
            batch: Mutex::new(BatchState {
                stage: WriterStage::None,
                batch_offset: 0,
                file_offset: 0,
                promise: None,
                future: None,
                last_writer: None,
            }),
        }))
    }

    /// Reserves a slot, copies the frame, and joins the pending flush
    /// batch. Returns `Ok(None)` when the frame no longer fits; the caller
    /// rotates to a fresh segment.
    pub(crate) fn append(self: &Arc<Self>, kind: u8, record: &[u8]) -> Result<Option<BatchFuture>> {
        let need = FRAME_HEADER_LEN + record.len();
        let mut start = self.allocation_offset.load(Ordering::Acquire);
        loop {
            let end = start + need;
            if end > MAX_FILE_SIZE {
                return Ok(None);
            }
            match self.allocation_offset.compare_exchange_weak(
                start,
                end,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => start = observed,
            }
        }
        let end = start + need;

        // Reservations are disjoint, so the copies need no synchronization.
        unsafe {
            self.staging.write(start, &encode_header(kind, record.len()));
            self.staging.write(start + FRAME_HEADER_LEN, record);
        }

        // Publish in reservation order. The wait is bounded by the copy of
        // the record reserved just below ours.
        let mut wait = SpinWait::new();
        while self.commit_offset.load(Ordering::Acquire) != start {
            wait.spin();
        }
        self.commit_offset.store(end, Ordering::Release);

        let mut batch = self
            .batch
            .lock()
            .map_err(|_| Error::Corrupt("segment batch lock poisoned"))?;
        // Producers can reach this point out of reservation order; the
        // batch offset only ever moves forward.
        if batch.batch_offset < end {
            batch.batch_offset = end;
        }
        match batch.stage {
            WriterStage::None => {
                self.spawn_writer(&mut batch);
                arm(&mut batch);
            }
            WriterStage::Live => arm(&mut batch),
            WriterStage::Pending => {}
        }
        Ok(Some(batch.future.clone().expect("armed batch carries a future")))
    }

    fn spawn_writer(self: &Arc<Self>, batch: &mut BatchState) {
        let chained = batch.last_writer.take();
        batch.last_writer = Some(tokio::spawn(batch_writer(Arc::clone(self), chained)));
    }

    /// Drains the writer chain. The file handle closes and the staging
    /// buffer returns to the pool when the last reference drops at the end
    /// of this call.
    pub(crate) async fn close(self: Arc<Self>) -> Result<()> {
        let last = self
            .batch
            .lock()
            .map_err(|_| Error::Corrupt("segment batch lock poisoned"))?
            .last_writer
            .take();
        if let Some(writer) = last {
            let _ = writer.await;
        }
        Ok(())
    }
}

/// Installs a fresh shared future and marks the batch armed.
fn arm(batch: &mut BatchState) {
    let (tx, rx) = watch::channel(None);
    batch.promise = Some(tx);
    batch.future = Some(BatchFuture { rx });
    batch.stage = WriterStage::Pending;
}

/// The coalescing writer loop: one task at a time per segment, re-armed by
/// producers through the stage machine, chained to its predecessor so task
/// accumulation stays bounded.
async fn batch_writer(segment: Arc<ActiveSegment>, chained: Option<JoinHandle<()>>) {
    loop {
        let opened = segment.file.open().await;
        let (promise, start, end) = {
            let mut batch = match segment.batch.lock() {
                Ok(batch) => batch,
                Err(_) => {
                    // Producers fail their own acquisitions from here on,
                    // so no further batch can arm behind this writer.
                    log::error!("segment batch lock poisoned, writer exiting");
                    break;
                }
            };
            batch.stage = WriterStage::Live;
            batch.future = None;
            let promise = batch.promise.take().expect("live writer owns a promise");
            (promise, batch.file_offset, batch.batch_offset)
        };
        let outcome = match opened {
            Ok(file) => {
                block::write_all_at(file, Arc::clone(&segment.staging), start, end).await
            }
            Err(err) => Err(err),
        };
        let outcome = outcome.map_err(Arc::new);
        let exit = match segment.batch.lock() {
            Ok(mut batch) => {
                if outcome.is_ok() {
                    batch.file_offset = end;
                }
                if batch.stage == WriterStage::Pending {
                    false
                } else {
                    batch.stage = WriterStage::None;
                    true
                }
            }
            Err(_) => {
                log::error!("segment batch lock poisoned, writer exiting");
                true
            }
        };
        if let Err(err) = &outcome {
            // file_offset stays put; the next armed batch retries this
            // prefix.
            log::warn!("segment batch flush of [{start}, {end}) failed: {err}");
        }
        let _ = promise.send(Some(outcome));
        if exit {
            break;
        }
    }
    if let Some(chained) = chained {
        let _ = chained.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{KIND_CHECK, KIND_DATA, MAX_RECORD_SIZE};
    use tempfile::tempdir;

    #[tokio::test(flavor = "multi_thread")]
    async fn appends_reach_the_file_in_order() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("0.journal");
        let segment = ActiveSegment::create(path.clone()).expect("segment");

        let first = segment
            .append(KIND_DATA, b"alpha")
            .expect("append")
            .expect("first fits");
        let second = segment
            .append(KIND_CHECK, b"beta")
            .expect("append")
            .expect("second fits");
        first.wait().await.expect("first flushed");
        second.wait().await.expect("second flushed");

        let bytes = std::fs::read(&path).expect("segment file");
        let mut expected = Vec::new();
        expected.extend_from_slice(&encode_header(KIND_DATA, 5));
        expected.extend_from_slice(b"alpha");
        expected.extend_from_slice(&encode_header(KIND_CHECK, 4));
        expected.extend_from_slice(b"beta");
        assert_eq!(bytes, expected);

        Arc::clone(&segment).close().await.expect("close");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn refuses_appends_past_capacity() {
        let dir = tempdir().expect("tempdir");
        let segment = ActiveSegment::create(dir.path().join("0.journal")).expect("segment");

        let payload = vec![0u8; MAX_RECORD_SIZE - FRAME_HEADER_LEN];
        let mut batches = Vec::new();
        for _ in 0..(MAX_FILE_SIZE / MAX_RECORD_SIZE) {
            batches.push(segment.append(KIND_DATA, &payload).expect("append").expect("fits"));
        }
        // The buffer is tiled exactly; nothing more fits, not even an
        // empty record's header.
        assert!(segment.append(KIND_DATA, &payload).expect("append").is_none());
        assert!(segment.append(KIND_DATA, b"").expect("append").is_none());

        for batch in batches {
            batch.wait().await.expect("flushed");
        }
        Arc::clone(&segment).close().await.expect("close");

        let len = std::fs::metadata(dir.path().join("0.journal"))
            .expect("metadata")
            .len();
        assert_eq!(len as usize, MAX_FILE_SIZE);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn one_batch_covers_many_producers() {
        let dir = tempdir().expect("tempdir");
        let segment = ActiveSegment::create(dir.path().join("0.journal")).expect("segment");

        let mut waits = Vec::new();
        for i in 0..64u8 {
            waits.push(segment.append(KIND_DATA, &[i; 32]).expect("append").expect("fits"));
        }
        for wait in waits {
            wait.wait().await.expect("flushed");
        }
        Arc::clone(&segment).close().await.expect("close");

        let bytes = std::fs::read(dir.path().join("0.journal")).expect("segment file");
        assert_eq!(bytes.len(), 64 * (FRAME_HEADER_LEN + 32));
        for i in 0..64usize {
            let frame = &bytes[i * 36..(i + 1) * 36];
            assert_eq!(frame[..4], encode_header(KIND_DATA, 32));
            assert!(frame[4..].iter().all(|&byte| byte == i as u8));
        }
    }
}
