//! Lazy startup reader that re-materializes records from a journal
//! directory.

use std::path::{Path, PathBuf};

use crate::block;
use crate::buffer::{self, PooledBuffer};
use crate::error::{Error, Result};
use crate::frame::{decode_header, FRAME_HEADER_LEN, MAX_FILE_SIZE};
use crate::segment::{prepare_dir, scan_segments, segment_path};

/// One recovered frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRecord {
    /// [`crate::frame::KIND_DATA`] for user records,
    /// [`crate::frame::KIND_CHECK`] for checkpoint links. Consumers that
    /// only care about their own data can skip the links.
    pub kind: u8,
    pub payload: Vec<u8>,
}

/// Replays the frames of an existing journal directory in segment id order.
///
/// Each segment is read with a single positioned I/O into a pooled buffer
/// and then scanned frame by frame, so records surface lazily.
#[derive(Debug)]
pub struct JournalReader {
    base: PathBuf,
    next_id: u64,
    last_id: u64,
    exhausted: bool,
    current: Option<SegmentFrames>,
}

#[derive(Debug)]
struct SegmentFrames {
    staged: PooledBuffer,
    len: usize,
    pos: usize,
}

impl JournalReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let base = prepare_dir(path.as_ref())?;
        let (next_id, last_id, exhausted) = match scan_segments(&base)? {
            Some((first, last)) => (first, last, false),
            None => (0, 0, true),
        };
        Ok(Self {
            base,
            next_id,
            last_id,
            exhausted,
            current: None,
        })
    }

    /// Yields the next frame, or `None` once every segment is consumed.
    pub async fn next_record(&mut self) -> Result<Option<JournalRecord>> {
        loop {
            if let Some(frames) = self.current.as_mut() {
                if let Some(record) = frames.next_frame()? {
                    return Ok(Some(record));
                }
                self.current = None;
            }
            if self.exhausted {
                return Ok(None);
            }
            let id = self.next_id;
            if self.next_id == self.last_id {
                self.exhausted = true;
            } else {
                self.next_id += 1;
            }
            self.current = Some(self.load_segment(id).await?);
        }
    }

    async fn load_segment(&self, id: u64) -> Result<SegmentFrames> {
        let file = block::open_read(segment_path(&self.base, id)).await?;
        let (staged, len) = block::read_prefix(file, buffer::acquire()?, MAX_FILE_SIZE).await?;
        Ok(SegmentFrames {
            staged,
            len,
            pos: 0,
        })
    }
}

impl SegmentFrames {
    fn next_frame(&mut self) -> Result<Option<JournalRecord>> {
        if self.len - self.pos < FRAME_HEADER_LEN {
            // A truncated trailing header is the clean end of a segment.
            return Ok(None);
        }
        let data = self.staged.as_mut_slice();
        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&data[self.pos..self.pos + FRAME_HEADER_LEN]);
        let (kind, payload_len) = decode_header(header);
        let body = self.pos + FRAME_HEADER_LEN;
        if payload_len > self.len - body {
            return Err(Error::Corrupt("frame length exceeds segment contents"));
        }
        let payload = data[body..body + payload_len].to_vec();
        self.pos = body + payload_len;
        Ok(Some(JournalRecord { kind, payload }))
    }
}
