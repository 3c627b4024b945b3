//! Positioned block-file I/O on top of the tokio blocking pool.
//!
//! The append and recovery paths both talk to segment files through these
//! helpers: a lazily opened write handle per active segment, all-or-nothing
//! positioned writes of committed buffer prefixes, and a one-shot prefix
//! read for recovery. Positioned access keeps the handles free of cursor
//! state, so a retried batch rewrites the same file range.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::OnceCell;
use tokio::task;

use crate::buffer::PooledBuffer;

async fn run_blocking<T, F>(op: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    task::spawn_blocking(op)
        .await
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?
}

/// A segment file handle opened on first use by the batch writer. A failed
/// open leaves the cell empty, so the next batch retries it.
pub(crate) struct LazyFile {
    path: PathBuf,
    cell: OnceCell<Arc<File>>,
}

impl LazyFile {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self {
            path,
            cell: OnceCell::new(),
        }
    }

    pub(crate) async fn open(&self) -> io::Result<Arc<File>> {
        let file = self
            .cell
            .get_or_try_init(|| {
                let path = self.path.clone();
                run_blocking(move || {
                    OpenOptions::new()
                        .create(true)
                        .write(true)
                        .open(&path)
                        .map(Arc::new)
                })
            })
            .await?;
        Ok(Arc::clone(file))
    }
}

/// Writes `buffer[start..end)` at file position `start` in one operation.
pub(crate) async fn write_all_at(
    file: Arc<File>,
    buffer: Arc<PooledBuffer>,
    start: usize,
    end: usize,
) -> io::Result<()> {
    debug_assert!(start <= end && end <= buffer.len());
    if start == end {
        return Ok(());
    }
    run_blocking(move || {
        // The committed prefix is never mutated again once handed to the
        // writer, so borrowing it here is sound.
        let bytes = unsafe { buffer.slice(start, end - start) };
        file.write_all_at(bytes, start as u64)
    })
    .await
}

pub(crate) async fn open_read(path: PathBuf) -> io::Result<Arc<File>> {
    run_blocking(move || File::open(&path).map(Arc::new)).await
}

/// Reads up to `limit` bytes from offset 0 into the exclusively owned
/// buffer, returning it together with the number of bytes filled.
pub(crate) async fn read_prefix(
    file: Arc<File>,
    mut buffer: PooledBuffer,
    limit: usize,
) -> io::Result<(PooledBuffer, usize)> {
    debug_assert!(limit <= buffer.len());
    run_blocking(move || {
        let mut filled = 0usize;
        {
            let slice = buffer.as_mut_slice();
            while filled < limit {
                match file.read_at(&mut slice[filled..limit], filled as u64) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err),
                }
            }
        }
        Ok((buffer, filled))
    })
    .await
}
