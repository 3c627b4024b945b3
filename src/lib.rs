//! Append-only journal over fixed-capacity rotating segment files.
//!
//! Producers append opaque byte records concurrently. Records are staged in
//! a shared 4 MiB segment buffer through a lock-free slot allocator,
//! coalesced into large sequential file writes by a per-segment batch
//! writer task, and the journal rotates to a fresh segment once a file
//! fills. Checkpoints mark retention boundaries: segments older than the
//! oldest surviving checkpoint can be reclaimed. [`JournalReader`] rebuilds
//! the record sequence from a directory on startup.
//!
//! ```no_run
//! # async fn demo() -> annal::Result<()> {
//! let journal = annal::AppendJournal::open("./wal")?;
//! journal.append(b"first record").await?;
//! let checkpoint = journal.register_checkpoint().await?;
//! journal.append(b"second record").await?;
//! journal.close().await?;
//!
//! let mut reader = annal::JournalReader::open("./wal")?;
//! while let Some(_record) = reader.next_record().await? {
//!     // kind 1 frames are the journal's own checkpoint links
//! }
//! # let _ = checkpoint;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod frame;
pub mod journal;
pub mod reader;
pub mod segment;

mod active;
mod append_file;
mod block;
mod buffer;
mod wait;

pub use error::{Error, Result};
pub use journal::AppendJournal;
pub use reader::{JournalReader, JournalRecord};
