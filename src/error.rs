use std::io;
use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// Batch flush failure, shared by every producer whose record was part
    /// of the failing batch.
    #[error("segment flush failed: {0}")]
    Flush(Arc<io::Error>),
    #[error("invalid journal layout: {0}")]
    Config(String),
    #[error("record of {0} bytes exceeds the maximum record size")]
    RecordTooLarge(usize),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("corrupt journal: {0}")]
    Corrupt(&'static str),
    #[error("segment writer exited before resolving its batch")]
    WriterLost,
}

pub type Result<T> = std::result::Result<T, Error>;
