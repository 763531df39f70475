//! Per-direction byte streams fed by upstream TCP reassembly.
//!
//! A [`StreamWriter`] is the non-blocking producer half held by the
//! demultiplexer; a [`StreamReader`] is the async consumer half driven by a
//! single conversation task. The two are connected by a bounded chunk
//! channel.

pub mod pool;
mod reader;

use std::time::SystemTime;

use bytes::Bytes;
use thiserror::Error;

pub use pool::{ReaderPool, ReaderRelease};
pub use reader::{StreamReader, StreamWriter};

/// Unit of data delivered from a writer to its reader.
#[derive(Debug)]
pub enum Chunk {
    /// Contiguous bytes captured at `seen`.
    Data { bytes: Bytes, seen: SystemTime },
    /// A gap of `bytes_lost` bytes that reassembly could not recover.
    Lost { bytes_lost: u64 },
    /// Orderly end of the direction.
    End,
}

/// Errors returned by [`StreamReader`] operations.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("end of stream")]
    EndOfStream,

    #[error("unexpected end of stream after {} bytes", partial.len())]
    UnexpectedEndOfStream { partial: Bytes },

    #[error("data lost from stream")]
    DataLost,

    #[error("line exceeds {limit} bytes")]
    LineTooLong { limit: usize },

    #[error("stream ended after discarding {discarded} bytes")]
    ShortDiscard { discarded: usize },
}

impl ReadError {
    /// True for the orderly end of a stream, which is not worth logging.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream)
    }
}
