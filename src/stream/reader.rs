use std::time::SystemTime;

use bytes::{Buf, Bytes, BytesMut};
use tokio::sync::mpsc;

use super::{Chunk, ReadError};

/// Initial buffer capacity for a fresh reader.
const INITIAL_CAPACITY: usize = 4 * 1024;

/// Buffers grown past this are replaced on reset rather than pooled.
const RETAIN_CAPACITY: usize = 64 * 1024;

/// Async cursor over one direction of a TCP connection.
///
/// Bytes arrive through a bounded channel from the paired [`StreamWriter`].
/// Once a gap is observed every later read fails with
/// [`ReadError::DataLost`] until the reader is reset.
pub struct StreamReader {
    buf: BytesMut,
    seen: SystemTime,
    lost: bool,
    bytes_lost: u64,
    ended: bool,
    rx: Option<mpsc::Receiver<Chunk>>,
    max_line_length: usize,
}

impl StreamReader {
    /// Creates an unattached reader. Reads return end of stream until
    /// [`attach`](Self::attach) is called.
    pub fn new(max_line_length: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_CAPACITY),
            seen: SystemTime::UNIX_EPOCH,
            lost: false,
            bytes_lost: 0,
            ended: true,
            rx: None,
            max_line_length,
        }
    }

    /// A reader that is permanently at end of stream. Stands in for readers
    /// that have been handed back to the pool.
    pub fn closed() -> Self {
        Self {
            buf: BytesMut::new(),
            seen: SystemTime::UNIX_EPOCH,
            lost: false,
            bytes_lost: 0,
            ended: true,
            rx: None,
            max_line_length: 0,
        }
    }

    /// Connects a fresh chunk channel of `capacity` data slots and returns
    /// the producer half. Any previous state is discarded.
    pub fn attach(&mut self, capacity: usize) -> StreamWriter {
        self.reset();
        // One extra slot is held back for the end or loss marker.
        let (tx, rx) = mpsc::channel(capacity.max(1) + 1);
        self.rx = Some(rx);
        self.ended = false;
        StreamWriter { tx: Some(tx) }
    }

    /// Clears buffered bytes, loss state and timestamp for reuse.
    pub fn reset(&mut self) {
        if self.buf.capacity() > RETAIN_CAPACITY {
            self.buf = BytesMut::with_capacity(INITIAL_CAPACITY);
        } else {
            self.buf.clear();
        }
        self.seen = SystemTime::UNIX_EPOCH;
        self.lost = false;
        self.bytes_lost = 0;
        self.ended = true;
        self.rx = None;
    }

    /// Capture timestamp of the most recently observed byte.
    pub fn seen(&self) -> SystemTime {
        self.seen
    }

    /// Whether a gap has been observed.
    pub fn is_lost(&self) -> bool {
        self.lost
    }

    /// Total bytes reported missing by reassembly.
    pub fn bytes_lost(&self) -> u64 {
        self.bytes_lost
    }

    /// Number of bytes buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Reads one `\n`-terminated line, stripping `\r\n` or `\n`.
    ///
    /// At end of stream a trailing unterminated fragment is returned as a
    /// final line; the following call fails with [`ReadError::EndOfStream`].
    pub async fn read_line(&mut self) -> Result<Bytes, ReadError> {
        self.check_lost()?;

        let mut scanned = 0;
        loop {
            if let Some(pos) = self.buf[scanned..].iter().position(|&b| b == b'\n') {
                let end = scanned + pos;
                let mut line = self.buf.split_to(end + 1);
                line.truncate(end);
                if line.last() == Some(&b'\r') {
                    line.truncate(end - 1);
                }
                return Ok(line.freeze());
            }

            scanned = self.buf.len();
            if scanned > self.max_line_length {
                return Err(ReadError::LineTooLong {
                    limit: self.max_line_length,
                });
            }

            match self.fill().await {
                Ok(()) => {}
                Err(ReadError::EndOfStream) if !self.buf.is_empty() => {
                    return Ok(self.buf.split().freeze());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Reads exactly `n` bytes.
    pub async fn read_n(&mut self, n: usize) -> Result<Bytes, ReadError> {
        match self.fill_to(n).await {
            Ok(()) => Ok(self.buf.split_to(n).freeze()),
            Err(e @ ReadError::UnexpectedEndOfStream { .. }) => {
                self.buf.clear();
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Returns the next `n` bytes without consuming them.
    pub async fn peek_n(&mut self, n: usize) -> Result<Bytes, ReadError> {
        self.fill_to(n).await?;
        Ok(Bytes::copy_from_slice(&self.buf[..n]))
    }

    /// Skips `n` bytes without retaining more than one chunk at a time.
    pub async fn discard(&mut self, n: usize) -> Result<usize, ReadError> {
        self.check_lost()?;

        let mut remaining = n;
        loop {
            let take = remaining.min(self.buf.len());
            self.buf.advance(take);
            remaining -= take;
            if remaining == 0 {
                return Ok(n);
            }

            match self.fill().await {
                Ok(()) => {}
                Err(ReadError::EndOfStream) => {
                    return Err(ReadError::ShortDiscard {
                        discarded: n - remaining,
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn check_lost(&self) -> Result<(), ReadError> {
        if self.lost {
            Err(ReadError::DataLost)
        } else {
            Ok(())
        }
    }

    fn mark_lost(&mut self, bytes_lost: u64) {
        self.lost = true;
        self.bytes_lost = self.bytes_lost.saturating_add(bytes_lost);
        self.rx = None;
    }

    async fn fill_to(&mut self, n: usize) -> Result<(), ReadError> {
        self.check_lost()?;

        while self.buf.len() < n {
            match self.fill().await {
                Ok(()) => {}
                Err(ReadError::EndOfStream) => {
                    return Err(ReadError::UnexpectedEndOfStream {
                        partial: Bytes::copy_from_slice(&self.buf),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Waits for the next chunk and appends it to the buffer.
    async fn fill(&mut self) -> Result<(), ReadError> {
        self.check_lost()?;
        if self.ended {
            return Err(ReadError::EndOfStream);
        }
        let Some(rx) = self.rx.as_mut() else {
            self.ended = true;
            return Err(ReadError::EndOfStream);
        };

        match rx.recv().await {
            Some(Chunk::Data { bytes, seen }) => {
                self.buf.extend_from_slice(&bytes);
                self.seen = seen;
                Ok(())
            }
            Some(Chunk::Lost { bytes_lost }) => {
                self.mark_lost(bytes_lost);
                Err(ReadError::DataLost)
            }
            Some(Chunk::End) => {
                self.ended = true;
                self.rx = None;
                Err(ReadError::EndOfStream)
            }
            // Writer went away without an end marker.
            None => {
                self.mark_lost(0);
                Err(ReadError::DataLost)
            }
        }
    }
}

/// Non-blocking producer half of a [`StreamReader`].
///
/// Any failure to enqueue tears the direction down; the reader then observes
/// [`ReadError::DataLost`].
#[derive(Debug)]
pub struct StreamWriter {
    tx: Option<mpsc::Sender<Chunk>>,
}

impl StreamWriter {
    /// Whether the writer can still deliver data.
    pub fn is_open(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Delivers reassembled bytes. `skipped > 0` signals a gap before
    /// `bytes`, which ends the direction. Returns false once the direction
    /// is torn down.
    pub fn reassembled(&mut self, bytes: Bytes, seen: SystemTime, skipped: u64) -> bool {
        let Some(tx) = self.tx.as_ref() else {
            return false;
        };

        if skipped > 0 {
            let _ = tx.try_send(Chunk::Lost {
                bytes_lost: skipped,
            });
            self.tx = None;
            return false;
        }

        if bytes.is_empty() {
            return true;
        }

        if tx.capacity() <= 1 || tx.try_send(Chunk::Data { bytes, seen }).is_err() {
            self.tx = None;
            return false;
        }

        true
    }

    /// Signals an orderly end of the direction.
    pub fn complete(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.try_send(Chunk::End);
        }
    }
}
