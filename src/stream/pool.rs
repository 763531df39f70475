use tokio::sync::mpsc;

use super::StreamReader;

/// Recycles [`StreamReader`] buffers for one demultiplexer worker.
///
/// The pool is owned by a single worker. Conversations running on other
/// tasks hand readers back through a [`ReaderRelease`], which resets them
/// on the spot; they are reclaimed lazily on the next
/// [`acquire`](Self::acquire).
pub struct ReaderPool {
    idle: Vec<StreamReader>,
    release_tx: mpsc::UnboundedSender<StreamReader>,
    release_rx: mpsc::UnboundedReceiver<StreamReader>,
    max_idle: usize,
    max_line_length: usize,
}

impl ReaderPool {
    pub fn new(max_idle: usize, max_line_length: usize) -> Self {
        let (release_tx, release_rx) = mpsc::unbounded_channel();
        Self {
            idle: Vec::with_capacity(max_idle.min(1024)),
            release_tx,
            release_rx,
            max_idle,
            max_line_length,
        }
    }

    /// Takes an idle reader, or allocates one when the pool is empty.
    pub fn acquire(&mut self) -> StreamReader {
        self.reclaim();
        self.idle
            .pop()
            .unwrap_or_else(|| StreamReader::new(self.max_line_length))
    }

    /// Handle used by conversations to return readers.
    pub fn releaser(&self) -> ReaderRelease {
        ReaderRelease {
            tx: self.release_tx.clone(),
        }
    }

    /// Number of readers ready for reuse, including ones not yet reclaimed.
    pub fn idle_len(&mut self) -> usize {
        self.reclaim();
        self.idle.len()
    }

    fn reclaim(&mut self) {
        while let Ok(reader) = self.release_rx.try_recv() {
            if self.idle.len() >= self.max_idle {
                continue;
            }
            self.idle.push(reader);
        }
    }
}

/// Cloneable handle for returning readers to their [`ReaderPool`].
#[derive(Clone)]
pub struct ReaderRelease {
    tx: mpsc::UnboundedSender<StreamReader>,
}

impl ReaderRelease {
    /// Resets a reader and returns it to the pool. Dropped if the pool is
    /// gone. The reset closes the chunk channel, so the paired writer stops
    /// accepting data immediately.
    pub fn release(&self, mut reader: StreamReader) {
        reader.reset();
        let _ = self.tx.send(reader);
    }
}
