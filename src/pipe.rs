//! In-memory piece pipe connecting the segment producer to one replicator.
//!
//! A bounded channel of byte buffers with an error sentinel. Writes block
//! until the consumer drains (back-pressure); closing the writer with an
//! error surfaces that error on the reader's next read; dropping the writer
//! cleanly yields EOF. Dropping the reader makes further writes fail, which
//! unblocks a producer whose consumer went away.

use thiserror::Error;
use tokio::sync::mpsc;

/// Error carried across the pipe when the producer aborts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("piece stream aborted: {reason}")]
pub struct PipeError {
    pub reason: String,
}

impl PipeError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Create a connected pipe pair. Capacity is one piece: the producer can
/// stage the next piece while the consumer streams the current one, and no
/// more.
pub fn piece_pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(1);
    (PipeWriter { tx }, PipeReader { rx })
}

pub struct PipeWriter {
    tx: mpsc::Sender<Result<Vec<u8>, PipeError>>,
}

impl PipeWriter {
    /// Write one piece. Blocks while the pipe is full. Fails if the reader
    /// was dropped.
    pub async fn write(&self, piece: Vec<u8>) -> Result<(), PipeError> {
        self.tx
            .send(Ok(piece))
            .await
            .map_err(|_| PipeError::new("reader closed"))
    }

    /// Close the pipe, delivering `error` to the reader before EOF.
    pub async fn close_with_error(self, error: PipeError) {
        // the reader may already be gone; nothing to propagate then
        let _ = self.tx.send(Err(error)).await;
    }

    /// Close the pipe cleanly; the reader observes EOF after draining.
    pub fn close(self) {}
}

pub struct PipeReader {
    rx: mpsc::Receiver<Result<Vec<u8>, PipeError>>,
}

impl PipeReader {
    /// Next piece, `Ok(None)` on clean EOF, `Err` if the producer aborted.
    pub async fn next_piece(&mut self) -> Result<Option<Vec<u8>>, PipeError> {
        match self.rx.recv().await {
            Some(Ok(piece)) => Ok(Some(piece)),
            Some(Err(error)) => Err(error),
            None => Ok(None),
        }
    }

    /// Drain the remaining pieces into one buffer (test convenience).
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, PipeError> {
        let mut buffer = Vec::new();
        while let Some(piece) = self.next_piece().await? {
            buffer.extend_from_slice(&piece);
        }
        Ok(buffer)
    }
}
