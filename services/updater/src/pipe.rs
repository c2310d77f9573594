//! Stage plumbing: the channel item sum type and batch emission.

use tokio::sync::mpsc;

use crate::error::UpdateError;

/// What flows between pipeline stages.
#[derive(Debug, Clone, PartialEq)]
pub enum Pipe<T> {
    Batch(Vec<T>),
    /// The next batch is shorter than the batch size (the fetch stage pads
    /// its `IN (…)` list with the reserved id 0).
    ShortNext,
    Eof,
}

/// One `(id, crc)` hash-cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashPair {
    pub id: i64,
    pub crc: u32,
}

/// Accumulates items and ships them in exact batch-size chunks.
///
/// [`BatchEmitter::finish`] flags a trailing short batch with
/// [`Pipe::ShortNext`] and always terminates the stream with [`Pipe::Eof`].
pub struct BatchEmitter<T> {
    tx: mpsc::Sender<Pipe<T>>,
    batch_size: usize,
    pending: Vec<T>,
}

impl<T> BatchEmitter<T> {
    pub fn new(tx: mpsc::Sender<Pipe<T>>, batch_size: usize) -> BatchEmitter<T> {
        BatchEmitter {
            tx,
            batch_size,
            pending: Vec::with_capacity(batch_size),
        }
    }

    pub async fn push(&mut self, item: T) -> Result<(), UpdateError> {
        self.pending.push(item);
        if self.pending.len() == self.batch_size {
            let batch = std::mem::replace(&mut self.pending, Vec::with_capacity(self.batch_size));
            self.tx
                .send(Pipe::Batch(batch))
                .await
                .map_err(|_| UpdateError::PipeClosed)?;
        }
        Ok(())
    }

    pub async fn finish(self) -> Result<(), UpdateError> {
        if !self.pending.is_empty() {
            self.tx
                .send(Pipe::ShortNext)
                .await
                .map_err(|_| UpdateError::PipeClosed)?;
            self.tx
                .send(Pipe::Batch(self.pending))
                .await
                .map_err(|_| UpdateError::PipeClosed)?;
        }
        self.tx
            .send(Pipe::Eof)
            .await
            .map_err(|_| UpdateError::PipeClosed)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_batches_ship_without_markers() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut emitter = BatchEmitter::new(tx, 2);
        for n in 0..4 {
            emitter.push(n).await.unwrap();
        }
        emitter.finish().await.unwrap();

        assert_eq!(rx.recv().await, Some(Pipe::Batch(vec![0, 1])));
        assert_eq!(rx.recv().await, Some(Pipe::Batch(vec![2, 3])));
        assert_eq!(rx.recv().await, Some(Pipe::Eof));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn trailing_short_batch_is_flagged() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut emitter = BatchEmitter::new(tx, 3);
        for n in 0..5 {
            emitter.push(n).await.unwrap();
        }
        emitter.finish().await.unwrap();

        assert_eq!(rx.recv().await, Some(Pipe::Batch(vec![0, 1, 2])));
        assert_eq!(rx.recv().await, Some(Pipe::ShortNext));
        assert_eq!(rx.recv().await, Some(Pipe::Batch(vec![3, 4])));
        assert_eq!(rx.recv().await, Some(Pipe::Eof));
    }

    #[tokio::test]
    async fn empty_stream_is_just_eof() {
        let (tx, mut rx) = mpsc::channel(2);
        let emitter: BatchEmitter<i64> = BatchEmitter::new(tx, 3);
        emitter.finish().await.unwrap();
        assert_eq!(rx.recv().await, Some(Pipe::Eof));
        assert_eq!(rx.recv().await, None);
    }
}
