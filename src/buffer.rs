use tokio::sync::mpsc;

/// A reusable relay chunk.
///
/// Buffers are moved by value between the read loop that fills them and the
/// write loop that drains them, so a buffer is never reachable from two
/// tasks at once.
#[derive(Debug)]
pub struct Buffer {
    data: Box<[u8]>,
    len: usize,
    generation: u64,
}

impl Buffer {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity].into_boxed_slice(),
            len: 0,
            generation: 0,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The whole backing array, for a read to fill.
    pub fn space(&mut self) -> &mut [u8] {
        self.len = 0;
        &mut self.data
    }

    /// Marks the first `len` bytes valid and records which writer
    /// generation of the destination may receive them.
    pub fn fill(&mut self, len: usize, generation: u64) {
        assert!(len <= self.data.len(), "chunk overruns buffer");
        self.len = len;
        self.generation = generation;
    }

    #[must_use]
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }
}

/// Creates a pool of `size` idle buffers. The sender is handed to whoever
/// recycles buffers; the receiver to the read loop that fills them.
#[must_use]
pub fn pool(size: usize, capacity: usize) -> (mpsc::Sender<Buffer>, mpsc::Receiver<Buffer>) {
    let (tx, rx) = mpsc::channel(size);
    for _ in 0..size {
        // Capacity equals size, so seeding never blocks.
        let _ = tx.try_send(Buffer::new(capacity));
    }
    (tx, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_exposes_only_valid_bytes() {
        let mut buffer = Buffer::new(8);
        buffer.space()[..3].copy_from_slice(b"abc");
        buffer.fill(3, 7);
        assert_eq!(buffer.filled(), b"abc");
        assert_eq!(buffer.generation(), 7);
        assert_eq!(buffer.capacity(), 8);
    }

    #[test]
    fn space_resets_length() {
        let mut buffer = Buffer::new(4);
        buffer.fill(4, 1);
        let _ = buffer.space();
        assert!(buffer.filled().is_empty());
    }

    #[test]
    #[should_panic(expected = "chunk overruns buffer")]
    fn fill_past_capacity_panics() {
        Buffer::new(2).fill(3, 0);
    }

    #[tokio::test]
    async fn pool_is_seeded_and_bounded() {
        let (tx, mut rx) = pool(2, 16);
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.capacity(), 16);
        assert!(rx.try_recv().is_err());

        tx.send(first).await.unwrap();
        tx.send(second).await.unwrap();
        assert!(tx.try_send(Buffer::new(16)).is_err());
    }
}
