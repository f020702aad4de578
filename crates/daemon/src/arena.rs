use bytes::BytesMut;

/// Per-connection scratch memory for reply data. Bump accounting against a
/// fixed capacity; `reset` rewinds to zero, individual allocations are
/// never freed. Safe because every allocation's lifetime is bounded by the
/// reply send that precedes the next reset.
pub struct MemoryChunk {
    capacity: usize,
    used: usize,
}

impl MemoryChunk {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, used: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// A zeroed buffer of `len` bytes, or `None` when the chunk is
    /// exhausted and the caller must flush and reset.
    pub fn get(&mut self, len: usize) -> Option<BytesMut> {
        if len > self.capacity - self.used {
            return None;
        }

        self.used += len;
        Some(BytesMut::zeroed(len))
    }

    pub fn reset(&mut self) {
        self.used = 0;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exhaustion_and_reset() {
        let mut chunk = MemoryChunk::new(100);

        assert!(chunk.get(60).is_some());
        assert!(chunk.get(40).is_some());
        assert!(chunk.get(1).is_none());

        chunk.reset();
        assert!(chunk.get(100).is_some());

        // Larger than the whole chunk never fits.
        chunk.reset();
        assert!(chunk.get(101).is_none());
    }
}
