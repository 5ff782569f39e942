//! Scrollback buffer for session output.

use std::collections::VecDeque;

/// Default buffer budget: 200 000 bytes.
pub const DEFAULT_CAPACITY: usize = 200_000;

/// Chunked history of a session's output with a fixed byte budget.
///
/// Eviction works on whole chunks from the front, so after a large chunk
/// arrives the buffer can sit up to one chunk's length under its budget.
/// A single chunk larger than the budget evicts everything, itself included.
#[derive(Debug)]
pub struct ScrollbackBuffer {
    chunks: VecDeque<String>,
    len: usize,
    capacity: usize,
}

impl ScrollbackBuffer {
    /// Create buffer with specified byte budget
    pub fn new(capacity: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            len: 0,
            capacity,
        }
    }

    /// Append a chunk, then evict oldest chunks while over budget
    pub fn append(&mut self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        self.len += chunk.len();
        self.chunks.push_back(chunk.to_owned());

        while self.len > self.capacity {
            match self.chunks.pop_front() {
                Some(evicted) => self.len -= evicted.len(),
                None => break,
            }
        }
    }

    /// Concatenated contents for replay
    pub fn get_all(&self) -> String {
        let mut out = String::with_capacity(self.len);
        for chunk in &self.chunks {
            out.push_str(chunk);
        }
        out
    }

    /// Buffered size in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for ScrollbackBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
