//! Audio chunks handed from a source to its consumers.

use bytes::{Bytes, BytesMut};

/// An immutable, cheaply clonable run of interleaved samples.
///
/// Cloning shares the underlying buffer; consumers that keep a chunk past
/// `push` hold a reference, not a copy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemChunk {
    data: Bytes,
}

impl MemChunk {
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }
}

impl AsRef<[u8]> for MemChunk {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl From<Bytes> for MemChunk {
    fn from(data: Bytes) -> Self {
        Self { data }
    }
}

impl From<Vec<u8>> for MemChunk {
    fn from(data: Vec<u8>) -> Self {
        Self {
            data: Bytes::from(data),
        }
    }
}

/// Reusable writable buffer for producing processed copies of chunks.
///
/// Once every consumer has dropped the previous output, `reserve` reclaims
/// the same allocation, so a steady stream of equal-sized chunks does not
/// allocate.
#[derive(Debug, Default)]
pub struct ChunkScratch {
    buf: BytesMut,
}

impl ChunkScratch {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Copy `src`, let `process` rewrite the copy in place, and freeze it.
    pub fn process<F>(&mut self, src: &MemChunk, process: F) -> MemChunk
    where
        F: FnOnce(&mut [u8]),
    {
        self.buf.clear();
        self.buf.reserve(src.len());
        self.buf.extend_from_slice(src.as_ref());
        process(&mut self.buf[..]);
        MemChunk::new(self.buf.split().freeze())
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }
}
