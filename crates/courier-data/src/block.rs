//! Mutable byte buffers with a two-part payload layout, recycled through a
//! bounded pool.

use std::sync::{Arc, Mutex};

use courier_errors::{Error, Result};

/// Default capacity for pooled blocks.
pub const DEFAULT_BLOCK_CAPACITY: usize = 64 * 1024;

/// A mutable byte buffer carrying a two-part payload.
///
/// The logical content is `size` bytes; the secondary `offset1` cursor
/// splits it into payload data `[0, offset1)` followed by header bytes
/// `[offset1, size)`. Ownership is exclusive; blocks normally come from and
/// return to a [`BlockPool`].
#[derive(Debug, Clone, PartialEq)]
pub struct DataBlock {
    buf: Vec<u8>,
    size: usize,
    offset1: usize,
}

impl DataBlock {
    pub fn new(capacity: usize) -> Self {
        DataBlock {
            buf: vec![0u8; capacity],
            size: 0,
            offset1: 0,
        }
    }

    /// A block holding `data` as its payload part, with no header bytes.
    pub fn from_payload(data: &[u8]) -> Self {
        let mut block = DataBlock::new(data.len().max(DEFAULT_BLOCK_CAPACITY));
        block.write(data);
        block.set_offset1(block.size());
        block
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn offset1(&self) -> usize {
        self.offset1
    }

    /// Set the logical size. Shrinking below `offset1` pulls the cursor
    /// back as well.
    pub fn set_size(&mut self, size: usize) {
        assert!(size <= self.capacity(), "size must not exceed capacity");
        self.size = size;
        if self.offset1 > size {
            self.offset1 = size;
        }
    }

    pub fn set_offset1(&mut self, offset1: usize) {
        assert!(offset1 <= self.size, "offset1 must not exceed size");
        self.offset1 = offset1;
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.size]
    }

    /// The payload part: `[0, offset1)`.
    pub fn payload(&self) -> &[u8] {
        &self.buf[..self.offset1]
    }

    /// The header part: `[offset1, size)`.
    pub fn header_bytes(&self) -> &[u8] {
        &self.buf[self.offset1..self.size]
    }

    /// Append bytes at the current size, growing the buffer when needed.
    pub fn write(&mut self, data: &[u8]) {
        let end = self.size + data.len();
        if end > self.buf.len() {
            self.buf.resize(end, 0);
        }
        self.buf[self.size..end].copy_from_slice(data);
        self.size = end;
    }

    /// Replace the whole content with `payload` + `header`, setting
    /// `offset1` to the payload length.
    pub fn set_parts(&mut self, payload: &[u8], header: &[u8]) {
        self.size = 0;
        self.offset1 = 0;
        self.write(payload);
        self.offset1 = self.size;
        self.write(header);
    }

    /// Replace only the header part, preserving the payload and `offset1`.
    pub fn rewrite_header(&mut self, header: &[u8]) {
        self.size = self.offset1;
        self.write(header);
    }

    pub fn reset(&mut self) {
        self.size = 0;
        self.offset1 = 0;
    }

    /// Wipe the buffer content and reset the cursors.
    pub fn zero(&mut self) {
        self.buf.fill(0);
        self.reset();
    }

    /// Fail unless the header part is non-empty.
    pub fn require_header(&self) -> Result<&[u8]> {
        let header = self.header_bytes();
        if header.is_empty() {
            return Err(Error::argument("data block carries no header bytes"));
        }
        Ok(header)
    }
}

// ── Shared block handle ───────────────────────────────────────────────────────

/// Shared mutable handle to a [`DataBlock`].
///
/// Backend tasks may rewrite the block they were handed; the submitting side
/// observes the rewrite through its own clone of the handle. Locking is
/// short-lived and never held across suspension points.
#[derive(Debug, Clone)]
pub struct SharedBlock {
    inner: Arc<Mutex<DataBlock>>,
}

impl SharedBlock {
    pub fn new(block: DataBlock) -> Self {
        SharedBlock {
            inner: Arc::new(Mutex::new(block)),
        }
    }

    pub fn from_payload(data: &[u8]) -> Self {
        SharedBlock::new(DataBlock::from_payload(data))
    }

    pub fn lock(&self) -> std::sync::MutexGuard<'_, DataBlock> {
        self.inner.lock().unwrap()
    }

    /// Snapshot of the current content.
    pub fn to_block(&self) -> DataBlock {
        self.lock().clone()
    }
}

// ── Block pool ────────────────────────────────────────────────────────────────

struct PoolInner {
    block_capacity: usize,
    max_pooled: usize,
    free: Mutex<Vec<DataBlock>>,
}

/// Bounded multi-producer / multi-consumer pool of [`DataBlock`]s,
/// parameterized by block capacity.
///
/// `acquire` recycles a pooled block or allocates a fresh one; `release` is
/// the normal release path and recycles up to the pool bound.
#[derive(Clone)]
pub struct BlockPool {
    inner: Arc<PoolInner>,
}

impl BlockPool {
    pub fn new(block_capacity: usize) -> Self {
        Self::with_bound(block_capacity, 256)
    }

    pub fn with_bound(block_capacity: usize, max_pooled: usize) -> Self {
        BlockPool {
            inner: Arc::new(PoolInner {
                block_capacity,
                max_pooled,
                free: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn block_capacity(&self) -> usize {
        self.inner.block_capacity
    }

    pub fn acquire(&self) -> DataBlock {
        if let Some(mut block) = self.inner.free.lock().unwrap().pop() {
            block.reset();
            return block;
        }
        DataBlock::new(self.inner.block_capacity)
    }

    pub fn release(&self, block: DataBlock) {
        // Oversized blocks (grown past the pool capacity) are dropped.
        if block.capacity() > self.inner.block_capacity {
            return;
        }
        let mut free = self.inner.free.lock().unwrap();
        if free.len() < self.inner.max_pooled {
            free.push(block);
        }
    }

    pub fn pooled_count(&self) -> usize {
        self.inner.free.lock().unwrap().len()
    }
}

impl Default for BlockPool {
    fn default() -> Self {
        BlockPool::new(DEFAULT_BLOCK_CAPACITY)
    }
}
