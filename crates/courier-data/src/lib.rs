//! Data blocks, the block pool and the synchronous chunk-storage contract.

mod block;
mod storage;

pub use block::{BlockPool, DataBlock, SharedBlock, DEFAULT_BLOCK_CAPACITY};
pub use storage::{DataChunkStorage, FsChunkStorage, MemoryChunkStorage};

/// The nil identifier, denoting absence of a peer / conversation / chunk id.
pub fn nil_uuid() -> uuid::Uuid {
    uuid::Uuid::nil()
}
