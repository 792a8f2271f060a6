//! Chunk storage plumbing: the async wrapper over synchronous stores, the
//! proxy store that fulfills reads through upstream block-transfer
//! endpoints, and the connection pipeline that pumps chunks to a peer
//! cluster.

mod async_storage;
mod endpoints;
mod pipeline;
mod proxy;

pub use async_storage::{AsyncChunkStorage, AsyncChunkStorageOptions, BlockCallback};
pub use endpoints::{Endpoint, EndpointSelector, ReconnectIterator, RetryPolicy};
pub use pipeline::{ChunkCommand, ChunkPipeline, ChunkPipelineConfig, PipelineTotals};
pub use proxy::{ProxyChunkStore, ProxyChunkStoreConfig};
