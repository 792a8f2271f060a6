//! The proxy chunk store: a `DataChunkStorage` facade that fulfills
//! operations by contacting upstream block-transfer endpoints, with an
//! optional local write-through read cache.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock,
    },
};

use courier_data::{DataBlock, DataChunkStorage};
use courier_errors::{Error, Result};
use courier_tasks::ControlToken;
use courier_wire::BlockTransferClient;
use tokio::net::TcpStream;
use tracing::{debug, info};
use uuid::Uuid;

use crate::endpoints::{
    connect_with_retries, is_reconnectable_error, EndpointSelector, ReconnectIterator,
};

pub struct ProxyChunkStoreConfig {
    pub selector: EndpointSelector,
    /// Local persistent store; `None` is proxy-only mode (no caching).
    pub local_storage: Option<Arc<dyn DataChunkStorage>>,
    /// Chunk ids already present in the local store, re-derived by scanning
    /// it (crash recovery).
    pub initial_cache_index: HashSet<Uuid>,
    pub peer_id: Uuid,
    pub authentication_block: Option<DataBlock>,
    pub control_token: ControlToken,
}

struct ProxyConnection {
    client: BlockTransferClient<TcpStream>,
}

/// Chunk storage over upstream endpoints selected round-robin.
///
/// Worker-owned connections live in a checkout pool, so at most one
/// connection exists per concurrently executing storage call. The
/// synchronous contract is served by parking the calling (blocking-pool)
/// thread on the runtime; the methods must not be invoked from an async
/// worker thread.
pub struct ProxyChunkStore {
    handle: tokio::runtime::Handle,
    connect_iterator: tokio::sync::Mutex<ReconnectIterator>,
    reconnect_iterator: tokio::sync::Mutex<ReconnectIterator>,
    local_storage: Option<Arc<dyn DataChunkStorage>>,
    control_token: ControlToken,
    peer_id: Uuid,
    authentication_block: Option<DataBlock>,
    connections: Mutex<Vec<ProxyConnection>>,
    cached_chunks: RwLock<HashSet<Uuid>>,
    /// Serializes cache writers without blocking cache readers.
    cache_write_lock: tokio::sync::Mutex<()>,
    disposed: AtomicBool,
}

enum UpstreamCommand<'a> {
    Receive {
        chunk_id: Uuid,
        out: &'a mut DataBlock,
    },
    Send {
        chunk_id: Uuid,
        data: &'a DataBlock,
    },
    Remove {
        chunk_id: Uuid,
    },
}

impl ProxyChunkStore {
    /// Captures the current tokio runtime; construct from async context.
    pub fn new(config: ProxyChunkStoreConfig) -> Self {
        ProxyChunkStore {
            handle: tokio::runtime::Handle::current(),
            connect_iterator: tokio::sync::Mutex::new(config.selector.create_iterator()),
            reconnect_iterator: tokio::sync::Mutex::new(config.selector.create_iterator()),
            local_storage: config.local_storage,
            control_token: config.control_token,
            peer_id: config.peer_id,
            authentication_block: config.authentication_block,
            connections: Mutex::new(Vec::new()),
            cached_chunks: RwLock::new(config.initial_cache_index),
            cache_write_lock: tokio::sync::Mutex::new(()),
            disposed: AtomicBool::new(false),
        }
    }

    /// Drop pooled connections; subsequent operations fail.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        let connections = {
            let mut pool = self.connections.lock().unwrap();
            std::mem::take(&mut *pool)
        };
        for _connection in connections {
            info!("proxy store disconnecting from upstream");
        }
    }

    fn check_usable(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::disposed("proxy chunk store"));
        }
        self.control_token.check()
    }

    async fn checkout_connection(&self) -> Result<ProxyConnection> {
        if let Some(connection) = self.connections.lock().unwrap().pop() {
            return Ok(connection);
        }

        // Initial connections rotate round-robin over all nodes; the retry
        // budget and back-off only matter when nodes are down.
        let (stream, endpoint_id) = {
            let mut iterator = self.connect_iterator.lock().await;
            connect_with_retries(&mut iterator, &self.control_token, None).await?
        };
        let client = BlockTransferClient::connect(
            stream,
            self.peer_id,
            endpoint_id.clone(),
            self.authentication_block.clone(),
        )
        .await?;
        info!(endpoint = %endpoint_id, "proxy store connected upstream");
        Ok(ProxyConnection { client })
    }

    async fn reconnect(&self, cause: Error) -> Result<ProxyConnection> {
        if !is_reconnectable_error(&cause) {
            // Server-side errors and cancellation are never retried.
            return Err(cause);
        }

        debug!(error = %cause, "lost upstream connection; attempting to reconnect");
        let (stream, endpoint_id) = {
            let mut iterator = self.reconnect_iterator.lock().await;
            connect_with_retries(&mut iterator, &self.control_token, Some(cause)).await?
        };
        let client = BlockTransferClient::connect(
            stream,
            self.peer_id,
            endpoint_id.clone(),
            self.authentication_block.clone(),
        )
        .await?;
        info!(endpoint = %endpoint_id, "proxy store re-connected upstream");
        Ok(ProxyConnection { client })
    }

    fn checkin_connection(&self, connection: ProxyConnection) {
        if !self.disposed.load(Ordering::Acquire) {
            self.connections.lock().unwrap().push(connection);
        }
    }

    /// Run one upstream command, reconnecting and retrying on transport
    /// failures.
    async fn execute_upstream(&self, command: &mut UpstreamCommand<'_>) -> Result<()> {
        let mut connection = self.checkout_connection().await?;
        loop {
            self.control_token.check()?;

            let result = match command {
                UpstreamCommand::Receive { chunk_id, out } => {
                    match connection.client.receive_chunk(*chunk_id).await {
                        Ok(block) => {
                            **out = block;
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }
                }
                UpstreamCommand::Send { chunk_id, data } => {
                    connection.client.send_chunk(*chunk_id, data).await
                }
                UpstreamCommand::Remove { chunk_id } => {
                    connection.client.remove_chunk(*chunk_id).await
                }
            };

            match result {
                Ok(()) => {
                    self.checkin_connection(connection);
                    return Ok(());
                }
                Err(e) if is_reconnectable_error(&e) => {
                    connection = self.reconnect(e).await?;
                }
                Err(e) => {
                    // The response arrived, so the connection itself is fine.
                    self.checkin_connection(connection);
                    return Err(e);
                }
            }
        }
    }

    fn is_cached(&self, chunk_id: Uuid) -> bool {
        self.cached_chunks.read().unwrap().contains(&chunk_id)
    }

    async fn load_upstream_and_cache(&self, chunk_id: Uuid, data: &mut DataBlock) -> Result<()> {
        self.execute_upstream(&mut UpstreamCommand::Receive {
            chunk_id,
            out: data,
        })
        .await?;

        let Some(storage) = &self.local_storage else {
            return Ok(());
        };
        if self.is_cached(chunk_id) {
            return Ok(());
        }

        // Writers are serialized on a dedicated mutex so readers on the
        // membership lock never wait behind a disk write. Re-check under
        // the writer lock: an earlier queued writer may have populated the
        // chunk already.
        let _writer = self.cache_write_lock.lock().await;
        if self.is_cached(chunk_id) {
            return Ok(());
        }

        // A failing persistent cache must stop the proxy rather than
        // silently degrade; the error propagates to the caller.
        storage.save(Uuid::nil(), chunk_id, data)?;
        self.cached_chunks.write().unwrap().insert(chunk_id);
        debug!(chunk = %chunk_id, "chunk promoted into the local cache");
        Ok(())
    }

    async fn load_async(&self, chunk_id: Uuid, data: &mut DataBlock) -> Result<()> {
        if let Some(storage) = &self.local_storage {
            if self.is_cached(chunk_id) {
                return storage.load(Uuid::nil(), chunk_id, data);
            }
        }
        self.load_upstream_and_cache(chunk_id, data).await
    }
}

impl DataChunkStorage for ProxyChunkStore {
    fn load(&self, _session_id: Uuid, chunk_id: Uuid, data: &mut DataBlock) -> Result<()> {
        debug_assert!(!chunk_id.is_nil());
        self.check_usable()?;
        self.handle.block_on(self.load_async(chunk_id, data))
    }

    fn save(&self, _session_id: Uuid, chunk_id: Uuid, data: &DataBlock) -> Result<()> {
        debug_assert!(!chunk_id.is_nil());
        self.check_usable()?;
        // Pass-through; the local cache is read-side only.
        self.handle
            .block_on(self.execute_upstream(&mut UpstreamCommand::Send { chunk_id, data }))
    }

    fn remove(&self, _session_id: Uuid, chunk_id: Uuid) -> Result<()> {
        debug_assert!(!chunk_id.is_nil());
        self.check_usable()?;
        self.handle
            .block_on(self.execute_upstream(&mut UpstreamCommand::Remove { chunk_id }))
    }

    fn flush_peer_sessions(&self, _peer_id: Uuid) -> Result<()> {
        // Upstream sessions are owned by the upstream peers.
        Ok(())
    }
}
