//! The chunk send/receive pipeline: a fixed pool of persistent
//! block-transfer connections pumping chunk work items to a peer cluster.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use courier_data::{DataBlock, DataChunkStorage};
use courier_errors::{Error, Result};
use courier_tasks::ControlToken;
use courier_wire::BlockTransferClient;
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::endpoints::{
    connect_with_retries, is_reconnectable_error, EndpointSelector, ReconnectIterator,
};

/// Default number of pooled connections.
pub const DEFAULT_CONNECTIONS: usize = 16;

/// One unit of transfer work.
pub enum ChunkCommand {
    Send {
        session_id: Uuid,
        chunk_id: Uuid,
        data: DataBlock,
    },
    Receive {
        chunk_id: Uuid,
        reply: oneshot::Sender<Result<DataBlock>>,
    },
    Remove {
        chunk_id: Uuid,
    },
}

pub struct ChunkPipelineConfig {
    pub connections: usize,
    pub peer_id: Uuid,
    pub selector: EndpointSelector,
    pub authentication_block: Option<DataBlock>,
    /// Sending pipelines with peer-session tracking cannot safely replay
    /// in-flight chunks on a new connection; failures surface instead.
    pub track_peer_sessions: bool,
    /// Local store to re-fetch chunk payloads from after a reconnect, so a
    /// potentially stale in-memory copy is never sent.
    pub local_source: Option<Arc<dyn DataChunkStorage>>,
}

impl ChunkPipelineConfig {
    pub fn new(peer_id: Uuid, selector: EndpointSelector) -> Self {
        ChunkPipelineConfig {
            connections: DEFAULT_CONNECTIONS,
            peer_id,
            selector,
            authentication_block: None,
            track_peer_sessions: false,
            local_source: None,
        }
    }
}

/// Transfer accounting, logged on shutdown.
#[derive(Debug, Default)]
pub struct PipelineTotals {
    total_blocks: AtomicU64,
    total_data_size: AtomicU64,
}

impl PipelineTotals {
    fn add(&self, bytes: u64) {
        self.total_blocks.fetch_add(1, Ordering::Relaxed);
        self.total_data_size.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn total_blocks(&self) -> u64 {
        self.total_blocks.load(Ordering::Relaxed)
    }

    pub fn total_data_size(&self) -> u64 {
        self.total_data_size.load(Ordering::Relaxed)
    }
}

struct WorkerShared {
    peer_id: Uuid,
    authentication_block: Option<DataBlock>,
    track_peer_sessions: bool,
    local_source: Option<Arc<dyn DataChunkStorage>>,
    reconnect_iterator: Mutex<ReconnectIterator>,
    totals: Arc<PipelineTotals>,
    token: ControlToken,
}

/// The connection pool plus its feeding queue.
pub struct ChunkPipeline {
    work_tx: mpsc::Sender<ChunkCommand>,
    workers: Vec<JoinHandle<Result<()>>>,
    totals: Arc<PipelineTotals>,
}

impl ChunkPipeline {
    pub fn start(config: ChunkPipelineConfig, token: ControlToken) -> Self {
        let connections = config.connections.max(1);
        let (work_tx, work_rx) = mpsc::channel::<ChunkCommand>(connections * 2);
        let work_rx = Arc::new(Mutex::new(work_rx));
        let totals = Arc::new(PipelineTotals::default());

        let shared = Arc::new(WorkerShared {
            peer_id: config.peer_id,
            authentication_block: config.authentication_block,
            track_peer_sessions: config.track_peer_sessions,
            local_source: config.local_source,
            reconnect_iterator: Mutex::new(config.selector.create_iterator()),
            totals: Arc::clone(&totals),
            token,
        });

        let workers = (0..connections)
            .map(|worker_id| {
                let shared = Arc::clone(&shared);
                let work_rx = Arc::clone(&work_rx);
                tokio::spawn(worker_loop(worker_id, shared, work_rx))
            })
            .collect();

        ChunkPipeline {
            work_tx,
            workers,
            totals,
        }
    }

    /// Queue a work item; applies backpressure when every connection is
    /// busy.
    pub async fn submit(&self, command: ChunkCommand) -> Result<()> {
        self.work_tx
            .send(command)
            .await
            .map_err(|_| Error::disposed("chunk pipeline"))
    }

    pub fn totals(&self) -> &PipelineTotals {
        &self.totals
    }

    /// Drain the queue, stop the workers and log the accounting.
    /// The first worker failure, if any, is returned.
    pub async fn shutdown(self) -> Result<()> {
        drop(self.work_tx);

        let mut first_error = None;
        for worker in self.workers {
            match worker.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) if first_error.is_none() && !err.is_cancellation() => {
                    first_error = Some(err)
                }
                Ok(Err(_)) => {}
                Err(join) => {
                    warn!(error = %join, "pipeline worker aborted");
                }
            }
        }

        info!(
            total_blocks = self.totals.total_blocks(),
            total_data_size = self.totals.total_data_size(),
            "chunk pipeline finished"
        );

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

async fn connect(shared: &WorkerShared, cause: Option<Error>) -> Result<BlockTransferClient<TcpStream>> {
    let (stream, endpoint_id) = {
        let mut iterator = shared.reconnect_iterator.lock().await;
        connect_with_retries(&mut iterator, &shared.token, cause).await?
    };
    // Reconnects re-run the authentication handshake before any re-send.
    BlockTransferClient::connect(
        stream,
        shared.peer_id,
        endpoint_id,
        shared.authentication_block.clone(),
    )
    .await
}

/// Re-fetch a send payload from local state; a stale in-memory copy must
/// not be replayed onto a fresh connection.
fn refresh_payload(shared: &WorkerShared, command: &mut ChunkCommand) -> Result<()> {
    let (Some(source), ChunkCommand::Send { session_id, chunk_id, data }) =
        (&shared.local_source, command)
    else {
        return Ok(());
    };
    debug!(chunk = %chunk_id, "re-fetching chunk payload before re-send");
    source.load(*session_id, *chunk_id, data)
}

async fn execute(
    client: &mut BlockTransferClient<TcpStream>,
    command: &mut ChunkCommand,
) -> Result<u64> {
    match &mut *command {
        ChunkCommand::Send { chunk_id, data, .. } => {
            let bytes = data.size() as u64;
            client.send_chunk(*chunk_id, data).await?;
            Ok(bytes)
        }
        ChunkCommand::Receive { chunk_id, .. } => {
            let chunk_id = *chunk_id;
            let block = client.receive_chunk(chunk_id).await?;
            let bytes = block.size() as u64;
            // Hand the block to the waiter; the reply channel is one-shot,
            // so the command slot drains into a plain marker.
            let drained = std::mem::replace(command, ChunkCommand::Remove { chunk_id });
            if let ChunkCommand::Receive { reply, .. } = drained {
                let _ = reply.send(Ok(block));
            }
            Ok(bytes)
        }
        ChunkCommand::Remove { chunk_id } => {
            client.remove_chunk(*chunk_id).await?;
            Ok(0)
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    shared: Arc<WorkerShared>,
    work_rx: Arc<Mutex<mpsc::Receiver<ChunkCommand>>>,
) -> Result<()> {
    let mut client: Option<BlockTransferClient<TcpStream>> = None;

    loop {
        // Ready workers pop the next item; holding the receiver lock only
        // while popping keeps the pool work-stealing.
        let command = { work_rx.lock().await.recv().await };
        let Some(mut command) = command else {
            break;
        };

        // The failed item is retained across reconnects until delivered.
        loop {
            if shared.token.is_canceled() {
                fail_command(command, Error::canceled());
                return Err(Error::canceled());
            }

            if client.is_none() {
                match connect(&shared, None).await {
                    Ok(connected) => client = Some(connected),
                    Err(err) => {
                        fail_command(command, err.clone());
                        return Err(err);
                    }
                }
            }

            match execute(client.as_mut().expect("connected above"), &mut command).await {
                Ok(bytes) => {
                    shared.totals.add(bytes);
                    break;
                }
                Err(err) if is_reconnectable_error(&err) => {
                    if shared.track_peer_sessions {
                        // Peer-session state on the server makes a replayed
                        // send ambiguous; surface instead of reconnecting.
                        fail_command(command, err.clone());
                        return Err(err);
                    }
                    debug!(worker = worker_id, error = %err, "transfer connection lost");
                    client = None;
                    if let Err(refresh_err) = refresh_payload(&shared, &mut command) {
                        fail_command(command, refresh_err.clone());
                        return Err(refresh_err);
                    }
                    match connect(&shared, Some(err)).await {
                        Ok(connected) => client = Some(connected),
                        Err(reconnect_err) => {
                            fail_command(command, reconnect_err.clone());
                            return Err(reconnect_err);
                        }
                    }
                }
                Err(err) => {
                    // Server-side failure: the item fails, the connection
                    // and the worker live on.
                    fail_command(command, err);
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Deliver a failure to the item's waiter, when it has one.
fn fail_command(command: ChunkCommand, err: Error) {
    if let ChunkCommand::Receive { reply, chunk_id } = command {
        debug!(chunk = %chunk_id, "failing receive waiter");
        let _ = reply.send(Err(err));
    }
}
