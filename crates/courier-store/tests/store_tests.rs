//! Full-stack storage tests: the async wrapper, the proxy store with its
//! write-through cache, and the transfer pipeline against a live chunk
//! server.

use std::{collections::HashSet, sync::Arc, time::Duration};

use courier_broker::{serve_connection, InProcessBlockDispatcher, ServeOptions};
use courier_data::{
    BlockPool, DataBlock, DataChunkStorage, FsChunkStorage, MemoryChunkStorage, SharedBlock,
};
use courier_errors::ErrorKind;
use courier_store::{
    AsyncChunkStorage, AsyncChunkStorageOptions, ChunkCommand, ChunkPipeline, ChunkPipelineConfig,
    Endpoint, EndpointSelector, ProxyChunkStore, ProxyChunkStoreConfig, RetryPolicy,
};
use courier_tasks::{ControlToken, ExecutionQueue, QueueMode};
use tokio::{net::TcpListener, sync::oneshot};
use uuid::{uuid, Uuid};

const CHUNK_44: Uuid = uuid!("44444444-4444-4444-4444-444444444444");

struct ChunkServer {
    addr: std::net::SocketAddr,
    storage: Arc<MemoryChunkStorage>,
    token: ControlToken,
    queue: ExecutionQueue,
}

async fn start_chunk_server() -> ChunkServer {
    let storage: Arc<MemoryChunkStorage> = Arc::new(MemoryChunkStorage::new());
    let storage_dyn: Arc<dyn DataChunkStorage> = storage.clone();
    let token = ControlToken::new();
    let queue = ExecutionQueue::new(QueueMode::KeepNone);

    let backend = Arc::new(AsyncChunkStorage::new(
        Arc::clone(&storage_dyn),
        storage_dyn,
        BlockPool::default(),
        token.clone(),
        AsyncChunkStorageOptions::default(),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let accept_token = token.clone();
    let accept_queue = queue.clone();
    tokio::spawn(async move {
        loop {
            let (stream, _) = tokio::select! {
                _ = accept_token.canceled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(_) => break,
                },
            };
            let backend = backend.clone();
            let queue = accept_queue.clone();
            let token = accept_token.clone();
            tokio::spawn(serve_connection(
                stream,
                backend,
                Arc::new(InProcessBlockDispatcher::new(8)),
                queue,
                BlockPool::default(),
                token,
                ServeOptions::default(),
            ));
        }
    });

    ChunkServer {
        addr,
        storage,
        token,
        queue,
    }
}

impl ChunkServer {
    fn selector(&self) -> EndpointSelector {
        EndpointSelector::new(
            vec![Endpoint::new(self.addr.ip().to_string(), self.addr.port())],
            RetryPolicy {
                retries_per_endpoint: 2,
                retry_delay: Duration::from_millis(10),
            },
        )
        .unwrap()
    }

    async fn shutdown(self) {
        self.token.request_cancel();
        self.queue.dispose().await;
    }
}

fn seed_chunk(storage: &MemoryChunkStorage, chunk_id: Uuid, content: &[u8]) {
    storage
        .save(Uuid::nil(), chunk_id, &DataBlock::from_payload(content))
        .unwrap();
}

// ── Async wrapper ─────────────────────────────────────────────────────────────

mod async_storage {
    use super::*;
    use courier_broker::{BackendCommandId, BackendProcessing, OperationId};

    fn wrapper(storage: Arc<MemoryChunkStorage>) -> AsyncChunkStorage {
        let storage: Arc<dyn DataChunkStorage> = storage;
        AsyncChunkStorage::new(
            Arc::clone(&storage),
            storage,
            BlockPool::default(),
            ControlToken::new(),
            AsyncChunkStorageOptions::default(),
        )
    }

    async fn run(
        wrapper: &AsyncChunkStorage,
        queue: &ExecutionQueue,
        operation_id: OperationId,
        command_id: BackendCommandId,
        chunk_id: Uuid,
        data: Option<SharedBlock>,
    ) -> courier_errors::Result<()> {
        let task = wrapper.create_backend_processing_task(
            operation_id,
            command_id,
            Uuid::nil(),
            chunk_id,
            Uuid::nil(),
            Uuid::nil(),
            data,
        )?;
        let handle = queue.push_back(task)?;
        queue.wait_for_success(&handle).await
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn put_get_remove_through_the_task_model() {
        let storage = Arc::new(MemoryChunkStorage::new());
        let wrapper = wrapper(storage.clone());
        let queue = ExecutionQueue::new(QueueMode::KeepNone);
        let chunk_id = Uuid::new_v4();

        let put_block = SharedBlock::from_payload(b"stored-bytes");
        run(&wrapper, &queue, OperationId::Put, BackendCommandId::None, chunk_id, Some(put_block))
            .await
            .unwrap();
        assert!(storage.contains(chunk_id));

        let get_block = SharedBlock::new(DataBlock::new(64));
        run(&wrapper, &queue, OperationId::Get, BackendCommandId::None, chunk_id, Some(get_block.clone()))
            .await
            .unwrap();
        assert_eq!(get_block.lock().payload(), b"stored-bytes");

        run(&wrapper, &queue, OperationId::Command, BackendCommandId::Remove, chunk_id, None)
            .await
            .unwrap();
        assert!(!storage.contains(chunk_id));

        queue.dispose().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn chunk_id_rules_are_validated() {
        let storage = Arc::new(MemoryChunkStorage::new());
        let wrapper = wrapper(storage);

        // Get requires a chunk id.
        let err = wrapper
            .create_backend_processing_task(
                OperationId::Get,
                BackendCommandId::None,
                Uuid::nil(),
                Uuid::nil(),
                Uuid::nil(),
                Uuid::nil(),
                Some(SharedBlock::new(DataBlock::new(16))),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Argument);

        // FlushPeerSessions must not carry one.
        let err = wrapper
            .create_backend_processing_task(
                OperationId::Command,
                BackendCommandId::FlushPeerSessions,
                Uuid::nil(),
                Uuid::new_v4(),
                Uuid::nil(),
                Uuid::nil(),
                None,
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Argument);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn canceled_token_rejects_new_operations() {
        let storage = Arc::new(MemoryChunkStorage::new());
        let token = ControlToken::new();
        let storage_dyn: Arc<dyn DataChunkStorage> = storage;
        let wrapper = AsyncChunkStorage::with_storage(storage_dyn, token.clone());
        let queue = ExecutionQueue::new(QueueMode::KeepNone);

        token.request_cancel();
        let err = run(
            &wrapper,
            &queue,
            OperationId::Put,
            BackendCommandId::None,
            Uuid::new_v4(),
            Some(SharedBlock::from_payload(b"x")),
        )
        .await
        .unwrap_err();
        assert!(err.is_cancellation());

        queue.dispose().await;
    }
}

// ── Proxy store ───────────────────────────────────────────────────────────────

async fn proxy_call<F, T>(proxy: Arc<ProxyChunkStore>, call: F) -> T
where
    F: FnOnce(&ProxyChunkStore) -> T + Send + 'static,
    T: Send + 'static,
{
    // The sync storage contract parks its calling thread; run it where
    // blocking is allowed.
    tokio::task::spawn_blocking(move || call(&proxy)).await.unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn proxy_cache_warm_and_survives_upstream_removal() {
    let server = start_chunk_server().await;
    seed_chunk(&server.storage, CHUNK_44, b"cached-content");

    let cache_dir = tempfile::tempdir().unwrap();
    let local = Arc::new(FsChunkStorage::new(cache_dir.path()).unwrap());
    let proxy = Arc::new(ProxyChunkStore::new(ProxyChunkStoreConfig {
        selector: server.selector(),
        local_storage: Some(local.clone() as Arc<dyn DataChunkStorage>),
        initial_cache_index: HashSet::new(),
        peer_id: Uuid::new_v4(),
        authentication_block: None,
        control_token: ControlToken::new(),
    }));

    // First load: fetched upstream and promoted into the cache.
    let first = proxy_call(proxy.clone(), |p| {
        let mut block = DataBlock::new(64);
        p.load(Uuid::nil(), CHUNK_44, &mut block).map(|_| block)
    })
    .await
    .unwrap();
    assert_eq!(first.payload(), b"cached-content");
    assert!(local.scan_chunk_ids().unwrap().contains(&CHUNK_44));

    // Second load: served locally.
    let second = proxy_call(proxy.clone(), |p| {
        let mut block = DataBlock::new(64);
        p.load(Uuid::nil(), CHUNK_44, &mut block).map(|_| block)
    })
    .await
    .unwrap();
    assert_eq!(second.payload(), b"cached-content");

    // Remove upstream; the third load still returns the cached content.
    server.storage.remove(Uuid::nil(), CHUNK_44).unwrap();
    let third = proxy_call(proxy.clone(), |p| {
        let mut block = DataBlock::new(64);
        p.load(Uuid::nil(), CHUNK_44, &mut block).map(|_| block)
    })
    .await
    .unwrap();
    assert_eq!(third.payload(), b"cached-content");

    proxy.dispose();
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn proxy_save_and_remove_pass_through_without_caching() {
    let server = start_chunk_server().await;

    let cache_dir = tempfile::tempdir().unwrap();
    let local = Arc::new(FsChunkStorage::new(cache_dir.path()).unwrap());
    let proxy = Arc::new(ProxyChunkStore::new(ProxyChunkStoreConfig {
        selector: server.selector(),
        local_storage: Some(local.clone() as Arc<dyn DataChunkStorage>),
        initial_cache_index: HashSet::new(),
        peer_id: Uuid::new_v4(),
        authentication_block: None,
        control_token: ControlToken::new(),
    }));

    let chunk_id = Uuid::new_v4();
    proxy_call(proxy.clone(), move |p| {
        p.save(Uuid::nil(), chunk_id, &DataBlock::from_payload(b"up"))
    })
    .await
    .unwrap();

    // The write went upstream and did not touch the local cache.
    assert!(server.storage.contains(chunk_id));
    assert!(local.scan_chunk_ids().unwrap().is_empty());

    proxy_call(proxy.clone(), move |p| p.remove(Uuid::nil(), chunk_id))
        .await
        .unwrap();
    assert!(!server.storage.contains(chunk_id));

    proxy.dispose();
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn proxy_server_errors_are_not_retried() {
    let server = start_chunk_server().await;

    let proxy = Arc::new(ProxyChunkStore::new(ProxyChunkStoreConfig {
        selector: server.selector(),
        local_storage: None,
        initial_cache_index: HashSet::new(),
        peer_id: Uuid::new_v4(),
        authentication_block: None,
        control_token: ControlToken::new(),
    }));

    let missing = Uuid::new_v4();
    let err = proxy_call(proxy.clone(), move |p| {
        let mut block = DataBlock::new(16);
        p.load(Uuid::nil(), missing, &mut block)
    })
    .await
    .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ServerError);
    assert_eq!(err.cause().unwrap().kind(), ErrorKind::NotFound);

    proxy.dispose();
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn proxy_reconnect_exhaustion_raises_server_no_connection() {
    // Nothing listens here.
    let selector = EndpointSelector::new(
        vec![Endpoint::new("127.0.0.1", 1), Endpoint::new("127.0.0.1", 2)],
        RetryPolicy {
            retries_per_endpoint: 1,
            retry_delay: Duration::from_millis(1),
        },
    )
    .unwrap();

    let proxy = Arc::new(ProxyChunkStore::new(ProxyChunkStoreConfig {
        selector,
        local_storage: None,
        initial_cache_index: HashSet::new(),
        peer_id: Uuid::new_v4(),
        authentication_block: None,
        control_token: ControlToken::new(),
    }));

    let err = proxy_call(proxy.clone(), |p| {
        let mut block = DataBlock::new(16);
        p.load(Uuid::nil(), Uuid::new_v4(), &mut block)
    })
    .await
    .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ServerNoConnection);
    assert!(err.cause().is_some(), "the last transport error must be nested");
}

#[tokio::test(flavor = "multi_thread")]
async fn proxy_warm_start_reuses_a_scanned_cache_index() {
    let server = start_chunk_server().await;

    let cache_dir = tempfile::tempdir().unwrap();
    let local = Arc::new(FsChunkStorage::new(cache_dir.path()).unwrap());

    // Pre-existing cache content from a previous run.
    let chunk_id = Uuid::new_v4();
    local
        .save(Uuid::nil(), chunk_id, &DataBlock::from_payload(b"from-disk"))
        .unwrap();

    let proxy = Arc::new(ProxyChunkStore::new(ProxyChunkStoreConfig {
        selector: server.selector(),
        local_storage: Some(local.clone() as Arc<dyn DataChunkStorage>),
        initial_cache_index: local.scan_chunk_ids().unwrap(),
        peer_id: Uuid::new_v4(),
        authentication_block: None,
        control_token: ControlToken::new(),
    }));

    // Served from the cache; the chunk never existed upstream.
    let block = proxy_call(proxy.clone(), move |p| {
        let mut block = DataBlock::new(64);
        p.load(Uuid::nil(), chunk_id, &mut block).map(|_| block)
    })
    .await
    .unwrap();
    assert_eq!(block.payload(), b"from-disk");

    proxy.dispose();
    server.shutdown().await;
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn pipeline_sends_and_receives_chunks() {
    let server = start_chunk_server().await;

    let pipeline = ChunkPipeline::start(
        ChunkPipelineConfig {
            connections: 4,
            ..ChunkPipelineConfig::new(Uuid::new_v4(), server.selector())
        },
        ControlToken::new(),
    );

    let mut chunk_ids = Vec::new();
    for i in 0..8u8 {
        let chunk_id = Uuid::new_v4();
        chunk_ids.push(chunk_id);
        pipeline
            .submit(ChunkCommand::Send {
                session_id: Uuid::nil(),
                chunk_id,
                data: DataBlock::from_payload(&[i; 32]),
            })
            .await
            .unwrap();
    }

    // The workers run in parallel; wait until every send has landed before
    // reading anything back.
    while server.storage.chunk_count() < 8 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let (reply_tx, reply_rx) = oneshot::channel();
    pipeline
        .submit(ChunkCommand::Receive {
            chunk_id: chunk_ids[0],
            reply: reply_tx,
        })
        .await
        .unwrap();
    let received = reply_rx.await.unwrap().unwrap();
    assert_eq!(received.payload(), &[0u8; 32]);

    let totals_blocks = {
        pipeline.totals().total_blocks()
    };
    assert!(totals_blocks >= 1);

    pipeline.shutdown().await.unwrap();

    for chunk_id in chunk_ids {
        assert!(server.storage.contains(chunk_id));
    }

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn pipeline_receive_of_missing_chunk_fails_the_waiter_only() {
    let server = start_chunk_server().await;

    let pipeline = ChunkPipeline::start(
        ChunkPipelineConfig {
            connections: 1,
            ..ChunkPipelineConfig::new(Uuid::new_v4(), server.selector())
        },
        ControlToken::new(),
    );

    let (reply_tx, reply_rx) = oneshot::channel();
    pipeline
        .submit(ChunkCommand::Receive {
            chunk_id: Uuid::new_v4(),
            reply: reply_tx,
        })
        .await
        .unwrap();
    let err = reply_rx.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ServerError);

    // The worker survives a server-side failure.
    let chunk_id = Uuid::new_v4();
    pipeline
        .submit(ChunkCommand::Send {
            session_id: Uuid::nil(),
            chunk_id,
            data: DataBlock::from_payload(b"after-error"),
        })
        .await
        .unwrap();

    pipeline.shutdown().await.unwrap();
    assert!(server.storage.contains(chunk_id));

    server.shutdown().await;
}
