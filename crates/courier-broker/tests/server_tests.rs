//! End-to-end wire tests: a real client endpoint against `serve_connection`
//! over an in-memory duplex stream.

use std::sync::Arc;

use courier_broker::{
    serve_connection, AsyncBlockDispatcher, BackendCommandId, BackendProcessing,
    InProcessBlockDispatcher, OperationId, ServeOptions,
};
use courier_data::{BlockPool, DataBlock, SharedBlock};
use courier_errors::{Error, ErrorKind, Result};
use courier_tasks::{ControlToken, ExecutionQueue, FnTask, QueueMode, Task};
use courier_wire::BlockTransferClient;
use tokio::io::DuplexStream;
use uuid::Uuid;

/// Minimal storage-style backend: Put/Get/Remove against an in-memory map,
/// AuthenticateClient accepts a fixed credential.
struct TestBackend {
    chunks: std::sync::Mutex<std::collections::HashMap<Uuid, Vec<u8>>>,
    accepted_credential: Vec<u8>,
}

impl TestBackend {
    fn new(accepted_credential: &[u8]) -> Self {
        TestBackend {
            chunks: std::sync::Mutex::new(std::collections::HashMap::new()),
            accepted_credential: accepted_credential.to_vec(),
        }
    }
}

impl BackendProcessing for TestBackend {
    fn create_backend_processing_task(
        &self,
        operation_id: OperationId,
        command_id: BackendCommandId,
        _session_id: Uuid,
        chunk_id: Uuid,
        _source_peer_id: Uuid,
        _target_peer_id: Uuid,
        data: Option<SharedBlock>,
    ) -> Result<Box<dyn Task>> {
        courier_broker::validate_backend_parameters(operation_id, command_id, _session_id, chunk_id)?;

        let chunks = &self.chunks;
        let task: Box<dyn Task> = match (operation_id, command_id) {
            (OperationId::Put, _) => {
                let data = data.expect("put carries a block");
                let content = data.lock().payload().to_vec();
                let mut guard = chunks.lock().unwrap();
                guard.insert(chunk_id, content);
                Box::new(FnTask::new("put", |_cx| async { Ok(()) }))
            }
            (OperationId::Get, _) => {
                let data = data.expect("get carries a pool block");
                let content = chunks.lock().unwrap().get(&chunk_id).cloned();
                Box::new(FnTask::new("get", move |_cx| async move {
                    let content = content
                        .ok_or_else(|| Error::not_found(format!("chunk '{chunk_id}' missing")))?;
                    let mut block = data.lock();
                    block.reset();
                    block.write(&content);
                    let size = block.size();
                    block.set_offset1(size);
                    Ok(())
                }))
            }
            (OperationId::Command, BackendCommandId::Remove) => {
                let removed = chunks.lock().unwrap().remove(&chunk_id).is_some();
                Box::new(FnTask::new("remove", move |_cx| async move {
                    if removed {
                        Ok(())
                    } else {
                        Err(Error::not_found(format!("chunk '{chunk_id}' missing")))
                    }
                }))
            }
            (OperationId::Command, BackendCommandId::FlushPeerSessions) => {
                Box::new(FnTask::new("flush", |_cx| async { Ok(()) }))
            }
            (OperationId::AuthenticateClient, _) => {
                let data = data.expect("authenticate carries the credential block");
                let accepted = self.accepted_credential.clone();
                Box::new(FnTask::new("authenticate", move |_cx| async move {
                    let ok = data.lock().payload() == accepted.as_slice();
                    if ok {
                        Ok(())
                    } else {
                        Err(Error::new(ErrorKind::Security, "credential rejected"))
                    }
                }))
            }
            _ => Box::new(FnTask::new("noop", |_cx| async { Ok(()) })),
        };
        Ok(task)
    }
}

struct Harness {
    server: tokio::task::JoinHandle<Result<()>>,
    client_stream: Option<DuplexStream>,
    queue: ExecutionQueue,
    token: ControlToken,
}

fn start_server(backend: Arc<dyn BackendProcessing>, options: ServeOptions) -> Harness {
    let (client_stream, server_stream) = tokio::io::duplex(256 * 1024);
    let dispatcher = Arc::new(InProcessBlockDispatcher::new(8));
    let queue = ExecutionQueue::new(QueueMode::KeepNone);
    let token = ControlToken::new();

    let server = tokio::spawn(serve_connection(
        server_stream,
        backend,
        dispatcher,
        queue.clone(),
        BlockPool::default(),
        token.clone(),
        options,
    ));

    Harness {
        server,
        client_stream: Some(client_stream),
        queue,
        token,
    }
}

impl Harness {
    async fn shutdown(mut self) {
        self.token.request_cancel();
        self.client_stream.take();
        let _ = self.server.await;
        self.queue.dispose().await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn send_receive_remove_round_trip() {
    let mut harness = start_server(
        Arc::new(TestBackend::new(b"")),
        ServeOptions::default(),
    );
    let stream = harness.client_stream.take().unwrap();
    let mut client = BlockTransferClient::connect(stream, Uuid::new_v4(), "test", None)
        .await
        .expect("connect");

    let chunk_id = Uuid::new_v4();
    client
        .send_chunk(chunk_id, &DataBlock::from_payload(b"chunk-content"))
        .await
        .expect("send");

    let received = client.receive_chunk(chunk_id).await.expect("receive");
    assert_eq!(received.payload(), b"chunk-content");

    client.remove_chunk(chunk_id).await.expect("remove");

    // The server answers a missing chunk with an error block, not a dead
    // connection.
    let err = client.receive_chunk(chunk_id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ServerError);
    assert_eq!(err.cause().unwrap().kind(), ErrorKind::NotFound);

    // The connection is still usable afterwards.
    client.flush_peer_sessions().await.expect("flush still works");

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn authentication_gate_rejects_unauthenticated_commands() {
    let mut harness = start_server(
        Arc::new(TestBackend::new(b"valid-credential")),
        ServeOptions {
            require_authentication: true,
            ..ServeOptions::default()
        },
    );
    let stream = harness.client_stream.take().unwrap();

    // No credential configured: the client skips the handshake and the
    // server must reject its first command.
    let mut client = BlockTransferClient::connect(stream, Uuid::new_v4(), "test", None)
        .await
        .expect("negotiation itself succeeds");

    let err = client
        .send_chunk(Uuid::new_v4(), &DataBlock::from_payload(b"x"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ServerError);
    assert_eq!(err.cause().unwrap().kind(), ErrorKind::Security);

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn authentication_handshake_unlocks_the_connection() {
    let mut harness = start_server(
        Arc::new(TestBackend::new(b"valid-credential")),
        ServeOptions {
            require_authentication: true,
            ..ServeOptions::default()
        },
    );
    let stream = harness.client_stream.take().unwrap();

    let mut client = BlockTransferClient::connect(
        stream,
        Uuid::new_v4(),
        "test",
        Some(DataBlock::from_payload(b"valid-credential")),
    )
    .await
    .expect("connect + handshake");
    assert!(client.is_authenticated());

    client
        .send_chunk(Uuid::new_v4(), &DataBlock::from_payload(b"x"))
        .await
        .expect("authenticated command");

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn v2_client_downgrades_to_v1_and_skips_the_handshake() {
    let mut harness = start_server(
        Arc::new(TestBackend::new(b"valid-credential")),
        ServeOptions {
            server_version: 1,
            require_authentication: true,
        },
    );
    let stream = harness.client_stream.take().unwrap();

    // The client has a credential, but a v1 server never sees the handshake.
    let mut client = BlockTransferClient::connect(
        stream,
        Uuid::new_v4(),
        "test",
        Some(DataBlock::from_payload(b"valid-credential")),
    )
    .await
    .expect("downgrade connect");

    assert_eq!(client.negotiated_version(), 1);
    assert!(!client.is_authenticated());

    // v1 connections are exempt from the authentication gate.
    client
        .send_chunk(Uuid::new_v4(), &DataBlock::from_payload(b"x"))
        .await
        .expect("command on v1");

    harness.shutdown().await;
}
