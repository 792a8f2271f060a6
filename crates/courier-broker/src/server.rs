//! Server side of the block-transfer protocol: version negotiation, the
//! client-authentication gate, command-to-operation mapping and in-order
//! responses, plus draining the peer's outbound dispatch queue.

use std::sync::Arc;

use courier_data::{BlockPool, DataBlock, SharedBlock};
use courier_errors::{Error, ErrorKind, Result, ServerErrorJson};
use courier_tasks::{ControlToken, ExecutionQueue};
use courier_wire::{
    BlockTransferCodec, BlockType, CommandFrame, CommandId, Frame, PROTOCOL_VERSION,
    PROTOCOL_VERSION_MIN,
};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    backend::{BackendCommandId, BackendProcessing, OperationId},
    dispatcher::InProcessBlockDispatcher,
};

/// Per-connection serving options.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    /// The server's own protocol version offered during negotiation.
    pub server_version: u16,
    /// Demand the authentication handshake from v2+ peers before serving
    /// any other command.
    pub require_authentication: bool,
}

impl Default for ServeOptions {
    fn default() -> Self {
        ServeOptions {
            server_version: PROTOCOL_VERSION,
            require_authentication: false,
        }
    }
}

enum Event {
    Inbound(Option<Result<Frame>>),
    Outbound(Option<SharedBlock>),
    Canceled,
}

/// Drive one peer connection until it closes, the stream corrupts or the
/// control token cancels.
///
/// The peer's outbound queue is registered with the dispatcher for the
/// lifetime of the connection; blocks dispatched to this peer are written
/// as unacknowledged server-initiated SendChunk frames.
pub async fn serve_connection<S>(
    stream: S,
    backend: Arc<dyn BackendProcessing>,
    dispatcher: Arc<InProcessBlockDispatcher>,
    queue: ExecutionQueue,
    pool: BlockPool,
    token: ControlToken,
    options: ServeOptions,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut framed = Framed::new(stream, BlockTransferCodec::new());
    let session_id = Uuid::new_v4();

    // ── One-shot version negotiation ──────────────────────────────────────

    let hello = match framed.next().await {
        Some(frame) => frame?,
        None => return Ok(()),
    };
    if hello.command.command != CommandId::NoCommand {
        return Err(Error::new(
            ErrorKind::InvalidDataFormat,
            "expected a version negotiation frame",
        ));
    }
    let client_version = hello.command.version;
    if client_version < PROTOCOL_VERSION_MIN {
        let err = Error::new(
            ErrorKind::NotSupported,
            format!("client protocol version {client_version} is not supported"),
        );
        let _ = framed.send(error_frame(options.server_version, &err)).await;
        return Err(err);
    }
    // A peer with a strictly higher version downgrades to ours.
    let negotiated = client_version.min(options.server_version);

    // The peer announces its id in the chunk-id field of the hello frame.
    let peer_id = if hello.command.chunk_id.is_nil() {
        Uuid::new_v4()
    } else {
        hello.command.chunk_id
    };

    framed
        .send(Frame::command_only(
            CommandFrame::new(CommandId::NoCommand, Uuid::nil()).with_version(negotiated),
        ))
        .await?;

    // The handshake only exists from v2 on; v1 peers are exempt.
    let mut authenticated = !(options.require_authentication && negotiated >= 2);

    let mut outbound = dispatcher.register_peer(peer_id);
    backend.peer_connected_notify(peer_id)?;
    info!(peer = %peer_id, version = negotiated, "peer connected");

    let result = loop {
        let event = tokio::select! {
            _ = token.canceled() => Event::Canceled,
            block = outbound.recv() => Event::Outbound(block),
            frame = framed.next() => Event::Inbound(frame),
        };

        match event {
            Event::Canceled => break Ok(()),
            Event::Outbound(None) => break Ok(()),
            Event::Outbound(Some(block)) => {
                // Server-initiated push; not acknowledged by the peer.
                let frame = Frame::with_block(
                    CommandFrame::new(CommandId::SendChunk, Uuid::nil())
                        .with_version(negotiated),
                    block.to_block(),
                );
                if let Err(err) = framed.send(frame).await {
                    break Err(err);
                }
            }
            Event::Inbound(None) => break Ok(()),
            Event::Inbound(Some(Err(err))) => {
                // Malformed frames are fatal for the connection.
                warn!(peer = %peer_id, error = %err, "dropping corrupt connection");
                break Err(err);
            }
            Event::Inbound(Some(Ok(frame))) => {
                let is_auth_frame = frame.command.command == CommandId::SendChunk
                    && frame.command.block_type == BlockType::Authentication;

                if !authenticated && !is_auth_frame {
                    let err = Error::new(
                        ErrorKind::Security,
                        "the connection is not authenticated",
                    );
                    if let Err(err) = framed.send(error_frame(negotiated, &err)).await {
                        break Err(err);
                    }
                    continue;
                }

                let response = process_frame(
                    &frame,
                    backend.as_ref(),
                    &queue,
                    &pool,
                    session_id,
                    peer_id,
                    negotiated,
                )
                .await;

                let reply = match response {
                    Ok(reply) => {
                        if is_auth_frame {
                            authenticated = true;
                            debug!(peer = %peer_id, "peer authenticated");
                        }
                        reply
                    }
                    Err(err) => {
                        // Processing errors travel back as error blocks; the
                        // connection stays up.
                        debug!(peer = %peer_id, error = %err, "operation failed");
                        error_frame(negotiated, &err)
                    }
                };
                if let Err(err) = framed.send(reply).await {
                    break Err(err);
                }
            }
        }
    };

    dispatcher.unregister_peer(peer_id);
    let _ = backend.peer_disconnected_notify(peer_id);
    info!(peer = %peer_id, "peer disconnected");
    result
}

/// Map one inbound frame to a backend operation, run it on the queue and
/// build the in-order reply frame.
async fn process_frame(
    frame: &Frame,
    backend: &dyn BackendProcessing,
    queue: &ExecutionQueue,
    pool: &BlockPool,
    session_id: Uuid,
    peer_id: Uuid,
    negotiated: u16,
) -> Result<Frame> {
    let command = &frame.command;
    let chunk_id = command.chunk_id;

    let (operation_id, command_id) = match (command.command, command.block_type) {
        (CommandId::SendChunk, BlockType::Authentication) => {
            (OperationId::AuthenticateClient, BackendCommandId::None)
        }
        (CommandId::SendChunk, _) => (OperationId::Put, BackendCommandId::None),
        (CommandId::ReceiveChunk, BlockType::ServerState) => {
            (OperationId::GetServerState, BackendCommandId::None)
        }
        (CommandId::ReceiveChunk, _) => (OperationId::Get, BackendCommandId::None),
        (CommandId::RemoveChunk, _) => (OperationId::Command, BackendCommandId::Remove),
        (CommandId::FlushPeerSessions, _) => {
            (OperationId::Command, BackendCommandId::FlushPeerSessions)
        }
        (CommandId::NoCommand, _) => {
            return Err(Error::new(
                ErrorKind::InvalidDataFormat,
                "unexpected negotiation frame on an established connection",
            ));
        }
    };

    // Inbound commands with payloads carry their block; read-style
    // operations get a pool block for the backend to fill.
    let data = match operation_id {
        OperationId::Put | OperationId::AuthenticateClient => {
            let block = frame.block.clone().ok_or_else(|| {
                Error::new(ErrorKind::ArgumentNull, "the command requires a data block")
            })?;
            Some(SharedBlock::new(block))
        }
        OperationId::Get | OperationId::GetServerState => {
            Some(SharedBlock::new(pool.acquire()))
        }
        _ => None,
    };

    let task = backend.create_backend_processing_task(
        operation_id,
        command_id,
        session_id,
        chunk_id,
        peer_id,
        Uuid::nil(),
        data.clone(),
    )?;

    let handle = queue.push_back(task)?;
    queue.wait_for_success(&handle).await?;

    let echo = CommandFrame::new(command.command, chunk_id)
        .with_version(negotiated)
        .with_block_type(match command.block_type {
            BlockType::Authentication => BlockType::Authentication,
            BlockType::ServerState => BlockType::ServerState,
            _ => BlockType::Normal,
        });

    let reply_with_block = match operation_id {
        OperationId::Get | OperationId::GetServerState => backend.auto_block_dispatching(),
        OperationId::AuthenticateClient => true,
        _ => false,
    };

    if reply_with_block {
        if let Some(data) = data {
            return Ok(Frame::with_block(echo, data.to_block()));
        }
    }
    Ok(Frame::command_only(echo))
}

/// A ServerError block carrying the structured error envelope as its JSON
/// header.
fn error_frame(negotiated: u16, err: &Error) -> Frame {
    let envelope = ServerErrorJson::from_error(err).to_json_string();
    let mut block = DataBlock::new(envelope.len().max(64));
    block.set_parts(&[], envelope.as_bytes());

    let command = CommandFrame::new(CommandId::NoCommand, Uuid::nil())
        .with_version(negotiated)
        .with_block_type(BlockType::ServerError);
    Frame::with_block(command, block)
}
