//! Client endpoint of the block-transfer protocol.
//!
//! One command is in flight at a time: the client writes a frame and waits
//! for the server's response before the next command. Reconnection builds a
//! fresh client, which clears all in-flight state.

use courier_data::DataBlock;
use courier_errors::{Error, ErrorKind, Result, ServerErrorJson};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::frame::{
    BlockTransferCodec, BlockType, CommandFrame, CommandId, Frame, PROTOCOL_VERSION,
    PROTOCOL_VERSION_MIN,
};

/// A connected block-transfer client over a duplex stream (plain TCP or TLS).
pub struct BlockTransferClient<S> {
    framed: Framed<S, BlockTransferCodec>,
    peer_id: Uuid,
    endpoint_id: String,
    negotiated_version: u16,
    authentication_block: Option<DataBlock>,
    authenticated: bool,
}

impl<S> BlockTransferClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Negotiate the protocol version on a freshly connected stream and, when
    /// the negotiated version supports it and a credential block is
    /// configured, perform the authentication handshake.
    pub async fn connect(
        stream: S,
        peer_id: Uuid,
        endpoint_id: impl Into<String>,
        authentication_block: Option<DataBlock>,
    ) -> Result<Self> {
        let endpoint_id = endpoint_id.into();
        let mut client = BlockTransferClient {
            framed: Framed::new(stream, BlockTransferCodec::new()),
            peer_id,
            endpoint_id,
            negotiated_version: PROTOCOL_VERSION,
            authentication_block,
            authenticated: false,
        };

        client.negotiate().await?;

        if client.negotiated_version >= 2 && client.authentication_block.is_some() {
            client.authenticate().await?;
        }

        debug!(
            endpoint = %client.endpoint_id,
            version = client.negotiated_version,
            "block transfer client connected"
        );
        Ok(client)
    }

    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    pub fn negotiated_version(&self) -> u16 {
        self.negotiated_version
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// One-shot version negotiation. The client's peer id travels in the
    /// chunk-id field of the negotiation frame.
    async fn negotiate(&mut self) -> Result<()> {
        let hello = CommandFrame::new(CommandId::NoCommand, self.peer_id);
        let response = self.exchange(Frame::command_only(hello)).await?;

        let version = response.command.version;
        if version < PROTOCOL_VERSION_MIN || version > PROTOCOL_VERSION {
            return Err(Error::new(
                ErrorKind::NotSupported,
                format!("server negotiated unsupported protocol version {version}"),
            ));
        }
        self.negotiated_version = version;
        Ok(())
    }

    /// Send the credential block as the first frame after (re)connect.
    async fn authenticate(&mut self) -> Result<()> {
        let block = self
            .authentication_block
            .clone()
            .ok_or_else(|| Error::new(ErrorKind::Security, "no authentication block configured"))?;

        let command = CommandFrame::new(CommandId::SendChunk, Uuid::nil())
            .with_version(self.negotiated_version)
            .with_block_type(BlockType::Authentication);
        self.exchange(Frame::with_block(command, block)).await?;

        self.authenticated = true;
        trace!(endpoint = %self.endpoint_id, "client authenticated");
        Ok(())
    }

    /// Upload a chunk.
    pub async fn send_chunk(&mut self, chunk_id: Uuid, block: &DataBlock) -> Result<()> {
        let command =
            CommandFrame::new(CommandId::SendChunk, chunk_id).with_version(self.negotiated_version);
        self.exchange(Frame::with_block(command, block.clone())).await?;
        Ok(())
    }

    /// Request a chunk; the server replies with a block.
    pub async fn receive_chunk(&mut self, chunk_id: Uuid) -> Result<DataBlock> {
        let command = CommandFrame::new(CommandId::ReceiveChunk, chunk_id)
            .with_version(self.negotiated_version);
        let response = self.exchange(Frame::command_only(command)).await?;
        response.block.ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidDataFormat,
                format!("server returned no block for chunk '{chunk_id}'"),
            )
        })
    }

    /// Remove a chunk; carries only the chunk id.
    pub async fn remove_chunk(&mut self, chunk_id: Uuid) -> Result<()> {
        let command = CommandFrame::new(CommandId::RemoveChunk, chunk_id)
            .with_version(self.negotiated_version);
        self.exchange(Frame::command_only(command)).await?;
        Ok(())
    }

    /// Flush peer sessions on the server; carries no chunk.
    pub async fn flush_peer_sessions(&mut self) -> Result<()> {
        let command = CommandFrame::new(CommandId::FlushPeerSessions, Uuid::nil())
            .with_version(self.negotiated_version);
        self.exchange(Frame::command_only(command)).await?;
        Ok(())
    }

    /// Fetch the server-state descriptor.
    pub async fn get_server_state(&mut self) -> Result<DataBlock> {
        let command = CommandFrame::new(CommandId::ReceiveChunk, Uuid::nil())
            .with_version(self.negotiated_version)
            .with_block_type(BlockType::ServerState);
        let response = self.exchange(Frame::command_only(command)).await?;
        response.block.ok_or_else(|| {
            Error::new(ErrorKind::InvalidDataFormat, "server returned no state block")
        })
    }

    /// Wait for a server-initiated frame (a dispatched message block).
    ///
    /// Server pushes are not acknowledged; the connection must be otherwise
    /// idle while waiting.
    pub async fn recv_dispatched(&mut self) -> Result<Frame> {
        let frame = self.read_frame().await?;
        if frame.command.block_type == BlockType::ServerError {
            return Err(Self::server_error(&frame));
        }
        Ok(frame)
    }

    /// Write one command and read the server's response for it.
    async fn exchange(&mut self, frame: Frame) -> Result<Frame> {
        self.framed.send(frame).await?;
        let response = self.read_frame().await?;
        if response.command.block_type == BlockType::ServerError {
            return Err(Self::server_error(&response));
        }
        Ok(response)
    }

    async fn read_frame(&mut self) -> Result<Frame> {
        match self.framed.next().await {
            Some(frame) => frame,
            None => Err(Error::new(
                ErrorKind::ServerNoConnection,
                format!("connection to '{}' closed by the server", self.endpoint_id),
            )),
        }
    }

    /// Rebuild the structured error carried by a ServerError block.
    ///
    /// The reconstructed remote error is nested under a ServerError-kind
    /// wrapper so the reconnect policy can tell server-side failures from
    /// transport failures.
    fn server_error(frame: &Frame) -> Error {
        let remote = frame
            .block
            .as_ref()
            .and_then(|block| {
                let bytes = if block.header_bytes().is_empty() {
                    block.payload()
                } else {
                    block.header_bytes()
                };
                std::str::from_utf8(bytes).ok().map(str::to_owned)
            })
            .and_then(|text| ServerErrorJson::from_json_str(&text).ok())
            .and_then(|envelope| envelope.into_error().ok());

        let wrapper = Error::new(ErrorKind::ServerError, "server reported a processing error");
        match remote {
            Some(remote) => {
                // Keep a broker code visible on the wrapper for classifiers.
                let wrapper = match remote.properties().error_code {
                    Some(code) => wrapper.with_error_code(code),
                    None => wrapper,
                };
                wrapper.with_source(remote)
            }
            None => wrapper,
        }
    }
}
