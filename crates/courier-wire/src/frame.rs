//! Command framing for the block-transfer protocol.
//!
//! Command header (network byte order, 26 bytes total):
//!
//! ```text
//! version      u16
//! commandId    u16
//! chunkId      16 bytes
//! blockType    u8
//! flags        u8
//! payloadSize  u32
//! ```
//!
//! A block frame is `payloadSize` bytes: the user payload first, the JSON
//! header after it. When [`FLAG_HAS_ENVELOPE`] is set the last four payload
//! bytes are a big-endian u32 with the JSON header length, which recovers
//! the payload/header split on the receiving side; the trailer itself never
//! reaches the decoded [`DataBlock`]. Without the flag the whole payload is
//! user data (`offset1 == size`). An envelope flag with a zero-length JSON
//! header is a protocol error.

use bytes::{Buf, BufMut, BytesMut};
use courier_data::DataBlock;
use courier_errors::{Error, ErrorKind, Result};
use tokio_util::codec::{Decoder, Encoder};
use uuid::Uuid;

/// First protocol version; no authentication handshake.
pub const PROTOCOL_VERSION_MIN: u16 = 1;
/// Current protocol version; adds the client-authentication handshake.
pub const PROTOCOL_VERSION: u16 = 2;

pub const COMMAND_HEADER_SIZE: usize = 26;
pub const FLAG_HAS_ENVELOPE: u8 = 0x01;

/// Upper bound on a single block payload.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

const ENVELOPE_TRAILER_SIZE: usize = 4;

// ── Command and block enums ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CommandId {
    NoCommand = 0,
    SendChunk = 1,
    ReceiveChunk = 2,
    RemoveChunk = 3,
    FlushPeerSessions = 4,
}

impl CommandId {
    pub fn from_wire(value: u16) -> Result<CommandId> {
        Ok(match value {
            0 => CommandId::NoCommand,
            1 => CommandId::SendChunk,
            2 => CommandId::ReceiveChunk,
            3 => CommandId::RemoveChunk,
            4 => CommandId::FlushPeerSessions,
            other => {
                return Err(Error::new(
                    ErrorKind::InvalidDataFormat,
                    format!("unknown command id {other}"),
                ))
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockType {
    Normal = 0,
    /// The block payload is an opaque credential block.
    Authentication = 1,
    /// The block payload is a server-state descriptor.
    ServerState = 2,
    /// The block header carries a server-error envelope.
    ServerError = 3,
}

impl BlockType {
    pub fn from_wire(value: u8) -> Result<BlockType> {
        Ok(match value {
            0 => BlockType::Normal,
            1 => BlockType::Authentication,
            2 => BlockType::ServerState,
            3 => BlockType::ServerError,
            other => {
                return Err(Error::new(
                    ErrorKind::InvalidDataFormat,
                    format!("unknown block type {other}"),
                ))
            }
        })
    }
}

// ── Command frame ─────────────────────────────────────────────────────────────

/// The fixed-size command header preceding every payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    pub version: u16,
    pub command: CommandId,
    pub chunk_id: Uuid,
    pub block_type: BlockType,
    pub flags: u8,
    pub payload_size: u32,
}

impl CommandFrame {
    pub fn new(command: CommandId, chunk_id: Uuid) -> Self {
        CommandFrame {
            version: PROTOCOL_VERSION,
            command,
            chunk_id,
            block_type: BlockType::Normal,
            flags: 0,
            payload_size: 0,
        }
    }

    pub fn with_block_type(mut self, block_type: BlockType) -> Self {
        self.block_type = block_type;
        self
    }

    pub fn with_version(mut self, version: u16) -> Self {
        self.version = version;
        self
    }

    fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(COMMAND_HEADER_SIZE);
        dst.put_u16(self.version);
        dst.put_u16(self.command as u16);
        dst.put_slice(self.chunk_id.as_bytes());
        dst.put_u8(self.block_type as u8);
        dst.put_u8(self.flags);
        dst.put_u32(self.payload_size);
    }

    fn decode_from(src: &mut BytesMut) -> Result<CommandFrame> {
        debug_assert!(src.len() >= COMMAND_HEADER_SIZE);
        let version = src.get_u16();
        let command = CommandId::from_wire(src.get_u16())?;
        let mut id_bytes = [0u8; 16];
        src.copy_to_slice(&mut id_bytes);
        let chunk_id = Uuid::from_bytes(id_bytes);
        let block_type = BlockType::from_wire(src.get_u8())?;
        let flags = src.get_u8();
        let payload_size = src.get_u32();
        Ok(CommandFrame {
            version,
            command,
            chunk_id,
            block_type,
            flags,
            payload_size,
        })
    }
}

/// A decoded exchange unit: the command header plus its block, if any.
#[derive(Debug, Clone)]
pub struct Frame {
    pub command: CommandFrame,
    pub block: Option<DataBlock>,
}

impl Frame {
    pub fn command_only(command: CommandFrame) -> Self {
        Frame {
            command,
            block: None,
        }
    }

    pub fn with_block(mut command: CommandFrame, block: DataBlock) -> Self {
        let mut payload_size = block.size();
        if block.offset1() < block.size() {
            command.flags |= FLAG_HAS_ENVELOPE;
            payload_size += ENVELOPE_TRAILER_SIZE;
        }
        command.payload_size = payload_size as u32;
        Frame {
            command,
            block: Some(block),
        }
    }
}

// ── Codec ─────────────────────────────────────────────────────────────────────

/// tokio-util codec for command + block frames.
///
/// Malformed frames (bad enums, oversized payloads, broken trailers) are
/// fatal for the connection; the decoder returns an error and the driver is
/// expected to drop the stream.
#[derive(Debug, Clone)]
pub struct BlockTransferCodec {
    max_payload: usize,
    pending: Option<CommandFrame>,
}

impl BlockTransferCodec {
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD)
    }

    pub fn with_max_payload(max_payload: usize) -> Self {
        BlockTransferCodec {
            max_payload,
            pending: None,
        }
    }

    fn decode_block(command: &CommandFrame, payload: &[u8]) -> Result<Option<DataBlock>> {
        if payload.is_empty() {
            return Ok(None);
        }

        let mut block = DataBlock::new(payload.len());
        if command.flags & FLAG_HAS_ENVELOPE != 0 {
            if payload.len() < ENVELOPE_TRAILER_SIZE {
                return Err(Error::new(
                    ErrorKind::InvalidDataFormat,
                    "payload too short for an envelope trailer",
                ));
            }
            let (content, trailer) = payload.split_at(payload.len() - ENVELOPE_TRAILER_SIZE);
            let envelope_len = u32::from_be_bytes(trailer.try_into().unwrap()) as usize;
            if envelope_len == 0 {
                return Err(Error::new(
                    ErrorKind::InvalidDataFormat,
                    "block declares an envelope but the JSON header is empty",
                ));
            }
            if envelope_len > content.len() {
                return Err(Error::new(
                    ErrorKind::InvalidDataFormat,
                    "envelope length exceeds the block payload",
                ));
            }
            let offset1 = content.len() - envelope_len;
            block.set_parts(&content[..offset1], &content[offset1..]);
        } else {
            // The whole payload is user data: offset1 == size.
            block.set_parts(payload, &[]);
        }
        Ok(Some(block))
    }
}

impl Default for BlockTransferCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for BlockTransferCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        let command = match self.pending.take() {
            Some(command) => command,
            None => {
                if src.len() < COMMAND_HEADER_SIZE {
                    src.reserve(COMMAND_HEADER_SIZE - src.len());
                    return Ok(None);
                }
                let command = CommandFrame::decode_from(src)?;
                if command.payload_size as usize > self.max_payload {
                    return Err(Error::new(
                        ErrorKind::InvalidDataFormat,
                        format!(
                            "payload size {} exceeds the {} byte limit",
                            command.payload_size, self.max_payload
                        ),
                    ));
                }
                command
            }
        };

        let payload_size = command.payload_size as usize;
        if src.len() < payload_size {
            src.reserve(payload_size - src.len());
            self.pending = Some(command);
            return Ok(None);
        }

        let payload = src.split_to(payload_size);
        let block = Self::decode_block(&command, &payload)?;
        Ok(Some(Frame { command, block }))
    }
}

impl Encoder<Frame> for BlockTransferCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let Frame { command, block } = frame;
        if command.payload_size as usize > self.max_payload {
            return Err(Error::argument(format!(
                "payload size {} exceeds the {} byte limit",
                command.payload_size, self.max_payload
            )));
        }

        command.encode_into(dst);

        if let Some(block) = block {
            dst.reserve(command.payload_size as usize);
            dst.put_slice(block.as_slice());
            if command.flags & FLAG_HAS_ENVELOPE != 0 {
                let envelope_len = (block.size() - block.offset1()) as u32;
                dst.put_u32(envelope_len);
            }
        }
        Ok(())
    }
}
