//! The block-transfer wire protocol.
//!
//! Each logical exchange is a 26-byte command frame optionally followed by a
//! block payload. Blocks carry opaque user data plus a trailing JSON header;
//! the split point travels in a length trailer so the fixed command header
//! stays exactly 26 bytes (see [`frame`] for the layout).

pub mod client;
pub mod frame;

pub use client::BlockTransferClient;
pub use frame::{
    BlockTransferCodec, BlockType, CommandFrame, CommandId, Frame, COMMAND_HEADER_SIZE,
    DEFAULT_MAX_PAYLOAD, FLAG_HAS_ENVELOPE, PROTOCOL_VERSION, PROTOCOL_VERSION_MIN,
};
