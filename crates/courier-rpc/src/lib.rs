//! RPC-style request/response exchanges over the broker: per-conversation
//! half-duplex state machines with acknowledgement, deadlines and bounded
//! delivery retry.

mod conversation;
mod dispatch;
mod payload;

pub use conversation::{
    Conversation, ConversationConfig, ConversationCore, ConversationProcessing,
    MAX_MESSAGE_DELIVERY_ATTEMPTS, PENDING_QUEUE_CAPACITY,
};
pub use dispatch::ObjectDispatch;
pub use payload::{
    create_error_payload, is_request_payload, is_response_payload, AsyncRpcPayload,
    AsyncRpcRequest, AsyncRpcResponse, MessageInfo,
};
