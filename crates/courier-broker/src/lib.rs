//! The broker runtime: typed envelope parsing, client authorization,
//! peer-id routing and block dispatch.
//!
//! Inbound blocks arrive through the wire server driver, which turns every
//! command into a backend-processing task. The broker backend's task parses
//! the block's JSON envelope, authorizes the sender when required, resolves
//! proxy routing and hands the rewritten block to the block dispatcher for
//! delivery to the target peer's outbound queue.

pub mod backend;
pub mod broker_task;
pub mod dispatcher;
pub mod protocol;
pub mod routing;
pub mod security;
pub mod server;

pub use backend::{
    validate_backend_parameters, BackendCommandId, BackendProcessing, ForwardingBackend,
    OperationId,
};
pub use broker_task::{authorize_protocol_message, BrokerBackendProcessing, BrokerBackendTask};
pub use dispatcher::{AsyncBlockDispatcher, InProcessBlockDispatcher, MessageBlockSender};
pub use protocol::{
    create_acknowledgment_message, create_broker_protocol_message,
    create_response_protocol_message, update_broker_protocol_message_in_block,
    AuthenticationToken, BrokerProtocol, MessageType, PrincipalIdentityInfo, SecurityPrincipalData,
};
pub use routing::PeerIdRoutingCache;
pub use security::{AuthorizationCache, AuthorizationService, SecurityPrincipal, StaticAuthorizationService};
pub use server::{serve_connection, ServeOptions};
