//! The message dispatch contract a conversation sends through.

use async_trait::async_trait;
use courier_broker::BrokerProtocol;
use courier_errors::Result;
use uuid::Uuid;

use crate::payload::AsyncRpcPayload;

/// Delivers envelope + payload pairs to a target peer; implemented by the
/// messaging client connection layer.
#[async_trait]
pub trait ObjectDispatch: Send + Sync {
    async fn push_message(
        &self,
        target_peer_id: Uuid,
        protocol: BrokerProtocol,
        payload: Option<AsyncRpcPayload>,
    ) -> Result<()>;

    fn is_connected(&self) -> bool {
        true
    }
}
