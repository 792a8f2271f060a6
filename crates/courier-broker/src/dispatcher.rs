//! Block dispatch: delivering processed blocks to the target peer's
//! outbound queue.

use std::collections::HashSet;

use courier_data::SharedBlock;
use courier_errors::{BrokerErrorCode, Error, Result};
use courier_tasks::{FnTask, Task};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

/// Sending half of a peer's outbound message-block queue.
pub type MessageBlockSender = mpsc::Sender<SharedBlock>;

/// The dispatch contract the broker backend depends on.
pub trait AsyncBlockDispatcher: Send + Sync {
    /// A task that delivers `data` to the target peer's outbound queue.
    fn create_dispatch_task(&self, target_peer_id: Uuid, data: SharedBlock)
        -> Result<Box<dyn Task>>;

    /// The outbound queue of a directly connected peer, when there is one.
    fn try_get_message_block_completion_queue(&self, peer_id: Uuid) -> Option<MessageBlockSender>;

    /// Ids of every peer with an active outbound queue.
    fn get_all_active_queues_ids(&self) -> HashSet<Uuid>;
}

/// In-process dispatcher over per-peer bounded mpsc queues.
///
/// The wire server registers a queue when a peer's connection comes up and
/// drains it into the socket; dispatch tasks feed the queues.
pub struct InProcessBlockDispatcher {
    queues: DashMap<Uuid, MessageBlockSender>,
    queue_capacity: usize,
}

impl InProcessBlockDispatcher {
    pub fn new(queue_capacity: usize) -> Self {
        InProcessBlockDispatcher {
            queues: DashMap::new(),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Register a peer's outbound queue, returning the draining half.
    /// Re-registration replaces the previous queue.
    pub fn register_peer(&self, peer_id: Uuid) -> mpsc::Receiver<SharedBlock> {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.queues.insert(peer_id, tx);
        trace!(peer = %peer_id, "registered outbound queue");
        rx
    }

    pub fn unregister_peer(&self, peer_id: Uuid) {
        self.queues.remove(&peer_id);
        trace!(peer = %peer_id, "unregistered outbound queue");
    }

    pub fn active_peers(&self) -> usize {
        self.queues.len()
    }
}

impl AsyncBlockDispatcher for InProcessBlockDispatcher {
    fn create_dispatch_task(
        &self,
        target_peer_id: Uuid,
        data: SharedBlock,
    ) -> Result<Box<dyn Task>> {
        let sender = self
            .try_get_message_block_completion_queue(target_peer_id)
            .ok_or_else(|| {
                Error::not_found(format!("target peer '{target_peer_id}' is not connected"))
            })?;

        Ok(Box::new(FnTask::new("dispatch-block", move |_cx| async move {
            match sender.try_send(data) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(_)) => Err(Error::server_error(
                    BrokerErrorCode::TargetPeerQueueFull,
                    format!(
                        "the outbound queue for peer '{target_peer_id}' is full and can't receive messages"
                    ),
                )),
                Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::disposed(
                    &format!("outbound queue for peer '{target_peer_id}'"),
                )),
            }
        })))
    }

    fn try_get_message_block_completion_queue(&self, peer_id: Uuid) -> Option<MessageBlockSender> {
        self.queues.get(&peer_id).map(|entry| entry.value().clone())
    }

    fn get_all_active_queues_ids(&self) -> HashSet<Uuid> {
        self.queues.iter().map(|entry| *entry.key()).collect()
    }
}
