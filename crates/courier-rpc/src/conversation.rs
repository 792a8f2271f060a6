//! The per-conversation state machine.
//!
//! `on_processing` is invoked repeatedly by the owning scheduler; each call
//! performs at most one step: consume an acknowledgment, finish, send the
//! seed, pop one pending message or hand the current message to the
//! processor. Sends go through a processing task the scheduler pops with
//! [`Conversation::try_pop_processing_task`] and executes on its queue.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use courier_broker::{
    create_acknowledgment_message, create_response_protocol_message, BrokerProtocol, MessageType,
};
use courier_errors::{
    is_retryable_messaging_broker_error, BrokerErrorCode, Error, ErrorKind, Result,
    ERROR_UUID_RESPONSE_TIMEOUT,
};
use courier_tasks::{FnTask, Task};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::{
    dispatch::ObjectDispatch,
    payload::{create_error_payload, is_request_payload, is_response_payload, AsyncRpcPayload,
        AsyncRpcResponse, MessageInfo},
};

/// Bounded ring of inbound messages per conversation.
pub const PENDING_QUEUE_CAPACITY: usize = 32;
/// Delivery attempts for one outbound message.
pub const MAX_MESSAGE_DELIVERY_ATTEMPTS: usize = 5;

const EACCES: i32 = 13;

#[derive(Debug, Clone)]
pub struct ConversationConfig {
    pub ack_timeout: Duration,
    pub msg_timeout: Duration,
    /// Generic scheduler poll interval; exposed for the conversation owner.
    pub poll_timeout: Duration,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        ConversationConfig {
            ack_timeout: Duration::from_secs(30),
            msg_timeout: Duration::from_secs(300),
            poll_timeout: Duration::from_secs(1),
        }
    }
}

/// User hook driven once per `on_processing` step while a current message
/// is held.
pub trait ConversationProcessing: Send {
    fn process_current_message(&mut self, core: &mut ConversationCore) -> Result<()>;
}

/// The conversation state plus the send-side helpers handed to the
/// processing hook.
pub struct ConversationCore {
    peer_id: Uuid,
    target_peer_id: Uuid,
    conversation_id: Uuid,
    dispatcher: Arc<dyn ObjectDispatch>,
    authentication_cookies: String,

    ack_timeout: Duration,
    msg_timeout: Duration,
    poll_timeout: Duration,

    seed_message: Option<MessageInfo>,
    pending_queue: VecDeque<MessageInfo>,
    current_message: Option<MessageInfo>,

    last_unacknowledged_sent: Option<Instant>,
    last_message_received: Instant,
    last_sent_message_id: Uuid,
    is_finished: bool,
    was_last_message_sent: bool,
    is_ack_expected: bool,

    processing_task: Option<Box<dyn Task>>,
    retry_count: usize,
    retry_message: Option<MessageInfo>,
}

impl ConversationCore {
    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    pub fn target_peer_id(&self) -> Uuid {
        self.target_peer_id
    }

    /// Credential material for outbound request envelopes.
    pub fn authentication_cookies(&self) -> &str {
        &self.authentication_cookies
    }

    pub fn current_message(&self) -> Option<&MessageInfo> {
        self.current_message.as_ref()
    }

    /// Consume the current message; processors call this when done with it.
    pub fn take_current_message(&mut self) -> Option<MessageInfo> {
        self.current_message.take()
    }

    pub fn finish(&mut self) {
        self.is_finished = true;
    }

    /// Send an envelope + payload pair to the conversation's remote peer.
    ///
    /// Non-ack sends arm the acknowledgment deadline and record the sent
    /// message id; at most one outbound message is unacknowledged at any
    /// time.
    pub fn send_message(
        &mut self,
        is_last_message: bool,
        protocol: BrokerProtocol,
        payload: Option<AsyncRpcPayload>,
    ) -> Result<()> {
        let message_type = MessageType::from_name(&protocol.message_type);
        let is_ack = message_type == Some(MessageType::AsyncRpcAcknowledgment);
        debug_assert!(!is_last_message || !is_ack);

        trace!(
            conversation = %self.conversation_id,
            message_type = %protocol.message_type,
            is_last_message,
            "sending message"
        );

        self.create_processing_task(&protocol, &payload);

        self.retry_count = 0;
        self.retry_message = Some(MessageInfo::new(protocol.clone(), payload));

        if !is_ack {
            self.last_sent_message_id = protocol.message_id.parse().map_err(|_| {
                Error::argument("outbound message id is not in the expected UUID format")
            })?;
            self.last_unacknowledged_sent = Some(Instant::now());
            self.is_ack_expected = true;
            self.was_last_message_sent = is_last_message;
        }
        Ok(())
    }

    /// A last-message error response built from `err`.
    pub fn send_error_response_for(&mut self, err: &Error) -> Result<()> {
        let protocol = create_response_protocol_message(self.conversation_id);
        let payload = create_error_payload(err);
        self.send_message(true, protocol, Some(payload))
    }

    fn send_permission_denied(&mut self, message: &str) -> Result<()> {
        let err = Error::new(ErrorKind::System, message)
            .with_category("generic")
            .with_error_code(EACCES);
        self.send_error_response_for(&err)
    }

    fn create_processing_task(
        &mut self,
        protocol: &BrokerProtocol,
        payload: &Option<AsyncRpcPayload>,
    ) {
        let dispatcher = Arc::clone(&self.dispatcher);
        let target_peer_id = self.target_peer_id;
        let protocol = protocol.clone();
        let payload = payload.clone();
        self.processing_task = Some(Box::new(FnTask::new(
            "conversation-dispatch",
            move |_cx| async move {
                dispatcher
                    .push_message(target_peer_id, protocol, payload)
                    .await
            },
        )));
    }

    // ── Default processing wrappers ───────────────────────────────────────

    /// Request → response conversations: unpack the request, run `handler`,
    /// send the response (an error payload when the handler fails), finish
    /// after the ack.
    pub fn default_process_request<F>(&mut self, processor_name: &str, handler: F) -> Result<()>
    where
        F: FnOnce(&crate::payload::AsyncRpcRequest) -> Result<AsyncRpcResponse>,
    {
        let current = self.take_current_message().ok_or_else(|| {
            Error::unexpected(format!("{processor_name} has no current message to process"))
        })?;

        let error_response = |err: &Error| AsyncRpcResponse {
            server_error_json: Some(courier_errors::ServerErrorJson::from_error(err)),
            data: serde_json::Value::Null,
        };

        let request = current
            .payload
            .as_ref()
            .and_then(|p| p.async_rpc_request.as_ref());
        let response = match request {
            Some(request) => match handler(request) {
                Ok(response) => response,
                Err(err) => {
                    debug!(
                        conversation = %self.conversation_id,
                        error = %err,
                        "{processor_name} failed while processing a request"
                    );
                    error_response(&err)
                }
            },
            None => error_response(&Error::unexpected(format!(
                "{processor_name} expects a request to be present in the message payload"
            ))),
        };

        let conversation_id = current
            .protocol
            .conversation_id
            .parse()
            .unwrap_or(self.conversation_id);
        let protocol = create_response_protocol_message(conversation_id);
        self.send_message(true, protocol, Some(AsyncRpcPayload::response(response)))
    }

    /// Response-consuming conversations: require a response payload and
    /// finish.
    pub fn default_process_response(&mut self, processor_name: &str) -> Result<()> {
        let current = self.take_current_message().ok_or_else(|| {
            Error::unexpected(format!("{processor_name} has no current message to process"))
        })?;

        if !is_response_payload(&current.payload) {
            return Err(Error::unexpected(format!(
                "{processor_name} expects a response in the message payload"
            )));
        }
        self.is_finished = true;
        Ok(())
    }

    /// The current message's response, with a remote error rethrown.
    pub fn response_or_throw(&self) -> Result<AsyncRpcResponse> {
        let payload = self
            .current_message
            .as_ref()
            .and_then(|m| m.payload.as_ref())
            .ok_or_else(|| {
                Error::unexpected("the message returned by the remote host does not contain any payload")
            })?;
        let response = payload.async_rpc_response.as_ref().ok_or_else(|| {
            Error::unexpected(
                "the message returned by the remote host does not contain any response data",
            )
        })?;
        if let Some(envelope) = &response.server_error_json {
            return Err(envelope.clone().into_error()?);
        }
        Ok(response.clone())
    }

    fn step(&mut self, processor: &mut dyn ConversationProcessing) -> Result<()> {
        if self.is_finished || self.processing_task.is_some() {
            return Ok(());
        }

        if self.is_ack_expected {
            let sent_at = self
                .last_unacknowledged_sent
                .expect("armed when the ack flag was set");

            if sent_at.elapsed() >= self.ack_timeout {
                return Err(Error::timeout(format!(
                    "messaging client did not receive acknowledgment within the specified interval {:?}",
                    self.ack_timeout
                ))
                .with_error_uuid(ERROR_UUID_RESPONSE_TIMEOUT)
                .with_user_friendly(true));
            }

            let Some(front) = self.pending_queue.front() else {
                return Ok(());
            };

            let is_matching_ack = front.payload.is_none()
                && MessageType::from_name(&front.protocol.message_type)
                    == Some(MessageType::AsyncRpcAcknowledgment)
                && front.protocol.message_id.parse::<Uuid>().ok()
                    == Some(self.last_sent_message_id);

            if !is_matching_ack {
                debug!(
                    conversation = %self.conversation_id,
                    "expected an acknowledgment but received a different message"
                );
                return Err(Error::argument(
                    "acknowledgment message is expected but a different one was received \
                     or the message id does not match",
                ));
            }

            trace!(conversation = %self.conversation_id, "acknowledgment received");
            self.pending_queue.pop_front();
            self.last_sent_message_id = Uuid::nil();
            self.last_unacknowledged_sent = None;
            self.is_ack_expected = false;
        }

        if self.was_last_message_sent {
            // The last message was sent and acknowledged; any further
            // inbound message is a protocol error.
            if let Some(front) = self.pending_queue.front() {
                debug!(
                    conversation = %self.conversation_id,
                    message_type = %front.protocol.message_type,
                    "message received after the conversation has ended"
                );
                return Err(Error::unexpected(format!(
                    "message was received for conversation '{}' after it has ended",
                    self.conversation_id
                )));
            }
            self.is_finished = true;
            return Ok(());
        }

        if let Some(seed) = self.seed_message.take() {
            return self.send_message(false, seed.protocol, seed.payload);
        }

        if self.current_message.is_none() {
            if let Some(message) = self.pending_queue.pop_front() {
                let message_type = MessageType::from_name(&message.protocol.message_type);

                // Inbound requests must arrive authenticated.
                if message_type == Some(MessageType::AsyncRpcDispatch)
                    && is_request_payload(&message.payload)
                {
                    let has_principal = message
                        .protocol
                        .principal_identity_info
                        .as_ref()
                        .is_some_and(|identity| identity.security_principal.is_some());
                    if !has_principal {
                        return self.send_permission_denied("request messages must be authenticated");
                    }
                }

                trace!(
                    conversation = %self.conversation_id,
                    message_type = %message.protocol.message_type,
                    "processing message"
                );
                self.current_message = Some(message);
                self.last_message_received = Instant::now();
            }
        }

        if self.current_message.is_some() {
            return processor.process_current_message(self);
        }

        if self.last_message_received.elapsed() >= self.msg_timeout {
            return Err(Error::timeout(format!(
                "messaging client did not receive response within the specified interval {:?}",
                self.msg_timeout
            ))
            .with_error_uuid(ERROR_UUID_RESPONSE_TIMEOUT)
            .with_user_friendly(true));
        }
        Ok(())
    }
}

struct ConversationInner {
    core: ConversationCore,
    processor: Box<dyn ConversationProcessing>,
}

/// A half-duplex conversation bound to one remote peer.
pub struct Conversation {
    inner: Mutex<ConversationInner>,
}

impl Conversation {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        peer_id: Uuid,
        target_peer_id: Uuid,
        conversation_id: Uuid,
        dispatcher: Arc<dyn ObjectDispatch>,
        processor: Box<dyn ConversationProcessing>,
        config: ConversationConfig,
        seed_message: Option<MessageInfo>,
        authentication_cookies: impl Into<String>,
    ) -> Self {
        Conversation {
            inner: Mutex::new(ConversationInner {
                core: ConversationCore {
                    peer_id,
                    target_peer_id,
                    conversation_id,
                    dispatcher,
                    authentication_cookies: authentication_cookies.into(),
                    ack_timeout: config.ack_timeout,
                    msg_timeout: config.msg_timeout,
                    poll_timeout: config.poll_timeout,
                    seed_message,
                    pending_queue: VecDeque::with_capacity(PENDING_QUEUE_CAPACITY),
                    current_message: None,
                    last_unacknowledged_sent: None,
                    last_message_received: Instant::now(),
                    last_sent_message_id: Uuid::nil(),
                    is_finished: false,
                    was_last_message_sent: false,
                    is_ack_expected: false,
                    processing_task: None,
                    retry_count: 0,
                    retry_message: None,
                },
                processor,
            }),
        }
    }

    /// One scheduler step; see the module docs for the state machine.
    pub fn on_processing(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let ConversationInner { core, processor } = &mut *inner;
        core.step(processor.as_mut())
    }

    /// Deliver an inbound message to this conversation.
    ///
    /// Non-ack messages are acknowledged to the remote peer immediately,
    /// before they are queued for processing. A full ring fails the push
    /// with TargetPeerQueueFull.
    pub fn push_message(
        &self,
        target_peer_id: Uuid,
        protocol: BrokerProtocol,
        payload: Option<AsyncRpcPayload>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let core = &mut inner.core;

        if target_peer_id != core.peer_id {
            return Err(Error::argument(format!(
                "the target peer id '{target_peer_id}' does not match the expected peer id '{}'",
                core.peer_id
            )));
        }

        if core.pending_queue.len() >= PENDING_QUEUE_CAPACITY {
            return Err(Error::server_error(
                BrokerErrorCode::TargetPeerQueueFull,
                format!(
                    "the task with conversation id '{}' has its queue full and can't receive messages",
                    core.conversation_id
                ),
            ));
        }

        let message_type = MessageType::from_name(&protocol.message_type);
        if message_type != Some(MessageType::AsyncRpcAcknowledgment) {
            let source_peer_id: Uuid = protocol.source_peer_id.parse().map_err(|_| {
                Error::argument(format!(
                    "invalid source peer id '{}'",
                    protocol.source_peer_id
                ))
            })?;
            if source_peer_id != core.target_peer_id {
                return Err(Error::argument(format!(
                    "the source peer id '{source_peer_id}' does not match the expected peer id '{}'",
                    core.target_peer_id
                )));
            }

            let message_id: Uuid = protocol.message_id.parse().map_err(|_| {
                Error::argument("inbound message id is not in the expected UUID format")
            })?;
            core.send_message(
                false,
                create_acknowledgment_message(core.conversation_id, message_id),
                None,
            )?;
        }

        core.pending_queue.push_back(MessageInfo::new(protocol, payload));
        Ok(())
    }

    /// Hand the pending dispatch task to the scheduler, when there is one.
    pub fn try_pop_processing_task(&self) -> Option<Box<dyn Task>> {
        self.inner.lock().unwrap().core.processing_task.take()
    }

    /// Called by the scheduler when a dispatch task failed. Recreates the
    /// task and returns `true` when the failure is a retryable messaging
    /// broker error and the attempt budget is not exhausted.
    pub fn retry_processing_task(&self, err: &Error) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let core = &mut inner.core;

        core.retry_count += 1;
        if core.retry_count >= MAX_MESSAGE_DELIVERY_ATTEMPTS || core.retry_message.is_none() {
            return false;
        }

        if !is_retryable_messaging_broker_error(err) {
            return false;
        }

        debug!(
            retry = core.retry_count,
            target = %core.target_peer_id,
            "retrying message delivery"
        );
        let message = core.retry_message.clone().expect("checked above");
        core.create_processing_task(&message.protocol, &message.payload);
        true
    }

    pub fn is_finished(&self) -> bool {
        self.inner.lock().unwrap().core.is_finished
    }

    pub fn is_ack_expected(&self) -> bool {
        self.inner.lock().unwrap().core.is_ack_expected
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().unwrap().core.pending_queue.len()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().unwrap().core.dispatcher.is_connected()
    }

    pub fn poll_timeout(&self) -> Duration {
        self.inner.lock().unwrap().core.poll_timeout
    }

    pub fn set_ack_timeout(&self, timeout: Duration) {
        self.inner.lock().unwrap().core.ack_timeout = timeout;
    }

    pub fn set_msg_timeout(&self, timeout: Duration) {
        self.inner.lock().unwrap().core.msg_timeout = timeout;
    }
}
