//! The broker backend: envelope validation, authorization and routed
//! dispatch of one inbound message.

use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use courier_data::SharedBlock;
use courier_errors::{BrokerErrorCode, Error, Result};
use courier_tasks::{Task, TaskContext};
use tracing::trace;
use uuid::Uuid;

use crate::{
    backend::{validate_backend_parameters, BackendCommandId, BackendProcessing, OperationId},
    dispatcher::AsyncBlockDispatcher,
    protocol::{
        protocol_validation_error, update_broker_protocol_message_in_block, BrokerProtocol,
        MessageType, PrincipalIdentityInfo, SecurityPrincipalData,
    },
    routing::PeerIdRoutingCache,
    security::{AuthorizationCache, SecurityPrincipal},
};

/// Replace the envelope's authentication token with the authenticated
/// security principal.
pub fn authorize_protocol_message(protocol: &mut BrokerProtocol, principal: &SecurityPrincipal) {
    let identity = protocol
        .principal_identity_info
        .get_or_insert_with(PrincipalIdentityInfo::default);
    identity.authentication_token = None;
    identity.security_principal = Some(SecurityPrincipalData {
        sid: principal.secure_identity.clone(),
        given_name: principal.given_name.clone(),
        family_name: principal.family_name.clone(),
        email: principal.email.clone(),
        type_id: principal.type_id.clone(),
    });
}

/// States of the broker task. Observable for diagnostics; transitions only
/// move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerTaskState {
    Preparation,
    Authorization,
    Dispatch,
    Process,
}

/// Processes one inbound message: parse and validate the envelope, maintain
/// the routing table for backend-only messages, authorize the sender when a
/// token is declared, rewrite the envelope and dispatch the block to the
/// target peer.
pub struct BrokerBackendTask {
    state: BrokerTaskState,
    routing: Arc<PeerIdRoutingCache>,
    authorization_cache: Option<Arc<AuthorizationCache>>,
    dispatcher: Weak<dyn AsyncBlockDispatcher>,
    data: SharedBlock,
    source_peer_id: Uuid,
    target_peer_id: Uuid,
}

impl BrokerBackendTask {
    pub fn new(
        routing: Arc<PeerIdRoutingCache>,
        authorization_cache: Option<Arc<AuthorizationCache>>,
        dispatcher: Weak<dyn AsyncBlockDispatcher>,
        data: SharedBlock,
        source_peer_id: Uuid,
        target_peer_id: Uuid,
    ) -> Self {
        BrokerBackendTask {
            state: BrokerTaskState::Preparation,
            routing,
            authorization_cache,
            dispatcher,
            data,
            source_peer_id,
            target_peer_id,
        }
    }

    pub fn state(&self) -> BrokerTaskState {
        self.state
    }

    fn parse_uuid(value: &str, what: &str) -> Result<Uuid> {
        value.parse::<Uuid>().map_err(|_| {
            protocol_validation_error(format!(
                "the {what} property is not in the expected UUID format"
            ))
        })
    }

    fn dispatcher(&self) -> Result<Arc<dyn AsyncBlockDispatcher>> {
        self.dispatcher.upgrade().ok_or_else(|| {
            Error::unexpected("host services do not provide block dispatching service")
        })
    }

    async fn process(&mut self, cx: &TaskContext) -> Result<()> {
        cx.check_cancel()?;

        // ── Preparation: parse and validate the envelope ──────────────────

        let mut protocol = {
            let block = self.data.lock();
            BrokerProtocol::from_block(&block)?
        };

        let message_type = MessageType::from_name(&protocol.message_type).ok_or_else(|| {
            protocol_validation_error(format!(
                "the message type specified is invalid '{}'",
                protocol.message_type
            ))
        })?;

        Self::parse_uuid(&protocol.message_id, "messageId")?;
        Self::parse_uuid(&protocol.conversation_id, "conversationId")?;

        let envelope_source = match protocol.source_peer_id.as_str() {
            "" => Uuid::nil(),
            value => Self::parse_uuid(value, "sourcePeerId")?,
        };
        let envelope_target = match protocol.target_peer_id.as_str() {
            "" => Uuid::nil(),
            value => Self::parse_uuid(value, "targetPeerId")?,
        };

        let is_backend_only = match message_type {
            MessageType::BackendAssociateTargetPeerId => {
                if envelope_source.is_nil() || envelope_target.is_nil() {
                    return Err(protocol_validation_error(
                        "the sourcePeerId and targetPeerId properties cannot be empty",
                    ));
                }

                // A target that is directly connected must not be shadowed by
                // proxy routing; the proxy may keep re-associating stale ids.
                let directly_connected = self
                    .dispatcher()?
                    .try_get_message_block_completion_queue(envelope_target)
                    .is_some();
                if directly_connected {
                    trace!(
                        peer = %envelope_target,
                        "associate message ignored as the peer is directly connected"
                    );
                } else {
                    self.routing
                        .associate_target_peer_id(envelope_source, envelope_target);
                }
                true
            }
            MessageType::BackendDissociateTargetPeerId => {
                if envelope_target.is_nil() {
                    return Err(protocol_validation_error(
                        "the targetPeerId property cannot be empty",
                    ));
                }
                // A missing mapping is not an error.
                let _ = self.routing.dissociate_target_peer_id(envelope_target);
                true
            }
            _ => false,
        };

        if is_backend_only {
            // Backend-only messages are IN only: no output block, no dispatch.
            self.state = BrokerTaskState::Process;
            return Ok(());
        }

        let effective_target = if !self.target_peer_id.is_nil() {
            self.target_peer_id
        } else {
            envelope_target
        };
        if effective_target.is_nil() {
            return Err(protocol_validation_error(
                "the targetPeerId property is required for routed messages",
            ));
        }
        let resolved_target = self
            .routing
            .try_resolve_target_peer_id(effective_target)
            .unwrap_or(Uuid::nil());

        // ── Authorization, when the envelope declares a token ─────────────

        let inbound_token = match &protocol.principal_identity_info {
            None => None,
            Some(identity) => {
                if identity.security_principal.is_some() {
                    return Err(protocol_validation_error(
                        "security principal info cannot be provided as input",
                    ));
                }
                let token = identity.authentication_token.clone().ok_or_else(|| {
                    protocol_validation_error("authentication token information is required")
                })?;
                Some(token)
            }
        };

        if let Some(token) = inbound_token {
            let cache = self.authorization_cache.clone().ok_or_else(|| {
                protocol_validation_error(format!(
                    "the specified authentication token type '{}' is invalid or not supported",
                    token.token_type
                ))
            })?;
            if cache.token_type() != token.token_type {
                return Err(protocol_validation_error(format!(
                    "the specified authentication token type '{}' is invalid or not supported",
                    token.token_type
                )));
            }

            let principal = match cache.try_get_authorized_principal(token.data.as_bytes()) {
                Some(principal) => principal,
                None => {
                    // Cache miss: the actual authorization runs as a sub-step
                    // and updates the cache on success.
                    self.state = BrokerTaskState::Authorization;
                    cx.check_cancel()?;
                    cache.update(token.data.as_bytes()).await.map_err(|e| {
                        Error::server_error(
                            BrokerErrorCode::AuthorizationFailed,
                            "broker backend operation failed to authorize the client",
                        )
                        .with_sensitive(token.data.clone())
                        .with_source(e)
                    })?
                }
            };

            authorize_protocol_message(&mut protocol, &principal);
        }

        // ── Dispatch: reserialize and hand over to the block dispatcher ───

        self.state = BrokerTaskState::Dispatch;
        {
            let mut block = self.data.lock();
            update_broker_protocol_message_in_block(
                &mut protocol,
                &mut block,
                self.source_peer_id,
                self.target_peer_id,
            )?;
        }

        let dispatch_target = if resolved_target.is_nil() {
            effective_target
        } else {
            resolved_target
        };

        let mut dispatch = self
            .dispatcher()?
            .create_dispatch_task(dispatch_target, self.data.clone())?;
        dispatch.run(cx).await?;

        self.state = BrokerTaskState::Process;
        Ok(())
    }
}

#[async_trait]
impl Task for BrokerBackendTask {
    fn name(&self) -> &str {
        "broker-backend"
    }

    async fn run(&mut self, cx: &TaskContext) -> Result<()> {
        self.process(cx).await
    }
}

// ── Backend implementation ────────────────────────────────────────────────────

/// The broker backend: authorizes and routes inbound messages between
/// peers. Does its own block dispatching.
pub struct BrokerBackendProcessing {
    routing: Arc<PeerIdRoutingCache>,
    authorization_cache: Option<Arc<AuthorizationCache>>,
    dispatcher: RwLock<Weak<dyn AsyncBlockDispatcher>>,
}

impl BrokerBackendProcessing {
    pub fn new(authorization_cache: Option<Arc<AuthorizationCache>>) -> Self {
        let unset: Weak<dyn AsyncBlockDispatcher> =
            Weak::<crate::dispatcher::InProcessBlockDispatcher>::new();
        BrokerBackendProcessing {
            routing: Arc::new(PeerIdRoutingCache::new()),
            authorization_cache,
            dispatcher: RwLock::new(unset),
        }
    }

    /// Wire in the host's block dispatcher. Held weakly; the dispatcher's
    /// owner outlives the backend's tasks.
    pub fn set_dispatcher(&self, dispatcher: &Arc<dyn AsyncBlockDispatcher>) {
        *self.dispatcher.write().unwrap() = Arc::downgrade(dispatcher);
    }

    pub fn routing(&self) -> &Arc<PeerIdRoutingCache> {
        &self.routing
    }
}

impl BackendProcessing for BrokerBackendProcessing {
    fn auto_block_dispatching(&self) -> bool {
        false
    }

    fn create_backend_processing_task(
        &self,
        operation_id: OperationId,
        command_id: BackendCommandId,
        session_id: Uuid,
        chunk_id: Uuid,
        source_peer_id: Uuid,
        target_peer_id: Uuid,
        data: Option<SharedBlock>,
    ) -> Result<Box<dyn Task>> {
        validate_backend_parameters(operation_id, command_id, session_id, chunk_id)?;

        let data = data.ok_or_else(|| {
            Error::new(
                courier_errors::ErrorKind::ArgumentNull,
                "broker processing requires a data block",
            )
        })?;

        Ok(Box::new(BrokerBackendTask::new(
            Arc::clone(&self.routing),
            self.authorization_cache.clone(),
            self.dispatcher.read().unwrap().clone(),
            data,
            source_peer_id,
            target_peer_id,
        )))
    }

    fn peer_connected_notify(&self, peer_id: Uuid) -> Result<()> {
        // Peers connecting directly to the backend must not be shadowed by
        // proxy routing.
        if self.routing.dissociate_target_peer_id(peer_id) {
            trace!(
                peer = %peer_id,
                "peer removed from the routing table as it has connected directly to the backend"
            );
        }
        Ok(())
    }
}
