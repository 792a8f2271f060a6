//! The backend-processing contract: one uniform task factory behind which
//! the broker, storage and forwarding backends live.

use std::sync::Weak;

use courier_data::SharedBlock;
use courier_errors::{Error, Result};
use courier_tasks::{FnTask, Task};
use uuid::Uuid;

use crate::dispatcher::AsyncBlockDispatcher;

/// Coarse-grained backend operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationId {
    Alloc,
    SecureAlloc,
    SecureDiscard,
    Get,
    Put,
    AuthenticateClient,
    GetServerState,
    Command,
}

/// Secondary command carried by [`OperationId::Command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendCommandId {
    None,
    Remove,
    FlushPeerSessions,
}

/// Shared parameter validation for every backend implementation.
///
/// Get/Put and Command.Remove address a concrete chunk; FlushPeerSessions
/// must not.
pub fn validate_backend_parameters(
    operation_id: OperationId,
    command_id: BackendCommandId,
    _session_id: Uuid,
    chunk_id: Uuid,
) -> Result<()> {
    match operation_id {
        OperationId::Get | OperationId::Put => {
            if chunk_id.is_nil() {
                return Err(Error::argument(format!(
                    "{operation_id:?} operation requires a chunk id"
                )));
            }
        }
        OperationId::Command => match command_id {
            BackendCommandId::Remove => {
                if chunk_id.is_nil() {
                    return Err(Error::argument("Remove command requires a chunk id"));
                }
            }
            BackendCommandId::FlushPeerSessions => {
                if !chunk_id.is_nil() {
                    return Err(Error::argument(
                        "FlushPeerSessions command must not carry a chunk id",
                    ));
                }
            }
            BackendCommandId::None => {
                return Err(Error::argument("Command operation requires a command id"));
            }
        },
        _ => {}
    }
    Ok(())
}

/// The uniform backend contract the wire server drives.
///
/// The factory call is non-blocking; the returned task encapsulates all I/O
/// and compute for the operation and may rewrite the data block it was
/// handed.
pub trait BackendProcessing: Send + Sync {
    /// Whether the server driver should answer successful operations with
    /// the (possibly rewritten) block. The broker backend dispatches blocks
    /// itself and returns `false`.
    fn auto_block_dispatching(&self) -> bool {
        true
    }

    #[allow(clippy::too_many_arguments)]
    fn create_backend_processing_task(
        &self,
        operation_id: OperationId,
        command_id: BackendCommandId,
        session_id: Uuid,
        chunk_id: Uuid,
        source_peer_id: Uuid,
        target_peer_id: Uuid,
        data: Option<SharedBlock>,
    ) -> Result<Box<dyn Task>>;

    /// A peer opened a direct connection. Synchronous; completes before the
    /// connection serves commands.
    fn peer_connected_notify(&self, _peer_id: Uuid) -> Result<()> {
        Ok(())
    }

    /// A peer's connection went away.
    fn peer_disconnected_notify(&self, _peer_id: Uuid) -> Result<()> {
        Ok(())
    }
}

// ── Forwarding backend ────────────────────────────────────────────────────────

/// Backend that hands every inbound block straight to the block dispatcher
/// on the same process, without broker-envelope processing.
pub struct ForwardingBackend {
    dispatcher: Weak<dyn AsyncBlockDispatcher>,
}

impl ForwardingBackend {
    pub fn new(dispatcher: Weak<dyn AsyncBlockDispatcher>) -> Self {
        ForwardingBackend { dispatcher }
    }
}

impl BackendProcessing for ForwardingBackend {
    fn auto_block_dispatching(&self) -> bool {
        false
    }

    fn create_backend_processing_task(
        &self,
        operation_id: OperationId,
        command_id: BackendCommandId,
        session_id: Uuid,
        chunk_id: Uuid,
        _source_peer_id: Uuid,
        target_peer_id: Uuid,
        data: Option<SharedBlock>,
    ) -> Result<Box<dyn Task>> {
        validate_backend_parameters(operation_id, command_id, session_id, chunk_id)?;

        let data = data.ok_or_else(|| {
            Error::new(
                courier_errors::ErrorKind::ArgumentNull,
                "forwarding requires a data block",
            )
        })?;
        let dispatcher = self.dispatcher.clone();

        Ok(Box::new(FnTask::new("forward-block", move |cx| async move {
            let dispatcher = dispatcher.upgrade().ok_or_else(|| {
                Error::unexpected("host services do not provide block dispatching service")
            })?;
            let mut dispatch = dispatcher.create_dispatch_task(target_peer_id, data)?;
            dispatch.run(&cx).await
        })))
    }
}
