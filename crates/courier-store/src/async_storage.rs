//! Nonblocking facade over the synchronous chunk-storage contract.
//!
//! Storage calls run on the blocking pool; a semaphore caps how many
//! operations execute concurrently and excess submissions queue on it.
//! Implements the backend-processing contract, so a wire server can put a
//! plain chunk store straight behind a connection.

use std::sync::Arc;

use courier_broker::{
    validate_backend_parameters, BackendCommandId, BackendProcessing, OperationId,
};
use courier_data::{BlockPool, DataBlock, DataChunkStorage, SharedBlock};
use courier_errors::{Error, ErrorKind, Result};
use courier_tasks::{ControlToken, FnTask, Task};
use tracing::trace;
use uuid::Uuid;

/// Callback invoked with a data block for client authentication and
/// server-state queries. The result is materialized back into the block.
pub type BlockCallback = Arc<dyn Fn(&mut DataBlock) -> Result<()> + Send + Sync>;

pub struct AsyncChunkStorageOptions {
    /// Cap on concurrently executing storage operations.
    pub max_concurrent_operations: usize,
    pub authentication_callback: Option<BlockCallback>,
    pub server_state_callback: Option<BlockCallback>,
}

impl Default for AsyncChunkStorageOptions {
    fn default() -> Self {
        AsyncChunkStorageOptions {
            max_concurrent_operations: 16,
            authentication_callback: None,
            server_state_callback: None,
        }
    }
}

/// The data-chunk-storage backend: adapts separate read and write
/// [`DataChunkStorage`] handles to the task model.
pub struct AsyncChunkStorage {
    read_storage: Arc<dyn DataChunkStorage>,
    write_storage: Arc<dyn DataChunkStorage>,
    pool: BlockPool,
    semaphore: Arc<tokio::sync::Semaphore>,
    control_token: ControlToken,
    authentication_callback: Option<BlockCallback>,
    server_state_callback: Option<BlockCallback>,
}

impl AsyncChunkStorage {
    pub fn new(
        read_storage: Arc<dyn DataChunkStorage>,
        write_storage: Arc<dyn DataChunkStorage>,
        pool: BlockPool,
        control_token: ControlToken,
        options: AsyncChunkStorageOptions,
    ) -> Self {
        AsyncChunkStorage {
            read_storage,
            write_storage,
            pool,
            semaphore: Arc::new(tokio::sync::Semaphore::new(
                options.max_concurrent_operations.max(1),
            )),
            control_token,
            authentication_callback: options.authentication_callback,
            server_state_callback: options.server_state_callback,
        }
    }

    /// Single-store convenience constructor.
    pub fn with_storage(storage: Arc<dyn DataChunkStorage>, control_token: ControlToken) -> Self {
        Self::new(
            Arc::clone(&storage),
            storage,
            BlockPool::default(),
            control_token,
            AsyncChunkStorageOptions::default(),
        )
    }

    pub fn control_token(&self) -> &ControlToken {
        &self.control_token
    }

    /// Run a blocking storage closure under the concurrency cap.
    async fn run_blocking<F>(
        semaphore: Arc<tokio::sync::Semaphore>,
        token: ControlToken,
        body: F,
    ) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        token.check()?;
        let _permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| Error::disposed("async storage"))?;
        token.check()?;

        match tokio::task::spawn_blocking(body).await {
            Ok(result) => result,
            Err(join) => Err(Error::unexpected(format!(
                "storage operation aborted: {join}"
            ))),
        }
    }
}

impl BackendProcessing for AsyncChunkStorage {
    fn create_backend_processing_task(
        &self,
        operation_id: OperationId,
        command_id: BackendCommandId,
        session_id: Uuid,
        chunk_id: Uuid,
        _source_peer_id: Uuid,
        _target_peer_id: Uuid,
        data: Option<SharedBlock>,
    ) -> Result<Box<dyn Task>> {
        validate_backend_parameters(operation_id, command_id, session_id, chunk_id)?;

        debug_assert!(
            !matches!(operation_id, OperationId::Get | OperationId::Put) || !chunk_id.is_nil()
        );

        let semaphore = Arc::clone(&self.semaphore);
        let token = self.control_token.clone();

        let require_data = |data: Option<SharedBlock>| {
            data.ok_or_else(|| {
                Error::new(
                    ErrorKind::ArgumentNull,
                    format!("{operation_id:?} operation was scheduled without data"),
                )
            })
        };
        let require_no_data = |data: &Option<SharedBlock>| {
            if data.is_some() {
                Err(Error::argument(format!(
                    "{command_id:?} command must not carry data"
                )))
            } else {
                Ok(())
            }
        };

        let body: Box<dyn FnOnce() -> Result<()> + Send> = match operation_id {
            OperationId::Get => {
                let data = require_data(data)?;
                let storage = Arc::clone(&self.read_storage);
                Box::new(move || {
                    let mut block = data.lock();
                    storage.load(session_id, chunk_id, &mut block)
                })
            }
            OperationId::Put => {
                let data = require_data(data)?;
                let storage = Arc::clone(&self.write_storage);
                Box::new(move || {
                    let block = data.lock();
                    storage.save(session_id, chunk_id, &block)
                })
            }
            OperationId::Command => {
                let storage = Arc::clone(&self.write_storage);
                match command_id {
                    BackendCommandId::Remove => {
                        require_no_data(&data)?;
                        Box::new(move || storage.remove(session_id, chunk_id))
                    }
                    BackendCommandId::FlushPeerSessions => {
                        require_no_data(&data)?;
                        Box::new(move || storage.flush_peer_sessions(Uuid::nil()))
                    }
                    BackendCommandId::None => unreachable!("rejected by validation"),
                }
            }
            OperationId::Alloc | OperationId::SecureAlloc => {
                // Pool interaction only: hand out a reset block.
                let pool = self.pool.clone();
                Box::new(move || {
                    match data {
                        Some(data) => data.lock().reset(),
                        None => drop(pool.acquire()),
                    }
                    Ok(())
                })
            }
            OperationId::SecureDiscard => {
                let data = require_data(data)?;
                let pool = self.pool.clone();
                Box::new(move || {
                    let mut block = data.lock();
                    block.zero();
                    pool.release(block.clone());
                    Ok(())
                })
            }
            OperationId::AuthenticateClient => {
                let data = require_data(data)?;
                let callback = self.authentication_callback.clone().ok_or_else(|| {
                    Error::new(
                        ErrorKind::NotSupported,
                        "client authentication is not configured",
                    )
                })?;
                Box::new(move || {
                    let mut block = data.lock();
                    callback(&mut block)
                })
            }
            OperationId::GetServerState => {
                let data = require_data(data)?;
                let callback = self.server_state_callback.clone().ok_or_else(|| {
                    Error::new(
                        ErrorKind::NotSupported,
                        "server state queries are not configured",
                    )
                })?;
                Box::new(move || {
                    let mut block = data.lock();
                    callback(&mut block)
                })
            }
        };

        trace!(?operation_id, %chunk_id, "scheduling storage operation");
        Ok(Box::new(FnTask::new("chunk-storage", move |_cx| async move {
            Self::run_blocking(semaphore, token, body).await
        })))
    }
}
