//! The synchronous chunk-storage contract and its in-memory / on-disk
//! implementations.

use std::{
    collections::{HashMap, HashSet},
    fs, io,
    path::PathBuf,
    sync::Mutex,
};

use courier_errors::{Error, Result};
use tracing::debug;
use uuid::Uuid;

use crate::DataBlock;

/// Address-for-content storage of data blocks, accessed synchronously.
///
/// `load` fills the destination block (payload plus header bytes, with the
/// stored `offset1` restored); `save` persists the block's current content.
/// Implementations are free to ignore the session id, but session-scoped
/// stores drop a session's chunks on `flush_peer_sessions`.
pub trait DataChunkStorage: Send + Sync {
    fn load(&self, session_id: Uuid, chunk_id: Uuid, data: &mut DataBlock) -> Result<()>;
    fn save(&self, session_id: Uuid, chunk_id: Uuid, data: &DataBlock) -> Result<()>;
    fn remove(&self, session_id: Uuid, chunk_id: Uuid) -> Result<()>;
    fn flush_peer_sessions(&self, peer_id: Uuid) -> Result<()>;
}

// ── In-memory storage ─────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryState {
    /// chunk id → (content, offset1)
    chunks: HashMap<Uuid, (Vec<u8>, usize)>,
    /// session id → chunk ids saved under it
    sessions: HashMap<Uuid, HashSet<Uuid>>,
}

/// In-memory [`DataChunkStorage`], used by tests and as the write-behind
/// store of small deployments.
#[derive(Default)]
pub struct MemoryChunkStorage {
    state: Mutex<MemoryState>,
}

impl MemoryChunkStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, chunk_id: Uuid) -> bool {
        self.state.lock().unwrap().chunks.contains_key(&chunk_id)
    }

    pub fn chunk_count(&self) -> usize {
        self.state.lock().unwrap().chunks.len()
    }
}

impl DataChunkStorage for MemoryChunkStorage {
    fn load(&self, _session_id: Uuid, chunk_id: Uuid, data: &mut DataBlock) -> Result<()> {
        let state = self.state.lock().unwrap();
        let (content, offset1) = state
            .chunks
            .get(&chunk_id)
            .ok_or_else(|| Error::not_found(format!("chunk '{chunk_id}' does not exist")))?;
        data.reset();
        data.write(content);
        data.set_offset1(*offset1);
        Ok(())
    }

    fn save(&self, session_id: Uuid, chunk_id: Uuid, data: &DataBlock) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .chunks
            .insert(chunk_id, (data.as_slice().to_vec(), data.offset1()));
        if !session_id.is_nil() {
            state.sessions.entry(session_id).or_default().insert(chunk_id);
        }
        Ok(())
    }

    fn remove(&self, _session_id: Uuid, chunk_id: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .chunks
            .remove(&chunk_id)
            .ok_or_else(|| Error::not_found(format!("chunk '{chunk_id}' does not exist")))?;
        for chunks in state.sessions.values_mut() {
            chunks.remove(&chunk_id);
        }
        Ok(())
    }

    fn flush_peer_sessions(&self, peer_id: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if peer_id.is_nil() {
            // Nil peer flushes every session-scoped chunk.
            let chunk_ids: Vec<Uuid> = state
                .sessions
                .values()
                .flat_map(|c| c.iter().copied())
                .collect();
            for chunk_id in chunk_ids {
                state.chunks.remove(&chunk_id);
            }
            state.sessions.clear();
        } else if let Some(chunks) = state.sessions.remove(&peer_id) {
            for chunk_id in chunks {
                state.chunks.remove(&chunk_id);
            }
        }
        Ok(())
    }
}

// ── Filesystem storage ────────────────────────────────────────────────────────

/// One-file-per-chunk [`DataChunkStorage`] under a root directory.
///
/// Files are named `<chunk-uuid>.chunk` and store `offset1` as an 8-byte
/// big-endian prefix. The set of stored chunk ids is re-derivable by
/// scanning the directory, which is what a proxy cache does after a crash.
pub struct FsChunkStorage {
    root: PathBuf,
}

impl FsChunkStorage {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| io_error(e, &root.display().to_string(), "create"))?;
        Ok(FsChunkStorage { root })
    }

    fn chunk_path(&self, chunk_id: Uuid) -> PathBuf {
        self.root.join(format!("{chunk_id}.chunk"))
    }

    /// Scan the root directory and return every stored chunk id.
    pub fn scan_chunk_ids(&self) -> Result<HashSet<Uuid>> {
        let mut ids = HashSet::new();
        let entries = fs::read_dir(&self.root)
            .map_err(|e| io_error(e, &self.root.display().to_string(), "read"))?;
        for entry in entries {
            let entry = entry.map_err(|e| io_error(e, &self.root.display().to_string(), "read"))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(stem) = name.strip_suffix(".chunk") {
                if let Ok(id) = stem.parse::<Uuid>() {
                    ids.insert(id);
                }
            }
        }
        debug!(count = ids.len(), root = %self.root.display(), "scanned chunk store");
        Ok(ids)
    }
}

fn io_error(e: io::Error, file_name: &str, mode: &str) -> Error {
    Error::from(e).with_file_name(file_name).with_message_property(format!("open mode: {mode}"))
}

impl DataChunkStorage for FsChunkStorage {
    fn load(&self, _session_id: Uuid, chunk_id: Uuid, data: &mut DataBlock) -> Result<()> {
        let path = self.chunk_path(chunk_id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::not_found(format!("chunk '{chunk_id}' does not exist")))
            }
            Err(e) => return Err(io_error(e, &path.display().to_string(), "read")),
        };
        if bytes.len() < 8 {
            return Err(Error::new(
                courier_errors::ErrorKind::InvalidDataFormat,
                format!("chunk file '{}' is truncated", path.display()),
            ));
        }
        let offset1 = u64::from_be_bytes(bytes[..8].try_into().unwrap()) as usize;
        let content = &bytes[8..];
        if offset1 > content.len() {
            return Err(Error::new(
                courier_errors::ErrorKind::InvalidDataFormat,
                format!("chunk file '{}' has a corrupt offset", path.display()),
            ));
        }
        data.reset();
        data.write(content);
        data.set_offset1(offset1);
        Ok(())
    }

    fn save(&self, _session_id: Uuid, chunk_id: Uuid, data: &DataBlock) -> Result<()> {
        let path = self.chunk_path(chunk_id);
        let mut bytes = Vec::with_capacity(8 + data.size());
        bytes.extend_from_slice(&(data.offset1() as u64).to_be_bytes());
        bytes.extend_from_slice(data.as_slice());
        fs::write(&path, bytes).map_err(|e| io_error(e, &path.display().to_string(), "write"))
    }

    fn remove(&self, _session_id: Uuid, chunk_id: Uuid) -> Result<()> {
        let path = self.chunk_path(chunk_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(Error::not_found(format!("chunk '{chunk_id}' does not exist")))
            }
            Err(e) => Err(io_error(e, &path.display().to_string(), "remove")),
        }
    }

    fn flush_peer_sessions(&self, _peer_id: Uuid) -> Result<()> {
        // The on-disk store keeps no per-session state.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_with(payload: &[u8], header: &[u8]) -> DataBlock {
        let mut block = DataBlock::new(64);
        block.set_parts(payload, header);
        block
    }

    #[test]
    fn memory_save_load_round_trip() {
        let storage = MemoryChunkStorage::new();
        let chunk_id = Uuid::new_v4();
        let block = block_with(b"content", b"{\"h\":1}");

        storage.save(Uuid::nil(), chunk_id, &block).unwrap();

        let mut loaded = DataBlock::new(64);
        storage.load(Uuid::nil(), chunk_id, &mut loaded).unwrap();
        assert_eq!(loaded.payload(), b"content");
        assert_eq!(loaded.header_bytes(), b"{\"h\":1}");
    }

    #[test]
    fn memory_load_missing_is_not_found() {
        let storage = MemoryChunkStorage::new();
        let mut block = DataBlock::new(16);
        let err = storage.load(Uuid::nil(), Uuid::new_v4(), &mut block).unwrap_err();
        assert_eq!(err.kind(), courier_errors::ErrorKind::NotFound);
    }

    #[test]
    fn memory_flush_drops_session_chunks_only() {
        let storage = MemoryChunkStorage::new();
        let session = Uuid::new_v4();
        let scoped = Uuid::new_v4();
        let global = Uuid::new_v4();

        storage.save(session, scoped, &block_with(b"a", b"")).unwrap();
        storage.save(Uuid::nil(), global, &block_with(b"b", b"")).unwrap();

        storage.flush_peer_sessions(session).unwrap();
        assert!(!storage.contains(scoped));
        assert!(storage.contains(global));
    }

    #[test]
    fn fs_round_trip_and_rescan() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsChunkStorage::new(dir.path()).unwrap();
        let chunk_id = Uuid::new_v4();

        storage
            .save(Uuid::nil(), chunk_id, &block_with(b"bytes", b"{}"))
            .unwrap();

        let mut loaded = DataBlock::new(16);
        storage.load(Uuid::nil(), chunk_id, &mut loaded).unwrap();
        assert_eq!(loaded.payload(), b"bytes");
        assert_eq!(loaded.header_bytes(), b"{}");

        // A fresh instance re-derives the index from directory content.
        let reopened = FsChunkStorage::new(dir.path()).unwrap();
        let ids = reopened.scan_chunk_ids().unwrap();
        assert!(ids.contains(&chunk_id));

        storage.remove(Uuid::nil(), chunk_id).unwrap();
        assert!(reopened.scan_chunk_ids().unwrap().is_empty());
    }
}
