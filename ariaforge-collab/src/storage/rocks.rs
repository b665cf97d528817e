//! RocksDB-backed session store.
//!
//! Column families:
//! - `documents` : Flushed project documents (LZ4 compressed, keyed by project_id)
//! - `snapshots` : Session compaction snapshots (LZ4 compressed, keyed by session_id)
//! - `operations`: Session log entries (keyed by session_id:global_seq)
//! - `metadata`  : Per-project flush bookkeeping
//!
//! Operation keys are `<session_id:16 bytes><global_seq:8 bytes big-endian>`,
//! so a forward scan from `(session, seq)` yields entries in sequence order.

use ariaforge_core::Document;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use uuid::Uuid;

use super::{decode_value, encode_value, SessionStore, StoreError};
use crate::oplog::LogEntry;

/// Column family names.
const CF_DOCUMENTS: &str = "documents";
const CF_SNAPSHOTS: &str = "snapshots";
const CF_OPERATIONS: &str = "operations";
const CF_METADATA: &str = "metadata";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_SNAPSHOTS, CF_OPERATIONS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("ariaforge_data"),
            block_cache_size: 256 * 1024 * 1024, // 256MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024, // 64MB
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024, // 8MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024, // 4MB
        }
    }
}

/// Bookkeeping written alongside each flushed project document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectMetadata {
    pub project_id: Uuid,
    /// Document version at the last flush
    pub version: u64,
    /// Number of sessions flushed into this project
    pub flush_count: u64,
    /// Uncompressed document size in bytes
    pub document_size: u64,
    /// Compressed document size in bytes
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl ProjectMetadata {
    fn new(project_id: Uuid) -> Self {
        let now = unix_now();
        Self {
            project_id,
            version: 0,
            flush_count: 0,
            document_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// RocksDB-backed [`SessionStore`].
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes document writes per project
    project_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl RocksStore {
    /// Open the store at the configured path, creating the database and
    /// column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024); // 128MB WAL limit
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened session store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            project_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024); // 16KB blocks
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS | CF_SNAPSHOTS => {
                // Values are already LZ4 compressed
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_OPERATIONS => {
                // Many small appends, prefix-scanned by session_id
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush bookkeeping for a project, if it was ever flushed.
    pub fn load_metadata(&self, project_id: Uuid) -> Result<Option<ProjectMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, project_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode_value(&bytes)?)),
            None => Ok(None),
        }
    }

    /// List all flushed project IDs.
    pub fn list_projects(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let bytes: [u8; 16] = key
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::Deserialization("Invalid UUID key".into()))?;
            ids.push(Uuid::from_bytes(bytes));
        }
        Ok(ids)
    }

    /// Force memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        for name in COLUMN_FAMILIES {
            self.db.flush_cf(self.cf(name)?)?;
        }
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn project_lock(&self, project_id: Uuid) -> Result<Arc<Mutex<()>>, StoreError> {
        let mut locks = self
            .project_locks
            .lock()
            .map_err(|_| StoreError::Unavailable("project lock table poisoned".into()))?;
        Ok(locks.entry(project_id).or_default().clone())
    }

    /// Keys of a session's stored entries with `global_seq > after_seq`.
    fn operation_keys_after(&self, session_id: Uuid, after_seq: u64) -> Result<Vec<Box<[u8]>>, StoreError> {
        let cf = self.cf(CF_OPERATIONS)?;
        let start = operation_key(session_id, after_seq.saturating_add(1));
        let mut keys = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(&start, Direction::Forward)) {
            let (key, _) = item?;
            if key.len() < 24 || &key[..16] != session_id.as_bytes() {
                break;
            }
            keys.push(key);
        }
        Ok(keys)
    }

    /// Keys of a session's stored entries with `global_seq <= upto`.
    fn operation_keys_upto(&self, session_id: Uuid, upto: u64) -> Result<Vec<Box<[u8]>>, StoreError> {
        let cf = self.cf(CF_OPERATIONS)?;
        let start = operation_key(session_id, 0);
        let end = operation_key(session_id, upto);
        let mut keys = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(&start, Direction::Forward)) {
            let (key, _) = item?;
            if key.len() < 24 || &key[..16] != session_id.as_bytes() || key.as_ref() > end.as_slice() {
                break;
            }
            keys.push(key);
        }
        Ok(keys)
    }
}

impl SessionStore for RocksStore {
    fn load_document(&self, project_id: Uuid) -> Result<Document, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(cf, project_id.as_bytes())? {
            Some(compressed) => decode_value(&decompress(&compressed)?),
            None => Ok(Document::new(project_id)),
        }
    }

    fn append_operations(&self, session_id: Uuid, entries: &[LogEntry]) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let cf = self.cf(CF_OPERATIONS)?;
        let mut batch = WriteBatch::default();
        for entry in entries {
            batch.put_cf(cf, operation_key(session_id, entry.global_seq), encode_value(entry)?);
        }
        self.write(batch)
    }

    fn load_operations_since(&self, session_id: Uuid, seq: u64) -> Result<Vec<LogEntry>, StoreError> {
        let cf = self.cf(CF_OPERATIONS)?;
        let start = operation_key(session_id, seq.saturating_add(1));
        let mut entries = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(&start, Direction::Forward)) {
            let (key, value) = item?;
            if key.len() < 24 || &key[..16] != session_id.as_bytes() {
                break;
            }
            let entry = decode_value(&value).map_err(|e| {
                let seq = <[u8; 8]>::try_from(&key[16..24]).map(u64::from_be_bytes).unwrap_or_default();
                StoreError::Corrupted(format!("operation {seq} of session {session_id}: {e}"))
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    fn load_snapshot(&self, session_id: Uuid) -> Result<Option<(u64, Document)>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(cf, session_id.as_bytes())? {
            Some(compressed) => decompress(&compressed)
                .and_then(|bytes| decode_value(&bytes))
                .map(Some)
                .map_err(|e| StoreError::Corrupted(format!("snapshot of session {session_id}: {e}"))),
            None => Ok(None),
        }
    }

    fn save_snapshot(&self, session_id: Uuid, seq: u64, document: &Document) -> Result<(), StoreError> {
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_operations = self.cf(CF_OPERATIONS)?;

        let compressed = lz4_flex::compress_prepend_size(&encode_value(&(seq, document))?);

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_snapshots, session_id.as_bytes(), &compressed);
        for key in self.operation_keys_upto(session_id, seq)? {
            batch.delete_cf(cf_operations, key);
        }
        self.write(batch)
    }

    fn truncate_operations(&self, session_id: Uuid, after_seq: u64) -> Result<(), StoreError> {
        let cf = self.cf(CF_OPERATIONS)?;
        let keys = self.operation_keys_after(session_id, after_seq)?;
        if keys.is_empty() {
            return Ok(());
        }
        let mut batch = WriteBatch::default();
        for key in keys {
            batch.delete_cf(cf, key);
        }
        self.write(batch)
    }

    fn flush(&self, session_id: Uuid, project_id: Uuid, seq: u64, document: &Document) -> Result<(), StoreError> {
        let lock = self.project_lock(project_id)?;
        let _guard = lock
            .lock()
            .map_err(|_| StoreError::Unavailable(format!("write lock for project {project_id} poisoned")))?;

        let cf_documents = self.cf(CF_DOCUMENTS)?;
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_operations = self.cf(CF_OPERATIONS)?;
        let cf_metadata = self.cf(CF_METADATA)?;

        let encoded = encode_value(document)?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);

        let mut meta = self.load_metadata(project_id)?.unwrap_or_else(|| ProjectMetadata::new(project_id));
        meta.version = seq;
        meta.flush_count += 1;
        meta.document_size = encoded.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_now();

        // One atomic batch: the project moves forward and the session's
        // private state disappears together.
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_documents, project_id.as_bytes(), &compressed);
        batch.put_cf(cf_metadata, project_id.as_bytes(), encode_value(&meta)?);
        batch.delete_cf(cf_snapshots, session_id.as_bytes());
        for key in self.operation_keys_after(session_id, 0)? {
            batch.delete_cf(cf_operations, key);
        }
        self.write(batch)?;

        log::debug!("Flushed project {project_id} at version {seq} ({} bytes compressed)", meta.compressed_size);
        Ok(())
    }
}

/// Build an operation key: session_id (16 bytes) + global_seq (8 bytes big-endian).
fn operation_key(session_id: Uuid, global_seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(session_id.as_bytes());
    key.extend_from_slice(&global_seq.to_be_bytes());
    key
}

fn decompress(bytes: &[u8]) -> Result<Vec<u8>, StoreError> {
    lz4_flex::decompress_size_prepended(bytes).map_err(|e| StoreError::Compression(e.to_string()))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ariaforge_core::{Operation, OperationKind, TrackKind};
    use tempfile::TempDir;

    fn open_store() -> (RocksStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (store, dir)
    }

    /// `n` accepted entries plus the document they produce.
    fn entries(session_id: Uuid, project_id: Uuid, n: usize) -> (Vec<LogEntry>, Document) {
        let mut doc = Document::new(project_id);
        let mut out = Vec::new();
        for seq in 1..=n as u64 {
            let op = Operation::new(
                session_id,
                Uuid::new_v4(),
                seq - 1,
                OperationKind::InsertTrack {
                    track_id: Uuid::new_v4(),
                    index: None,
                    name: format!("Track {seq}"),
                    kind: TrackKind::Midi,
                    color: "#123456".into(),
                },
            );
            doc = doc.apply(&op.kind).unwrap();
            out.push(LogEntry::new(seq, op).unwrap());
        }
        (out, doc)
    }

    #[test]
    fn test_store_open_close() {
        let (store, dir) = open_store();
        assert!(store.path().exists());
        drop(store);
        RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    }

    #[test]
    fn test_missing_project_is_fresh_document() {
        let (store, _dir) = open_store();
        let project = Uuid::new_v4();
        let doc = store.load_document(project).unwrap();
        assert_eq!(doc.project_id(), project);
        assert_eq!(doc.version(), 0);
        assert!(store.load_metadata(project).unwrap().is_none());
    }

    #[test]
    fn test_operations_store_load() {
        let (store, _dir) = open_store();
        let session = Uuid::new_v4();
        let (ops, _) = entries(session, Uuid::new_v4(), 10);
        store.append_operations(session, &ops).unwrap();

        let all = store.load_operations_since(session, 0).unwrap();
        assert_eq!(all, ops);

        let since5 = store.load_operations_since(session, 5).unwrap();
        assert_eq!(since5.len(), 5);
        assert_eq!(since5[0].global_seq, 6);
        assert!(since5.iter().all(LogEntry::verify));
    }

    #[test]
    fn test_snapshot_drops_folded_operations() {
        let (store, _dir) = open_store();
        let session = Uuid::new_v4();
        let (ops, _) = entries(session, Uuid::new_v4(), 20);
        store.append_operations(session, &ops).unwrap();

        let (_, at_ten) = entries(session, Uuid::new_v4(), 10);
        store.save_snapshot(session, 10, &at_ten).unwrap();

        let (seq, loaded) = store.load_snapshot(session).unwrap().unwrap();
        assert_eq!(seq, 10);
        assert_eq!(loaded, at_ten);

        let remaining = store.load_operations_since(session, 0).unwrap();
        assert_eq!(remaining.len(), 10);
        assert_eq!(remaining[0].global_seq, 11);
    }

    #[test]
    fn test_truncate_operations() {
        let (store, _dir) = open_store();
        let session = Uuid::new_v4();
        let (ops, _) = entries(session, Uuid::new_v4(), 8);
        store.append_operations(session, &ops).unwrap();

        store.truncate_operations(session, 3).unwrap();
        let remaining = store.load_operations_since(session, 0).unwrap();
        assert_eq!(remaining.iter().map(|e| e.global_seq).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_flush_replaces_project_and_clears_session() {
        let (store, _dir) = open_store();
        let session = Uuid::new_v4();
        let project = Uuid::new_v4();
        let (ops, doc) = entries(session, project, 6);
        store.append_operations(session, &ops).unwrap();
        store.save_snapshot(session, 3, &doc).unwrap();

        store.flush(session, project, 6, &doc).unwrap();

        let loaded = store.load_document(project).unwrap();
        assert_eq!(loaded, doc);
        assert_eq!(loaded.version(), 6);
        assert!(store.load_snapshot(session).unwrap().is_none());
        assert!(store.load_operations_since(session, 0).unwrap().is_empty());

        let meta = store.load_metadata(project).unwrap().unwrap();
        assert_eq!(meta.version, 6);
        assert_eq!(meta.flush_count, 1);
        assert!(meta.compressed_size > 0);
        assert_eq!(store.list_projects().unwrap(), vec![project]);
    }

    #[test]
    fn test_sessions_isolated() {
        let (store, _dir) = open_store();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let (ops_a, _) = entries(a, Uuid::new_v4(), 5);
        let (ops_b, _) = entries(b, Uuid::new_v4(), 3);
        store.append_operations(a, &ops_a).unwrap();
        store.append_operations(b, &ops_b).unwrap();

        store.truncate_operations(a, 0).unwrap();
        assert!(store.load_operations_since(a, 0).unwrap().is_empty());
        assert_eq!(store.load_operations_since(b, 0).unwrap(), ops_b);
    }

    #[test]
    fn test_reopen_recovers_state() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::for_testing(dir.path());
        let session = Uuid::new_v4();
        let (ops, _) = entries(session, Uuid::new_v4(), 4);

        {
            let store = RocksStore::open(config.clone()).unwrap();
            store.append_operations(session, &ops).unwrap();
            store.sync().unwrap();
        }

        let store = RocksStore::open(config).unwrap();
        assert_eq!(store.load_operations_since(session, 0).unwrap(), ops);
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.block_cache_size, 256 * 1024 * 1024);
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(!config.sync_writes);
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::Unavailable("disk full".into());
        assert!(err.to_string().contains("unavailable"));

        let err = StoreError::Database("test".into());
        assert!(err.to_string().contains("Database error"));
    }

    #[test]
    fn test_undecodable_operation_is_corrupted() {
        let (store, _dir) = open_store();
        let session = Uuid::new_v4();
        let (ops, _) = entries(session, Uuid::new_v4(), 3);
        store.append_operations(session, &ops).unwrap();
        store
            .db
            .put_cf(store.cf(CF_OPERATIONS).unwrap(), operation_key(session, 2), [0xFF, 0xFF, 0xFF])
            .unwrap();

        match store.load_operations_since(session, 0) {
            Err(StoreError::Corrupted(msg)) => assert!(msg.contains("operation 2"), "{msg}"),
            other => panic!("Expected corruption, got {other:?}"),
        }
        // Entries before the damaged one still read back.
        assert_eq!(store.load_operations_since(session, 2).unwrap(), ops[2..].to_vec());
    }

    #[test]
    fn test_undecodable_snapshot_is_corrupted() {
        let (store, _dir) = open_store();
        let session = Uuid::new_v4();
        store
            .db
            .put_cf(store.cf(CF_SNAPSHOTS).unwrap(), session.as_bytes(), [0x03, 0x00, 0x00, 0x00, 0xFF])
            .unwrap();

        assert!(matches!(store.load_snapshot(session), Err(StoreError::Corrupted(_))));
    }

    #[tokio::test]
    async fn test_session_rebuilds_over_undecodable_operation() {
        use crate::identity::Role;
        use crate::session::{JoinOutcome, JoinRequest, SessionConfig, SessionHandle};

        let (store, _dir) = open_store();
        let store = Arc::new(store);
        let session = Uuid::new_v4();
        let project = Uuid::new_v4();
        let (ops, _) = entries(session, project, 3);
        store.append_operations(session, &ops).unwrap();
        store
            .db
            .put_cf(store.cf(CF_OPERATIONS).unwrap(), operation_key(session, 2), [0xFF, 0xFF, 0xFF])
            .unwrap();

        let handle = SessionHandle::spawn(session, project, store.clone(), SessionConfig::for_testing());
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        let outcome = handle
            .join(JoinRequest {
                user_id: Uuid::new_v4(),
                connection_id: Uuid::new_v4(),
                role: Role::Editor,
                project_id: project,
                last_known_sequence: Some(3),
                outbox: tx,
            })
            .await
            .unwrap();

        assert!(matches!(outcome, JoinOutcome::Snapshot { document_version: 0, resync: true, .. }));
        assert!(store.load_operations_since(session, 0).unwrap().is_empty());
        assert_eq!(store.load_snapshot(session).unwrap().map(|(seq, _)| seq), Some(0));
    }
}
