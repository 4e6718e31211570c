//! RocksDB-backed update log.
//!
//! Column families:
//! - `updates` — LZ4-compressed deltas keyed by `name_len:u32 BE • name • id:u64 BE`
//! - `meta`    — next insertion id
//!
//! The length prefix keeps one document's keys contiguous and prevents a
//! name from prefix-matching a longer one. Ids are global, so key order
//! within a document is insertion order.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};

use super::{LogEntry, StoreError, UpdateLog};

const CF_UPDATES: &str = "updates";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_UPDATES, CF_META];

const NEXT_ID_KEY: &[u8] = b"next_id";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("coedit_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), ..Self::default() }
    }

    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Update log stored in RocksDB. Clones share the same database.
#[derive(Clone)]
pub struct RocksUpdateLog {
    db: Arc<DBWithThreadMode<SingleThreaded>>,
    config: StoreConfig,
    /// Next id to hand out. Held across the write so ids hit disk in order.
    next_id: Arc<Mutex<u64>>,
}

impl RocksUpdateLog {
    /// Open (or create) the log at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
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

        let next_id = Self::recover_next_id(&db)?;
        log::info!(
            "Opened update log at {} (next id {next_id})",
            config.path.display()
        );

        Ok(Self {
            db: Arc::new(db),
            config,
            next_id: Arc::new(Mutex::new(next_id)),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_UPDATES => {
                let mut block_opts = BlockBasedOptions::default();
                let cache = Cache::new_lru_cache(config.block_cache_size);
                block_opts.set_block_cache(&cache);
                block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
                block_opts.set_block_size(16 * 1024);
                opts.set_block_based_table_factory(&block_opts);
                // Values are already LZ4 compressed.
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            CF_META => {
                opts.set_max_write_buffer_number(2);
            }
            _ => {}
        }

        opts
    }

    fn recover_next_id(db: &DBWithThreadMode<SingleThreaded>) -> Result<u64, StoreError> {
        let cf = db
            .cf_handle(CF_META)
            .ok_or_else(|| StoreError::Database(format!("Column family '{CF_META}' not found")))?;
        match db.get_cf(&cf, NEXT_ID_KEY)? {
            Some(bytes) => decode_u64(&bytes),
            None => Ok(0),
        }
    }

    // ─── Log operations ───────────────────────────────────────────────

    pub fn append_blocking(&self, doc_name: &str, update: &[u8]) -> Result<u64, StoreError> {
        let cf_updates = self.cf(CF_UPDATES)?;
        let cf_meta = self.cf(CF_META)?;

        let mut next_id = self.next_id.lock();
        let id = *next_id;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_updates, entry_key(doc_name, id), lz4_flex::compress_prepend_size(update));
        batch.put_cf(&cf_meta, NEXT_ID_KEY, (id + 1).to_be_bytes());
        self.db.write_opt(batch, &self.write_options())?;

        *next_id = id + 1;
        Ok(id)
    }

    pub fn list_blocking(&self, doc_name: &str) -> Result<Vec<LogEntry>, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let prefix = name_prefix(doc_name);

        let mut entries = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) || key.len() != prefix.len() + 8 {
                break;
            }
            let id = decode_u64(&key[prefix.len()..])?;
            let update = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::Compression(e.to_string()))?;
            entries.push(LogEntry { id, doc_name: doc_name.to_string(), update });
        }

        Ok(entries)
    }

    pub fn replace_blocking(
        &self,
        doc_name: &str,
        merged: &[u8],
        superseded: &[u64],
    ) -> Result<LogEntry, StoreError> {
        let cf_updates = self.cf(CF_UPDATES)?;
        let cf_meta = self.cf(CF_META)?;

        let mut next_id = self.next_id.lock();
        let id = *next_id;

        // Insert and delete land in one batch: either both or neither.
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_updates, entry_key(doc_name, id), lz4_flex::compress_prepend_size(merged));
        for old in superseded {
            batch.delete_cf(&cf_updates, entry_key(doc_name, *old));
        }
        batch.put_cf(&cf_meta, NEXT_ID_KEY, (id + 1).to_be_bytes());
        self.db.write_opt(batch, &self.write_options())?;

        *next_id = id + 1;
        Ok(LogEntry { id, doc_name: doc_name.to_string(), update: merged.to_vec() })
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }
}

impl RocksUpdateLog {
    /// Run a blocking operation on the blocking thread pool.
    async fn offload<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&RocksUpdateLog) -> Result<T, StoreError> + Send + 'static,
    {
        let log = self.clone();
        tokio::task::spawn_blocking(move || op(&log))
            .await
            .map_err(|e| StoreError::Database(format!("blocking task failed: {e}")))?
    }
}

#[async_trait]
impl UpdateLog for RocksUpdateLog {
    async fn append(&self, doc_name: &str, update: Vec<u8>) -> Result<u64, StoreError> {
        let name = doc_name.to_string();
        self.offload(move |log| log.append_blocking(&name, &update)).await
    }

    async fn list_ordered(&self, doc_name: &str) -> Result<Vec<LogEntry>, StoreError> {
        let name = doc_name.to_string();
        self.offload(move |log| log.list_blocking(&name)).await
    }

    async fn insert_and_delete_atomically(
        &self,
        doc_name: &str,
        merged: Vec<u8>,
        superseded: &[u64],
    ) -> Result<LogEntry, StoreError> {
        let name = doc_name.to_string();
        let superseded = superseded.to_vec();
        self.offload(move |log| log.replace_blocking(&name, &merged, &superseded))
            .await
    }
}

fn name_prefix(doc_name: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(4 + doc_name.len());
    prefix.extend_from_slice(&(doc_name.len() as u32).to_be_bytes());
    prefix.extend_from_slice(doc_name.as_bytes());
    prefix
}

fn entry_key(doc_name: &str, id: u64) -> Vec<u8> {
    let mut key = name_prefix(doc_name);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn decode_u64(bytes: &[u8]) -> Result<u64, StoreError> {
    let buf: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::Corrupt(format!("expected 8 bytes, got {}", bytes.len())))?;
    Ok(u64::from_be_bytes(buf))
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
