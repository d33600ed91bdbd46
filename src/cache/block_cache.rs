//! Block Cache - persistent cache tier
//!
//! Coordinates the insert pipeline, cache file rotation, admission control
//! and lookups.
//!
//! # Insert thread
//!
//! ```text
//!  WAIT_FOR_OP ──Exit──▶ STOP
//!      │ Flush ──▶ cut partial buffer ──▶ WAIT_FOR_OP
//!      ▼
//!  ENSURE_CURRENT_FILE ──▶ APPEND ──FileFull──▶ ROTATE ──▶ APPEND
//!                            │
//!                            └──NoBuffer──▶ cut own buffer, wait for release
//!                                           (exhausted: rotate once, then drop op)
//! ```
//!
//! Only the insert thread appends in pipelined mode, so rotation decisions
//! are serialized. The current file pointer and the reserved byte count
//! share one `RwLock`: rotation and reservation take it exclusively.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::bounded;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::allocator::{BufferAllocator, WriteBuffer};
use super::eviction::{EvictionPolicy, OldestFileFirst};
use super::file::{AppendOutcome, CacheFile, FileSummary};
use super::key::CacheKey;
use super::metadata::{BlockInfo, MetadataIndex};
use super::queue::{BoundedQueue, InsertOp};
use super::record::{self, MAX_KEY_SIZE, MAX_VALUE_SIZE};
use super::stats::{CacheStats, StatsSnapshot};
use super::tier::CacheTier;
use super::writer::{ThreadedWriter, WriterConfig};
use crate::config::BlockCacheConfig;
use crate::error::{Error, Result};

/// How long the insert thread parks waiting for a buffer per retry
const BUFFER_WAIT_TIMEOUT: Duration = Duration::from_millis(100);

struct CacheState {
    /// File receiving appends
    current: Option<Arc<CacheFile>>,
    next_file_id: u32,
    /// Bytes claimed through `reserve`
    size: u64,
}

struct Inner {
    config: BlockCacheConfig,
    dir: PathBuf,
    open: AtomicBool,
    state: RwLock<CacheState>,
    /// Serializes appends and rotation
    append_lock: Mutex<()>,
    queue: BoundedQueue<InsertOp>,
    allocator: BufferAllocator,
    metadata: Arc<MetadataIndex>,
    writer: RwLock<Option<ThreadedWriter>>,
    stats: CacheStats,
    policy: Box<dyn EvictionPolicy>,
}

impl Inner {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn size(&self) -> u64 {
        self.state.read().size
    }

    /// Largest record the buffer pool can ever hold
    fn max_record_len(&self) -> u64 {
        self.allocator.max_buffers() as u64 * self.allocator.buffer_size() as u64
    }

    // =========================================================================
    // Admission control
    // =========================================================================

    fn reserve(&self, size: u64) -> bool {
        let capacity = self.config.cache_size;
        if size > capacity {
            return false;
        }

        let mut state = self.state.write();
        if state.size + size <= capacity {
            state.size += size;
            self.stats.set_cache_bytes(state.size);
            return true;
        }

        let needed = state.size + size - capacity;
        let current = state.current.as_ref().map(|f| f.id());
        let Some(freed) = self.reclaim(needed, current) else {
            debug!(size, used = state.size, capacity, "Reservation refused");
            return false;
        };
        state.size = state.size.saturating_sub(freed);

        let admitted = state.size + size <= capacity;
        if admitted {
            state.size += size;
        }
        self.stats.set_cache_bytes(state.size);
        admitted
    }

    fn release(&self, size: u64) {
        let mut state = self.state.write();
        state.size = state.size.saturating_sub(size);
        self.stats.set_cache_bytes(state.size);
    }

    /// Evict files until `needed` bytes are freed, or evict nothing.
    ///
    /// Returns the bytes freed.
    fn reclaim(&self, needed: u64, current: Option<u32>) -> Option<u64> {
        let summaries: Vec<FileSummary> = self
            .metadata
            .files()
            .iter()
            .filter(|f| Some(f.id()) != current)
            .map(|f| f.summary())
            .collect();
        let victims = self.policy.select_victims(&summaries, needed)?;
        Some(victims.into_iter().map(|id| self.evict_file(id)).sum())
    }

    fn evict_file(&self, id: u32) -> u64 {
        let Some(file) = self.metadata.remove_file(id) else {
            return 0;
        };
        let removed = self.metadata.remove_file_entries(&file);
        if let Err(e) = file.remove_from_disk() {
            warn!(file_id = id, error = %e, "Failed to delete evicted cache file");
        }
        let size = file.size();
        self.stats.record_eviction();
        self.stats.set_cache_files(self.metadata.file_count());
        info!(
            file_id = id,
            path = %file.path().display(),
            size,
            removed_keys = removed,
            failed = file.is_failed(),
            policy = self.policy.name(),
            "Evicted cache file"
        );
        size
    }

    // =========================================================================
    // Append path
    // =========================================================================

    fn submit(&self, file: &Arc<CacheFile>, buffer: WriteBuffer) {
        let writer = self.writer.read();
        let result = match writer.as_ref() {
            Some(writer) => writer.submit(file.clone(), buffer),
            None => {
                drop(buffer);
                Err(ThreadedWriter::abandon(file.clone()))
            }
        };
        if let Err(e) = result {
            error!(file_id = file.id(), error = %e, "Failed to submit write buffer");
        }
    }

    /// Seal `file` and send its partial buffer to the writer
    fn seal(&self, file: &Arc<CacheFile>) {
        if let Some(tail) = file.seal() {
            self.submit(file, tail);
        }
    }

    /// Return the writable file, rotating to a new one if the current file
    /// is missing or sealed
    fn current_file(&self) -> Result<Arc<CacheFile>> {
        if let Some(file) = self.state.read().current.as_ref() {
            if !file.is_sealed() {
                return Ok(file.clone());
            }
        }

        let mut state = self.state.write();
        if let Some(old) = state.current.take() {
            self.seal(&old);
            debug!(file_id = old.id(), size = old.size(), "Sealed cache file");
        }

        let id = state.next_file_id;
        let file = CacheFile::create(&self.dir, id, self.config.cache_file_size)?;
        state.next_file_id += 1;
        state.current = Some(file.clone());
        drop(state);

        self.metadata.register_file(file.clone());
        self.stats.set_cache_files(self.metadata.file_count());
        info!(file_id = id, "Opened new cache file");
        Ok(file)
    }

    /// Append one record to the current file.
    ///
    /// On buffer exhaustion the file's own partial buffer goes to the
    /// writer first. With `wait` the call then parks for released buffers
    /// up to `insert_max_retries` times, rotates once and retries on the
    /// fresh file. Without it exhaustion fails at once.
    fn append_record(&self, key: &CacheKey, data: &[u8], wait: bool) -> Result<()> {
        let _append = self.append_lock.lock();
        // Close seals the current file under this lock; a caller that lost
        // the race must not open a new one behind it.
        if !wait && !self.is_open() {
            return Err(Error::NotOpen);
        }

        let mut retries = 0;
        let mut rotated = false;
        loop {
            let file = self.current_file()?;
            match file.append(key, data, &self.allocator) {
                AppendOutcome::Appended { full, .. } => {
                    for buffer in full {
                        self.submit(&file, buffer);
                    }
                    return Ok(());
                }
                AppendOutcome::FileFull => {
                    // The next current_file() call rotates.
                    self.seal(&file);
                }
                AppendOutcome::NoBuffer => {
                    // Only the writer can return the buffer this file holds.
                    if let Some(buffer) = file.cut() {
                        self.submit(&file, buffer);
                        continue;
                    }
                    if wait && retries < self.config.insert_max_retries {
                        retries += 1;
                        self.allocator.wait_for_release(BUFFER_WAIT_TIMEOUT);
                        continue;
                    }
                    if wait && !rotated {
                        debug!(file_id = file.id(), "Rotating after buffer wait");
                        self.seal(&file);
                        rotated = true;
                        retries = 0;
                        continue;
                    }
                    return Err(Error::ResourceExhausted(format!(
                        "no write buffer available ({} of {} in use)",
                        self.allocator.outstanding(),
                        self.allocator.max_buffers()
                    )));
                }
            }
        }
    }

    /// Hand the current file's partial buffer to the writer
    fn cut_current(&self) {
        let _append = self.append_lock.lock();
        let current = self.state.read().current.clone();
        if let Some(file) = current {
            if let Some(buffer) = file.cut() {
                self.submit(&file, buffer);
            }
        }
    }

    fn process_insert(&self, key: CacheKey, data: Bytes, reserved: u64) {
        if let Err(e) = self.append_record(&key, &data, true) {
            warn!(
                key_len = key.len(),
                value_len = data.len(),
                error = %e,
                "Dropping insert"
            );
            self.stats.record_dropped_insert();
            self.release(reserved);
        }
    }

    fn run_insert_thread(&self) {
        debug!("Insert thread started");
        let idle = self.config.idle_flush_interval();
        loop {
            let op = match idle {
                Some(interval) => match self.queue.pop_timeout(interval) {
                    Some(op) => op,
                    None => {
                        self.cut_current();
                        continue;
                    }
                },
                None => self.queue.pop_blocking(),
            };

            match op {
                InsertOp::Insert {
                    key,
                    data,
                    reserved,
                } => self.process_insert(key, data, reserved),
                InsertOp::Flush(ack) => {
                    self.cut_current();
                    let _ = ack.send(());
                }
                InsertOp::Exit => break,
            }
        }
        debug!("Insert thread stopped");
    }

    /// Drop whatever is still queued, returning reservations
    fn discard_queued(&self) {
        for op in self.queue.clear() {
            if let InsertOp::Insert { reserved, .. } = op {
                self.stats.record_dropped_insert();
                self.release(reserved);
            }
        }
    }

    // =========================================================================
    // Open / recovery
    // =========================================================================

    /// Index the files left by a previous run; returns (bytes, next file id)
    fn recover_files(&self) -> Result<(u64, u32)> {
        let mut ids: Vec<u32> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| CacheFile::parse_id(&entry.path()))
            .collect();
        ids.sort_unstable();

        let mut size = 0u64;
        let mut keys = 0usize;
        for &id in &ids {
            let recovered = CacheFile::recover(&self.dir, id, self.config.cache_file_size);
            let (file, records) = match recovered {
                Ok(recovered) => recovered,
                Err(e) => {
                    warn!(file_id = id, error = %e, "Skipping unreadable cache file");
                    continue;
                }
            };
            keys += records.len();
            // Files are scanned oldest first, so later files win.
            for rec in records {
                self.metadata
                    .insert(rec.key, BlockInfo::new(id, rec.offset, rec.len));
            }
            size += file.size();
            self.metadata.register_file(file);
        }

        let capacity = self.config.cache_size;
        if size > capacity {
            let freed = self.reclaim(size - capacity, None).unwrap_or(0);
            size = size.saturating_sub(freed);
        }

        let next_file_id = ids.last().map_or(1, |max| max + 1);
        info!(
            files = self.metadata.file_count(),
            records = keys,
            size,
            next_file_id,
            "Recovered cache files"
        );
        Ok((size, next_file_id))
    }

    /// Delete every cache file in the directory
    fn reset_files(&self) -> Result<()> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if CacheFile::parse_id(&path).is_some() {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        debug!(removed, "Removed existing cache files");
        Ok(())
    }

    fn start(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            Error::Config(format!(
                "cannot create cache directory {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        self.metadata.clear();
        let (size, next_file_id) = if self.config.recover_on_open {
            self.recover_files()?
        } else {
            self.reset_files()?;
            (0, 1)
        };

        *self.state.write() = CacheState {
            current: None,
            next_file_id,
            size,
        };
        self.stats.set_cache_bytes(size);
        self.stats.set_cache_files(self.metadata.file_count());

        let writer = ThreadedWriter::new(
            WriterConfig::from(&self.config),
            self.metadata.clone(),
            self.stats.clone(),
        )?;
        *self.writer.write() = Some(writer);
        Ok(())
    }
}

/// Reject keys and values the record header cannot describe
fn check_record_lengths(key_len: usize, value_len: usize) -> Result<()> {
    if key_len > MAX_KEY_SIZE {
        return Err(Error::KeyTooLarge {
            len: key_len,
            max: MAX_KEY_SIZE,
        });
    }
    if value_len > MAX_VALUE_SIZE {
        return Err(Error::ValueTooLarge {
            len: value_len,
            max: MAX_VALUE_SIZE,
        });
    }
    Ok(())
}

/// Persistent, disk-backed block cache
pub struct BlockCache {
    inner: Arc<Inner>,
    /// Insert thread handle; the lock also serializes open and close
    insert_thread: Mutex<Option<JoinHandle<()>>>,
}

impl BlockCache {
    /// Create a closed cache with the default eviction policy
    pub fn new(config: BlockCacheConfig) -> Result<Self> {
        Self::with_policy(config, Box::new(OldestFileFirst))
    }

    /// Create a closed cache reclaiming files with `policy`
    pub fn with_policy(config: BlockCacheConfig, policy: Box<dyn EvictionPolicy>) -> Result<Self> {
        let allocator = BufferAllocator::new(config.write_buffer_size, config.max_buffers());
        let queue = BoundedQueue::new(config.max_write_pipeline_backlog_size);
        let stats = CacheStats::new()?;

        Ok(Self {
            inner: Arc::new(Inner {
                dir: config.cache_dir(),
                config,
                open: AtomicBool::new(false),
                state: RwLock::new(CacheState {
                    current: None,
                    next_file_id: 1,
                    size: 0,
                }),
                append_lock: Mutex::new(()),
                queue,
                allocator,
                metadata: Arc::new(MetadataIndex::new()),
                writer: RwLock::new(None),
                stats,
                policy,
            }),
            insert_thread: Mutex::new(None),
        })
    }

    /// Create and open a cache
    pub fn open_with(config: BlockCacheConfig) -> Result<Self> {
        let cache = Self::new(config)?;
        cache.open()?;
        Ok(cache)
    }

    pub fn config(&self) -> &BlockCacheConfig {
        &self.inner.config
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// Bytes currently reserved
    pub fn size(&self) -> u64 {
        self.inner.size()
    }

    pub fn capacity(&self) -> u64 {
        self.inner.config.cache_size
    }

    /// Number of indexed keys
    pub fn key_count(&self) -> usize {
        self.inner.metadata.len()
    }

    /// Live cache files ordered by id
    pub fn files(&self) -> Vec<FileSummary> {
        self.inner.metadata.files().iter().map(|f| f.summary()).collect()
    }

    /// Id of the file receiving appends
    pub fn current_file_id(&self) -> Option<u32> {
        self.inner.state.read().current.as_ref().map(|f| f.id())
    }

    /// Where `key` is stored, if it is indexed
    pub fn locate(&self, key: &CacheKey) -> Option<BlockInfo> {
        self.inner.metadata.lookup(key)
    }

    pub fn stats(&self) -> &CacheStats {
        &self.inner.stats
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Write buffers currently borrowed from the pool
    pub fn buffers_in_use(&self) -> usize {
        self.inner.allocator.outstanding()
    }
}

impl CacheTier for BlockCache {
    fn open(&self) -> Result<()> {
        let mut insert_thread = self.insert_thread.lock();
        if self.inner.is_open() {
            return Err(Error::AlreadyOpen);
        }
        self.inner.config.validate()?;

        if let Err(e) = self.inner.start() {
            self.inner.metadata.clear();
            if let Some(mut writer) = self.inner.writer.write().take() {
                writer.shutdown();
            }
            return Err(e);
        }

        if self.inner.config.pipeline_writes {
            let inner = self.inner.clone();
            let spawned = thread::Builder::new()
                .name("blockcache-insert".to_string())
                .spawn(move || inner.run_insert_thread());
            match spawned {
                Ok(handle) => *insert_thread = Some(handle),
                Err(e) => {
                    if let Some(mut writer) = self.inner.writer.write().take() {
                        writer.shutdown();
                    }
                    self.inner.metadata.clear();
                    return Err(e.into());
                }
            }
        }

        self.inner.open.store(true, Ordering::Release);
        info!(
            path = %self.inner.dir.display(),
            capacity = self.inner.config.cache_size,
            used = self.inner.size(),
            writers = self.inner.config.writer_qdepth,
            pipelined = self.inner.config.pipeline_writes,
            "Block cache opened"
        );
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut insert_thread = self.insert_thread.lock();
        if !self.inner.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some(handle) = insert_thread.take() {
            // Exit is a control op and always fits.
            let _ = self.inner.queue.push(InsertOp::Exit);
            if handle.join().is_err() {
                error!("Block cache insert thread panicked");
            }
        }
        self.inner.discard_queued();

        {
            let _append = self.inner.append_lock.lock();
            let current = self.inner.state.write().current.take();
            if let Some(file) = current {
                self.inner.seal(&file);
            }
        }
        if let Some(mut writer) = self.inner.writer.write().take() {
            debug!(pending = writer.pending(), "Draining block cache writer");
            writer.shutdown();
        }

        info!(
            files = self.inner.metadata.file_count(),
            keys = self.inner.metadata.len(),
            used = self.inner.size(),
            "Block cache closed"
        );
        Ok(())
    }

    fn insert(&self, key: CacheKey, data: Bytes) -> Result<()> {
        let inner = &self.inner;
        if !inner.is_open() {
            return Err(Error::NotOpen);
        }
        check_record_lengths(key.len(), data.len())?;

        let len = record::encoded_len(key.len(), data.len()) as u64;
        if len > inner.max_record_len() {
            return Err(Error::ResourceExhausted(format!(
                "record of {} bytes exceeds the {} byte write buffer pool",
                len,
                inner.max_record_len()
            )));
        }
        if !inner.reserve(len) {
            return Err(Error::ResourceExhausted(format!(
                "cannot reserve {} bytes ({} of {} in use)",
                len,
                inner.size(),
                inner.config.cache_size
            )));
        }
        inner.stats.record_pipelined(data.len());

        if !inner.config.pipeline_writes {
            return inner.append_record(&key, &data, false).inspect_err(|_| {
                inner.release(len);
            });
        }

        if inner.queue.push(InsertOp::new(key, data, len)).is_err() {
            inner.release(len);
            return Err(Error::ResourceExhausted(format!(
                "insert backlog full ({} of {} bytes queued)",
                inner.queue.size_bytes(),
                inner.queue.max_bytes()
            )));
        }
        Ok(())
    }

    fn lookup(&self, key: &CacheKey) -> Result<Option<Bytes>> {
        let inner = &self.inner;
        if !inner.is_open() {
            return Err(Error::NotOpen);
        }

        let Some(info) = inner.metadata.lookup(key) else {
            inner.stats.record_miss();
            return Ok(None);
        };
        let Some(file) = inner.metadata.file(info.file_id) else {
            // File was evicted after the index was read.
            inner.metadata.erase_if_in_file(key, info.file_id);
            inner.stats.record_miss();
            return Ok(None);
        };

        match file.read_record(key, info.offset, info.size) {
            Ok(value) => {
                inner.stats.record_hit();
                inner.stats.record_read(info.size as usize);
                Ok(Some(value))
            }
            Err(_) if file.is_failed() => {
                inner.metadata.erase_if_in_file(key, info.file_id);
                inner.stats.record_miss();
                Ok(None)
            }
            Err(e) => {
                warn!(file_id = info.file_id, offset = info.offset, error = %e, "Lookup failed");
                Err(e)
            }
        }
    }

    fn erase(&self, key: &CacheKey) -> bool {
        self.inner.is_open() && self.inner.metadata.erase(key)
    }

    fn reserve(&self, size: u64) -> bool {
        self.inner.reserve(size)
    }

    fn print_stats(&self) -> String {
        self.inner.stats.set_cache_bytes(self.inner.size());
        self.inner.stats.set_cache_files(self.inner.metadata.file_count());
        self.inner.stats.snapshot().render()
    }

    fn flush_all(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner.is_open() {
            return Err(Error::NotOpen);
        }

        if inner.config.pipeline_writes {
            let (ack_tx, ack_rx) = bounded(1);
            let _ = inner.queue.push(InsertOp::Flush(ack_tx));
            if ack_rx.recv().is_err() {
                return Err(Error::Internal("insert thread stopped before flushing".into()));
            }
        } else {
            inner.cut_current();
        }

        if let Some(writer) = inner.writer.read().as_ref() {
            writer.wait_idle();
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "block-cache"
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(error = %e, "Failed to close block cache");
        }
    }
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache")
            .field("path", &self.inner.dir)
            .field("open", &self.is_open())
            .field("size", &self.size())
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> BlockCacheConfig {
        BlockCacheConfig {
            path: dir.path().to_path_buf(),
            write_buffer_size: 4096,
            write_buffer_count: 16,
            bufferpool_limit: 16 * 4096,
            max_write_pipeline_backlog_size: 1 << 20,
            writer_qdepth: 2,
            cache_file_size: 16 * 1024,
            cache_size: 1 << 20,
            sync_writes: false,
            idle_flush_interval_ms: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_open_twice_fails() {
        let dir = TempDir::new().unwrap();
        let cache = BlockCache::open_with(config(&dir)).unwrap();
        assert_matches!(cache.open(), Err(Error::AlreadyOpen));
        cache.close().unwrap();
        cache.close().unwrap();
        assert!(!cache.is_open());
    }

    #[test]
    fn test_invalid_config_retains_nothing() {
        let dir = TempDir::new().unwrap();
        let cfg = BlockCacheConfig {
            writer_qdepth: 0,
            ..config(&dir)
        };
        let cache = BlockCache::new(cfg).unwrap();
        assert_matches!(cache.open(), Err(Error::Config(_)));
        assert!(!cache.is_open());
        assert!(!dir.path().join("cache").exists());
    }

    #[test]
    fn test_insert_requires_open() {
        let dir = TempDir::new().unwrap();
        let cache = BlockCache::new(config(&dir)).unwrap();
        assert_matches!(
            cache.insert(CacheKey::from("k"), Bytes::from_static(b"v")),
            Err(Error::NotOpen)
        );
    }

    #[test]
    fn test_reservation_is_returned_on_backlog_full() {
        let dir = TempDir::new().unwrap();
        let cfg = BlockCacheConfig {
            max_write_pipeline_backlog_size: 64,
            ..config(&dir)
        };
        let cache = BlockCache::open_with(cfg).unwrap();
        let err = cache
            .insert(CacheKey::from("k"), Bytes::from(vec![0u8; 100]))
            .unwrap_err();
        assert_matches!(err, Error::ResourceExhausted(_));
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_non_pipelined_exhaustion_until_buffer_released() {
        let dir = TempDir::new().unwrap();
        let cfg = BlockCacheConfig {
            write_buffer_count: 1,
            pipeline_writes: false,
            ..config(&dir)
        };
        let cache = BlockCache::open_with(cfg).unwrap();

        // Another flush holds the only buffer
        let held = cache.inner.allocator.allocate().unwrap();
        let err = cache
            .insert(CacheKey::from("second"), Bytes::from(vec![1u8; 1000]))
            .unwrap_err();
        assert_matches!(err, Error::ResourceExhausted(_));
        assert_eq!(cache.size(), 0);

        drop(held);
        cache
            .insert(CacheKey::from("second"), Bytes::from(vec![1u8; 1000]))
            .unwrap();
        cache.flush_all().unwrap();
        assert_eq!(
            cache.lookup(&CacheKey::from("second")).unwrap().unwrap().len(),
            1000
        );
    }

    #[test]
    fn test_record_larger_than_pool_is_rejected() {
        let dir = TempDir::new().unwrap();
        let cache = BlockCache::open_with(config(&dir)).unwrap();
        let err = cache
            .insert(CacheKey::from("huge"), Bytes::from(vec![0u8; 16 * 4096]))
            .unwrap_err();
        assert_matches!(err, Error::ResourceExhausted(_));
    }

    #[test]
    fn test_oversized_key_is_rejected() {
        let dir = TempDir::new().unwrap();
        let cache = BlockCache::open_with(config(&dir)).unwrap();
        let key = CacheKey::new(vec![b'k'; MAX_KEY_SIZE + 1]);
        assert_matches!(
            cache.insert(key, Bytes::new()),
            Err(Error::KeyTooLarge { .. })
        );
    }

    #[test]
    fn test_value_length_must_fit_record_header() {
        assert!(check_record_lengths(MAX_KEY_SIZE, MAX_VALUE_SIZE).is_ok());
        assert_matches!(
            check_record_lengths(0, MAX_VALUE_SIZE + 1),
            Err(Error::ValueTooLarge { max: MAX_VALUE_SIZE, .. })
        );
        assert_matches!(
            check_record_lengths(MAX_KEY_SIZE + 1, 0),
            Err(Error::KeyTooLarge { .. })
        );
    }

    #[test]
    fn test_insert_thread_hands_off_its_own_partial_buffer() {
        let dir = TempDir::new().unwrap();
        let cfg = BlockCacheConfig {
            write_buffer_count: 1,
            ..config(&dir)
        };
        let cache = BlockCache::open_with(cfg).unwrap();

        cache.insert(CacheKey::from("a"), Bytes::from(vec![1u8; 1000])).unwrap();
        cache.insert(CacheKey::from("b"), Bytes::from(vec![2u8; 3500])).unwrap();
        cache.flush_all().unwrap();

        assert_eq!(cache.lookup(&CacheKey::from("a")).unwrap().map(|v| v.len()), Some(1000));
        assert_eq!(cache.lookup(&CacheKey::from("b")).unwrap().map(|v| v.len()), Some(3500));
        assert_eq!(cache.snapshot().dropped_inserts, 0);
        assert_eq!(cache.files().len(), 1);
    }

    #[test]
    fn test_single_buffer_pool_under_concurrent_inserts() {
        let dir = TempDir::new().unwrap();
        let cfg = BlockCacheConfig {
            write_buffer_count: 1,
            ..config(&dir)
        };
        let cache = BlockCache::open_with(cfg).unwrap();
        let key = |t: usize, i: usize| CacheKey::from(format!("{}-{}", t, i).as_str());

        thread::scope(|s| {
            for t in 0..2 {
                let cache = &cache;
                s.spawn(move || {
                    for i in 0..20 {
                        cache.insert(key(t, i), Bytes::from(vec![t as u8; 3000])).unwrap();
                    }
                });
            }
        });
        cache.flush_all().unwrap();

        for t in 0..2 {
            for i in 0..20 {
                let found = cache.lookup(&key(t, i)).unwrap();
                assert_eq!(found, Some(Bytes::from(vec![t as u8; 3000])));
            }
        }
        assert_eq!(cache.snapshot().dropped_inserts, 0);
    }

    #[test]
    fn test_backlog_rejects_while_insert_thread_is_stalled() {
        let dir = TempDir::new().unwrap();
        let cfg = BlockCacheConfig {
            write_buffer_count: 1,
            max_write_pipeline_backlog_size: 8 * 1024,
            insert_max_retries: 50,
            ..config(&dir)
        };
        let cache = BlockCache::open_with(cfg).unwrap();

        // With the only buffer held the insert thread parks on its first op
        let held = cache.inner.allocator.allocate().unwrap();
        let mut accepted = Vec::new();
        let mut rejected = 0;
        for i in 0..20 {
            let key = CacheKey::from(format!("burst-{}", i).as_str());
            match cache.insert(key.clone(), Bytes::from(vec![i as u8; 1000])) {
                Ok(()) => accepted.push((key, i)),
                Err(Error::ResourceExhausted(_)) => rejected += 1,
                Err(e) => panic!("unexpected error {}", e),
            }
        }
        assert!(rejected >= 1, "backlog never filled");
        assert!(!accepted.is_empty());

        drop(held);
        cache.flush_all().unwrap();
        for (key, i) in accepted {
            assert_eq!(cache.lookup(&key).unwrap(), Some(Bytes::from(vec![i as u8; 1000])));
        }
        assert_eq!(cache.snapshot().dropped_inserts, 0);
    }

    #[test]
    fn test_close_waits_for_in_progress_append() {
        let dir = TempDir::new().unwrap();
        let cfg = BlockCacheConfig {
            pipeline_writes: false,
            ..config(&dir)
        };
        let cache = BlockCache::open_with(cfg).unwrap();

        let append = cache.inner.append_lock.lock();
        thread::scope(|s| {
            let insert =
                s.spawn(|| cache.insert(CacheKey::from("late"), Bytes::from(vec![7u8; 100])));
            thread::sleep(Duration::from_millis(20));
            let close = s.spawn(|| cache.close());
            while cache.is_open() {
                thread::sleep(Duration::from_millis(1));
            }
            thread::sleep(Duration::from_millis(20));
            drop(append);

            assert_matches!(insert.join().unwrap(), Err(Error::NotOpen));
            close.join().unwrap().unwrap();
        });

        // Nothing was written behind the closed cache
        assert_eq!(cache.size(), 0);
        assert_eq!(fs::read_dir(dir.path().join("cache")).unwrap().count(), 0);
        assert_eq!(cache.inner.allocator.outstanding(), 0);
    }

    #[test]
    fn test_idle_flush_makes_inserts_visible() {
        let dir = TempDir::new().unwrap();
        let cfg = BlockCacheConfig {
            idle_flush_interval_ms: 5,
            ..config(&dir)
        };
        let cache = BlockCache::open_with(cfg).unwrap();
        let key = CacheKey::from("lonely");
        cache.insert(key.clone(), Bytes::from_static(b"value")).unwrap();

        let mut found = None;
        for _ in 0..200 {
            if let Some(value) = cache.lookup(&key).unwrap() {
                found = Some(value);
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(found.as_deref(), Some(&b"value"[..]));
    }

    #[test]
    fn test_failed_file_reads_as_miss() {
        let dir = TempDir::new().unwrap();
        let cache = BlockCache::open_with(config(&dir)).unwrap();
        let key = CacheKey::from("k");
        cache.insert(key.clone(), Bytes::from_static(b"v")).unwrap();
        cache.flush_all().unwrap();

        let info = cache.locate(&key).unwrap();
        cache.inner.metadata.file(info.file_id).unwrap().fail();
        assert_eq!(cache.lookup(&key).unwrap(), None);
        assert!(cache.locate(&key).is_none());
    }

    #[test]
    fn test_corrupt_record_surfaces_error() {
        let dir = TempDir::new().unwrap();
        let cache = BlockCache::open_with(config(&dir)).unwrap();
        let key = CacheKey::from("k");
        cache.insert(key.clone(), Bytes::from_static(b"value")).unwrap();
        cache.flush_all().unwrap();

        let info = cache.locate(&key).unwrap();
        // Index a size that disagrees with the stored header
        cache
            .inner
            .metadata
            .insert(key.clone(), BlockInfo::new(info.file_id, 0, info.size - 1));
        assert_matches!(cache.lookup(&key), Err(Error::Corruption { .. }));
    }
}
