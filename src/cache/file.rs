//! Cache File - append-only record container
//!
//! A cache file is the unit of writing and of reclaiming space. The insert
//! path appends records into write buffers; full buffers leave the file and
//! go to the writer; the writer reports each durable range back through
//! [`CacheFile::commit`], which releases the records that are now entirely
//! inside the durable prefix of the file.
//!
//! # Lifecycle
//!
//! ```text
//!  create ──▶ Open ──(size limit / no buffers / close)──▶ Sealed ──▶ evicted
//!               │                                           ▲
//!               └────────────(write failure)──▶ Failed ─────┘
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::allocator::{BufferAllocator, WriteBuffer};
use super::key::CacheKey;
use super::record::{self, DecodeError, RecordHeader, RECORD_HEADER_SIZE};
use crate::error::{Error, Result};

/// File name extension of cache files
pub const CACHE_FILE_EXTENSION: &str = "rc";

/// A record whose bytes have been appended to a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendedRecord {
    pub key: CacheKey,
    /// Offset of the record header in the file
    pub offset: u64,
    /// Encoded length of the record
    pub len: u64,
}

impl AppendedRecord {
    fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Result of an append attempt
#[derive(Debug)]
pub enum AppendOutcome {
    /// The record was placed at `offset`; `full` buffers must go to the writer
    Appended {
        offset: u64,
        full: Vec<WriteBuffer>,
    },
    /// The file is sealed, failed, or the record would exceed the size limit
    FileFull,
    /// The allocator could not supply the buffers the record needs
    NoBuffer,
}

/// Point-in-time view of a file, used by eviction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSummary {
    pub id: u32,
    pub size: u64,
    pub sealed: bool,
    pub failed: bool,
    pub in_flight: usize,
}

impl FileSummary {
    /// Sealed files with no buffers in flight can be deleted
    pub fn is_evictable(&self) -> bool {
        self.sealed && self.in_flight == 0
    }
}

struct FileState {
    /// Buffer currently being filled
    active: Option<WriteBuffer>,
    /// Bytes appended so far
    size: u64,
    /// Appended records that are not durable yet, in file order
    pending: VecDeque<AppendedRecord>,
    /// Durable ranges past the durable prefix, start -> end
    committed: BTreeMap<u64, u64>,
    /// Every byte below this offset is on disk
    durable: u64,
    /// Buffers handed to the writer and not yet reported back
    in_flight: usize,
    /// Keys published from this file
    published: Vec<CacheKey>,
}

/// Append-only cache file
pub struct CacheFile {
    id: u32,
    path: PathBuf,
    file: File,
    max_size: u64,
    sealed: AtomicBool,
    failed: AtomicBool,
    state: Mutex<FileState>,
}

impl CacheFile {
    /// Path of file `id` inside `dir`
    pub fn path_for(dir: &Path, id: u32) -> PathBuf {
        dir.join(format!("{}.{}", id, CACHE_FILE_EXTENSION))
    }

    /// Parse a cache file id out of a directory entry name
    pub fn parse_id(path: &Path) -> Option<u32> {
        if path.extension()?.to_str()? != CACHE_FILE_EXTENSION {
            return None;
        }
        path.file_stem()?.to_str()?.parse().ok()
    }

    /// Create a new, empty, writable cache file
    pub fn create(dir: &Path, id: u32, max_size: u64) -> Result<Arc<Self>> {
        let path = Self::path_for(dir, id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        debug!(file_id = id, path = %path.display(), "Created cache file");
        Ok(Arc::new(Self::with_state(id, path, file, max_size, 0, false)))
    }

    /// Open an existing cache file, returning it sealed along with the valid
    /// records it holds. Scanning stops at the first invalid record.
    pub fn recover(dir: &Path, id: u32, max_size: u64) -> Result<(Arc<Self>, Vec<AppendedRecord>)> {
        let path = Self::path_for(dir, id);
        let raw = Bytes::from(fs::read(&path)?);
        let mut records = Vec::new();
        let mut offset = 0usize;

        while offset < raw.len() {
            match record::decode(&raw.slice(offset..)) {
                Ok(rec) => {
                    let len = record::encoded_len(rec.key.len(), rec.value.len());
                    records.push(AppendedRecord {
                        key: CacheKey::new(rec.key),
                        offset: offset as u64,
                        len: len as u64,
                    });
                    offset += len;
                }
                Err(e) => {
                    warn!(
                        file_id = id,
                        offset,
                        file_len = raw.len(),
                        error = %e,
                        "Ignoring cache file tail after invalid record"
                    );
                    break;
                }
            }
        }

        let file = OpenOptions::new().read(true).open(&path)?;
        let cache_file = Self::with_state(id, path, file, max_size, offset as u64, true);
        cache_file.state.lock().published = records.iter().map(|r| r.key.clone()).collect();
        Ok((Arc::new(cache_file), records))
    }

    fn with_state(
        id: u32,
        path: PathBuf,
        file: File,
        max_size: u64,
        size: u64,
        sealed: bool,
    ) -> Self {
        Self {
            id,
            path,
            file,
            max_size,
            sealed: AtomicBool::new(sealed),
            failed: AtomicBool::new(false),
            state: Mutex::new(FileState {
                active: None,
                size,
                pending: VecDeque::new(),
                committed: BTreeMap::new(),
                durable: size,
                in_flight: 0,
                published: Vec::new(),
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes appended to the file
    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    /// Bytes known to be on disk
    pub fn durable_size(&self) -> u64 {
        self.state.lock().durable
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn summary(&self) -> FileSummary {
        let state = self.state.lock();
        FileSummary {
            id: self.id,
            size: state.size,
            sealed: self.is_sealed(),
            failed: self.is_failed(),
            in_flight: state.in_flight,
        }
    }

    /// Keys that were published from this file
    pub fn published_keys(&self) -> Vec<CacheKey> {
        self.state.lock().published.clone()
    }

    /// Append a record for `key`.
    ///
    /// Every buffer the record needs is allocated before any byte is copied,
    /// so a `NoBuffer` outcome leaves the file untouched.
    pub fn append(
        &self,
        key: &CacheKey,
        value: &[u8],
        allocator: &BufferAllocator,
    ) -> AppendOutcome {
        if self.is_sealed() || self.is_failed() {
            return AppendOutcome::FileFull;
        }

        let encoded = record::encode(key.as_bytes(), value);
        let len = encoded.len() as u64;

        let mut state = self.state.lock();
        if state.size > 0 && state.size + len > self.max_size {
            return AppendOutcome::FileFull;
        }

        let room = state.active.as_ref().map_or(0, |b| b.remaining());
        let needed = encoded.len().saturating_sub(room);
        let buffer_size = allocator.buffer_size();
        let count = needed.div_ceil(buffer_size);

        let mut fresh = Vec::with_capacity(count);
        for _ in 0..count {
            match allocator.allocate() {
                Some(buf) => fresh.push(buf),
                // Dropping `fresh` hands the partial allocation back.
                None => return AppendOutcome::NoBuffer,
            }
        }

        let offset = state.size;
        let mut full = Vec::new();
        let mut fresh = fresh.into_iter();
        let mut src = &encoded[..];
        let mut next_offset = offset;

        while !src.is_empty() {
            let mut buf = match state.active.take() {
                Some(buf) => buf,
                None => match fresh.next() {
                    Some(mut buf) => {
                        buf.set_file_offset(next_offset);
                        buf
                    }
                    None => {
                        return AppendOutcome::NoBuffer;
                    }
                },
            };
            let n = buf.fill(src);
            src = &src[n..];
            next_offset = buf.end_offset();
            if buf.is_full() {
                full.push(buf);
            } else {
                state.active = Some(buf);
            }
        }

        state.size += len;
        state.in_flight += full.len();
        state.pending.push_back(AppendedRecord {
            key: key.clone(),
            offset,
            len,
        });

        AppendOutcome::Appended { offset, full }
    }

    /// Take the partially filled buffer so it can be flushed now.
    ///
    /// Later appends continue at the next file offset in a fresh buffer.
    pub fn cut(&self) -> Option<WriteBuffer> {
        let mut state = self.state.lock();
        let buf = state.active.take()?;
        if buf.is_empty() {
            return None;
        }
        state.in_flight += 1;
        Some(buf)
    }

    /// Stop accepting appends and return the last partial buffer, if any
    pub fn seal(&self) -> Option<WriteBuffer> {
        self.sealed.store(true, Ordering::Release);
        self.cut()
    }

    /// Write `buf` at its file offset, optionally syncing file data
    pub fn write_buffer(&self, buf: &WriteBuffer, sync: bool) -> std::io::Result<()> {
        self.file.write_all_at(buf.as_slice(), buf.file_offset())?;
        if sync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Record that `[offset, offset + len)` is on disk and return the records
    /// that became fully durable.
    pub fn commit(&self, offset: u64, len: u64) -> Vec<AppendedRecord> {
        let mut state = self.state.lock();
        if self.is_failed() {
            return Vec::new();
        }

        state.committed.insert(offset, offset + len);
        loop {
            let durable = state.durable;
            match state.committed.remove(&durable) {
                Some(end) => state.durable = end,
                None => break,
            }
        }

        let mut ready = Vec::new();
        while state
            .pending
            .front()
            .is_some_and(|rec| rec.end() <= state.durable)
        {
            if let Some(rec) = state.pending.pop_front() {
                state.published.push(rec.key.clone());
                ready.push(rec);
            }
        }
        ready
    }

    /// Called by the writer once it is done with a buffer of this file,
    /// after anything the buffer made durable has been published.
    pub fn finish_flush(&self) {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
    }

    /// Mark the file failed after a buffer could not be written.
    ///
    /// Pending records are discarded and never published.
    pub fn fail(&self) {
        self.failed.store(true, Ordering::Release);
        self.sealed.store(true, Ordering::Release);
        let mut state = self.state.lock();
        state.pending.clear();
        state.committed.clear();
        state.active = None;
    }

    /// Read `size` bytes at `offset`; only durable bytes may be read
    pub fn read(&self, offset: u64, size: u64) -> Result<Bytes> {
        if self.is_failed() {
            return Err(Error::corruption(self.id, offset, "cache file failed"));
        }
        let durable = self.durable_size();
        if offset + size > durable {
            return Err(Error::corruption(
                self.id,
                offset,
                format!("read past durable size {}", durable),
            ));
        }
        let mut buf = vec![0u8; size as usize];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(Bytes::from(buf))
    }

    /// Read and verify the record at `offset`, returning its value
    pub fn read_record(&self, key: &CacheKey, offset: u64, size: u64) -> Result<Bytes> {
        if (size as usize) < RECORD_HEADER_SIZE {
            return Err(Error::corruption(self.id, offset, "record size below header size"));
        }
        let raw = self.read(offset, size)?;
        let header = RecordHeader::parse(&raw).map_err(|e| self.decode_error(offset, e))?;
        if header.record_len() as u64 != size {
            return Err(Error::corruption(
                self.id,
                offset,
                format!("record length {} != indexed size {}", header.record_len(), size),
            ));
        }
        let rec = record::decode(&raw).map_err(|e| self.decode_error(offset, e))?;
        if rec.key[..] != key.as_bytes()[..] {
            return Err(Error::corruption(self.id, offset, "stored key does not match"));
        }
        Ok(rec.value)
    }

    fn decode_error(&self, offset: u64, e: DecodeError) -> Error {
        Error::corruption(self.id, offset, e.to_string())
    }

    /// Delete the backing file. Open handles stay readable until dropped.
    pub fn remove_from_disk(&self) -> Result<()> {
        fs::remove_file(&self.path)?;
        Ok(())
    }
}

impl std::fmt::Debug for CacheFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheFile")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("sealed", &self.is_sealed())
            .field("failed", &self.is_failed())
            .finish()
    }
}
