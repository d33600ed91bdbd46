//! Threaded Writer
//!
//! A fixed pool of OS threads that flush filled write buffers to their
//! cache files. After a buffer is on disk the worker publishes every record
//! that became fully durable into the metadata index, then drops the buffer
//! so it returns to the allocator.
//!
//! # Failure handling
//!
//! Write errors are retried with a fixed delay. When retries run out the
//! file is marked failed: its pending records are never published and its
//! published entries are removed, so lookups into it miss.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, trace, warn};

use super::allocator::WriteBuffer;
use super::file::CacheFile;
use super::metadata::{BlockInfo, MetadataIndex};
use super::stats::CacheStats;
use crate::config::BlockCacheConfig;
use crate::error::{Error, Result};

/// A buffer to flush and the file it belongs to
pub struct WriteJob {
    pub file: Arc<CacheFile>,
    pub buffer: WriteBuffer,
}

/// Writer tuning, taken from the cache configuration
#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub threads: usize,
    pub sync_writes: bool,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl From<&BlockCacheConfig> for WriterConfig {
    fn from(config: &BlockCacheConfig) -> Self {
        Self {
            threads: config.writer_qdepth,
            sync_writes: config.sync_writes,
            max_retries: config.writer_max_retries,
            retry_delay: config.writer_retry_delay(),
        }
    }
}

struct WriterShared {
    config: WriterConfig,
    metadata: Arc<MetadataIndex>,
    stats: CacheStats,
    /// Jobs submitted and not yet finished
    pending: Mutex<usize>,
    idle: Condvar,
}

impl WriterShared {
    fn run(&self, receiver: Receiver<WriteJob>) {
        for job in receiver.iter() {
            self.process(job);
            let mut pending = self.pending.lock();
            *pending -= 1;
            if *pending == 0 {
                self.idle.notify_all();
            }
        }
    }

    fn process(&self, job: WriteJob) {
        let WriteJob { file, buffer } = job;
        let offset = buffer.file_offset();
        let len = buffer.len();
        let start = Instant::now();

        match self.write_with_retry(&file, &buffer) {
            Ok(()) => {
                self.stats.record_written(len);
                let ready = file.commit(offset, len as u64);
                for rec in &ready {
                    self.metadata
                        .publish(rec.key.clone(), BlockInfo::new(file.id(), rec.offset, rec.len));
                }
                trace!(
                    file_id = file.id(),
                    offset,
                    len,
                    published = ready.len(),
                    elapsed_us = start.elapsed().as_micros() as u64,
                    "Flushed write buffer"
                );
            }
            Err(e) => {
                error!(
                    file_id = file.id(),
                    offset,
                    len,
                    error = %e,
                    "Write buffer flush failed, marking cache file failed"
                );
                self.stats.record_write_failure();
                file.fail();
                self.metadata.remove_file_entries(&file);
            }
        }

        file.finish_flush();
        // Dropping the buffer hands it back to the allocator.
        drop(buffer);
    }

    fn write_with_retry(&self, file: &CacheFile, buffer: &WriteBuffer) -> std::io::Result<()> {
        let attempts = self.config.max_retries + 1;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match file.write_buffer(buffer, self.config.sync_writes) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    warn!(
                        file_id = file.id(),
                        offset = buffer.file_offset(),
                        "Write failed (attempt {}/{}): {}",
                        attempt,
                        attempts,
                        e
                    );
                    thread::sleep(self.config.retry_delay);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Pool of writer threads
pub struct ThreadedWriter {
    sender: Option<Sender<WriteJob>>,
    workers: Vec<JoinHandle<()>>,
    shared: Arc<WriterShared>,
}

impl ThreadedWriter {
    /// Spawn `config.threads` writer threads
    pub fn new(
        config: WriterConfig,
        metadata: Arc<MetadataIndex>,
        stats: CacheStats,
    ) -> Result<Self> {
        let (sender, receiver) = unbounded::<WriteJob>();
        let threads = config.threads;
        let shared = Arc::new(WriterShared {
            config,
            metadata,
            stats,
            pending: Mutex::new(0),
            idle: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let shared = shared.clone();
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("blockcache-writer-{}", i))
                .spawn(move || shared.run(receiver))?;
            workers.push(handle);
        }

        info!(threads, "Started block cache writer");
        Ok(Self {
            sender: Some(sender),
            workers,
            shared,
        })
    }

    /// Queue `buffer` to be flushed into `file`
    pub fn submit(&self, file: Arc<CacheFile>, buffer: WriteBuffer) -> Result<()> {
        let Some(sender) = self.sender.as_ref() else {
            return Err(Self::abandon(file));
        };

        *self.shared.pending.lock() += 1;
        if let Err(err) = sender.send(WriteJob { file, buffer }) {
            let mut pending = self.shared.pending.lock();
            *pending -= 1;
            if *pending == 0 {
                self.shared.idle.notify_all();
            }
            drop(pending);
            return Err(Self::abandon(err.into_inner().file));
        }
        Ok(())
    }

    pub(crate) fn abandon(file: Arc<CacheFile>) -> Error {
        // The buffer will never be written, so the file can never become
        // durable past it.
        file.fail();
        file.finish_flush();
        Error::Internal("block cache writer is shut down".into())
    }

    /// Jobs submitted and not yet finished
    pub fn pending(&self) -> usize {
        *self.shared.pending.lock()
    }

    /// Block until every submitted job has finished
    pub fn wait_idle(&self) {
        let mut pending = self.shared.pending.lock();
        while *pending > 0 {
            self.shared.idle.wait(&mut pending);
        }
    }

    /// Finish queued jobs and join every worker
    pub fn shutdown(&mut self) {
        if self.sender.take().is_none() {
            return;
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("Block cache writer thread panicked");
            }
        }
        debug!("Block cache writer stopped");
    }
}

impl Drop for ThreadedWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::allocator::BufferAllocator;
    use crate::cache::file::AppendOutcome;
    use crate::cache::key::CacheKey;
    use tempfile::TempDir;

    fn writer(threads: usize, metadata: Arc<MetadataIndex>, stats: CacheStats) -> ThreadedWriter {
        let config = WriterConfig {
            threads,
            sync_writes: false,
            max_retries: 1,
            retry_delay: Duration::from_millis(1),
        };
        ThreadedWriter::new(config, metadata, stats).unwrap()
    }

    #[test]
    fn test_flush_publishes_and_releases_buffers() {
        let dir = TempDir::new().unwrap();
        let pool = BufferAllocator::new(64, 16);
        let metadata = Arc::new(MetadataIndex::new());
        let stats = CacheStats::new().unwrap();
        let mut writer = writer(2, metadata.clone(), stats.clone());
        let file = CacheFile::create(dir.path(), 1, 1 << 20).unwrap();

        for i in 0..10 {
            let key = CacheKey::from(format!("key-{}", i).as_str());
            match file.append(&key, &[i as u8; 30], &pool) {
                AppendOutcome::Appended { full, .. } => {
                    for buf in full {
                        writer.submit(file.clone(), buf).unwrap();
                    }
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        if let Some(tail) = file.seal() {
            writer.submit(file.clone(), tail).unwrap();
        }
        writer.wait_idle();

        assert_eq!(writer.pending(), 0);
        assert_eq!(metadata.len(), 10);
        assert_eq!(pool.outstanding(), 0);
        assert!(file.summary().is_evictable());
        assert!(stats.snapshot().buffer_flushes >= 7);

        let info = metadata.lookup(&CacheKey::from("key-3")).unwrap();
        let value = file.read_record(&CacheKey::from("key-3"), info.offset, info.size).unwrap();
        assert_eq!(&value[..], &[3u8; 30]);
        writer.shutdown();
    }

    #[test]
    fn test_failed_write_marks_file_failed() {
        let dir = TempDir::new().unwrap();
        let pool = BufferAllocator::new(64, 4);
        let metadata = Arc::new(MetadataIndex::new());
        let stats = CacheStats::new().unwrap();
        let writer = writer(1, metadata.clone(), stats.clone());

        // Recovered files are opened read-only, so every write fails
        std::fs::write(CacheFile::path_for(dir.path(), 1), b"").unwrap();
        let (file, _) = CacheFile::recover(dir.path(), 1, 1 << 20).unwrap();
        let mut buf = pool.allocate().unwrap();
        buf.fill(b"data");

        writer.submit(file.clone(), buf).unwrap();
        writer.wait_idle();

        assert!(file.is_failed());
        assert_eq!(stats.snapshot().write_failures, 1);
        assert_eq!(pool.outstanding(), 0);
        assert!(metadata.is_empty());
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let dir = TempDir::new().unwrap();
        let pool = BufferAllocator::new(64, 4);
        let mut writer = writer(1, Arc::new(MetadataIndex::new()), CacheStats::new().unwrap());
        writer.shutdown();

        let file = CacheFile::create(dir.path(), 1, 1 << 20).unwrap();
        let buf = pool.allocate().unwrap();
        assert!(writer.submit(file.clone(), buf).is_err());
        assert!(file.is_failed());
        assert_eq!(pool.outstanding(), 0);
    }
}
