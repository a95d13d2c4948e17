use std::time::{Duration, Instant};

use camino::Utf8PathBuf;

use crate::cache::format::{self, PartitionMeta};
use crate::core::Record;
use crate::error::CacheError;
use crate::task::TaskId;

/// When buffered records are written out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    /// Flush once the encoded buffer reaches this many bytes.
    pub max_bytes: usize,
    /// Flush once this much time has passed since the last flush.
    pub interval: Duration,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            max_bytes: 16 * 1024 * 1024,
            interval: Duration::from_secs(300),
        }
    }
}

/// Exclusive writer for one task's cache partition.
///
/// Records are buffered in memory and written out whenever the buffer
/// crosses [`FlushPolicy::max_bytes`] or [`FlushPolicy::interval`] elapses,
/// which bounds the loss on interruption to one interval of records. The
/// handle flushes on drop, so partial progress is kept on every exit path,
/// but only [`finalize`](Self::finalize) marks the record complete.
pub struct CacheHandle {
    id: TaskId,
    dir: Utf8PathBuf,
    meta: PartitionMeta,
    policy: FlushPolicy,
    buffer: Vec<u8>,
    buffered: u64,
    once_dirty: bool,
    last_flush: Instant,
    finalized: bool,
    /// Number of upcoming writes that fail before touching the disk.
    #[cfg(test)]
    pub(super) failing_writes: u32,
}

impl CacheHandle {
    pub(crate) fn new(
        id: TaskId,
        dir: Utf8PathBuf,
        meta: PartitionMeta,
        policy: FlushPolicy,
    ) -> Self {
        Self {
            id,
            dir,
            meta,
            policy,
            buffer: Vec::new(),
            buffered: 0,
            once_dirty: false,
            last_flush: Instant::now(),
            finalized: false,
            #[cfg(test)]
            failing_writes: 0,
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// Number of records durably written.
    pub fn committed(&self) -> u64 {
        self.meta.committed
    }

    /// Number of records waiting in the buffer.
    pub fn pending(&self) -> u64 {
        self.buffered
    }

    /// Buffers a record, flushing if a threshold was crossed. Returns whether
    /// a flush happened.
    pub fn append(&mut self, record: &Record) -> Result<bool, CacheError> {
        if self.finalized {
            return Err(CacheError::Finalized(self.id.clone()));
        }

        format::encode_frame(record, &mut self.buffer)?;
        self.buffered += 1;

        if self.buffer.len() >= self.policy.max_bytes
            || self.last_flush.elapsed() >= self.policy.interval
        {
            self.flush()?;
            return Ok(true);
        }

        Ok(false)
    }

    /// Merges one-shot fields, they are written with the next flush.
    pub fn set_once(&mut self, fields: Record) -> Result<(), CacheError> {
        if self.finalized {
            return Err(CacheError::Finalized(self.id.clone()));
        }

        self.meta.once.extend(fields);
        self.once_dirty = true;
        Ok(())
    }

    /// Durably writes buffered records. A failed write is retried once
    /// immediately before giving up.
    pub fn flush(&mut self) -> Result<(), CacheError> {
        if self.buffered == 0 && !self.once_dirty {
            self.last_flush = Instant::now();
            return Ok(());
        }

        match self.write_pending() {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::warn!(task = %self.id, "flush failed, retrying: {err}");
                self.write_pending()
                    .map_err(|err| CacheError::Flush(self.id.clone(), Box::new(err)))
            }
        }
    }

    /// Flushes and marks the record complete. After this the record may
    /// satisfy a dependent's freshness check.
    pub fn finalize(&mut self) -> Result<(), CacheError> {
        if self.finalized {
            return Err(CacheError::Finalized(self.id.clone()));
        }

        self.flush()?;

        let mut meta = self.meta.clone();
        meta.finalized = true;
        format::write_meta(&self.dir, &meta)?;

        self.meta = meta;
        self.finalized = true;
        tracing::debug!(task = %self.id, records = self.meta.committed, "finalized cache");

        Ok(())
    }

    fn write_pending(&mut self) -> Result<(), CacheError> {
        #[cfg(test)]
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(std::io::Error::other("injected write failure").into());
        }

        format::append_frames(&self.dir, self.meta.committed_bytes, &self.buffer)?;

        let mut meta = self.meta.clone();
        meta.committed += self.buffered;
        meta.committed_bytes += self.buffer.len() as u64;
        meta.last_flush_ms = Some(format::now_ms());
        format::write_meta(&self.dir, &meta)?;

        tracing::trace!(task = %self.id, records = self.buffered, "flushed cache");

        self.meta = meta;
        self.buffer.clear();
        self.buffered = 0;
        self.once_dirty = false;
        self.last_flush = Instant::now();

        Ok(())
    }
}

impl Drop for CacheHandle {
    fn drop(&mut self) {
        if self.finalized {
            return;
        }

        if let Err(err) = self.flush() {
            tracing::error!(task = %self.id, "lost buffered records on release: {err}");
        }
    }
}

impl std::fmt::Debug for CacheHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheHandle")
            .field("id", &self.id)
            .field("committed", &self.meta.committed)
            .field("pending", &self.buffered)
            .field("finalized", &self.finalized)
            .finish()
    }
}
