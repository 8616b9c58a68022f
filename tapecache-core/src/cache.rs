//! Persistent cache of one topic's records.
//!
//! New records are validated and buffered on the caller's thread, then committed in a
//! single append stream by a flush that runs on the shared [`CacheWorker`] once the
//! commit rate has elapsed. Everything that touches the file runs on that worker.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::codec::{Record, RecordCodec};
use crate::config::CacheConfiguration;
use crate::constants::{
    ELEMENT_HEADER_LEN, HEADER_LEN, KEY_SCHEMA_EXTENSION, MINIMUM_QUEUE_LEN, TAPE_EXTENSION,
    VALUE_SCHEMA_EXTENSION,
};
use crate::error::{Result, TapeError};
use crate::lock::lock_unpoisoned;
use crate::schema::{Datum, Schema};
use crate::typed::{Entry, RecordQueue};
use crate::worker::{CacheWorker, ScheduledTask};

type Queue = RecordQueue<Record, RecordCodec>;

/// Contiguous run of oldest records sharing one key, ready to upload.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordBatch {
    pub topic: String,
    pub records: Vec<Record>,
}

impl RecordBatch {
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Key shared by every record of the batch.
    #[must_use]
    pub fn key(&self) -> Option<&Datum> {
        self.records.first().map(|record| &record.key)
    }
}

struct Pending {
    records: Vec<Record>,
    /// Bytes the pending records will take once stored, descriptors included.
    bytes: u64,
    codec: RecordCodec,
    flush: Option<ScheduledTask>,
}

struct CacheInner {
    topic: String,
    base: PathBuf,
    tape_path: PathBuf,
    key_schema: Schema,
    value_schema: Schema,
    worker: Arc<CacheWorker>,
    queue: Mutex<Option<Queue>>,
    pending: Mutex<Pending>,
    committed_bytes: AtomicU64,
    config: Mutex<CacheConfiguration>,
    closed: AtomicBool,
    read_only: AtomicBool,
}

/// Handle to one cache generation of a topic. Clones share the same cache.
#[derive(Clone)]
pub struct TopicCache {
    inner: Arc<CacheInner>,
}

fn size_limit(config: &CacheConfiguration) -> u64 {
    config.maximum_size.max(MINIMUM_QUEUE_LEN)
}

/// Path of a generation file with the given extension, e.g. `cache-0.tape`.
#[must_use]
pub fn generation_file(base: &Path, extension: &str) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs_err::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

impl TopicCache {
    /// Opens or creates the cache stored at `base` (`<dir>/cache-N`, without extension).
    ///
    /// A data file that fails validation is deleted and replaced by an empty one.
    pub fn open(
        topic: impl Into<String>,
        base: impl Into<PathBuf>,
        key_schema: Schema,
        value_schema: Schema,
        config: CacheConfiguration,
        worker: Arc<CacheWorker>,
    ) -> Result<Self> {
        let topic = topic.into();
        let base = base.into();
        let tape_path = generation_file(&base, TAPE_EXTENSION);
        if let Some(parent) = tape_path.parent() {
            fs_err::create_dir_all(parent)?;
        }

        let open = || {
            RecordQueue::open(
                &tape_path,
                MINIMUM_QUEUE_LEN,
                size_limit(&config),
                RecordCodec::new(key_schema.clone(), value_schema.clone()),
            )
        };
        let queue = match open() {
            Err(err) if err.is_corruption() => {
                tracing::error!(
                    topic = %topic,
                    path = %tape_path.display(),
                    error = %err,
                    "cache file is corrupt, replacing it with an empty one"
                );
                remove_if_exists(&tape_path)?;
                open()?
            }
            other => other?,
        };
        tracing::debug!(
            topic = %topic,
            path = %tape_path.display(),
            count = queue.len(),
            "opened topic cache"
        );

        let inner = CacheInner {
            committed_bytes: AtomicU64::new(queue.used_bytes()),
            pending: Mutex::new(Pending {
                records: Vec::new(),
                bytes: 0,
                codec: RecordCodec::new(key_schema.clone(), value_schema.clone()),
                flush: None,
            }),
            queue: Mutex::new(Some(queue)),
            topic,
            base,
            tape_path,
            key_schema,
            value_schema,
            worker,
            config: Mutex::new(config),
            closed: AtomicBool::new(false),
            read_only: AtomicBool::new(false),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Generation path without extension.
    #[must_use]
    pub fn base_path(&self) -> &Path {
        &self.inner.base
    }

    /// Path of the ring-buffer data file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.tape_path
    }

    #[must_use]
    pub fn key_schema(&self) -> &Schema {
        &self.inner.key_schema
    }

    #[must_use]
    pub fn value_schema(&self) -> &Schema {
        &self.inner.value_schema
    }

    #[must_use]
    pub fn configuration(&self) -> CacheConfiguration {
        *lock_unpoisoned(&self.inner.config)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stops accepting new measurements. Stored records can still be read and removed.
    pub fn mark_read_only(&self) {
        self.inner.read_only.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.inner.read_only.load(Ordering::Acquire)
    }

    /// Whether two handles refer to the same cache.
    #[must_use]
    pub fn same_cache(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Validates a record and buffers it until the next flush.
    ///
    /// Fails with `CapacityExceeded` when the committed bytes plus everything pending
    /// would no longer fit in the maximum file size.
    pub fn add_measurement(&self, key: Datum, value: Datum) -> Result<()> {
        if self.is_closed() {
            return Err(TapeError::Closed);
        }
        if self.is_read_only() {
            return Err(TapeError::ReadOnly {
                path: self.inner.tape_path.clone(),
            });
        }
        let config = self.configuration();
        let record = Record::new(key, value);
        let mut pending = lock_unpoisoned(&self.inner.pending);
        let encoded = pending.codec.encode(&record)?.len() as u64;
        if encoded == 0 {
            return Err(TapeError::validation("record encodes to zero bytes"));
        }
        let used = self.inner.committed_bytes.load(Ordering::Acquire) + pending.bytes;
        let required = used + encoded + ELEMENT_HEADER_LEN;
        let limit = size_limit(&config);
        if required > limit {
            return Err(TapeError::CapacityExceeded {
                used,
                limit,
                required,
            });
        }
        pending.records.push(record);
        pending.bytes += encoded + ELEMENT_HEADER_LEN;

        if pending.flush.as_ref().is_none_or(ScheduledTask::is_done) {
            let weak = Arc::downgrade(&self.inner);
            let task = self.inner.worker.schedule(config.commit_rate, move || {
                if let Some(inner) = weak.upgrade() {
                    if let Err(err) = inner.flush_pending() {
                        tracing::error!(
                            topic = %inner.topic,
                            error = %err,
                            "scheduled flush failed"
                        );
                    }
                }
            })?;
            pending.flush = Some(task);
        }
        Ok(())
    }

    /// Records buffered but not yet committed.
    #[must_use]
    pub fn pending_records(&self) -> usize {
        lock_unpoisoned(&self.inner.pending).records.len()
    }

    fn call<R: Send + 'static>(
        &self,
        op: impl FnOnce(&CacheInner) -> Result<R> + Send + 'static,
    ) -> Result<R> {
        let inner = Arc::clone(&self.inner);
        self.inner.worker.call(move || op(&inner))?
    }

    /// Commits every pending record now and waits for it.
    pub fn flush(&self) -> Result<()> {
        self.call(|inner| inner.flush_pending())
    }

    /// Oldest committed records that share the first valid record's key.
    ///
    /// Leading records that can no longer be decoded are removed from the file.
    pub fn unsent_records(&self, limit: usize, size_limit: u64) -> Result<Option<RecordBatch>> {
        self.call(move |inner| {
            let topic = inner.topic.clone();
            inner.with_queue(|queue| unsent_batch(queue, &topic, limit, size_limit))
        })
    }

    /// Oldest committed entries, whatever their key, for inspection.
    pub fn records(&self, limit: usize) -> Result<Vec<Entry<Record>>> {
        self.call(move |inner| inner.with_queue(|queue| queue.peek(limit, u64::MAX)))
    }

    /// Removes the `count` oldest committed records.
    pub fn remove(&self, count: usize) -> Result<()> {
        self.call(move |inner| inner.with_queue(|queue| queue.remove(count)))
    }

    /// Committed records. Pending records are not counted.
    pub fn number_of_records(&self) -> Result<usize> {
        self.call(|inner| inner.with_queue(|queue| Ok(queue.len())))
    }

    /// Bytes used by committed records, header included.
    #[must_use]
    pub fn committed_bytes(&self) -> u64 {
        self.inner.committed_bytes.load(Ordering::Acquire)
    }

    pub fn file_size(&self) -> Result<u64> {
        self.call(|inner| inner.with_queue(|queue| Ok(queue.file_size())))
    }

    /// Applies a new configuration. The maximum size takes effect immediately, the
    /// commit rate from the next scheduled flush on.
    pub fn set_configuration(&self, config: CacheConfiguration) -> Result<()> {
        *lock_unpoisoned(&self.inner.config) = config;
        self.call(move |inner| {
            inner.with_queue(|queue| {
                queue.set_maximum_length(size_limit(&config));
                Ok(())
            })
        })
    }

    /// Flushes pending records and closes the file. Later calls fail with `Closed`.
    pub fn close(&self) -> Result<()> {
        self.call(|inner| inner.close_now())
    }

    /// Closes the cache and deletes its data and schema files.
    pub fn delete(&self) -> Result<()> {
        let result = self.close();
        for extension in [TAPE_EXTENSION, KEY_SCHEMA_EXTENSION, VALUE_SCHEMA_EXTENSION] {
            remove_if_exists(&generation_file(&self.inner.base, extension))?;
        }
        tracing::info!(
            topic = %self.inner.topic,
            path = %self.inner.base.display(),
            "deleted cache"
        );
        result
    }
}

fn unsent_batch(
    queue: &mut Queue,
    topic: &str,
    limit: usize,
    size_limit: u64,
) -> Result<Option<RecordBatch>> {
    loop {
        let entries = queue.peek(limit, size_limit)?;
        if entries.is_empty() {
            return Ok(None);
        }
        let invalid = entries.iter().take_while(|entry| !entry.is_valid()).count();
        if invalid > 0 {
            if let Some(Entry::Invalid { reason }) = entries.first() {
                tracing::warn!(
                    topic,
                    count = invalid,
                    reason = %reason,
                    "removing invalid records"
                );
            }
            queue.remove(invalid)?;
        }

        let mut records: Vec<Record> = Vec::new();
        for entry in entries.into_iter().skip(invalid) {
            match entry {
                Entry::Valid(record)
                    if records.first().is_none_or(|first| first.key == record.key) =>
                {
                    records.push(record);
                }
                _ => break,
            }
        }
        if !records.is_empty() {
            return Ok(Some(RecordBatch {
                topic: topic.to_string(),
                records,
            }));
        }
    }
}

impl CacheInner {
    /// Runs `op` on the open queue, recreating the file if it turns out to be corrupt.
    fn with_queue<R>(&self, op: impl FnOnce(&mut Queue) -> Result<R>) -> Result<R> {
        let mut slot = lock_unpoisoned(&self.queue);
        let queue = slot.as_mut().ok_or(TapeError::Closed)?;
        let result = op(queue);
        self.committed_bytes
            .store(queue.used_bytes(), Ordering::Release);
        if let Err(err) = &result {
            if err.is_corruption() {
                self.recover(&mut slot, err);
            }
        }
        result
    }

    fn recover(&self, slot: &mut Option<Queue>, cause: &TapeError) {
        tracing::error!(
            topic = %self.topic,
            path = %self.tape_path.display(),
            error = %cause,
            "cache file is corrupt, recreating it empty"
        );
        if let Some(mut queue) = slot.take() {
            let _ = queue.close();
        }
        self.committed_bytes.store(HEADER_LEN, Ordering::Release);
        let maximum = size_limit(&lock_unpoisoned(&self.config));
        let reopened = remove_if_exists(&self.tape_path).and_then(|()| {
            RecordQueue::open(
                &self.tape_path,
                MINIMUM_QUEUE_LEN,
                maximum,
                RecordCodec::new(self.key_schema.clone(), self.value_schema.clone()),
            )
        });
        match reopened {
            Ok(queue) => *slot = Some(queue),
            Err(err) => tracing::error!(
                topic = %self.topic,
                error = %err,
                "could not recreate cache file"
            ),
        }
    }

    fn flush_pending(&self) -> Result<()> {
        // The byte count stays reserved until the records are committed, so concurrent
        // capacity checks never see them missing from both sides.
        let (records, bytes) = {
            let mut pending = lock_unpoisoned(&self.pending);
            if let Some(task) = pending.flush.take() {
                task.cancel();
            }
            let records = std::mem::take(&mut pending.records);
            (records, pending.bytes)
        };
        if records.is_empty() {
            return Ok(());
        }
        let result = self.with_queue(|queue| {
            queue.add_all(&records)?;
            queue.flush()
        });
        let mut pending = lock_unpoisoned(&self.pending);
        match result {
            Ok(()) => {
                pending.bytes -= bytes;
                tracing::debug!(topic = %self.topic, count = records.len(), "committed records");
                Ok(())
            }
            Err(err @ TapeError::Io { .. }) => {
                // Keep the records for the next attempt.
                let newer = std::mem::replace(&mut pending.records, records);
                pending.records.extend(newer);
                Err(err)
            }
            Err(err) => {
                pending.bytes -= bytes;
                tracing::warn!(
                    topic = %self.topic,
                    count = records.len(),
                    error = %err,
                    "dropping records that could not be stored"
                );
                Err(err)
            }
        }
    }

    fn close_now(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let flushed = self.flush_pending();
        let closed = match lock_unpoisoned(&self.queue).take() {
            Some(mut queue) => queue.close(),
            None => Ok(()),
        };
        flushed.and(closed)
    }
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        if let Err(err) = self.close_now() {
            tracing::warn!(topic = %self.topic, error = %err, "closing cache on drop failed");
        }
    }
}

impl std::fmt::Debug for TopicCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicCache")
            .field("topic", &self.inner.topic)
            .field("path", &self.inner.tape_path)
            .field("committed_bytes", &self.committed_bytes())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::RingQueue;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn schemas() -> (Schema, Schema) {
        let key = Schema::parse(
            r#"{"type": "record", "name": "Key", "fields": [
                {"name": "source", "type": "string"}
            ]}"#,
        )
        .expect("key schema");
        (key, Schema::Long)
    }

    fn key(source: &str) -> Datum {
        Datum::Record(vec![("source".into(), Datum::String(source.into()))])
    }

    fn open(dir: &TempDir, config: CacheConfiguration) -> TopicCache {
        let (key_schema, value_schema) = schemas();
        TopicCache::open(
            "steps",
            dir.path().join("steps").join("cache-0"),
            key_schema,
            value_schema,
            config,
            CacheWorker::shared().expect("worker"),
        )
        .expect("open cache")
    }

    fn slow_commits() -> CacheConfiguration {
        CacheConfiguration {
            commit_rate: Duration::from_secs(3600),
            maximum_size: 64 * 1024,
        }
    }

    #[test]
    fn flush_commits_pending_records() -> Result<()> {
        let dir = TempDir::new()?;
        let cache = open(&dir, slow_commits());
        cache.add_measurement(key("a"), Datum::Long(1))?;
        cache.add_measurement(key("a"), Datum::Long(2))?;
        assert_eq!(cache.pending_records(), 2);
        assert_eq!(cache.number_of_records()?, 0);

        cache.flush()?;
        assert_eq!(cache.pending_records(), 0);
        assert_eq!(cache.number_of_records()?, 2);
        Ok(())
    }

    #[test]
    fn scheduled_flush_runs_after_commit_rate() -> Result<()> {
        let dir = TempDir::new()?;
        let cache = open(
            &dir,
            CacheConfiguration {
                commit_rate: Duration::from_millis(20),
                maximum_size: 64 * 1024,
            },
        );
        cache.add_measurement(key("a"), Datum::Long(1))?;
        let deadline = Instant::now() + Duration::from_secs(5);
        while cache.number_of_records()? == 0 {
            assert!(Instant::now() < deadline, "scheduled flush never ran");
            std::thread::sleep(Duration::from_millis(10));
        }
        Ok(())
    }

    #[test]
    fn unsent_records_groups_by_key() -> Result<()> {
        let dir = TempDir::new()?;
        let cache = open(&dir, slow_commits());
        for (source, value) in [("a", 1), ("a", 2), ("b", 3), ("a", 4)] {
            cache.add_measurement(key(source), Datum::Long(value))?;
        }
        cache.flush()?;

        let batch = cache.unsent_records(10, u64::MAX)?.expect("batch");
        assert_eq!(batch.topic, "steps");
        assert_eq!(batch.key(), Some(&key("a")));
        assert_eq!(batch.len(), 2);
        cache.remove(batch.len())?;

        let batch = cache.unsent_records(10, u64::MAX)?.expect("batch");
        assert_eq!(batch.key(), Some(&key("b")));
        assert_eq!(batch.len(), 1);
        Ok(())
    }

    #[test]
    fn invalid_records_are_rejected_up_front() -> Result<()> {
        let dir = TempDir::new()?;
        let cache = open(&dir, slow_commits());
        let err = cache
            .add_measurement(key("a"), Datum::String("not a long".into()))
            .expect_err("wrong type");
        assert!(matches!(err, TapeError::Validation { .. }));
        assert_eq!(cache.pending_records(), 0);
        Ok(())
    }

    #[test]
    fn capacity_counts_pending_records() -> Result<()> {
        let dir = TempDir::new()?;
        let (key_schema, _) = schemas();
        let cache = TopicCache::open(
            "blobs",
            dir.path().join("blobs").join("cache-0"),
            key_schema,
            Schema::Bytes,
            CacheConfiguration {
                commit_rate: Duration::from_secs(3600),
                maximum_size: 4096,
            },
            CacheWorker::shared()?,
        )?;
        cache.add_measurement(key("a"), Datum::Bytes(vec![7; 2000]))?;
        let err = cache
            .add_measurement(key("a"), Datum::Bytes(vec![7; 2100]))
            .expect_err("pending bytes count toward the limit");
        assert!(matches!(err, TapeError::CapacityExceeded { .. }));
        cache.flush()?;
        assert_eq!(cache.number_of_records()?, 1);
        Ok(())
    }

    #[test]
    fn invalid_stored_records_are_dropped_from_batches() -> Result<()> {
        let dir = TempDir::new()?;
        let base = dir.path().join("steps").join("cache-0");
        fs_err::create_dir_all(dir.path().join("steps"))?;
        {
            let mut raw = RingQueue::open(
                &generation_file(&base, TAPE_EXTENSION),
                MINIMUM_QUEUE_LEN,
                64 * 1024,
            )?;
            raw.add(&[0xFF, 0xFF, 0xFF])?;
            raw.close()?;
        }
        let cache = open(&dir, slow_commits());
        cache.add_measurement(key("a"), Datum::Long(5))?;
        cache.flush()?;
        assert_eq!(cache.number_of_records()?, 2);

        let batch = cache.unsent_records(10, u64::MAX)?.expect("valid batch");
        assert_eq!(batch.len(), 1);
        assert_eq!(cache.number_of_records()?, 1);
        Ok(())
    }

    #[test]
    fn corrupt_file_is_replaced_on_open() -> Result<()> {
        let dir = TempDir::new()?;
        let base = dir.path().join("steps").join("cache-0");
        fs_err::create_dir_all(dir.path().join("steps"))?;
        fs_err::write(generation_file(&base, TAPE_EXTENSION), vec![0xAB; 4096])?;

        let cache = open(&dir, slow_commits());
        assert_eq!(cache.number_of_records()?, 0);
        cache.add_measurement(key("a"), Datum::Long(1))?;
        cache.flush()?;
        assert_eq!(cache.number_of_records()?, 1);
        Ok(())
    }

    #[test]
    fn corruption_found_while_reading_recreates_the_file() -> Result<()> {
        let dir = TempDir::new()?;
        let tape = generation_file(&dir.path().join("steps").join("cache-0"), TAPE_EXTENSION);
        {
            let cache = open(&dir, slow_commits());
            for value in 1..=3 {
                cache.add_measurement(key("a"), Datum::Long(value))?;
            }
            cache.close()?;
        }
        let first = {
            let mut raw = RingQueue::open(&tape, MINIMUM_QUEUE_LEN, 64 * 1024)?;
            let first = raw.header().first_position;
            raw.close()?;
            first as usize
        };
        // Opening only checks the first and last descriptors, so break the middle one.
        let mut bytes = fs_err::read(&tape)?;
        let mut length = [0u8; 4];
        length.copy_from_slice(&bytes[first..first + 4]);
        let second = first + ELEMENT_HEADER_LEN as usize + u32::from_le_bytes(length) as usize;
        bytes[second + 4] ^= 0xFF;
        fs_err::write(&tape, bytes)?;

        let cache = open(&dir, slow_commits());
        assert_eq!(cache.number_of_records()?, 3);
        let err = cache.records(10).expect_err("broken descriptor");
        assert!(err.is_corruption(), "{err}");
        assert_eq!(cache.number_of_records()?, 0);
        assert_eq!(cache.committed_bytes(), HEADER_LEN);

        cache.add_measurement(key("b"), Datum::Long(9))?;
        cache.flush()?;
        assert_eq!(
            cache.records(10)?,
            vec![Entry::Valid(Record::new(key("b"), Datum::Long(9)))]
        );
        Ok(())
    }

    #[test]
    fn records_survive_reopen() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let cache = open(&dir, slow_commits());
            cache.add_measurement(key("a"), Datum::Long(42))?;
            cache.close()?;
            assert!(matches!(
                cache.add_measurement(key("a"), Datum::Long(43)),
                Err(TapeError::Closed)
            ));
        }
        let cache = open(&dir, slow_commits());
        let records = cache.records(10)?;
        assert_eq!(
            records,
            vec![Entry::Valid(Record::new(key("a"), Datum::Long(42)))]
        );
        Ok(())
    }

    #[test]
    fn dropping_the_last_handle_flushes() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let cache = open(&dir, slow_commits());
            cache.add_measurement(key("a"), Datum::Long(1))?;
        }
        let cache = open(&dir, slow_commits());
        assert_eq!(cache.number_of_records()?, 1);
        Ok(())
    }
}
