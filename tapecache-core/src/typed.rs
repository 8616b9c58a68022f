//! Typed view over a [`RingQueue`].

use std::io::Write;
use std::marker::PhantomData;
use std::path::Path;

use crate::error::Result;
use crate::queue::RingQueue;

/// Converts values to and from the bytes of one queue element.
pub trait Converter<T> {
    /// Writes the serialized form of `value` to `out`.
    fn serialize(&mut self, value: &T, out: &mut dyn Write) -> Result<()>;

    /// Reads a value back from the full payload of one element.
    fn deserialize(&self, bytes: &[u8]) -> Result<T>;
}

/// One stored element as seen through a converter.
#[derive(Debug, Clone, PartialEq)]
pub enum Entry<T> {
    Valid(T),
    /// The element is intact on disk but its payload could not be converted.
    Invalid { reason: String },
}

impl<T> Entry<T> {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }

    #[must_use]
    pub fn valid(self) -> Option<T> {
        match self {
            Self::Valid(value) => Some(value),
            Self::Invalid { .. } => None,
        }
    }

    #[must_use]
    pub fn as_valid(&self) -> Option<&T> {
        match self {
            Self::Valid(value) => Some(value),
            Self::Invalid { .. } => None,
        }
    }
}

/// FIFO queue of `T` values persisted through converter `C`.
pub struct RecordQueue<T, C> {
    queue: RingQueue,
    converter: C,
    _marker: PhantomData<fn() -> T>,
}

impl<T, C: Converter<T>> RecordQueue<T, C> {
    pub fn new(queue: RingQueue, converter: C) -> Self {
        Self {
            queue,
            converter,
            _marker: PhantomData,
        }
    }

    pub fn open(
        path: &Path,
        minimum_length: u64,
        maximum_length: u64,
        converter: C,
    ) -> Result<Self> {
        Ok(Self::new(
            RingQueue::open(path, minimum_length, maximum_length)?,
            converter,
        ))
    }

    /// Appends one value.
    pub fn add(&mut self, value: &T) -> Result<()> {
        self.add_all(std::slice::from_ref(value))
    }

    /// Appends every value in one stream with a single commit; on error none of them
    /// become visible.
    pub fn add_all(&mut self, values: &[T]) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let mut writer = self.queue.writer()?;
        for value in values {
            self.converter.serialize(value, &mut writer)?;
            writer.next()?;
        }
        writer.commit()
    }

    /// Up to `max` oldest entries, bounded by `size_limit` payload bytes.
    pub fn peek(&mut self, max: usize, size_limit: u64) -> Result<Vec<Entry<T>>> {
        let payloads = self.queue.peek(max, size_limit)?;
        Ok(payloads.iter().map(|bytes| self.convert(bytes)).collect())
    }

    fn convert(&self, bytes: &[u8]) -> Entry<T> {
        match self.converter.deserialize(bytes) {
            Ok(value) => Entry::Valid(value),
            Err(err) => Entry::Invalid {
                reason: err.to_string(),
            },
        }
    }

    pub fn remove(&mut self, count: usize) -> Result<()> {
        self.queue.remove(count)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) -> Result<()> {
        self.queue.clear()
    }

    /// Iterates over every entry, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = Result<Entry<T>>> + '_ {
        self.queue
            .iter()
            .map(|payload| payload.map(|bytes| self.convert(&bytes)))
    }

    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.queue.used_bytes()
    }

    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.queue.file_size()
    }

    pub fn set_maximum_length(&mut self, maximum_length: u64) {
        self.queue.set_maximum_length(maximum_length);
    }

    pub fn flush(&mut self) -> Result<()> {
        self.queue.flush()
    }

    pub fn close(&mut self) -> Result<()> {
        self.queue.close()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    #[must_use]
    pub fn inner(&self) -> &RingQueue {
        &self.queue
    }

    #[must_use]
    pub fn converter(&self) -> &C {
        &self.converter
    }
}

impl<T, C> std::fmt::Debug for RecordQueue<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordQueue")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}
