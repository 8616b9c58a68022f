//! FIFO queue of byte elements stored in a single ring-buffer file.
//!
//! ```text
//! [ header (36 bytes) | element | element | ... free ... | element ]
//! element: [ length (u32 LE) | checksum (u8) | payload (length bytes) ]
//! ```
//!
//! Elements are appended through an [`ElementWriter`] and only become visible once the
//! writer commits, which rewrites the header in a single write. The file doubles when
//! it runs out of room (up to the configured maximum) and halves again when a drained
//! queue leaves most of it unused.

use std::collections::VecDeque;
use std::io;
use std::path::Path;

use crate::constants::{ELEMENT_CACHE_CAPACITY, ELEMENT_HEADER_LEN, HEADER_LEN};
use crate::error::{Result, TapeError};
use crate::io::{Element, HeaderCodec, QueueHeader, RingStorage};

/// How live positions move when the ring is grown or shrunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Relocation {
    None,
    /// Wrapped bytes at the start of the ring were copied behind the old end of file.
    PrefixAppended { start: u64, old_length: u64 },
    /// Everything from `start` to the old end of file moved `delta` bytes further.
    SuffixForward { start: u64, delta: u64 },
    /// Everything from `start` to the old end of file moved `delta` bytes back.
    SuffixBackward { start: u64, delta: u64 },
    /// The whole unwrapped block moved down to the first data byte.
    BlockToFront { shift: u64 },
}

impl Relocation {
    fn apply(self, position: u64) -> u64 {
        match self {
            Self::None => position,
            Self::PrefixAppended { start, old_length } if position < start => {
                position - HEADER_LEN + old_length
            }
            Self::SuffixForward { start, delta } if position >= start => position + delta,
            Self::SuffixBackward { start, delta } if position >= start => position - delta,
            Self::BlockToFront { shift } => position - shift,
            _ => position,
        }
    }
}

/// Wraps `position` into a ring of `length` bytes.
fn wrap_in(position: u64, length: u64) -> u64 {
    if position < length {
        position
    } else {
        HEADER_LEN + (position - length)
    }
}

/// Durable FIFO queue of byte elements.
pub struct RingQueue {
    storage: RingStorage,
    header: QueueHeader,
    /// Oldest elements, front is the first element of the queue.
    cache: VecDeque<Element>,
    last: Option<Element>,
    mod_count: u64,
}

impl RingQueue {
    /// Opens the queue file at `path`, creating an empty one if it does not exist yet.
    pub fn open(path: &Path, minimum_length: u64, maximum_length: u64) -> Result<Self> {
        let storage = RingStorage::open_file(path, minimum_length, maximum_length)?;
        Self::with_storage(storage).map_err(|err| err.with_path(path))
    }

    /// Opens a private snapshot of an existing queue file.
    ///
    /// Nothing done through the returned queue reaches the file: initialising a zeroed
    /// header or trimming an interrupted growth only changes the snapshot.
    pub fn open_read_only(path: &Path, minimum_length: u64) -> Result<Self> {
        let storage = RingStorage::snapshot(path, minimum_length)?;
        Self::with_storage(storage).map_err(|err| err.with_path(path))
    }

    /// Opens a queue on arbitrary storage. Storage whose header region is zeroed is
    /// initialised as an empty queue.
    pub fn with_storage(mut storage: RingStorage) -> Result<Self> {
        if storage.length() < HEADER_LEN {
            return Err(TapeError::corrupt("file is shorter than the queue header"));
        }
        let mut raw = [0u8; HEADER_LEN as usize];
        storage.read(0, &mut raw)?;
        if raw.iter().all(|byte| *byte == 0) {
            let header = QueueHeader::empty(storage.length());
            HeaderCodec::write(&mut storage, &header)?;
            return Ok(Self {
                storage,
                header,
                cache: VecDeque::new(),
                last: None,
                mod_count: 0,
            });
        }

        let header = HeaderCodec::read(&storage)?;
        if header.length < storage.length() {
            if header.length < storage.minimum_length() {
                return Err(TapeError::corrupt(format!(
                    "queue length {} is below the minimum of {}",
                    header.length,
                    storage.minimum_length()
                )));
            }
            // Growth interrupted before the header was rewritten.
            storage.resize(header.length)?;
        }

        let mut queue = Self {
            storage,
            header,
            cache: VecDeque::new(),
            last: None,
            mod_count: 0,
        };
        if !header.is_empty() {
            let last = Element::read(&queue.storage, header.last_position)?;
            queue.last = Some(last);
            if queue.used_bytes() > queue.storage.length() {
                return Err(TapeError::corrupt("elements exceed the file length"));
            }
            let first = queue.read_element(header.first_position)?;
            queue.cache.push_back(first);
        }
        Ok(queue)
    }

    /// Number of committed elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.header.count as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.header.is_empty()
    }

    /// Bytes in use, header included.
    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        let Some(last) = self.last else {
            return HEADER_LEN;
        };
        let first = self.header.first_position;
        if last.position >= first {
            last.next_position() - first + HEADER_LEN
        } else {
            last.next_position() + self.storage.length() - first
        }
    }

    /// Current size of the backing file.
    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.storage.length()
    }

    #[must_use]
    pub fn maximum_length(&self) -> u64 {
        self.storage.maximum_length()
    }

    /// Changes the growth ceiling without reopening the queue.
    pub fn set_maximum_length(&mut self, maximum_length: u64) {
        self.storage.set_maximum_length(maximum_length);
    }

    #[must_use]
    pub fn header(&self) -> QueueHeader {
        self.header
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.storage.is_closed()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.storage.is_closed() {
            Err(TapeError::Closed)
        } else {
            Ok(())
        }
    }

    /// Reads and bounds-checks the descriptor at a wrapped position.
    fn read_element(&self, position: u64) -> Result<Element> {
        let element = Element::read(&self.storage, position)?;
        let room = self.storage.length() - HEADER_LEN;
        if element.total_len() > room {
            return Err(TapeError::corrupt(format!(
                "element at {position} is longer than the file"
            )));
        }
        Ok(element)
    }

    fn element_after(&self, element: &Element) -> Result<Element> {
        self.read_element(self.storage.wrap(element.next_position()))
    }

    fn read_payload(&self, element: &Element) -> Result<Vec<u8>> {
        let mut payload = vec![0u8; element.length as usize];
        self.storage
            .read(self.storage.wrap(element.data_position()), &mut payload)?;
        Ok(payload)
    }

    /// Starts an append stream. Nothing becomes visible until [`ElementWriter::commit`].
    pub fn writer(&mut self) -> Result<ElementWriter<'_>> {
        self.ensure_open()?;
        let start = match self.last {
            Some(last) => self.storage.wrap(last.next_position()),
            None => HEADER_LEN,
        };
        Ok(ElementWriter {
            queue: self,
            elements: Vec::new(),
            stream_start: start,
            next_position: start,
            element_start: None,
            element_len: 0,
            stream_bytes: 0,
        })
    }

    /// Appends a single element and commits it.
    pub fn add(&mut self, payload: &[u8]) -> Result<()> {
        let mut writer = self.writer()?;
        writer.write_bytes(payload)?;
        writer.next()?;
        writer.commit()
    }

    /// Returns up to `max` oldest elements without removing them.
    ///
    /// Payload sizes accumulate until adding the next element would pass `size_limit`;
    /// the first element is always returned, whatever its size.
    pub fn peek(&mut self, max: usize, size_limit: u64) -> Result<Vec<Vec<u8>>> {
        self.ensure_open()?;
        let wanted = max.min(self.len());
        let mut result = Vec::with_capacity(wanted.min(ELEMENT_CACHE_CAPACITY));
        let mut total = 0u64;
        let mut current: Option<Element> = None;
        for index in 0..wanted {
            let element = match self.cache.get(index) {
                Some(cached) => *cached,
                None => {
                    let element = match current {
                        Some(prev) => self.element_after(&prev)?,
                        None => self.read_element(self.header.first_position)?,
                    };
                    if self.cache.len() == index && self.cache.len() < ELEMENT_CACHE_CAPACITY {
                        self.cache.push_back(element);
                    }
                    element
                }
            };
            if !result.is_empty() && total + u64::from(element.length) > size_limit {
                break;
            }
            total += u64::from(element.length);
            result.push(self.read_payload(&element)?);
            current = Some(element);
        }
        Ok(result)
    }

    /// Oldest element, if any.
    pub fn peek_first(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.peek(1, u64::MAX)?.into_iter().next())
    }

    /// Removes the `count` oldest elements.
    pub fn remove(&mut self, count: usize) -> Result<()> {
        self.ensure_open()?;
        if count == 0 {
            return Ok(());
        }
        let available = self.len();
        if count > available {
            return Err(TapeError::NotEnoughElements {
                requested: count,
                available,
            });
        }
        if count == available {
            return self.clear();
        }

        let new_first = if count < self.cache.len() {
            self.cache.drain(..count);
            self.cache[0]
        } else {
            let (mut element, mut skipped) = match self.cache.back() {
                Some(cached) => (*cached, self.cache.len() - 1),
                None => (self.read_element(self.header.first_position)?, 0),
            };
            while skipped < count {
                element = self.element_after(&element)?;
                skipped += 1;
            }
            self.cache.clear();
            self.cache.push_back(element);
            element
        };

        // count < available, which itself came from the u32 header field
        self.header.count -= count as u32;
        self.header.first_position = new_first.position;
        HeaderCodec::write(&mut self.storage, &self.header)?;
        self.mod_count += 1;
        self.shrink_if_sparse()
    }

    /// Removes every element and truncates the file back to its minimum size.
    pub fn clear(&mut self) -> Result<()> {
        self.ensure_open()?;
        let minimum = self.storage.minimum_length();
        self.header = QueueHeader::empty(minimum);
        HeaderCodec::write(&mut self.storage, &self.header)?;
        if self.storage.length() != minimum {
            self.storage.resize(minimum)?;
        }
        self.cache.clear();
        self.last = None;
        self.mod_count += 1;
        Ok(())
    }

    /// Iterates over all elements, oldest first.
    pub fn iter(&self) -> QueueIter<'_> {
        QueueIter {
            queue: self,
            position: self.header.first_position,
            remaining: self.len(),
            expected_mod_count: self.mod_count,
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        self.storage.flush()
    }

    /// Flushes and closes the file. Further operations fail with `Closed`.
    pub fn close(&mut self) -> Result<()> {
        self.cache.clear();
        self.storage.close()
    }

    fn relocate(&mut self, relocation: Relocation) {
        if relocation == Relocation::None {
            return;
        }
        if !self.header.is_empty() {
            self.header.first_position = relocation.apply(self.header.first_position);
        }
        for element in &mut self.cache {
            element.position = relocation.apply(element.position);
        }
        if let Some(last) = &mut self.last {
            last.position = relocation.apply(last.position);
            self.header.last_position = last.position;
        }
    }

    /// Length to grow to for `required` bytes. Doubles, but jumps straight to the
    /// maximum when the step after would add less than half the file.
    fn grown_length(&self, required: u64) -> u64 {
        let maximum = self.storage.maximum_length();
        let mut length = self.storage.length();
        while length < required {
            let doubled = length.saturating_mul(2);
            length = if doubled.saturating_add(doubled / 2) > maximum {
                maximum
            } else {
                doubled
            };
        }
        length
    }

    /// Chooses how wrapped live bytes move when the file grows to `new_length`.
    ///
    /// Only layouts whose copies land in bytes the current header treats as free are
    /// allowed, so the old header stays valid until the new one is written.
    fn growth_relocation(
        &self,
        new_length: u64,
        live_start: u64,
        live_bytes: u64,
    ) -> Option<Relocation> {
        let old_length = self.storage.length();
        if live_start + live_bytes <= old_length {
            return Some(Relocation::None);
        }
        let prefix = live_start + live_bytes - old_length;
        let suffix = old_length - live_start;
        let delta = new_length - old_length;
        if prefix <= delta {
            Some(Relocation::PrefixAppended {
                start: live_start,
                old_length,
            })
        } else if suffix <= delta {
            Some(Relocation::SuffixForward {
                start: live_start,
                delta,
            })
        } else {
            None
        }
    }

    /// Copies live bytes for `relocation`. The header is not touched.
    fn move_live_bytes(
        &mut self,
        relocation: Relocation,
        old_length: u64,
        live_bytes: u64,
    ) -> Result<()> {
        match relocation {
            Relocation::None => Ok(()),
            Relocation::PrefixAppended { start, old_length } => {
                let prefix = start + live_bytes - old_length;
                self.storage.move_bytes(HEADER_LEN, old_length, prefix)
            }
            Relocation::SuffixForward { start, delta } => {
                self.storage
                    .move_bytes(start, start + delta, old_length - start)
            }
            Relocation::SuffixBackward { start, delta } => {
                self.storage
                    .move_bytes(start, start - delta, old_length - start)
            }
            Relocation::BlockToFront { shift } => {
                self.storage
                    .move_bytes(HEADER_LEN + shift, HEADER_LEN, live_bytes)
            }
        }
    }

    /// Grows the file to hold `required` bytes, keeping `live_bytes` starting at
    /// `live_start` contiguous in the ring. Rewrites the header with the new length.
    fn expand(&mut self, required: u64, live_start: u64, live_bytes: u64) -> Result<Relocation> {
        let old_length = self.storage.length();
        let new_length = self.grown_length(required);
        let Some(relocation) = self.growth_relocation(new_length, live_start, live_bytes) else {
            tracing::warn!(
                from = old_length,
                to = new_length,
                "growing would overwrite wrapped records before the header is updated"
            );
            return Err(TapeError::CapacityExceeded {
                used: HEADER_LEN + live_bytes,
                limit: new_length,
                required,
            });
        };
        self.storage.resize(new_length)?;
        self.move_live_bytes(relocation, old_length, live_bytes)?;

        self.relocate(relocation);
        self.header.length = new_length;
        HeaderCodec::write(&mut self.storage, &self.header)?;
        tracing::debug!(
            from = old_length,
            to = new_length,
            ?relocation,
            "expanded queue file"
        );
        Ok(relocation)
    }

    /// Chooses how live bytes move when the file shrinks to `target`, under the same
    /// rule as growth: copies never land on bytes the current header still uses.
    fn shrink_relocation(&self, target: u64, last: Element) -> Option<Relocation> {
        let length = self.storage.length();
        let first = self.header.first_position;
        let live = self.used_bytes() - HEADER_LEN;
        if last.position >= first && last.next_position() <= length {
            if last.next_position() <= target {
                Some(Relocation::None)
            } else if HEADER_LEN + live <= first {
                Some(Relocation::BlockToFront {
                    shift: first - HEADER_LEN,
                })
            } else {
                None
            }
        } else {
            let wrapped_end = wrap_in(last.next_position(), length);
            let destination = target.checked_sub(length - first)?;
            (first >= target && destination >= wrapped_end).then_some(
                Relocation::SuffixBackward {
                    start: first,
                    delta: length - target,
                },
            )
        }
    }

    /// Halves the file while the live data uses at most a quarter of it.
    fn shrink_if_sparse(&mut self) -> Result<()> {
        let Some(last) = self.last else {
            return Ok(());
        };
        let length = self.storage.length();
        let minimum = self.storage.minimum_length();
        let used = self.used_bytes();
        let mut target = length;
        while target / 2 >= minimum && used.saturating_mul(4) <= target {
            target /= 2;
        }
        let relocation = loop {
            if target >= length {
                return Ok(());
            }
            match self.shrink_relocation(target, last) {
                Some(relocation) => break relocation,
                None => target *= 2,
            }
        };

        self.move_live_bytes(relocation, length, used - HEADER_LEN)?;
        self.relocate(relocation);
        self.header.length = target;
        HeaderCodec::write(&mut self.storage, &self.header)?;
        self.storage.resize(target)?;
        tracing::debug!(from = length, to = target, ?relocation, "shrank queue file");
        Ok(())
    }

    fn commit_elements(&mut self, elements: &[Element]) -> Result<()> {
        let (Some(first_new), Some(last_new)) = (elements.first(), elements.last()) else {
            return Ok(());
        };
        let added = u32::try_from(elements.len()).map_err(|_| TapeError::CapacityExceeded {
            used: self.used_bytes(),
            limit: self.storage.maximum_length(),
            required: u64::MAX,
        })?;
        let was_empty = self.header.is_empty();
        let mut header = self.header;
        if was_empty {
            header.first_position = first_new.position;
        }
        header.count += added;
        header.last_position = last_new.position;
        header.length = self.storage.length();
        HeaderCodec::write(&mut self.storage, &header)?;

        let cache_complete = self.cache.len() == self.header.count as usize;
        self.header = header;
        self.last = Some(*last_new);
        if was_empty || cache_complete {
            for element in elements {
                if self.cache.len() >= ELEMENT_CACHE_CAPACITY {
                    break;
                }
                self.cache.push_back(*element);
            }
        }
        self.mod_count += 1;
        Ok(())
    }
}

impl std::fmt::Debug for RingQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingQueue")
            .field("file_size", &self.file_size())
            .field("count", &self.header.count)
            .field("first_position", &self.header.first_position)
            .field("last_position", &self.header.last_position)
            .field("used_bytes", &self.used_bytes())
            .finish()
    }
}

/// Append stream over a [`RingQueue`].
///
/// Call [`next`](Self::next) after each element and [`commit`](Self::commit) to make the
/// elements durable. Dropping the writer without committing discards everything written.
pub struct ElementWriter<'a> {
    queue: &'a mut RingQueue,
    elements: Vec<Element>,
    stream_start: u64,
    next_position: u64,
    element_start: Option<u64>,
    element_len: u64,
    stream_bytes: u64,
}

impl ElementWriter<'_> {
    /// Appends bytes to the current element, growing the file when needed.
    pub fn write_bytes(&mut self, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let opening = self.element_start.is_none();
        let additional = buf.len() as u64 + if opening { ELEMENT_HEADER_LEN } else { 0 };
        if let Err(err) = self.ensure_capacity(additional) {
            self.discard_element();
            return Err(err);
        }
        if opening {
            self.element_start = Some(self.next_position);
            self.advance(ELEMENT_HEADER_LEN);
        }
        self.queue.storage.write(self.next_position, buf)?;
        self.advance(buf.len() as u64);
        self.element_len += buf.len() as u64;
        Ok(())
    }

    fn advance(&mut self, count: u64) {
        self.next_position = wrap_in(self.next_position + count, self.queue.storage.length());
        self.stream_bytes += count;
    }

    fn discard_element(&mut self) {
        if let Some(start) = self.element_start.take() {
            self.stream_bytes -= ELEMENT_HEADER_LEN + self.element_len;
            self.next_position = start;
        }
        self.element_len = 0;
    }

    fn ensure_capacity(&mut self, additional: u64) -> Result<()> {
        let committed = self.queue.used_bytes();
        let required = committed + self.stream_bytes + additional;
        let limit = self.queue.storage.maximum_length();
        if required > limit {
            return Err(TapeError::CapacityExceeded {
                used: committed + self.stream_bytes,
                limit,
                required,
            });
        }
        if required <= self.queue.storage.length() {
            return Ok(());
        }

        let live_start = if self.queue.is_empty() {
            self.stream_start
        } else {
            self.queue.header.first_position
        };
        let live_bytes = committed - HEADER_LEN + self.stream_bytes;
        let relocation = self.queue.expand(required, live_start, live_bytes)?;

        for element in &mut self.elements {
            element.position = relocation.apply(element.position);
        }
        self.element_start = self.element_start.map(|start| relocation.apply(start));
        let new_start = relocation.apply(live_start);
        if self.queue.is_empty() {
            self.stream_start = new_start;
        }
        self.next_position = wrap_in(new_start + live_bytes, self.queue.storage.length());
        Ok(())
    }

    /// Finishes the current element by writing its descriptor.
    pub fn next(&mut self) -> Result<()> {
        let Some(start) = self.element_start.take() else {
            return Err(TapeError::validation("cannot store an empty element"));
        };
        let length = u32::try_from(self.element_len).map_err(|_| {
            TapeError::validation(format!("element of {} bytes is too large", self.element_len))
        })?;
        let element = Element::new(start, length);
        element.write_descriptor(&mut self.queue.storage)?;
        self.elements.push(element);
        self.element_len = 0;
        Ok(())
    }

    /// Number of finished elements in this stream.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.elements.len()
    }

    /// Makes every finished element durable with a single header write.
    ///
    /// A trailing element that was written but not finished with `next` is finished first.
    pub fn commit(mut self) -> Result<()> {
        if self.element_start.is_some() {
            self.next()?;
        }
        let elements = std::mem::take(&mut self.elements);
        self.queue.commit_elements(&elements)
    }
}

impl io::Write for ElementWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf).map_err(io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Snapshot iterator over the elements of a queue, oldest first.
pub struct QueueIter<'a> {
    queue: &'a RingQueue,
    position: u64,
    remaining: usize,
    expected_mod_count: u64,
}

impl Iterator for QueueIter<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        if self.queue.mod_count != self.expected_mod_count {
            self.remaining = 0;
            return Some(Err(TapeError::ConcurrentModification));
        }
        let result = self.queue.read_element(self.position).and_then(|element| {
            let payload = self.queue.read_payload(&element)?;
            self.position = self.queue.storage.wrap(element.next_position());
            Ok(payload)
        });
        self.remaining = if result.is_ok() { self.remaining - 1 } else { 0 };
        Some(result)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::MINIMUM_QUEUE_LEN;
    use std::io::Write;

    fn memory_queue(maximum: u64) -> RingQueue {
        RingQueue::with_storage(RingStorage::memory(MINIMUM_QUEUE_LEN, maximum))
            .expect("memory queue")
    }

    fn payload(tag: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| tag.wrapping_add(i as u8)).collect()
    }

    fn contents(queue: &RingQueue) -> Vec<Vec<u8>> {
        queue
            .iter()
            .collect::<Result<Vec<_>>>()
            .expect("iterate queue")
    }

    #[test]
    fn add_peek_remove_fifo() -> Result<()> {
        let mut queue = memory_queue(MINIMUM_QUEUE_LEN);
        queue.add(b"one")?;
        queue.add(b"two")?;
        queue.add(b"three")?;
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.peek_first()?, Some(b"one".to_vec()));
        queue.remove(1)?;
        assert_eq!(contents(&queue), vec![b"two".to_vec(), b"three".to_vec()]);
        assert_eq!(queue.used_bytes(), HEADER_LEN + 2 * ELEMENT_HEADER_LEN + 8);
        Ok(())
    }

    #[test]
    fn stream_commits_multiple_elements_at_once() -> Result<()> {
        let mut queue = memory_queue(MINIMUM_QUEUE_LEN);
        {
            let mut writer = queue.writer()?;
            writer.write_all(b"alpha")?;
            writer.next()?;
            writer.write_all(b"be")?;
            writer.write_all(b"ta")?;
            writer.next()?;
            assert_eq!(writer.pending(), 2);
            writer.commit()?;
        }
        assert_eq!(contents(&queue), vec![b"alpha".to_vec(), b"beta".to_vec()]);
        Ok(())
    }

    #[test]
    fn dropped_stream_leaves_queue_untouched() -> Result<()> {
        let mut queue = memory_queue(MINIMUM_QUEUE_LEN);
        queue.add(b"kept")?;
        {
            let mut writer = queue.writer()?;
            writer.write_bytes(b"lost")?;
            writer.next()?;
        }
        assert_eq!(contents(&queue), vec![b"kept".to_vec()]);
        Ok(())
    }

    #[test]
    fn next_without_bytes_is_rejected() -> Result<()> {
        let mut queue = memory_queue(MINIMUM_QUEUE_LEN);
        let mut writer = queue.writer()?;
        let err = writer.next().expect_err("empty element");
        assert!(matches!(err, TapeError::Validation { .. }));
        Ok(())
    }

    #[test]
    fn peek_respects_size_limit_but_returns_one() -> Result<()> {
        let mut queue = memory_queue(MINIMUM_QUEUE_LEN);
        for tag in 0..4 {
            queue.add(&payload(tag, 100))?;
        }
        assert_eq!(queue.peek(10, 250)?.len(), 2);
        assert_eq!(queue.peek(10, 10)?.len(), 1);
        assert_eq!(queue.peek(3, u64::MAX)?.len(), 3);
        assert_eq!(queue.peek(0, u64::MAX)?.len(), 0);
        Ok(())
    }

    #[test]
    fn remove_more_than_available_fails() -> Result<()> {
        let mut queue = memory_queue(MINIMUM_QUEUE_LEN);
        queue.add(b"a")?;
        let err = queue.remove(2).expect_err("only one element");
        assert!(matches!(
            err,
            TapeError::NotEnoughElements {
                requested: 2,
                available: 1
            }
        ));
        assert_eq!(queue.len(), 1);
        Ok(())
    }

    #[test]
    fn capacity_scenario_reuses_space() -> Result<()> {
        let mut queue = memory_queue(4096);
        for tag in 0..3 {
            queue.add(&payload(tag, 300))?;
        }
        assert_eq!(queue.len(), 3);
        queue.remove(2)?;
        assert_eq!(queue.len(), 1);

        let mut tag = 10u8;
        let err = loop {
            match queue.add(&payload(tag, 300)) {
                Ok(()) => tag += 1,
                Err(err) => break err,
            }
        };
        assert!(matches!(err, TapeError::CapacityExceeded { .. }));
        assert!(queue.used_bytes() <= 4096);
        let before = contents(&queue);

        queue.remove(1)?;
        queue.add(&payload(200, 300))?;
        let after = contents(&queue);
        assert_eq!(after.len(), before.len());
        assert_eq!(after.last(), Some(&payload(200, 300)));
        assert_eq!(&after[..after.len() - 1], &before[1..]);
        Ok(())
    }

    #[test]
    fn failed_append_keeps_committed_data() -> Result<()> {
        let mut queue = memory_queue(4096);
        queue.add(&payload(1, 1000))?;
        let err = queue.add(&payload(2, 4000)).expect_err("too large");
        assert!(matches!(err, TapeError::CapacityExceeded { .. }));
        assert_eq!(contents(&queue), vec![payload(1, 1000)]);
        queue.add(&payload(3, 1000))?;
        assert_eq!(queue.len(), 2);
        Ok(())
    }

    #[test]
    fn grows_and_relocates_wrapped_data() -> Result<()> {
        let mut queue = memory_queue(64 * 1024);
        for tag in 0..3 {
            queue.add(&payload(tag, 1000))?;
        }
        queue.remove(2)?;
        // Wraps around the end of the 4 KiB file.
        for tag in 3..6 {
            queue.add(&payload(tag, 1000))?;
        }
        assert_eq!(queue.file_size(), MINIMUM_QUEUE_LEN);
        queue.add(&payload(6, 1000))?;
        assert!(queue.file_size() > MINIMUM_QUEUE_LEN);
        let expected: Vec<_> = [2u8, 3, 4, 5, 6].iter().map(|t| payload(*t, 1000)).collect();
        assert_eq!(contents(&queue), expected);
        Ok(())
    }

    /// Four 1000-byte records wrapped around the end of a 4 KiB file with 40 bytes free.
    fn wrapped_full_queue(maximum: u64, removed: u8) -> Result<RingQueue> {
        let mut queue = memory_queue(maximum);
        for tag in 0..=removed {
            queue.add(&payload(tag, 1000))?;
        }
        queue.remove(usize::from(removed))?;
        for tag in removed + 1..removed + 4 {
            queue.add(&payload(tag, 1000))?;
        }
        assert_eq!(queue.file_size(), MINIMUM_QUEUE_LEN);
        assert_eq!(queue.used_bytes(), MINIMUM_QUEUE_LEN - 40);
        assert_eq!(queue.len(), 4);
        Ok(queue)
    }

    /// Copies live bytes the way a relocation does, then reopens the storage as if
    /// the process stopped before the header was rewritten.
    fn reopen_after_moves(
        mut queue: RingQueue,
        new_length: u64,
        relocation: Relocation,
    ) -> Result<RingQueue> {
        let old_length = queue.storage.length();
        let live = queue.used_bytes() - HEADER_LEN;
        if new_length > old_length {
            queue.storage.resize(new_length)?;
        }
        queue.move_live_bytes(relocation, old_length, live)?;
        let placeholder = RingStorage::memory(MINIMUM_QUEUE_LEN, MINIMUM_QUEUE_LEN);
        RingQueue::with_storage(std::mem::replace(&mut queue.storage, placeholder))
    }

    /// Moves the head forward like `remove` does, without shrinking the file.
    fn drop_front_without_shrinking(queue: &mut RingQueue, count: usize) -> Result<()> {
        let mut element = queue.read_element(queue.header.first_position)?;
        for _ in 0..count {
            element = queue.element_after(&element)?;
        }
        queue.header.count -= count as u32;
        queue.header.first_position = element.position;
        queue.cache.clear();
        queue.cache.push_back(element);
        HeaderCodec::write(&mut queue.storage, &queue.header)
    }

    #[test]
    fn growth_capped_at_maximum_moves_suffix() -> Result<()> {
        let mut queue = wrapped_full_queue(6200, 3)?;
        queue.add(&payload(7, 800))?;
        assert_eq!(queue.file_size(), 6200);
        let mut expected: Vec<_> = [3u8, 4, 5, 6].iter().map(|t| payload(*t, 1000)).collect();
        expected.push(payload(7, 800));
        assert_eq!(contents(&queue), expected);
        Ok(())
    }

    #[test]
    fn growth_that_would_overwrite_wrapped_records_is_refused() -> Result<()> {
        let mut queue = wrapped_full_queue(5000, 2)?;
        let before = contents(&queue);
        let err = queue.add(&payload(6, 800)).expect_err("no safe layout");
        assert!(matches!(err, TapeError::CapacityExceeded { .. }));
        assert_eq!(queue.file_size(), MINIMUM_QUEUE_LEN);
        assert_eq!(contents(&queue), before);

        queue.remove(1)?;
        queue.add(&payload(6, 800))?;
        assert_eq!(queue.len(), 4);
        Ok(())
    }

    #[test]
    fn growth_steps_never_leave_a_short_last_step() {
        let queue = memory_queue(20_000);
        // Stopping at 16384 would leave a last step of 3616, so 8192 jumps to the maximum.
        assert_eq!(queue.grown_length(5000), 8192);
        assert_eq!(queue.grown_length(9000), 20_000);
    }

    #[test]
    fn interrupted_growth_keeps_old_layout_readable() -> Result<()> {
        let queue = wrapped_full_queue(6200, 3)?;
        let before = contents(&queue);
        let first = queue.header.first_position;
        let live = queue.used_bytes() - HEADER_LEN;
        let new_length = queue.grown_length(queue.used_bytes() + 805);
        let relocation = queue
            .growth_relocation(new_length, first, live)
            .expect("safe layout");
        assert!(matches!(relocation, Relocation::SuffixForward { .. }));

        let reopened = reopen_after_moves(queue, new_length, relocation)?;
        assert_eq!(reopened.file_size(), MINIMUM_QUEUE_LEN);
        assert_eq!(contents(&reopened), before);
        Ok(())
    }

    #[test]
    fn interrupted_shrink_keeps_old_layout_readable() -> Result<()> {
        let mut queue = memory_queue(64 * 1024);
        for tag in 0..16 {
            queue.add(&payload(tag, 1000))?;
        }
        assert_eq!(queue.file_size(), 16 * 1024);
        drop_front_without_shrinking(&mut queue, 12)?;
        let before = contents(&queue);
        let last = queue.last.expect("last element");
        let relocation = queue.shrink_relocation(8192, last).expect("safe layout");
        assert!(matches!(relocation, Relocation::BlockToFront { .. }));

        let reopened = reopen_after_moves(queue, 8192, relocation)?;
        assert_eq!(contents(&reopened), before);
        Ok(())
    }

    #[test]
    fn shrinks_after_draining_backlog() -> Result<()> {
        let mut queue = memory_queue(1024 * 1024);
        for tag in 0..200u8 {
            queue.add(&payload(tag, 1000))?;
        }
        let grown = queue.file_size();
        assert!(grown >= 200 * 1000);
        queue.remove(195)?;
        assert!(queue.file_size() < grown);
        let expected: Vec<_> = (195..200u8).map(|t| payload(t, 1000)).collect();
        assert_eq!(contents(&queue), expected);
        queue.remove(5)?;
        assert_eq!(queue.file_size(), MINIMUM_QUEUE_LEN);
        Ok(())
    }

    #[test]
    fn iterator_detects_modification() -> Result<()> {
        let mut queue = memory_queue(MINIMUM_QUEUE_LEN);
        queue.add(b"a")?;
        queue.add(b"b")?;
        let mut iter = queue.iter();
        assert_eq!(iter.next().transpose()?, Some(b"a".to_vec()));
        iter.expected_mod_count += 1;
        assert!(matches!(
            iter.next(),
            Some(Err(TapeError::ConcurrentModification))
        ));
        assert!(iter.next().is_none());
        Ok(())
    }

    #[test]
    fn clear_resets_to_minimum() -> Result<()> {
        let mut queue = memory_queue(64 * 1024);
        for tag in 0..10 {
            queue.add(&payload(tag, 1000))?;
        }
        queue.clear()?;
        assert!(queue.is_empty());
        assert_eq!(queue.file_size(), MINIMUM_QUEUE_LEN);
        assert_eq!(queue.used_bytes(), HEADER_LEN);
        queue.add(b"fresh")?;
        assert_eq!(contents(&queue), vec![b"fresh".to_vec()]);
        Ok(())
    }

    #[test]
    fn closed_queue_rejects_operations() -> Result<()> {
        let mut queue = memory_queue(MINIMUM_QUEUE_LEN);
        queue.close()?;
        assert!(matches!(queue.add(b"x"), Err(TapeError::Closed)));
        assert!(matches!(queue.peek(1, 10), Err(TapeError::Closed)));
        Ok(())
    }
}
