use crate::{
    constants::{ELEMENT_CHECKSUM_SEED, ELEMENT_HEADER_LEN},
    error::{Result, TapeError},
    io::storage::RingStorage,
};

const DESCRIPTOR_BYTES: usize = ELEMENT_HEADER_LEN as usize;

/// Location and size of one stored element.
///
/// `position` points at the 5-byte descriptor; the payload follows it. Positions
/// are not wrapped here, callers run them through [`RingStorage::wrap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Element {
    pub position: u64,
    pub length: u32,
}

impl Element {
    #[must_use]
    pub const fn new(position: u64, length: u32) -> Self {
        Self { position, length }
    }

    /// Position of the first payload byte.
    #[must_use]
    pub const fn data_position(&self) -> u64 {
        self.position + ELEMENT_HEADER_LEN
    }

    /// Position right after the payload, where the next element starts.
    #[must_use]
    pub const fn next_position(&self) -> u64 {
        self.position + ELEMENT_HEADER_LEN + self.length as u64
    }

    /// Bytes occupied on disk, descriptor included.
    #[must_use]
    pub const fn total_len(&self) -> u64 {
        ELEMENT_HEADER_LEN + self.length as u64
    }

    #[must_use]
    pub fn encode_descriptor(length: u32) -> [u8; DESCRIPTOR_BYTES] {
        let mut buf = [0u8; DESCRIPTOR_BYTES];
        buf[..4].copy_from_slice(&length.to_le_bytes());
        buf[4] = length_checksum(length);
        buf
    }

    /// Reads and validates the descriptor stored at `position`.
    pub fn read(storage: &RingStorage, position: u64) -> Result<Self> {
        let mut buf = [0u8; DESCRIPTOR_BYTES];
        storage.read(position, &mut buf)?;
        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_le_bytes(length_bytes);
        if buf[4] != length_checksum(length) {
            return Err(TapeError::corrupt(format!(
                "element checksum mismatch at position {position}"
            )));
        }
        if length == 0 {
            return Err(TapeError::corrupt(format!(
                "zero length element at position {position}"
            )));
        }
        Ok(Self { position, length })
    }

    /// Writes the descriptor for this element.
    pub fn write_descriptor(&self, storage: &mut RingStorage) -> Result<()> {
        storage.write(self.position, &Self::encode_descriptor(self.length))
    }
}

/// One-byte hash of an element length, used to catch misaligned reads.
#[must_use]
pub fn length_checksum(length: u32) -> u8 {
    length
        .to_le_bytes()
        .iter()
        .fold(ELEMENT_CHECKSUM_SEED, |acc, byte| acc.rotate_left(1) ^ byte)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_follow_descriptor() {
        let element = Element::new(100, 20);
        assert_eq!(element.data_position(), 105);
        assert_eq!(element.next_position(), 125);
        assert_eq!(element.total_len(), 25);
    }

    #[test]
    fn checksum_differs_for_nearby_lengths() {
        assert_ne!(length_checksum(1), length_checksum(2));
        assert_ne!(length_checksum(256), length_checksum(1));
    }

    #[test]
    fn read_rejects_bad_checksum() -> Result<()> {
        let mut storage = RingStorage::memory(256, 256);
        Element::new(40, 12).write_descriptor(&mut storage)?;
        assert_eq!(Element::read(&storage, 40)?, Element::new(40, 12));

        storage.write(44, &[length_checksum(12) ^ 0xFF])?;
        let err = Element::read(&storage, 40).expect_err("corrupted checksum");
        assert!(err.is_corruption());
        Ok(())
    }

    #[test]
    fn read_rejects_zero_length() -> Result<()> {
        let mut storage = RingStorage::memory(256, 256);
        storage.write(40, &Element::encode_descriptor(0))?;
        let err = Element::read(&storage, 40).expect_err("zero length");
        assert!(err.is_corruption());
        Ok(())
    }
}
