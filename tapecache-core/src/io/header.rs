use std::convert::TryInto;

use crate::{
    constants::{FORMAT_VERSION, HEADER_LEN},
    error::{Result, TapeError},
    io::storage::RingStorage,
};

const VERSION_POS: usize = 0;
const LENGTH_POS: usize = 4;
const COUNT_POS: usize = 12;
const FIRST_POS: usize = 16;
const LAST_POS: usize = 24;
const CHECKSUM_POS: usize = 32;
const HEADER_BYTES: usize = HEADER_LEN as usize;

/// Queue bounds persisted at the start of every `.tape` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueHeader {
    pub version: u32,
    /// Total file length the header was written for.
    pub length: u64,
    pub count: u32,
    /// Position of the oldest element, 0 when empty.
    pub first_position: u64,
    /// Position of the newest element, 0 when empty.
    pub last_position: u64,
}

impl QueueHeader {
    /// Header of an empty queue spanning `length` bytes.
    #[must_use]
    pub fn empty(length: u64) -> Self {
        Self {
            version: FORMAT_VERSION,
            length,
            count: 0,
            first_position: 0,
            last_position: 0,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Checksum over every field, as stored in the last four header bytes.
    #[must_use]
    pub fn checksum(&self) -> u32 {
        let bytes = self.encode_fields();
        checksum_of(&bytes[..CHECKSUM_POS])
    }

    fn encode_fields(&self) -> [u8; HEADER_BYTES] {
        let mut buf = [0u8; HEADER_BYTES];
        buf[VERSION_POS..LENGTH_POS].copy_from_slice(&self.version.to_le_bytes());
        buf[LENGTH_POS..COUNT_POS].copy_from_slice(&self.length.to_le_bytes());
        buf[COUNT_POS..FIRST_POS].copy_from_slice(&self.count.to_le_bytes());
        buf[FIRST_POS..LAST_POS].copy_from_slice(&self.first_position.to_le_bytes());
        buf[LAST_POS..CHECKSUM_POS].copy_from_slice(&self.last_position.to_le_bytes());
        buf
    }
}

fn checksum_of(bytes: &[u8]) -> u32 {
    let digest = blake3::hash(bytes);
    let mut prefix = [0u8; 4];
    prefix.copy_from_slice(&digest.as_bytes()[..4]);
    u32::from_le_bytes(prefix)
}

/// Deterministic encoder/decoder for the fixed-size queue header.
pub struct HeaderCodec;

impl HeaderCodec {
    /// Writes the header in a single storage write followed by a flush.
    pub fn write(storage: &mut RingStorage, header: &QueueHeader) -> Result<()> {
        let bytes = Self::encode(header);
        storage.write(0, &bytes)?;
        storage.flush()
    }

    /// Reads and validates the header against the current storage length.
    ///
    /// A file longer than the header's length is accepted: growth resizes the file
    /// before the header is rewritten, so the header stays authoritative.
    pub fn read(storage: &RingStorage) -> Result<QueueHeader> {
        let length = storage.length();
        if length < HEADER_LEN {
            return Err(TapeError::corrupt("file is shorter than the queue header"));
        }
        let mut buf = [0u8; HEADER_BYTES];
        storage.read(0, &mut buf)?;
        let header = Self::decode(&buf)?;
        if header.length > length {
            return Err(TapeError::corrupt(format!(
                "file truncated to {length} bytes, header expects {}",
                header.length
            )));
        }
        Ok(header)
    }

    #[must_use]
    pub fn encode(header: &QueueHeader) -> [u8; HEADER_BYTES] {
        let mut buf = header.encode_fields();
        let checksum = checksum_of(&buf[..CHECKSUM_POS]);
        buf[CHECKSUM_POS..].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    /// Decodes header bytes, rejecting unknown versions and inconsistent bounds.
    pub fn decode(bytes: &[u8; HEADER_BYTES]) -> Result<QueueHeader> {
        let version = u32::from_le_bytes(extract_array(bytes, VERSION_POS)?);
        if version != FORMAT_VERSION {
            return Err(TapeError::corrupt(format!(
                "unsupported format version {version:#010x}"
            )));
        }
        let stored_checksum = u32::from_le_bytes(extract_array(bytes, CHECKSUM_POS)?);
        if stored_checksum != checksum_of(&bytes[..CHECKSUM_POS]) {
            return Err(TapeError::corrupt("header checksum mismatch"));
        }

        let header = QueueHeader {
            version,
            length: u64::from_le_bytes(extract_array(bytes, LENGTH_POS)?),
            count: u32::from_le_bytes(extract_array(bytes, COUNT_POS)?),
            first_position: u64::from_le_bytes(extract_array(bytes, FIRST_POS)?),
            last_position: u64::from_le_bytes(extract_array(bytes, LAST_POS)?),
        };

        if header.length < HEADER_LEN {
            return Err(TapeError::corrupt("header length precedes data region"));
        }
        if header.first_position >= header.length || header.last_position >= header.length {
            return Err(TapeError::corrupt("element position outside of file"));
        }
        if header.count == 0 {
            if header.first_position != 0 || header.last_position != 0 {
                return Err(TapeError::corrupt("empty queue with element positions"));
            }
        } else if header.first_position < HEADER_LEN || header.last_position < HEADER_LEN {
            return Err(TapeError::corrupt("non-empty queue without element positions"));
        }
        Ok(header)
    }
}

#[inline]
fn extract_array<const N: usize>(bytes: &[u8], offset: usize) -> Result<[u8; N]> {
    bytes
        .get(offset..offset + N)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| TapeError::corrupt("header truncated"))
}
