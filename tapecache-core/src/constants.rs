/// Format version magic stored in the first four bytes of every `.tape` file.
pub const FORMAT_VERSION: u32 = 0x5441_5031;
/// Fixed size of the queue header at the start of the file.
pub const HEADER_LEN: u64 = 36;
/// Size of the descriptor (length + checksum) in front of every element.
pub const ELEMENT_HEADER_LEN: u64 = 5;
/// Seed folded into the one-byte element length checksum.
pub const ELEMENT_CHECKSUM_SEED: u8 = 0xA5;
/// Smallest file a queue is ever truncated to.
pub const MINIMUM_QUEUE_LEN: u64 = 4096;
/// Number of oldest element descriptors kept in memory.
pub const ELEMENT_CACHE_CAPACITY: usize = 32;

/// Extension of the ring-buffer data file.
pub const TAPE_EXTENSION: &str = "tape";
/// Extension of the persisted key schema.
pub const KEY_SCHEMA_EXTENSION: &str = "key.avsc";
/// Extension of the persisted value schema.
pub const VALUE_SCHEMA_EXTENSION: &str = "value.avsc";
/// File stem prefix of a numbered cache generation.
pub const GENERATION_PREFIX: &str = "cache-";
/// Number of generation slots per topic (`cache-0` through `cache-99`).
pub const GENERATION_SLOTS: u32 = 100;

/// Default delay between the first pending record and its commit.
pub const DEFAULT_COMMIT_RATE_MS: u64 = 10_000;
/// Default upper bound of a single cache file.
pub const DEFAULT_MAXIMUM_SIZE: u64 = 450_000_000;
/// Default period between upload rounds.
pub const DEFAULT_UPLOAD_PERIOD_MS: u64 = 10_000;
/// Default slowdown applied to uploads while the battery is low.
pub const DEFAULT_REDUCED_RATE_MULTIPLIER: u32 = 5;
