//! Low-level IO primitives for interacting with `.tape` files.

pub mod element;
pub mod header;
pub mod storage;

pub use element::Element;
pub use header::{HeaderCodec, QueueHeader};
pub use storage::{Backing, MappedBacking, MemoryBacking, RingStorage, SnapshotBacking};
