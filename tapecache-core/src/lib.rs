//! Durable, space-bounded FIFO record caches.
//!
//! Records are appended to ring-buffer files (`.tape`) that grow and shrink within a
//! configured size, survive crashes at any point of an append, and keep the schema
//! they were written with next to them. A [`CacheRegistry`] hands out one
//! [`CacheGroup`] per topic and a [`Submitter`] decides when an external [`Uploader`]
//! may drain them.

pub mod cache;
pub mod codec;
pub mod config;
pub mod constants;
pub mod error;
pub mod io;
pub mod lock;
pub mod queue;
pub mod registry;
pub mod schema;
pub mod submit;
pub mod typed;
pub mod worker;

pub use cache::{RecordBatch, TopicCache};
pub use codec::{Record, RecordCodec};
pub use config::{CacheConfiguration, SubmitterConfig};
pub use error::{Result, TapeError};
pub use io::{
    Backing, MappedBacking, MemoryBacking, QueueHeader, RingStorage, SnapshotBacking,
};
pub use queue::{ElementWriter, QueueIter, RingQueue};
pub use registry::{CacheGroup, CacheRegistry, TopicSchema};
pub use schema::{Datum, Field, Schema};
pub use submit::{
    BatteryStage, NetworkState, ServerStatus, StartOutcome, Submitter, UploadStats, Uploader,
};
pub use typed::{Converter, Entry, RecordQueue};
pub use worker::{CacheWorker, ScheduledTask};
