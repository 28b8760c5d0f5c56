//! Storage backends for the shrtnr link-storage engine.
//!
//! Three interchangeable [`LinkStore`] implementations are provided:
//!
//! - [`MemoryStore`]: map-backed, lives for the process lifetime only.
//! - [`FileStore`]: a [`MemoryStore`] mirrored into an append-only log that
//!   is replayed on open.
//! - [`PostgresStore`]: a PostgreSQL table with a unique long URL and a
//!   soft-delete flag; deletes are batched by a [`DeleteAggregator`].
//!
//! Pick one at startup with [`open_store`].

pub mod aggregator;
pub mod config;
pub mod file;
pub mod memory;
pub mod postgres;

pub use aggregator::{DeleteAggregator, DeleteSink, FlushReport};
pub use config::{
    open_store, AggregatorConfig, FileConfig, FileDeleteMode, FlushPolicy, PostgresConfig,
    StoreConfig,
};
pub use file::FileStore;
pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use shrtnr_core::{
    BatchEntry, BatchOutcome, Link, LinkStore, Result, ShortCode, StorageError, UrlRecord,
};

/// How many candidate codes a store asks the generator for before giving up.
pub(crate) const MAX_CODE_ATTEMPTS: usize = 8;
