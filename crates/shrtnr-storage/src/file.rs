mod log;

use crate::config::{FileConfig, FileDeleteMode};
use crate::memory::{Insertion, MemoryStore};
use self::log::{AppendLog, LogRecord};
use async_trait::async_trait;
use parking_lot::Mutex;
use shrtnr_core::{
    BatchEntry, BatchOutcome, Link, LinkStore, Result, ShortCode, StorageError, UrlRecord,
};
use shrtnr_generator::{Generator, RandomGenerator};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A [`MemoryStore`] mirrored into an append-only log on disk.
///
/// The log is replayed on [`FileStore::open`]. Writers are serialized on the
/// log mutex; each write updates the in-memory maps first and appends the
/// record second, so a crash between the two loses that single record from
/// disk while it had already been served from memory.
///
/// Writes and the `fsync` on shutdown run on tokio's blocking pool. Reads
/// only touch memory and stay on the calling task.
pub struct FileStore<G = RandomGenerator> {
    inner: Arc<Inner<G>>,
}

struct Inner<G> {
    memory: MemoryStore<G>,
    log: Mutex<AppendLog>,
    delete_mode: FileDeleteMode,
}

impl FileStore<RandomGenerator> {
    /// Opens the log at `config.path`, creating it if missing.
    pub fn open(config: &FileConfig) -> Result<Self> {
        Self::open_with_generator(config, RandomGenerator::new())
    }
}

impl<G: Generator> FileStore<G> {
    pub fn open_with_generator(config: &FileConfig, generator: G) -> Result<Self> {
        let (log, records) = AppendLog::open(&config.path, config.sync_every_write)?;
        let memory = MemoryStore::with_generator(generator);

        let replayed = records.len();
        for record in records {
            match record {
                LogRecord::Put { short, long, owner } => memory.restore(Link {
                    short,
                    long,
                    owner,
                    deleted: false,
                }),
                LogRecord::Delete { owner, shorts } => {
                    memory.mark_deleted(&owner, &shorts);
                }
            }
        }

        info!(
            path = %config.path.display(),
            replayed,
            delete_mode = ?config.delete_mode,
            "file store opened"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                memory,
                log: Mutex::new(log),
                delete_mode: config.delete_mode,
            }),
        })
    }

    /// Runs a log-writing closure on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Inner<G>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| StorageError::Operation(format!("file store write failed: {e}")))?
    }
}

impl<G: Generator> Inner<G> {
    /// Inserts into memory and, if a row was created, appends it to the log.
    /// Must be called with the log lock held.
    fn insert_logged(&self, log: &mut AppendLog, owner: &str, long: &str) -> Result<Insertion> {
        let insertion = self.memory.insert(owner, long)?;
        if let Insertion::Created(code) = &insertion {
            log.append(&LogRecord::Put {
                short: code.clone(),
                long: long.to_owned(),
                owner: owner.to_owned(),
            })
            .inspect_err(|e| {
                warn!(code = %code, error = %e, "link stored in memory but not in log");
            })?;
        }
        Ok(insertion)
    }

    fn put(&self, owner: &str, long: &str) -> Result<ShortCode> {
        let mut log = self.log.lock();
        match self.insert_logged(&mut log, owner, long)? {
            Insertion::Created(code) => Ok(code),
            Insertion::Existing(existing) => Err(StorageError::DuplicateLink { existing }),
        }
    }

    fn put_batch(&self, owner: &str, entries: Vec<BatchEntry>) -> Result<Vec<BatchOutcome>> {
        let mut log = self.log.lock();
        let mut outcomes = Vec::with_capacity(entries.len());
        for entry in entries {
            let (short, created) = match self.insert_logged(&mut log, owner, &entry.original_url)? {
                Insertion::Created(code) => (code, true),
                Insertion::Existing(code) => (code, false),
            };
            outcomes.push(BatchOutcome {
                correlation_id: entry.correlation_id,
                short,
                created,
            });
        }
        debug!(owner, count = outcomes.len(), "stored link batch");
        Ok(outcomes)
    }

    fn delete(&self, owner: &str, codes: &[ShortCode]) -> Result<()> {
        let mut log = self.log.lock();
        let deleted = self.memory.mark_deleted(owner, codes);
        if deleted.is_empty() {
            return Ok(());
        }

        debug!(owner, deleted = deleted.len(), "soft-deleted links");
        log.append(&LogRecord::Delete {
            owner: owner.to_owned(),
            shorts: deleted,
        })
    }

    fn sync(&self) -> Result<()> {
        let mut log = self.log.lock();
        log.sync()?;
        info!(path = %log.path().display(), "file store synced");
        Ok(())
    }
}

#[async_trait]
impl<G: Generator> LinkStore for FileStore<G> {
    fn backend_name(&self) -> &'static str {
        "file"
    }

    async fn put(&self, owner: &str, long: &str) -> Result<ShortCode> {
        let (owner, long) = (owner.to_owned(), long.to_owned());
        self.blocking(move |inner| inner.put(&owner, &long)).await
    }

    async fn resolve(&self, code: &ShortCode) -> Result<Option<UrlRecord>> {
        self.inner.memory.resolve(code).await
    }

    async fn list_by_owner(&self, owner: &str) -> Result<HashMap<ShortCode, String>> {
        self.inner.memory.list_by_owner(owner).await
    }

    async fn put_batch(&self, owner: &str, entries: Vec<BatchEntry>) -> Result<Vec<BatchOutcome>> {
        let owner = owner.to_owned();
        self.blocking(move |inner| inner.put_batch(&owner, entries))
            .await
    }

    async fn delete(&self, owner: &str, codes: Vec<ShortCode>) -> Result<()> {
        if self.inner.delete_mode == FileDeleteMode::Disabled {
            debug!(owner, requested = codes.len(), "delete rejected, deletes are disabled");
            return Err(StorageError::Unsupported {
                backend: self.backend_name(),
                operation: "delete",
            });
        }

        let owner = owner.to_owned();
        self.blocking(move |inner| inner.delete(&owner, &codes)).await
    }

    async fn count_owners(&self) -> Result<u64> {
        self.inner.memory.count_owners().await
    }

    async fn count_links(&self) -> Result<u64> {
        self.inner.memory.count_links().await
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.blocking(|inner| inner.sync()).await
    }
}
