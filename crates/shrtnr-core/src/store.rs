use crate::error::Result;
use crate::link::{BatchEntry, BatchOutcome, UrlRecord};
use crate::shortcode::ShortCode;
use async_trait::async_trait;
use std::collections::HashMap;

/// The link-storage contract shared by every backend.
///
/// Implementations are used behind `Arc<dyn LinkStore>` and must be safe to
/// call from many tasks at once.
#[async_trait]
pub trait LinkStore: Send + Sync + 'static {
    /// A short, static name of the backend, used in logs and errors.
    fn backend_name(&self) -> &'static str;

    /// Shortens `long` on behalf of `owner` and returns the new short code.
    ///
    /// If `long` is already stored (by any owner) no second row is created and
    /// `Err(DuplicateLink { existing })` carries the code it was stored under.
    async fn put(&self, owner: &str, long: &str) -> Result<ShortCode>;

    /// Looks up a short code.
    ///
    /// Returns `None` if the code does not exist. Soft-deleted links are
    /// returned with `deleted = true`.
    async fn resolve(&self, code: &ShortCode) -> Result<Option<UrlRecord>>;

    /// Returns every non-deleted link created by `owner`, keyed by short code.
    async fn list_by_owner(&self, owner: &str) -> Result<HashMap<ShortCode, String>>;

    /// Shortens several URLs at once.
    ///
    /// Transactional backends apply the batch all-or-nothing; in-memory
    /// backends apply it entry by entry without rollback.
    async fn put_batch(&self, owner: &str, entries: Vec<BatchEntry>) -> Result<Vec<BatchOutcome>>;

    /// Requests soft deletion of `codes` owned by `owner`.
    ///
    /// This is fire-and-forget: `Ok(())` means the request was accepted, not
    /// that it has been applied. Codes not owned by `owner` are ignored.
    async fn delete(&self, owner: &str, codes: Vec<ShortCode>) -> Result<()>;

    /// Number of distinct owners that created at least one link.
    async fn count_owners(&self) -> Result<u64>;

    /// Number of non-deleted links.
    async fn count_links(&self) -> Result<u64>;

    /// Checks that the backend is reachable.
    async fn ping(&self) -> Result<()>;

    /// Releases held resources, completing any pending work first.
    async fn shutdown(&self) -> Result<()>;
}
