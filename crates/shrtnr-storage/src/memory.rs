use crate::MAX_CODE_ATTEMPTS;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use shrtnr_core::{
    BatchEntry, BatchOutcome, Link, LinkStore, Result, ShortCode, StorageError, UrlRecord,
};
use shrtnr_generator::{Generator, RandomGenerator};
use std::collections::{HashMap, HashSet};
use tracing::{debug, trace};

/// In-memory storage entry for a short code.
#[derive(Debug, Clone)]
struct StoredLink {
    original_url: String,
    owner: String,
    deleted: bool,
}

/// Outcome of an insert attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Insertion {
    Created(ShortCode),
    /// The long URL was already stored under this code.
    Existing(ShortCode),
}

/// In-memory implementation of [`LinkStore`] using DashMap.
///
/// Three maps are kept: short code → link, long URL → short code (the
/// duplicate index) and owner → owned codes. Locks are always taken in the
/// order long index → links and long index → owners; the owner index is
/// released before the links map is touched, so no two operations can wait
/// on each other.
pub struct MemoryStore<G = RandomGenerator> {
    links: DashMap<ShortCode, StoredLink>,
    by_long: DashMap<String, ShortCode>,
    owners: DashMap<String, HashSet<ShortCode>>,
    generator: G,
}

impl MemoryStore<RandomGenerator> {
    /// Creates an empty store with the random eight-character generator.
    pub fn new() -> Self {
        Self::with_generator(RandomGenerator::new())
    }
}

impl Default for MemoryStore<RandomGenerator> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G> std::fmt::Debug for MemoryStore<G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("links", &self.links.len())
            .field("owners", &self.owners.len())
            .finish()
    }
}

impl<G: Generator> MemoryStore<G> {
    pub fn with_generator(generator: G) -> Self {
        Self {
            links: DashMap::new(),
            by_long: DashMap::new(),
            owners: DashMap::new(),
            generator,
        }
    }

    /// Inserts `long` for `owner` unless it is already stored.
    pub(crate) fn insert(&self, owner: &str, long: &str) -> Result<Insertion> {
        match self.by_long.entry(long.to_owned()) {
            Entry::Occupied(existing) => Ok(Insertion::Existing(existing.get().clone())),
            Entry::Vacant(slot) => {
                let code = self.claim_code(owner, long)?;
                slot.insert(code.clone());
                self.owners
                    .entry(owner.to_owned())
                    .or_default()
                    .insert(code.clone());
                Ok(Insertion::Created(code))
            }
        }
    }

    /// Reserves a fresh short code in the links map for `long`.
    fn claim_code(&self, owner: &str, long: &str) -> Result<ShortCode> {
        for _ in 0..MAX_CODE_ATTEMPTS {
            let candidate = self.generator.generate();
            match self.links.entry(candidate.clone()) {
                Entry::Occupied(_) => {
                    debug!(code = %candidate, "short code collision, regenerating");
                }
                Entry::Vacant(slot) => {
                    slot.insert(StoredLink {
                        original_url: long.to_owned(),
                        owner: owner.to_owned(),
                        deleted: false,
                    });
                    return Ok(candidate);
                }
            }
        }

        Err(StorageError::Operation(format!(
            "no free short code after {} attempts",
            MAX_CODE_ATTEMPTS
        )))
    }

    /// Puts a previously persisted link back, keeping its code and flag.
    pub(crate) fn restore(&self, link: Link) {
        let Link {
            short,
            long,
            owner,
            deleted,
        } = link;

        match self.by_long.entry(long.clone()) {
            Entry::Occupied(existing) => {
                debug!(
                    code = %short,
                    existing = %existing.get(),
                    "skipping restored link whose long url is already stored"
                );
            }
            Entry::Vacant(slot) => {
                self.links.insert(
                    short.clone(),
                    StoredLink {
                        original_url: long,
                        owner: owner.clone(),
                        deleted,
                    },
                );
                slot.insert(short.clone());
                self.owners.entry(owner).or_default().insert(short);
            }
        }
    }

    /// Marks the codes owned by `owner` as deleted and returns the ones that
    /// changed state. Codes owned by someone else are left untouched.
    pub(crate) fn mark_deleted(&self, owner: &str, codes: &[ShortCode]) -> Vec<ShortCode> {
        let owned = match self.owners.get(owner) {
            Some(owned) => codes
                .iter()
                .filter(|code| owned.contains(*code))
                .cloned()
                .collect::<Vec<_>>(),
            None => Vec::new(),
        };

        owned
            .into_iter()
            .filter(|code| match self.links.get_mut(code) {
                Some(mut link) if !link.deleted => {
                    link.deleted = true;
                    true
                }
                _ => false,
            })
            .collect()
    }

    fn owned_codes(&self, owner: &str) -> Vec<ShortCode> {
        self.owners
            .get(owner)
            .map(|owned| owned.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl<G: Generator> LinkStore for MemoryStore<G> {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, owner: &str, long: &str) -> Result<ShortCode> {
        match self.insert(owner, long)? {
            Insertion::Created(code) => {
                trace!(code = %code, owner, "stored link");
                Ok(code)
            }
            Insertion::Existing(existing) => Err(StorageError::DuplicateLink { existing }),
        }
    }

    async fn resolve(&self, code: &ShortCode) -> Result<Option<UrlRecord>> {
        Ok(self.links.get(code).map(|link| UrlRecord {
            original_url: link.original_url.clone(),
            owner: link.owner.clone(),
            deleted: link.deleted,
        }))
    }

    async fn list_by_owner(&self, owner: &str) -> Result<HashMap<ShortCode, String>> {
        let listing = self
            .owned_codes(owner)
            .into_iter()
            .filter_map(|code| {
                let link = self.links.get(&code)?;
                if link.deleted {
                    return None;
                }
                let original_url = link.original_url.clone();
                Some((code, original_url))
            })
            .collect();
        Ok(listing)
    }

    async fn put_batch(&self, owner: &str, entries: Vec<BatchEntry>) -> Result<Vec<BatchOutcome>> {
        let mut outcomes = Vec::with_capacity(entries.len());
        for entry in entries {
            let (short, created) = match self.insert(owner, &entry.original_url)? {
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

    async fn delete(&self, owner: &str, codes: Vec<ShortCode>) -> Result<()> {
        let deleted = self.mark_deleted(owner, &codes);
        debug!(
            owner,
            requested = codes.len(),
            deleted = deleted.len(),
            "soft-deleted links"
        );
        Ok(())
    }

    async fn count_owners(&self) -> Result<u64> {
        Ok(self.owners.len() as u64)
    }

    async fn count_links(&self) -> Result<u64> {
        Ok(self.links.iter().filter(|link| !link.deleted).count() as u64)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shrtnr_generator::SeqGenerator;
    use std::sync::Arc;

    fn store() -> MemoryStore<SeqGenerator> {
        MemoryStore::with_generator(SeqGenerator::with_prefix("wh"))
    }

    /// Always returns the same code, to force collisions.
    struct FixedGenerator;

    impl Generator for FixedGenerator {
        fn generate(&self) -> ShortCode {
            ShortCode::new_unchecked("fixed000")
        }
    }

    #[tokio::test]
    async fn put_and_resolve() {
        let store = store();

        let code = store.put("u1", "http://a.com").await.unwrap();
        assert_eq!(code.as_str(), "wh000000");

        let record = store.resolve(&code).await.unwrap().unwrap();
        assert_eq!(record.original_url, "http://a.com");
        assert_eq!(record.owner, "u1");
        assert!(!record.deleted);
    }

    #[tokio::test]
    async fn resolve_unknown_code() {
        let store = store();
        let record = store.resolve(&ShortCode::new_unchecked("nope")).await.unwrap();
        assert!(record.is_none());
    }

    #[tokio::test]
    async fn duplicate_long_url_returns_existing_code() {
        let store = store();

        let first = store.put("u1", "http://a.com").await.unwrap();
        let err = store.put("u2", "http://a.com").await.unwrap_err();

        match err {
            StorageError::DuplicateLink { existing } => assert_eq!(existing, first),
            other => panic!("expected duplicate, got {other:?}"),
        }
        assert_eq!(store.count_links().await.unwrap(), 1);

        let u1 = store.list_by_owner("u1").await.unwrap();
        let u2 = store.list_by_owner("u2").await.unwrap();
        assert!(u1.contains_key(&first));
        assert!(u2.is_empty());
    }

    #[tokio::test]
    async fn same_owner_reshortening_is_idempotent() {
        let store = store();

        let first = store.put("u1", "http://a.com").await.unwrap();
        let again = store.put("u1", "http://a.com").await.unwrap_err();
        assert_eq!(again.existing_code(), Some(&first));
    }

    #[tokio::test]
    async fn collisions_are_retried_then_reported() {
        let store = MemoryStore::with_generator(FixedGenerator);

        store.put("u1", "http://a.com").await.unwrap();
        let err = store.put("u1", "http://b.com").await.unwrap_err();
        assert!(matches!(err, StorageError::Operation(_)));

        // The failed insert must not leave a dangling duplicate-index entry.
        let err = store.put("u1", "http://b.com").await.unwrap_err();
        assert!(matches!(err, StorageError::Operation(_)));
        assert_eq!(store.count_links().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn list_only_contains_own_links() {
        let store = store();

        let a = store.put("u1", "http://a.com").await.unwrap();
        let b = store.put("u1", "http://b.com").await.unwrap();
        let c = store.put("u2", "http://c.com").await.unwrap();

        let listing = store.list_by_owner("u1").await.unwrap();
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[&a], "http://a.com");
        assert_eq!(listing[&b], "http://b.com");
        assert!(!listing.contains_key(&c));
    }

    #[tokio::test]
    async fn delete_is_scoped_to_owner() {
        let store = store();

        let mine = store.put("u1", "http://a.com").await.unwrap();
        let theirs = store.put("u2", "http://b.com").await.unwrap();

        store
            .delete("u1", vec![mine.clone(), theirs.clone()])
            .await
            .unwrap();

        assert!(store.resolve(&mine).await.unwrap().unwrap().deleted);
        assert!(!store.resolve(&theirs).await.unwrap().unwrap().deleted);
    }

    #[tokio::test]
    async fn deleted_links_stay_deleted_and_leave_listing() {
        let store = store();

        let code = store.put("u1", "http://a.com").await.unwrap();
        store.delete("u1", vec![code.clone()]).await.unwrap();

        let record = store.resolve(&code).await.unwrap().unwrap();
        assert!(record.deleted);
        assert_eq!(record.original_url, "http://a.com");
        assert!(store.list_by_owner("u1").await.unwrap().is_empty());

        // Re-shortening a deleted url still yields the deleted code.
        let err = store.put("u2", "http://a.com").await.unwrap_err();
        assert_eq!(err.existing_code(), Some(&code));
        assert!(store.resolve(&code).await.unwrap().unwrap().deleted);
    }

    #[tokio::test]
    async fn batch_reuses_existing_codes() {
        let store = store();

        let existing = store.put("u1", "http://a.com").await.unwrap();
        let outcomes = store
            .put_batch(
                "u2",
                vec![
                    BatchEntry::new("http://a.com", "1"),
                    BatchEntry::new("http://b.com", "2"),
                ],
            )
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].correlation_id, "1");
        assert_eq!(outcomes[0].short, existing);
        assert!(!outcomes[0].created);
        assert_eq!(outcomes[1].correlation_id, "2");
        assert!(outcomes[1].created);

        let listing = store.list_by_owner("u2").await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[&outcomes[1].short], "http://b.com");
    }

    #[tokio::test]
    async fn counts() {
        let store = store();

        store.put("u1", "http://a.com").await.unwrap();
        store.put("u1", "http://b.com").await.unwrap();
        let c = store.put("u2", "http://c.com").await.unwrap();
        store.delete("u2", vec![c]).await.unwrap();

        assert_eq!(store.count_owners().await.unwrap(), 2);
        assert_eq!(store.count_links().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn concurrent_puts_yield_distinct_codes() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = vec![];

        for caller in 0..50 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let mut codes = Vec::with_capacity(20);
                for i in 0..20 {
                    let long = format!("https://example.com/{caller}/{i}");
                    codes.push(store.put(&format!("owner-{caller}"), &long).await.unwrap());
                }
                codes
            }));
        }

        let mut all = HashSet::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }

        assert_eq!(all.len(), 1000);
        assert_eq!(store.count_links().await.unwrap(), 1000);
        assert_eq!(store.count_owners().await.unwrap(), 50);
    }

    #[tokio::test]
    async fn concurrent_duplicate_puts_create_one_row() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = vec![];

        for caller in 0..50 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                match store.put(&format!("owner-{caller}"), "https://same.example").await {
                    Ok(code) => code,
                    Err(StorageError::DuplicateLink { existing }) => existing,
                    Err(other) => panic!("unexpected error: {other:?}"),
                }
            }));
        }

        let mut codes = HashSet::new();
        for handle in handles {
            codes.insert(handle.await.unwrap());
        }

        assert_eq!(codes.len(), 1);
        assert_eq!(store.count_links().await.unwrap(), 1);
        assert_eq!(store.count_owners().await.unwrap(), 1);
    }
}
