//! Book record service.
//!
//! Encodes books into per-record hashes plus one ordering index, and rebuilds
//! the collection from them. Every operation goes through
//! [`ConnectionManager::ensure_healthy`] before touching the store.

use crate::models::{BookId, BookRecord, NewBook, ORDERING_INDEX_KEY};
use crate::observability::current_request_id;
use crate::storage::{ConnectionManager, IndexedWrite, KeyValueStore};
use crate::{Error, Result, current_timestamp_millis};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Maximum record reads in flight during a listing.
const LIST_READ_CONCURRENCY: usize = 64;

/// Service for creating and listing books.
pub struct BookStore<S: KeyValueStore> {
    manager: Arc<ConnectionManager<S>>,
    /// Last identifier handed out by this process.
    last_id: AtomicU64,
}

impl<S: KeyValueStore> BookStore<S> {
    /// Creates a book store over a shared connection manager.
    #[must_use]
    pub const fn new(manager: Arc<ConnectionManager<S>>) -> Self {
        Self {
            manager,
            last_id: AtomicU64::new(0),
        }
    }

    /// Returns the connection manager.
    pub const fn manager(&self) -> &Arc<ConnectionManager<S>> {
        &self.manager
    }

    /// Allocates the next identifier.
    ///
    /// Identifiers are the current time in milliseconds, bumped past the last
    /// one issued so that two creates in the same millisecond never collide.
    /// Separate processes sharing a store can still collide.
    fn next_id(&self) -> u64 {
        let now = current_timestamp_millis();
        let mut last = self.last_id.load(Ordering::Relaxed);
        loop {
            let next = now.max(last.saturating_add(1));
            match self
                .last_id
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }

    /// Persists a new book and returns its identifier.
    ///
    /// Validation runs before any store I/O, so an invalid request never
    /// touches the connection.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] if a field is missing or empty
    /// - [`Error::StoreUnavailable`] if the store cannot be reached
    /// - [`Error::OperationFailed`] if the write is rejected
    pub async fn create(&self, request: NewBook) -> Result<BookId> {
        let start = Instant::now();
        request.validate()?;
        self.manager.ensure_healthy().await?;

        let millis = self.next_id();
        let id = BookId::from_millis(millis);
        let book = request.into_book(id.clone())?;
        let key = id.store_key();
        let fields = book.to_fields();

        // Millisecond timestamps fit in an f64 mantissa.
        #[allow(clippy::cast_precision_loss)]
        let score = millis as f64;

        self.manager
            .execute("write_indexed", |store| {
                store.write_indexed(IndexedWrite {
                    key: &key,
                    fields: &fields,
                    index_key: ORDERING_INDEX_KEY,
                    member: id.as_str(),
                    score,
                })
            })
            .await?;

        metrics::counter!("books_created_total").increment(1);
        metrics::histogram!("book_operation_duration_ms", "operation" => "create")
            .record(start.elapsed().as_secs_f64() * 1000.0);
        tracing::info!(
            book_id = %id,
            title = %book.title,
            request_id = current_request_id().as_deref(),
            "Book created"
        );
        Ok(id)
    }

    /// Returns every book in creation order.
    ///
    /// Records are read concurrently but returned in index order. An index
    /// entry whose hash is missing or partial comes back as a degraded record
    /// instead of being dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the store cannot be reached or
    /// any read fails at the connection level.
    pub async fn list(&self) -> Result<Vec<BookRecord>> {
        let start = Instant::now();
        self.manager.ensure_healthy().await?;

        let ids = self.index_ids().await?;
        let reads: Vec<_> = ids.into_iter().map(|id| self.read_record(id)).collect();
        let records: Vec<Result<BookRecord>> = stream::iter(reads)
            .buffered(LIST_READ_CONCURRENCY)
            .collect()
            .await;
        let records = records.into_iter().collect::<Result<Vec<_>>>()?;

        let degraded = records.iter().filter(|r| r.is_degraded()).count();
        if degraded > 0 {
            metrics::counter!("books_degraded_total").increment(degraded as u64);
            tracing::warn!(
                degraded,
                total = records.len(),
                "Listing contains index entries without a complete record"
            );
        }
        metrics::histogram!("book_operation_duration_ms", "operation" => "list")
            .record(start.elapsed().as_secs_f64() * 1000.0);
        tracing::debug!(count = records.len(), "Books listed");
        Ok(records)
    }

    /// Returns one book.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if no record exists under `id`
    /// - [`Error::StoreUnavailable`] if the store cannot be reached
    pub async fn get(&self, id: &BookId) -> Result<BookRecord> {
        self.manager.ensure_healthy().await?;
        let key = id.store_key();
        let fields = self
            .manager
            .execute("read_hash", |store| store.read_hash(&key))
            .await?;
        if fields.is_empty() {
            return Err(Error::NotFound(key));
        }
        Ok(BookRecord::from_fields(id.clone(), fields))
    }

    /// Returns the number of entries in the ordering index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the store cannot be reached.
    pub async fn count(&self) -> Result<usize> {
        self.manager.ensure_healthy().await?;
        self.manager
            .execute("sorted_len", |store| store.sorted_len(ORDERING_INDEX_KEY))
            .await
    }

    /// Removes index entries whose record hash no longer exists.
    ///
    /// Returns the identifiers that were pruned, in index order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the store cannot be reached.
    pub async fn reconcile(&self) -> Result<Vec<BookId>> {
        self.manager.ensure_healthy().await?;
        let ids = self.index_ids().await?;

        let probes: Vec<_> = ids.into_iter().map(|id| self.find_orphan(id)).collect();
        let checks: Vec<Result<Option<BookId>>> = stream::iter(probes)
            .buffered(LIST_READ_CONCURRENCY)
            .collect()
            .await;
        let orphans: Vec<BookId> = checks
            .into_iter()
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .flatten()
            .collect();

        if orphans.is_empty() {
            tracing::info!("Ordering index is consistent");
            return Ok(Vec::new());
        }

        let members: Vec<String> = orphans.iter().map(|id| id.as_str().to_string()).collect();
        let removed = self
            .manager
            .execute("sorted_remove", |store| {
                store.sorted_remove(ORDERING_INDEX_KEY, &members)
            })
            .await?;
        metrics::counter!("books_reconciled_total").increment(removed as u64);
        tracing::warn!(removed, orphans = ?members, "Removed orphaned index entries");
        Ok(orphans)
    }

    async fn index_ids(&self) -> Result<Vec<BookId>> {
        let members = self
            .manager
            .execute("sorted_members", |store| {
                store.sorted_members(ORDERING_INDEX_KEY)
            })
            .await?;
        Ok(members
            .into_iter()
            .map(|(member, _score)| BookId::from(member))
            .collect())
    }

    /// Returns the index member if its record hash is gone.
    async fn find_orphan(&self, id: BookId) -> Result<Option<BookId>> {
        let key = id.store_key();
        let exists = self
            .manager
            .execute("key_exists", |store| store.key_exists(&key))
            .await?;
        Ok((!exists).then_some(id))
    }

    async fn read_record(&self, id: BookId) -> Result<BookRecord> {
        let key = id.store_key();
        let fields = self
            .manager
            .execute("read_hash", |store| store.read_hash(&key))
            .await?;
        Ok(BookRecord::from_fields(id, fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BookField;
    use crate::storage::{MemoryStore, ReconnectPolicy};
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::time::Duration;

    fn book_store() -> BookStore<MemoryStore> {
        let manager = ConnectionManager::new(MemoryStore::new(), ReconnectPolicy::default());
        BookStore::new(Arc::new(manager))
    }

    fn dune() -> NewBook {
        NewBook::new("Dune", "5", "Herbert", "Desert planet.")
    }

    #[tokio::test]
    async fn test_create_then_list() {
        let books = book_store();
        let id = books.create(dune()).await.unwrap();

        let listed = books.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].book.id, id);
        assert_eq!(listed[0].book.title, "Dune");
        assert!(!listed[0].is_degraded());
    }

    #[tokio::test]
    async fn test_invalid_create_does_no_io() {
        let books = book_store();
        let err = books
            .create(NewBook::new("", "5", "Herbert", "..."))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { ref missing } if missing == &[BookField::Title]));
        assert_eq!(books.manager().store().connect_count(), 0);
        assert_eq!(books.manager().store().ping_count(), 0);
    }

    #[tokio::test]
    async fn test_list_empty_store() {
        let books = book_store();
        assert!(books.list().await.unwrap().is_empty());
        assert_eq!(books.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_follows_index_order_not_completion_order() {
        let books = book_store();
        let first = books.create(dune()).await.unwrap();
        let second = books
            .create(NewBook::new("Emma", "4", "Austen", "Matchmaking."))
            .await
            .unwrap();
        // The first read finishes last.
        books
            .manager()
            .store()
            .set_read_delay(first.store_key(), Duration::from_millis(30));

        let listed = books.list().await.unwrap();
        let ids: Vec<_> = listed.iter().map(|r| r.book.id.clone()).collect();
        assert_eq!(ids, vec![first, second]);
    }

    #[tokio::test]
    async fn test_orphaned_index_entry_is_degraded() {
        let books = book_store();
        let kept = books.create(dune()).await.unwrap();
        let orphan = books.create(dune()).await.unwrap();
        books.manager().store().delete_key(&orphan.store_key());

        let listed = books.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(!listed[0].is_degraded());
        assert_eq!(listed[0].book.id, kept);
        assert!(listed[1].is_degraded());
        assert_eq!(listed[1].book.id, orphan);
        assert_eq!(listed[1].missing_fields, BookField::all().to_vec());
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let books = book_store();
        let err = books.get(&BookId::new("123")).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn test_get_partial_record_is_degraded() {
        let books = book_store();
        let id = books.create(dune()).await.unwrap();
        books
            .manager()
            .store()
            .remove_hash_field(&id.store_key(), "blurb");
        let record = books.get(&id).await.unwrap();
        assert!(record.is_degraded());
        assert_eq!(record.missing_fields, vec![BookField::Blurb]);
        assert_eq!(record.book.title, "Dune");
    }

    #[tokio::test]
    async fn test_reconcile_removes_only_orphans() {
        let books = book_store();
        books.create(dune()).await.unwrap();
        let orphan = books.create(dune()).await.unwrap();
        books.manager().store().delete_key(&orphan.store_key());

        assert_eq!(books.reconcile().await.unwrap(), vec![orphan]);
        assert_eq!(books.count().await.unwrap(), 1);
        assert!(books.reconcile().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_create_and_list() {
        let books = book_store();
        books.manager().store().set_available(false);
        assert!(books.create(dune()).await.unwrap_err().is_unavailable());
        assert!(books.list().await.unwrap_err().is_unavailable());
    }

    #[tokio::test]
    async fn test_concurrent_creates_get_distinct_ids() {
        let books = Arc::new(book_store());
        let mut handles = Vec::new();
        for _ in 0..20 {
            let books = Arc::clone(&books);
            handles.push(tokio::spawn(async move { books.create(dune()).await }));
        }
        let mut ids = HashSet::new();
        for handle in handles {
            ids.insert(handle.await.unwrap().unwrap());
        }
        assert_eq!(ids.len(), 20);
        assert_eq!(books.list().await.unwrap().len(), 20);
    }

    mod property_tests {
        use super::*;

        fn runtime() -> tokio::runtime::Runtime {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap()
        }

        /// Strategy for a field that may be absent, empty, or filled.
        fn maybe_field() -> impl Strategy<Value = Option<String>> {
            proptest::option::of("[A-Za-z0-9 ]{0,8}")
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            #[test]
            fn prop_ids_strictly_increase(n in 1usize..200) {
                let books = book_store();
                let mut last = 0;
                for _ in 0..n {
                    let id = books.next_id();
                    prop_assert!(id > last);
                    last = id;
                }
            }

            /// A valid create shows up exactly once, under an identifier not seen before.
            #[test]
            fn prop_valid_create_is_listed_once(
                title in "[A-Za-z0-9 ]{1,16}",
                rating in "[0-9]{1,2}",
                author in "[A-Za-z .]{1,16}",
                blurb in "[A-Za-z0-9 ,.]{1,32}",
                existing in 0usize..4
            ) {
                runtime().block_on(async move {
                    let books = book_store();
                    for _ in 0..existing {
                        books.create(dune()).await.unwrap();
                    }
                    let before: HashSet<BookId> =
                        books.list().await.unwrap().into_iter().map(|r| r.book.id).collect();

                    let id = books
                        .create(NewBook::new(title.clone(), rating.clone(), author.clone(), blurb.clone()))
                        .await
                        .unwrap();
                    prop_assert!(!before.contains(&id), "id {id} was reused");

                    let listed = books.list().await.unwrap();
                    prop_assert_eq!(listed.len(), existing + 1);
                    let matching: Vec<&BookRecord> =
                        listed.iter().filter(|r| r.book.id == id).collect();
                    prop_assert_eq!(matching.len(), 1);
                    let book = &matching[0].book;
                    prop_assert_eq!(&book.title, &title);
                    prop_assert_eq!(&book.rating, &rating);
                    prop_assert_eq!(&book.author, &author);
                    prop_assert_eq!(&book.blurb, &blurb);
                    Ok::<(), TestCaseError>(())
                })?;
            }

            /// A create with any missing field is rejected and leaves the store untouched.
            #[test]
            fn prop_incomplete_create_writes_nothing(
                title in maybe_field(),
                rating in maybe_field(),
                author in maybe_field(),
                blurb in maybe_field(),
                existing in 0usize..3
            ) {
                let expected: Vec<BookField> = [
                    (BookField::Title, &title),
                    (BookField::Rating, &rating),
                    (BookField::Author, &author),
                    (BookField::Blurb, &blurb),
                ]
                .into_iter()
                .filter(|(_, value)| value.as_deref().is_none_or(str::is_empty))
                .map(|(field, _)| field)
                .collect();
                prop_assume!(!expected.is_empty());
                let request = NewBook { title, rating, author, blurb };

                runtime().block_on(async move {
                    let books = book_store();
                    for _ in 0..existing {
                        books.create(dune()).await.unwrap();
                    }
                    let store = books.manager().store();
                    let keys_before = store.keys();
                    let connects = store.connect_count();
                    let pings = store.ping_count();

                    let err = books.create(request).await.unwrap_err();
                    prop_assert!(
                        matches!(err, Error::Validation { ref missing } if *missing == expected),
                        "unexpected error: {err}"
                    );
                    prop_assert_eq!(store.keys(), keys_before);
                    prop_assert_eq!(store.connect_count(), connects);
                    prop_assert_eq!(store.ping_count(), pings);

                    books.manager().ensure_healthy().await.unwrap();
                    let indexed = store.sorted_members(ORDERING_INDEX_KEY).await.unwrap();
                    prop_assert_eq!(indexed.len(), existing);
                    prop_assert_eq!(books.count().await.unwrap(), existing);
                    Ok::<(), TestCaseError>(())
                })?;
            }
        }
    }
}
