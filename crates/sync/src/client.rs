//! Query client: cached reads with staleness, request de-duplication and
//! cancellation on top of the shared [`QueryCache`].

use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::{QueryError, QueryResult};
use stockyard_api::ApiError;
use stockyard_core::query::CacheData;
use stockyard_core::sync::DEFAULT_STALE_TIME_SECS;
use stockyard_core::{QueryCache, QueryKey};

type SharedFetch = Shared<BoxFuture<'static, QueryResult<CacheData>>>;

#[derive(Default)]
struct FetchSlot {
    /// Bumped by cancellation; a fetch started under an older generation
    /// never writes.
    generation: u64,
    in_flight: Option<SharedFetch>,
}

#[derive(Default)]
struct FetchRegistry {
    slots: HashMap<QueryKey, FetchSlot>,
    page_fetches: HashSet<QueryKey>,
}

struct ClientInner {
    cache: Arc<QueryCache>,
    stale_time: Duration,
    registry: Mutex<FetchRegistry>,
}

impl ClientInner {
    fn registry(&self) -> MutexGuard<'_, FetchRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn generation(&self, key: &QueryKey) -> u64 {
        self.registry()
            .slots
            .get(key)
            .map(|slot| slot.generation)
            .unwrap_or(0)
    }

    /// Clear the in-flight handle if it still belongs to `generation`.
    /// Returns whether the fetch was still current.
    fn finish(&self, key: &QueryKey, generation: u64) -> bool {
        let mut registry = self.registry();
        match registry.slots.get_mut(key) {
            Some(slot) if slot.generation == generation => {
                slot.in_flight = None;
                true
            }
            _ => false,
        }
    }

    /// Write a fetch result unless a newer write or a cancellation got there
    /// first. Waiters then receive whatever the cache holds now.
    fn settle(
        &self,
        key: &QueryKey,
        generation: u64,
        start_revision: u64,
        data: CacheData,
    ) -> QueryResult<CacheData> {
        let current = self.finish(key, generation);
        if current && self.cache.set_data_if_revision(key, start_revision, data.clone()) {
            self.cache.set_fetching(key, false);
            return Ok(data);
        }

        if current {
            self.cache.set_fetching(key, false);
        }
        debug!(
            "[QueryCache] Discarding superseded fetch for {} (cancelled={})",
            key, !current
        );
        self.cache.invalidate(key);
        match self.cache.get(key).and_then(|entry| entry.raw_data()) {
            Some(latest) => Ok(latest),
            None if current => Ok(data),
            None => Err(QueryError::Cancelled(key.clone())),
        }
    }
}

/// Shared handle to the app's query cache. Cheap to clone.
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryClient")
            .field("cache", &self.inner.cache)
            .field("stale_time", &self.inner.stale_time)
            .finish()
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new(
            Arc::new(QueryCache::new()),
            Duration::from_secs(DEFAULT_STALE_TIME_SECS),
        )
    }
}

impl QueryClient {
    pub fn new(cache: Arc<QueryCache>, stale_time: Duration) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                cache,
                stale_time,
                registry: Mutex::new(FetchRegistry::default()),
            }),
        }
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.inner.cache
    }

    pub fn stale_time(&self) -> Duration {
        self.inner.stale_time
    }

    /// Read `key`, fetching it if absent or stale.
    ///
    /// Fresh entries are returned without calling `fetcher`. Concurrent
    /// callers for the same key share one in-flight fetch.
    pub async fn fetch_query<T, F, Fut>(&self, key: QueryKey, fetcher: F) -> QueryResult<Arc<T>>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
    {
        if let Some(entry) = self.inner.cache.get(&key) {
            if !entry.is_stale(self.inner.stale_time) {
                if let Some(data) = entry.data::<T>() {
                    debug!("[QueryCache] Hit {}", key);
                    return Ok(data);
                }
                return Err(QueryError::TypeMismatch {
                    key,
                    expected: std::any::type_name::<T>(),
                });
            }
        }

        let shared = self.join_or_start(&key, fetcher);
        let data = shared.await?;
        data.downcast::<T>().map_err(|_| QueryError::TypeMismatch {
            key,
            expected: std::any::type_name::<T>(),
        })
    }

    fn join_or_start<T, F, Fut>(&self, key: &QueryKey, fetcher: F) -> SharedFetch
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
    {
        let mut registry = self.inner.registry();
        let slot = registry.slots.entry(key.clone()).or_default();
        if let Some(in_flight) = &slot.in_flight {
            debug!("[QueryCache] Joining in-flight fetch for {}", key);
            return in_flight.clone();
        }

        debug!("[QueryCache] Miss {}; fetching", key);
        let generation = slot.generation;
        let start_revision = self.inner.cache.revision(key);
        let request = fetcher();
        let inner = Arc::clone(&self.inner);
        let fetch_key = key.clone();

        let shared = async move {
            match request.await {
                Ok(value) => {
                    let data: CacheData = Arc::new(value);
                    inner.settle(&fetch_key, generation, start_revision, data)
                }
                Err(err) => {
                    warn!("[QueryCache] Fetch for {} failed: {}", fetch_key, err);
                    if inner.finish(&fetch_key, generation) {
                        inner.cache.set_fetching(&fetch_key, false);
                    }
                    Err(QueryError::fetch(&fetch_key, err))
                }
            }
        }
        .boxed()
        .shared();

        slot.in_flight = Some(shared.clone());
        self.inner.cache.set_fetching(key, true);
        shared
    }

    /// Cached value without triggering a fetch.
    pub fn get_query_data<T: Send + Sync + 'static>(
        &self,
        key: &QueryKey,
    ) -> QueryResult<Option<Arc<T>>> {
        Ok(self.inner.cache.get_data::<T>(key)?)
    }

    pub fn set_query_data<T: Send + Sync + 'static>(&self, key: QueryKey, value: T) {
        self.inner.cache.set(key, value);
    }

    pub fn is_fetching(&self, key: &QueryKey) -> bool {
        self.inner
            .registry()
            .slots
            .get(key)
            .map(|slot| slot.in_flight.is_some())
            .unwrap_or(false)
    }

    /// Abandon in-flight fetches for `keys`. Their results are never written.
    pub fn cancel_queries<'a, I>(&self, keys: I)
    where
        I: IntoIterator<Item = &'a QueryKey>,
    {
        let mut registry = self.inner.registry();
        for key in keys {
            if let Some(slot) = registry.slots.get_mut(key) {
                slot.generation += 1;
                if slot.in_flight.take().is_some() {
                    debug!("[QueryCache] Cancelled fetch for {}", key);
                    self.inner.cache.set_fetching(key, false);
                }
            }
        }
    }

    /// Mark `key` stale so the next read revalidates.
    pub fn invalidate(&self, key: &QueryKey) -> bool {
        self.inner.cache.invalidate(key)
    }

    pub fn invalidate_prefix(&self, prefix: &QueryKey) -> usize {
        self.inner.cache.invalidate_prefix(prefix)
    }

    pub fn remove(&self, key: &QueryKey) {
        self.cancel_queries([key]);
        self.inner.cache.remove(key);
    }

    /// Drop every cached entry and abandon every in-flight fetch.
    pub fn clear(&self) {
        {
            let mut registry = self.inner.registry();
            for slot in registry.slots.values_mut() {
                slot.generation += 1;
                slot.in_flight = None;
            }
            registry.page_fetches.clear();
        }
        self.inner.cache.clear();
    }

    /// Claim the "next page" fetch for `key`. `None` while another caller
    /// holds it.
    pub(crate) fn begin_page_fetch(&self, key: &QueryKey) -> Option<PageFetchGuard> {
        if !self.inner.registry().page_fetches.insert(key.clone()) {
            return None;
        }
        Some(PageFetchGuard {
            inner: Arc::clone(&self.inner),
            key: key.clone(),
        })
    }

    pub(crate) fn is_fetching_page(&self, key: &QueryKey) -> bool {
        self.inner.registry().page_fetches.contains(key)
    }
}

/// Releases a page-fetch claim on drop.
pub(crate) struct PageFetchGuard {
    inner: Arc<ClientInner>,
    key: QueryKey,
}

impl Drop for PageFetchGuard {
    fn drop(&mut self) {
        self.inner.registry().page_fetches.remove(&self.key);
    }
}
