//! Process-wide keyed store for fetched resource data.
//!
//! The store is synchronous and framework-free. Every write replaces the stored
//! value with a new `Arc`; previous values are never mutated in place, which is
//! what makes snapshots and rollbacks cheap.

use log::debug;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use super::QueryKey;
use crate::errors::{CoreError, Result};

/// Type-erased cached value.
pub type CacheData = Arc<dyn Any + Send + Sync>;

/// One cached slice with its staleness metadata.
#[derive(Clone, Default)]
pub struct CacheEntry {
    data: Option<CacheData>,
    updated_at: Option<Instant>,
    invalidated: bool,
    is_fetching: bool,
    revision: u64,
}

impl CacheEntry {
    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    /// Typed view of the cached value. `None` when absent or of another type.
    pub fn data<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.data.clone().and_then(|data| data.downcast::<T>().ok())
    }

    pub fn raw_data(&self) -> Option<CacheData> {
        self.data.clone()
    }

    pub fn updated_at(&self) -> Option<Instant> {
        self.updated_at
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    pub fn is_fetching(&self) -> bool {
        self.is_fetching
    }

    /// Write stamp of the last value stored under this key.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Stale entries are eligible for refetch on the next read.
    pub fn is_stale(&self, stale_time: Duration) -> bool {
        match self.updated_at {
            _ if self.invalidated => true,
            Some(updated_at) => updated_at.elapsed() >= stale_time,
            None => true,
        }
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("has_data", &self.data.is_some())
            .field("updated_at", &self.updated_at)
            .field("invalidated", &self.invalidated)
            .field("is_fetching", &self.is_fetching)
            .field("revision", &self.revision)
            .finish()
    }
}

/// Pre-mutation copy of a set of keys, restorable exactly.
#[derive(Clone, Default)]
pub struct CacheSnapshot {
    entries: Vec<(QueryKey, Option<CacheEntry>)>,
}

impl CacheSnapshot {
    pub fn keys(&self) -> impl Iterator<Item = &QueryKey> {
        self.entries.iter().map(|(key, _)| key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for CacheSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.keys()).finish()
    }
}

/// Keyed cache shared by every sync hook and mutation.
#[derive(Default)]
pub struct QueryCache {
    entries: RwLock<HashMap<QueryKey, CacheEntry>>,
    write_counter: AtomicU64,
}

impl fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache")
            .field("entries", &self.len())
            .finish()
    }
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_revision(&self) -> u64 {
        self.write_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<QueryKey, CacheEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<QueryKey, CacheEntry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn get(&self, key: &QueryKey) -> Option<CacheEntry> {
        self.read().get(key).cloned()
    }

    /// Typed read. Absent keys and keys without data yield `Ok(None)`.
    pub fn get_data<T: Send + Sync + 'static>(&self, key: &QueryKey) -> Result<Option<Arc<T>>> {
        let Some(data) = self.read().get(key).and_then(|entry| entry.data.clone()) else {
            return Ok(None);
        };
        data.downcast::<T>()
            .map(Some)
            .map_err(|_| CoreError::type_mismatch::<T>(key))
    }

    /// Revision of the key's current value, `0` when nothing is stored.
    pub fn revision(&self, key: &QueryKey) -> u64 {
        self.read().get(key).map(|entry| entry.revision).unwrap_or(0)
    }

    /// Store a value, replacing whatever was there. Returns the new revision.
    pub fn set<T: Send + Sync + 'static>(&self, key: QueryKey, value: T) -> u64 {
        self.set_data(key, Arc::new(value))
    }

    pub fn set_data(&self, key: QueryKey, data: CacheData) -> u64 {
        let revision = self.next_revision();
        let mut entries = self.write();
        let entry = entries.entry(key).or_default();
        entry.data = Some(data);
        entry.updated_at = Some(Instant::now());
        entry.invalidated = false;
        entry.revision = revision;
        revision
    }

    /// Store `data` only if the key still holds the value stamped `expected`.
    pub fn set_data_if_revision(&self, key: &QueryKey, expected: u64, data: CacheData) -> bool {
        let mut entries = self.write();
        let current = entries.get(key).map(|entry| entry.revision).unwrap_or(0);
        if current != expected {
            debug!(
                "[QueryCache] Rejected write to {} (revision {} != {})",
                key, current, expected
            );
            return false;
        }
        let revision = self.next_revision();
        let entry = entries.entry(key.clone()).or_default();
        entry.data = Some(data);
        entry.updated_at = Some(Instant::now());
        entry.invalidated = false;
        entry.revision = revision;
        true
    }

    /// Functional update: `f` receives the previous value (or `None`) and
    /// returns the replacement.
    pub fn update<T, F>(&self, key: QueryKey, f: F) -> Result<Arc<T>>
    where
        T: Send + Sync + 'static,
        F: FnOnce(Option<&T>) -> T,
    {
        let revision = self.next_revision();
        let mut entries = self.write();
        let entry = entries.entry(key.clone()).or_default();
        let previous = match entry.data.clone() {
            Some(data) => Some(
                data.downcast::<T>()
                    .map_err(|_| CoreError::type_mismatch::<T>(&key))?,
            ),
            None => None,
        };
        let next = Arc::new(f(previous.as_deref()));
        let data: CacheData = next.clone();
        entry.data = Some(data);
        entry.updated_at = Some(Instant::now());
        entry.invalidated = false;
        entry.revision = revision;
        Ok(next)
    }

    /// Update a value only if one is already cached. `f` returns `None` to
    /// leave the entry untouched. Returns whether a write happened.
    ///
    /// Unlike [`QueryCache::update`], this keeps the entry's staleness: a
    /// patched list is still due for revalidation when its window elapses.
    pub fn update_existing<T, F>(&self, key: &QueryKey, f: F) -> Result<bool>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&T) -> Option<T>,
    {
        let mut entries = self.write();
        let Some(entry) = entries.get_mut(key) else {
            return Ok(false);
        };
        let Some(data) = entry.data.clone() else {
            return Ok(false);
        };
        let previous = data
            .downcast::<T>()
            .map_err(|_| CoreError::type_mismatch::<T>(key))?;
        match f(&previous) {
            Some(next) => {
                entry.data = Some(Arc::new(next));
                entry.revision = self.next_revision();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Mark a key stale so the next read revalidates. Returns false if absent.
    pub fn invalidate(&self, key: &QueryKey) -> bool {
        match self.write().get_mut(key) {
            Some(entry) => {
                entry.invalidated = true;
                true
            }
            None => false,
        }
    }

    /// Mark every key under `prefix` stale. Returns how many were marked.
    pub fn invalidate_prefix(&self, prefix: &QueryKey) -> usize {
        let mut entries = self.write();
        let mut count = 0;
        for (key, entry) in entries.iter_mut() {
            if key.starts_with(prefix) {
                entry.invalidated = true;
                count += 1;
            }
        }
        count
    }

    pub fn remove(&self, key: &QueryKey) -> Option<CacheEntry> {
        self.write().remove(key)
    }

    /// Drop every entry (app-wide cache clear, e.g. on logout).
    pub fn clear(&self) {
        let mut entries = self.write();
        debug!("[QueryCache] Clearing {} entries", entries.len());
        entries.clear();
    }

    /// Keys starting with `prefix`, sorted.
    pub fn keys_with_prefix(&self, prefix: &QueryKey) -> Vec<QueryKey> {
        let mut keys: Vec<QueryKey> = self
            .read()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Set the in-flight marker, creating an empty entry if needed.
    pub fn set_fetching(&self, key: &QueryKey, fetching: bool) {
        let mut entries = self.write();
        if fetching {
            entries.entry(key.clone()).or_default().is_fetching = true;
        } else {
            let marker_only = match entries.get_mut(key) {
                Some(entry) => {
                    entry.is_fetching = false;
                    entry.data.is_none() && !entry.invalidated
                }
                None => false,
            };
            if marker_only {
                entries.remove(key);
            }
        }
    }

    /// Copy the current state of `keys`, including keys that are absent.
    pub fn snapshot<'a, I>(&self, keys: I) -> CacheSnapshot
    where
        I: IntoIterator<Item = &'a QueryKey>,
    {
        let entries = self.read();
        CacheSnapshot {
            entries: keys
                .into_iter()
                .map(|key| {
                    let entry = entries.get(key).filter(|entry| entry.data.is_some());
                    (key.clone(), entry.cloned())
                })
                .collect(),
        }
    }

    /// Put every snapshotted key back to its captured value. Keys that were
    /// absent at snapshot time are removed.
    pub fn restore(&self, snapshot: CacheSnapshot) {
        let mut entries = self.write();
        for (key, saved) in snapshot.entries {
            match saved {
                Some(mut saved) => {
                    saved.revision = self.next_revision();
                    saved.is_fetching = entries
                        .get(&key)
                        .map(|entry| entry.is_fetching)
                        .unwrap_or(false);
                    entries.insert(key, saved);
                }
                None => {
                    entries.remove(&key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(parts: &[&str]) -> QueryKey {
        QueryKey::from_parts(parts.iter().copied())
    }

    #[test]
    fn update_receives_previous_value_or_none() {
        let cache = QueryCache::new();
        let k = key(&["vendors"]);

        let first = cache
            .update::<Vec<u32>, _>(k.clone(), |prev| {
                assert!(prev.is_none());
                vec![1]
            })
            .expect("first update");
        assert_eq!(*first, vec![1]);

        let second = cache
            .update::<Vec<u32>, _>(k.clone(), |prev| {
                let mut next = prev.cloned().unwrap_or_default();
                next.push(2);
                next
            })
            .expect("second update");
        assert_eq!(*second, vec![1, 2]);
        // the first Arc is untouched by the second write
        assert_eq!(*first, vec![1]);
    }

    #[test]
    fn typed_read_reports_mismatch() {
        let cache = QueryCache::new();
        let k = key(&["vendors"]);
        cache.set(k.clone(), vec![1_u32]);

        assert!(cache.get_data::<Vec<u32>>(&k).expect("typed read").is_some());
        assert!(matches!(
            cache.get_data::<String>(&k),
            Err(CoreError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn update_existing_skips_absent_keys() {
        let cache = QueryCache::new();
        let k = key(&["trucks"]);
        let wrote = cache
            .update_existing::<Vec<u32>, _>(&k, |_| Some(vec![9]))
            .expect("update");
        assert!(!wrote);
        assert!(cache.get(&k).is_none());
    }

    #[test]
    fn revisions_increase_across_remove_and_recreate() {
        let cache = QueryCache::new();
        let k = key(&["packages"]);
        let first = cache.set(k.clone(), 1_u8);
        cache.remove(&k);
        assert_eq!(cache.revision(&k), 0);
        let second = cache.set(k.clone(), 1_u8);
        assert!(second > first);
    }

    #[test]
    fn conditional_write_rejects_newer_revision() {
        let cache = QueryCache::new();
        let k = key(&["production", "pending"]);
        let started_at = cache.revision(&k);
        cache.set(k.clone(), vec!["pushed"]);

        let written = cache.set_data_if_revision(&k, started_at, Arc::new(vec!["fetched"]));
        assert!(!written);
        let data = cache.get_data::<Vec<&str>>(&k).expect("read").expect("data");
        assert_eq!(*data, vec!["pushed"]);
    }

    #[test]
    fn invalidate_marks_entry_stale() {
        let cache = QueryCache::new();
        let k = key(&["users"]);
        cache.set(k.clone(), 0_u8);
        assert!(!cache.get(&k).expect("entry").is_stale(Duration::from_secs(60)));

        assert!(cache.invalidate(&k));
        assert!(cache.get(&k).expect("entry").is_stale(Duration::from_secs(60)));
        assert!(!cache.invalidate(&key(&["missing"])));
    }

    #[test]
    fn invalidate_prefix_only_touches_matching_keys() {
        let cache = QueryCache::new();
        cache.set(key(&["vendors", "search", "a"]), 0_u8);
        cache.set(key(&["vendors", "search", "b"]), 0_u8);
        cache.set(key(&["vendors"]), 0_u8);

        assert_eq!(cache.invalidate_prefix(&key(&["vendors", "search"])), 2);
        assert!(!cache
            .get(&key(&["vendors"]))
            .expect("entry")
            .is_invalidated());
    }

    #[test]
    fn snapshot_restore_is_exact_and_removes_new_keys() {
        let cache = QueryCache::new();
        let existing = key(&["vendors"]);
        let created = key(&["vendor", "v9"]);
        cache.set(existing.clone(), vec!["Acme".to_string()]);

        let snapshot = cache.snapshot([&existing, &created]);
        cache.set(existing.clone(), vec!["Acme Corp".to_string()]);
        cache.set(created.clone(), "v9".to_string());

        cache.restore(snapshot);
        let restored = cache
            .get_data::<Vec<String>>(&existing)
            .expect("read")
            .expect("data");
        assert_eq!(*restored, vec!["Acme".to_string()]);
        assert!(cache.get(&created).is_none());
    }

    #[test]
    fn fetch_marker_without_data_is_cleared() {
        let cache = QueryCache::new();
        let k = key(&["calendar"]);
        cache.set_fetching(&k, true);
        assert!(cache.get(&k).expect("marker").is_fetching());
        cache.set_fetching(&k, false);
        assert!(cache.get(&k).is_none());
    }
}
