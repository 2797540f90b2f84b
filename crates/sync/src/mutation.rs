//! Optimistic mutation bookkeeping.
//!
//! A [`MutationScope`] covers one write: it cancels in-flight fetches for the
//! affected keys, snapshots them, and on failure puts every key back exactly
//! as it was. Settling marks the keys stale either way.

use log::{debug, warn};

use crate::client::QueryClient;
use stockyard_core::query::CacheSnapshot;
use stockyard_core::QueryKey;

pub struct MutationScope {
    client: QueryClient,
    label: String,
    keys: Vec<QueryKey>,
    snapshot: Option<CacheSnapshot>,
}

impl MutationScope {
    /// Cancel fetches for `keys` and snapshot their current values.
    pub fn begin(client: &QueryClient, label: impl Into<String>, keys: Vec<QueryKey>) -> Self {
        let label = label.into();
        client.cancel_queries(&keys);
        let snapshot = client.cache().snapshot(&keys);
        debug!("[Mutation] {}: snapshotted {} keys", label, snapshot.len());
        Self {
            client: client.clone(),
            label,
            keys,
            snapshot: Some(snapshot),
        }
    }

    pub fn keys(&self) -> &[QueryKey] {
        &self.keys
    }

    /// Include another key in the settle pass (e.g. the server id's detail key).
    pub fn track(&mut self, key: QueryKey) {
        if !self.keys.contains(&key) {
            self.keys.push(key);
        }
    }

    /// Restore every snapshotted key to its pre-mutation value.
    pub fn rollback(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            warn!(
                "[Mutation] {}: rolling back {} keys",
                self.label,
                snapshot.len()
            );
            self.client.cache().restore(snapshot);
        }
    }

    /// Drop the snapshot and mark every affected key stale.
    pub fn settle(mut self) {
        self.snapshot = None;
        self.invalidate_keys();
        debug!("[Mutation] {}: settled", self.label);
    }

    fn invalidate_keys(&self) {
        for key in &self.keys {
            self.client.invalidate(key);
        }
    }
}

/// A scope dropped without `settle`, e.g. on an early `?` return, restores
/// its snapshot and still marks the keys stale.
impl Drop for MutationScope {
    fn drop(&mut self) {
        if self.snapshot.is_some() {
            self.rollback();
            self.invalidate_keys();
        }
    }
}

impl std::fmt::Debug for MutationScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationScope")
            .field("label", &self.label)
            .field("keys", &self.keys)
            .field("has_snapshot", &self.snapshot.is_some())
            .finish()
    }
}
