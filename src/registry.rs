//! Two-level registry: group name -> transaction name -> series
//!
//! Lookups go straight to the concurrent maps. Only a miss takes a lock, and
//! only one of a small fixed array of stripes chosen by hashing the key, so
//! creations of different names rarely contend and there is no global lock.

use crate::series::{TransactionSeries, WakeSignal};
use dashmap::DashMap;
use fnv::FnvHasher;
use parking_lot::Mutex;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::debug;

/// All transactions recorded under one group name
#[derive(Debug)]
pub struct Group {
    name: String,
    series: DashMap<String, Arc<TransactionSeries>>,
}

impl Group {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            series: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, name: &str) -> Option<Arc<TransactionSeries>> {
        self.series.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Every series in the group, in no particular order
    pub fn series(&self) -> Vec<Arc<TransactionSeries>> {
        self.series
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

/// Creates each [`TransactionSeries`] at most once, on first use
pub struct Registry {
    groups: DashMap<String, Arc<Group>>,
    group_locks: Box<[Mutex<()>]>,
    series_locks: Box<[Mutex<()>]>,
    ring_length: usize,
    max_update_attempts: u32,
    waker: Arc<dyn WakeSignal>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("groups", &self.groups.len())
            .field("ring_length", &self.ring_length)
            .finish()
    }
}

impl Registry {
    /// # Panics
    ///
    /// Panics if either stripe count is 0.
    pub fn new(
        group_stripes: usize,
        series_stripes: usize,
        ring_length: usize,
        max_update_attempts: u32,
        waker: Arc<dyn WakeSignal>,
    ) -> Self {
        assert!(
            group_stripes > 0 && series_stripes > 0,
            "Stripe counts must be > 0"
        );
        Self {
            groups: DashMap::new(),
            group_locks: stripes(group_stripes),
            series_locks: stripes(series_stripes),
            ring_length,
            max_update_attempts,
            waker,
        }
    }

    /// Series for (group, name), created if this is the first use
    pub fn resolve(&self, group: &str, name: &str) -> Arc<TransactionSeries> {
        let group = self.resolve_group(group);
        if let Some(series) = group.get(name) {
            return series;
        }

        let _guard = self.series_locks[stripe_index(name, self.series_locks.len())].lock();
        if let Some(series) = group.get(name) {
            return series;
        }
        let series = Arc::new(TransactionSeries::new(
            group.name(),
            name,
            self.ring_length,
            self.max_update_attempts,
            Arc::clone(&self.waker),
        ));
        group
            .series
            .insert(name.to_string(), Arc::clone(&series));
        debug!(group = group.name(), name, "created transaction series");
        series
    }

    fn resolve_group(&self, name: &str) -> Arc<Group> {
        if let Some(group) = self.groups.get(name) {
            return Arc::clone(group.value());
        }

        let _guard = self.group_locks[stripe_index(name, self.group_locks.len())].lock();
        if let Some(group) = self.groups.get(name) {
            return Arc::clone(group.value());
        }
        let group = Arc::new(Group::new(name));
        self.groups.insert(name.to_string(), Arc::clone(&group));
        debug!(group = name, "created transaction group");
        group
    }

    /// Look up an existing series without creating it
    pub fn get(&self, group: &str, name: &str) -> Option<Arc<TransactionSeries>> {
        self.groups.get(group).and_then(|g| g.value().get(name))
    }

    /// Every group, sorted by name
    pub fn groups(&self) -> Vec<Arc<Group>> {
        let mut groups: Vec<Arc<Group>> = self
            .groups
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        groups.sort_by(|a, b| a.name().cmp(b.name()));
        groups
    }

    /// Total number of series across all groups
    pub fn series_count(&self) -> usize {
        self.groups.iter().map(|entry| entry.value().len()).sum()
    }
}

fn stripes(count: usize) -> Box<[Mutex<()>]> {
    (0..count).map(|_| Mutex::new(())).collect()
}

fn stripe_index(key: &str, stripes: usize) -> usize {
    let mut hasher = FnvHasher::default();
    key.hash(&mut hasher);
    (hasher.finish() % stripes as u64) as usize
}
