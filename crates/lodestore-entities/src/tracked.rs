//! Tracked map: a cell plus write-behind bookkeeping
//!
//! Every mutation marks its key pending-persist; removals also mark it
//! pending-delete. The flusher snapshots pending keys with a write stamp and
//! clears them only if no newer write arrived in the meantime.
//!
//! LOCK ORDER: dirty state, then cell. Observers run after both are released.

use std::sync::Arc;

use hashbrown::{HashMap, HashSet};
use parking_lot::RwLock;

use crate::cell::{Cell, CellIter};

/// Mutation hooks, called synchronously after the change is visible.
pub trait Observer<T>: Send + Sync {
    /// `previous` is the value this write replaced, if any.
    fn on_set(&self, key: &str, previous: Option<&T>, value: &T);

    fn on_remove(&self, key: &str, value: &T);
}

/// Counters describing the live view and the write-behind backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MapMetrics {
    pub live: usize,
    pub pending_persist: usize,
    pub pending_delete: usize,
    pub total_persisted: u64,
    pub total_deleted: u64,
}

/// A key snapshotted for flushing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingKey {
    pub key: String,
    pub delete: bool,
    /// Pass back to [`TrackedMap::mark_flushed`]
    pub stamp: u64,
}

#[derive(Default)]
struct DirtyState {
    /// key -> stamp of its latest unflushed write
    pending: HashMap<String, u64>,
    deletes: HashSet<String>,
    next_stamp: u64,
    live: usize,
    persisted: u64,
    deleted: u64,
}

impl DirtyState {
    fn mark(&mut self, key: &str, delete: bool) {
        self.next_stamp += 1;
        self.pending.insert(key.to_string(), self.next_stamp);
        if delete {
            self.deletes.insert(key.to_string());
        } else {
            self.deletes.remove(key);
        }
    }

    fn clear(&mut self, key: &str) {
        if self.pending.remove(key).is_some() {
            self.persisted += 1;
            if self.deletes.remove(key) {
                self.deleted += 1;
            }
        }
    }
}

/// Map with dirty tracking and observer fan-out.
///
/// No operation fails. Reads never observe a pending-delete key.
pub struct TrackedMap<T> {
    cell: Cell<T>,
    state: RwLock<DirtyState>,
    observers: RwLock<Vec<Arc<dyn Observer<T>>>>,
}

impl<T: Clone + Send + Sync + 'static> TrackedMap<T> {
    pub fn new() -> Self {
        Self {
            cell: Cell::new(),
            state: RwLock::new(DirtyState::default()),
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Register an observer. Observers run in registration order.
    pub fn observe(&self, observer: Arc<dyn Observer<T>>) {
        self.observers.write().push(observer);
    }

    /// Insert or replace `key`, marking it pending-persist.
    pub fn set(&self, key: &str, value: T) {
        let previous = {
            let mut state = self.state.write();
            let previous = self.cell.store(key.to_string(), value.clone());
            if previous.is_none() {
                state.live += 1;
            }
            state.mark(key, false);
            previous
        };
        self.notify_set(key, previous.as_ref(), &value);
    }

    /// Remove `key`, marking it pending-delete. Returns the removed value.
    pub fn remove(&self, key: &str) -> Option<T> {
        let removed = {
            let mut state = self.state.write();
            let removed = self.cell.delete(key)?;
            state.live = state.live.saturating_sub(1);
            state.mark(key, true);
            removed
        };
        for observer in self.observers.read().iter() {
            observer.on_remove(key, &removed);
        }
        Some(removed)
    }

    /// Remove every live value matching `predicate`. Returns how many were removed.
    pub fn remove_by<F>(&self, mut predicate: F) -> usize
    where
        F: FnMut(&T) -> bool,
    {
        let matches: Vec<String> = self
            .items()
            .filter(|(_, value)| predicate(value))
            .map(|(key, _)| key)
            .collect();
        matches.iter().filter(|key| self.remove(key).is_some()).count()
    }

    pub fn get(&self, key: &str) -> Option<T> {
        if self.state.read().deletes.contains(key) {
            return None;
        }
        self.cell.load(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        !self.state.read().deletes.contains(key) && self.cell.contains_key(key)
    }

    /// Lazily iterate live `(key, value)` pairs. Same consistency as [`Cell::range`].
    pub fn items(&self) -> Items<'_, T> {
        Items {
            inner: self.cell.range(),
            state: &self.state,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = String> + '_ {
        self.items().map(|(key, _)| key)
    }

    pub fn values(&self) -> impl Iterator<Item = T> + '_ {
        self.items().map(|(_, value)| value)
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.state.read().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear the pending flags for `key` unconditionally.
    ///
    /// A second call is a no-op.
    pub fn mark_persisted(&self, key: &str) {
        self.state.write().clear(key);
    }

    /// Snapshot up to `limit` pending keys with their write stamps.
    pub fn pending_batch(&self, limit: usize) -> Vec<PendingKey> {
        let state = self.state.read();
        state
            .pending
            .iter()
            .take(limit)
            .map(|(key, &stamp)| PendingKey {
                key: key.clone(),
                delete: state.deletes.contains(key),
                stamp,
            })
            .collect()
    }

    /// Clear the pending flags for `key` if it has not been written since
    /// `stamp` was taken. Returns false when a newer write is still pending.
    pub fn mark_flushed(&self, key: &str, stamp: u64) -> bool {
        let mut state = self.state.write();
        if state.pending.get(key) != Some(&stamp) {
            return false;
        }
        state.clear(key);
        true
    }

    /// Import records read from disk without marking them dirty.
    ///
    /// Keys with an unflushed local write are skipped: that write is newer
    /// than anything on disk. Returns how many records were applied.
    pub fn load_many(&self, batch: Vec<(String, T)>) -> usize {
        let (applied, displaced) = {
            let mut state = self.state.write();
            let applied: Vec<(String, T)> = batch
                .into_iter()
                .filter(|(key, _)| !state.pending.contains_key(key))
                .collect();
            let displaced = self.cell.store_many(applied.iter().cloned());
            state.live += displaced.iter().filter(|previous| previous.is_none()).count();
            (applied, displaced)
        };

        for ((key, value), previous) in applied.iter().zip(&displaced) {
            self.notify_set(key, previous.as_ref(), value);
        }
        applied.len()
    }

    pub fn metrics(&self) -> MapMetrics {
        let state = self.state.read();
        MapMetrics {
            live: state.live,
            pending_persist: state.pending.len(),
            pending_delete: state.deletes.len(),
            total_persisted: state.persisted,
            total_deleted: state.deleted,
        }
    }

    fn notify_set(&self, key: &str, previous: Option<&T>, value: &T) {
        for observer in self.observers.read().iter() {
            observer.on_set(key, previous, value);
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for TrackedMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over live pairs, skipping pending deletes.
pub struct Items<'a, T> {
    inner: CellIter<'a, T>,
    state: &'a RwLock<DirtyState>,
}

impl<T: Clone> Iterator for Items<'_, T> {
    type Item = (String, T);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (key, value) = self.inner.next()?;
            if !self.state.read().deletes.contains(&key) {
                return Some((key, value));
            }
        }
    }
}
