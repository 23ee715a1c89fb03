//! Secondary indexes: derived value -> primary keys
//!
//! An index is an [`Observer`] on its collection's tracked map. Lookups join
//! bucket keys back through the map, so pending deletes never leak out.

use std::fmt;
use std::sync::Arc;

use hashbrown::{HashMap, HashSet};
use parking_lot::RwLock;

use crate::tracked::{Observer, TrackedMap};

type Derive<T> = dyn Fn(&T) -> String + Send + Sync;

struct Buckets<T> {
    name: String,
    derive: Box<Derive<T>>,
    buckets: RwLock<HashMap<String, HashSet<String>>>,
}

impl<T> Buckets<T> {
    fn insert(&self, derived: String, key: &str) {
        self.buckets.write().entry(derived).or_default().insert(key.to_string());
    }

    fn remove(&self, derived: &str, key: &str) {
        let mut buckets = self.buckets.write();
        if let Some(bucket) = buckets.get_mut(derived) {
            bucket.remove(key);
            if bucket.is_empty() {
                buckets.remove(derived);
            }
        }
    }
}

impl<T: Send + Sync> Observer<T> for Buckets<T> {
    fn on_set(&self, key: &str, previous: Option<&T>, value: &T) {
        let derived = (self.derive)(value);
        if let Some(previous) = previous {
            let old = (self.derive)(previous);
            if old != derived {
                self.remove(&old, key);
            }
        }
        self.insert(derived, key);
    }

    fn on_remove(&self, key: &str, value: &T) {
        let derived = (self.derive)(value);
        self.remove(&derived, key);
    }
}

/// Exact-match secondary index over a collection.
///
/// Created through `Entities::create_index`. Records present before creation
/// are not indexed unless [`Index::backfill`] is called.
pub struct Index<T> {
    buckets: Arc<Buckets<T>>,
    map: Arc<TrackedMap<T>>,
}

impl<T: Clone + Send + Sync + 'static> Index<T> {
    pub(crate) fn attach<F>(name: &str, map: Arc<TrackedMap<T>>, derive: F) -> Self
    where
        F: Fn(&T) -> String + Send + Sync + 'static,
    {
        let buckets = Arc::new(Buckets {
            name: name.to_string(),
            derive: Box::new(derive),
            buckets: RwLock::new(HashMap::new()),
        });
        map.observe(Arc::clone(&buckets) as Arc<dyn Observer<T>>);
        Self { buckets, map }
    }

    pub fn name(&self) -> &str {
        &self.buckets.name
    }

    /// Live records whose derived value equals `derived`.
    ///
    /// Bucket keys are snapshotted up front; each record is read lazily and
    /// skipped if it was removed or no longer derives to `derived`.
    pub fn each(&self, derived: &str) -> impl Iterator<Item = (String, T)> + '_ {
        let derived = derived.to_string();
        self.bucket_keys(&derived).into_iter().filter_map(move |key| {
            let value = self.map.get(&key)?;
            ((self.buckets.derive)(&value) == derived).then_some((key, value))
        })
    }

    /// Primary keys of the records [`Index::each`] would yield.
    pub fn keys(&self, derived: &str) -> Vec<String> {
        self.each(derived).map(|(key, _)| key).collect()
    }

    pub fn count(&self, derived: &str) -> usize {
        self.each(derived).count()
    }

    /// Number of non-empty buckets, counted without the live-record check.
    pub fn bucket_count(&self) -> usize {
        self.buckets.buckets.read().len()
    }

    fn bucket_keys(&self, derived: &str) -> Vec<String> {
        self.buckets
            .buckets
            .read()
            .get(derived)
            .map(|bucket| bucket.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Index every record already in the collection. Returns how many were added.
    pub fn backfill(&self) -> usize {
        let mut added = 0;
        for (key, value) in self.map.items() {
            self.buckets.insert((self.buckets.derive)(&value), &key);
            added += 1;
        }
        added
    }
}

impl<T> Clone for Index<T> {
    fn clone(&self) -> Self {
        Self {
            buckets: Arc::clone(&self.buckets),
            map: Arc::clone(&self.map),
        }
    }
}

impl<T> fmt::Debug for Index<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Index")
            .field("name", &self.buckets.name)
            .field("buckets", &self.buckets.buckets.read().len())
            .finish()
    }
}
