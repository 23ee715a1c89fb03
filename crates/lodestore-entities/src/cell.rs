//! Concurrent cell: a thread-safe string-keyed map
//!
//! Entries live in a dense vector with a key -> position index. Removal swaps
//! the last entry into the vacated slot, so positions stay contiguous and an
//! iterator can walk them by index, taking the read lock for one item at a
//! time.

use hashbrown::HashMap;
use parking_lot::RwLock;

struct Slots<T> {
    entries: Vec<(String, T)>,
    positions: HashMap<String, usize>,
}

impl<T> Slots<T> {
    fn store(&mut self, key: String, value: T) -> Option<T> {
        if let Some(&pos) = self.positions.get(&key) {
            return Some(std::mem::replace(&mut self.entries[pos].1, value));
        }
        self.positions.insert(key.clone(), self.entries.len());
        self.entries.push((key, value));
        None
    }

    fn delete(&mut self, key: &str) -> Option<T> {
        let pos = self.positions.remove(key)?;
        let (_, value) = self.entries.swap_remove(pos);
        if let Some((moved, _)) = self.entries.get(pos) {
            self.positions.insert(moved.clone(), pos);
        }
        Some(value)
    }
}

/// Thread-safe map from string keys to values.
///
/// One lock guards the whole map: writers take it exclusively, readers and
/// iterators share it.
pub struct Cell<T> {
    slots: RwLock<Slots<T>>,
}

impl<T> Cell<T> {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Slots {
                entries: Vec::new(),
                positions: HashMap::new(),
            }),
        }
    }

    /// Insert or replace. Returns the displaced value.
    pub fn store(&self, key: String, value: T) -> Option<T> {
        self.slots.write().store(key, value)
    }

    /// Remove `key`. Absent keys are a no-op.
    pub fn delete(&self, key: &str) -> Option<T> {
        self.slots.write().delete(key)
    }

    /// Store every entry in one critical section. Returns displaced values in
    /// input order.
    ///
    /// Readers see all of the batch or none of it, but the batch is not
    /// ordered against writes to unrelated keys.
    pub fn store_many<I>(&self, batch: I) -> Vec<Option<T>>
    where
        I: IntoIterator<Item = (String, T)>,
    {
        let mut slots = self.slots.write();
        batch.into_iter().map(|(key, value)| slots.store(key, value)).collect()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.slots.read().positions.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.slots.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().entries.is_empty()
    }
}

impl<T: Clone> Cell<T> {
    pub fn load(&self, key: &str) -> Option<T> {
        let slots = self.slots.read();
        slots.positions.get(key).map(|&pos| slots.entries[pos].1.clone())
    }

    /// Lazily iterate `(key, value)` pairs.
    ///
    /// Not a snapshot. Each step takes the read lock for one item, so writers
    /// interleave freely: a key stored or deleted mid-iteration may or may not
    /// be seen, and a value may be one write behind. No key is yielded twice.
    pub fn range(&self) -> CellIter<'_, T> {
        CellIter {
            cell: self,
            position: 0,
        }
    }
}

impl<T> Default for Cell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Cell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cell").field("len", &self.len()).finish()
    }
}

/// Iterator returned by [`Cell::range`].
pub struct CellIter<'a, T> {
    cell: &'a Cell<T>,
    position: usize,
}

impl<T: Clone> Iterator for CellIter<'_, T> {
    type Item = (String, T);

    fn next(&mut self) -> Option<Self::Item> {
        let slots = self.cell.slots.read();
        let item = slots.entries.get(self.position).cloned()?;
        self.position += 1;
        Some(item)
    }
}
