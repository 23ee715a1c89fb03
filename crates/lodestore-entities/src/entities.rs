//! Entities: a typed, persistent record collection
//!
//! Composes a [`TrackedMap`] (the live view), [`Persistence`] (write-behind
//! flushing and startup loading) and any number of secondary [`Index`]es.
//! Reads and writes touch memory only; the flusher thread makes them durable.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use lodestore_core::{Engine, EngineStats};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{error, info};

use crate::barrier::LoadBarrier;
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::index::Index;
use crate::persistence::{FlushCounters, FlushHandle, Persistence};
use crate::tracked::{MapMetrics, TrackedMap};

/// A value stored in an [`Entities`] collection.
///
/// Records are replaced whole on update; the last write wins.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Stable primary key
    fn key(&self) -> &str;
}

/// Point-in-time view of a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Metrics {
    pub path: PathBuf,
    pub map: MapMetrics,
    pub flush: FlushCounters,
    pub engine: EngineStats,
}

impl fmt::Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.path.display())?;
        writeln!(
            f,
            "  records: {} live, {} pending persist, {} pending delete",
            self.map.live, self.map.pending_persist, self.map.pending_delete
        )?;
        writeln!(
            f,
            "  persisted: {} total, {} deletes",
            self.map.total_persisted, self.map.total_deleted
        )?;
        writeln!(
            f,
            "  flusher: {} cycles, {} batches, {} records",
            self.flush.cycles, self.flush.batches, self.flush.records
        )?;
        write!(
            f,
            "  engine: {} keys, {} segments, {} bytes ({:.1}% dead)",
            self.engine.keys,
            self.engine.segments,
            self.engine.total_bytes,
            self.engine.dead_ratio() * 100.0
        )
    }
}

/// Persistent collection of records keyed by [`Record::key`].
///
/// CRUD and query methods never fail and never wait on disk. Dropping the
/// collection runs a final flush.
pub struct Entities<T: Record> {
    path: PathBuf,
    map: Arc<TrackedMap<T>>,
    persistence: Arc<Persistence<T>>,
    flusher: Mutex<Option<FlushHandle>>,
    loader: Mutex<Option<thread::JoinHandle<()>>>,
}

impl<T: Record> Entities<T> {
    /// Open the collection at `path`, load every record, then start flushing.
    pub fn open<P: AsRef<Path>>(path: P, config: StoreConfig) -> StoreResult<Self> {
        let entities = Self::open_engine(path.as_ref(), &config)?;
        entities.persistence.load(config.max_load_chunk)?;
        entities.start_flusher(&config)?;
        Ok(entities)
    }

    /// Open the collection and load it on a background thread registered with
    /// `barrier`. Returns as soon as the engine is open.
    ///
    /// Until the load finishes, reads see a partial view. Writes made in the
    /// meantime win over the values being loaded. A load failure goes to the
    /// configured fatal handler.
    pub fn open_deferred<P: AsRef<Path>>(
        path: P,
        config: StoreConfig,
        barrier: &LoadBarrier,
    ) -> StoreResult<Self> {
        let entities = Self::open_engine(path.as_ref(), &config)?;
        entities.start_flusher(&config)?;

        let ticket = barrier.register();
        let persistence = Arc::clone(&entities.persistence);
        let fatal = Arc::clone(&config.fatal_handler);
        let chunk = config.max_load_chunk;
        let loader = thread::Builder::new()
            .name("lodestore-load".to_string())
            .spawn(move || {
                let _ticket = ticket;
                if let Err(err) = persistence.load(chunk) {
                    fatal(&err);
                }
            })
            .map_err(|source| StoreError::Spawn {
                name: "load",
                source,
            })?;
        *entities.loader.lock() = Some(loader);
        Ok(entities)
    }

    fn open_engine(path: &Path, config: &StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        let engine = Arc::new(Engine::open(path, config.engine.clone())?);
        let map = Arc::new(TrackedMap::new());
        let persistence = Persistence::new(engine, Arc::clone(&map), config.max_flush_batch);
        let persistence = Arc::new(persistence);
        Ok(Self {
            path: path.to_path_buf(),
            map,
            persistence,
            flusher: Mutex::new(None),
            loader: Mutex::new(None),
        })
    }

    fn start_flusher(&self, config: &StoreConfig) -> StoreResult<()> {
        let handle = FlushHandle::start(
            Arc::clone(&self.persistence),
            config.flush_interval,
            Arc::clone(&config.fatal_handler),
        )?;
        *self.flusher.lock() = Some(handle);
        Ok(())
    }

    /// Insert or replace `record` under its own key.
    pub fn add(&self, record: T) {
        let key = record.key().to_string();
        self.map.set(&key, record);
    }

    pub fn add_many<I: IntoIterator<Item = T>>(&self, records: I) {
        for record in records {
            self.add(record);
        }
    }

    pub fn get(&self, key: &str) -> Option<T> {
        self.map.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    /// Remove by key. Returns the removed record.
    pub fn remove(&self, key: &str) -> Option<T> {
        self.map.remove(key)
    }

    /// Remove the record stored under `record`'s key.
    pub fn remove_record(&self, record: &T) -> Option<T> {
        self.map.remove(record.key())
    }

    /// Remove every record matching `predicate`. Returns how many were removed.
    pub fn remove_by<F: FnMut(&T) -> bool>(&self, predicate: F) -> usize {
        self.map.remove_by(predicate)
    }

    /// First record matching `predicate`, in no particular order.
    pub fn find<F: FnMut(&T) -> bool>(&self, mut predicate: F) -> Option<T> {
        self.map.values().find(|value| predicate(value))
    }

    /// Lazily yield every record matching `predicate`.
    pub fn filter<'a, F>(&'a self, mut predicate: F) -> impl Iterator<Item = T> + 'a
    where
        F: FnMut(&T) -> bool + 'a,
    {
        self.map.values().filter(move |value| predicate(value))
    }

    /// Like [`filter`](Self::filter), stopping after `limit` matches.
    pub fn filter_limit<'a, F>(&'a self, limit: usize, predicate: F) -> impl Iterator<Item = T> + 'a
    where
        F: FnMut(&T) -> bool + 'a,
    {
        self.filter(predicate).take(limit)
    }

    /// Records at positions `[start, end)` of the current iteration order.
    ///
    /// Empty when `start >= end` or `start` is past the last record.
    pub fn range(&self, start: usize, end: usize) -> impl Iterator<Item = T> + '_ {
        self.map.values().skip(start).take(end.saturating_sub(start))
    }

    /// Like [`range`](Self::range), counting only records matching `predicate`.
    pub fn range_filter<'a, F>(
        &'a self,
        start: usize,
        end: usize,
        predicate: F,
    ) -> impl Iterator<Item = T> + 'a
    where
        F: FnMut(&T) -> bool + 'a,
    {
        self.filter(predicate).skip(start).take(end.saturating_sub(start))
    }

    /// Create an exact-match index on `derive`. Existing records are not indexed.
    pub fn create_index<F>(&self, name: &str, derive: F) -> Index<T>
    where
        F: Fn(&T) -> String + Send + Sync + 'static,
    {
        Index::attach(name, Arc::clone(&self.map), derive)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metrics(&self) -> Metrics {
        Metrics {
            path: self.path.clone(),
            map: self.map.metrics(),
            flush: self.persistence.counters(),
            engine: self.persistence.engine().stats(),
        }
    }

    /// Emit the current metrics through `tracing`.
    pub fn print_metrics(&self) {
        let metrics = self.metrics();
        info!(
            target: "lodestore::flush",
            path = %metrics.path.display(),
            live = metrics.map.live,
            pending_persist = metrics.map.pending_persist,
            pending_delete = metrics.map.pending_delete,
            total_persisted = metrics.map.total_persisted,
            total_deleted = metrics.map.total_deleted,
            flush_cycles = metrics.flush.cycles,
            engine_bytes = metrics.engine.total_bytes,
            "Collection metrics"
        );
    }

    /// Run one flush cycle now. Returns how many keys were committed.
    pub fn flush_now(&self) -> StoreResult<usize> {
        self.persistence.flush_once()
    }

    /// Wait for a deferred load, stop the flusher and flush what remains.
    ///
    /// A panic on the loader or flusher thread is reported after the final
    /// flush has run.
    pub fn close(self) -> StoreResult<()> {
        let loaded = self.join_loader();
        let stopped = match self.flusher.lock().take() {
            Some(handle) => handle.shutdown(),
            None => Ok(()),
        };
        self.persistence.flush_once()?;
        loaded?;
        stopped?;
        info!(target: "lodestore::flush", path = %self.path.display(), "Collection closed");
        Ok(())
    }

    fn join_loader(&self) -> StoreResult<()> {
        match self.loader.lock().take() {
            Some(loader) => loader.join().map_err(|_| StoreError::Panicked { name: "load" }),
            None => Ok(()),
        }
    }
}

impl<T: Record> Drop for Entities<T> {
    fn drop(&mut self) {
        if let Err(err) = self.join_loader() {
            error!(
                target: "lodestore::load",
                path = %self.path.display(),
                error = %err,
                "Loader stopped abnormally"
            );
        }
        // FlushHandle's drop runs the final flush
        self.flusher.lock().take();
    }
}

impl<T: Record> fmt::Debug for Entities<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entities")
            .field("path", &self.path)
            .field("len", &self.len())
            .finish()
    }
}
