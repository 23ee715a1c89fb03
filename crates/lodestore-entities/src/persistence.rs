//! Persistence: write-behind flushing and startup loading
//!
//! The flusher runs on its own named thread. Each cycle:
//! 1. snapshot up to `max_flush_batch` pending keys with their write stamps
//! 2. stage a put of the current JSON value, or a delete, per key
//! 3. commit the batch as one engine transaction
//! 4. only then clear each key whose stamp is unchanged
//!
//! A failed commit is never retried. It goes to the fatal handler, because
//! the writes it carried were already acknowledged to callers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use lodestore_core::Engine;
use parking_lot::{Condvar, Mutex};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::error::{FatalHandler, StoreError, StoreResult};
use crate::tracked::TrackedMap;

/// Cumulative flusher counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushCounters {
    pub cycles: u64,
    /// Cycles that committed a non-empty batch
    pub batches: u64,
    pub records: u64,
}

#[derive(Default)]
struct FlushStats {
    cycles: AtomicU64,
    batches: AtomicU64,
    records: AtomicU64,
}

/// Moves records between a [`TrackedMap`] and its engine.
pub struct Persistence<T> {
    engine: Arc<Engine>,
    map: Arc<TrackedMap<T>>,
    max_batch: usize,
    stats: FlushStats,
    /// One flush at a time, so an older value can never commit after a newer one
    flush_lock: Mutex<()>,
}

impl<T> Persistence<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(engine: Arc<Engine>, map: Arc<TrackedMap<T>>, max_batch: usize) -> Self {
        Self {
            engine,
            map,
            max_batch,
            stats: FlushStats::default(),
            flush_lock: Mutex::new(()),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Run one flush cycle. Returns how many keys were committed.
    pub fn flush_once(&self) -> StoreResult<usize> {
        let _flushing = self.flush_lock.lock();
        self.stats.cycles.fetch_add(1, Ordering::Relaxed);

        let batch = self.map.pending_batch(self.max_batch);
        if batch.is_empty() {
            return Ok(0);
        }

        let started = Instant::now();
        let mut txn = self.engine.begin_write();
        let mut puts = 0usize;
        for pending in &batch {
            // a key removed after the snapshot is written as a delete
            let value = if pending.delete { None } else { self.map.get(&pending.key) };
            match value {
                Some(value) => {
                    let bytes = serde_json::to_vec(&value).map_err(|source| StoreError::Encode {
                        key: pending.key.clone(),
                        source,
                    })?;
                    txn.put(pending.key.as_bytes(), &bytes)?;
                    puts += 1;
                }
                None => txn.delete(pending.key.as_bytes())?,
            }
        }
        let commit = txn.commit()?;

        let cleared = batch
            .iter()
            .filter(|pending| self.map.mark_flushed(&pending.key, pending.stamp))
            .count();

        self.stats.batches.fetch_add(1, Ordering::Relaxed);
        self.stats.records.fetch_add(batch.len() as u64, Ordering::Relaxed);
        debug!(
            target: "lodestore::flush",
            sequence = commit.sequence,
            puts,
            deletes = batch.len() - puts,
            still_dirty = batch.len() - cleared,
            bytes = commit.bytes,
            elapsed_us = started.elapsed().as_micros() as u64,
            "Flushed batch"
        );

        if let Some(result) = self.engine.maybe_compact()? {
            debug!(
                target: "lodestore::flush",
                bytes_saved = result.bytes_saved(),
                "Compacted after flush"
            );
        }
        Ok(batch.len())
    }

    /// Replay every stored record into the map in chunks. Returns the record count.
    ///
    /// A value that does not decode aborts the load: skipping it would make
    /// the record look deleted, and the next write to that key would erase it.
    ///
    /// Each chunk is pulled and applied under the flush lock. A flush that
    /// commits a key either lands before the scan checks that key, which then
    /// skips the old copy, or after `load_many` has applied it.
    pub fn load(&self, chunk_size: usize) -> StoreResult<usize> {
        let started = Instant::now();
        let mut loaded = 0usize;
        let mut scan = self.engine.scan(chunk_size);

        for chunk_index in 0usize.. {
            let flushing = self.flush_lock.lock();
            let Some(chunk) = scan.next() else {
                break;
            };
            let records = decode_chunk::<T>(chunk?)?;
            loaded += records.len();
            let applied = self.map.load_many(records);
            drop(flushing);
            debug!(
                target: "lodestore::load",
                chunk = chunk_index,
                applied,
                loaded,
                "Loaded chunk"
            );
        }

        info!(
            target: "lodestore::load",
            path = %self.engine.path().display(),
            records = loaded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Load complete"
        );
        Ok(loaded)
    }

    pub fn counters(&self) -> FlushCounters {
        FlushCounters {
            cycles: self.stats.cycles.load(Ordering::Relaxed),
            batches: self.stats.batches.load(Ordering::Relaxed),
            records: self.stats.records.load(Ordering::Relaxed),
        }
    }
}

fn decode_chunk<T>(chunk: Vec<(Vec<u8>, Vec<u8>)>) -> StoreResult<Vec<(String, T)>>
where
    T: DeserializeOwned,
{
    chunk
        .into_iter()
        .map(|(key, value)| {
            let key = String::from_utf8_lossy(&key).into_owned();
            match serde_json::from_slice(&value) {
                Ok(record) => Ok((key, record)),
                Err(source) => Err(StoreError::Decode { key, source }),
            }
        })
        .collect()
}

struct Signal {
    stop: Mutex<bool>,
    wake: Condvar,
}

/// Handle to a running flusher thread.
///
/// `shutdown` or drop wakes the thread, lets it run a final flush and joins it.
pub struct FlushHandle {
    signal: Arc<Signal>,
    thread: Option<thread::JoinHandle<()>>,
}

impl FlushHandle {
    /// Start flushing `persistence` every `interval`.
    pub fn start<T>(
        persistence: Arc<Persistence<T>>,
        interval: Duration,
        fatal: FatalHandler,
    ) -> StoreResult<Self>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let signal = Arc::new(Signal {
            stop: Mutex::new(false),
            wake: Condvar::new(),
        });
        let thread_signal = Arc::clone(&signal);

        let thread = thread::Builder::new()
            .name("lodestore-flush".to_string())
            .spawn(move || flush_loop(&persistence, interval, &thread_signal, &fatal))
            .map_err(|source| StoreError::Spawn {
                name: "flush",
                source,
            })?;

        Ok(Self {
            signal,
            thread: Some(thread),
        })
    }

    /// Request a final flush and wait for the thread to finish.
    ///
    /// Fails if the flusher thread panicked.
    pub fn shutdown(mut self) -> StoreResult<()> {
        self.stop()
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |h| !h.is_finished())
    }

    fn stop(&mut self) -> StoreResult<()> {
        *self.signal.stop.lock() = true;
        self.signal.wake.notify_all();
        match self.thread.take() {
            Some(handle) => handle.join().map_err(|_| StoreError::Panicked { name: "flush" }),
            None => Ok(()),
        }
    }
}

impl Drop for FlushHandle {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            error!(target: "lodestore::flush", error = %err, "Flusher stopped abnormally");
        }
    }
}

fn flush_loop<T>(
    persistence: &Persistence<T>,
    interval: Duration,
    signal: &Signal,
    fatal: &FatalHandler,
) where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    loop {
        let stopping = {
            let mut stop = signal.stop.lock();
            if !*stop {
                signal.wake.wait_for(&mut stop, interval);
            }
            *stop
        };

        if let Err(err) = persistence.flush_once() {
            fatal(&err);
            return;
        }
        if stopping {
            return;
        }
    }
}
