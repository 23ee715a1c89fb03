//! Integration tests: engine durability across reopen, crashes and compaction.

use std::sync::Arc;
use std::thread;

use lodestore_core::{Engine, EngineConfig, EngineError};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn open(dir: &TempDir) -> Engine {
    Engine::open(dir.path(), EngineConfig::for_testing()).unwrap()
}

fn segment_files(dir: &TempDir) -> Vec<std::path::PathBuf> {
    let mut files: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map_or(false, |ext| ext == "lode"))
        .collect();
    files.sort();
    files
}

// ---------------------------------------------------------------------------
// Durability
// ---------------------------------------------------------------------------

#[test]
fn test_batches_survive_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let engine = open(&dir);
        for batch in 0..10 {
            let mut txn = engine.begin_write();
            for i in 0..50 {
                let key = format!("b{}:k{}", batch, i);
                txn.put(key.as_bytes(), format!("value-{}", i).as_bytes()).unwrap();
            }
            txn.commit().unwrap();
        }
    }

    let engine = open(&dir);
    assert_eq!(engine.len(), 500);
    assert_eq!(engine.get(b"b9:k49").unwrap(), Some(b"value-49".to_vec()));
}

#[test]
fn test_interrupted_append_loses_only_that_batch() {
    let dir = TempDir::new().unwrap();
    {
        let engine = open(&dir);
        let mut txn = engine.begin_write();
        txn.put(b"stable", b"1").unwrap();
        txn.commit().unwrap();

        let mut txn = engine.begin_write();
        for i in 0..20 {
            txn.put(format!("partial{}", i).as_bytes(), b"x").unwrap();
        }
        txn.commit().unwrap();
    }

    // simulate a crash in the middle of the second frame
    let newest = segment_files(&dir).pop().unwrap();
    let len = std::fs::metadata(&newest).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(&newest).unwrap();
    file.set_len(len - 10).unwrap();
    drop(file);

    let engine = open(&dir);
    assert_eq!(engine.len(), 1);
    assert_eq!(engine.get(b"stable").unwrap(), Some(b"1".to_vec()));
    for i in 0..20 {
        assert!(!engine.contains_key(format!("partial{}", i).as_bytes()));
    }
}

#[test]
fn test_damage_in_sealed_segment_is_fatal() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig::for_testing().with_segment_size(4096);
    {
        let engine = Engine::open(dir.path(), config.clone()).unwrap();
        for i in 0..40 {
            let mut txn = engine.begin_write();
            txn.put(format!("k{}", i).as_bytes(), &[7u8; 300]).unwrap();
            txn.commit().unwrap();
        }
    }

    let files = segment_files(&dir);
    assert!(files.len() > 1);
    // cut the oldest segment short: a torn frame there cannot be an interrupted append
    let oldest = &files[0];
    let len = std::fs::metadata(oldest).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(oldest).unwrap();
    file.set_len(len - 5).unwrap();
    drop(file);

    match Engine::open(dir.path(), config) {
        Err(e @ EngineError::Corrupted { .. }) => assert!(e.is_corruption()),
        other => panic!("expected corruption, got {:?}", other.map(|e| e.len())),
    }
}

#[test]
fn test_invalid_config_rejected() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig::for_testing().with_segment_size(16);
    assert!(matches!(
        Engine::open(dir.path(), config),
        Err(EngineError::InvalidConfig(_))
    ));
}

// ---------------------------------------------------------------------------
// Compaction
// ---------------------------------------------------------------------------

#[test]
fn test_compaction_then_crash_recovery() {
    let dir = TempDir::new().unwrap();
    {
        let engine = open(&dir);
        for round in 0..20 {
            let mut txn = engine.begin_write();
            for i in 0..10 {
                txn.put(format!("k{}", i).as_bytes(), format!("r{}", round).as_bytes()).unwrap();
            }
            if round == 5 {
                txn.delete(b"k0").unwrap();
            }
            txn.commit().unwrap();
        }
        let mut txn = engine.begin_write();
        txn.delete(b"k1").unwrap();
        txn.commit().unwrap();

        let result = engine.compact().unwrap();
        assert_eq!(result.live_entries, 9);
        assert!(result.bytes_saved() > 0);
    }

    let engine = open(&dir);
    assert_eq!(engine.len(), 9);
    assert_eq!(engine.get(b"k0").unwrap(), Some(b"r19".to_vec()));
    assert!(!engine.contains_key(b"k1"));
    assert_eq!(engine.get(b"k9").unwrap(), Some(b"r19".to_vec()));
}

#[test]
fn test_readers_during_compaction() {
    let dir = TempDir::new().unwrap();
    let engine = Arc::new(open(&dir));
    for round in 0..5 {
        let mut txn = engine.begin_write();
        for i in 0..100 {
            txn.put(format!("k{}", i).as_bytes(), format!("v{}", round).as_bytes()).unwrap();
        }
        txn.commit().unwrap();
    }

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for _ in 0..50 {
                    for i in (0..100).step_by(7) {
                        let value = engine.get(format!("k{}", i).as_bytes()).unwrap();
                        assert_eq!(value, Some(b"v4".to_vec()));
                    }
                }
            })
        })
        .collect();

    engine.compact().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(engine.len(), 100);
}

#[test]
fn test_scan_after_reopen_matches_gets() {
    let dir = TempDir::new().unwrap();
    {
        let engine = open(&dir);
        let mut txn = engine.begin_write();
        for i in 0..300 {
            txn.put(format!("key{:03}", i).as_bytes(), format!("{}", i * 2).as_bytes()).unwrap();
        }
        txn.commit().unwrap();
    }

    let engine = open(&dir);
    let mut seen = 0;
    for chunk in engine.scan(64) {
        let chunk = chunk.unwrap();
        assert!(chunk.len() <= 64);
        for (key, value) in chunk {
            assert_eq!(engine.get(&key).unwrap(), Some(value));
            seen += 1;
        }
    }
    assert_eq!(seen, 300);
}
