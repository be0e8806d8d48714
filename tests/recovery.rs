use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use gloam::{BlockFile, GloamError, KvStore, PagerOptions, Result, StdBlockFile};
use tempfile::tempdir;

fn open(path: &Path) -> KvStore {
    KvStore::open(path, PagerOptions::default()).unwrap()
}

#[test]
fn reopen_returns_identical_results() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("kv.glm");
    let expected = {
        let mut store = open(&path);
        for commit in 0..5u32 {
            for i in 0..120u32 {
                let key = format!("key-{i:04}").into_bytes();
                let value = format!("value-{commit}-{i}").into_bytes();
                store.set(&key, &value).unwrap();
            }
            store.clear(b"key-0100", b"key-0110").unwrap();
            store.commit().unwrap();
        }
        let rows = store.read_range(b"", b"\xff", i32::MAX, i32::MAX).unwrap().rows;
        store.close().unwrap();
        rows
    };

    let store = open(&path);
    let result = store.read_range(b"", b"\xff", i32::MAX, i32::MAX).unwrap();
    assert_eq!(result.rows, expected);
    for (k, v) in expected.iter().take(20) {
        assert_eq!(store.read_value(k).unwrap(), Some(v.clone()));
    }
}

#[test]
fn corrupted_primary_header_promotes_backup() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("kv.glm");
    {
        let mut store = open(&path);
        store.set(b"stable", b"yes").unwrap();
        store.commit().unwrap();
        // One more commit so the backup header reflects the state above.
        store.set(b"extra", b"maybe").unwrap();
        store.commit().unwrap();
        store.close().unwrap();
    }

    // Damage the primary header page.
    {
        let mut file = std::fs::OpenOptions::new().read(true).write(true).open(&path).unwrap();
        let mut byte = [0u8; 1];
        file.seek(SeekFrom::Start(200)).unwrap();
        file.read_exact(&mut byte).unwrap();
        byte[0] ^= 0xff;
        file.seek(SeekFrom::Start(200)).unwrap();
        file.write_all(&byte).unwrap();
        file.sync_all().unwrap();
    }

    // Recovery falls back to the backup: the state before the last commit.
    let mut store = open(&path);
    assert_eq!(store.read_value(b"stable").unwrap(), Some(b"yes".to_vec()));
    assert_eq!(store.read_value(b"extra").unwrap(), None);

    // The store is fully usable after promotion.
    store.set(b"after", b"recovery").unwrap();
    store.commit().unwrap();
    assert_eq!(store.read_value(b"after").unwrap(), Some(b"recovery".to_vec()));
}

#[test]
fn both_headers_corrupt_is_fatal_at_open() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("kv.glm");
    {
        let mut store = open(&path);
        store.set(b"k", b"v").unwrap();
        store.commit().unwrap();
        store.close().unwrap();
    }
    {
        let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        // Zero both header pages.
        file.write_all(&[0u8; 8192]).unwrap();
        file.sync_all().unwrap();
    }
    match KvStore::open(&path, PagerOptions::default()) {
        Err(GloamError::Corruption(_)) => {}
        other => panic!("expected corruption error, got {other:?}"),
    }
}

/// Wraps the real file and, once armed, rejects writes to the primary
/// header page. This models a process kill after a commit's data pages are
/// written but before the new header becomes durable.
struct HeaderCrashFile {
    inner: StdBlockFile,
    crashed: AtomicBool,
}

impl HeaderCrashFile {
    fn arm(&self) {
        self.crashed.store(true, Ordering::SeqCst);
    }
}

impl BlockFile for HeaderCrashFile {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        self.inner.read_at(off, dst)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        if off == 0 && self.crashed.load(Ordering::SeqCst) {
            return Err(GloamError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "simulated crash before header write",
            )));
        }
        self.inner.write_at(off, src)
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }

    fn len(&self) -> Result<u64> {
        self.inner.len()
    }
}

#[test]
fn interrupted_commit_preserves_previous_state() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("kv.glm");
    let crash_file = Arc::new(HeaderCrashFile {
        inner: StdBlockFile::open(&path).unwrap(),
        crashed: AtomicBool::new(false),
    });

    {
        let mut store = KvStore::open_with_file(
            crash_file.clone(),
            Some(path.clone()),
            PagerOptions::default(),
        )
        .unwrap();
        store.set(b"k", b"1").unwrap();
        store.commit().unwrap();

        // Second commit: data pages are written, the header never lands.
        store.set(b"k", b"2").unwrap();
        crash_file.arm();
        let err = store.commit().unwrap_err();
        assert!(err.is_fatal());

        // The failure is latched; later operations fail fast, close is safe.
        assert!(store.last_error().is_some());
        assert!(store.read_value(b"k").is_err());
        store.close().unwrap();
    }
    drop(crash_file);

    // Recovery proceeds from the last durable commit.
    let store = open(&path);
    assert_eq!(store.read_value(b"k").unwrap(), Some(b"1".to_vec()));
}

#[test]
fn interrupted_commit_on_larger_tree_keeps_old_data_readable() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("kv.glm");
    let crash_file = Arc::new(HeaderCrashFile {
        inner: StdBlockFile::open(&path).unwrap(),
        crashed: AtomicBool::new(false),
    });

    let expected = {
        let mut store = KvStore::open_with_file(
            crash_file.clone(),
            Some(path.clone()),
            PagerOptions::default(),
        )
        .unwrap();
        for i in 0..300u32 {
            store.set(format!("key-{i:04}").as_bytes(), format!("v{i}").as_bytes()).unwrap();
        }
        store.commit().unwrap();
        let rows = store.read_range(b"", b"\xff", i32::MAX, i32::MAX).unwrap().rows;

        // A sweeping rewrite that never becomes durable.
        for i in 0..300u32 {
            store.set(format!("key-{i:04}").as_bytes(), b"overwritten").unwrap();
        }
        store.clear(b"key-0100", b"key-0200").unwrap();
        crash_file.arm();
        assert!(store.commit().is_err());
        store.close().unwrap();
        rows
    };
    drop(crash_file);

    let store = open(&path);
    let result = store.read_range(b"", b"\xff", i32::MAX, i32::MAX).unwrap();
    assert_eq!(result.rows, expected);
}

#[test]
fn maintenance_after_reopen_reclaims_remapped_pages() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("kv.glm");
    {
        let mut store = open(&path);
        for round in 0..6u32 {
            for i in 0..100u32 {
                store.set(format!("key-{i:03}").as_bytes(), format!("round-{round}").as_bytes()).unwrap();
            }
            store.commit().unwrap();
        }
        store.close().unwrap();
    }
    let mut store = open(&path);
    store.run_maintenance().unwrap();
    // Another write cycle works after maintenance.
    store.set(b"post", b"maintenance").unwrap();
    store.commit().unwrap();
    assert_eq!(store.read_value(b"post").unwrap(), Some(b"maintenance".to_vec()));
    assert_eq!(store.read_value(b"key-050").unwrap(), Some(b"round-5".to_vec()));
}
