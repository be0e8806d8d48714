use std::collections::BTreeMap;

use gloam::{GloamError, KvStore, PagerOptions};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;

fn open(path: &std::path::Path) -> KvStore {
    KvStore::open(path, PagerOptions::default()).unwrap()
}

#[test]
fn empty_store_reads_nothing() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("kv.glm");
    {
        let store = open(&path);
        assert_eq!(store.read_value(b"x").unwrap(), None);
        let result = store.read_range(b"", b"\xff", 1000, 1_000_000).unwrap();
        assert!(result.rows.is_empty());
        assert!(!result.more);
        store.close().unwrap();
    }
    let store = open(&path);
    assert_eq!(store.read_value(b"x").unwrap(), None);
    assert!(store.read_range(b"", b"\xff", 1000, 1_000_000).unwrap().rows.is_empty());
}

#[test]
fn single_set_and_read_back() {
    let dir = tempdir().unwrap();
    let mut store = open(&dir.path().join("kv.glm"));
    store.set(b"k", b"v").unwrap();
    store.commit().unwrap();

    assert_eq!(store.read_value(b"k").unwrap(), Some(b"v".to_vec()));
    let result = store.read_range(b"a", b"z", 1000, 1_000_000).unwrap();
    assert_eq!(result.rows, vec![(b"k".to_vec(), b"v".to_vec())]);
    assert!(!result.more);
}

#[test]
fn uncommitted_writes_are_invisible() {
    let dir = tempdir().unwrap();
    let mut store = open(&dir.path().join("kv.glm"));
    store.set(b"k", b"v").unwrap();
    assert_eq!(store.read_value(b"k").unwrap(), None);
    store.commit().unwrap();
    assert_eq!(store.read_value(b"k").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn range_clear_splits_existing_data() {
    let dir = tempdir().unwrap();
    let mut store = open(&dir.path().join("kv.glm"));
    for (k, v) in [(b"a", b"1"), (b"b", b"2"), (b"c", b"3"), (b"d", b"4")] {
        store.set(k, v).unwrap();
    }
    store.commit().unwrap();

    store.clear(b"b", b"d").unwrap();
    store.commit().unwrap();

    let result = store.read_range(b"a", b"z", 100, 1 << 20).unwrap();
    assert_eq!(
        result.rows,
        vec![(b"a".to_vec(), b"1".to_vec()), (b"d".to_vec(), b"4".to_vec())]
    );
}

#[test]
fn set_then_clear_then_commit_reads_absent() {
    let dir = tempdir().unwrap();
    let mut store = open(&dir.path().join("kv.glm"));
    store.set(b"gone", b"soon").unwrap();
    store.commit().unwrap();
    store.clear(b"gone", b"gone\0").unwrap();
    store.commit().unwrap();
    assert_eq!(store.read_value(b"gone").unwrap(), None);
}

#[test]
fn row_limit_stops_inclusive_with_read_through() {
    let dir = tempdir().unwrap();
    let mut store = open(&dir.path().join("kv.glm"));
    for b in b'a'..=b'j' {
        store.set(&[b], b"v").unwrap();
    }
    store.commit().unwrap();

    let result = store.read_range(b"a", b"z", 3, 1 << 20).unwrap();
    let keys: Vec<&[u8]> = result.rows.iter().map(|(k, _)| k.as_slice()).collect();
    assert_eq!(keys, vec![b"a".as_ref(), b"b".as_ref(), b"c".as_ref()]);
    assert!(result.more);
    assert_eq!(result.read_through.as_deref(), Some(b"c".as_ref()));
}

#[test]
fn negative_row_limit_reads_reverse() {
    let dir = tempdir().unwrap();
    let mut store = open(&dir.path().join("kv.glm"));
    for b in b'a'..=b'j' {
        store.set(&[b], b"v").unwrap();
    }
    store.commit().unwrap();

    let result = store.read_range(b"a", b"z", -2, 1 << 20).unwrap();
    let keys: Vec<&[u8]> = result.rows.iter().map(|(k, _)| k.as_slice()).collect();
    assert_eq!(keys, vec![b"j".as_ref(), b"i".as_ref()]);
    assert!(result.more);
    assert_eq!(result.read_through.as_deref(), Some(b"i".as_ref()));
}

#[test]
fn byte_limit_includes_crossing_record() {
    let dir = tempdir().unwrap();
    let mut store = open(&dir.path().join("kv.glm"));
    for b in b'a'..=b'e' {
        store.set(&[b], &[b'x'; 10]).unwrap();
    }
    store.commit().unwrap();

    // Each row is 11 bytes; a 12-byte budget is crossed by the second row.
    let result = store.read_range(b"a", b"z", 1000, 12).unwrap();
    assert_eq!(result.rows.len(), 2);
    assert!(result.more);
    assert_eq!(result.read_through.as_deref(), Some(b"b".as_ref()));
}

#[test]
fn zero_row_limit_reads_nothing_and_bad_byte_limit_errors() {
    let dir = tempdir().unwrap();
    let mut store = open(&dir.path().join("kv.glm"));
    store.set(b"a", b"1").unwrap();
    store.commit().unwrap();

    assert!(store.read_range(b"a", b"z", 0, 100).unwrap().rows.is_empty());
    assert!(matches!(
        store.read_range(b"a", b"z", 10, 0),
        Err(GloamError::InvalidArgument(_))
    ));
}

#[test]
fn invalid_keys_are_rejected() {
    let dir = tempdir().unwrap();
    let mut store = open(&dir.path().join("kv.glm"));
    assert!(matches!(store.set(b"", b"v"), Err(GloamError::InvalidArgument(_))));
    assert!(matches!(
        store.set(&[0xff; 8], b"v"),
        Err(GloamError::InvalidArgument(_))
    ));
    assert!(matches!(store.read_value(b""), Err(GloamError::InvalidArgument(_))));
}

#[test]
fn read_value_prefix_truncates() {
    let dir = tempdir().unwrap();
    let mut store = open(&dir.path().join("kv.glm"));
    store.set(b"k", b"long-value-bytes").unwrap();
    store.commit().unwrap();

    assert_eq!(store.read_value_prefix(b"k", 4).unwrap(), Some(b"long".to_vec()));
    assert_eq!(
        store.read_value_prefix(b"k", 1000).unwrap(),
        Some(b"long-value-bytes".to_vec())
    );
    assert_eq!(store.read_value_prefix(b"missing", 4).unwrap(), None);
}

#[test]
fn overwrites_keep_latest_value() {
    let dir = tempdir().unwrap();
    let mut store = open(&dir.path().join("kv.glm"));
    for round in 0..5u32 {
        store.set(b"counter", round.to_string().as_bytes()).unwrap();
        store.commit().unwrap();
    }
    assert_eq!(store.read_value(b"counter").unwrap(), Some(b"4".to_vec()));
}

#[test]
fn large_values_span_multiple_pages() {
    let dir = tempdir().unwrap();
    let mut store = open(&dir.path().join("kv.glm"));
    let big = vec![0xabu8; 20_000];
    store.set(b"big", &big).unwrap();
    store.set(b"small", b"s").unwrap();
    store.commit().unwrap();

    assert_eq!(store.read_value(b"big").unwrap(), Some(big));
    assert_eq!(store.read_value(b"small").unwrap(), Some(b"s".to_vec()));
}

#[test]
fn large_values_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("kv.glm");
    let big = vec![0xabu8; 20_000];
    {
        let mut store = open(&path);
        store.set(b"big", &big).unwrap();
        store.commit().unwrap();
        store.close().unwrap();
    }
    let store = open(&path);
    assert_eq!(store.read_value(b"big").unwrap(), Some(big));
}

#[test]
fn many_keys_across_commits_match_reference() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("kv.glm");
    let mut store = open(&path);
    let mut reference: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

    for commit in 0..10u32 {
        for i in 0..200u32 {
            let key = format!("key-{:03}-{commit:02}", i % 150).into_bytes();
            let value = format!("value-{commit}-{i}").into_bytes();
            reference.insert(key.clone(), value.clone());
            store.set(&key, &value).unwrap();
        }
        store.commit().unwrap();
    }

    let result = store.read_range(b"", b"\xff", i32::MAX, i32::MAX).unwrap();
    let expected: Vec<(Vec<u8>, Vec<u8>)> = reference.into_iter().collect();
    assert_eq!(result.rows, expected);
}

#[test]
fn randomized_ops_match_reference_map() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("kv.glm");
    let mut store = open(&path);
    let mut reference: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
    let mut rng = ChaCha8Rng::seed_from_u64(0x670a);

    fn random_key(rng: &mut ChaCha8Rng) -> Vec<u8> {
        let len = rng.gen_range(1..=8);
        (0..len).map(|_| rng.gen_range(b'a'..=b'f')).collect()
    }

    for round in 0..30 {
        let ops = rng.gen_range(5..40);
        for _ in 0..ops {
            match rng.gen_range(0..10) {
                0..=6 => {
                    let key = random_key(&mut rng);
                    let value: Vec<u8> = (0..rng.gen_range(0..64)).map(|_| rng.gen()).collect();
                    store.set(&key, &value).unwrap();
                    reference.insert(key, value);
                }
                _ => {
                    let mut a = random_key(&mut rng);
                    let mut b = random_key(&mut rng);
                    if a > b {
                        std::mem::swap(&mut a, &mut b);
                    }
                    store.clear(&a, &b).unwrap();
                    let doomed: Vec<Vec<u8>> = reference
                        .range(a.clone()..b.clone())
                        .map(|(k, _)| k.clone())
                        .collect();
                    for key in doomed {
                        reference.remove(&key);
                    }
                }
            }
        }
        store.commit().unwrap();

        // Occasionally bounce the store to exercise recovery.
        if round % 7 == 6 {
            store.close().unwrap();
            store = open(&path);
        }

        let result = store.read_range(b"", b"\xff", i32::MAX, i32::MAX).unwrap();
        let expected: Vec<(Vec<u8>, Vec<u8>)> = reference.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        assert_eq!(result.rows, expected, "divergence after round {round}");

        // Spot-check point reads too.
        for _ in 0..10 {
            let key = random_key(&mut rng);
            assert_eq!(store.read_value(&key).unwrap(), reference.get(&key).cloned());
        }
    }
}

#[test]
fn bulk_load_then_full_clear_reclaims_storage() {
    let dir = tempdir().unwrap();
    let mut store = open(&dir.path().join("kv.glm"));
    for i in 0..1000u32 {
        store.set(format!("key-{i:05}").as_bytes(), &[b'v'; 50]).unwrap();
    }
    store.commit().unwrap();
    assert!(store.user_page_count().unwrap() > 2);

    store.clear_all_and_verify().unwrap();
    assert!(store.read_range(b"", b"\xff", 100, 1 << 20).unwrap().rows.is_empty());
}

#[test]
fn storage_bytes_accounting_is_sane() {
    let dir = tempdir().unwrap();
    let mut store = open(&dir.path().join("kv.glm"));
    for i in 0..100u32 {
        store.set(format!("key-{i}").as_bytes(), &[b'v'; 100]).unwrap();
    }
    store.commit().unwrap();

    let bytes = store.storage_bytes();
    assert!(bytes.used > 0);
    assert!(bytes.total >= bytes.free);
    assert!(bytes.available >= bytes.free);
}

#[test]
fn metrics_count_operations() {
    let dir = tempdir().unwrap();
    let mut store = open(&dir.path().join("kv.glm"));
    store.set(b"a", b"1").unwrap();
    store.set(b"b", b"2").unwrap();
    store.clear(b"b", b"c").unwrap();
    store.commit().unwrap();
    store.read_value(b"a").unwrap();
    store.read_range(b"a", b"z", 10, 1000).unwrap();

    let snapshot = store.metrics();
    assert_eq!(snapshot.sets, 2);
    assert_eq!(snapshot.clears, 1);
    assert_eq!(snapshot.gets, 1);
    assert_eq!(snapshot.range_reads, 1);
    assert_eq!(snapshot.commits, 1);
    assert!(snapshot.page_writes > 0);
}

#[test]
fn deep_common_prefixes_roundtrip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("kv.glm");
    let mut store = open(&path);
    let mut reference: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

    // Long shared prefixes exercise delta compression against both
    // ancestors and the page boundary truncation.
    for tenant in ["tenant/alpha", "tenant/alphabet", "tenant/beta"] {
        for table in ["orders", "orders_archive", "users"] {
            for row in 0..60u32 {
                let key = format!("{tenant}/{table}/{row:06}").into_bytes();
                let value = format!("{tenant}:{row}").into_bytes();
                store.set(&key, &value).unwrap();
                reference.insert(key, value);
            }
        }
    }
    store.commit().unwrap();

    let result = store.read_range(b"", b"\xff", i32::MAX, i32::MAX).unwrap();
    let expected: Vec<(Vec<u8>, Vec<u8>)> = reference.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    assert_eq!(result.rows, expected);

    // A mid-prefix clear removes exactly one table of one tenant.
    store.clear(b"tenant/alpha/orders/", b"tenant/alpha/orders0").unwrap();
    store.commit().unwrap();
    let doomed: Vec<Vec<u8>> = reference
        .range(b"tenant/alpha/orders/".to_vec()..b"tenant/alpha/orders0".to_vec())
        .map(|(k, _)| k.clone())
        .collect();
    assert_eq!(doomed.len(), 60);
    for key in doomed {
        reference.remove(&key);
    }
    let result = store.read_range(b"", b"\xff", i32::MAX, i32::MAX).unwrap();
    assert_eq!(result.rows.len(), reference.len());

    // Survives a reopen.
    store.close().unwrap();
    let store = open(&path);
    assert_eq!(
        store.read_value(b"tenant/alphabet/users/000059").unwrap(),
        Some(b"tenant/alphabet:59".to_vec())
    );
    assert_eq!(store.read_value(b"tenant/alpha/orders/000000").unwrap(), None);
}

#[test]
fn keys_near_the_maximum_key_work() {
    let dir = tempdir().unwrap();
    let mut store = open(&dir.path().join("kv.glm"));
    let high_a = vec![0xfe, 0xff, 0xff];
    let high_b = vec![0xff, 0x00];
    store.set(&high_a, b"a").unwrap();
    store.set(&high_b, b"b").unwrap();
    store.set(b"low", b"c").unwrap();
    store.commit().unwrap();

    assert_eq!(store.read_value(&high_a).unwrap(), Some(b"a".to_vec()));
    assert_eq!(store.read_value(&high_b).unwrap(), Some(b"b".to_vec()));

    // A reverse scan over the whole keyspace sees the highest key first.
    let result = store
        .read_range(b"", &[0xff, 0xff, 0xff, 0xff, 0xff], -3, 1 << 20)
        .unwrap();
    let keys: Vec<&[u8]> = result.rows.iter().map(|(k, _)| k.as_slice()).collect();
    assert_eq!(keys, vec![high_b.as_slice(), high_a.as_slice(), b"low".as_ref()]);
}

#[test]
fn alternating_clears_and_rewrites_converge() {
    let dir = tempdir().unwrap();
    let mut store = open(&dir.path().join("kv.glm"));
    for round in 0..8u32 {
        for i in 0..150u32 {
            store.set(format!("key-{i:04}").as_bytes(), format!("r{round}").as_bytes()).unwrap();
        }
        store.commit().unwrap();
        // Clear a sliding window so subtrees repeatedly shrink and regrow.
        let begin = format!("key-{:04}", round * 15);
        let end = format!("key-{:04}", round * 15 + 30);
        store.clear(begin.as_bytes(), end.as_bytes()).unwrap();
        store.commit().unwrap();
    }

    let result = store.read_range(b"", b"\xff", i32::MAX, i32::MAX).unwrap();
    // The final window [105, 135) is cleared; everything else holds r7.
    assert_eq!(result.rows.len(), 120);
    for (key, value) in &result.rows {
        let idx: u32 = String::from_utf8_lossy(&key[4..]).parse().unwrap();
        assert!(!(105..135).contains(&idx), "key {idx} should be cleared");
        assert_eq!(value, b"r7");
    }
}

#[test]
fn dispose_removes_the_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("kv.glm");
    let mut store = open(&path);
    store.set(b"k", b"v").unwrap();
    store.commit().unwrap();
    assert!(path.exists());
    store.dispose().unwrap();
    assert!(!path.exists());
}
