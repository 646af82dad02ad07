//! Split-under-load and cursor behavior at the storage-manager surface.

use shale::{ShaleOptions, StorageManager};
use tempfile::TempDir;

fn fresh() -> (TempDir, StorageManager) {
    let dir = TempDir::new().unwrap();
    StorageManager::format(dir.path()).unwrap();
    let sm = StorageManager::open(dir.path(), ShaleOptions::default()).unwrap();
    (dir, sm)
}

fn key(i: u32) -> Vec<u8> {
    format!("key{i:08}").into_bytes()
}

#[test]
fn ten_thousand_ascending_inserts_build_a_tree() {
    let (_dir, sm) = fresh();
    let store = sm.create_store().unwrap();

    const N: u32 = 10_000;
    let mut txn = sm.begin();
    for i in 0..N {
        sm.insert(&mut txn, store, &key(i), b"value").unwrap();
    }
    sm.commit(txn).unwrap();

    // Full cursor scan: every key, strictly increasing, each exactly
    // once.
    let txn = sm.begin();
    let mut cursor = sm
        .cursor(&txn, store, (Vec::new(), true), None, true)
        .unwrap();
    let mut count = 0u32;
    let mut last: Option<Vec<u8>> = None;
    while cursor.next().unwrap() {
        if let Some(prev) = &last {
            assert!(cursor.key() > prev.as_slice());
        }
        assert_eq!(cursor.key(), key(count).as_slice());
        last = Some(cursor.key().to_vec());
        count += 1;
    }
    assert_eq!(count, N);
    sm.commit(txn).unwrap();

    // The root must be interior and every fence invariant must hold.
    let stats = sm.verify_store(store).unwrap();
    assert_eq!(stats.records - stats.ghosts, N as usize);
    assert!(stats.root_level >= 1, "root level {}", stats.root_level);
    sm.shutdown().unwrap();
}

#[test]
fn range_cursor_after_splits() {
    let (_dir, sm) = fresh();
    let store = sm.create_store().unwrap();
    let mut txn = sm.begin();
    for i in 0..3_000u32 {
        sm.insert(&mut txn, store, &key(i), &i.to_be_bytes()).unwrap();
    }
    sm.commit(txn).unwrap();

    let txn = sm.begin();
    let mut cursor = sm
        .cursor(
            &txn,
            store,
            (key(1_000), true),
            Some((key(1_999), true)),
            true,
        )
        .unwrap();
    let mut seen = 0u32;
    while cursor.next().unwrap() {
        assert_eq!(cursor.key(), key(1_000 + seen).as_slice());
        seen += 1;
    }
    assert_eq!(seen, 1_000);

    // Backward over the same range.
    let mut cursor = sm
        .cursor(
            &txn,
            store,
            (key(1_000), true),
            Some((key(1_999), true)),
            false,
        )
        .unwrap();
    let mut seen = 0u32;
    while cursor.next().unwrap() {
        assert_eq!(cursor.key(), key(1_999 - seen).as_slice());
        seen += 1;
    }
    assert_eq!(seen, 1_000);
    sm.commit(txn).unwrap();
    sm.shutdown().unwrap();
}

#[test]
fn big_tree_survives_crash() {
    let dir = TempDir::new().unwrap();
    StorageManager::format(dir.path()).unwrap();
    let store;
    {
        let sm = StorageManager::open(dir.path(), ShaleOptions::default()).unwrap();
        store = sm.create_store().unwrap();
        let mut txn = sm.begin();
        for i in 0..4_000u32 {
            sm.insert(&mut txn, store, &key(i), b"persist").unwrap();
        }
        sm.commit(txn).unwrap();
        sm.simulate_crash().unwrap();
    }
    let sm = StorageManager::open(dir.path(), ShaleOptions::default()).unwrap();
    let stats = sm.verify_store(store).unwrap();
    assert_eq!(stats.records - stats.ghosts, 4_000);
    let txn = sm.begin();
    assert_eq!(
        sm.lookup(&txn, store, &key(3_999)).unwrap(),
        Some(b"persist".to_vec())
    );
    sm.commit(txn).unwrap();
    sm.shutdown().unwrap();
}

#[test]
fn wal_rule_holds_at_commit() {
    let (_dir, sm) = fresh();
    let store = sm.create_store().unwrap();
    let mut txn = sm.begin();
    sm.insert(&mut txn, store, b"wal", b"rule").unwrap();
    let before = sm.durable_lsn();
    sm.commit(txn).unwrap();
    // Commit waits for its record to be durable.
    assert!(sm.durable_lsn() > before);
    sm.shutdown().unwrap();
}
