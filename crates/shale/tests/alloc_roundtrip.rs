//! Allocate/deallocate round trip through checkpoint and restart
//! (storage-manager surface over the allocation cache).

use shale::{ShaleOptions, StorageManager};
use tempfile::TempDir;

#[test]
fn allocate_deallocate_survive_restart() {
    let dir = TempDir::new().unwrap();
    StorageManager::format(dir.path()).unwrap();
    let store;
    let pids: Vec<u32>;
    {
        let sm = StorageManager::open(dir.path(), ShaleOptions::default()).unwrap();
        store = sm.create_store().unwrap();

        pids = (0..50)
            .map(|_| sm.alloc_cache().allocate(store).unwrap())
            .collect();
        for pid in pids.iter().step_by(2) {
            sm.alloc_cache().deallocate(*pid).unwrap();
        }
        // Checkpoint hardens the bitmap pages and truncates the log, so
        // the restart below must reload purely from the bitmap images.
        sm.checkpoint_now().unwrap();
        sm.shutdown().unwrap();
    }

    let sm = StorageManager::open(dir.path(), ShaleOptions::default()).unwrap();
    let alloc = sm.alloc_cache();

    let max_allocated = *pids.iter().max().unwrap();
    assert_eq!(alloc.last_allocated_pid(store), max_allocated);
    for (i, pid) in pids.iter().enumerate() {
        let expect_live = i % 2 == 1;
        assert_eq!(
            alloc.is_allocated(*pid).unwrap(),
            expect_live,
            "pid {pid} (index {i})"
        );
    }
    sm.shutdown().unwrap();
}

#[test]
fn allocations_replay_from_log_without_checkpoint() {
    let dir = TempDir::new().unwrap();
    StorageManager::format(dir.path()).unwrap();
    let store;
    let pids: Vec<u32>;
    {
        let sm = StorageManager::open(dir.path(), ShaleOptions::default()).unwrap();
        store = sm.create_store().unwrap();
        pids = (0..20)
            .map(|_| sm.alloc_cache().allocate(store).unwrap())
            .collect();
        sm.alloc_cache().deallocate(pids[3]).unwrap();
        sm.alloc_cache().deallocate(pids[7]).unwrap();
        // Crash without writing the bitmap pages: the allocation state
        // exists only in the log.
        sm.simulate_crash().unwrap();
    }

    let sm = StorageManager::open(dir.path(), ShaleOptions::default()).unwrap();
    let alloc = sm.alloc_cache();
    for (i, pid) in pids.iter().enumerate() {
        let expect_live = i != 3 && i != 7;
        assert_eq!(alloc.is_allocated(*pid).unwrap(), expect_live, "pid {pid}");
    }
    assert_eq!(alloc.last_allocated_pid(store), *pids.last().unwrap());
    sm.shutdown().unwrap();
}
