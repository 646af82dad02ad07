//! The evictioner: a background worker that turns unpinned frames back
//! into free blocks.
//!
//! The clock hand scans control blocks for `used && pin == 0`, tries the
//! frame latch without blocking, cleans the page if dirty, logs the
//! page's departure, clears the mapping, and pushes the frame. Grabbers
//! blocked in `grab_free_block` are woken by the push.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use shale_error::Result;
use shale_types::{page, Lsn};
use shale_wal::{LogPayload, LogRecord};
use tracing::{debug, trace, warn};

use crate::pool::BufferPool;

/// Handle to the evictioner worker thread.
pub struct Evictioner {
    shutdown: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl Evictioner {
    /// Start the worker.
    #[must_use]
    pub fn spawn(pool: Arc<BufferPool>) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handle = std::thread::Builder::new()
            .name("shale-evictioner".into())
            .spawn(move || {
                let hand = AtomicUsize::new(0);
                debug!("evictioner started");
                while !flag.load(Ordering::Acquire) {
                    pool.wait_for_evict_wakeup(Duration::from_millis(100));
                    if flag.load(Ordering::Acquire) {
                        break;
                    }
                    if let Err(e) = evict_pass(&pool, &hand) {
                        warn!(error = %e, "eviction pass failed");
                    }
                }
                debug!("evictioner exiting");
            })
            .unwrap_or_else(|e| panic!("spawning evictioner: {e}"));
        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    /// Stop the worker.
    pub fn shutdown(mut self, pool: &BufferPool) {
        self.shutdown.store(true, Ordering::Release);
        pool.wake_evictioner();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// One eviction sweep: free up to `evict_batch` frames.
fn evict_pass(pool: &BufferPool, hand: &AtomicUsize) -> Result<()> {
    let n = pool.nframes();
    let batch = pool.config().evict_batch;
    let mut freed = 0usize;

    for _ in 0..n {
        if freed >= batch {
            break;
        }
        let idx = hand.fetch_add(1, Ordering::Relaxed) % n;
        let cb = pool.cb(idx);
        if !cb.used.load(Ordering::Acquire) || cb.pin_count.load(Ordering::Acquire) != 0 {
            continue;
        }
        let Some(frame) = pool.try_latch_ex(idx) else {
            continue;
        };
        // Re-check under the latch; a fixer may have pinned while we
        // were acquiring it.
        if !cb.used.load(Ordering::Acquire) || cb.pin_count.load(Ordering::Acquire) != 0 {
            continue;
        }
        let pid = cb.pid.load(Ordering::Acquire);
        let page_lsn = page::page_lsn(frame.as_bytes());

        if cb.dirty.load(Ordering::Acquire) {
            // Page write failures leave the frame dirty for a later try.
            if let Err(e) = pool.write_frame_image(pid, &frame) {
                warn!(pid, error = %e, "evict write-back failed; keeping frame");
                continue;
            }
            cb.dirty.store(false, Ordering::Release);
            cb.rec_lsn.store(Lsn::NULL.to_raw(), Ordering::Release);
        }

        pool.log().insert(&LogRecord::system(
            0,
            pid,
            LogPayload::PageEvict { page_lsn },
        ))?;

        pool.retire_frame(idx, pid);
        drop(frame);
        freed += 1;
        trace!(pid, idx, "frame evicted");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{BufPoolConfig, LatchMode};
    use shale_types::page::PAGE_SIZE;
    use shale_types::{PageHeader, PageType};
    use shale_volume::Volume;
    use shale_wal::{LogConfig, LogManager};
    use tempfile::TempDir;

    fn setup(nframes: usize) -> (TempDir, Arc<BufferPool>) {
        let dir = TempDir::new().unwrap();
        let volume = Arc::new(Volume::create(dir.path().join("vol")).unwrap());
        let log = LogManager::open(dir.path().join("log"), LogConfig::default()).unwrap();
        let pool = BufferPool::new(
            BufPoolConfig {
                nframes,
                evict_batch: 8,
            },
            volume,
            log,
        );
        (dir, pool)
    }

    fn format_page(pool: &BufferPool, pid: u32, lsn: Lsn) {
        let mut g = pool.fix_virgin(pid, false).unwrap();
        PageHeader {
            pid,
            lsn: Lsn::NULL,
            page_type: PageType::Btree,
            level: 0,
            flags: 0,
            store: 1,
            checksum: 0,
            fence_low_off: 0,
            fence_high_off: 0,
            foster_off: 0,
            nrecs: 0,
            record_area_end: PAGE_SIZE as u16,
            pid0_off: 0,
        }
        .write_to(g.page_mut().as_bytes_mut());
        g.set_lsn(lsn);
    }

    #[test]
    fn eviction_frees_unpinned_frames_and_persists_dirty_pages() {
        let (_dir, pool) = setup(8);
        for pid in 10..18 {
            format_page(&pool, pid, Lsn::new(1, 64 * pid));
        }
        assert_eq!(pool.used_frames(), 8);

        let hand = AtomicUsize::new(0);
        evict_pass(&pool, &hand).unwrap();
        assert!(pool.used_frames() <= 8 - pool.config().evict_batch.min(8));

        // Evicted dirty pages must be readable back from the volume.
        let g = pool.fix(10, LatchMode::Sh, false).unwrap();
        assert_eq!(g.pid(), 10);
        assert_eq!(g.lsn(), Lsn::new(1, 640));
    }

    #[test]
    fn pinned_frames_are_skipped() {
        let (_dir, pool) = setup(8);
        format_page(&pool, 42, Lsn::new(1, 8));
        let guard = pool.fix(42, LatchMode::Sh, false).unwrap();

        let hand = AtomicUsize::new(0);
        evict_pass(&pool, &hand).unwrap();
        assert_eq!(pool.used_frames(), 1);
        drop(guard);

        evict_pass(&pool, &hand).unwrap();
        assert_eq!(pool.used_frames(), 0);
    }

    #[test]
    fn worker_wakes_blocked_grabbers() {
        let (_dir, pool) = setup(8);
        for pid in 0..8u32 {
            format_page(&pool, pid + 100, Lsn::new(1, 8 * (pid + 1)));
        }
        let evictioner = Evictioner::spawn(Arc::clone(&pool));

        // All frames used, none pinned: fixing a ninth page must block
        // until the evictioner frees a frame, then succeed.
        let g = pool.fix_virgin(200, true);
        assert!(g.is_ok());
        drop(g);
        evictioner.shutdown(&pool);
    }
}
