//! The frame table, hash, free-list protocol, and latch guards.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use shale_error::{Result, ShaleError};
use shale_types::{page, Lsn, PageBuf, PageId};
use shale_volume::Volume;
use shale_wal::LogManager;
use tracing::{debug, trace};

/// No frame: free-list terminator.
const NIL: usize = usize::MAX;

/// Buffer-pool tunables.
#[derive(Debug, Clone)]
pub struct BufPoolConfig {
    /// Number of page frames.
    pub nframes: usize,
    /// Frames the evictioner tries to free per wakeup.
    pub evict_batch: usize,
}

impl Default for BufPoolConfig {
    fn default() -> Self {
        Self {
            nframes: 1024,
            evict_batch: 32,
        }
    }
}

impl BufPoolConfig {
    #[must_use]
    pub fn validated(mut self) -> Self {
        self.nframes = self.nframes.max(8);
        self.evict_batch = self.evict_batch.clamp(1, self.nframes);
        self
    }
}

/// Latch modes on a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchMode {
    Sh,
    Ex,
}

/// Per-frame control block. The page bytes themselves live behind the
/// frame latch; everything here is lock-free metadata.
pub struct ControlBlock {
    pub used: AtomicBool,
    pub dirty: AtomicBool,
    pub pid: AtomicU32,
    pub pin_count: AtomicI32,
    /// Mirror of the frame header's LSN, for latch-free reads.
    pub page_lsn: AtomicU64,
    /// First LSN that dirtied the current image; 0 when clean.
    pub rec_lsn: AtomicU64,
}

impl ControlBlock {
    fn new() -> Self {
        Self {
            used: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            pid: AtomicU32::new(0),
            pin_count: AtomicI32::new(0),
            page_lsn: AtomicU64::new(0),
            rec_lsn: AtomicU64::new(0),
        }
    }

    fn reset(&self) {
        self.used.store(false, Ordering::Release);
        self.dirty.store(false, Ordering::Release);
        self.pid.store(0, Ordering::Release);
        self.page_lsn.store(0, Ordering::Release);
        self.rec_lsn.store(0, Ordering::Release);
    }
}

/// Free list threaded through the control-block array: a head index plus
/// a length, with per-frame next pointers.
struct FreeList {
    head: usize,
    next: Vec<usize>,
    len: usize,
}

/// The buffer pool.
pub struct BufferPool {
    cfg: BufPoolConfig,
    volume: Arc<Volume>,
    log: Arc<LogManager>,
    frames: Box<[RwLock<PageBuf>]>,
    cbs: Box<[ControlBlock]>,
    map: RwLock<HashMap<PageId, usize>>,
    freelist: Mutex<FreeList>,
    /// Double-checked length so grabbers skip the lock when empty/full.
    freelist_len: AtomicUsize,
    free_cond: Condvar,
    /// Evictioner wakeup (flag + condvar), owned here so grabbers can
    /// poke it without holding a reference to the worker.
    evict_wake: Mutex<bool>,
    evict_cond: Condvar,
}

impl BufferPool {
    #[must_use]
    pub fn new(cfg: BufPoolConfig, volume: Arc<Volume>, log: Arc<LogManager>) -> Arc<Self> {
        let cfg = cfg.validated();
        let n = cfg.nframes;
        let frames = (0..n).map(|_| RwLock::new(PageBuf::zeroed())).collect();
        let cbs = (0..n).map(|_| ControlBlock::new()).collect();
        // Thread every frame onto the free list: idx -> idx + 1.
        let mut next = vec![NIL; n];
        for (i, slot) in next.iter_mut().enumerate().take(n - 1) {
            *slot = i + 1;
        }
        Arc::new(Self {
            cfg,
            volume,
            log,
            frames,
            cbs,
            map: RwLock::new(HashMap::with_capacity(n)),
            freelist: Mutex::new(FreeList { head: 0, next, len: n }),
            freelist_len: AtomicUsize::new(n),
            free_cond: Condvar::new(),
            evict_wake: Mutex::new(false),
            evict_cond: Condvar::new(),
        })
    }

    #[must_use]
    pub fn nframes(&self) -> usize {
        self.cfg.nframes
    }

    #[must_use]
    pub fn config(&self) -> &BufPoolConfig {
        &self.cfg
    }

    pub(crate) fn cb(&self, idx: usize) -> &ControlBlock {
        &self.cbs[idx]
    }

    #[must_use]
    pub fn log(&self) -> &Arc<LogManager> {
        &self.log
    }

    #[must_use]
    pub fn volume(&self) -> &Arc<Volume> {
        &self.volume
    }

    /// Pop a frame off the free list.
    ///
    /// With `may_evict` the grabber wakes the evictioner and waits for a
    /// frame; without it an empty list surfaces as `BufferFull` (used to
    /// avoid deadlock during recovery).
    pub fn grab_free_block(&self, may_evict: bool) -> Result<usize> {
        loop {
            // Checking the length without the lock first keeps a full
            // pool from hammering the free-list lock. False positives
            // and negatives both resolve below.
            if self.freelist_len.load(Ordering::Acquire) > 0 {
                let mut fl = self.freelist.lock();
                if fl.len > 0 {
                    let idx = fl.head;
                    debug_assert!(!self.cbs[idx].used.load(Ordering::Acquire));
                    fl.head = if fl.len == 1 { NIL } else { fl.next[idx] };
                    fl.len -= 1;
                    self.freelist_len.store(fl.len, Ordering::Release);
                    debug_assert!(idx != fl.head);
                    trace!(idx, "grabbed free block");
                    return Ok(idx);
                }
            }
            if !may_evict {
                return Err(ShaleError::BufferFull);
            }
            self.wake_evictioner();
            let mut fl = self.freelist.lock();
            if fl.len == 0 {
                self.free_cond.wait_for(&mut fl, Duration::from_millis(10));
            }
        }
    }

    /// Push a frame back onto the free list. The frame must already be
    /// marked unused and must not be the current head.
    pub fn add_free_block(&self, idx: usize) {
        let mut fl = self.freelist.lock();
        debug_assert!(idx != fl.head);
        debug_assert!(!self.cbs[idx].used.load(Ordering::Acquire));
        fl.next[idx] = fl.head;
        fl.head = idx;
        fl.len += 1;
        self.freelist_len.store(fl.len, Ordering::Release);
        drop(fl);
        self.free_cond.notify_one();
    }

    /// Wake the evictioner worker (if one is attached).
    pub fn wake_evictioner(&self) {
        let mut flag = self.evict_wake.lock();
        *flag = true;
        self.evict_cond.notify_one();
    }

    /// Evictioner side: wait until woken or `timeout` elapses.
    pub(crate) fn wait_for_evict_wakeup(&self, timeout: Duration) {
        let mut flag = self.evict_wake.lock();
        if !*flag {
            self.evict_cond.wait_for(&mut flag, timeout);
        }
        *flag = false;
    }

    /// Fix a page: hash lookup, or read it from the volume into a free
    /// frame on a miss. Returns a latched, pinned guard.
    pub fn fix(&self, pid: PageId, mode: LatchMode, may_evict: bool) -> Result<PageGuard<'_>> {
        loop {
            let hit = self.map.read().get(&pid).copied();
            if let Some(idx) = hit {
                let cb = &self.cbs[idx];
                cb.pin_count.fetch_add(1, Ordering::AcqRel);
                let latch = match mode {
                    LatchMode::Sh => GuardLatch::Read(self.frames[idx].read()),
                    LatchMode::Ex => GuardLatch::Write(self.frames[idx].write()),
                };
                // Re-validate under the latch: the frame may have been
                // evicted (and even reused) between lookup and pin.
                if cb.used.load(Ordering::Acquire) && cb.pid.load(Ordering::Acquire) == pid {
                    return Ok(PageGuard {
                        pool: self,
                        idx,
                        pid,
                        latch: Some(latch),
                        evict_hint: false,
                    });
                }
                drop(latch);
                cb.pin_count.fetch_sub(1, Ordering::AcqRel);
                continue;
            }

            // Miss: load into a free frame, racing other loaders.
            let idx = self.grab_free_block(may_evict)?;
            let mut frame = self.frames[idx].write();
            if let Err(e) = self.volume.read_page(pid, &mut frame) {
                drop(frame);
                self.add_free_block(idx);
                return Err(e);
            }

            {
                let mut map = self.map.write();
                if map.contains_key(&pid) {
                    // Another thread loaded it while we did I/O.
                    drop(frame);
                    self.add_free_block(idx);
                    continue;
                }
                map.insert(pid, idx);
            }
            let cb = &self.cbs[idx];
            cb.pid.store(pid, Ordering::Release);
            cb.dirty.store(false, Ordering::Release);
            cb.rec_lsn.store(0, Ordering::Release);
            cb.page_lsn
                .store(page::page_lsn(frame.as_bytes()).to_raw(), Ordering::Release);
            cb.pin_count.store(1, Ordering::Release);
            cb.used.store(true, Ordering::Release);
            trace!(pid, idx, "fixed page (miss)");

            let latch = match mode {
                LatchMode::Sh => GuardLatch::Read(RwLockWriteGuard::downgrade(frame)),
                LatchMode::Ex => GuardLatch::Write(frame),
            };
            return Ok(PageGuard {
                pool: self,
                idx,
                pid,
                latch: Some(latch),
                evict_hint: false,
            });
        }
    }

    /// Fix a freshly-allocated page without reading the volume: the
    /// caller formats it. Always exclusive.
    pub fn fix_virgin(&self, pid: PageId, may_evict: bool) -> Result<PageGuard<'_>> {
        loop {
            if let Some(idx) = self.map.read().get(&pid).copied() {
                // Already resident (recovery re-formats existing frames).
                let cb = &self.cbs[idx];
                cb.pin_count.fetch_add(1, Ordering::AcqRel);
                let latch = GuardLatch::Write(self.frames[idx].write());
                if cb.used.load(Ordering::Acquire) && cb.pid.load(Ordering::Acquire) == pid {
                    return Ok(PageGuard {
                        pool: self,
                        idx,
                        pid,
                        latch: Some(latch),
                        evict_hint: false,
                    });
                }
                drop(latch);
                cb.pin_count.fetch_sub(1, Ordering::AcqRel);
                continue;
            }

            let idx = self.grab_free_block(may_evict)?;
            let mut frame = self.frames[idx].write();
            frame.as_bytes_mut().fill(0);
            {
                let mut map = self.map.write();
                if map.contains_key(&pid) {
                    drop(frame);
                    self.add_free_block(idx);
                    continue;
                }
                map.insert(pid, idx);
            }
            let cb = &self.cbs[idx];
            cb.pid.store(pid, Ordering::Release);
            cb.dirty.store(false, Ordering::Release);
            cb.rec_lsn.store(0, Ordering::Release);
            cb.page_lsn.store(0, Ordering::Release);
            cb.pin_count.store(1, Ordering::Release);
            cb.used.store(true, Ordering::Release);
            trace!(pid, idx, "fixed virgin page");
            return Ok(PageGuard {
                pool: self,
                idx,
                pid,
                latch: Some(GuardLatch::Write(frame)),
                evict_hint: false,
            });
        }
    }

    /// Write one frame's image back to the volume under the WAL rule.
    /// The caller must hold the frame latch (any mode) via `image`.
    pub(crate) fn write_frame_image(&self, pid: PageId, image: &PageBuf) -> Result<()> {
        let lsn = page::page_lsn(image.as_bytes());
        self.log.flush(lsn)?;
        debug_assert!(self.log.durable_lsn() > lsn || lsn.is_null());
        let mut copy = image.clone();
        self.volume.write_page(pid, &mut copy)?;
        Ok(())
    }

    /// Oldest rec-LSN across dirty frames (truncation pin), or null.
    #[must_use]
    pub fn min_rec_lsn(&self) -> Lsn {
        let mut min = Lsn::NULL;
        for cb in self.cbs.iter() {
            if cb.used.load(Ordering::Acquire) && cb.dirty.load(Ordering::Acquire) {
                let rec = Lsn::from_raw(cb.rec_lsn.load(Ordering::Acquire));
                if !rec.is_null() && (min.is_null() || rec < min) {
                    min = rec;
                }
            }
        }
        min
    }

    /// Snapshot of dirty frames as `(idx, pid, rec_lsn)`, pid-ordered.
    #[must_use]
    pub fn dirty_frames(&self) -> Vec<(usize, PageId, Lsn)> {
        let mut out = Vec::new();
        for (idx, cb) in self.cbs.iter().enumerate() {
            if cb.used.load(Ordering::Acquire) && cb.dirty.load(Ordering::Acquire) {
                out.push((
                    idx,
                    cb.pid.load(Ordering::Acquire),
                    Lsn::from_raw(cb.rec_lsn.load(Ordering::Acquire)),
                ));
            }
        }
        out.sort_by_key(|&(_, pid, _)| pid);
        out
    }

    /// Number of used frames (tests and introspection).
    #[must_use]
    pub fn used_frames(&self) -> usize {
        self.cbs
            .iter()
            .filter(|cb| cb.used.load(Ordering::Acquire))
            .count()
    }

    /// Try to take a frame's latch exclusively without blocking
    /// (evictioner side).
    pub(crate) fn try_latch_ex(&self, idx: usize) -> Option<RwLockWriteGuard<'_, PageBuf>> {
        self.frames[idx].try_write()
    }

    /// Try to take a frame's latch shared without blocking (cleaner side).
    pub(crate) fn try_latch_sh(&self, idx: usize) -> Option<RwLockReadGuard<'_, PageBuf>> {
        self.frames[idx].try_read()
    }

    /// Drop a frame's mapping and return it to the free list. Internal:
    /// the evictioner calls this with the frame latched and pin == 0.
    pub(crate) fn retire_frame(&self, idx: usize, pid: PageId) {
        self.map.write().remove(&pid);
        self.cbs[idx].reset();
        self.add_free_block(idx);
        debug!(pid, idx, "evicted frame");
    }
}

enum GuardLatch<'a> {
    Read(RwLockReadGuard<'a, PageBuf>),
    Write(RwLockWriteGuard<'a, PageBuf>),
}

/// A latched, pinned page. Dropping unfixes: the latch is released, the
/// pin removed, and an optional evict hint wakes the evictioner.
pub struct PageGuard<'a> {
    pool: &'a BufferPool,
    idx: usize,
    pid: PageId,
    latch: Option<GuardLatch<'a>>,
    evict_hint: bool,
}

impl PageGuard<'_> {
    #[must_use]
    pub fn pid(&self) -> PageId {
        self.pid
    }

    #[must_use]
    pub fn mode(&self) -> LatchMode {
        match self.latch {
            Some(GuardLatch::Read(_)) => LatchMode::Sh,
            _ => LatchMode::Ex,
        }
    }

    /// The page image.
    #[must_use]
    pub fn page(&self) -> &PageBuf {
        match self
            .latch
            .as_ref()
            .unwrap_or_else(|| unreachable!("latch held until drop"))
        {
            GuardLatch::Read(g) => g,
            GuardLatch::Write(g) => g,
        }
    }

    /// Mutable page image; requires an exclusive latch.
    pub fn page_mut(&mut self) -> &mut PageBuf {
        match self
            .latch
            .as_mut()
            .unwrap_or_else(|| unreachable!("latch held until drop"))
        {
            GuardLatch::Write(g) => g,
            GuardLatch::Read(_) => {
                panic!("internal invariant violated: page_mut on a shared latch")
            }
        }
    }

    /// Current page LSN.
    #[must_use]
    pub fn lsn(&self) -> Lsn {
        page::page_lsn(self.page().as_bytes())
    }

    /// Stamp a new page LSN and mark the frame dirty (recording the
    /// rec-LSN on the clean→dirty edge).
    pub fn set_lsn(&mut self, lsn: Lsn) {
        page::set_page_lsn(self.page_mut().as_bytes_mut(), lsn);
        let cb = self.pool.cb(self.idx);
        cb.page_lsn.store(lsn.to_raw(), Ordering::Release);
        if !cb.dirty.swap(true, Ordering::AcqRel) {
            cb.rec_lsn.store(lsn.to_raw(), Ordering::Release);
        }
    }

    /// Ask the evictioner to consider this frame once unfixed.
    pub fn set_evict_hint(&mut self) {
        self.evict_hint = true;
    }
}

impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        self.latch = None;
        self.pool
            .cb(self.idx)
            .pin_count
            .fetch_sub(1, Ordering::AcqRel);
        if self.evict_hint {
            self.pool.wake_evictioner();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shale_types::page::PAGE_SIZE;
    use shale_types::{PageHeader, PageType};
    use shale_wal::LogConfig;
    use tempfile::TempDir;

    fn setup(nframes: usize) -> (TempDir, Arc<BufferPool>) {
        let dir = TempDir::new().unwrap();
        let volume = Arc::new(Volume::create(dir.path().join("vol")).unwrap());
        let log = LogManager::open(dir.path().join("log"), LogConfig::default()).unwrap();
        let pool = BufferPool::new(
            BufPoolConfig {
                nframes,
                evict_batch: 4,
            },
            volume,
            log,
        );
        (dir, pool)
    }

    fn format_btree_page(guard: &mut PageGuard<'_>, pid: PageId) {
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
        .write_to(guard.page_mut().as_bytes_mut());
    }

    #[test]
    fn grab_add_round_trip() {
        let (_dir, pool) = setup(8);
        let a = pool.grab_free_block(false).unwrap();
        let b = pool.grab_free_block(false).unwrap();
        assert_ne!(a, b);
        pool.cbs[a].used.store(false, Ordering::Release);
        pool.add_free_block(a);
        // LIFO: the re-added frame comes back first.
        assert_eq!(pool.grab_free_block(false).unwrap(), a);
    }

    #[test]
    fn empty_freelist_without_evict_is_buffer_full() {
        let (_dir, pool) = setup(8);
        for _ in 0..8 {
            pool.grab_free_block(false).unwrap();
        }
        assert!(matches!(
            pool.grab_free_block(false),
            Err(ShaleError::BufferFull)
        ));
    }

    #[test]
    fn fix_virgin_then_refix_reads_same_frame() {
        let (_dir, pool) = setup(8);
        {
            let mut g = pool.fix_virgin(30, false).unwrap();
            format_btree_page(&mut g, 30);
            g.set_lsn(Lsn::new(1, 8));
            g.page_mut().as_bytes_mut()[100] = 0x5A;
        }
        let g = pool.fix(30, LatchMode::Sh, false).unwrap();
        assert_eq!(g.page().as_bytes()[100], 0x5A);
        assert_eq!(g.lsn(), Lsn::new(1, 8));
        assert_eq!(pool.used_frames(), 1);
    }

    #[test]
    fn dirty_tracking_records_first_lsn() {
        let (_dir, pool) = setup(8);
        let mut g = pool.fix_virgin(5, false).unwrap();
        format_btree_page(&mut g, 5);
        g.set_lsn(Lsn::new(1, 100));
        g.set_lsn(Lsn::new(1, 200));
        drop(g);
        assert_eq!(pool.min_rec_lsn(), Lsn::new(1, 100));
        let dirty = pool.dirty_frames();
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].1, 5);
    }

    #[test]
    fn shared_latches_coexist() {
        let (_dir, pool) = setup(8);
        {
            let mut g = pool.fix_virgin(9, false).unwrap();
            format_btree_page(&mut g, 9);
        }
        let g1 = pool.fix(9, LatchMode::Sh, false).unwrap();
        let g2 = pool.fix(9, LatchMode::Sh, false).unwrap();
        assert_eq!(g1.pid(), g2.pid());
        assert_eq!(pool.cb(pool.map.read()[&9]).pin_count.load(Ordering::Acquire), 2);
    }
}
