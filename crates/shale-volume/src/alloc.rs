//! The page-allocation cache.
//!
//! Tracks which pages are allocated, per store, without touching the
//! bitmap pages on the hot path: `last_alloc_page[store]` is the highest
//! pid ever allocated to the store (allocation always appends — freed
//! pages are not reused within a run), `freed_pages` is the global set of
//! deallocated pids, and `loaded_extents` marks which extents' bitmap
//! pages have been materialized (monotonic: true never reverts).
//!
//! `is_allocated(pid)` is then `pid <= max(last_alloc_page) && pid not in
//! freed_pages`, after lazily loading `pid`'s extent.
//!
//! The bitmap pages themselves are mutated only through log replay:
//! allocation/deallocation append SSX records chained off the owning
//! bitmap page's previous LSN (`page_lsns`), and
//! `write_dirty_bitmap_pages` reconstructs each dirty page by single-page
//! recovery over that chain before writing it back.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;
use shale_error::{Result, ShaleError};
use shale_types::page::{self, off, PAGE_HEADER_SIZE};
use shale_types::{
    bitmap_pid_of, extent_of, ExtentId, Lsn, PageBuf, PageId, PageType, StoreId, EXTENT_SIZE,
    STNODE_PID,
};
use shale_wal::{LogManager, LogPayload, LogRecord, LogRecordKind};
use tracing::{debug, trace, warn};

use crate::stnode::StnodeCache;
use crate::volume::Volume;

struct AllocInner {
    /// Highest pid ever allocated, per store. Monotonic during a run.
    last_alloc_page: Vec<PageId>,
    /// Deallocated pids, across all stores.
    freed_pages: BTreeSet<PageId>,
    /// Extents whose bitmap pages have been loaded. Monotonic.
    loaded_extents: Vec<bool>,
    /// Last-update LSN per bitmap page (the chain head).
    page_lsns: BTreeMap<PageId, Lsn>,
    /// First unflushed update per bitmap page (truncation pin).
    rec_lsns: BTreeMap<PageId, Lsn>,
    /// Pids (re)allocated by recovery redo. A later lazy extent load must
    /// not resurrect their freed status from a stale on-disk bitmap.
    redo_allocated: BTreeSet<PageId>,
}

/// The allocation cache. One per volume.
pub struct AllocCache {
    volume: Arc<Volume>,
    stnode: Arc<StnodeCache>,
    log: Arc<LogManager>,
    inner: RwLock<AllocInner>,
}

impl AllocCache {
    /// Build the cache. A virgin volume starts with extent 0 loaded and
    /// the store-node pid as the metadata store's last allocation; an
    /// existing volume loads each store's last extent eagerly and the
    /// rest on demand.
    pub fn new(
        volume: Arc<Volume>,
        stnode: Arc<StnodeCache>,
        log: Arc<LogManager>,
        virgin: bool,
    ) -> Result<Self> {
        let cache = Self {
            volume,
            stnode,
            log,
            inner: RwLock::new(AllocInner {
                last_alloc_page: vec![STNODE_PID],
                freed_pages: BTreeSet::new(),
                loaded_extents: vec![virgin],
                page_lsns: BTreeMap::new(),
                rec_lsns: BTreeMap::new(),
                redo_allocated: BTreeSet::new(),
            }),
        };
        if !virgin {
            for s in cache.stnode.used_stores() {
                let ext = cache.stnode.get_last_extent(s);
                cache.load_alloc_page(ext, Some(s))?;
            }
        }
        Ok(cache)
    }

    /// Materialize extent `ext`'s bitmap page into the cache. `owner`
    /// names the store whose `last_alloc_page` should track the scan
    /// (only passed for a store's last extent).
    fn load_alloc_page(&self, ext: ExtentId, owner: Option<StoreId>) -> Result<()> {
        let mut inner = self.inner.write();

        // Double-checked: racing loaders resolve here.
        if inner.loaded_extents.get(ext as usize).copied() == Some(true) {
            return Ok(());
        }

        let bpid = ext * EXTENT_SIZE;
        let mut image = PageBuf::zeroed();
        self.volume.read_page(bpid, &mut image)?;
        let header = image.header();

        if let Some(s) = owner {
            Self::grow_store_vec(&mut inner.last_alloc_page, s);
            if inner.last_alloc_page[s as usize] < bpid {
                inner.last_alloc_page[s as usize] = bpid;
            }
        }

        // Scan bits high to low: the first set bit is the extent's last
        // allocation; unset bits below it are freed pages.
        let mut last_alloc: u32 = 0;
        let mut j = EXTENT_SIZE - 1;
        while j > 0 {
            let pid = bpid + j;
            if bit_is_set(image.as_bytes(), j) {
                if last_alloc == 0 {
                    last_alloc = j;
                    if let Some(s) = owner {
                        if inner.last_alloc_page[s as usize] < pid {
                            inner.last_alloc_page[s as usize] = pid;
                        }
                    }
                }
            } else if last_alloc != 0 && !inner.redo_allocated.contains(&pid) {
                inner.freed_pages.insert(pid);
            }
            j -= 1;
        }

        if !header.lsn.is_null() {
            let entry = inner.page_lsns.entry(bpid).or_insert(Lsn::NULL);
            if *entry < header.lsn {
                *entry = header.lsn;
            }
        }
        if inner.loaded_extents.len() <= ext as usize {
            inner.loaded_extents.resize(ext as usize + 1, false);
        }
        inner.loaded_extents[ext as usize] = true;
        debug!(ext, last_alloc, "loaded allocation bitmap page");
        Ok(())
    }

    fn grow_store_vec(v: &mut Vec<PageId>, stid: StoreId) {
        if v.len() <= stid as usize {
            v.resize(stid as usize + 1, 0);
        }
    }

    fn global_last(inner: &AllocInner) -> PageId {
        inner.last_alloc_page.iter().copied().max().unwrap_or(0)
    }

    /// Highest pid ever allocated to `stid`.
    #[must_use]
    pub fn last_allocated_pid(&self, stid: StoreId) -> PageId {
        let inner = self.inner.read();
        inner
            .last_alloc_page
            .get(stid as usize)
            .copied()
            .unwrap_or(0)
    }

    /// Highest pid ever allocated to any store.
    #[must_use]
    pub fn last_allocated_pid_global(&self) -> PageId {
        Self::global_last(&self.inner.read())
    }

    /// Last-update LSN of a bitmap page, or null.
    #[must_use]
    pub fn page_lsn(&self, bpid: PageId) -> Lsn {
        self.inner
            .read()
            .page_lsns
            .get(&bpid)
            .copied()
            .unwrap_or(Lsn::NULL)
    }

    /// Oldest unflushed bitmap-page update; feeds the oldest-LSN tracker.
    #[must_use]
    pub fn min_rec_lsn(&self) -> Lsn {
        self.inner
            .read()
            .rec_lsns
            .values()
            .copied()
            .min()
            .unwrap_or(Lsn::NULL)
    }

    /// Allocate a fresh page for `stid` and log it.
    pub fn allocate(&self, stid: StoreId) -> Result<PageId> {
        let mut inner = self.inner.write();
        Self::grow_store_vec(&mut inner.last_alloc_page, stid);

        let mut pid = inner.last_alloc_page[stid as usize] + 1;
        if pid == 1 || pid % EXTENT_SIZE == 0 {
            // Crossing into a bitmap page's slot (or a brand-new store):
            // take a whole new extent for this store.
            let ext = Self::global_last(&inner) / EXTENT_SIZE + 1;
            pid = ext * EXTENT_SIZE + 1;
            self.stnode.sx_append_extent(stid, ext)?;
            if inner.loaded_extents.len() <= ext as usize {
                inner.loaded_extents.resize(ext as usize + 1, false);
            }
            // A fresh extent has nothing on disk to load.
            inner.loaded_extents[ext as usize] = true;
            debug!(stid, ext, "assigned new extent");
        }
        inner.last_alloc_page[stid as usize] = pid;

        let bpid = bitmap_pid_of(pid);
        let prev = inner.page_lsns.get(&bpid).copied().unwrap_or(Lsn::NULL);
        let lsn = self.log.insert(&LogRecord {
            txn: shale_types::TxnId::NONE,
            prev_lsn: prev,
            store: stid,
            pid,
            pid2: 0,
            payload: LogPayload::AllocPage,
        })?;
        inner.page_lsns.insert(bpid, lsn);
        inner.rec_lsns.entry(bpid).or_insert(lsn);
        trace!(stid, pid, %lsn, "allocated page");
        Ok(pid)
    }

    /// Record `pid` as free and log it.
    pub fn deallocate(&self, pid: PageId) -> Result<()> {
        let mut inner = self.inner.write();
        inner.freed_pages.insert(pid);

        let bpid = bitmap_pid_of(pid);
        let prev = inner.page_lsns.get(&bpid).copied().unwrap_or(Lsn::NULL);
        let lsn = self.log.insert(&LogRecord {
            txn: shale_types::TxnId::NONE,
            prev_lsn: prev,
            store: 0,
            pid,
            pid2: 0,
            payload: LogPayload::DeallocPage,
        })?;
        inner.page_lsns.insert(bpid, lsn);
        inner.rec_lsns.entry(bpid).or_insert(lsn);
        trace!(pid, %lsn, "deallocated page");
        Ok(())
    }

    /// Idempotent recovery re-application of an allocation.
    pub fn redo_allocate(&self, pid: PageId, stid: StoreId, lsn: Lsn) {
        let mut inner = self.inner.write();
        Self::grow_store_vec(&mut inner.last_alloc_page, stid);
        if inner.last_alloc_page[stid as usize] < pid {
            inner.last_alloc_page[stid as usize] = pid;
        }
        inner.freed_pages.remove(&pid);
        inner.redo_allocated.insert(pid);
        Self::note_redo_lsn(&mut inner, bitmap_pid_of(pid), lsn);
    }

    /// Idempotent recovery re-application of a deallocation.
    pub fn redo_deallocate(&self, pid: PageId, lsn: Lsn) {
        let mut inner = self.inner.write();
        inner.freed_pages.insert(pid);
        inner.redo_allocated.remove(&pid);
        Self::note_redo_lsn(&mut inner, bitmap_pid_of(pid), lsn);
    }

    fn note_redo_lsn(inner: &mut AllocInner, bpid: PageId, lsn: Lsn) {
        let entry = inner.page_lsns.entry(bpid).or_insert(Lsn::NULL);
        if *entry < lsn {
            *entry = lsn;
        }
        inner.rec_lsns.entry(bpid).or_insert(lsn);
    }

    /// Whether `pid` is currently allocated (`pid <= max last-alloc and
    /// not freed`), loading its extent on first touch.
    pub fn is_allocated(&self, pid: PageId) -> Result<bool> {
        let ext = extent_of(pid);
        let loaded = {
            let inner = self.inner.read();
            inner.loaded_extents.get(ext as usize).copied() == Some(true)
        };
        if !loaded {
            self.load_alloc_page(ext, None)?;
        }

        let inner = self.inner.read();
        if pid > Self::global_last(&inner) {
            return Ok(false);
        }
        Ok(!inner.freed_pages.contains(&pid))
    }

    /// Reconstruct and write back every dirty bitmap page whose last
    /// update is at or below `rec_lsn`, by replaying its log chain over
    /// the on-disk image (single-page recovery).
    pub fn write_dirty_bitmap_pages(&self, rec_lsn: Lsn) -> Result<()> {
        let candidates: Vec<(PageId, Lsn)> = {
            let inner = self.inner.read();
            inner
                .page_lsns
                .iter()
                .filter(|(bpid, head)| {
                    **head <= rec_lsn && inner.rec_lsns.contains_key(*bpid)
                })
                .map(|(bpid, head)| (*bpid, *head))
                .collect()
        };

        for (bpid, head) in candidates {
            let mut image = PageBuf::zeroed();
            self.volume.read_page(bpid, &mut image)?;
            if image.header().page_type == PageType::Unknown {
                format_bitmap_page(&mut image, bpid);
            }
            let image_lsn = image.header().lsn;

            // Walk the page chain back to the image, then apply forward.
            let mut chain = Vec::new();
            let mut cur = head;
            while !cur.is_null() && cur > image_lsn {
                let (rec, prev) = self.log.fetch_direct(cur)?;
                if bitmap_pid_of(rec.pid) != bpid {
                    return Err(ShaleError::corrupt(
                        bpid,
                        format!("allocation chain at {cur} names page {}", rec.pid),
                    ));
                }
                chain.push((cur, rec));
                cur = prev;
            }
            for (lsn, rec) in chain.into_iter().rev() {
                apply_alloc_record(&mut image, &rec, lsn)?;
            }

            self.log.flush(head)?;
            self.volume.write_page(bpid, &mut image)?;
            self.log.insert(&LogRecord::system(
                0,
                bpid,
                LogPayload::PageWrite { rec_lsn },
            ))?;

            let mut inner = self.inner.write();
            let now_head = inner.page_lsns.get(&bpid).copied().unwrap_or(Lsn::NULL);
            if now_head == head {
                inner.rec_lsns.remove(&bpid);
            } else {
                // Updated while we were writing; pin conservatively at
                // the image we just hardened.
                inner.rec_lsns.insert(bpid, head);
            }
            debug!(bpid, %head, "wrote bitmap page");
        }
        self.volume.sync()?;
        Ok(())
    }
}

/// Apply one allocation-class record to a bitmap page image.
fn apply_alloc_record(image: &mut PageBuf, rec: &LogRecord, lsn: Lsn) -> Result<()> {
    let j = rec.pid % EXTENT_SIZE;
    match rec.kind() {
        LogRecordKind::AllocPage => {
            set_bit(image.as_bytes_mut(), j);
            page::write_u32(image.as_bytes_mut(), off::STORE, rec.store);
        }
        LogRecordKind::DeallocPage => clear_bit(image.as_bytes_mut(), j),
        other => {
            warn!(?other, "non-allocation record in bitmap chain");
            return Err(ShaleError::internal(
                "non-allocation record in bitmap chain",
            ));
        }
    }
    page::set_page_lsn(image.as_bytes_mut(), lsn);
    Ok(())
}

fn format_bitmap_page(image: &mut PageBuf, bpid: PageId) {
    let bytes = image.as_bytes_mut();
    page::write_u32(bytes, off::PID, bpid);
    bytes[off::PAGE_TYPE] = PageType::AllocBitmap as u8;
}

fn bit_is_set(bytes: &[u8], j: u32) -> bool {
    bytes[PAGE_HEADER_SIZE + (j / 8) as usize] & (1 << (j % 8)) != 0
}

fn set_bit(bytes: &mut [u8], j: u32) {
    bytes[PAGE_HEADER_SIZE + (j / 8) as usize] |= 1 << (j % 8);
}

fn clear_bit(bytes: &mut [u8], j: u32) {
    bytes[PAGE_HEADER_SIZE + (j / 8) as usize] &= !(1 << (j % 8));
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use shale_wal::LogConfig;
    use tempfile::TempDir;

    struct Env {
        _dir: TempDir,
        volume: Arc<Volume>,
        stnode: Arc<StnodeCache>,
        log: Arc<LogManager>,
    }

    fn env() -> Env {
        let dir = TempDir::new().unwrap();
        let volume = Arc::new(Volume::create(dir.path().join("vol")).unwrap());
        let log = LogManager::open(dir.path().join("log"), LogConfig::default()).unwrap();
        StnodeCache::format(&volume).unwrap();
        let stnode = Arc::new(StnodeCache::new(&volume, Arc::clone(&log)).unwrap());
        Env {
            _dir: dir,
            volume,
            stnode,
            log,
        }
    }

    fn fresh_cache(env: &Env, virgin: bool) -> AllocCache {
        AllocCache::new(
            Arc::clone(&env.volume),
            Arc::clone(&env.stnode),
            Arc::clone(&env.log),
            virgin,
        )
        .unwrap()
    }

    fn make_store(env: &Env) -> StoreId {
        env.stnode.reserve_store().unwrap()
    }

    #[test]
    fn first_allocation_takes_a_new_extent() {
        let e = env();
        let cache = fresh_cache(&e, true);
        let s = make_store(&e);
        let pid = cache.allocate(s).unwrap();
        assert_eq!(pid, EXTENT_SIZE + 1);
        assert_eq!(e.stnode.get_last_extent(s), 1);
        assert_eq!(cache.last_allocated_pid(s), pid);
        assert!(cache.is_allocated(pid).unwrap());
        assert!(!cache.is_allocated(pid + 1).unwrap());
    }

    #[test]
    fn allocations_are_dense_within_an_extent() {
        let e = env();
        let cache = fresh_cache(&e, true);
        let s = make_store(&e);
        let first = cache.allocate(s).unwrap();
        for i in 1..10 {
            assert_eq!(cache.allocate(s).unwrap(), first + i);
        }
    }

    #[test]
    fn two_stores_get_disjoint_extents() {
        let e = env();
        let cache = fresh_cache(&e, true);
        let s1 = make_store(&e);
        let s2 = make_store(&e);
        let p1 = cache.allocate(s1).unwrap();
        let p2 = cache.allocate(s2).unwrap();
        assert_ne!(extent_of(p1), extent_of(p2));
        assert_eq!(cache.allocate(s1).unwrap(), p1 + 1);
    }

    #[test]
    fn deallocate_flips_is_allocated() {
        let e = env();
        let cache = fresh_cache(&e, true);
        let s = make_store(&e);
        let pid = cache.allocate(s).unwrap();
        cache.deallocate(pid).unwrap();
        assert!(!cache.is_allocated(pid).unwrap());
        // last_alloc_page is monotonic even across deallocation.
        assert_eq!(cache.last_allocated_pid(s), pid);
    }

    #[test]
    fn redo_paths_are_idempotent() {
        let e = env();
        let cache = fresh_cache(&e, true);
        let pid = EXTENT_SIZE + 5;
        cache.redo_allocate(pid, 1, Lsn::new(1, 100));
        cache.redo_allocate(pid, 1, Lsn::new(1, 100));
        assert_eq!(cache.last_allocated_pid(1), pid);
        cache.redo_deallocate(pid, Lsn::new(1, 200));
        cache.redo_deallocate(pid, Lsn::new(1, 200));
        assert!(!cache.is_allocated(pid).unwrap());
        cache.redo_allocate(pid, 1, Lsn::new(1, 300));
        assert!(cache.is_allocated(pid).unwrap());
    }

    #[test]
    fn bitmap_pages_survive_reload() {
        let e = env();
        let surviving: Vec<PageId>;
        {
            let cache = fresh_cache(&e, true);
            let s = make_store(&e);
            e.stnode.set_store_root(s, 999).unwrap();
            let pids: Vec<PageId> = (0..50).map(|_| cache.allocate(s).unwrap()).collect();
            for pid in pids.iter().step_by(2) {
                cache.deallocate(*pid).unwrap();
            }
            surviving = pids.iter().copied().skip(1).step_by(2).collect();
            cache.write_dirty_bitmap_pages(Lsn::MAX).unwrap();
            assert_eq!(cache.min_rec_lsn(), Lsn::NULL);
            e.stnode.write_page(&e.volume).unwrap();
        }

        // Reload purely from the volume image.
        let stnode = Arc::new(StnodeCache::new(&e.volume, Arc::clone(&e.log)).unwrap());
        let cache = AllocCache::new(
            Arc::clone(&e.volume),
            stnode,
            Arc::clone(&e.log),
            false,
        )
        .unwrap();

        let max = *surviving.iter().max().unwrap();
        assert_eq!(cache.last_allocated_pid(1), max);
        for pid in &surviving {
            assert!(cache.is_allocated(*pid).unwrap(), "pid {pid}");
        }
        for pid in surviving.iter().map(|p| p - 1) {
            assert!(!cache.is_allocated(pid).unwrap(), "pid {pid}");
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        /// Allocation bijection against a ground-truth model.
        #[test]
        fn allocation_bijection(ops in proptest::collection::vec(0u8..3, 1..60)) {
            let e = env();
            let cache = fresh_cache(&e, true);
            let s = make_store(&e);
            let mut model: std::collections::BTreeSet<PageId> = Default::default();
            let mut allocated: Vec<PageId> = Vec::new();
            let mut max_pid = 0;

            for op in ops {
                if op < 2 || allocated.is_empty() {
                    let pid = cache.allocate(s).unwrap();
                    model.insert(pid);
                    allocated.push(pid);
                    max_pid = max_pid.max(pid);
                } else {
                    let pid = allocated.remove(allocated.len() / 2);
                    cache.deallocate(pid).unwrap();
                    model.remove(&pid);
                }
            }

            prop_assert_eq!(cache.last_allocated_pid(s), max_pid);
            for pid in EXTENT_SIZE..=max_pid + 2 {
                prop_assert_eq!(
                    cache.is_allocated(pid).unwrap(),
                    model.contains(&pid) || pid == bitmap_pid_of(pid),
                    "pid {}", pid
                );
            }
        }
    }
}
