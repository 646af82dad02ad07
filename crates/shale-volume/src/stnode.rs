//! Store-node cache.
//!
//! The store-node page (pid [`STNODE_PID`]) is the volume's catalog: one
//! fixed-width entry per store holding the B-tree root pid and the last
//! extent appended to the store. The cache keeps the page image in memory,
//! logs every mutation as an SSX chained off the page's prior LSN, and
//! writes the page back at checkpoint.
//!
//! Entry `s` lives at `PAGE_HEADER_SIZE + s * 8`: `root_pid:u32 |
//! last_extent:u32`. Store 0 is the metadata pseudo-store owning extent 0.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::RwLock;
use shale_error::{Result, ShaleError};
use shale_types::page::{self, PageHeader, PAGE_HEADER_SIZE, PAGE_SIZE};
use shale_types::{Lsn, PageBuf, PageId, PageType, StoreId, STNODE_PID};
use shale_wal::{LogManager, LogPayload, LogRecord};
use tracing::{debug, info};

use crate::volume::Volume;

const ENTRY_SIZE: usize = 8;

/// Highest store id the page can hold.
pub const MAX_STORES: StoreId = ((PAGE_SIZE - PAGE_HEADER_SIZE) / ENTRY_SIZE) as StoreId;

struct StnodeInner {
    image: PageBuf,
    /// Chain head: LSN of the last StoreCreate/StoreExtent against this
    /// page.
    page_lsn: Lsn,
    /// First unflushed update; null when the on-disk image is current.
    rec_lsn: Lsn,
    /// Store ids handed out by `reserve_store` whose root is not yet set.
    reserved: BTreeSet<StoreId>,
}

/// In-memory cache of the store-node page.
pub struct StnodeCache {
    log: Arc<LogManager>,
    inner: RwLock<StnodeInner>,
}

impl StnodeCache {
    /// Write a fresh store-node page into a virgin volume.
    pub fn format(volume: &Volume) -> Result<()> {
        let mut image = PageBuf::zeroed();
        Self::format_image(&mut image);
        volume.write_page(STNODE_PID, &mut image)?;
        volume.sync()?;
        info!("formatted store-node page");
        Ok(())
    }

    fn format_image(image: &mut PageBuf) {
        PageHeader {
            pid: STNODE_PID,
            lsn: Lsn::NULL,
            page_type: PageType::StoreNode,
            level: 0,
            flags: 0,
            store: 0,
            checksum: 0,
            fence_low_off: 0,
            fence_high_off: 0,
            foster_off: 0,
            nrecs: 0,
            record_area_end: PAGE_SIZE as u16,
            pid0_off: 0,
        }
        .write_to(image.as_bytes_mut());
    }

    /// Load the cache from the volume's store-node page.
    pub fn new(volume: &Volume, log: Arc<LogManager>) -> Result<Self> {
        let mut image = PageBuf::zeroed();
        volume.read_page(STNODE_PID, &mut image)?;
        if image.header().page_type == PageType::Unknown {
            Self::format_image(&mut image);
        } else if image.header().page_type != PageType::StoreNode {
            return Err(ShaleError::corrupt(STNODE_PID, "not a store-node page"));
        }
        let page_lsn = image.header().lsn;
        Ok(Self {
            log,
            inner: RwLock::new(StnodeInner {
                image,
                page_lsn,
                rec_lsn: Lsn::NULL,
                reserved: BTreeSet::new(),
            }),
        })
    }

    fn entry(image: &PageBuf, stid: StoreId) -> (PageId, u32) {
        let at = PAGE_HEADER_SIZE + stid as usize * ENTRY_SIZE;
        (
            page::read_u32(image.as_bytes(), at),
            page::read_u32(image.as_bytes(), at + 4),
        )
    }

    fn set_entry(image: &mut PageBuf, stid: StoreId, root: PageId, last_extent: u32) {
        let at = PAGE_HEADER_SIZE + stid as usize * ENTRY_SIZE;
        page::write_u32(image.as_bytes_mut(), at, root);
        page::write_u32(image.as_bytes_mut(), at + 4, last_extent);
    }

    fn apply(inner: &mut StnodeInner, lsn: Lsn) {
        inner.page_lsn = lsn;
        page::set_page_lsn(inner.image.as_bytes_mut(), lsn);
        if inner.rec_lsn.is_null() {
            inner.rec_lsn = lsn;
        }
    }

    /// Hand out the lowest unused store id. The id stays reserved until
    /// [`StnodeCache::set_store_root`] lands.
    pub fn reserve_store(&self) -> Result<StoreId> {
        let mut inner = self.inner.write();
        for stid in 1..MAX_STORES {
            let (root, last_extent) = Self::entry(&inner.image, stid);
            if root == 0 && last_extent == 0 && !inner.reserved.contains(&stid) {
                inner.reserved.insert(stid);
                return Ok(stid);
            }
        }
        Err(ShaleError::OutOfSpace {
            detail: "store-node page is full".into(),
        })
    }

    /// Record a freshly-built store root, completing store creation.
    pub fn set_store_root(&self, stid: StoreId, root: PageId) -> Result<()> {
        let mut inner = self.inner.write();
        let rec = LogRecord {
            txn: shale_types::TxnId::NONE,
            prev_lsn: inner.page_lsn,
            store: stid,
            pid: STNODE_PID,
            pid2: 0,
            payload: LogPayload::StoreCreate { root_pid: root },
        };
        let lsn = self.log.insert(&rec)?;
        let (_, last_extent) = Self::entry(&inner.image, stid);
        Self::set_entry(&mut inner.image, stid, root, last_extent);
        inner.reserved.remove(&stid);
        Self::apply(&mut inner, lsn);
        info!(stid, root, "created store");
        Ok(())
    }

    /// Append extent `ext` to `stid` (SSX; called by the allocation cache
    /// when an allocation crosses an extent boundary).
    pub fn sx_append_extent(&self, stid: StoreId, ext: u32) -> Result<()> {
        let mut inner = self.inner.write();
        let rec = LogRecord {
            txn: shale_types::TxnId::NONE,
            prev_lsn: inner.page_lsn,
            store: stid,
            pid: STNODE_PID,
            pid2: 0,
            payload: LogPayload::StoreExtent { extent: ext },
        };
        let lsn = self.log.insert(&rec)?;
        let (root, _) = Self::entry(&inner.image, stid);
        Self::set_entry(&mut inner.image, stid, root, ext);
        Self::apply(&mut inner, lsn);
        debug!(stid, ext, "appended extent");
        Ok(())
    }

    /// Recovery redo of a StoreCreate, idempotent via the page LSN.
    pub fn redo_store_create(&self, stid: StoreId, root: PageId, lsn: Lsn) {
        let mut inner = self.inner.write();
        if inner.page_lsn >= lsn {
            return;
        }
        let (_, last_extent) = Self::entry(&inner.image, stid);
        Self::set_entry(&mut inner.image, stid, root, last_extent);
        Self::apply(&mut inner, lsn);
    }

    /// Recovery redo of a StoreExtent, idempotent via the page LSN.
    pub fn redo_append_extent(&self, stid: StoreId, ext: u32, lsn: Lsn) {
        let mut inner = self.inner.write();
        if inner.page_lsn >= lsn {
            return;
        }
        let (root, _) = Self::entry(&inner.image, stid);
        Self::set_entry(&mut inner.image, stid, root, ext);
        Self::apply(&mut inner, lsn);
    }

    /// The B-tree root of a store, if the store exists.
    #[must_use]
    pub fn get_root(&self, stid: StoreId) -> Option<PageId> {
        let inner = self.inner.read();
        if stid >= MAX_STORES {
            return None;
        }
        match Self::entry(&inner.image, stid) {
            (0, _) => None,
            (root, _) => Some(root),
        }
    }

    /// Last extent appended to a store.
    #[must_use]
    pub fn get_last_extent(&self, stid: StoreId) -> u32 {
        let inner = self.inner.read();
        Self::entry(&inner.image, stid).1
    }

    /// Stores with a root set, ascending.
    #[must_use]
    pub fn used_stores(&self) -> Vec<StoreId> {
        let inner = self.inner.read();
        (1..MAX_STORES)
            .filter(|&s| Self::entry(&inner.image, s).0 != 0)
            .collect()
    }

    /// First unflushed update against the store-node page (truncation
    /// pin), or null when clean.
    #[must_use]
    pub fn rec_lsn(&self) -> Lsn {
        self.inner.read().rec_lsn
    }

    /// Harden the page at checkpoint. Flushes the log past the page LSN
    /// first (WAL rule), then writes and clears the pin.
    pub fn write_page(&self, volume: &Volume) -> Result<()> {
        let (mut image, page_lsn) = {
            let inner = self.inner.read();
            (inner.image.clone(), inner.page_lsn)
        };
        self.log.flush(page_lsn)?;
        volume.write_page(STNODE_PID, &mut image)?;
        let mut inner = self.inner.write();
        if inner.page_lsn == page_lsn {
            inner.rec_lsn = Lsn::NULL;
        } else {
            // Updated while we wrote; the image on disk is current only
            // through page_lsn.
            inner.rec_lsn = page_lsn;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shale_wal::LogConfig;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Volume, Arc<LogManager>) {
        let dir = TempDir::new().unwrap();
        let vol = Volume::create(dir.path().join("vol")).unwrap();
        let log = LogManager::open(dir.path().join("log"), LogConfig::default()).unwrap();
        StnodeCache::format(&vol).unwrap();
        (dir, vol, log)
    }

    #[test]
    fn reserve_create_lookup() {
        let (_dir, vol, log) = setup();
        let cache = StnodeCache::new(&vol, log).unwrap();
        let s1 = cache.reserve_store().unwrap();
        let s2 = cache.reserve_store().unwrap();
        assert_ne!(s1, s2);
        cache.set_store_root(s1, 77).unwrap();
        assert_eq!(cache.get_root(s1), Some(77));
        assert_eq!(cache.get_root(s2), None);
        assert_eq!(cache.used_stores(), vec![s1]);
    }

    #[test]
    fn extents_round_trip_through_disk() {
        let (_dir, vol, log) = setup();
        {
            let cache = StnodeCache::new(&vol, Arc::clone(&log)).unwrap();
            let s = cache.reserve_store().unwrap();
            cache.set_store_root(s, 10).unwrap();
            cache.sx_append_extent(s, 3).unwrap();
            cache.write_page(&vol).unwrap();
            assert_eq!(cache.rec_lsn(), Lsn::NULL);
        }
        let cache = StnodeCache::new(&vol, log).unwrap();
        assert_eq!(cache.get_root(1), Some(10));
        assert_eq!(cache.get_last_extent(1), 3);
    }

    #[test]
    fn redo_is_idempotent() {
        let (_dir, vol, log) = setup();
        let cache = StnodeCache::new(&vol, log).unwrap();
        cache.redo_store_create(2, 55, Lsn::new(1, 100));
        cache.redo_store_create(2, 99, Lsn::new(1, 50));
        assert_eq!(cache.get_root(2), Some(55));
        cache.redo_append_extent(2, 7, Lsn::new(1, 200));
        cache.redo_append_extent(2, 1, Lsn::new(1, 150));
        assert_eq!(cache.get_last_extent(2), 7);
    }
}
