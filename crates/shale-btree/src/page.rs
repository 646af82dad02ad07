//! B-tree page layout and page-level operations.
//!
//! Behind the common 40-byte header: the slot directory grows up from the
//! header (4 bytes per slot: record offset + flags), the record area
//! grows down from the end of the page. Fence keys, the foster
//! descriptor, and the interior leftmost-child descriptor are
//! variable-length blobs in the record area, addressed by header offsets.
//!
//! ```text
//! [header][slot directory →        ...free...        ← records/blobs]
//! ```
//!
//! Records: `klen:u16 | vlen:u16 | key | value`. On interior pages the
//! value is a child descriptor `child_pid:u32 | child_emlsn:u64` and the
//! key is the separator; keys below the first separator belong to the
//! `pid0` leftmost child. A header fence offset of 0 means infimum
//! (low) / supremum (high).
//!
//! Deletions leave holes in the record area; ghost reclaim and the fence
//! rewrites rebuild the page. All functions here are pure byte surgery —
//! latching and logging are the tree layer's problem.

use shale_error::{Result, ShaleError};
use shale_types::page::{
    off, read_u16, read_u32, read_u64, write_u16, write_u32, PAGE_HEADER_SIZE, PAGE_SIZE,
};
use shale_types::{Lsn, PageId, PageType, StoreId};

const SLOT_SIZE: usize = 4;
const GHOST_BIT: u16 = 0x8000;

/// Largest key+value a page accepts; keeps at least a handful of records
/// per page so splits always make progress.
pub const MAX_RECORD_SIZE: usize = (PAGE_SIZE - PAGE_HEADER_SIZE) / 8;

/// A foster-child descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Foster {
    pub pid: PageId,
    pub emlsn: Lsn,
}

// ---------------------------------------------------------------------------
// Header reads
// ---------------------------------------------------------------------------

#[inline]
#[must_use]
pub fn pid(page: &[u8]) -> PageId {
    read_u32(page, off::PID)
}

#[inline]
#[must_use]
pub fn store(page: &[u8]) -> StoreId {
    read_u32(page, off::STORE)
}

#[inline]
#[must_use]
pub fn level(page: &[u8]) -> u8 {
    page[off::LEVEL]
}

#[inline]
#[must_use]
pub fn is_leaf(page: &[u8]) -> bool {
    level(page) == 0
}

#[inline]
#[must_use]
pub fn nrecs(page: &[u8]) -> usize {
    read_u16(page, off::NRECS) as usize
}

fn record_area_end(page: &[u8]) -> usize {
    read_u16(page, off::RECORD_AREA_END) as usize
}

/// Free bytes between the slot directory and the record area.
#[must_use]
pub fn free_space(page: &[u8]) -> usize {
    record_area_end(page).saturating_sub(PAGE_HEADER_SIZE + nrecs(page) * SLOT_SIZE)
}

/// Space one record of this size consumes (slot entry + blob).
#[must_use]
pub fn space_for(key_len: usize, value_len: usize) -> usize {
    SLOT_SIZE + 4 + key_len + value_len
}

fn blob_at(page: &[u8], at: usize) -> &[u8] {
    let len = read_u16(page, at) as usize;
    &page[at + 2..at + 2 + len]
}

/// Low fence key. Empty slice doubles as the infimum.
#[must_use]
pub fn fence_low(page: &[u8]) -> &[u8] {
    let at = read_u16(page, off::FENCE_LOW) as usize;
    if at == 0 {
        &[]
    } else {
        blob_at(page, at)
    }
}

/// High fence key; `None` is the supremum.
#[must_use]
pub fn fence_high(page: &[u8]) -> Option<&[u8]> {
    let at = read_u16(page, off::FENCE_HIGH) as usize;
    if at == 0 {
        None
    } else {
        Some(blob_at(page, at))
    }
}

/// The foster descriptor, if this page has a foster child.
#[must_use]
pub fn foster(page: &[u8]) -> Option<Foster> {
    let at = read_u16(page, off::FOSTER) as usize;
    if at == 0 {
        return None;
    }
    Some(Foster {
        pid: read_u32(page, at),
        emlsn: Lsn::from_raw(read_u64(page, at + 4)),
    })
}

/// High fence of the whole foster chain; equals the page's own high
/// fence when there is no foster child.
#[must_use]
pub fn chain_high(page: &[u8]) -> Option<&[u8]> {
    let at = read_u16(page, off::FOSTER) as usize;
    if at == 0 {
        return fence_high(page);
    }
    let len = read_u16(page, at + 12) as usize;
    if len == 0 && page[at + 14] == 0 {
        // Stored supremum marker: len 0 with flag 0.
        return None;
    }
    Some(&page[at + 15..at + 15 + len])
}

/// Interior leftmost child.
#[must_use]
pub fn pid0(page: &[u8]) -> Option<(PageId, Lsn)> {
    let at = read_u16(page, off::PID0) as usize;
    if at == 0 {
        return None;
    }
    Some((read_u32(page, at), Lsn::from_raw(read_u64(page, at + 4))))
}

/// Whether `key` falls within `[fence_low, fence_high)`.
#[must_use]
pub fn fence_contains(page: &[u8], key: &[u8]) -> bool {
    if key < fence_low(page) {
        return false;
    }
    match fence_high(page) {
        None => true,
        Some(high) => key < high,
    }
}

fn slot_raw(page: &[u8], slot: usize) -> (usize, u16) {
    let at = PAGE_HEADER_SIZE + slot * SLOT_SIZE;
    (read_u16(page, at) as usize, read_u16(page, at + 2))
}

/// Whether the slot is a ghost.
#[must_use]
pub fn is_ghost(page: &[u8], slot: usize) -> bool {
    slot_raw(page, slot).1 & GHOST_BIT != 0
}

/// Key of a slot.
#[must_use]
pub fn slot_key(page: &[u8], slot: usize) -> &[u8] {
    let (at, _) = slot_raw(page, slot);
    let klen = read_u16(page, at) as usize;
    &page[at + 4..at + 4 + klen]
}

/// Value bytes of a slot (current length, not reserved capacity).
#[must_use]
pub fn slot_value(page: &[u8], slot: usize) -> &[u8] {
    let (at, _) = slot_raw(page, slot);
    let klen = read_u16(page, at) as usize;
    let vlen = read_u16(page, at + 2) as usize;
    &page[at + 4 + klen..at + 4 + klen + vlen]
}

/// Interior: decode a slot's child descriptor.
#[must_use]
pub fn slot_child(page: &[u8], slot: usize) -> (PageId, Lsn) {
    let v = slot_value(page, slot);
    (
        read_u32(v, 0),
        Lsn::from_raw(read_u64(v, 4)),
    )
}

/// Binary search. Returns `(found, slot)`; on a miss `slot` is the
/// insert position (`keys[slot-1] < key < keys[slot]`).
#[must_use]
pub fn search(page: &[u8], key: &[u8]) -> (bool, usize) {
    let n = nrecs(page);
    let mut lo = 0usize;
    let mut hi = n;
    while lo < hi {
        let mid = (lo + hi) / 2;
        match slot_key(page, mid).cmp(key) {
            std::cmp::Ordering::Less => lo = mid + 1,
            std::cmp::Ordering::Greater => hi = mid,
            std::cmp::Ordering::Equal => return (true, mid),
        }
    }
    (false, lo)
}

/// Interior: the child covering `key`. With `high_match` a key equal to
/// a separator routes to the left child (used by backward scans hunting
/// the page whose high fence equals the key).
#[must_use]
pub fn child_for(page: &[u8], key: &[u8], high_match: bool) -> (PageId, Lsn) {
    let (found, slot) = search(page, key);
    let idx = if found {
        if high_match {
            slot.checked_sub(1)
        } else {
            Some(slot)
        }
    } else {
        slot.checked_sub(1)
    };
    match idx {
        Some(i) => slot_child(page, i),
        None => pid0(page).unwrap_or_else(|| {
            unreachable!("interior page without pid0")
        }),
    }
}

// ---------------------------------------------------------------------------
// Formatting and blob writes
// ---------------------------------------------------------------------------

struct BlobArena {
    end: usize,
}

impl BlobArena {
    fn push(&mut self, page: &mut [u8], bytes_parts: &[&[u8]]) -> u16 {
        let total: usize = bytes_parts.iter().map(|b| b.len()).sum();
        self.end -= total;
        let mut at = self.end;
        for part in bytes_parts {
            page[at..at + part.len()].copy_from_slice(part);
            at += part.len();
        }
        self.end as u16
    }
}

/// Describes everything needed to (re)build a page image.
pub struct FormatSpec<'a> {
    pub pid: PageId,
    pub store: StoreId,
    pub level: u8,
    pub fence_low: &'a [u8],
    /// `None` = supremum.
    pub fence_high: Option<&'a [u8]>,
    /// Chain-high fence; only meaningful with `foster`. `None` =
    /// supremum.
    pub chain_high: Option<&'a [u8]>,
    pub foster: Option<Foster>,
    pub pid0: Option<(PageId, Lsn)>,
}

/// Format a page from scratch. Wipes everything; records are inserted
/// afterwards.
pub fn format(page: &mut [u8], spec: &FormatSpec<'_>) {
    page.fill(0);
    page[off::PAGE_TYPE] = PageType::Btree as u8;
    page[off::LEVEL] = spec.level;
    write_u32(page, off::PID, spec.pid);
    write_u32(page, off::STORE, spec.store);

    let mut arena = BlobArena { end: PAGE_SIZE };

    // Low fence: offset 0 means infimum, so an empty low fence still
    // gets a blob when it is a real (empty-string) bound. Infimum and
    // the empty key compare equal everywhere, so one blob serves both.
    let low_off = arena.push(page, &[&(spec.fence_low.len() as u16).to_be_bytes(), spec.fence_low]);
    write_u16(page, off::FENCE_LOW, low_off);

    if let Some(high) = spec.fence_high {
        let high_off = arena.push(page, &[&(high.len() as u16).to_be_bytes(), high]);
        write_u16(page, off::FENCE_HIGH, high_off);
    }

    if let Some(f) = spec.foster {
        // pid:u32 | emlsn:u64 | chain_len:u16 | supremum_flag:u8 | chain
        let (chain_len, flag, chain): (u16, u8, &[u8]) = match spec.chain_high {
            Some(c) => (c.len() as u16, 1, c),
            None => (0, 0, &[]),
        };
        let foster_off = arena.push(
            page,
            &[
                &f.pid.to_be_bytes(),
                &f.emlsn.to_raw().to_be_bytes(),
                &chain_len.to_be_bytes(),
                &[flag],
                chain,
            ],
        );
        write_u16(page, off::FOSTER, foster_off);
    }

    if let Some((p0, emlsn0)) = spec.pid0 {
        let pid0_off = arena.push(
            page,
            &[&p0.to_be_bytes(), &emlsn0.to_raw().to_be_bytes()],
        );
        write_u16(page, off::PID0, pid0_off);
    }

    write_u16(page, off::RECORD_AREA_END, arena.end as u16);
}

fn set_record_area_end(page: &mut [u8], end: usize) {
    write_u16(page, off::RECORD_AREA_END, end as u16);
}

fn set_nrecs(page: &mut [u8], n: usize) {
    write_u16(page, off::NRECS, n as u16);
}

fn write_slot(page: &mut [u8], slot: usize, rec_off: usize, ghost: bool) {
    let at = PAGE_HEADER_SIZE + slot * SLOT_SIZE;
    write_u16(page, at, rec_off as u16);
    write_u16(page, at + 2, if ghost { GHOST_BIT } else { 0 });
}

fn set_ghost_bit(page: &mut [u8], slot: usize, ghost: bool) {
    let at = PAGE_HEADER_SIZE + slot * SLOT_SIZE + 2;
    let mut info = read_u16(page, at);
    if ghost {
        info |= GHOST_BIT;
    } else {
        info &= !GHOST_BIT;
    }
    write_u16(page, at, info);
}

/// Open a slot at `slot`, shifting the directory tail right, and write
/// the record blob. Fails with `OutOfSpace` when the page is full.
fn insert_record_at(
    page: &mut [u8],
    slot: usize,
    key: &[u8],
    value: &[u8],
    value_capacity: usize,
    ghost: bool,
) -> Result<()> {
    let n = nrecs(page);
    debug_assert!(slot <= n);
    let blob_len = 4 + key.len() + value_capacity;
    if free_space(page) < SLOT_SIZE + blob_len {
        return Err(ShaleError::OutOfSpace {
            detail: "page full".into(),
        });
    }

    let new_end = record_area_end(page) - blob_len;
    page[new_end..new_end + 2].copy_from_slice(&(key.len() as u16).to_be_bytes());
    page[new_end + 2..new_end + 4].copy_from_slice(&(value.len() as u16).to_be_bytes());
    page[new_end + 4..new_end + 4 + key.len()].copy_from_slice(key);
    page[new_end + 4 + key.len()..new_end + 4 + key.len() + value.len()].copy_from_slice(value);
    // Reserved tail beyond value.len() stays zero.
    set_record_area_end(page, new_end);

    // Shift the slot directory tail.
    let dir_start = PAGE_HEADER_SIZE + slot * SLOT_SIZE;
    let dir_end = PAGE_HEADER_SIZE + n * SLOT_SIZE;
    page.copy_within(dir_start..dir_end, dir_start + SLOT_SIZE);
    write_slot(page, slot, new_end, ghost);
    set_nrecs(page, n + 1);
    Ok(())
}

/// Reserved value capacity of a slot (equals the value length for live
/// records; ghosts may reserve more than they hold).
#[must_use]
pub fn record_capacity(page: &[u8], slot: usize) -> usize {
    let (at, _) = slot_raw(page, slot);
    read_u16(page, at + 2) as usize
}

/// Append a record after the current last slot (bulk build; keys must
/// arrive in order).
pub fn push_record(
    page: &mut [u8],
    key: &[u8],
    value: &[u8],
    capacity: usize,
    ghost: bool,
) -> Result<()> {
    let n = nrecs(page);
    debug_assert!(n == 0 || slot_key(page, n - 1) < key);
    insert_record_at(page, n, key, value, capacity.max(value.len()), ghost)?;
    if ghost {
        let (at, _) = slot_raw(page, n);
        write_u16(page, at + 2, capacity.max(value.len()) as u16);
    }
    Ok(())
}

/// Insert a fresh, non-ghost record at its sorted position.
pub fn insert_nonghost(page: &mut [u8], key: &[u8], value: &[u8]) -> Result<()> {
    let (found, slot) = search(page, key);
    if found {
        return Err(ShaleError::internal("insert_nonghost: key already present"));
    }
    insert_record_at(page, slot, key, value, value.len(), false)
}

/// Interior insert: a separator and its child descriptor.
pub fn insert_child(page: &mut [u8], separator: &[u8], child: PageId, emlsn: Lsn) -> Result<()> {
    let mut v = [0u8; 12];
    v[0..4].copy_from_slice(&child.to_be_bytes());
    v[4..12].copy_from_slice(&emlsn.to_raw().to_be_bytes());
    insert_nonghost(page, separator, &v)
}

/// Reserve a ghost slot with room for `value_len` bytes. Re-reserving an
/// existing ghost grows its capacity if needed.
pub fn reserve_ghost(page: &mut [u8], key: &[u8], value_len: usize) -> Result<()> {
    let (found, slot) = search(page, key);
    if found {
        if !is_ghost(page, slot) {
            return Err(ShaleError::internal("reserve_ghost over a live record"));
        }
        let (at, _) = slot_raw(page, slot);
        let klen = read_u16(page, at) as usize;
        let capacity = read_u16(page, at + 2) as usize;
        if capacity >= value_len {
            return Ok(());
        }
        // Too small: point the slot at a fresh, larger blob.
        let blob_len = 4 + klen + value_len;
        if free_space(page) < blob_len {
            return Err(ShaleError::OutOfSpace {
                detail: "page full".into(),
            });
        }
        let new_end = record_area_end(page) - blob_len;
        page[new_end..new_end + 2].copy_from_slice(&(klen as u16).to_be_bytes());
        page[new_end + 2..new_end + 4].copy_from_slice(&(value_len as u16).to_be_bytes());
        let key_src = at + 4;
        page.copy_within(key_src..key_src + klen, new_end + 4);
        set_record_area_end(page, new_end);
        let slot_at = PAGE_HEADER_SIZE + slot * SLOT_SIZE;
        write_u16(page, slot_at, new_end as u16);
        return Ok(());
    }
    insert_record_at(page, slot, key, &[], value_len, true)?;
    // The reserved slot reports value_len capacity via its vlen field.
    let (at, _) = slot_raw(page, slot);
    write_u16(page, at + 2, value_len as u16);
    Ok(())
}

/// Fill a reserved ghost and make it live.
pub fn replace_ghost(page: &mut [u8], key: &[u8], value: &[u8]) -> Result<()> {
    let (found, slot) = search(page, key);
    if !found || !is_ghost(page, slot) {
        return Err(ShaleError::internal("replace_ghost: no ghost for key"));
    }
    let (at, _) = slot_raw(page, slot);
    let klen = read_u16(page, at) as usize;
    let capacity = read_u16(page, at + 2) as usize;
    if capacity < value.len() {
        return Err(ShaleError::OutOfSpace {
            detail: "ghost too small".into(),
        });
    }
    page[at + 2..at + 4].copy_from_slice(&(value.len() as u16).to_be_bytes());
    page[at + 4 + klen..at + 4 + klen + value.len()].copy_from_slice(value);
    set_ghost_bit(page, slot, false);
    Ok(())
}

/// Replace a live record's whole value.
pub fn replace_value(page: &mut [u8], key: &[u8], new: &[u8]) -> Result<()> {
    let (found, slot) = search(page, key);
    if !found {
        return Err(ShaleError::internal("replace_value: key missing"));
    }
    let (at, _) = slot_raw(page, slot);
    let klen = read_u16(page, at) as usize;
    let vlen = read_u16(page, at + 2) as usize;
    if new.len() <= vlen {
        page[at + 2..at + 4].copy_from_slice(&(new.len() as u16).to_be_bytes());
        page[at + 4 + klen..at + 4 + klen + new.len()].copy_from_slice(new);
        return Ok(());
    }
    // Larger value: fresh blob, old one becomes a hole.
    let blob_len = 4 + klen + new.len();
    if free_space(page) < blob_len {
        return Err(ShaleError::OutOfSpace {
            detail: "page full".into(),
        });
    }
    let new_end = record_area_end(page) - blob_len;
    page[new_end..new_end + 2].copy_from_slice(&(klen as u16).to_be_bytes());
    page[new_end + 2..new_end + 4].copy_from_slice(&(new.len() as u16).to_be_bytes());
    page.copy_within(at + 4..at + 4 + klen, new_end + 4);
    page[new_end + 4 + klen..new_end + 4 + klen + new.len()].copy_from_slice(new);
    set_record_area_end(page, new_end);
    let slot_at = PAGE_HEADER_SIZE + slot * SLOT_SIZE;
    write_u16(page, slot_at, new_end as u16);
    Ok(())
}

/// Overwrite part of a live record's value in place.
pub fn overwrite_value(page: &mut [u8], key: &[u8], offset: usize, bytes: &[u8]) -> Result<()> {
    let (found, slot) = search(page, key);
    if !found {
        return Err(ShaleError::internal("overwrite_value: key missing"));
    }
    let (at, _) = slot_raw(page, slot);
    let klen = read_u16(page, at) as usize;
    let vlen = read_u16(page, at + 2) as usize;
    if offset + bytes.len() > vlen {
        return Err(ShaleError::internal("overwrite beyond value bounds"));
    }
    let dst = at + 4 + klen + offset;
    page[dst..dst + bytes.len()].copy_from_slice(bytes);
    Ok(())
}

/// Mark a record ghost (logical delete). Idempotent.
pub fn mark_ghost(page: &mut [u8], key: &[u8]) -> Result<()> {
    let (found, slot) = search(page, key);
    if !found {
        return Err(ShaleError::internal("mark_ghost: key missing"));
    }
    set_ghost_bit(page, slot, true);
    Ok(())
}

/// Clear a ghost mark (undo of a logical delete). Idempotent.
pub fn unmark_ghost(page: &mut [u8], key: &[u8]) -> Result<()> {
    let (found, slot) = search(page, key);
    if !found {
        return Err(ShaleError::internal("unmark_ghost: key missing"));
    }
    set_ghost_bit(page, slot, false);
    Ok(())
}

/// Remove slots `[from, to)` from the directory. Their blobs become
/// holes.
pub fn delete_range(page: &mut [u8], from: usize, to: usize) -> Result<()> {
    let n = nrecs(page);
    if from > to || to > n {
        return Err(ShaleError::internal("delete_range out of bounds"));
    }
    let dir_from = PAGE_HEADER_SIZE + from * SLOT_SIZE;
    let dir_to = PAGE_HEADER_SIZE + to * SLOT_SIZE;
    let dir_end = PAGE_HEADER_SIZE + n * SLOT_SIZE;
    page.copy_within(dir_to..dir_end, dir_from);
    set_nrecs(page, n - (to - from));
    Ok(())
}

/// One preserved record, for rebuilds.
struct KeptRecord {
    key: Vec<u8>,
    value: Vec<u8>,
    capacity: usize,
    ghost: bool,
}

fn collect_records(page: &[u8], keep_ghosts: bool) -> Vec<KeptRecord> {
    let mut out = Vec::with_capacity(nrecs(page));
    for slot in 0..nrecs(page) {
        let ghost = is_ghost(page, slot);
        if ghost && !keep_ghosts {
            continue;
        }
        let (at, _) = slot_raw(page, slot);
        let capacity = read_u16(page, at + 2) as usize;
        out.push(KeptRecord {
            key: slot_key(page, slot).to_vec(),
            value: slot_value(page, slot).to_vec(),
            capacity,
            ghost,
        });
    }
    out
}

fn rebuild(page: &mut [u8], spec: &FormatSpec<'_>, records: &[KeptRecord]) -> Result<()> {
    let lsn = shale_types::page::page_lsn(page);
    format(page, spec);
    shale_types::page::set_page_lsn(page, lsn);
    for (i, rec) in records.iter().enumerate() {
        insert_record_at(page, i, &rec.key, &rec.value, rec.capacity.max(rec.value.len()), rec.ghost)?;
        if rec.ghost {
            let (at, _) = slot_raw(page, i);
            write_u16(page, at + 2, rec.capacity as u16);
        }
    }
    Ok(())
}

/// Owned snapshot of a page's format, for rebuilds that change it.
pub struct OwnedSpec {
    pub pid: PageId,
    pub store: StoreId,
    pub level: u8,
    pub fence_low: Vec<u8>,
    pub fence_high: Option<Vec<u8>>,
    pub chain_high: Option<Vec<u8>>,
    pub foster: Option<Foster>,
    pub pid0: Option<(PageId, Lsn)>,
}

impl OwnedSpec {
    #[must_use]
    pub fn of(page: &[u8]) -> Self {
        Self {
            pid: pid(page),
            store: store(page),
            level: level(page),
            fence_low: fence_low(page).to_vec(),
            fence_high: fence_high(page).map(<[u8]>::to_vec),
            chain_high: chain_high(page).map(<[u8]>::to_vec),
            foster: foster(page),
            pid0: pid0(page),
        }
    }

    fn as_spec(&self) -> FormatSpec<'_> {
        FormatSpec {
            pid: self.pid,
            store: self.store,
            level: self.level,
            fence_low: &self.fence_low,
            fence_high: self.fence_high.as_deref(),
            chain_high: self.chain_high.as_deref(),
            foster: self.foster,
            pid0: self.pid0,
        }
    }
}

/// Defragment, physically removing every ghost slot.
pub fn reclaim_ghosts(page: &mut [u8]) -> Result<()> {
    let records = collect_records(page, false);
    let spec = OwnedSpec::of(page);
    rebuild(page, &spec.as_spec(), &records)
}

/// Rewrite the fence keys (low, high, chain-high), compacting the page.
pub fn compress(
    page: &mut [u8],
    fence_low: &[u8],
    fence_high: Option<&[u8]>,
    chain_high: Option<&[u8]>,
) -> Result<()> {
    let records = collect_records(page, true);
    let mut spec = OwnedSpec::of(page);
    spec.fence_low = fence_low.to_vec();
    spec.fence_high = fence_high.map(<[u8]>::to_vec);
    spec.chain_high = chain_high.map(<[u8]>::to_vec);
    rebuild(page, &spec.as_spec(), &records)
}

/// Link `child` as this page's foster child: the page's high fence drops
/// to `new_high` (the separator) and the chain-high takes over the old
/// upper bound.
pub fn set_foster_child(
    page: &mut [u8],
    child: Foster,
    new_high: &[u8],
    new_chain_high: Option<&[u8]>,
) -> Result<()> {
    let records = collect_records(page, true);
    let mut spec = OwnedSpec::of(page);
    spec.fence_high = Some(new_high.to_vec());
    spec.chain_high = new_chain_high.map(<[u8]>::to_vec);
    spec.foster = Some(child);
    rebuild(page, &spec.as_spec(), &records)
}

/// Clear the foster pointer (the child half of an adoption). The blob
/// stays behind as a hole until the next rebuild.
pub fn clear_foster(page: &mut [u8]) {
    write_u16(page, off::FOSTER, 0);
}

/// Overwrite this page with a logged full image.
pub fn format_steal(page: &mut [u8], image: &[u8]) -> Result<()> {
    if image.len() != PAGE_SIZE {
        return Err(ShaleError::internal("page image has wrong size"));
    }
    page.copy_from_slice(image);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shale_types::PageBuf;

    fn leaf(pid_: PageId) -> PageBuf {
        let mut buf = PageBuf::zeroed();
        format(
            buf.as_bytes_mut(),
            &FormatSpec {
                pid: pid_,
                store: 1,
                level: 0,
                fence_low: b"",
                fence_high: None,
                chain_high: None,
                foster: None,
                pid0: None,
            },
        );
        buf
    }

    #[test]
    fn insert_keeps_sorted_order() {
        let mut buf = leaf(9);
        let page = buf.as_bytes_mut();
        for key in [b"mm".as_ref(), b"aa", b"zz", b"cc"] {
            insert_nonghost(page, key, b"v").unwrap();
        }
        let keys: Vec<&[u8]> = (0..nrecs(page)).map(|i| slot_key(page, i)).collect();
        assert_eq!(keys, vec![b"aa".as_ref(), b"cc", b"mm", b"zz"]);
        assert!(search(page, b"cc").0);
        assert_eq!(search(page, b"bb"), (false, 1));
    }

    #[test]
    fn ghost_reserve_replace_cycle() {
        let mut buf = leaf(9);
        let page = buf.as_bytes_mut();
        reserve_ghost(page, b"k1", 5).unwrap();
        assert!(is_ghost(page, 0));
        replace_ghost(page, b"k1", b"abcde").unwrap();
        assert!(!is_ghost(page, 0));
        assert_eq!(slot_value(page, 0), b"abcde");
    }

    #[test]
    fn ghost_reserve_grows_small_ghosts() {
        let mut buf = leaf(9);
        let page = buf.as_bytes_mut();
        insert_nonghost(page, b"k", b"xy").unwrap();
        mark_ghost(page, b"k").unwrap();
        reserve_ghost(page, b"k", 10).unwrap();
        replace_ghost(page, b"k", b"0123456789").unwrap();
        assert_eq!(slot_value(page, 0), b"0123456789");
    }

    #[test]
    fn mark_and_unmark_ghost() {
        let mut buf = leaf(9);
        let page = buf.as_bytes_mut();
        insert_nonghost(page, b"k", b"val").unwrap();
        mark_ghost(page, b"k").unwrap();
        assert!(is_ghost(page, 0));
        unmark_ghost(page, b"k").unwrap();
        assert!(!is_ghost(page, 0));
        assert_eq!(slot_value(page, 0), b"val");
    }

    #[test]
    fn reclaim_drops_ghosts_and_compacts() {
        let mut buf = leaf(9);
        let page = buf.as_bytes_mut();
        for i in 0..20u8 {
            insert_nonghost(page, &[b'a', i], &[i; 16]).unwrap();
        }
        let before_free = free_space(page);
        for i in (0..20u8).step_by(2) {
            mark_ghost(page, &[b'a', i]).unwrap();
        }
        reclaim_ghosts(page).unwrap();
        assert_eq!(nrecs(page), 10);
        assert!(free_space(page) > before_free);
        for i in 0..nrecs(page) {
            assert!(!is_ghost(page, i));
            assert_eq!(slot_key(page, i)[1] % 2, 1);
        }
    }

    #[test]
    fn replace_value_grows_and_shrinks() {
        let mut buf = leaf(9);
        let page = buf.as_bytes_mut();
        insert_nonghost(page, b"k", b"short").unwrap();
        replace_value(page, b"k", b"a-much-longer-value").unwrap();
        assert_eq!(slot_value(page, 0), b"a-much-longer-value");
        replace_value(page, b"k", b"s").unwrap();
        assert_eq!(slot_value(page, 0), b"s");
    }

    #[test]
    fn overwrite_patches_in_place() {
        let mut buf = leaf(9);
        let page = buf.as_bytes_mut();
        insert_nonghost(page, b"k", b"0123456789").unwrap();
        overwrite_value(page, b"k", 3, b"XYZ").unwrap();
        assert_eq!(slot_value(page, 0), b"012XYZ6789");
        assert!(overwrite_value(page, b"k", 8, b"toolong").is_err());
    }

    #[test]
    fn page_fills_to_out_of_space() {
        let mut buf = leaf(9);
        let page = buf.as_bytes_mut();
        let mut inserted = 0u32;
        loop {
            let key = inserted.to_be_bytes();
            match insert_nonghost(page, &key, &[0u8; 64]) {
                Ok(()) => inserted += 1,
                Err(ShaleError::OutOfSpace { .. }) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(inserted > 100);
        assert_eq!(nrecs(page), inserted as usize);
    }

    #[test]
    fn foster_link_and_fences() {
        let mut buf = leaf(7);
        let page = buf.as_bytes_mut();
        for key in [b"a".as_ref(), b"m", b"z"] {
            insert_nonghost(page, key, b"v").unwrap();
        }
        set_foster_child(
            page,
            Foster {
                pid: 8,
                emlsn: Lsn::new(1, 64),
            },
            b"m",
            None,
        )
        .unwrap();
        assert_eq!(foster(page).unwrap().pid, 8);
        assert_eq!(fence_high(page), Some(b"m".as_ref()));
        assert_eq!(chain_high(page), None);
        assert!(fence_contains(page, b"a"));
        assert!(!fence_contains(page, b"m"));
        // Records are untouched by the fence rewrite.
        assert_eq!(nrecs(page), 3);

        clear_foster(page);
        assert!(foster(page).is_none());
        assert_eq!(chain_high(page), Some(b"m".as_ref()));
    }

    #[test]
    fn interior_child_routing() {
        let mut buf = PageBuf::zeroed();
        let page = buf.as_bytes_mut();
        format(
            page,
            &FormatSpec {
                pid: 3,
                store: 1,
                level: 1,
                fence_low: b"",
                fence_high: None,
                chain_high: None,
                foster: None,
                pid0: Some((10, Lsn::NULL)),
            },
        );
        insert_child(page, b"g", 11, Lsn::NULL).unwrap();
        insert_child(page, b"p", 12, Lsn::NULL).unwrap();

        assert_eq!(child_for(page, b"a", false).0, 10);
        assert_eq!(child_for(page, b"g", false).0, 11);
        assert_eq!(child_for(page, b"k", false).0, 11);
        assert_eq!(child_for(page, b"p", false).0, 12);
        assert_eq!(child_for(page, b"zz", false).0, 12);
        // high-match: a key equal to a separator routes left.
        assert_eq!(child_for(page, b"g", true).0, 10);
        assert_eq!(child_for(page, b"p", true).0, 11);
    }

    #[test]
    fn delete_range_drops_tail() {
        let mut buf = leaf(9);
        let page = buf.as_bytes_mut();
        for i in 0..10u8 {
            insert_nonghost(page, &[i], b"v").unwrap();
        }
        delete_range(page, 7, 10).unwrap();
        assert_eq!(nrecs(page), 7);
        assert_eq!(slot_key(page, 6), &[6u8]);
    }

    #[test]
    fn format_steal_round_trip() {
        let mut a = leaf(5);
        insert_nonghost(a.as_bytes_mut(), b"k", b"v").unwrap();
        let mut b = PageBuf::zeroed();
        format_steal(b.as_bytes_mut(), a.as_bytes()).unwrap();
        assert_eq!(slot_value(b.as_bytes(), 0), b"v");
        assert_eq!(pid(b.as_bytes()), 5);
    }

    #[test]
    fn compress_rewrites_fences() {
        let mut buf = leaf(9);
        let page = buf.as_bytes_mut();
        insert_nonghost(page, b"mm", b"v").unwrap();
        compress(page, b"ma", Some(b"mz"), None).unwrap();
        assert_eq!(fence_low(page), b"ma");
        assert_eq!(fence_high(page), Some(b"mz".as_ref()));
        assert_eq!(slot_key(page, 0), b"mm");
    }
}
