//! The typed log-record family.
//!
//! Every record is a fixed 32-byte header, a variant-specific body, and a
//! trailing copy of the record's own LSN (so a backward scan can find
//! record starts). Records are either *regular* — they belong to a user
//! transaction, chain through `prev_lsn`, and participate in undo — or
//! *single-log system transactions* (SSX): structural modifications that
//! commit atomically by the fact of their insertion and have no undo.
//!
//! Allocation records are SSX but reuse `prev_lsn` as a *page chain*: each
//! carries the owning bitmap page's previous LSN, which is what single-page
//! recovery of bitmap pages walks.
//!
//! ```text
//! length:u16 | kind:u8 | flags:u8 | txn:u64 | prev_lsn:u64 |
//! store:u32 | pid:u32 | pid2:u32 | body:var | pad | lsn:u64
//! ```
//!
//! REDO is physical and dispatched per variant against the [`RedoPage`]
//! capability trait; for multi-page SSXs the record is self-contained and
//! the target's pid selects which half applies. UNDO is logical and
//! dispatched against [`UndoOps`], which re-traverses from the root
//! without taking user locks.

use shale_error::{Result, ShaleError};
use shale_types::page::{read_u16, read_u32, read_u64, write_u16, write_u32, write_u64};
use shale_types::{Lsn, PageId, StoreId, TxnId};

/// Fixed header size preceding the body.
pub const REC_HEADER_SIZE: usize = 32;

/// Trailing LSN copy.
pub const REC_TRAILER_SIZE: usize = 8;

/// Records are padded to this alignment.
pub const REC_ALIGN: usize = 8;

/// Flag bit: this record is a single-log system transaction.
pub const FLAG_SSX: u8 = 0x01;

/// Record kind tags. Stable on disk; never reuse a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LogRecordKind {
    AllocPage = 1,
    DeallocPage = 2,
    StoreCreate = 3,
    StoreExtent = 4,
    BtreeInsert = 10,
    BtreeInsertNonghost = 11,
    BtreeUpdate = 12,
    BtreeOverwrite = 13,
    BtreeGhostMark = 14,
    BtreeGhostReserve = 15,
    BtreeGhostReclaim = 16,
    BtreeNorecAlloc = 17,
    BtreeSplit = 18,
    BtreeFosterAdopt = 19,
    BtreeCompress = 20,
    BtreeGrow = 21,
    PageImg = 30,
    PageWrite = 31,
    PageEvict = 32,
    TxnCommit = 40,
    TxnAbort = 41,
    TxnEnd = 42,
}

impl LogRecordKind {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::AllocPage,
            2 => Self::DeallocPage,
            3 => Self::StoreCreate,
            4 => Self::StoreExtent,
            10 => Self::BtreeInsert,
            11 => Self::BtreeInsertNonghost,
            12 => Self::BtreeUpdate,
            13 => Self::BtreeOverwrite,
            14 => Self::BtreeGhostMark,
            15 => Self::BtreeGhostReserve,
            16 => Self::BtreeGhostReclaim,
            17 => Self::BtreeNorecAlloc,
            18 => Self::BtreeSplit,
            19 => Self::BtreeFosterAdopt,
            20 => Self::BtreeCompress,
            21 => Self::BtreeGrow,
            30 => Self::PageImg,
            31 => Self::PageWrite,
            32 => Self::PageEvict,
            40 => Self::TxnCommit,
            41 => Self::TxnAbort,
            42 => Self::TxnEnd,
            _ => return None,
        })
    }
}

/// Variant-specific record bodies.
///
/// Key and value fields are raw byte strings; keys compare in plain byte
/// order throughout the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogPayload {
    /// Page `pid` was allocated to `store`. SSX; `prev_lsn` chains the
    /// owning bitmap page.
    AllocPage,
    /// Page `pid` was freed. SSX; `prev_lsn` chains the owning bitmap page.
    DeallocPage,
    /// Store `store` was created with the given B-tree root. Applies to
    /// the store-node page.
    StoreCreate { root_pid: PageId },
    /// Extent `extent` was appended to `store`. Applies to the store-node
    /// page.
    StoreExtent { extent: u32 },
    /// User insert that replaced a pre-existing ghost slot. REDO replaces
    /// the ghost again; UNDO logically removes the key.
    BtreeInsert { key: Vec<u8>, value: Vec<u8> },
    /// User insert into a fresh (non-ghost) slot.
    BtreeInsertNonghost { key: Vec<u8>, value: Vec<u8> },
    /// Whole-value replacement. UNDO restores `old`.
    BtreeUpdate {
        key: Vec<u8>,
        old: Vec<u8>,
        new: Vec<u8>,
    },
    /// Partial value overwrite at `offset`. `old` and `new` have equal
    /// length.
    BtreeOverwrite {
        key: Vec<u8>,
        offset: u16,
        old: Vec<u8>,
        new: Vec<u8>,
    },
    /// Logical delete: the named keys were marked ghost. UNDO un-marks.
    BtreeGhostMark { keys: Vec<Vec<u8>> },
    /// SSX: a ghost slot of `value_len` bytes was reserved for `key`.
    BtreeGhostReserve { key: Vec<u8>, value_len: u16 },
    /// SSX: the page was defragmented, physically reclaiming all ghosts.
    BtreeGhostReclaim { keys: Vec<Vec<u8>> },
    /// SSX, multi-page: empty child `pid` hung off parent `pid2` (or no
    /// parent when `pid2 == 0`, which formats a fresh store root).
    BtreeNorecAlloc {
        level: u8,
        fence_low: Vec<u8>,
        fence_high: Vec<u8>,
        chain_high: Vec<u8>,
    },
    /// SSX, multi-page: split of parent `pid2` into foster child `pid`.
    /// Carries both the bulk-delete descriptor (applied to the parent) and
    /// the full image of the child.
    BtreeSplit {
        move_count: u16,
        new_high_fence: Vec<u8>,
        new_chain_high: Vec<u8>,
        child_image: Vec<u8>,
    },
    /// SSX, multi-page: foster pointer of child `pid2`'s chain promoted
    /// into parent `pid`.
    BtreeFosterAdopt {
        new_child_pid: PageId,
        new_child_emlsn: Lsn,
        separator: Vec<u8>,
    },
    /// SSX: fence-key rewrite (low, high, chain-high).
    BtreeCompress {
        fence_low: Vec<u8>,
        fence_high: Vec<u8>,
        chain_high: Vec<u8>,
    },
    /// SSX, multi-page: root-height growth. The old root's contents move
    /// to new child `pid`; root `pid2` is reformatted as an interior page
    /// one level up whose leftmost child is `pid`.
    BtreeGrow {
        level: u8,
        fence_low: Vec<u8>,
        fence_high: Vec<u8>,
        child_image: Vec<u8>,
    },
    /// Full page image; bounds the per-page redo chain.
    PageImg { image: Vec<u8> },
    /// Cleaner provenance: page `pid` was written back with the batch
    /// rec-LSN below. No page effect on redo.
    PageWrite { rec_lsn: Lsn },
    /// Evictioner provenance: page `pid` left the pool at the LSN below.
    PageEvict { page_lsn: Lsn },
    /// Transaction commit point.
    TxnCommit,
    /// Transaction abort (logical rollback already applied).
    TxnAbort,
    /// Transaction fully finished; locks released.
    TxnEnd,
}

impl LogPayload {
    #[must_use]
    pub fn kind(&self) -> LogRecordKind {
        match self {
            Self::AllocPage => LogRecordKind::AllocPage,
            Self::DeallocPage => LogRecordKind::DeallocPage,
            Self::StoreCreate { .. } => LogRecordKind::StoreCreate,
            Self::StoreExtent { .. } => LogRecordKind::StoreExtent,
            Self::BtreeInsert { .. } => LogRecordKind::BtreeInsert,
            Self::BtreeInsertNonghost { .. } => LogRecordKind::BtreeInsertNonghost,
            Self::BtreeUpdate { .. } => LogRecordKind::BtreeUpdate,
            Self::BtreeOverwrite { .. } => LogRecordKind::BtreeOverwrite,
            Self::BtreeGhostMark { .. } => LogRecordKind::BtreeGhostMark,
            Self::BtreeGhostReserve { .. } => LogRecordKind::BtreeGhostReserve,
            Self::BtreeGhostReclaim { .. } => LogRecordKind::BtreeGhostReclaim,
            Self::BtreeNorecAlloc { .. } => LogRecordKind::BtreeNorecAlloc,
            Self::BtreeSplit { .. } => LogRecordKind::BtreeSplit,
            Self::BtreeFosterAdopt { .. } => LogRecordKind::BtreeFosterAdopt,
            Self::BtreeCompress { .. } => LogRecordKind::BtreeCompress,
            Self::BtreeGrow { .. } => LogRecordKind::BtreeGrow,
            Self::PageImg { .. } => LogRecordKind::PageImg,
            Self::PageWrite { .. } => LogRecordKind::PageWrite,
            Self::PageEvict { .. } => LogRecordKind::PageEvict,
            Self::TxnCommit => LogRecordKind::TxnCommit,
            Self::TxnAbort => LogRecordKind::TxnAbort,
            Self::TxnEnd => LogRecordKind::TxnEnd,
        }
    }

    /// SSX records commit by insertion and never undo.
    #[must_use]
    pub fn is_ssx(&self) -> bool {
        !matches!(
            self,
            Self::BtreeInsert { .. }
                | Self::BtreeInsertNonghost { .. }
                | Self::BtreeUpdate { .. }
                | Self::BtreeOverwrite { .. }
                | Self::BtreeGhostMark { .. }
                | Self::TxnCommit
                | Self::TxnAbort
                | Self::TxnEnd
        )
    }
}

/// A fully-described log record, ready to encode or freshly decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub txn: TxnId,
    /// Transaction chain for regular records; bitmap/stnode page chain for
    /// allocation-class SSXs; null otherwise.
    pub prev_lsn: Lsn,
    pub store: StoreId,
    /// Primary target page (0 when the record has no page).
    pub pid: PageId,
    /// Secondary page of a multi-page SSX (0 when absent).
    pub pid2: PageId,
    pub payload: LogPayload,
}

impl LogRecord {
    /// A record with no transaction and no page chain.
    #[must_use]
    pub fn system(store: StoreId, pid: PageId, payload: LogPayload) -> Self {
        Self {
            txn: TxnId::NONE,
            prev_lsn: Lsn::NULL,
            store,
            pid,
            pid2: 0,
            payload,
        }
    }

    #[must_use]
    pub fn kind(&self) -> LogRecordKind {
        self.payload.kind()
    }

    /// Encoded length including header, body, padding, and trailer.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        let raw = REC_HEADER_SIZE + self.body_len() + REC_TRAILER_SIZE;
        raw.div_ceil(REC_ALIGN) * REC_ALIGN
    }

    fn body_len(&self) -> usize {
        fn b(v: &[u8]) -> usize {
            2 + v.len()
        }
        match &self.payload {
            LogPayload::AllocPage
            | LogPayload::DeallocPage
            | LogPayload::TxnCommit
            | LogPayload::TxnAbort
            | LogPayload::TxnEnd => 0,
            LogPayload::StoreCreate { .. } | LogPayload::StoreExtent { .. } => 4,
            LogPayload::BtreeInsert { key, value }
            | LogPayload::BtreeInsertNonghost { key, value } => b(key) + b(value),
            LogPayload::BtreeUpdate { key, old, new } => b(key) + b(old) + b(new),
            LogPayload::BtreeOverwrite { key, old, new, .. } => 2 + b(key) + b(old) + b(new),
            LogPayload::BtreeGhostMark { keys } | LogPayload::BtreeGhostReclaim { keys } => {
                2 + keys.iter().map(|k| b(k)).sum::<usize>()
            }
            LogPayload::BtreeGhostReserve { key, .. } => b(key) + 2,
            LogPayload::BtreeNorecAlloc {
                fence_low,
                fence_high,
                chain_high,
                ..
            } => 1 + b(fence_low) + b(fence_high) + b(chain_high),
            LogPayload::BtreeSplit {
                new_high_fence,
                new_chain_high,
                child_image,
                ..
            } => 2 + b(new_high_fence) + b(new_chain_high) + 4 + child_image.len(),
            LogPayload::BtreeFosterAdopt { separator, .. } => 4 + 8 + b(separator),
            LogPayload::BtreeCompress {
                fence_low,
                fence_high,
                chain_high,
            } => b(fence_low) + b(fence_high) + b(chain_high),
            LogPayload::BtreeGrow {
                fence_low,
                fence_high,
                child_image,
                ..
            } => 1 + b(fence_low) + b(fence_high) + 4 + child_image.len(),
            LogPayload::PageImg { image } => 4 + image.len(),
            LogPayload::PageWrite { .. } | LogPayload::PageEvict { .. } => 8,
        }
    }

    /// Encode into a fresh buffer. The trailing LSN is left zeroed; the
    /// log manager stamps it (see [`stamp_lsn`]) once the record's
    /// position is reserved.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let len = self.encoded_len();
        let mut out = vec![0u8; len];
        write_u16(&mut out, 0, len as u16);
        out[2] = self.kind() as u8;
        // Logical-undo actions reuse regular record kinds but carry no
        // transaction; they must never be undone themselves, so the SSX
        // flag follows the transaction id too.
        out[3] = if self.payload.is_ssx() || self.txn.is_none() {
            FLAG_SSX
        } else {
            0
        };
        write_u64(&mut out, 4, self.txn.0);
        write_u64(&mut out, 12, self.prev_lsn.to_raw());
        write_u32(&mut out, 20, self.store);
        write_u32(&mut out, 24, self.pid);
        write_u32(&mut out, 28, self.pid2);
        let mut w = BodyWriter {
            buf: &mut out,
            at: REC_HEADER_SIZE,
        };
        self.encode_body(&mut w);
        out
    }

    fn encode_body(&self, w: &mut BodyWriter<'_>) {
        match &self.payload {
            LogPayload::AllocPage
            | LogPayload::DeallocPage
            | LogPayload::TxnCommit
            | LogPayload::TxnAbort
            | LogPayload::TxnEnd => {}
            LogPayload::StoreCreate { root_pid } => w.u32(*root_pid),
            LogPayload::StoreExtent { extent } => w.u32(*extent),
            LogPayload::BtreeInsert { key, value }
            | LogPayload::BtreeInsertNonghost { key, value } => {
                w.bytes(key);
                w.bytes(value);
            }
            LogPayload::BtreeUpdate { key, old, new } => {
                w.bytes(key);
                w.bytes(old);
                w.bytes(new);
            }
            LogPayload::BtreeOverwrite {
                key,
                offset,
                old,
                new,
            } => {
                w.u16(*offset);
                w.bytes(key);
                w.bytes(old);
                w.bytes(new);
            }
            LogPayload::BtreeGhostMark { keys } | LogPayload::BtreeGhostReclaim { keys } => {
                w.u16(keys.len() as u16);
                for k in keys {
                    w.bytes(k);
                }
            }
            LogPayload::BtreeGhostReserve { key, value_len } => {
                w.bytes(key);
                w.u16(*value_len);
            }
            LogPayload::BtreeNorecAlloc {
                level,
                fence_low,
                fence_high,
                chain_high,
            } => {
                w.u8(*level);
                w.bytes(fence_low);
                w.bytes(fence_high);
                w.bytes(chain_high);
            }
            LogPayload::BtreeSplit {
                move_count,
                new_high_fence,
                new_chain_high,
                child_image,
            } => {
                w.u16(*move_count);
                w.bytes(new_high_fence);
                w.bytes(new_chain_high);
                w.u32(child_image.len() as u32);
                w.raw(child_image);
            }
            LogPayload::BtreeFosterAdopt {
                new_child_pid,
                new_child_emlsn,
                separator,
            } => {
                w.u32(*new_child_pid);
                w.u64(new_child_emlsn.to_raw());
                w.bytes(separator);
            }
            LogPayload::BtreeCompress {
                fence_low,
                fence_high,
                chain_high,
            } => {
                w.bytes(fence_low);
                w.bytes(fence_high);
                w.bytes(chain_high);
            }
            LogPayload::BtreeGrow {
                level,
                fence_low,
                fence_high,
                child_image,
            } => {
                w.u8(*level);
                w.bytes(fence_low);
                w.bytes(fence_high);
                w.u32(child_image.len() as u32);
                w.raw(child_image);
            }
            LogPayload::PageImg { image } => {
                w.u32(image.len() as u32);
                w.raw(image);
            }
            LogPayload::PageWrite { rec_lsn } => w.u64(rec_lsn.to_raw()),
            LogPayload::PageEvict { page_lsn } => w.u64(page_lsn.to_raw()),
        }
    }

    /// Decode one record starting at `buf[0]`. Returns the record and its
    /// encoded length. A zero length field means "no record here" (the
    /// zero-padded tail of a partition) and decodes to `None`.
    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        if buf.len() < REC_HEADER_SIZE {
            return Ok(None);
        }
        let len = read_u16(buf, 0) as usize;
        if len == 0 {
            return Ok(None);
        }
        if len < REC_HEADER_SIZE + REC_TRAILER_SIZE || len > buf.len() {
            return Err(ShaleError::internal(format!(
                "log record length {len} out of bounds"
            )));
        }
        let kind = LogRecordKind::from_u8(buf[2])
            .ok_or_else(|| ShaleError::internal(format!("unknown log record kind {}", buf[2])))?;
        let txn = TxnId(read_u64(buf, 4));
        let prev_lsn = Lsn::from_raw(read_u64(buf, 12));
        let store = read_u32(buf, 20);
        let pid = read_u32(buf, 24);
        let pid2 = read_u32(buf, 28);
        let mut r = BodyReader {
            buf: &buf[..len - REC_TRAILER_SIZE],
            at: REC_HEADER_SIZE,
        };
        let payload = Self::decode_body(kind, &mut r)?;
        Ok(Some((
            Self {
                txn,
                prev_lsn,
                store,
                pid,
                pid2,
                payload,
            },
            len,
        )))
    }

    fn decode_body(kind: LogRecordKind, r: &mut BodyReader<'_>) -> Result<LogPayload> {
        Ok(match kind {
            LogRecordKind::AllocPage => LogPayload::AllocPage,
            LogRecordKind::DeallocPage => LogPayload::DeallocPage,
            LogRecordKind::StoreCreate => LogPayload::StoreCreate { root_pid: r.u32()? },
            LogRecordKind::StoreExtent => LogPayload::StoreExtent { extent: r.u32()? },
            LogRecordKind::BtreeInsert => LogPayload::BtreeInsert {
                key: r.bytes()?,
                value: r.bytes()?,
            },
            LogRecordKind::BtreeInsertNonghost => LogPayload::BtreeInsertNonghost {
                key: r.bytes()?,
                value: r.bytes()?,
            },
            LogRecordKind::BtreeUpdate => LogPayload::BtreeUpdate {
                key: r.bytes()?,
                old: r.bytes()?,
                new: r.bytes()?,
            },
            LogRecordKind::BtreeOverwrite => LogPayload::BtreeOverwrite {
                offset: r.u16()?,
                key: r.bytes()?,
                old: r.bytes()?,
                new: r.bytes()?,
            },
            LogRecordKind::BtreeGhostMark => LogPayload::BtreeGhostMark { keys: r.keys()? },
            LogRecordKind::BtreeGhostReserve => LogPayload::BtreeGhostReserve {
                key: r.bytes()?,
                value_len: r.u16()?,
            },
            LogRecordKind::BtreeGhostReclaim => LogPayload::BtreeGhostReclaim { keys: r.keys()? },
            LogRecordKind::BtreeNorecAlloc => LogPayload::BtreeNorecAlloc {
                level: r.u8()?,
                fence_low: r.bytes()?,
                fence_high: r.bytes()?,
                chain_high: r.bytes()?,
            },
            LogRecordKind::BtreeSplit => LogPayload::BtreeSplit {
                move_count: r.u16()?,
                new_high_fence: r.bytes()?,
                new_chain_high: r.bytes()?,
                child_image: r.sized()?,
            },
            LogRecordKind::BtreeFosterAdopt => LogPayload::BtreeFosterAdopt {
                new_child_pid: r.u32()?,
                new_child_emlsn: Lsn::from_raw(r.u64()?),
                separator: r.bytes()?,
            },
            LogRecordKind::BtreeCompress => LogPayload::BtreeCompress {
                fence_low: r.bytes()?,
                fence_high: r.bytes()?,
                chain_high: r.bytes()?,
            },
            LogRecordKind::BtreeGrow => LogPayload::BtreeGrow {
                level: r.u8()?,
                fence_low: r.bytes()?,
                fence_high: r.bytes()?,
                child_image: r.sized()?,
            },
            LogRecordKind::PageImg => LogPayload::PageImg { image: r.sized()? },
            LogRecordKind::PageWrite => LogPayload::PageWrite {
                rec_lsn: Lsn::from_raw(r.u64()?),
            },
            LogRecordKind::PageEvict => LogPayload::PageEvict {
                page_lsn: Lsn::from_raw(r.u64()?),
            },
            LogRecordKind::TxnCommit => LogPayload::TxnCommit,
            LogRecordKind::TxnAbort => LogPayload::TxnAbort,
            LogRecordKind::TxnEnd => LogPayload::TxnEnd,
        })
    }

    /// Apply this record's physical REDO to `page`, which must be one of
    /// the pages the record names. The caller checks the LSN skip rule and
    /// stamps the page LSN afterwards.
    pub fn apply_redo(&self, page: &mut dyn RedoPage) -> Result<()> {
        let target = page.pid();
        match &self.payload {
            LogPayload::BtreeInsert { key, value } => page.replace_ghost(key, value),
            LogPayload::BtreeInsertNonghost { key, value } => page.insert_nonghost(key, value),
            LogPayload::BtreeUpdate { key, new, .. } => page.replace_value(key, new),
            LogPayload::BtreeOverwrite {
                key, offset, new, ..
            } => page.overwrite_value(key, *offset, new),
            LogPayload::BtreeGhostMark { keys } => {
                for key in keys {
                    page.mark_ghost(key)?;
                }
                Ok(())
            }
            LogPayload::BtreeGhostReserve { key, value_len } => {
                page.reserve_ghost(key, *value_len as usize)
            }
            LogPayload::BtreeGhostReclaim { .. } => page.reclaim_ghosts(),
            LogPayload::BtreeNorecAlloc {
                level,
                fence_low,
                fence_high,
                chain_high,
            } => {
                if target == self.pid {
                    page.format_empty(self.store, *level, fence_low, fence_high, chain_high)
                } else {
                    page.accept_empty_child(self.pid, fence_low)
                }
            }
            LogPayload::BtreeSplit {
                move_count,
                new_high_fence,
                new_chain_high,
                child_image,
            } => {
                if target == self.pid {
                    page.format_steal(child_image)
                } else {
                    page.split_parent_apply(
                        *move_count as usize,
                        self.pid,
                        new_high_fence,
                        new_chain_high,
                    )
                }
            }
            LogPayload::BtreeFosterAdopt {
                new_child_pid,
                new_child_emlsn,
                separator,
            } => {
                if target == self.pid {
                    page.adopt_apply_parent(*new_child_pid, *new_child_emlsn, separator)
                } else {
                    page.adopt_apply_child()
                }
            }
            LogPayload::BtreeCompress {
                fence_low,
                fence_high,
                chain_high,
            } => page.compress(fence_low, fence_high, chain_high),
            LogPayload::BtreeGrow {
                level,
                fence_low,
                fence_high,
                child_image,
            } => {
                if target == self.pid {
                    page.format_steal(child_image)
                } else {
                    page.grow_root_apply(*level, fence_low, fence_high, self.pid)
                }
            }
            LogPayload::PageImg { image } => page.format_steal(image),
            LogPayload::PageWrite { .. } | LogPayload::PageEvict { .. } => Ok(()),
            LogPayload::AllocPage
            | LogPayload::DeallocPage
            | LogPayload::StoreCreate { .. }
            | LogPayload::StoreExtent { .. }
            | LogPayload::TxnCommit
            | LogPayload::TxnAbort
            | LogPayload::TxnEnd => Err(ShaleError::internal(format!(
                "{:?} has no page redo",
                self.kind()
            ))),
        }
    }

    /// Apply this record's logical UNDO. SSX and control records have no
    /// undo and return an invariant error if asked.
    pub fn apply_undo(&self, undo: &mut dyn UndoOps) -> Result<()> {
        match &self.payload {
            LogPayload::BtreeInsert { key, .. } | LogPayload::BtreeInsertNonghost { key, .. } => {
                undo.remove_as_undo(self.store, key)
            }
            LogPayload::BtreeUpdate { key, old, .. } => undo.update_as_undo(self.store, key, old),
            LogPayload::BtreeOverwrite {
                key, offset, old, ..
            } => undo.overwrite_as_undo(self.store, key, old, *offset),
            LogPayload::BtreeGhostMark { keys } => {
                for key in keys {
                    undo.undo_ghost_mark(self.store, key)?;
                }
                Ok(())
            }
            _ => Err(ShaleError::internal(format!(
                "{:?} is not undoable",
                self.kind()
            ))),
        }
    }
}

/// Stamp the trailing LSN copy into an encoded record.
pub fn stamp_lsn(encoded: &mut [u8], lsn: Lsn) {
    let at = encoded.len() - REC_TRAILER_SIZE;
    write_u64(encoded, at, lsn.to_raw());
}

/// Read the trailing LSN copy back out of an encoded record.
#[must_use]
pub fn trailing_lsn(encoded: &[u8]) -> Lsn {
    Lsn::from_raw(read_u64(encoded, encoded.len() - REC_TRAILER_SIZE))
}

/// Physical-redo capability of a page image.
///
/// The log crate knows nothing about page layout; the B-tree implements
/// this for its pages, and recovery hands a latched frame in. One trait
/// instead of one log-constructor per page-handle type.
pub trait RedoPage {
    fn pid(&self) -> PageId;
    fn replace_ghost(&mut self, key: &[u8], value: &[u8]) -> Result<()>;
    fn insert_nonghost(&mut self, key: &[u8], value: &[u8]) -> Result<()>;
    fn replace_value(&mut self, key: &[u8], new: &[u8]) -> Result<()>;
    fn overwrite_value(&mut self, key: &[u8], offset: u16, bytes: &[u8]) -> Result<()>;
    fn mark_ghost(&mut self, key: &[u8]) -> Result<()>;
    fn reserve_ghost(&mut self, key: &[u8], value_len: usize) -> Result<()>;
    fn reclaim_ghosts(&mut self) -> Result<()>;
    /// Overwrite this page with a logged full image (pid is preserved).
    fn format_steal(&mut self, image: &[u8]) -> Result<()>;
    /// Format this page as a fresh, empty B-tree page.
    fn format_empty(
        &mut self,
        store: StoreId,
        level: u8,
        fence_low: &[u8],
        fence_high: &[u8],
        chain_high: &[u8],
    ) -> Result<()>;
    /// Parent half of a norec-alloc: link the empty child as foster.
    fn accept_empty_child(&mut self, child: PageId, child_fence_low: &[u8]) -> Result<()>;
    /// Parent half of a split: drop the moved tail and link the foster
    /// child.
    fn split_parent_apply(
        &mut self,
        move_count: usize,
        child: PageId,
        new_high_fence: &[u8],
        new_chain_high: &[u8],
    ) -> Result<()>;
    /// Parent half of an adopt: insert the separator entry.
    fn adopt_apply_parent(&mut self, child: PageId, emlsn: Lsn, separator: &[u8]) -> Result<()>;
    /// Child half of an adopt: clear the foster pointer.
    fn adopt_apply_child(&mut self) -> Result<()>;
    fn compress(&mut self, fence_low: &[u8], fence_high: &[u8], chain_high: &[u8]) -> Result<()>;
    /// Root half of a grow: become an interior page whose leftmost child
    /// is `child`.
    fn grow_root_apply(
        &mut self,
        level: u8,
        fence_low: &[u8],
        fence_high: &[u8],
        child: PageId,
    ) -> Result<()>;
}

/// Logical-undo capability. Implementations re-traverse from the root and
/// must not take user locks (the aborting transaction already holds them).
pub trait UndoOps {
    fn remove_as_undo(&mut self, store: StoreId, key: &[u8]) -> Result<()>;
    fn update_as_undo(&mut self, store: StoreId, key: &[u8], old: &[u8]) -> Result<()>;
    fn overwrite_as_undo(&mut self, store: StoreId, key: &[u8], old: &[u8], offset: u16)
        -> Result<()>;
    fn undo_ghost_mark(&mut self, store: StoreId, key: &[u8]) -> Result<()>;
}

struct BodyWriter<'a> {
    buf: &'a mut [u8],
    at: usize,
}

impl BodyWriter<'_> {
    fn u8(&mut self, v: u8) {
        self.buf[self.at] = v;
        self.at += 1;
    }
    fn u16(&mut self, v: u16) {
        write_u16(self.buf, self.at, v);
        self.at += 2;
    }
    fn u32(&mut self, v: u32) {
        write_u32(self.buf, self.at, v);
        self.at += 4;
    }
    fn u64(&mut self, v: u64) {
        write_u64(self.buf, self.at, v);
        self.at += 8;
    }
    fn raw(&mut self, v: &[u8]) {
        self.buf[self.at..self.at + v.len()].copy_from_slice(v);
        self.at += v.len();
    }
    fn bytes(&mut self, v: &[u8]) {
        self.u16(v.len() as u16);
        self.raw(v);
    }
}

struct BodyReader<'a> {
    buf: &'a [u8],
    at: usize,
}

impl BodyReader<'_> {
    fn need(&self, n: usize) -> Result<()> {
        if self.at + n > self.buf.len() {
            return Err(ShaleError::internal("log record body truncated"));
        }
        Ok(())
    }
    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        let v = self.buf[self.at];
        self.at += 1;
        Ok(v)
    }
    fn u16(&mut self) -> Result<u16> {
        self.need(2)?;
        let v = read_u16(self.buf, self.at);
        self.at += 2;
        Ok(v)
    }
    fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        let v = read_u32(self.buf, self.at);
        self.at += 4;
        Ok(v)
    }
    fn u64(&mut self) -> Result<u64> {
        self.need(8)?;
        let v = read_u64(self.buf, self.at);
        self.at += 8;
        Ok(v)
    }
    fn bytes(&mut self) -> Result<Vec<u8>> {
        let n = self.u16()? as usize;
        self.need(n)?;
        let v = self.buf[self.at..self.at + n].to_vec();
        self.at += n;
        Ok(v)
    }
    fn sized(&mut self) -> Result<Vec<u8>> {
        let n = self.u32()? as usize;
        self.need(n)?;
        let v = self.buf[self.at..self.at + n].to_vec();
        self.at += n;
        Ok(v)
    }
    fn keys(&mut self) -> Result<Vec<Vec<u8>>> {
        let n = self.u16()? as usize;
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.bytes()?);
        }
        Ok(out)
    }
}
