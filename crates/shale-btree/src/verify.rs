//! Tree invariant checker (test support).
//!
//! Verifies, for every page: fence ordering (`fence_low <= keys <
//! fence_high`), strict slot ordering, foster-chain termination and
//! coverage (a chain seamlessly tiles its head's `[fence_low,
//! chain_high)`), separator/child range agreement, and level
//! consistency.

use shale_bufpool::LatchMode;
use shale_error::{Result, ShaleError};
use shale_types::PageId;

use crate::page;
use crate::tree::BtreeContext;

/// What a full check saw.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TreeStats {
    pub pages: usize,
    pub records: usize,
    pub ghosts: usize,
    /// Root level (leaves are 0).
    pub root_level: u8,
}

const MAX_FOSTER_CHAIN: usize = 1024;

/// Snapshot of one page, taken under a shared latch then released so
/// recursion never piles up latches.
struct PageSnap {
    pid: PageId,
    level: u8,
    fence_low: Vec<u8>,
    fence_high: Option<Vec<u8>>,
    chain_high: Option<Vec<u8>>,
    foster: Option<PageId>,
    pid0: Option<PageId>,
    keys: Vec<Vec<u8>>,
    ghosts: usize,
    children: Vec<PageId>,
}

fn snap(ctx: &BtreeContext, pid: PageId) -> Result<PageSnap> {
    let guard = ctx.pool.fix(pid, LatchMode::Sh, true)?;
    let bytes = guard.page().as_bytes();
    let n = page::nrecs(bytes);
    let mut keys = Vec::with_capacity(n);
    let mut children = Vec::new();
    let mut ghosts = 0usize;
    for slot in 0..n {
        keys.push(page::slot_key(bytes, slot).to_vec());
        if page::is_ghost(bytes, slot) {
            ghosts += 1;
        }
        if !page::is_leaf(bytes) {
            children.push(page::slot_child(bytes, slot).0);
        }
    }
    Ok(PageSnap {
        pid,
        level: page::level(bytes),
        fence_low: page::fence_low(bytes).to_vec(),
        fence_high: page::fence_high(bytes).map(<[u8]>::to_vec),
        chain_high: page::chain_high(bytes).map(<[u8]>::to_vec),
        foster: page::foster(bytes).map(|f| f.pid),
        pid0: page::pid0(bytes).map(|(p, _)| p),
        keys,
        ghosts,
        children,
    })
}

fn fail(pid: PageId, what: impl Into<String>) -> ShaleError {
    ShaleError::corrupt(pid, what.into())
}

/// Check the subtree whose foster chain starts at `pid` and must cover
/// exactly `[low, high)`.
fn check_chain(
    ctx: &BtreeContext,
    pid: PageId,
    low: &[u8],
    high: Option<&[u8]>,
    expected_level: Option<u8>,
    stats: &mut TreeStats,
) -> Result<()> {
    let mut cur = pid;
    let mut cur_low = low.to_vec();
    for _ in 0..MAX_FOSTER_CHAIN {
        let s = snap(ctx, cur)?;
        stats.pages += 1;
        stats.records += s.keys.len();
        stats.ghosts += s.ghosts;

        if let Some(level) = expected_level {
            if s.level != level {
                return Err(fail(cur, format!("level {} where {level} expected", s.level)));
            }
        }
        if s.fence_low != cur_low {
            return Err(fail(cur, "fence_low does not meet the previous page"));
        }
        if s.chain_high.as_deref() != high {
            return Err(fail(cur, "chain_high does not match the subtree bound"));
        }

        // Slot ordering and fence containment.
        for w in s.keys.windows(2) {
            if w[0] >= w[1] {
                return Err(fail(cur, "slot keys out of order"));
            }
        }
        for key in &s.keys {
            if key.as_slice() < s.fence_low.as_slice() {
                return Err(fail(cur, "key below fence_low"));
            }
            if let Some(h) = &s.fence_high {
                if key >= h {
                    return Err(fail(cur, "key at or above fence_high"));
                }
            }
        }

        // Interior: recurse into child ranges within this page.
        if s.level > 0 {
            let Some(pid0) = s.pid0 else {
                return Err(fail(cur, "interior page without pid0"));
            };
            let mut child_low = s.fence_low.clone();
            for (i, child) in std::iter::once(pid0).chain(s.children.iter().copied()).enumerate() {
                let child_high = if i < s.keys.len() {
                    Some(s.keys[i].as_slice())
                } else {
                    s.fence_high.as_deref()
                };
                check_chain(ctx, child, &child_low, child_high, Some(s.level - 1), stats)?;
                if let Some(h) = child_high {
                    child_low = h.to_vec();
                }
            }
        }

        match s.foster {
            None => {
                if s.fence_high.as_deref() != high {
                    return Err(fail(cur, "chain ends below its upper bound"));
                }
                return Ok(());
            }
            Some(foster_pid) => {
                let Some(h) = s.fence_high else {
                    return Err(fail(cur, "foster page with supremum fence_high"));
                };
                cur_low = h;
                cur = foster_pid;
            }
        }
    }
    Err(fail(pid, "foster chain does not terminate"))
}

/// Full-tree invariant check.
pub fn check(ctx: &BtreeContext, root: PageId) -> Result<TreeStats> {
    let mut stats = TreeStats::default();
    let root_snap = snap(ctx, root)?;
    stats.root_level = root_snap.level;
    let high = root_snap.chain_high.as_deref().map(<[u8]>::to_vec);
    check_chain(
        ctx,
        root,
        &root_snap.fence_low,
        high.as_deref(),
        Some(root_snap.level),
        &mut stats,
    )?;
    Ok(stats)
}
