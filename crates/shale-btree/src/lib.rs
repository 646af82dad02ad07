//! Foster B-link tree.
//!
//! Pages may temporarily carry a *foster child*: a right sibling holding
//! the upper half of the page's key range that the parent does not know
//! about yet. Traversal follows foster pointers like B-link next
//! pointers; a later adoption promotes the foster child's separator into
//! the parent. Every structural change (split, adopt, grow, compress,
//! ghost reclaim) commits atomically as a single-log system transaction.
//!
//! Module map: [`page`] is the byte-level page layout and every
//! page-capability operation; [`tree`] is traversal, the user operations,
//! and the SMOs; [`cursor`] is the range-scan cursor; [`verify`] checks
//! the tree invariants for tests.

pub mod cursor;
pub mod page;
#[cfg(test)]
pub(crate) mod testutil;
pub mod tree;
pub mod verify;

pub use cursor::BtCursor;
pub use tree::{BtreeContext, TraverseMode, TxnCtx};
