//! Log sequence numbers.
//!
//! An [`Lsn`] addresses a byte in the write-ahead log as a
//! `(partition, offset)` pair packed into a `u64`: the partition number in
//! the high 32 bits, the byte offset within that partition file in the low
//! 32 bits. Packing gives the total order for free and lets the log hand
//! LSNs across threads as plain atomics.

use std::fmt;

/// A log sequence number: `(partition << 32) | offset`.
///
/// `Lsn::NULL` (all zeroes) is the designated null value; partition
/// numbering starts at 1 so no real record ever collides with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Lsn(u64);

impl Lsn {
    /// The null LSN. Orders before every real LSN.
    pub const NULL: Self = Self(0);

    /// The largest representable LSN.
    pub const MAX: Self = Self(u64::MAX);

    #[inline]
    #[must_use]
    pub const fn new(partition: u32, offset: u32) -> Self {
        Self(((partition as u64) << 32) | offset as u64)
    }

    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn to_raw(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn partition(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    #[must_use]
    pub const fn offset(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// The LSN `bytes` further into the same partition.
    #[inline]
    #[must_use]
    pub const fn advance(self, bytes: u32) -> Self {
        Self::new(self.partition(), self.offset() + bytes)
    }

    /// The first LSN of a partition.
    #[inline]
    #[must_use]
    pub const fn partition_start(partition: u32) -> Self {
        Self::new(partition, 0)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("lsn:null")
        } else {
            write!(f, "lsn:{}.{}", self.partition(), self.offset())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_follows_partition_then_offset() {
        assert!(Lsn::new(1, 100) < Lsn::new(1, 101));
        assert!(Lsn::new(1, u32::MAX) < Lsn::new(2, 0));
        assert!(Lsn::NULL < Lsn::new(1, 0));
    }

    #[test]
    fn pack_round_trip() {
        let lsn = Lsn::new(7, 0xDEAD_BEEF);
        assert_eq!(lsn.partition(), 7);
        assert_eq!(lsn.offset(), 0xDEAD_BEEF);
        assert_eq!(Lsn::from_raw(lsn.to_raw()), lsn);
    }

    #[test]
    fn advance_stays_in_partition() {
        let lsn = Lsn::new(3, 512);
        assert_eq!(lsn.advance(512), Lsn::new(3, 1024));
    }
}
