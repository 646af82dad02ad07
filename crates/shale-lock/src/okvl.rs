//! Lock modes: element modes, key+gap pairs, store intent modes.

use std::fmt;

/// An element lock mode: nothing, shared, or exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LockBase {
    #[default]
    N,
    S,
    X,
}

impl LockBase {
    /// Element compatibility: `N` goes with everything, `S` with `S`.
    #[must_use]
    pub fn compatible(self, other: Self) -> bool {
        match (self, other) {
            (Self::N, _) | (_, Self::N) => true,
            (Self::S, Self::S) => true,
            _ => false,
        }
    }

    /// Least upper bound of two element modes.
    #[must_use]
    pub fn union(self, other: Self) -> Self {
        match (self, other) {
            (Self::X, _) | (_, Self::X) => Self::X,
            (Self::S, _) | (_, Self::S) => Self::S,
            _ => Self::N,
        }
    }
}

/// A key-value lock: one element mode for the key, one for the gap
/// below its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LockMode {
    pub key: LockBase,
    pub gap: LockBase,
}

impl LockMode {
    /// No lock at all.
    pub const NN: Self = Self::new(LockBase::N, LockBase::N);
    /// Shared key, shared gap: read the key and protect its gap.
    pub const SS: Self = Self::new(LockBase::S, LockBase::S);
    /// Shared key only.
    pub const SN: Self = Self::new(LockBase::S, LockBase::N);
    /// Shared gap only (lock the would-be position of an absent key).
    pub const NS: Self = Self::new(LockBase::N, LockBase::S);
    /// Exclusive key, exclusive gap.
    pub const XX: Self = Self::new(LockBase::X, LockBase::X);
    /// Exclusive key only.
    pub const XN: Self = Self::new(LockBase::X, LockBase::N);
    /// Exclusive gap only.
    pub const NX: Self = Self::new(LockBase::N, LockBase::X);

    #[must_use]
    pub const fn new(key: LockBase, gap: LockBase) -> Self {
        Self { key, gap }
    }

    /// Two requests on the same lock id conflict when either element
    /// pair conflicts.
    #[must_use]
    pub fn compatible(self, other: Self) -> bool {
        self.key.compatible(other.key) && self.gap.compatible(other.gap)
    }

    /// Mode union, used when a transaction re-acquires a lock it holds.
    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self {
            key: self.key.union(other.key),
            gap: self.gap.union(other.gap),
        }
    }

    /// True when this mode locks nothing.
    #[must_use]
    pub fn is_empty(self) -> bool {
        self == Self::NN
    }

    /// True when `self` already covers `other` (no strengthening needed).
    #[must_use]
    pub fn covers(self, other: Self) -> bool {
        self.union(other) == self
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = |b: LockBase| match b {
            LockBase::N => 'N',
            LockBase::S => 'S',
            LockBase::X => 'X',
        };
        write!(f, "{}{}", c(self.key), c(self.gap))
    }
}

/// Store-level intent modes taken on a cursor's or operation's first
/// touch of a store. Intents never conflict with each other; they exist
/// so a future absolute store lock (out of scope here) could detect
/// activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntentMode {
    IS,
    IX,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_compatibility() {
        assert!(LockBase::N.compatible(LockBase::X));
        assert!(LockBase::S.compatible(LockBase::S));
        assert!(!LockBase::S.compatible(LockBase::X));
        assert!(!LockBase::X.compatible(LockBase::X));
    }

    #[test]
    fn pair_conflicts_on_either_element() {
        assert!(LockMode::SS.compatible(LockMode::SS));
        assert!(LockMode::SN.compatible(LockMode::NS));
        assert!(!LockMode::SS.compatible(LockMode::XN));
        assert!(!LockMode::NS.compatible(LockMode::NX));
        assert!(LockMode::NN.compatible(LockMode::XX));
    }

    #[test]
    fn union_and_covers() {
        assert_eq!(LockMode::SN.union(LockMode::NS), LockMode::SS);
        assert_eq!(LockMode::SS.union(LockMode::XN), LockMode {
            key: LockBase::X,
            gap: LockBase::S
        });
        assert!(LockMode::XX.covers(LockMode::SS));
        assert!(!LockMode::SN.covers(LockMode::SS));
    }

    #[test]
    fn display_names() {
        assert_eq!(LockMode::SS.to_string(), "SS");
        assert_eq!(LockMode::XN.to_string(), "XN");
        assert_eq!(LockMode::NN.to_string(), "NN");
    }
}
