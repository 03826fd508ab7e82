//! Cache capacity policy.

use std::num::NonZeroUsize;

/// How the cache bounds its memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Keep every order ever written. Memory grows with the order count.
    #[default]
    Unbounded,

    /// Keep at most this many orders, evicting the least recently written.
    MaxEntries(NonZeroUsize),
}

impl EvictionPolicy {
    /// Builds a policy from an optional entry limit. `None` and `Some(0)` are unbounded.
    pub fn from_max_entries(max_entries: Option<usize>) -> Self {
        max_entries
            .and_then(NonZeroUsize::new)
            .map_or(Self::Unbounded, Self::MaxEntries)
    }

    /// Returns the entry limit, if any.
    pub fn capacity(&self) -> Option<usize> {
        match self {
            Self::Unbounded => None,
            Self::MaxEntries(max) => Some(max.get()),
        }
    }
}

impl std::fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unbounded => f.write_str("unbounded"),
            Self::MaxEntries(max) => write!(f, "max_entries({max})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_or_missing_limit_is_unbounded() {
        assert_eq!(EvictionPolicy::from_max_entries(None), EvictionPolicy::Unbounded);
        assert_eq!(EvictionPolicy::from_max_entries(Some(0)), EvictionPolicy::Unbounded);
    }

    #[test]
    fn positive_limit_is_bounded() {
        let policy = EvictionPolicy::from_max_entries(Some(3));
        assert_eq!(policy.capacity(), Some(3));
        assert_eq!(policy.to_string(), "max_entries(3)");
    }
}
