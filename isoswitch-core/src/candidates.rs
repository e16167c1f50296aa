//! Versioned candidate snapshots.
//!
//! A [`VersionedCandidates`] is an immutable list of selectable candidates
//! stamped with a version number. Pools publish a fresh snapshot whenever
//! their live set changes; strategies compare versions to decide whether
//! their cached derived state (e.g. a weighted cycle) is stale.

use std::sync::Arc;

use crate::connection::Connection;

/// Something a selection strategy can pick.
pub trait Candidate {
    /// Stable identity, used for deterministic tie-breaking.
    fn candidate_id(&self) -> u64;

    /// Selection weight (the strategies treat 0 as 1).
    fn weight(&self) -> u32;

    /// Priority tier; larger values are preferred.
    fn priority(&self) -> u32;

    /// Current load signal.
    fn in_flight(&self) -> usize;
}

impl Candidate for Arc<Connection> {
    #[inline]
    fn candidate_id(&self) -> u64 {
        self.id().as_u64()
    }

    #[inline]
    fn weight(&self) -> u32 {
        self.endpoint().weight()
    }

    #[inline]
    fn priority(&self) -> u32 {
        self.endpoint().priority()
    }

    #[inline]
    fn in_flight(&self) -> usize {
        Connection::in_flight(self)
    }
}

/// Immutable, version-stamped candidate list.
#[derive(Debug, Clone)]
pub struct VersionedCandidates<T> {
    version: u64,
    items: Vec<T>,
}

impl<T> VersionedCandidates<T> {
    pub fn new(version: u64, items: Vec<T>) -> Self {
        Self { version, items }
    }

    /// Version 0, no candidates.
    pub fn empty() -> Self {
        Self {
            version: 0,
            items: Vec::new(),
        }
    }

    #[inline]
    pub const fn version(&self) -> u64 {
        self.version
    }

    #[inline]
    pub fn items(&self) -> &[T] {
        &self.items
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T: Clone> VersionedCandidates<T> {
    /// Union of several snapshots, in the order given.
    ///
    /// The merged version is the sum of the part versions. Each part's
    /// version only grows, so the sum changes whenever any part does.
    pub fn merge<'a, I>(parts: I) -> Self
    where
        I: IntoIterator<Item = &'a VersionedCandidates<T>>,
        T: 'a,
    {
        let mut version = 0u64;
        let mut items = Vec::new();
        for part in parts {
            version = version.wrapping_add(part.version);
            items.extend(part.items.iter().cloned());
        }
        Self { version, items }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_sums_versions() {
        let a = VersionedCandidates::new(3, vec![1, 2]);
        let b = VersionedCandidates::new(5, vec![9]);
        let merged = VersionedCandidates::merge([&a, &b]);
        assert_eq!(merged.version(), 8);
        assert_eq!(merged.items(), &[1, 2, 9]);
    }

    #[test]
    fn test_empty() {
        let empty: VersionedCandidates<u8> = VersionedCandidates::empty();
        assert!(empty.is_empty());
        assert_eq!(empty.version(), 0);
    }
}
