//! Channel selection strategies.
//!
//! Every strategy consumes a [`VersionedCandidates`] snapshot plus an
//! optional per-message routing key and returns one candidate, failing with
//! `NoCandidates` on an empty snapshot. The set is closed: round robin
//! (priority + weight aware), least connections, and key hash.

mod hash;
mod least_connections;
mod round_robin;

pub use hash::HashStrategy;
pub use least_connections::LeastConnections;
pub use round_robin::RoundRobin;

use crate::candidates::{Candidate, VersionedCandidates};
use crate::error::Result;
use crate::message::{FieldId, FieldMap};

/// Configured strategy choice for a server or client definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StrategyKind {
    /// Weighted round robin over the highest priority tier
    #[default]
    RoundRobin,
    /// Fewest in-flight messages
    LeastConnections,
    /// Hash of a message field
    Hash { field: FieldId },
}

/// A strategy instance, owned by one transport.
#[derive(Debug)]
pub enum Strategy {
    RoundRobin(RoundRobin),
    LeastConnections(LeastConnections),
    Hash(HashStrategy),
}

impl Strategy {
    pub fn new(kind: StrategyKind) -> Self {
        match kind {
            StrategyKind::RoundRobin => Self::RoundRobin(RoundRobin::new()),
            StrategyKind::LeastConnections => Self::LeastConnections(LeastConnections),
            StrategyKind::Hash { field } => Self::Hash(HashStrategy::new(field)),
        }
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            Self::RoundRobin(_) => StrategyKind::RoundRobin,
            Self::LeastConnections(_) => StrategyKind::LeastConnections,
            Self::Hash(h) => StrategyKind::Hash { field: h.field() },
        }
    }

    /// Routing key this strategy derives from a message's fields.
    pub fn routing_key<'a>(&self, fields: &'a FieldMap) -> Option<&'a str> {
        match self {
            Self::Hash(h) => fields.get(h.field()),
            _ => None,
        }
    }

    /// Pick one candidate.
    pub fn next<T>(&self, candidates: &VersionedCandidates<T>, key: Option<&str>) -> Result<T>
    where
        T: Candidate + Clone,
    {
        match self {
            Self::RoundRobin(rr) => rr.next(candidates),
            Self::LeastConnections(lc) => lc.next(candidates),
            Self::Hash(h) => h.next(candidates, key),
        }
    }

    /// Pick one candidate for a message, extracting the routing key first.
    pub fn select<T>(&self, candidates: &VersionedCandidates<T>, fields: &FieldMap) -> Result<T>
    where
        T: Candidate + Clone,
    {
        self.next(candidates, self.routing_key(fields))
    }
}
