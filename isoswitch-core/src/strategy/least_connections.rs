//! Least-connections selection.
//!
//! Picks the candidate with the fewest in-flight messages. Ties go to the
//! smallest candidate id so results are reproducible under equal load.

use crate::candidates::{Candidate, VersionedCandidates};
use crate::error::{GatewayError, Result};

/// Load-aware selection over in-flight counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastConnections;

impl LeastConnections {
    pub fn next<T>(&self, snapshot: &VersionedCandidates<T>) -> Result<T>
    where
        T: Candidate + Clone,
    {
        snapshot
            .items()
            .iter()
            .min_by_key(|c| (c.in_flight(), c.candidate_id()))
            .cloned()
            .ok_or(GatewayError::NoCandidates)
    }
}
