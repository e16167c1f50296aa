//! Key-hash selection.
//!
//! The routing key's hash modulo the candidate count picks the index. The
//! same key maps to the same candidate for a fixed candidate count. This is
//! plain modulo hashing, not a ring: membership changes may remap keys.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::candidates::{Candidate, VersionedCandidates};
use crate::error::{GatewayError, Result};
use crate::message::FieldId;

/// Field-hash selection.
#[derive(Debug, Clone, Copy)]
pub struct HashStrategy {
    field: FieldId,
}

impl HashStrategy {
    pub const fn new(field: FieldId) -> Self {
        Self { field }
    }

    /// Message field the routing key is read from.
    #[inline]
    pub const fn field(&self) -> FieldId {
        self.field
    }

    pub fn next<T>(&self, snapshot: &VersionedCandidates<T>, key: Option<&str>) -> Result<T>
    where
        T: Candidate + Clone,
    {
        if snapshot.is_empty() {
            return Err(GatewayError::NoCandidates);
        }
        let key = key.ok_or(GatewayError::MissingRoutingKey(self.field))?;
        let index = (stable_hash(key) % snapshot.len() as u64) as usize;
        Ok(snapshot.items()[index].clone())
    }
}

// DefaultHasher::new() uses fixed keys, so results are stable within a build.
fn stable_hash(key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}
