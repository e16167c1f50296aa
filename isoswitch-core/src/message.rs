//! Message representation for the routing pipeline.
//!
//! A [`Message`] carries the raw frame payload, the decoded field map and
//! everything the pipeline resolves along the way (channel, direction,
//! correlation key). The property bag is a side channel; the transport uses
//! it to record which destination connection a request was sent through.

use bytes::Bytes;
use hashbrown::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::connection::{Connection, SocketRole};

/// Protocol field identifier. Field 0 is the message type indicator (MTI).
pub type FieldId = u16;

/// The type indicator field.
pub const MTI_FIELD: FieldId = 0;

/// Separator between the components of a correlation key.
pub const KEY_SEPARATOR: char = '|';

/// Decoded field values keyed by field number.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldMap {
    fields: HashMap<FieldId, String>,
}

impl FieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: FieldId, value: impl Into<String>) -> Option<String> {
        self.fields.insert(id, value.into())
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, id: FieldId, value: impl Into<String>) -> Self {
        self.insert(id, value);
        self
    }

    #[inline]
    pub fn get(&self, id: FieldId) -> Option<&str> {
        self.fields.get(&id).map(String::as_str)
    }

    #[inline]
    pub fn contains(&self, id: FieldId) -> bool {
        self.fields.contains_key(&id)
    }

    pub fn remove(&mut self, id: FieldId) -> Option<String> {
        self.fields.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Field ids in ascending order.
    pub fn ids(&self) -> Vec<FieldId> {
        let mut ids: Vec<FieldId> = self.fields.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = (FieldId, &str)> {
        self.fields.iter().map(|(id, v)| (*id, v.as_str()))
    }
}

impl FromIterator<(FieldId, String)> for FieldMap {
    fn from_iter<I: IntoIterator<Item = (FieldId, String)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// Logical message direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[non_exhaustive]
pub enum Direction {
    /// Request: forwarded, origin remembered for the reply
    Inbound,
    /// Reply: delivered to the origin of the matching request
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbound => f.write_str("INBOUND"),
            Self::Outbound => f.write_str("OUTBOUND"),
        }
    }
}

/// Side-channel properties attached to a message.
#[derive(Debug, Default, Clone)]
pub struct MessageProperties {
    /// Connection the transport sent this message through
    pub destination: Option<Arc<Connection>>,
}

/// Unit flowing through the routing pipeline.
#[derive(Debug, Clone)]
pub struct Message {
    /// Frame payload exactly as received (without length prefix)
    pub raw: Bytes,
    /// Decoded fields
    pub fields: FieldMap,
    /// Channel the originating socket belongs to
    pub channel: String,
    /// Resolved direction (set by the receive stage)
    pub direction: Option<Direction>,
    /// Resolved correlation key (set by the receive stage)
    pub correlation_key: Option<String>,
    /// Connection the message arrived on
    pub origin: Arc<Connection>,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub received_at: Instant,
    pub properties: MessageProperties,
}

impl Message {
    /// Build a message that arrived on `origin`.
    pub fn new(raw: Bytes, fields: FieldMap, origin: Arc<Connection>) -> Self {
        Self {
            raw,
            fields,
            channel: origin.socket().channel.clone(),
            direction: None,
            correlation_key: None,
            local_addr: origin.local_addr(),
            remote_addr: origin.remote_addr(),
            received_at: Instant::now(),
            properties: MessageProperties::default(),
            origin,
        }
    }

    /// Role of the socket the message arrived on.
    #[inline]
    pub fn origin_role(&self) -> SocketRole {
        self.origin.socket().role
    }

    /// Type indicator value, if present.
    #[inline]
    pub fn mti(&self) -> Option<&str> {
        self.fields.get(MTI_FIELD)
    }
}

/// Build a correlation key: channel followed by the ordered field values.
///
/// Returns the first missing field id on failure.
pub fn correlation_key(
    channel: &str,
    fields: &FieldMap,
    ids: &[FieldId],
) -> Result<String, FieldId> {
    let mut key = String::with_capacity(channel.len() + ids.len() * 13);
    key.push_str(channel);
    for &id in ids {
        let value = fields.get(id).ok_or(id)?;
        key.push(KEY_SEPARATOR);
        key.push_str(value);
    }
    Ok(key)
}
