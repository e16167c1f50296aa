//! Static routing configuration.
//!
//! [`Metadata`] is an immutable snapshot of channels and profiles. It is
//! replaced wholesale on reload; [`Metadata::diff`] tells the gateway which
//! channels were added, removed or changed.

use hashbrown::HashMap;
use std::collections::BTreeSet;

use crate::connection::{SocketKey, SocketRole};
use crate::endpoint::{AccessList, SocketEndpoint};
use crate::error::{GatewayError, Result};
use crate::message::{FieldId, FieldMap, Direction, MTI_FIELD};
use crate::strategy::StrategyKind;

/// Listener side of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Listen host; `0.0.0.0`, `::` and `*` bind every interface
    pub host: String,
    pub port: u16,
    /// Allowed remotes. Empty admits everyone.
    pub allowed: Vec<SocketEndpoint>,
    pub strategy: StrategyKind,
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            allowed: Vec::new(),
            strategy: StrategyKind::default(),
        }
    }

    #[must_use]
    pub fn allow(mut self, endpoint: SocketEndpoint) -> Self {
        self.allowed.push(endpoint);
        self
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    /// Allow-list the listener pool enforces.
    pub fn access_list(&self) -> AccessList {
        AccessList::for_listener(self.allowed.clone())
    }

    /// Whether this config differs from `other` only in its allow-list.
    pub fn differs_only_in_allowed(&self, other: &Self) -> bool {
        self.host == other.host
            && self.port == other.port
            && self.strategy == other.strategy
            && self.allowed != other.allowed
    }
}

/// Outbound side of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub targets: Vec<SocketEndpoint>,
    pub strategy: StrategyKind,
}

impl ClientConfig {
    pub fn new(targets: Vec<SocketEndpoint>) -> Self {
        Self {
            targets,
            strategy: StrategyKind::default(),
        }
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }
}

/// A logical routing channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub name: String,
    pub server: Option<ServerConfig>,
    pub client: Option<ClientConfig>,
    /// Name of the [`Profile`] used to classify and correlate messages
    pub profile: String,
}

impl ChannelConfig {
    pub fn new(name: impl Into<String>, profile: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            server: None,
            client: None,
            profile: profile.into(),
        }
    }

    #[must_use]
    pub fn with_server(mut self, server: ServerConfig) -> Self {
        self.server = Some(server);
        self
    }

    #[must_use]
    pub fn with_client(mut self, client: ClientConfig) -> Self {
        self.client = Some(client);
        self
    }

    /// Socket keys this channel defines.
    pub fn socket_keys(&self) -> Vec<SocketKey> {
        let mut keys = Vec::with_capacity(2);
        if self.server.is_some() {
            keys.push(SocketKey::new(SocketRole::Server, self.name.clone()));
        }
        if self.client.is_some() {
            keys.push(SocketKey::new(SocketRole::Client, self.name.clone()));
        }
        keys
    }

    /// Whether a reload from `self` to `new` can be applied by swapping the
    /// server allow-list in place.
    pub fn only_allow_list_changed(&self, new: &Self) -> bool {
        match (&self.server, &new.server) {
            (Some(old), Some(next)) => {
                self.profile == new.profile
                    && self.client == new.client
                    && old.differs_only_in_allowed(next)
            }
            _ => false,
        }
    }
}

/// Message classification and correlation rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub name: String,
    /// Field holding the type indicator (the MTI by default)
    pub type_field: FieldId,
    /// Type values per direction, checked in order
    pub directions: Vec<(Direction, BTreeSet<String>)>,
    /// Fields whose values, in order, form the correlation key
    pub correlation_fields: Vec<FieldId>,
}

impl Profile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_field: MTI_FIELD,
            directions: Vec::new(),
            correlation_fields: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_type_field(mut self, field: FieldId) -> Self {
        self.type_field = field;
        self
    }

    /// Map type values to a direction.
    #[must_use]
    pub fn direction<I, S>(mut self, direction: Direction, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values = values.into_iter().map(Into::into);
        match self.directions.iter_mut().find(|(d, _)| *d == direction) {
            Some((_, set)) => set.extend(values),
            None => self.directions.push((direction, values.collect())),
        }
        self
    }

    #[must_use]
    pub fn correlate_on(mut self, fields: impl IntoIterator<Item = FieldId>) -> Self {
        self.correlation_fields = fields.into_iter().collect();
        self
    }

    /// Direction for a type value, first match wins.
    pub fn classify(&self, value: &str) -> Option<Direction> {
        self.directions
            .iter()
            .find(|(_, values)| values.contains(value))
            .map(|(direction, _)| *direction)
    }

    /// First field this profile needs that `fields` lacks.
    pub fn missing_field(&self, fields: &FieldMap) -> Option<FieldId> {
        std::iter::once(self.type_field)
            .chain(self.correlation_fields.iter().copied())
            .find(|id| !fields.contains(*id))
    }
}

/// Complete routing configuration snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub channels: Vec<ChannelConfig>,
    pub profiles: HashMap<String, Profile>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_channel(mut self, channel: ChannelConfig) -> Self {
        self.channels.push(channel);
        self
    }

    #[must_use]
    pub fn with_profile(mut self, profile: Profile) -> Self {
        self.profiles.insert(profile.name.clone(), profile);
        self
    }

    pub fn channel(&self, name: &str) -> Option<&ChannelConfig> {
        self.channels.iter().find(|c| c.name == name)
    }

    pub fn profile(&self, name: &str) -> Option<&Profile> {
        self.profiles.get(name)
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        let mut names = BTreeSet::new();
        for channel in &self.channels {
            if channel.name.is_empty() {
                return Err(GatewayError::invalid_config("channel with empty name"));
            }
            if !names.insert(channel.name.as_str()) {
                return Err(GatewayError::invalid_config(format!(
                    "duplicate channel {}",
                    channel.name
                )));
            }
            if channel.server.is_none() && channel.client.is_none() {
                return Err(GatewayError::invalid_config(format!(
                    "channel {} has neither server nor client",
                    channel.name
                )));
            }
            if !self.profiles.contains_key(&channel.profile) {
                return Err(GatewayError::invalid_config(format!(
                    "channel {} references unknown profile {}",
                    channel.name, channel.profile
                )));
            }
            if let Some(client) = &channel.client {
                if client.targets.is_empty() {
                    return Err(GatewayError::invalid_config(format!(
                        "channel {} client has no targets",
                        channel.name
                    )));
                }
            }
        }

        for profile in self.profiles.values() {
            if profile.directions.is_empty() {
                return Err(GatewayError::invalid_config(format!(
                    "profile {} maps no directions",
                    profile.name
                )));
            }
            if profile.correlation_fields.is_empty() {
                return Err(GatewayError::invalid_config(format!(
                    "profile {} has no correlation fields",
                    profile.name
                )));
            }
        }
        Ok(())
    }

    /// Channel-level changes from `self` to `new`.
    pub fn diff(&self, new: &Self) -> MetadataDiff {
        let mut diff = MetadataDiff::default();
        for next in &new.channels {
            match self.channel(&next.name) {
                None => diff.added.push(next.clone()),
                Some(old) if old != next => diff.modified.push((old.clone(), next.clone())),
                Some(_) => {}
            }
        }
        for old in &self.channels {
            if new.channel(&old.name).is_none() {
                diff.removed.push(old.clone());
            }
        }
        diff
    }
}

/// Result of [`Metadata::diff`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataDiff {
    pub added: Vec<ChannelConfig>,
    pub removed: Vec<ChannelConfig>,
    /// `(old, new)` pairs of channels whose configuration changed
    pub modified: Vec<(ChannelConfig, ChannelConfig)>,
}

impl MetadataDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}
