//! Channel names for records in the shared log.
//!
//! A record's channel fully determines how a consumer routes it:
//!
//! - `{prefix}#{nsp}#` carries broadcasts to a whole namespace
//! - `{prefix}#{nsp}#{room}#` carries broadcasts aimed at exactly one room
//! - `{prefix}-request#{nsp}#` and `{prefix}-response#{nsp}#` carry control traffic
//! - `{prefix}-nodes#` carries node presence and is shared by every namespace
//!
//! Consumers match by prefix, so the namespace data channel also matches
//! every room channel below it.

/// Prefix used when the configuration does not name one.
pub const DEFAULT_PREFIX: &str = "socket.io";

/// Separator between channel segments. Namespaces may not contain it.
pub const SEPARATOR: char = '#';

/// What a channel is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Data,
    Request,
    Response,
}

/// Precomputed channel names for one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelNames {
    namespace: String,
    data: String,
    request: String,
    response: String,
}

impl ChannelNames {
    pub fn new(prefix: &str, namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            data: format!("{prefix}#{namespace}#"),
            request: format!("{prefix}-request#{namespace}#"),
            response: format!("{prefix}-response#{namespace}#"),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Namespace-wide data channel. This is also the subscription channel.
    pub fn data(&self) -> &str {
        &self.data
    }

    /// Data channel for broadcasts aimed at a single room.
    pub fn room(&self, room: &str) -> String {
        format!("{}{room}{SEPARATOR}", self.data)
    }

    pub fn request(&self) -> &str {
        &self.request
    }

    pub fn response(&self) -> &str {
        &self.response
    }

    pub fn for_purpose(&self, purpose: Purpose, room: Option<&str>) -> String {
        match (purpose, room) {
            (Purpose::Data, Some(room)) => self.room(room),
            (Purpose::Data, None) => self.data.clone(),
            (Purpose::Request, _) => self.request.clone(),
            (Purpose::Response, _) => self.response.clone(),
        }
    }

    /// Classifies a record channel against this namespace.
    ///
    /// Control channels match exactly; data channels match by prefix so
    /// room-scoped records are included.
    pub fn purpose_of(&self, candidate: &str) -> Option<Purpose> {
        if candidate == self.request {
            Some(Purpose::Request)
        } else if candidate == self.response {
            Some(Purpose::Response)
        } else if matches(candidate, &self.data) {
            Some(Purpose::Data)
        } else {
            None
        }
    }

    /// Extracts the room designation from a data channel of this namespace.
    ///
    /// Returns `None` when the candidate is not one of this namespace's data
    /// channels, `Some(None)` for a namespace-wide record and `Some(Some(room))`
    /// for a room-scoped one.
    pub fn room_of<'a>(&self, candidate: &'a str) -> Option<Option<&'a str>> {
        let rest = candidate.strip_prefix(self.data.as_str())?;
        if rest.is_empty() {
            return Some(None);
        }
        rest.strip_suffix(SEPARATOR).map(Some)
    }
}

/// Channel carrying node presence announcements for every namespace.
pub fn nodes_channel(prefix: &str) -> String {
    format!("{prefix}-nodes{SEPARATOR}")
}

/// A subscriber channel matches every record channel that starts with it.
pub fn matches(candidate: &str, subscribed: &str) -> bool {
    candidate.starts_with(subscribed)
}

/// Namespaces become channel segments, so they must not contain the separator.
pub fn is_valid_namespace(namespace: &str) -> bool {
    !namespace.is_empty() && !namespace.contains(SEPARATOR)
}
