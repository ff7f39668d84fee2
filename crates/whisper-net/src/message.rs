//! Message model carried between peers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::WhisperError;
use crate::node::NodeId;
use crate::route::Endpoint;

/// Unique identifier for a message.
///
/// Used for deduplication and to correlate replies. The nil id means
/// "unassigned" and is what [`Default`] yields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Creates a new random message ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a message ID from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the raw bytes of the message ID.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Returns true for the unassigned id.
    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for MessageId {
    type Err = WhisperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| WhisperError::Validation(format!("invalid message id '{s}': {e}")))
    }
}

/// Control flags a message can carry. Flags combine freely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    /// Introduces the sender to the receiver.
    Handshake,
    /// Asks the receiver for an acknowledgement.
    Syn,
    /// Acknowledges a `Syn`.
    Ack,
    /// Epidemic broadcast; receivers re-multicast.
    Gossip,
    /// Expects a `Response`.
    Request,
    /// Answers a `Request`.
    Response,
}

/// Routing header: origin, destination and the hops taken so far.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Routing {
    /// Originating node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<NodeId>,
    /// Destination node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst: Option<NodeId>,
    /// Hops recorded so far, oldest first.
    #[serde(default)]
    pub route: Vec<Endpoint>,
}

impl Routing {
    /// Returns the most recent hop.
    #[must_use]
    pub fn last(&self) -> Option<&Endpoint> {
        self.route.last()
    }

    /// Returns every node named in the route.
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.route.iter().map(|endpoint| endpoint.node)
    }
}

/// A message exchanged between peers.
///
/// The payload is opaque bytes and travels outside the JSON header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Message identifier.
    pub id: MessageId,
    /// Control flags.
    #[serde(default)]
    pub kinds: BTreeSet<Kind>,
    /// Topic the message is published on.
    #[serde(default)]
    pub topic: String,
    /// Routing header.
    #[serde(default)]
    pub routing: Routing,
    /// Opaque application payload.
    #[serde(skip)]
    pub payload: Vec<u8>,
}

impl Message {
    /// Creates an empty message with a fresh id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: MessageId::new(),
            ..Self::default()
        }
    }

    /// Sets the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Sets the topic.
    #[must_use]
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// Adds a kind flag.
    #[must_use]
    pub fn with_kind(mut self, kind: Kind) -> Self {
        self.kinds.insert(kind);
        self
    }

    /// Returns true if the message carries the flag.
    #[must_use]
    pub fn has(&self, kind: Kind) -> bool {
        self.kinds.contains(&kind)
    }

    /// Returns true for pure handshake traffic, i.e. a message whose kinds
    /// are a non-empty subset of `{Handshake, Syn}` that includes `Handshake`.
    #[must_use]
    pub fn is_handshake_only(&self) -> bool {
        self.has(Kind::Handshake)
            && self
                .kinds
                .iter()
                .all(|kind| matches!(kind, Kind::Handshake | Kind::Syn))
    }
}
