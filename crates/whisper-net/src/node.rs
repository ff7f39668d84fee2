//! Node identity and seed parsing.
//!
//! - [`NodeId`]: stable identifier for a peer, backed by a UUID
//! - [`Node`]: a node id plus every address the node has been seen on
//! - [`parse_seeds`]: parses `"<node-id>@<ip>:<port>"` bootstrap lists

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use uuid::Uuid;

use crate::address::Address;
use crate::error::WhisperError;

/// Unique identifier for a node in the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Creates a new random node ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a node ID from a UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for NodeId {
    type Err = WhisperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| WhisperError::Validation(format!("invalid node id '{s}': {e}")))
    }
}

/// A node and the set of addresses it is known by.
///
/// Identity is the [`NodeId`]: two `Node`s with the same id are equal no matter
/// which addresses they carry, since addresses churn and identity does not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    id: NodeId,
    addresses: BTreeSet<Address>,
}

impl Node {
    /// Creates a node with the given addresses.
    #[must_use]
    pub fn new(id: NodeId, addresses: impl IntoIterator<Item = Address>) -> Self {
        Self {
            id,
            addresses: addresses.into_iter().collect(),
        }
    }

    /// Creates a node with no known addresses.
    #[must_use]
    pub const fn bare(id: NodeId) -> Self {
        Self {
            id,
            addresses: BTreeSet::new(),
        }
    }

    /// Returns the node ID.
    #[must_use]
    pub const fn id(&self) -> NodeId {
        self.id
    }

    /// Returns every known address.
    #[must_use]
    pub const fn addresses(&self) -> &BTreeSet<Address> {
        &self.addresses
    }

    /// Returns the lowest known address, if any.
    #[must_use]
    pub fn primary_address(&self) -> Option<Address> {
        self.addresses.first().copied()
    }

    /// Adds an address if it isn't already known.
    pub fn add_address(&mut self, address: Address) {
        self.addresses.insert(address);
    }

    /// Merges the other node's addresses into this one.
    ///
    /// Returns the number of newly learned addresses.
    pub fn merge(&mut self, other: &Self) -> usize {
        let before = self.addresses.len();
        self.addresses.extend(other.addresses.iter().copied());
        self.addresses.len() - before
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.primary_address() {
            Some(addr) => write!(f, "{}@{}", self.id, addr),
            None => write!(f, "{}", self.id),
        }
    }
}

impl FromStr for Node {
    type Err = WhisperError;

    /// Parses `"<node-id>@<ip>:<port>"` or a bare `"<node-id>"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().split_once('@') {
            Some((id, addr)) => Ok(Self::new(id.parse()?, [addr.parse()?])),
            None => Ok(Self::bare(s.parse()?)),
        }
    }
}

/// Parses a comma-separated list of seeds.
///
/// Empty entries are skipped, so trailing commas are tolerated.
///
/// # Errors
///
/// Returns a validation error if any entry is malformed.
pub fn parse_seeds(seeds: &str) -> Result<Vec<Node>, WhisperError> {
    seeds
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    #[test]
    fn node_id_display_roundtrip() {
        let id = NodeId::new();
        assert_eq!(id.to_string().parse::<NodeId>().unwrap(), id);
    }

    #[test]
    fn node_id_rejects_garbage() {
        assert!(matches!(
            "not-a-uuid".parse::<NodeId>(),
            Err(WhisperError::Validation(_))
        ));
    }

    #[test]
    fn node_equality_ignores_addresses() {
        let id = NodeId::new();
        let a = Node::new(id, [addr("127.0.0.1:8000")]);
        let b = Node::new(id, [addr("10.0.0.1:9000")]);
        assert_eq!(a, b);
        assert_ne!(a, Node::new(NodeId::new(), [addr("127.0.0.1:8000")]));
    }

    #[test]
    fn node_merge_unions_addresses() {
        let id = NodeId::new();
        let mut a = Node::new(id, [addr("127.0.0.1:8000")]);
        let b = Node::new(id, [addr("127.0.0.1:8000"), addr("10.0.0.1:9000")]);

        assert_eq!(a.merge(&b), 1);
        assert_eq!(a.addresses().len(), 2);
        assert_eq!(a.merge(&b), 0);
    }

    #[test]
    fn node_parses_seed_with_address() {
        let id = NodeId::new();
        let node: Node = format!("{id}@127.0.0.1:7000").parse().unwrap();
        assert_eq!(node.id(), id);
        assert_eq!(node.primary_address(), Some(addr("127.0.0.1:7000")));
        assert_eq!(node.to_string(), format!("{id}@127.0.0.1:7000"));
    }

    #[test]
    fn node_parses_bare_id() {
        let id = NodeId::new();
        let node: Node = id.to_string().parse().unwrap();
        assert_eq!(node.id(), id);
        assert!(node.addresses().is_empty());
    }

    #[test]
    fn parse_seeds_handles_lists() {
        let (a, b) = (NodeId::new(), NodeId::new());
        let seeds = parse_seeds(&format!(" {a}@127.0.0.1:1 , {b}@[::1]:2,")).unwrap();
        assert_eq!(seeds.len(), 2);
        assert_eq!(seeds[0].id(), a);
        assert_eq!(seeds[1].primary_address(), Some(addr("[::1]:2")));

        assert!(parse_seeds("").unwrap().is_empty());
        assert!(parse_seeds("bogus@127.0.0.1:1").is_err());
        assert!(parse_seeds(&format!("{a}@nowhere")).is_err());
    }
}
