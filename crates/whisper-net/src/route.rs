//! Directed routes between nodes and the per-hop endpoints a message records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::error::WhisperError;
use crate::node::NodeId;

/// A directed edge: `snode` reaches `dnode` by sending from `saddr` to `daddr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Route {
    snode: NodeId,
    saddr: Address,
    dnode: NodeId,
    daddr: Address,
}

impl Route {
    /// Creates a route.
    ///
    /// # Errors
    ///
    /// Returns a validation error if both ends are the same node.
    pub fn new(
        snode: NodeId,
        saddr: Address,
        dnode: NodeId,
        daddr: Address,
    ) -> Result<Self, WhisperError> {
        if snode == dnode {
            return Err(WhisperError::Validation(format!(
                "route endpoints must differ, got {snode} twice"
            )));
        }
        Ok(Self {
            snode,
            saddr,
            dnode,
            daddr,
        })
    }

    /// Source node.
    #[must_use]
    pub const fn snode(&self) -> NodeId {
        self.snode
    }

    /// Address the source sends from.
    #[must_use]
    pub const fn saddr(&self) -> Address {
        self.saddr
    }

    /// Destination node.
    #[must_use]
    pub const fn dnode(&self) -> NodeId {
        self.dnode
    }

    /// Address the destination is reached on.
    #[must_use]
    pub const fn daddr(&self) -> Address {
        self.daddr
    }

    /// Returns the same edge pointing the other way.
    #[must_use]
    pub const fn reversed(&self) -> Self {
        Self {
            snode: self.dnode,
            saddr: self.daddr,
            dnode: self.snode,
            daddr: self.saddr,
        }
    }
}

/// One hop recorded in a message's route.
///
/// `saddr` is the address the node sent from as observed by the next hop,
/// `daddr` is the address the node was reached on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// The node at this hop.
    pub node: NodeId,
    /// Address the node sent from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saddr: Option<Address>,
    /// Address the node was reached on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daddr: Option<Address>,
    /// When the node handled the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Endpoint {
    /// Creates an endpoint with no addresses or timestamp.
    #[must_use]
    pub const fn new(node: NodeId) -> Self {
        Self {
            node,
            saddr: None,
            daddr: None,
            timestamp: None,
        }
    }

    /// Sets the sending address.
    #[must_use]
    pub const fn with_saddr(mut self, saddr: Address) -> Self {
        self.saddr = Some(saddr);
        self
    }

    /// Sets the receiving address.
    #[must_use]
    pub const fn with_daddr(mut self, daddr: Address) -> Self {
        self.daddr = Some(daddr);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    #[test]
    fn route_rejects_self_loop() {
        let id = NodeId::new();
        let result = Route::new(id, addr("127.0.0.1:1"), id, addr("127.0.0.1:2"));
        assert!(matches!(result, Err(WhisperError::Validation(_))));
    }

    #[test]
    fn route_reversed_swaps_ends() {
        let (a, b) = (NodeId::new(), NodeId::new());
        let route = Route::new(a, addr("127.0.0.1:1"), b, addr("127.0.0.1:2")).unwrap();
        let back = route.reversed();

        assert_eq!(back.snode(), b);
        assert_eq!(back.saddr(), addr("127.0.0.1:2"));
        assert_eq!(back.dnode(), a);
        assert_eq!(back.daddr(), addr("127.0.0.1:1"));
        assert_eq!(back.reversed(), route);
    }

    #[test]
    fn endpoint_omits_unset_fields() {
        let id = NodeId::new();
        let json = serde_json::to_value(Endpoint::new(id)).unwrap();
        assert_eq!(json, serde_json::json!({ "node": id.to_string() }));

        let full = Endpoint::new(id)
            .with_saddr(addr("127.0.0.1:1"))
            .with_daddr(addr("127.0.0.1:2"));
        let back: Endpoint = serde_json::from_str(&serde_json::to_string(&full).unwrap()).unwrap();
        assert_eq!(back, full);
    }
}
