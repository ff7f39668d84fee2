//! Routing graph of known nodes.
//!
//! Nodes live in an arena keyed by [`NodeId`]; directed [`Route`] edges live
//! in an adjacency map keyed by `(src, dst)`. Nodes and routes are never
//! removed, only marked unreachable. Ordered maps keep traversal
//! deterministic.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use rand::seq::SliceRandom;
use tracing::debug;

use crate::error::WhisperError;
use crate::node::{Node, NodeId};
use crate::route::{Endpoint, Route};

#[derive(Debug, Clone)]
struct NodeRecord {
    node: Node,
    reachable: bool,
}

/// Directed routing graph, always containing the local node.
#[derive(Debug, Clone)]
pub struct Topology {
    local: NodeId,
    nodes: BTreeMap<NodeId, NodeRecord>,
    successors: BTreeMap<NodeId, BTreeMap<NodeId, Route>>,
    predecessors: BTreeMap<NodeId, BTreeSet<NodeId>>,
}

impl Topology {
    /// Creates a topology holding only the local node.
    #[must_use]
    pub fn new(local: Node) -> Self {
        let id = local.id();
        let mut nodes = BTreeMap::new();
        nodes.insert(
            id,
            NodeRecord {
                node: local,
                reachable: true,
            },
        );
        Self {
            local: id,
            nodes,
            successors: BTreeMap::new(),
            predecessors: BTreeMap::new(),
        }
    }

    /// Id of the local node.
    #[must_use]
    pub const fn local(&self) -> NodeId {
        self.local
    }

    /// Adds a node, or merges its addresses into the known entry.
    pub fn add_node(&mut self, node: &Node) {
        match self.nodes.get_mut(&node.id()) {
            Some(record) => {
                record.node.merge(node);
            }
            None => {
                debug!(node = %node.id(), "node discovered");
                self.nodes.insert(
                    node.id(),
                    NodeRecord {
                        node: node.clone(),
                        reachable: true,
                    },
                );
            }
        }
    }

    /// Looks up a node.
    ///
    /// # Errors
    ///
    /// Returns [`WhisperError::NodeNotFound`] if the node is unknown.
    pub fn get_node(&self, id: NodeId) -> Result<&Node, WhisperError> {
        self.nodes
            .get(&id)
            .map(|record| &record.node)
            .ok_or(WhisperError::NodeNotFound(id))
    }

    /// Returns true if the node is known.
    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Adds or replaces a directed edge, registering both ends.
    pub fn add_route(&mut self, route: Route) {
        self.add_node(&Node::new(route.snode(), [route.saddr()]));
        self.add_node(&Node::new(route.dnode(), [route.daddr()]));
        self.successors
            .entry(route.snode())
            .or_default()
            .insert(route.dnode(), route);
        self.predecessors
            .entry(route.dnode())
            .or_default()
            .insert(route.snode());
    }

    /// Returns the direct edge from `snode` to `dnode`.
    ///
    /// # Errors
    ///
    /// Returns [`WhisperError::RouteNotFound`] without a direct edge.
    pub fn get_route(&self, snode: NodeId, dnode: NodeId) -> Result<&Route, WhisperError> {
        self.successors
            .get(&snode)
            .and_then(|edges| edges.get(&dnode))
            .ok_or(WhisperError::RouteNotFound {
                from: snode,
                to: dnode,
            })
    }

    /// Returns the first hop of a shortest path from `snode` to `dnode`.
    ///
    /// The search treats edges as undirected; a hop only known in the reverse
    /// direction is returned flipped so it always leaves `snode`.
    ///
    /// # Errors
    ///
    /// Returns [`WhisperError::RouteNotFound`] if `dnode` is unreachable or
    /// equal to `snode`.
    pub fn get_shortest_route(&self, snode: NodeId, dnode: NodeId) -> Result<Route, WhisperError> {
        let not_found = WhisperError::RouteNotFound {
            from: snode,
            to: dnode,
        };
        if snode == dnode {
            return Err(not_found);
        }

        let mut parent: HashMap<NodeId, NodeId> = HashMap::new();
        let mut queue = VecDeque::from([snode]);
        parent.insert(snode, snode);

        while let Some(current) = queue.pop_front() {
            if current == dnode {
                break;
            }
            for next in self.neighbors(current) {
                if !parent.contains_key(&next) {
                    parent.insert(next, current);
                    queue.push_back(next);
                }
            }
        }

        if !parent.contains_key(&dnode) {
            return Err(not_found);
        }

        // Walk back from the destination to the hop adjacent to the source.
        let mut hop = dnode;
        while let Some(&prev) = parent.get(&hop) {
            if prev == snode {
                break;
            }
            hop = prev;
        }

        if let Ok(route) = self.get_route(snode, hop) {
            return Ok(*route);
        }
        self.get_route(hop, snode)
            .map(Route::reversed)
            .map_err(|_| not_found)
    }

    /// Picks up to `n` distinct direct successors of `snode` uniformly at
    /// random, skipping any in `exclude`.
    #[must_use]
    pub fn get_random_successor_nodes(
        &self,
        snode: NodeId,
        n: usize,
        exclude: &BTreeSet<NodeId>,
    ) -> Vec<Node> {
        let Some(edges) = self.successors.get(&snode) else {
            return Vec::new();
        };
        let candidates: Vec<&Node> = edges
            .keys()
            .filter(|id| !exclude.contains(id))
            .filter_map(|id| self.nodes.get(id).map(|record| &record.node))
            .collect();

        candidates
            .choose_multiple(&mut rand::thread_rng(), n)
            .map(|node| (*node).clone())
            .collect()
    }

    /// Learns the nodes and edges a message's route reveals.
    ///
    /// Every consecutive pair of endpoints yields a forward edge from the
    /// sender's `saddr` to the receiver's `daddr`; the final hop also yields
    /// the reverse edge.
    ///
    /// # Errors
    ///
    /// Returns a validation error if there are fewer than two endpoints, a hop
    /// is missing an address, or a hop names the same node twice.
    pub fn update_routes(&mut self, endpoints: &[Endpoint]) -> Result<(), WhisperError> {
        if endpoints.len() < 2 {
            return Err(WhisperError::Validation(format!(
                "route needs at least 2 endpoints, got {}",
                endpoints.len()
            )));
        }

        let mut learned = Vec::with_capacity(endpoints.len());
        for pair in endpoints.windows(2) {
            let (from, to) = (&pair[0], &pair[1]);
            let saddr = from.saddr.ok_or_else(|| {
                WhisperError::Validation(format!("endpoint {} has no sending address", from.node))
            })?;
            let daddr = to.daddr.ok_or_else(|| {
                WhisperError::Validation(format!("endpoint {} has no receiving address", to.node))
            })?;
            learned.push(Route::new(from.node, saddr, to.node, daddr)?);
        }

        if let Some(last) = learned.last() {
            learned.push(last.reversed());
        }
        for route in learned {
            self.add_route(route);
        }
        Ok(())
    }

    /// Marks a node as reachable.
    pub fn mark_reachable(&mut self, id: NodeId) {
        if let Some(record) = self.nodes.get_mut(&id) {
            record.reachable = true;
        }
    }

    /// Marks a node as unreachable.
    pub fn mark_unreachable(&mut self, id: NodeId) {
        if let Some(record) = self.nodes.get_mut(&id) {
            record.reachable = false;
        }
    }

    /// Returns true if the node is known and not marked unreachable.
    #[must_use]
    pub fn is_reachable(&self, id: NodeId) -> bool {
        self.nodes.get(&id).is_some_and(|record| record.reachable)
    }

    /// Number of known nodes, the local node included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false: the local node is always present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterates known nodes in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values().map(|record| &record.node)
    }

    /// Iterates every directed edge.
    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.successors.values().flat_map(BTreeMap::values)
    }

    fn neighbors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        let out = self
            .successors
            .get(&id)
            .into_iter()
            .flat_map(BTreeMap::keys)
            .copied();
        let incoming = self
            .predecessors
            .get(&id)
            .into_iter()
            .flat_map(BTreeSet::iter)
            .copied();
        out.chain(incoming)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;

    fn addr(port: u16) -> Address {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn node(port: u16) -> Node {
        Node::new(NodeId::new(), [addr(port)])
    }

    fn edge(a: &Node, b: &Node) -> Route {
        Route::new(
            a.id(),
            a.primary_address().unwrap(),
            b.id(),
            b.primary_address().unwrap(),
        )
        .unwrap()
    }

    // ========== Node Tests ==========

    #[test]
    fn new_topology_holds_local_node() {
        let local = node(1);
        let topo = Topology::new(local.clone());
        assert_eq!(topo.len(), 1);
        assert!(!topo.is_empty());
        assert_eq!(topo.local(), local.id());
        assert!(topo.is_reachable(local.id()));
    }

    #[test]
    fn add_node_is_idempotent_and_merges() {
        let local = node(1);
        let mut topo = Topology::new(local);
        let peer = node(2);
        topo.add_node(&peer);
        topo.add_node(&Node::new(peer.id(), [addr(3)]));

        assert_eq!(topo.len(), 2);
        assert_eq!(topo.get_node(peer.id()).unwrap().addresses().len(), 2);
    }

    #[test]
    fn get_unknown_node_fails() {
        let topo = Topology::new(node(1));
        let id = NodeId::new();
        assert!(matches!(topo.get_node(id), Err(WhisperError::NodeNotFound(x)) if x == id));
    }

    #[test]
    fn reachability_flags() {
        let mut topo = Topology::new(node(1));
        let peer = node(2);
        topo.add_node(&peer);

        topo.mark_unreachable(peer.id());
        assert!(!topo.is_reachable(peer.id()));
        topo.mark_reachable(peer.id());
        assert!(topo.is_reachable(peer.id()));
        assert!(!topo.is_reachable(NodeId::new()));
    }

    // ========== Route Tests ==========

    #[test]
    fn add_route_registers_both_ends() {
        let (a, b) = (node(1), node(2));
        let mut topo = Topology::new(a.clone());
        topo.add_route(edge(&a, &b));

        assert!(topo.contains(b.id()));
        assert_eq!(topo.get_route(a.id(), b.id()).unwrap().daddr(), addr(2));
        assert!(topo.get_route(b.id(), a.id()).is_err());
        assert_eq!(topo.routes().count(), 1);
    }

    #[test]
    fn add_route_overwrites_edge() {
        let (a, b) = (node(1), node(2));
        let mut topo = Topology::new(a.clone());
        topo.add_route(edge(&a, &b));
        topo.add_route(Route::new(a.id(), addr(1), b.id(), addr(9)).unwrap());

        assert_eq!(topo.get_route(a.id(), b.id()).unwrap().daddr(), addr(9));
        assert_eq!(topo.routes().count(), 1);
    }

    #[test]
    fn shortest_route_direct_edge() {
        let (a, b) = (node(1), node(2));
        let mut topo = Topology::new(a.clone());
        topo.add_route(edge(&a, &b));

        let route = topo.get_shortest_route(a.id(), b.id()).unwrap();
        assert_eq!(route, edge(&a, &b));
    }

    #[test]
    fn shortest_route_returns_first_hop() {
        let (a, b, c, d) = (node(1), node(2), node(3), node(4));
        let mut topo = Topology::new(a.clone());
        topo.add_route(edge(&a, &b));
        topo.add_route(edge(&b, &c));
        topo.add_route(edge(&c, &d));

        let route = topo.get_shortest_route(a.id(), d.id()).unwrap();
        assert_eq!(route.snode(), a.id());
        assert_eq!(route.dnode(), b.id());
    }

    #[test]
    fn shortest_route_flips_reverse_edge() {
        let (a, b) = (node(1), node(2));
        let mut topo = Topology::new(a.clone());
        topo.add_route(edge(&b, &a));

        let route = topo.get_shortest_route(a.id(), b.id()).unwrap();
        assert_eq!(route.snode(), a.id());
        assert_eq!(route.saddr(), addr(1));
        assert_eq!(route.dnode(), b.id());
        assert_eq!(route.daddr(), addr(2));
    }

    #[test]
    fn shortest_route_prefers_fewer_hops() {
        let (a, b, c, d) = (node(1), node(2), node(3), node(4));
        let mut topo = Topology::new(a.clone());
        topo.add_route(edge(&a, &b));
        topo.add_route(edge(&b, &c));
        topo.add_route(edge(&c, &d));
        topo.add_route(edge(&a, &c));

        let route = topo.get_shortest_route(a.id(), d.id()).unwrap();
        assert_eq!(route.dnode(), c.id());
    }

    #[test]
    fn shortest_route_unreachable_or_self() {
        let (a, b) = (node(1), node(2));
        let mut topo = Topology::new(a.clone());
        topo.add_node(&b);

        assert!(matches!(
            topo.get_shortest_route(a.id(), b.id()),
            Err(WhisperError::RouteNotFound { .. })
        ));
        assert!(matches!(
            topo.get_shortest_route(a.id(), a.id()),
            Err(WhisperError::RouteNotFound { .. })
        ));
    }

    // ========== Successor Sampling Tests ==========

    #[test]
    fn successors_respect_exclude_and_limit() {
        let a = node(1);
        let peers: Vec<Node> = (2..7).map(node).collect();
        let mut topo = Topology::new(a.clone());
        for p in &peers {
            topo.add_route(edge(&a, p));
        }

        let exclude: BTreeSet<NodeId> = [peers[0].id(), peers[1].id()].into();
        let picked = topo.get_random_successor_nodes(a.id(), 10, &exclude);
        assert_eq!(picked.len(), 3);
        assert!(picked.iter().all(|n| !exclude.contains(&n.id())));

        assert_eq!(topo.get_random_successor_nodes(a.id(), 2, &BTreeSet::new()).len(), 2);
        assert!(topo.get_random_successor_nodes(NodeId::new(), 2, &BTreeSet::new()).is_empty());
    }

    // ========== update_routes Tests ==========

    fn hop(n: &Node, saddr: Option<u16>, daddr: Option<u16>) -> Endpoint {
        Endpoint {
            node: n.id(),
            saddr: saddr.map(addr),
            daddr: daddr.map(addr),
            timestamp: None,
        }
    }

    #[test]
    fn update_routes_needs_two_endpoints() {
        let a = node(1);
        let mut topo = Topology::new(a.clone());
        assert!(matches!(
            topo.update_routes(&[hop(&a, Some(1), None)]),
            Err(WhisperError::Validation(_))
        ));
        assert!(topo.update_routes(&[]).is_err());
    }

    #[test]
    fn update_routes_needs_addresses() {
        let (a, b) = (node(1), node(2));
        let mut topo = Topology::new(a.clone());
        let missing_saddr = [hop(&a, None, None), hop(&b, None, Some(2))];
        let missing_daddr = [hop(&a, Some(1), None), hop(&b, None, None)];

        assert!(matches!(topo.update_routes(&missing_saddr), Err(WhisperError::Validation(_))));
        assert!(matches!(topo.update_routes(&missing_daddr), Err(WhisperError::Validation(_))));
        assert_eq!(topo.len(), 1);
    }

    #[test]
    fn update_routes_adds_forward_and_final_reverse() {
        let (a, b, c) = (node(1), node(2), node(3));
        let mut topo = Topology::new(c.clone());
        let route = [
            hop(&a, Some(1), None),
            hop(&b, Some(20), Some(2)),
            hop(&c, None, Some(3)),
        ];
        topo.update_routes(&route).unwrap();

        assert_eq!(topo.len(), 3);
        let ab = topo.get_route(a.id(), b.id()).unwrap();
        assert_eq!((ab.saddr(), ab.daddr()), (addr(1), addr(2)));
        let bc = topo.get_route(b.id(), c.id()).unwrap();
        assert_eq!((bc.saddr(), bc.daddr()), (addr(20), addr(3)));
        let cb = topo.get_route(c.id(), b.id()).unwrap();
        assert_eq!((cb.saddr(), cb.daddr()), (addr(3), addr(20)));
        assert!(topo.get_route(b.id(), a.id()).is_err());

        assert_eq!(topo.get_shortest_route(c.id(), a.id()).unwrap().dnode(), b.id());
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn sampling_is_distinct_and_bounded(
                peers in 0usize..12,
                excluded in 0usize..12,
                n in 0usize..16,
            ) {
                let a = node(1);
                let mut topo = Topology::new(a.clone());
                let nodes: Vec<Node> = (0..peers).map(|i| node(2 + u16::try_from(i).unwrap())).collect();
                for p in &nodes {
                    topo.add_route(edge(&a, p));
                }
                let exclude: BTreeSet<NodeId> = nodes.iter().take(excluded).map(Node::id).collect();

                let picked = topo.get_random_successor_nodes(a.id(), n, &exclude);
                let ids: BTreeSet<NodeId> = picked.iter().map(Node::id).collect();

                prop_assert_eq!(ids.len(), picked.len());
                prop_assert!(ids.is_disjoint(&exclude));
                prop_assert_eq!(picked.len(), n.min(peers - exclude.len()));
            }
        }
    }
}
