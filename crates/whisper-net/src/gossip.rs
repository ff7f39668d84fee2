//! Epidemic multicast and routed point-to-point delivery.
//!
//! [`Gossip`] owns the routing state of one peer: its [`Topology`], its
//! transport and the dedup guard that keeps re-multicast storms in check.
//!
//! Every inbound datagram runs through the same receive pipeline, in order:
//!
//! 1. stamp the local endpoint and the sender's observed address
//! 2. learn the nodes and routes the message reveals, handshaking new nodes,
//!    and merge the direct routes a handshake shares
//! 3. forward traffic addressed to someone else
//! 4. yield acknowledgements
//! 5. acknowledge a `Syn`
//! 6. re-multicast gossip in the background, dropping duplicates
//! 7. swallow pure handshakes
//! 8. yield everything else

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::Stream;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, trace, warn};

use crate::address::Address;
use crate::dedup::{DEFAULT_DEDUP_CAPACITY, DEFAULT_DEDUP_TTL, DedupGuard};
use crate::error::WhisperError;
use crate::message::{Kind, Message};
use crate::node::{Node, NodeId};
use crate::route::{Endpoint, Route};
use crate::task::TaskManager;
use crate::topology::Topology;
use crate::transport::{Transport, TransportStats};

/// Dedup owner for multicast marks.
const MULTICAST_OWNER: &str = "gossip:multicast";

/// Most direct routes a handshake or handshake ack carries. Keeps the
/// encoded datagram well under the packet size.
const MAX_SHARED_ROUTES: usize = 12;

/// Configuration for the gossip engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GossipConfig {
    /// Peers targeted per round.
    pub fanout: usize,
    /// Pause between rounds.
    pub interval: Duration,
    /// Longest route accepted on receive.
    pub max_hops: usize,
    /// How long a multicast id stays marked.
    pub dedup_ttl: Duration,
    /// Maximum multicast ids remembered.
    pub dedup_capacity: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            fanout: 5,
            interval: Duration::from_millis(10),
            max_hops: 16,
            dedup_ttl: DEFAULT_DEDUP_TTL,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
        }
    }
}

impl GossipConfig {
    /// Sets the fanout.
    #[must_use]
    pub const fn with_fanout(mut self, fanout: usize) -> Self {
        self.fanout = fanout;
        self
    }

    /// Sets the pause between rounds.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the hop limit.
    #[must_use]
    pub const fn with_max_hops(mut self, max_hops: usize) -> Self {
        self.max_hops = max_hops;
        self
    }

    /// Sets the dedup TTL.
    #[must_use]
    pub const fn with_dedup_ttl(mut self, ttl: Duration) -> Self {
        self.dedup_ttl = ttl;
        self
    }

    /// Sets the dedup capacity.
    #[must_use]
    pub const fn with_dedup_capacity(mut self, capacity: usize) -> Self {
        self.dedup_capacity = capacity;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a zero fanout, hop limit or capacity.
    pub fn validate(&self) -> Result<(), WhisperError> {
        if self.fanout == 0 {
            return Err(WhisperError::Validation("fanout must be at least 1".into()));
        }
        if self.max_hops < 2 {
            return Err(WhisperError::Validation("max_hops must be at least 2".into()));
        }
        if self.dedup_capacity == 0 {
            return Err(WhisperError::Validation("dedup_capacity must be at least 1".into()));
        }
        Ok(())
    }
}

/// Effective fanout: never more peers than the population holds.
#[must_use]
pub fn fanout_for(k: usize, population: usize) -> usize {
    k.min(population)
}

/// Rounds needed for a multicast at `fanout` to cover `population` nodes:
/// the smallest `c` with `fanout^c >= population`, with 0 and 1 special-cased.
#[must_use]
pub fn cycles_for(fanout: usize, population: usize) -> usize {
    match fanout {
        0 => 0,
        1 => 1,
        _ => {
            let mut cycles = 0;
            let mut covered: usize = 1;
            while covered < population {
                covered = covered.saturating_mul(fanout);
                cycles += 1;
            }
            cycles
        }
    }
}

/// Gossip engine for one peer.
pub struct Gossip {
    node: Node,
    transport: Arc<dyn Transport>,
    topology: RwLock<Topology>,
    config: GossipConfig,
    dedup: DedupGuard<crate::message::MessageId>,
    tasks: TaskManager,
}

impl std::fmt::Debug for Gossip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gossip")
            .field("node", &self.node)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Gossip {
    /// Creates an engine for `id` over `transport`.
    #[must_use]
    pub fn new(id: NodeId, transport: Arc<dyn Transport>, config: GossipConfig) -> Self {
        let node = Node::new(id, [transport.local_addr()]);
        let dedup = DedupGuard::new(config.dedup_ttl, config.dedup_capacity);
        Self {
            topology: RwLock::new(Topology::new(node.clone())),
            node,
            transport,
            config,
            dedup,
            tasks: TaskManager::new(),
        }
    }

    /// Local node id.
    #[must_use]
    pub const fn id(&self) -> NodeId {
        self.node.id()
    }

    /// Local node.
    #[must_use]
    pub const fn node(&self) -> &Node {
        &self.node
    }

    /// Address the transport is bound to.
    #[must_use]
    pub fn local_addr(&self) -> Address {
        self.transport.local_addr()
    }

    /// Engine configuration.
    #[must_use]
    pub const fn config(&self) -> &GossipConfig {
        &self.config
    }

    /// Transport counters.
    #[must_use]
    pub fn stats(&self) -> TransportStats {
        self.transport.stats()
    }

    /// Read access to the topology. Don't hold the guard across an `.await`.
    pub fn topology(&self) -> RwLockReadGuard<'_, Topology> {
        self.topology.read()
    }

    /// Write access to the topology. Don't hold the guard across an `.await`.
    pub fn topology_mut(&self) -> RwLockWriteGuard<'_, Topology> {
        self.topology.write()
    }

    /// Peers targeted per round.
    #[must_use]
    pub fn fanout(&self) -> usize {
        fanout_for(self.config.fanout, self.topology.read().len())
    }

    /// Rounds per multicast.
    #[must_use]
    pub fn cycles(&self) -> usize {
        let population = self.topology.read().len();
        cycles_for(fanout_for(self.config.fanout, population), population)
    }

    /// Registers `node`, adds a direct route to its first address and sends
    /// it a handshake.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the node has no address or is the local
    /// node, or the send error.
    pub async fn connect(&self, node: &Node) -> Result<Message, WhisperError> {
        let daddr = node.primary_address().ok_or_else(|| {
            WhisperError::Validation(format!("node {} has no address to connect to", node.id()))
        })?;
        let route = Route::new(self.id(), self.local_addr(), node.id(), daddr)?;
        {
            let mut topology = self.topology.write();
            topology.add_node(node);
            topology.add_route(route);
        }
        debug!(node = %node.id(), %daddr, "connecting");
        self.send_handshake(node.id()).await
    }

    /// Sends `message` one hop toward `node` along the shortest known route.
    ///
    /// The message's trailing endpoint must be the local node (one is added to
    /// an empty route). Returns the message as transmitted.
    ///
    /// # Errors
    ///
    /// Returns [`WhisperError::RouteNotFound`] if `node` can't be reached, a
    /// validation error if the trailing endpoint belongs to another node, or
    /// the transport error.
    pub async fn send(&self, mut message: Message, node: NodeId) -> Result<Message, WhisperError> {
        let local = self.id();
        let route = self.topology.read().get_shortest_route(local, node)?;

        if message.routing.src.is_none() {
            message.routing.src = Some(local);
        }
        message.routing.dst = Some(node);

        let hops = &mut message.routing.route;
        if hops.is_empty() {
            hops.push(Endpoint::new(local));
        }
        let Some(last) = hops.last_mut().filter(|last| last.node == local) else {
            return Err(WhisperError::Validation(format!(
                "message {} does not end at the local node",
                message.id
            )));
        };
        last.saddr = Some(route.saddr());
        last.timestamp = Some(Utc::now());
        hops.push(Endpoint::new(route.dnode()).with_daddr(route.daddr()));

        trace!(id = %message.id, to = %node, via = %route.dnode(), "sending");
        self.transport.send(&message, route.daddr()).await?;
        Ok(message)
    }

    /// Sends a handshake probe so `node` learns the route back.
    ///
    /// The probe carries the local node's direct routes, so `node` also
    /// learns the peers reachable through us.
    ///
    /// # Errors
    ///
    /// Returns a codec error if the routes can't be encoded, or the send
    /// error.
    pub async fn send_handshake(&self, node: NodeId) -> Result<Message, WhisperError> {
        let probe = Message::new()
            .with_kind(Kind::Handshake)
            .with_kind(Kind::Syn)
            .with_payload(self.shared_routes()?);
        self.send(probe, node).await
    }

    /// Acknowledges a `Syn` message back to its source.
    ///
    /// The ack reuses the message id and topic. Acknowledging a handshake,
    /// it carries `Handshake` and the local node's direct routes.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the message has no `Syn`, a validation
    /// error if it has no source, or the send error.
    pub async fn send_ack(&self, message: &Message) -> Result<Message, WhisperError> {
        if !message.has(Kind::Syn) {
            return Err(WhisperError::Protocol(format!(
                "cannot acknowledge message {} without syn",
                message.id
            )));
        }
        let src = message.routing.src.ok_or_else(|| {
            WhisperError::Validation(format!("message {} has no source to acknowledge", message.id))
        })?;

        let mut ack = Message::default().with_kind(Kind::Ack).with_topic(message.topic.clone());
        ack.id = message.id;
        if message.has(Kind::Handshake) {
            ack = ack.with_kind(Kind::Handshake).with_payload(self.shared_routes()?);
        }
        debug!(id = %message.id, to = %src, "acknowledging");
        self.send(ack, src).await
    }

    /// Relays a message that isn't addressed to the local node.
    ///
    /// Returns false if the message is for the local node.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the message has no destination, or the
    /// send error.
    pub async fn send_forward(&self, message: &Message) -> Result<bool, WhisperError> {
        let dst = message.routing.dst.ok_or_else(|| {
            WhisperError::Validation(format!("message {} has no destination", message.id))
        })?;
        if dst == self.id() {
            return Ok(false);
        }
        debug!(id = %message.id, to = %dst, "forwarding");
        self.send(message.clone(), dst).await?;
        Ok(true)
    }

    /// Multicasts a message epidemically.
    ///
    /// Runs at most once per message id within the dedup TTL; a suppressed
    /// call returns no messages.
    ///
    /// # Errors
    ///
    /// Returns the first send error.
    pub async fn send_gossip(&self, message: Message) -> Result<Vec<Message>, WhisperError> {
        Ok(self.multicast_once(message).await?.unwrap_or_default())
    }

    /// Returns `None` when the dedup guard suppressed the multicast.
    async fn multicast_once(&self, message: Message) -> Result<Option<Vec<Message>>, WhisperError> {
        let message = message.with_kind(Kind::Gossip);
        let id = message.id;
        self.dedup
            .run(MULTICAST_OWNER, &id, self.multicast(message))
            .await
            .transpose()
    }

    async fn multicast(&self, message: Message) -> Result<Vec<Message>, WhisperError> {
        let local = self.id();
        let mut ignore: BTreeSet<NodeId> = message.routing.nodes().collect();
        ignore.insert(local);

        let (fanout, cycles) = (self.fanout(), self.cycles());
        let mut sent = Vec::new();
        for round in 0..cycles {
            if round > 0 {
                tokio::time::sleep(self.config.interval).await;
            }
            let targets = self
                .topology
                .read()
                .get_random_successor_nodes(local, fanout, &ignore);
            if targets.is_empty() {
                break;
            }
            for target in targets {
                ignore.insert(target.id());
                sent.push(self.send(message.clone(), target.id()).await?);
            }
        }
        debug!(id = %message.id, copies = sent.len(), cycles, fanout, "multicast done");
        Ok(sent)
    }

    /// Receives the next message for the application.
    ///
    /// Malformed or unroutable datagrams are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`WhisperError::TransportClosed`] after [`Gossip::close`], or
    /// another transport error.
    pub async fn recv_next(self: &Arc<Self>) -> Result<Message, WhisperError> {
        loop {
            let outcome = match self.transport.recv().await {
                Ok((message, from)) => self.process(message, from).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(Some(message)) => return Ok(message),
                Ok(None) => {}
                Err(e) if e.is_datagram_fault() => warn!(error = %e, "dropping datagram"),
                Err(e) => return Err(e),
            }
        }
    }

    /// Stream of inbound application messages. Ends after the first
    /// transport error.
    pub fn recv(self: &Arc<Self>) -> impl Stream<Item = Result<Message, WhisperError>> + Send + '_ {
        futures::stream::unfold(Some(self), |state| async move {
            let gossip = state?;
            match gossip.recv_next().await {
                Ok(message) => Some((Ok(message), Some(gossip))),
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    /// Closes the transport, ending [`Gossip::recv`], and aborts any
    /// re-multicast still running.
    pub fn close(&self) {
        self.transport.close();
        self.tasks.abort_all();
    }

    /// Encodes the local node's direct routes to reachable nodes.
    fn shared_routes(&self) -> Result<Vec<u8>, WhisperError> {
        let local = self.id();
        let routes: Vec<Route> = {
            let topology = self.topology.read();
            topology
                .routes()
                .filter(|route| route.snode() == local && topology.is_reachable(route.dnode()))
                .take(MAX_SHARED_ROUTES)
                .copied()
                .collect()
        };
        serde_json::to_vec(&routes).map_err(|e| WhisperError::Codec(e.to_string()))
    }

    /// Merges the routes a handshake addressed to us shares. Only edges that
    /// leave the sender and don't touch the local node are taken.
    fn merge_shared_routes(&self, message: &Message) -> Result<(), WhisperError> {
        let local = self.id();
        if !message.has(Kind::Handshake)
            || message.payload.is_empty()
            || message.routing.dst != Some(local)
        {
            return Ok(());
        }
        let Some(sender) = message.routing.src else {
            return Ok(());
        };
        let routes: Vec<Route> = serde_json::from_slice(&message.payload).map_err(|e| {
            WhisperError::Protocol(format!("handshake {} shares malformed routes: {e}", message.id))
        })?;

        let mut topology = self.topology.write();
        let mut merged = 0usize;
        for route in routes {
            if route.snode() != sender || route.dnode() == sender || route.dnode() == local {
                continue;
            }
            topology.add_route(route);
            merged += 1;
        }
        trace!(id = %message.id, from = %sender, merged, "merged shared routes");
        Ok(())
    }

    /// Runs the rounds of a received gossip's re-multicast on a task so the
    /// receive loop isn't held up by the pauses between rounds.
    fn spawn_multicast(self: &Arc<Self>, message: Message) {
        let gossip = Arc::clone(self);
        let id = message.id;
        self.tasks.spawn(format!("multicast:{id}"), async move {
            match gossip.multicast(message).await {
                Ok(_) => Ok(()),
                Err(e) if e.is_datagram_fault() => {
                    warn!(%id, error = %e, "re-multicast failed");
                    Ok(())
                }
                Err(e) => Err(e),
            }
        });
    }

    async fn process(self: &Arc<Self>, mut message: Message, from: Address) -> Result<Option<Message>, WhisperError> {
        let local = self.id();

        // Stamp.
        let hops = &mut message.routing.route;
        if hops.len() > self.config.max_hops {
            return Err(WhisperError::Protocol(format!(
                "message {} exceeded {} hops",
                message.id, self.config.max_hops
            )));
        }
        if hops.len() < 2 || hops.last().map(|hop| hop.node) != Some(local) {
            return Err(WhisperError::Protocol(format!(
                "message {} does not end at the local node",
                message.id
            )));
        }
        let n = hops.len();
        hops[n - 2].saddr = Some(from);
        if hops[n - 1].daddr.is_none() {
            hops[n - 1].daddr = Some(self.local_addr());
        }

        // Discover.
        let unknown: Vec<NodeId> = {
            let topology = self.topology.read();
            let mut seen = BTreeSet::new();
            message
                .routing
                .nodes()
                .filter(|id| !topology.contains(*id) && seen.insert(*id))
                .collect()
        };
        self.topology.write().update_routes(&message.routing.route)?;
        for node in unknown {
            debug!(%node, "handshaking newly discovered node");
            tolerate(self.send_handshake(node).await, "handshake")?;
        }
        tolerate(self.merge_shared_routes(&message), "route merge")?;

        // Forward.
        if self.send_forward(&message).await? {
            return Ok(None);
        }

        if message.has(Kind::Ack) {
            return Ok(Some(message));
        }

        if message.has(Kind::Syn) {
            tolerate(self.send_ack(&message).await, "ack")?;
        }

        if message.has(Kind::Gossip) {
            if !self.dedup.try_acquire(MULTICAST_OWNER, &message.id) {
                trace!(id = %message.id, "duplicate gossip");
                return Ok(None);
            }
            self.spawn_multicast(message.clone());
        }

        if message.is_handshake_only() {
            return Ok(None);
        }
        Ok(Some(message))
    }
}

/// Logs a per-datagram failure of a side effect and carries on; transport
/// failures still propagate.
fn tolerate<T>(result: Result<T, WhisperError>, what: &str) -> Result<(), WhisperError> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_datagram_fault() => {
            warn!(error = %e, "{what} failed");
            Ok(())
        }
        Err(e) => Err(e),
    }
}
