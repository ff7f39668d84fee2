//! A complete peer: UDP transport, gossip engine, broker and keepalive.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::address::Address;
use crate::broker::{Broker, BrokerConfig, Handler, Replies};
use crate::error::WhisperError;
use crate::gossip::{Gossip, GossipConfig};
use crate::membership::{Keepalive, KeepaliveConfig};
use crate::message::Message;
use crate::node::{Node, NodeId, parse_seeds};
use crate::transport::UdpTransport;

/// Peer configuration.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Identity of this peer.
    pub node_id: NodeId,
    /// Address to bind the UDP socket to.
    pub bind: Address,
    /// Nodes to connect to on startup.
    pub seeds: Vec<Node>,
    /// Gossip engine settings.
    pub gossip: GossipConfig,
    /// Broker settings.
    pub broker: BrokerConfig,
    /// Keepalive settings; `None` disables failure detection.
    pub keepalive: Option<KeepaliveConfig>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::new(),
            bind: Address::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            seeds: Vec::new(),
            gossip: GossipConfig::default(),
            broker: BrokerConfig::default(),
            keepalive: None,
        }
    }
}

impl PeerConfig {
    /// Sets the node id.
    #[must_use]
    pub fn with_node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = node_id;
        self
    }

    /// Sets the bind address.
    #[must_use]
    pub fn with_bind(mut self, bind: Address) -> Self {
        self.bind = bind;
        self
    }

    /// Adds a seed node.
    #[must_use]
    pub fn with_seed(mut self, seed: Node) -> Self {
        self.seeds.push(seed);
        self
    }

    /// Replaces the seed list.
    #[must_use]
    pub fn with_seeds(mut self, seeds: Vec<Node>) -> Self {
        self.seeds = seeds;
        self
    }

    /// Sets the gossip settings.
    #[must_use]
    pub fn with_gossip(mut self, gossip: GossipConfig) -> Self {
        self.gossip = gossip;
        self
    }

    /// Sets the broker settings.
    #[must_use]
    pub fn with_broker(mut self, broker: BrokerConfig) -> Self {
        self.broker = broker;
        self
    }

    /// Enables keepalive with the given settings.
    #[must_use]
    pub fn with_keepalive(mut self, keepalive: KeepaliveConfig) -> Self {
        self.keepalive = Some(keepalive);
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns a validation error for invalid gossip or keepalive settings, a
    /// seed without an address, or a seed with this peer's own id.
    pub fn validate(&self) -> Result<(), WhisperError> {
        self.gossip.validate()?;
        if let Some(keepalive) = &self.keepalive {
            keepalive.validate()?;
        }
        for seed in &self.seeds {
            if seed.id() == self.node_id {
                return Err(WhisperError::Validation(format!(
                    "seed {seed} has this peer's own id"
                )));
            }
            if seed.addresses().is_empty() {
                return Err(WhisperError::Validation(format!("seed {seed} has no address")));
            }
        }
        Ok(())
    }
}

/// A running peer.
#[derive(Debug)]
pub struct Peer {
    gossip: Arc<Gossip>,
    broker: Arc<Broker>,
    keepalive: Option<Keepalive>,
}

impl Peer {
    /// Binds the transport, starts the broker, connects to the seeds and
    /// starts keepalive if configured.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a bad config, or the bind or send error.
    pub async fn bind(config: PeerConfig) -> Result<Self, WhisperError> {
        config.validate()?;

        let transport = UdpTransport::bind(config.bind).await?;
        let gossip = Arc::new(Gossip::new(config.node_id, Arc::new(transport), config.gossip));
        let broker = Arc::new(Broker::new(Arc::clone(&gossip), config.broker));
        info!(id = %gossip.id(), addr = %gossip.local_addr(), "peer listening");
        if gossip.local_addr().is_unspecified() {
            warn!(
                addr = %gossip.local_addr(),
                "bound to an unspecified address; the dsn only works as a seed once a routable host is substituted"
            );
        }

        let mut peer = Self {
            gossip,
            broker,
            keepalive: None,
        };
        peer.connect(&config.seeds).await?;
        peer.keepalive = config
            .keepalive
            .map(|keepalive| Keepalive::start(Arc::clone(&peer.broker), keepalive))
            .transpose()?;
        Ok(peer)
    }

    /// This peer's id.
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.gossip.id()
    }

    /// This peer as a node.
    #[must_use]
    pub fn node(&self) -> &Node {
        self.gossip.node()
    }

    /// Bound address.
    #[must_use]
    pub fn addr(&self) -> Address {
        self.gossip.local_addr()
    }

    /// Seed string other peers can connect with, `"<id>@<ip>:<port>"`.
    ///
    /// When bound to an unspecified address such as `0.0.0.0`, the dsn
    /// carries that address and remote peers can't dial it as is; see
    /// [`Peer::is_advertisable`].
    #[must_use]
    pub fn dsn(&self) -> String {
        format!("{}@{}", self.id(), self.addr())
    }

    /// Returns true if the bound address can be dialled by other hosts.
    #[must_use]
    pub fn is_advertisable(&self) -> bool {
        !self.addr().is_unspecified()
    }

    /// The gossip engine.
    #[must_use]
    pub const fn gossip(&self) -> &Arc<Gossip> {
        &self.gossip
    }

    /// The broker.
    #[must_use]
    pub const fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Connects to each node in turn.
    ///
    /// # Errors
    ///
    /// Returns the first connect error.
    pub async fn connect(&self, nodes: &[Node]) -> Result<(), WhisperError> {
        for node in nodes {
            self.gossip.connect(node).await?;
            info!(node = %node, "connected");
        }
        Ok(())
    }

    /// Parses a comma-separated seed list and connects to each seed.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed seed, or the connect error.
    pub async fn connect_seeds(&self, seeds: &str) -> Result<(), WhisperError> {
        self.connect(&parse_seeds(seeds)?).await
    }

    /// See [`Broker::subscribe`].
    ///
    /// # Errors
    ///
    /// Returns a validation error for a bad pattern.
    pub fn subscribe<F, Fut>(&self, pattern: &str, callback: F) -> Result<Arc<Handler>, WhisperError>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Message>, WhisperError>> + Send + 'static,
    {
        self.broker.subscribe(pattern, callback)
    }

    /// See [`Broker::unsubscribe`].
    pub async fn unsubscribe(&self, handler: &Handler) {
        self.broker.unsubscribe(handler).await;
    }

    /// See [`Broker::respond`].
    ///
    /// # Errors
    ///
    /// Returns a validation error for a bad pattern.
    pub fn respond<F, Fut>(&self, pattern: &str, callback: F) -> Result<Arc<Handler>, WhisperError>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Message>, WhisperError>> + Send + 'static,
    {
        self.broker.respond(pattern, callback)
    }

    /// See [`Broker::publish`].
    ///
    /// # Errors
    ///
    /// See [`Broker::publish`].
    pub async fn publish(
        &self,
        topic: &str,
        message: Message,
        peers: Option<&[NodeId]>,
    ) -> Result<Replies, WhisperError> {
        self.broker.publish(topic, message, peers).await
    }

    /// See [`Broker::request`].
    ///
    /// # Errors
    ///
    /// See [`Broker::publish`].
    pub async fn request(
        &self,
        topic: &str,
        message: Message,
        peers: Option<&[NodeId]>,
        timeout: Duration,
    ) -> Result<Replies, WhisperError> {
        self.broker.request(topic, message, peers, timeout).await
    }

    /// Stops keepalive, every handler and the transport.
    pub async fn disconnect(&self) {
        if let Some(keepalive) = &self.keepalive {
            keepalive.stop().await;
        }
        self.broker.close().await;
        info!(id = %self.id(), "peer disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> Address {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn config_builders() {
        let id = NodeId::new();
        let seed = Node::new(NodeId::new(), ["127.0.0.1:9".parse().unwrap()]);
        let config = PeerConfig::default()
            .with_node_id(id)
            .with_bind(loopback())
            .with_seed(seed.clone())
            .with_gossip(GossipConfig::default().with_fanout(3))
            .with_broker(BrokerConfig::default().with_reply_timeout(Duration::from_secs(1)))
            .with_keepalive(KeepaliveConfig::default());

        assert_eq!(config.node_id, id);
        assert_eq!(config.seeds, vec![seed]);
        assert_eq!(config.gossip.fanout, 3);
        assert!(config.keepalive.is_some());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_rejects_bad_seeds() {
        let id = NodeId::new();
        let own = PeerConfig::default()
            .with_node_id(id)
            .with_seed(Node::new(id, ["127.0.0.1:9".parse().unwrap()]));
        assert!(matches!(own.validate(), Err(WhisperError::Validation(_))));

        let bare = PeerConfig::default().with_seed(Node::bare(NodeId::new()));
        assert!(matches!(bare.validate(), Err(WhisperError::Validation(_))));

        let zero_fanout = PeerConfig::default().with_gossip(GossipConfig::default().with_fanout(0));
        assert!(zero_fanout.validate().is_err());
    }

    #[tokio::test]
    async fn bind_exposes_identity() {
        let id = NodeId::new();
        let peer = Peer::bind(PeerConfig::default().with_node_id(id).with_bind(loopback()))
            .await
            .unwrap();

        assert_eq!(peer.id(), id);
        assert_ne!(peer.addr().port(), 0);
        assert_eq!(peer.dsn(), format!("{id}@{}", peer.addr()));
        assert_eq!(peer.dsn().parse::<Node>().unwrap().primary_address(), Some(peer.addr()));
        peer.disconnect().await;
    }

    #[tokio::test]
    async fn unspecified_bind_is_not_advertisable() {
        let wildcard = Peer::bind(PeerConfig::default()).await.unwrap();
        assert!(!wildcard.is_advertisable());
        assert!(wildcard.dsn().ends_with(&format!("0.0.0.0:{}", wildcard.addr().port())));
        wildcard.disconnect().await;

        let local = Peer::bind(PeerConfig::default().with_bind(loopback())).await.unwrap();
        assert!(local.is_advertisable());
        local.disconnect().await;
    }

    #[tokio::test]
    async fn seeds_are_connected_on_bind() {
        let a = Peer::bind(PeerConfig::default().with_bind(loopback())).await.unwrap();
        let b = Peer::bind(
            PeerConfig::default()
                .with_bind(loopback())
                .with_seeds(parse_seeds(&a.dsn()).unwrap()),
        )
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(b.gossip().topology().contains(a.id()));
        assert!(a.gossip().topology().contains(b.id()));

        a.disconnect().await;
        b.disconnect().await;
    }

    #[tokio::test]
    async fn connect_seeds_rejects_garbage() {
        let a = Peer::bind(PeerConfig::default().with_bind(loopback())).await.unwrap();
        assert!(matches!(
            a.connect_seeds("not-a-seed").await,
            Err(WhisperError::Validation(_))
        ));
        a.disconnect().await;
    }
}
