//! Keepalive failure detection.
//!
//! Each peer answers requests on `keepalive:*` and periodically pings every
//! node it knows. A node that doesn't answer within the timeout is marked
//! unreachable; one that answers is marked reachable again.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::broker::{Broker, Handler};
use crate::error::WhisperError;
use crate::message::Message;
use crate::node::{Node, NodeId};
use crate::task::TaskManager;

/// Pattern the keepalive responder subscribes to.
pub const KEEPALIVE_PATTERN: &str = "keepalive:*";

/// Topic used to ping `node`.
#[must_use]
pub fn keepalive_topic(node: NodeId) -> String {
    format!("keepalive:{node}")
}

/// Keepalive timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// Pause before each ping.
    pub interval: Duration,
    /// How long to wait for an answer.
    pub timeout: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(3),
        }
    }
}

impl KeepaliveConfig {
    /// Sets the ping interval.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the answer timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns a validation error if either duration is zero.
    pub fn validate(&self) -> Result<(), WhisperError> {
        if self.interval.is_zero() || self.timeout.is_zero() {
            return Err(WhisperError::Validation(
                "keepalive interval and timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Running keepalive: the responder plus the ping loop.
#[derive(Debug)]
pub struct Keepalive {
    broker: Arc<Broker>,
    responder: Arc<Handler>,
    tasks: TaskManager,
}

impl Keepalive {
    /// Registers the responder and starts pinging.
    ///
    /// # Errors
    ///
    /// Returns the subscription error.
    pub fn start(broker: Arc<Broker>, config: KeepaliveConfig) -> Result<Self, WhisperError> {
        let responder = broker.respond(KEEPALIVE_PATTERN, |_| async { Ok(Some(Message::new())) })?;
        let tasks = TaskManager::new();
        tasks.spawn("keepalive", run(Arc::clone(&broker), config));
        Ok(Self {
            broker,
            responder,
            tasks,
        })
    }

    /// Stops pinging and unregisters the responder.
    pub async fn stop(&self) {
        self.tasks.close().await;
        self.broker.unsubscribe(&self.responder).await;
    }
}

/// Pings `node` once and records the outcome in the topology.
///
/// Returns whether the node answered. A ping that can't be routed counts as
/// no answer.
///
/// # Errors
///
/// Returns transport failures.
pub async fn probe(broker: &Broker, node: NodeId, timeout: Duration) -> Result<bool, WhisperError> {
    let outcome = match broker
        .request(&keepalive_topic(node), Message::new(), Some(&[node]), timeout)
        .await
    {
        Ok(replies) => replies.collect().await.map(|answers| !answers.is_empty()),
        Err(e) => Err(e),
    };
    let alive = match outcome {
        Ok(alive) => alive,
        Err(e) if e.is_datagram_fault() => {
            debug!(%node, error = %e, "keepalive ping failed");
            false
        }
        Err(e) => return Err(e),
    };

    let gossip = broker.gossip();
    if alive {
        if !gossip.topology().is_reachable(node) {
            debug!(%node, "node is reachable again");
        }
        gossip.topology_mut().mark_reachable(node);
    } else {
        warn!(%node, "node is unreachable");
        gossip.topology_mut().mark_unreachable(node);
    }
    Ok(alive)
}

async fn run(broker: Arc<Broker>, config: KeepaliveConfig) -> Result<(), WhisperError> {
    loop {
        let local = broker.gossip().id();
        let nodes: Vec<NodeId> = broker
            .gossip()
            .topology()
            .iter()
            .map(Node::id)
            .filter(|id| *id != local)
            .collect();

        if nodes.is_empty() {
            tokio::time::sleep(config.interval).await;
            continue;
        }
        for node in nodes {
            tokio::time::sleep(config.interval).await;
            probe(&broker, node, config.timeout).await?;
        }
    }
}
