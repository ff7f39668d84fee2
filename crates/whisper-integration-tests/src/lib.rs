//! Integration test crate for the Whisper substrate.
//!
//! The tests under `tests/` run several peers over loopback UDP. This crate
//! only carries the helpers they share.

#![forbid(unsafe_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use whisper_net::{
    Address, Channel, Gossip, GossipConfig, Message, NodeId, Peer, PeerConfig, UdpTransport,
    WhisperError,
};

/// How long a test waits for a single message.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Loopback address with an ephemeral port.
#[must_use]
pub const fn loopback() -> Address {
    Address::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
}

/// A bare gossip engine on loopback, without a broker consuming its stream.
pub async fn gossip(config: GossipConfig) -> Result<Arc<Gossip>, WhisperError> {
    let transport = UdpTransport::bind(loopback()).await?;
    Ok(Arc::new(Gossip::new(NodeId::new(), Arc::new(transport), config)))
}

/// A full peer on loopback.
pub async fn peer(config: PeerConfig) -> Result<Peer, WhisperError> {
    Peer::bind(config.with_bind(loopback())).await
}

/// Drives `recv_next` in the background and queues every yielded message.
pub fn pump(gossip: &Arc<Gossip>) -> (Channel<Message>, JoinHandle<()>) {
    let out = Channel::new();
    let (gossip, tx) = (Arc::clone(gossip), out.clone());
    let handle = tokio::spawn(async move {
        while let Ok(message) = gossip.recv_next().await {
            if tx.send(message).is_err() {
                break;
            }
        }
    });
    (out, handle)
}

/// Next queued message, or `None` after [`RECV_TIMEOUT`].
pub async fn next(channel: &Channel<Message>) -> Option<Message> {
    tokio::time::timeout(RECV_TIMEOUT, channel.recv()).await.ok()?.ok()
}

/// Next queued message with the given id, skipping everything else.
pub async fn next_with_id(channel: &Channel<Message>, id: whisper_net::MessageId) -> Option<Message> {
    tokio::time::timeout(RECV_TIMEOUT, async {
        loop {
            match channel.recv().await {
                Ok(message) if message.id == id => return Some(message),
                Ok(_) => {}
                Err(_) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Everything queued right now.
pub fn drain(channel: &Channel<Message>) -> Vec<Message> {
    std::iter::from_fn(|| channel.try_recv().ok().flatten()).collect()
}

/// Gives in-flight datagrams time to land.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}
