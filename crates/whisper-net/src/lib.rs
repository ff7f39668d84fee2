//! # whisper-net
//!
//! Peer-to-peer messaging substrate over UDP.
//!
//! This crate provides:
//!
//! - Epidemic gossip with logarithmic fan-out and duplicate suppression
//! - A learned topology: nodes discover each other from the routes that
//!   traffic carries, and forward along shortest paths
//! - A topic broker with glob subscriptions and correlated request/response
//! - Keepalive failure detection
//!
//! ## Core Types
//!
//! - [`Peer`]: A running peer, the usual entry point
//! - [`Gossip`]: The gossip engine (send, forward, multicast, receive)
//! - [`Broker`]: Topic pub/sub on top of the gossip engine
//! - [`Topology`]: Known nodes and the directed routes between them
//! - [`Message`]: The unit of traffic
//! - [`Channel`], [`TaskManager`], [`DedupGuard`]: async building blocks

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod address;
pub mod broker;
pub mod channel;
pub mod codec;
pub mod dedup;
pub mod error;
pub mod gossip;
pub mod membership;
pub mod message;
pub mod node;
pub mod peer;
pub mod route;
pub mod task;
pub mod topology;
pub mod transport;

pub use address::Address;
pub use broker::{Broker, BrokerConfig, Callback, Handler, Hook, Replies, correlation_topic};
pub use channel::Channel;
pub use codec::{MAX_PACKET_SIZE, WIRE_VERSION};
pub use dedup::DedupGuard;
pub use error::WhisperError;
pub use gossip::{Gossip, GossipConfig, cycles_for, fanout_for};
pub use membership::{Keepalive, KeepaliveConfig, probe};
pub use message::{Kind, Message, MessageId, Routing};
pub use node::{Node, NodeId, parse_seeds};
pub use peer::{Peer, PeerConfig};
pub use route::{Endpoint, Route};
pub use task::{TaskId, TaskManager};
pub use topology::Topology;
pub use transport::{BoxFuture, Transport, TransportStats, UdpTransport};
