//! Datagram transport.
//!
//! [`Transport`] is object safe so the gossip layer can hold an
//! `Arc<dyn Transport>`; [`UdpTransport`] is the production implementation.

use std::future::Future;
use std::io::ErrorKind;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::address::Address;
use crate::codec::{self, MAX_PACKET_SIZE};
use crate::error::WhisperError;
use crate::message::Message;

/// Boxed future type for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Snapshot of transport counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportStats {
    /// Datagrams sent.
    pub tx_packets: u64,
    /// Bytes sent.
    pub tx_bytes: u64,
    /// Datagrams received.
    pub rx_packets: u64,
    /// Bytes received.
    pub rx_bytes: u64,
}

/// Unreliable message transport.
pub trait Transport: Send + Sync {
    /// Returns the address the transport is bound to.
    fn local_addr(&self) -> Address;

    /// Sends a message to `addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the message can't be encoded, is too large,
    /// the transport is closed, or the socket fails.
    fn send<'a>(&'a self, message: &'a Message, addr: Address) -> BoxFuture<'a, Result<(), WhisperError>>;

    /// Receives the next message and the address it came from.
    ///
    /// # Errors
    ///
    /// Returns a codec error for an undecodable datagram,
    /// [`WhisperError::TransportClosed`] once closed, or an IO error.
    fn recv(&self) -> BoxFuture<'_, Result<(Message, Address), WhisperError>>;

    /// Closes the transport, waking any pending `recv`.
    fn close(&self);

    /// Returns true once [`Transport::close`] has been called.
    fn is_closed(&self) -> bool;

    /// Returns the current counters.
    fn stats(&self) -> TransportStats;
}

#[derive(Debug, Default)]
struct Counters {
    tx_packets: AtomicU64,
    tx_bytes: AtomicU64,
    rx_packets: AtomicU64,
    rx_bytes: AtomicU64,
}

impl Counters {
    fn record_tx(&self, bytes: usize) {
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_rx(&self, bytes: usize) {
        self.rx_packets.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TransportStats {
        TransportStats {
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
        }
    }
}

/// UDP transport over a tokio socket.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    local: Address,
    closed: CancellationToken,
    counters: Counters,
}

impl UdpTransport {
    /// Binds a UDP socket. Port 0 picks an ephemeral port.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the socket can't be bound.
    pub async fn bind(addr: Address) -> Result<Self, WhisperError> {
        let socket = UdpSocket::bind(std::net::SocketAddr::from(addr)).await?;
        let local = Address::from(socket.local_addr()?);
        debug!(%local, "udp transport bound");
        Ok(Self {
            socket,
            local,
            closed: CancellationToken::new(),
            counters: Counters::default(),
        })
    }

    async fn send_inner(&self, message: &Message, addr: Address) -> Result<(), WhisperError> {
        if self.closed.is_cancelled() {
            return Err(WhisperError::TransportClosed);
        }
        let bytes = codec::encode(message)?;
        let sent = self
            .socket
            .send_to(&bytes, std::net::SocketAddr::from(addr))
            .await?;
        self.counters.record_tx(sent);
        trace!(to = %addr, bytes = sent, id = %message.id, "datagram sent");
        Ok(())
    }

    async fn recv_inner(&self) -> Result<(Message, Address), WhisperError> {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            let received = tokio::select! {
                () = self.closed.cancelled() => return Err(WhisperError::TransportClosed),
                result = self.socket.recv_from(&mut buf) => result,
            };
            match received {
                Ok((len, from)) => {
                    self.counters.record_rx(len);
                    let from = Address::from(from);
                    trace!(%from, bytes = len, "datagram received");
                    return codec::decode(&buf[..len]).map(|message| (message, from));
                }
                // ICMP unreachable from an earlier send surfaces here on some platforms.
                Err(e) if matches!(e.kind(), ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset) => {
                    debug!(error = %e, "ignoring icmp error on udp socket");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Transport for UdpTransport {
    fn local_addr(&self) -> Address {
        self.local
    }

    fn send<'a>(&'a self, message: &'a Message, addr: Address) -> BoxFuture<'a, Result<(), WhisperError>> {
        Box::pin(self.send_inner(message, addr))
    }

    fn recv(&self) -> BoxFuture<'_, Result<(Message, Address), WhisperError>> {
        Box::pin(self.recv_inner())
    }

    fn close(&self) {
        if !self.closed.is_cancelled() {
            debug!(local = %self.local, "udp transport closed");
        }
        self.closed.cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn stats(&self) -> TransportStats {
        self.counters.snapshot()
    }
}
