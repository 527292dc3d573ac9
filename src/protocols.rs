//! Capability traits the DHT core is wired to.
//!
//! The node core never touches a socket or a global directly. It is handed
//! the capabilities below at construction time, which lets tests swap in
//! recording mocks and lets the actor layer plug in a real UDP socket.
//!
//! ## Traits
//!
//! | Trait | Used by | Purpose |
//! |-------|---------|---------|
//! | [`SocketManager`] | `DhtNode`, `RpcManager` | Outbound quota check and packet send |
//! | [`DhtObserver`] | `DhtNode` | Events for the embedding application |
//! | [`DatagramSocket`] | `Dht` actor | Async datagram I/O |

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;

use crate::msg::Dict;
use crate::node_id::NodeId;

/// Outbound side of the DHT socket.
pub trait SocketManager: Send {
    /// Whether the global upload budget allows another packet right now.
    fn has_quota(&mut self) -> bool;

    /// Bencode and send `msg` to `dest`. Returns false if nothing was sent.
    fn send_packet(&mut self, dest: SocketAddr, msg: &Dict) -> bool;
}

/// Events surfaced to whoever embeds the node.
///
/// Every method has a no-op default so implementors only override what they
/// care about.
pub trait DhtObserver: Send + Sync {
    /// A remote node told us what our address looks like from outside.
    fn set_external_address(&self, _addr: IpAddr, _source: IpAddr) {}

    /// The external address vote changed winner.
    fn external_address_changed(&self, _addr: IpAddr) {}

    /// Our node ID was regenerated.
    fn node_id_changed(&self, _id: NodeId) {}

    /// A remote node looked up peers for `info_hash`.
    fn get_peers(&self, _info_hash: &NodeId) {}

    /// A remote node announced itself as a peer for `info_hash`.
    fn announce(&self, _info_hash: &NodeId, _addr: IpAddr, _port: u16) {}

    /// Hook for methods the node does not implement. Returning `Some` sends
    /// the dictionary as the `r` body of the reply.
    fn on_dht_request(&self, _method: &[u8], _source: SocketAddr, _args: &Dict) -> Option<Dict> {
        None
    }
}

/// Observer that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl DhtObserver for NullObserver {}

/// Datagram transport driven by the actor loop.
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)>;

    /// Non-blocking send. `WouldBlock` means the packet was dropped.
    fn try_send_to(&self, buf: &[u8], target: SocketAddr) -> std::io::Result<usize>;

    fn local_addr(&self) -> std::io::Result<SocketAddr>;
}

#[async_trait]
impl DatagramSocket for tokio::net::UdpSocket {
    async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        tokio::net::UdpSocket::recv_from(self, buf).await
    }

    fn try_send_to(&self, buf: &[u8], target: SocketAddr) -> std::io::Result<usize> {
        tokio::net::UdpSocket::try_send_to(self, buf, target)
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        tokio::net::UdpSocket::local_addr(self)
    }
}
