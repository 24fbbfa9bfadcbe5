//! Datagram transport consumed by the router.
//!
//! The router never touches sockets itself; it hands encoded messages to a
//! [Transport] and receives raw bytes through the handler registered with
//! [Transport::on_receive].

pub mod memory;
pub mod udp;

use std::fmt::Debug;
use std::net::SocketAddr;

use bytes::Bytes;

/// Called once with the outcome of a [Transport::send].
pub type AckCallback = Box<dyn FnOnce(Result<(), TransportError>) + Send>;

/// Called with every datagram received by a transport, and its origin.
pub type ReceiveHandler = Box<dyn Fn(Bytes, SocketAddr) + Send + Sync>;

/// Endpoint management and datagram delivery.
pub trait Transport: Debug + Send + Sync {
    /// Prepare the transport to track up to `capacity` connections.
    ///
    /// Implementations keep the most recently used connections once more
    /// than `capacity` addresses were reached, they never refuse a send for
    /// lack of room. A `capacity` of 0 is rejected.
    fn init(&self, capacity: usize) -> Result<(), TransportError>;

    /// The address peers can reach this transport at.
    fn local_address(&self) -> SocketAddr;

    /// Send `bytes` to `address` without blocking on the network.
    ///
    /// `on_ack` is invoked exactly once, possibly before this call returns.
    fn send(&self, address: SocketAddr, bytes: Bytes, on_ack: AckCallback);

    /// Forget any state kept for `address`.
    fn remove_connection(&self, address: &SocketAddr);

    /// Register the handler receiving inbound datagrams, replacing any previous one.
    fn on_receive(&self, handler: ReceiveHandler);
}

#[derive(thiserror::Error, Debug)]
/// Transport error enum.
pub enum TransportError {
    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    #[error("Invalid connection capacity {0}")]
    InvalidCapacity(usize),

    #[error("Transport is not initialized")]
    NotInitialized,

    #[error("Datagram of {0} bytes exceeds the MTU")]
    TooLarge(usize),
}
