//! In-process simulated network.
//!
//! Datagrams are queued on a shared [MemoryNetwork] and only delivered when
//! the network is pumped with [MemoryNetwork::deliver_all], which makes
//! multi-node scenarios deterministic. Endpoints that never registered a
//! receive handler keep their datagrams in an inbox instead.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tracing::trace;

use super::{AckCallback, ReceiveHandler, Transport, TransportError};

/// Upper bound on datagrams delivered by a single [MemoryNetwork::deliver_all].
const MAX_DELIVERIES: usize = 100_000;

type Datagram = (SocketAddr, SocketAddr, Bytes);

#[derive(Debug, Default)]
/// Shared medium connecting [MemoryTransport]s.
pub struct MemoryNetwork {
    state: Mutex<NetworkState>,
}

#[derive(Default)]
struct NetworkState {
    next_port: u16,
    endpoints: HashMap<SocketAddr, Endpoint>,
    queue: VecDeque<Datagram>,
    delivered: usize,
}

#[derive(Default)]
struct Endpoint {
    handler: Option<Arc<ReceiveHandler>>,
    inbox: Vec<(SocketAddr, Bytes)>,
}

impl std::fmt::Debug for NetworkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkState")
            .field("endpoints", &self.endpoints.len())
            .field("queued", &self.queue.len())
            .field("delivered", &self.delivered)
            .finish()
    }
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a transport on the next free simulated address.
    pub fn bind(self: &Arc<Self>) -> Arc<MemoryTransport> {
        let mut state = self.state();

        state.next_port = state.next_port.wrapping_add(1);
        let address = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), state.next_port);

        state.endpoints.insert(address, Endpoint::default());

        Arc::new(MemoryTransport {
            address,
            network: self.clone(),
            capacity: Mutex::new(None),
        })
    }

    /// Deliver queued datagrams, including the ones queued while delivering,
    /// until the network is idle. Returns the number of datagrams handled.
    pub fn deliver_all(&self) -> usize {
        let mut count = 0;

        while count < MAX_DELIVERIES {
            let (datagram, handler) = {
                let mut state = self.state();
                let Some(datagram) = state.queue.pop_front() else {
                    break;
                };
                state.delivered += 1;

                let (from, to, bytes) = datagram;
                match state.endpoints.get_mut(&to) {
                    Some(endpoint) => match &endpoint.handler {
                        Some(handler) => ((from, bytes), handler.clone()),
                        None => {
                            endpoint.inbox.push((from, bytes));
                            count += 1;
                            continue;
                        }
                    },
                    None => {
                        trace!(context = "memory_network", ?to, "Datagram sent to the void");
                        count += 1;
                        continue;
                    }
                }
            };

            let (from, bytes) = datagram;
            handler(bytes, from);
            count += 1;
        }

        count
    }

    /// Number of datagrams waiting for [Self::deliver_all].
    pub fn queued(&self) -> usize {
        self.state().queue.len()
    }

    /// Total datagrams taken off the queue since creation.
    pub fn delivered(&self) -> usize {
        self.state().delivered
    }

    fn state(&self) -> std::sync::MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
/// A [Transport] endpoint on a [MemoryNetwork].
pub struct MemoryTransport {
    address: SocketAddr,
    network: Arc<MemoryNetwork>,
    capacity: Mutex<Option<usize>>,
}

impl MemoryTransport {
    /// Drain datagrams received while no handler was registered.
    pub fn take_received(&self) -> Vec<(SocketAddr, Bytes)> {
        let mut state = self.network.state();

        state
            .endpoints
            .get_mut(&self.address)
            .map(|endpoint| std::mem::take(&mut endpoint.inbox))
            .unwrap_or_default()
    }
}

impl Transport for MemoryTransport {
    fn init(&self, capacity: usize) -> Result<(), TransportError> {
        if capacity == 0 {
            return Err(TransportError::InvalidCapacity(capacity));
        }

        *self.capacity.lock().unwrap_or_else(PoisonError::into_inner) = Some(capacity);
        Ok(())
    }

    fn local_address(&self) -> SocketAddr {
        self.address
    }

    fn send(&self, address: SocketAddr, bytes: Bytes, on_ack: AckCallback) {
        if self
            .capacity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
        {
            on_ack(Err(TransportError::NotInitialized));
            return;
        }

        self.network
            .state()
            .queue
            .push_back((self.address, address, bytes));

        on_ack(Ok(()));
    }

    fn remove_connection(&self, _address: &SocketAddr) {}

    fn on_receive(&self, handler: ReceiveHandler) {
        if let Some(endpoint) = self.network.state().endpoints.get_mut(&self.address) {
            endpoint.handler = Some(Arc::new(handler));
        }
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.network.state().endpoints.remove(&self.address);
    }
}
