//! UDP datagram transport.

use std::net::{SocketAddr, UdpSocket};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use lru::LruCache;
use tracing::{debug, trace};

use super::{AckCallback, ReceiveHandler, Transport, TransportError};

pub const DEFAULT_PORT: u16 = 5483;
const MTU: usize = 2048;
/// How long the listener blocks on an empty socket before checking for shutdown.
const READ_TIMEOUT: Duration = Duration::from_millis(10);

type SharedHandler = Arc<RwLock<Option<ReceiveHandler>>>;

/// A [Transport] over a single UDP socket.
///
/// UDP itself is connectionless, addresses are tracked in an LRU of the
/// capacity passed to [Transport::init], evicting the least recently used.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    /// None until [Transport::init].
    connections: Mutex<Option<LruCache<SocketAddr, ()>>>,
    handler: SharedHandler,
    running: Arc<AtomicBool>,
}

impl UdpTransport {
    /// Bind to `port` on all interfaces, or to [DEFAULT_PORT] falling back to
    /// a random port if none is given.
    pub fn new(port: Option<u16>) -> Result<Self, TransportError> {
        let socket = if let Some(port) = port {
            UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], port)))?
        } else {
            match UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))) {
                Ok(socket) => Ok(socket),
                Err(_) => UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0))),
            }?
        };

        Self::from_socket(socket)
    }

    /// Bind to an explicit address.
    pub fn bind(address: SocketAddr) -> Result<Self, TransportError> {
        Self::from_socket(UdpSocket::bind(address)?)
    }

    fn from_socket(socket: UdpSocket) -> Result<Self, TransportError> {
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            connections: Mutex::new(None),
            handler: Arc::new(RwLock::new(None)),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Number of addresses currently tracked.
    pub fn connections(&self) -> usize {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, LruCache::len)
    }

    fn listen(socket: Arc<UdpSocket>, handler: SharedHandler, running: Arc<AtomicBool>) {
        let mut buf = [0u8; MTU];

        while running.load(Ordering::Relaxed) {
            match socket.recv_from(&mut buf) {
                Ok((amt, from)) => {
                    if from.port() == 0 {
                        trace!(context = "socket_validation", "Datagram from port 0");
                        continue;
                    }

                    let bytes = Bytes::copy_from_slice(&buf[..amt]);
                    let handler = handler.read().unwrap_or_else(PoisonError::into_inner);

                    if let Some(handler) = handler.as_ref() {
                        handler(bytes, from);
                    }
                }
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => {
                    trace!(context = "socket_error", ?e, "recv_from failed unexpectedly");
                }
            }
        }

        debug!(context = "socket", "UDP listener stopped");
    }
}

impl std::fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpTransport")
            .field("local_addr", &self.local_addr)
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

impl Transport for UdpTransport {
    fn init(&self, capacity: usize) -> Result<(), TransportError> {
        let capacity =
            NonZeroUsize::new(capacity).ok_or(TransportError::InvalidCapacity(capacity))?;

        {
            let mut connections = self
                .connections
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            match connections.as_mut() {
                Some(connections) => connections.resize(capacity),
                None => *connections = Some(LruCache::new(capacity)),
            }
        }

        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let socket = self.socket.clone();
        let handler = self.handler.clone();
        let running = self.running.clone();

        thread::Builder::new()
            .name("overlay-udp".into())
            .spawn(move || Self::listen(socket, handler, running))?;

        Ok(())
    }

    fn local_address(&self) -> SocketAddr {
        self.local_addr
    }

    fn send(&self, address: SocketAddr, bytes: Bytes, on_ack: AckCallback) {
        if bytes.len() > MTU {
            on_ack(Err(TransportError::TooLarge(bytes.len())));
            return;
        }

        let pushed = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
            .map(|connections| connections.push(address, ()));

        let Some(evicted) = pushed else {
            on_ack(Err(TransportError::NotInitialized));
            return;
        };

        if let Some((evicted, _)) = evicted {
            if evicted != address {
                trace!(context = "socket", ?evicted, "Evicted least recently used address");
            }
        }

        let result = self
            .socket
            .send_to(&bytes, address)
            .map(|_| ())
            .map_err(TransportError::from);

        trace!(context = "socket_message_sending", ?address, size = bytes.len());

        on_ack(result);
    }

    fn remove_connection(&self, address: &SocketAddr) {
        if let Some(connections) = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            connections.pop(address);
        }
    }

    fn on_receive(&self, handler: ReceiveHandler) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
