//! Message router of the overlay.
//!
//! Every inbound message goes through the same steps: the content cache is
//! consulted, then the message is either forwarded toward a closer peer, or
//! handled locally and replicated to the peers closest to its destination.

mod cache;
mod close_group;
mod config;
mod correlator;
mod notifier;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use ed25519_dalek::{SigningKey, VerifyingKey};
use tracing::{debug, error, info, trace};

use crate::codec::{BencodeCodec, Codec};
use crate::common::{
    address_to_bytes, bytes_to_address, bytes_to_nodes, Id, Message, MessageKind, NodeInfo,
    RoutingTable, CONNECT, FIND_NODES,
};
use crate::service::{DefaultService, Service};
use crate::transport::Transport;
use crate::{Error, Result};

pub use cache::{ContentCache, DEFAULT_CACHE_SIZE_HINT};
pub use close_group::{
    CloseGroupDifference, GroupChangeAgreement, QuorumAgreement, GROUP_SIZE, MAX_PROPOSALS,
    QUORUM_SIZE,
};
pub use config::{Config, DEFAULT_CONNECTION_CAPACITY, DEFAULT_REQUEST_TIMEOUT};
pub use correlator::{Correlator, ResponseCallback};
pub use notifier::{Notifier, SubscriptionId};

/// How often pending requests are checked for expiry.
const REAPER_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq)]
/// What [Router::process_message] did with a message.
pub enum Dispatch {
    /// A cached payload was sent back toward the requester.
    AnsweredFromCache,
    /// Passed on, unchanged, to the closest known peer with this id.
    Forwarded(Id),
    /// A reserved request handed to the [Service].
    Serviced(MessageKind),
    /// A reserved response that completed a pending request.
    Completed,
    /// Handled as an application message.
    Delivered {
        /// Whether "message received" observers were notified.
        notified: bool,
        /// Whether the message completed a pending request.
        completed: bool,
        /// Number of replicas sent to peers close to the destination.
        replicas: usize,
    },
    /// Nothing could be done with this message.
    Dropped,
}

struct CloseGroupState {
    members: Vec<Id>,
    agreement: Box<dyn GroupChangeAgreement>,
}

impl CloseGroupState {
    /// Apply an accepted difference, keeping the `group_size` members
    /// closest to `local`.
    fn apply(&mut self, difference: &CloseGroupDifference, local: &Id, group_size: usize) {
        self.members.retain(|id| !difference.leaving.contains(id));

        for id in &difference.entering {
            if !self.members.contains(id) {
                self.members.push(*id);
            }
        }

        self.members.sort_by(|a, b| local.cmp_distance(a, b));
        self.members.truncate(group_size);
    }
}

struct Inner {
    id: Id,
    signing_key: Option<SigningKey>,
    group_size: usize,
    quorum_size: usize,
    request_timeout: Duration,

    routing_table: RwLock<RoutingTable>,
    correlator: Correlator,
    cache: ContentCache,

    transport: Arc<dyn Transport>,
    codec: Box<dyn Codec>,
    service: Box<dyn Service>,

    message_received: Notifier<(u32, Message)>,
    network_status: Notifier<usize>,

    bootstrap: Mutex<Vec<SocketAddr>>,
    close_group: Mutex<CloseGroupState>,

    /// Dropping the sender stops the reaper thread.
    _reaper: flume::Sender<()>,
}

#[derive(Clone)]
/// Handle to a running overlay node.
///
/// Cheap to clone, all clones share the same routing table, pending
/// requests and cache. The node stops when the last clone is dropped.
///
/// Observers that capture a clone keep the node alive for as long as they
/// stay subscribed.
pub struct Router {
    inner: Arc<Inner>,
}

impl Router {
    /// Start a node on `transport`.
    ///
    /// Initializes the transport, starts expiring timed out requests, and
    /// joins the overlay if `config.bootstrap` is not empty.
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Result<Router> {
        config.validate()?;

        let id = config.resolve_id();

        transport.init(config.connection_capacity)?;

        let (reaper_tx, reaper_rx) = flume::bounded::<()>(1);

        let Config {
            signing_key,
            bootstrap,
            group_size,
            quorum_size,
            cache_size_hint,
            request_timeout,
            service,
            codec,
            agreement,
            ..
        } = config;

        let inner = Arc::new(Inner {
            id,
            signing_key,
            group_size,
            quorum_size,
            request_timeout,

            routing_table: RwLock::new(RoutingTable::new(id)),
            correlator: Correlator::new(),
            cache: ContentCache::new(cache_size_hint),

            transport: transport.clone(),
            codec: codec.unwrap_or_else(|| Box::new(BencodeCodec)),
            service: service.unwrap_or_else(|| Box::new(DefaultService)),

            message_received: Notifier::new(),
            network_status: Notifier::new(),

            bootstrap: Mutex::new(bootstrap),
            close_group: Mutex::new(CloseGroupState {
                members: Vec::new(),
                agreement: agreement.unwrap_or_else(|| Box::new(QuorumAgreement::new(quorum_size))),
            }),

            _reaper: reaper_tx,
        });

        let weak = Arc::downgrade(&inner);
        transport.on_receive(Box::new(move |bytes, from| {
            if let Some(inner) = weak.upgrade() {
                let router = Router { inner };
                if let Err(error) = router.receive(&bytes, from) {
                    debug!(context = "router", ?error, ?from, "Dropping undecodable message");
                }
            }
        }));

        let weak = Arc::downgrade(&inner);
        thread::Builder::new()
            .name("overlay request reaper".to_string())
            .spawn(move || run_reaper(weak, reaper_rx))?;

        let router = Router { inner };

        info!(
            context = "router",
            id = %router.id(),
            address = ?router.local_addr(),
            "Router started"
        );

        if !router.bootstrap().is_empty() {
            router.join();
        }

        Ok(router)
    }

    // === Getters ===

    /// Returns the id of this node.
    #[inline]
    pub fn id(&self) -> Id {
        self.inner.id
    }

    /// Returns the address the transport is reachable at.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.transport.local_address()
    }

    /// Returns the public key of this node, if it was configured with a signing key.
    pub fn verifying_key(&self) -> Option<VerifyingKey> {
        self.inner
            .signing_key
            .as_ref()
            .map(SigningKey::verifying_key)
    }

    /// Returns a snapshot of the routing table.
    pub fn routing_table(&self) -> RoutingTable {
        self.table().clone()
    }

    /// Number of peers in the routing table.
    pub fn size(&self) -> usize {
        self.table().size()
    }

    pub fn group_size(&self) -> usize {
        self.inner.group_size
    }

    pub fn quorum_size(&self) -> usize {
        self.inner.quorum_size
    }

    pub fn cache(&self) -> &ContentCache {
        &self.inner.cache
    }

    /// Number of sent requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.correlator.len()
    }

    /// Addresses used by [Router::join].
    pub fn bootstrap(&self) -> Vec<SocketAddr> {
        self.inner
            .bootstrap
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Observers of application messages handled by this node, called with
    /// the message type and the message.
    pub fn on_message_received(&self) -> &Notifier<(u32, Message)> {
        &self.inner.message_received
    }

    /// Observers of routing table changes, called with the number of peers.
    pub fn on_network_status(&self) -> &Notifier<usize> {
        &self.inner.network_status
    }

    // === Membership ===

    /// Add a peer, returns `true` if it was not known yet.
    pub fn add_node(&self, node: NodeInfo) -> bool {
        let (added, size) = {
            let mut table = self.table_mut();
            let added = table.add(node);
            (added, table.size())
        };

        if added {
            info!(context = "router", id = %node.id, address = ?node.address, size, "Added node");
            self.membership_changed(size);
        }

        added
    }

    /// Drop the peer with this id and its transport connection.
    pub fn drop_node(&self, node_id: &Id) -> Option<NodeInfo> {
        let (removed, size) = {
            let mut table = self.table_mut();
            let removed = table.remove(node_id);
            (removed, table.size())
        };

        self.node_dropped(removed, size)
    }

    /// Drop the peer reachable at `address` and its transport connection.
    pub fn drop_node_by_address(&self, address: &SocketAddr) -> Option<NodeInfo> {
        let (removed, size) = {
            let mut table = self.table_mut();
            let removed = table.remove_by_address(address);
            (removed, table.size())
        };

        self.node_dropped(removed, size)
    }

    fn node_dropped(&self, removed: Option<NodeInfo>, size: usize) -> Option<NodeInfo> {
        let node = removed?;

        self.inner.transport.remove_connection(&node.address);
        info!(context = "router", id = %node.id, address = ?node.address, size, "Dropped node");
        self.membership_changed(size);

        Some(node)
    }

    fn membership_changed(&self, size: usize) {
        self.update_close_group();
        self.inner.network_status.notify(&size);
    }

    // === Close group ===

    /// Agreed ids of the peers closest to this node, nearest first.
    ///
    /// Membership changes are proposed to the [GroupChangeAgreement] and the
    /// group only changes once a difference is accepted.
    pub fn close_group(&self) -> Vec<Id> {
        self.close_group_state().members.clone()
    }

    /// Record that `observer` reports `difference` in the close group of this
    /// node, returns the difference once enough observers agreed on it.
    ///
    /// Only an accepted difference changes [Router::close_group].
    pub fn observe_close_group_change(
        &self,
        observer: Id,
        difference: &CloseGroupDifference,
    ) -> Option<CloseGroupDifference> {
        let mut state = self.close_group_state();
        let accepted = state.agreement.observe(observer, difference)?;
        state.apply(&accepted, &self.inner.id, self.inner.group_size);
        drop(state);

        info!(
            context = "close_group",
            entering = accepted.entering.len(),
            leaving = accepted.leaving.len(),
            "Close group change accepted"
        );

        Some(accepted)
    }

    /// Propose the difference between the agreed close group and the
    /// closest peers in the local routing table, as this node's own
    /// observation.
    fn update_close_group(&self) {
        let closest: Vec<Id> = self
            .table()
            .closest_nodes(&self.inner.id, self.inner.group_size)
            .iter()
            .map(|node| node.id)
            .collect();

        let mut state = self.close_group_state();
        let difference = CloseGroupDifference::between(&state.members, &closest);
        if difference.is_empty() {
            return;
        }

        debug!(
            context = "close_group",
            entering = ?difference.entering,
            leaving = ?difference.leaving,
            "Proposing close group change"
        );

        if let Some(accepted) = state.agreement.observe(self.inner.id, &difference) {
            state.apply(&accepted, &self.inner.id, self.inner.group_size);
            drop(state);

            info!(
                context = "close_group",
                entering = accepted.entering.len(),
                leaving = accepted.leaving.len(),
                "Close group change accepted"
            );
        }
    }

    // === Sending ===

    /// Send an application request toward its `destination_id`.
    ///
    /// `callback` is invoked exactly once, with the response or with
    /// [Error::RequestTimeout]. Returns the correlation id stamped on the
    /// message.
    pub fn send<F>(&self, mut message: Message, callback: F) -> Result<u32>
    where
        F: FnOnce(Result<Message>) + Send + 'static,
    {
        if message.is_reserved() {
            error!(
                context = "router",
                kind = message.kind,
                "Applications may not send reserved message types"
            );
            return Err(Error::ReservedTypeViolation(message.kind));
        }

        let next_hop = self.table().closest_node(&message.destination_id, 0)?;

        let id = self
            .inner
            .correlator
            .register(Box::new(callback), self.inner.request_timeout)?;
        message.id = id;

        trace!(context = "router", id, kind = message.kind, to = %next_hop.id, "Sending request");

        if let Err(error) = self.transmit(next_hop.address, &message) {
            let _ = self.inner.correlator.fail(id, error);
        }

        Ok(id)
    }

    /// Send an application request and block until its response or timeout.
    pub fn send_blocking(&self, message: Message) -> Result<Message> {
        let (tx, rx) = flume::bounded(1);

        let id = self.send(message, move |result| {
            let _ = tx.send(result);
        })?;

        rx.recv().unwrap_or(Err(Error::RequestTimeout(id)))
    }

    #[cfg(feature = "async")]
    /// Async version of [Router::send_blocking].
    pub async fn send_async(&self, message: Message) -> Result<Message> {
        let (tx, rx) = flume::bounded(1);

        let id = self.send(message, move |result| {
            let _ = tx.send(result);
        })?;

        rx.recv_async()
            .await
            .unwrap_or(Err(Error::RequestTimeout(id)))
    }

    /// Pass `message` on to the closest known peer to its destination,
    /// without waiting for any response. Returns the id of that peer.
    pub fn forward(&self, message: Message) -> Result<Id> {
        let next_hop = self.table().closest_node(&message.destination_id, 0)?;

        self.transmit(next_hop.address, &message)?;

        Ok(next_hop.id)
    }

    /// Send a reserved request straight to `address`, correlating its response.
    ///
    /// The request is marked `direct`, so the node at `address` handles it
    /// even if it knows peers closer to the destination.
    fn request_to<F>(&self, address: SocketAddr, mut message: Message, callback: F) -> Result<u32>
    where
        F: FnOnce(Result<Message>) + Send + 'static,
    {
        let id = self
            .inner
            .correlator
            .register(Box::new(callback), self.inner.request_timeout)?;
        message.id = id;
        message.direct = true;

        if let Err(error) = self.transmit(address, &message) {
            let _ = self.inner.correlator.fail(id, error);
        }

        Ok(id)
    }

    fn transmit(&self, address: SocketAddr, message: &Message) -> Result<()> {
        let bytes = self.inner.codec.encode(message)?;
        let id = message.id;

        self.inner.transport.send(
            address,
            bytes,
            Box::new(move |result| {
                if let Err(error) = result {
                    debug!(context = "router", ?error, ?address, id, "Send failed");
                }
            }),
        );

        Ok(())
    }

    // === Receiving ===

    /// Decode a datagram received from `from` and process it.
    ///
    /// A connect request advertising no usable address, such as the
    /// unspecified address of a socket bound to all interfaces, gets `from`
    /// as the address of the requester.
    pub fn receive(&self, bytes: &[u8], from: SocketAddr) -> Result<Dispatch> {
        let mut message = self.inner.codec.decode(bytes)?;

        if message.kind == CONNECT && message.direct && !message.response {
            let advertised = bytes_to_address(&message.payload)
                .ok()
                .filter(|address| !address.ip().is_unspecified());

            if advertised.is_none() {
                if let Some(address) = address_to_bytes(&from) {
                    trace!(context = "router", ?from, "Connect request address taken from origin");
                    message.payload = bytes::Bytes::copy_from_slice(&address);
                }
            }
        }

        trace!(
            context = "router",
            ?from,
            id = message.id,
            kind = message.kind,
            response = message.response,
            "Received message"
        );

        Ok(self.process_message(message))
    }

    /// Decide what to do with an inbound message, and do it.
    ///
    /// A cacheable request is answered from the content cache when possible.
    /// Otherwise the message is forwarded to the closest known peer, unless
    /// this node is the closest one, or it is a reserved request sent
    /// straight to this node.
    ///
    /// Handled locally, reserved messages go to the [Service] or complete a
    /// pending request and are never fanned out. Application messages are
    /// reported to observers, complete a pending request when they are a
    /// response, and are then replicated to the close peers of their
    /// destination. Messages arriving `direct` are replicas or replies to a
    /// known address and are not fanned out again.
    pub fn process_message(&self, message: Message) -> Dispatch {
        if message.cacheable {
            if message.response {
                if let Err(error) = self
                    .inner
                    .cache
                    .add(message.source_id, message.payload.clone())
                {
                    debug!(context = "router", ?error, "Rejected cache candidate");
                }
            } else if let Some(payload) = self.inner.cache.lookup(&message.source_id) {
                return self.answer_from_cache(message, payload);
            }
        }

        // Reserved requests sent to our address rather than routed by id.
        let addressed_to_us = message.is_reserved() && message.direct && !message.response;

        let next_hop = {
            let table = self.table();
            if addressed_to_us || table.am_i_closest(&message.destination_id) {
                None
            } else {
                table.closest_node(&message.destination_id, 0).ok()
            }
        };

        if let Some(next_hop) = next_hop {
            trace!(context = "router", id = message.id, to = %next_hop.id, "Forwarding");

            return match self.transmit(next_hop.address, &message) {
                Ok(()) => Dispatch::Forwarded(next_hop.id),
                Err(error) => {
                    debug!(context = "router", ?error, "Could not forward message");
                    Dispatch::Dropped
                }
            };
        }

        if message.is_reserved() {
            return self.handle_reserved(message);
        }

        let mut notified = false;
        if !message.direct && message.destination_id != self.inner.id {
            self.inner
                .message_received
                .notify(&(message.kind, message.clone()));
            notified = true;
        }

        let completed = message.response
            && self
                .inner
                .correlator
                .complete(message.id, message.clone())
                .is_ok();

        // Replicas are already the fan-out of another node.
        let replicas = if message.direct {
            0
        } else {
            self.replicate(message)
        };

        Dispatch::Delivered {
            notified,
            completed,
            replicas,
        }
    }

    fn handle_reserved(&self, message: Message) -> Dispatch {
        if message.response {
            return match self.inner.correlator.complete(message.id, message) {
                Ok(()) => Dispatch::Completed,
                Err(error) => {
                    debug!(context = "router", ?error, "Ignoring response");
                    Dispatch::Dropped
                }
            };
        }

        let kind = message.message_kind();
        let service = &self.inner.service;

        match kind {
            MessageKind::Ping => service.ping(self, message),
            MessageKind::FindNodes => service.find_nodes(self, message),
            MessageKind::Connect => service.connect(self, message),
            _ => {
                debug!(context = "router", kind = message.kind, "No handler for reserved type");
                return Dispatch::Dropped;
            }
        }

        Dispatch::Serviced(kind)
    }

    fn answer_from_cache(&self, request: Message, payload: bytes::Bytes) -> Dispatch {
        let response = Message {
            source_id: request.destination_id,
            destination_id: request.source_id,
            payload,
            cacheable: true,
            direct: true,
            response: true,
            ..request
        };

        trace!(context = "router", id = response.id, "Answering from cache");

        match self.forward(response) {
            Ok(_) => Dispatch::AnsweredFromCache,
            Err(error) => {
                debug!(context = "router", ?error, "Could not answer from cache");
                Dispatch::Dropped
            }
        }
    }

    /// Send a copy of `message` to each of the `replication` peers closest to
    /// its destination, returns the number of copies sent.
    fn replicate(&self, mut message: Message) -> usize {
        if message.replication == 0 {
            return 0;
        }

        let peers = self
            .table()
            .closest_nodes(&message.destination_id, message.replication.into());

        message.direct = true;
        message.source_id = self.inner.id;

        let mut sent = 0;
        for peer in peers {
            message.destination_id = peer.id;

            match self.transmit(peer.address, &message) {
                Ok(()) => sent += 1,
                Err(error) => debug!(context = "router", ?error, to = %peer.id, "Replica not sent"),
            }
        }

        sent
    }

    // === Bootstrap ===

    /// Send a connect request to every bootstrap address, returns the number
    /// of requests sent.
    ///
    /// Every node answering is added to the routing table, and asked for the
    /// nodes it knows closest to this node, which are connected to in turn.
    pub fn join(&self) -> usize {
        let bootstrap = self.bootstrap();

        info!(context = "router", bootstrap = ?bootstrap, "Joining the overlay");

        bootstrap
            .into_iter()
            .filter(|address| self.connect_to(*address).is_ok())
            .count()
    }

    /// Forget every known peer and join again through `address` only.
    pub fn bootstrap_from(&self, address: SocketAddr) -> usize {
        let dropped = {
            let mut table = self.table_mut();
            let nodes = table.to_owned_nodes();
            for node in &nodes {
                table.remove(&node.id);
            }
            nodes
        };

        for node in &dropped {
            self.inner.transport.remove_connection(&node.address);
        }

        info!(context = "router", dropped = dropped.len(), ?address, "Rebootstrapping");
        self.membership_changed(0);

        *self
            .inner
            .bootstrap
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = vec![address];

        self.join()
    }

    fn connect_to(&self, address: SocketAddr) -> Result<u32> {
        let payload = address_to_bytes(&self.local_addr())
            .map(|bytes| bytes.to_vec())
            .unwrap_or_default();
        let request = Message::new(CONNECT, self.inner.id, self.inner.id, payload);

        let weak = Arc::downgrade(&self.inner);

        self.request_to(address, request, move |result| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let router = Router { inner };

            match result {
                Ok(response) => router.on_connect_response(response, address),
                Err(error) => debug!(context = "router", ?error, ?address, "Connect failed"),
            }
        })
    }

    fn on_connect_response(&self, response: Message, fallback: SocketAddr) {
        let address = match bytes_to_address(&response.payload) {
            Ok(address) if !address.ip().is_unspecified() => address,
            _ => fallback,
        };

        self.add_node(NodeInfo::new(response.source_id, address));

        let request = Message::new(
            FIND_NODES,
            self.inner.id,
            response.source_id,
            self.inner.id.to_vec(),
        );
        let weak = Arc::downgrade(&self.inner);

        let result = self.request_to(address, request, move |result| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let router = Router { inner };

            match result {
                Ok(response) => router.on_find_nodes_response(response),
                Err(error) => debug!(context = "router", ?error, ?address, "Find nodes failed"),
            }
        });

        if let Err(error) = result {
            debug!(context = "router", ?error, "Could not ask for closer nodes");
        }
    }

    fn on_find_nodes_response(&self, response: Message) {
        let nodes = match bytes_to_nodes(&response.payload) {
            Ok(nodes) => nodes,
            Err(error) => {
                debug!(context = "router", ?error, "Invalid find nodes response");
                return;
            }
        };

        let unknown: Vec<NodeInfo> = {
            let table = self.table();
            nodes
                .into_iter()
                .filter(|node| node.id != self.inner.id && table.get(&node.id).is_none())
                .collect()
        };

        for node in unknown {
            if let Err(error) = self.connect_to(node.address) {
                debug!(context = "router", ?error, "Could not connect");
            }
        }
    }

    // === Private Methods ===

    fn table(&self) -> std::sync::RwLockReadGuard<'_, RoutingTable> {
        self.inner
            .routing_table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn table_mut(&self) -> std::sync::RwLockWriteGuard<'_, RoutingTable> {
        self.inner
            .routing_table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn close_group_state(&self) -> std::sync::MutexGuard<'_, CloseGroupState> {
        self.inner
            .close_group
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("id", &self.inner.id)
            .field("transport", &self.inner.transport)
            .field("size", &self.size())
            .field("pending_requests", &self.pending_requests())
            .finish()
    }
}

fn run_reaper(inner: Weak<Inner>, stop: flume::Receiver<()>) {
    loop {
        match stop.recv_timeout(REAPER_INTERVAL) {
            Err(flume::RecvTimeoutError::Timeout) => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.correlator.expire(Instant::now());
            }
            _ => break,
        }
    }

    trace!(context = "router", "Request reaper stopped");
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;

    use super::*;
    use crate::common::{content_id, ID_SIZE, PING};
    use crate::transport::memory::{MemoryNetwork, MemoryTransport};

    /// Id at XOR `distance` from `target`.
    fn id_at_distance(target: &Id, distance: u8) -> Id {
        let mut bytes = *target.as_bytes();
        bytes[ID_SIZE - 1] ^= distance;
        Id::from(bytes)
    }

    fn router(network: &Arc<MemoryNetwork>, id: Id) -> Router {
        Router::new(
            Config {
                id: Some(id),
                ..Default::default()
            },
            network.bind(),
        )
        .unwrap()
    }

    /// A peer that only records what it receives.
    fn bare_peer(network: &Arc<MemoryNetwork>, id: Id) -> (NodeInfo, Arc<MemoryTransport>) {
        let transport = network.bind();
        (NodeInfo::new(id, transport.local_address()), transport)
    }

    fn received(transport: &MemoryTransport) -> Vec<Message> {
        transport
            .take_received()
            .into_iter()
            .map(|(_, bytes)| BencodeCodec.decode(&bytes).unwrap())
            .collect()
    }

    #[test]
    fn replicates_to_closest_peers() {
        let network = MemoryNetwork::new();
        let destination = Id::random();

        let router = router(&network, id_at_distance(&destination, 1));

        let peers: Vec<_> = [2, 3, 4, 5]
            .iter()
            .map(|distance| bare_peer(&network, id_at_distance(&destination, *distance)))
            .collect();
        for (node, _) in &peers {
            router.add_node(*node);
        }

        let message = Message::new(150, Id::random(), destination, &b"data"[..]).with_replication(2);

        let dispatch = router.process_message(message);

        assert_eq!(
            dispatch,
            Dispatch::Delivered {
                notified: true,
                completed: false,
                replicas: 2
            }
        );
        assert_eq!(network.queued(), 2);
        network.deliver_all();

        for (index, (node, transport)) in peers.iter().enumerate() {
            let messages = received(transport);

            if index < 2 {
                assert_eq!(messages.len(), 1);
                let replica = &messages[0];
                assert!(replica.direct);
                assert_eq!(replica.source_id, router.id());
                assert_eq!(replica.destination_id, node.id);
                assert_eq!(replica.payload.as_ref(), b"data");
            } else {
                assert!(messages.is_empty());
            }
        }
    }

    #[test]
    fn replicas_are_not_replicated_again() {
        let network = MemoryNetwork::new();
        let router = router(&network, Id::random());
        let (peer, _transport) = bare_peer(&network, Id::random());
        router.add_node(peer);

        let replica = Message::new(150, peer.id, router.id(), Bytes::new())
            .with_direct(true)
            .with_replication(4);

        assert_eq!(
            router.process_message(replica),
            Dispatch::Delivered {
                notified: false,
                completed: false,
                replicas: 0
            }
        );
        assert_eq!(network.queued(), 0);
    }

    fn connect_request(peer: &NodeInfo, advertised: SocketAddr) -> Message {
        let payload = address_to_bytes(&advertised).unwrap().to_vec();
        let mut request = Message::new(CONNECT, peer.id, peer.id, payload).with_direct(true);
        request.id = 7;
        request
    }

    #[test]
    fn connect_from_unspecified_address_uses_origin() {
        let network = MemoryNetwork::new();
        let router = router(&network, Id::random());
        let (peer, transport) = bare_peer(&network, Id::random());

        let unspecified = SocketAddr::from(([0, 0, 0, 0], peer.address.port()));
        let bytes = BencodeCodec
            .encode(&connect_request(&peer, unspecified))
            .unwrap();

        assert_eq!(
            router.receive(&bytes, peer.address).unwrap(),
            Dispatch::Serviced(MessageKind::Connect)
        );
        assert_eq!(router.routing_table().get(&peer.id), Some(&peer));

        network.deliver_all();
        let replies = received(&transport);

        assert_eq!(replies.len(), 1);
        assert!(replies[0].response);
        assert_eq!(replies[0].id, 7);
        assert_eq!(
            bytes_to_address(&replies[0].payload).unwrap(),
            router.local_addr()
        );
    }

    #[test]
    fn connect_without_reachable_address_is_ignored() {
        let network = MemoryNetwork::new();
        let router = router(&network, Id::random());
        let (peer, transport) = bare_peer(&network, Id::random());

        let unspecified = SocketAddr::from(([0, 0, 0, 0], peer.address.port()));

        assert_eq!(
            router.process_message(connect_request(&peer, unspecified)),
            Dispatch::Serviced(MessageKind::Connect)
        );
        assert_eq!(router.size(), 0);

        network.deliver_all();
        assert!(received(&transport).is_empty());
    }

    #[test]
    fn answers_from_cache() {
        let network = MemoryNetwork::new();
        let router = router(&network, Id::random());

        let payload = Bytes::from_static(b"cached content");
        let key = content_id(&payload);
        router.cache().add(key, payload.clone()).unwrap();

        // The requester's id doubles as the content address.
        let (requester, transport) = bare_peer(&network, key);
        router.add_node(requester);

        let destination = Id::random();
        let mut request = Message::new(150, key, destination, Bytes::new())
            .with_cacheable(true)
            .with_replication(3);
        request.id = 9;

        assert_eq!(router.process_message(request), Dispatch::AnsweredFromCache);
        assert_eq!(network.queued(), 1);
        network.deliver_all();

        let messages = received(&transport);
        assert_eq!(messages.len(), 1);

        let response = &messages[0];
        assert_eq!(response.id, 9);
        assert_eq!(response.source_id, destination);
        assert_eq!(response.destination_id, key);
        assert_eq!(response.payload, payload);
        assert!(response.response && response.direct && response.cacheable);
    }

    #[test]
    fn cacheable_responses_feed_the_cache() {
        let network = MemoryNetwork::new();
        let router = router(&network, Id::random());

        let payload = Bytes::from_static(b"content");
        let key = content_id(&payload);

        let response = Message::new(150, key, router.id(), payload.clone())
            .with_cacheable(true)
            .with_response(true)
            .with_direct(true);
        router.process_message(response);

        assert_eq!(router.cache().lookup(&key), Some(payload));

        // Wrong content for its id is rejected.
        let forged = Message::new(150, Id::random(), router.id(), &b"forged"[..])
            .with_cacheable(true)
            .with_response(true)
            .with_direct(true);
        router.process_message(forged);

        assert_eq!(router.cache().len(), 1);
    }

    #[test]
    fn forwards_when_not_closest() {
        let network = MemoryNetwork::new();
        let destination = Id::random();
        let router = router(&network, id_at_distance(&destination, 9));

        let (near, near_transport) = bare_peer(&network, id_at_distance(&destination, 1));
        let (far, _far_transport) = bare_peer(&network, id_at_distance(&destination, 3));
        router.add_node(near);
        router.add_node(far);

        let message = Message::new(150, Id::random(), destination, &b"hop"[..]).with_replication(2);

        assert_eq!(
            router.process_message(message.clone()),
            Dispatch::Forwarded(near.id)
        );
        network.deliver_all();

        assert_eq!(received(&near_transport), vec![message]);
    }

    #[test]
    fn reserved_send_is_rejected() {
        let network = MemoryNetwork::new();
        let router = router(&network, Id::random());
        let (peer, _transport) = bare_peer(&network, Id::random());
        router.add_node(peer);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result = router.send(Message::new(PING, router.id(), peer.id, Bytes::new()), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(matches!(result, Err(Error::ReservedTypeViolation(PING))));
        assert_eq!(router.pending_requests(), 0);
        assert_eq!(network.queued(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn send_with_empty_table() {
        let network = MemoryNetwork::new();
        let router = router(&network, Id::random());

        let result = router.send(Message::new(150, router.id(), Id::random(), Bytes::new()), |_| {});

        assert!(matches!(result, Err(Error::EmptyRoutingTable)));
        assert_eq!(router.pending_requests(), 0);
    }

    #[test]
    fn send_stamps_correlation_id() {
        let network = MemoryNetwork::new();
        let router = router(&network, Id::random());
        let (peer, transport) = bare_peer(&network, Id::random());
        router.add_node(peer);

        let id = router
            .send(Message::new(150, router.id(), Id::random(), Bytes::new()), |_| {})
            .unwrap();

        assert_eq!(router.pending_requests(), 1);
        network.deliver_all();

        let messages = received(&transport);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, id);
    }

    #[test]
    fn response_completes_request() {
        let network = MemoryNetwork::new();
        let router = router(&network, Id::random());
        let (peer, _transport) = bare_peer(&network, Id::random());
        router.add_node(peer);

        let (tx, rx) = flume::bounded(1);
        let request = Message::new(150, router.id(), peer.id, &b"question"[..]);
        let id = router
            .send(request.clone(), move |result| {
                let _ = tx.send(result);
            })
            .unwrap();

        let mut stamped = request;
        stamped.id = id;
        let response = stamped.reply(peer.id, &b"answer"[..]);

        assert_eq!(
            router.process_message(response.clone()),
            Dispatch::Delivered {
                notified: false,
                completed: true,
                replicas: 0
            }
        );
        assert_eq!(rx.recv().unwrap().unwrap(), response);
        assert_eq!(router.pending_requests(), 0);
    }

    #[test]
    fn request_times_out() {
        let network = MemoryNetwork::new();
        let router = Router::new(
            Config {
                request_timeout: Duration::from_millis(50),
                ..Default::default()
            },
            network.bind(),
        )
        .unwrap();
        let (peer, _transport) = bare_peer(&network, Id::random());
        router.add_node(peer);

        let result = router.send_blocking(Message::new(150, router.id(), peer.id, Bytes::new()));

        assert!(matches!(result, Err(Error::RequestTimeout(_))));
        assert_eq!(router.pending_requests(), 0);
    }

    #[test]
    fn panicking_observer_is_isolated() {
        let network = MemoryNetwork::new();
        let router = router(&network, Id::random());

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        router.on_message_received().subscribe(|_| panic!("observer failure"));
        router.on_message_received().subscribe(move |(kind, _)| {
            assert_eq!(*kind, 150);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let message = Message::new(150, Id::random(), Id::random(), Bytes::new());
        router.process_message(message.clone());
        router.process_message(message);

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn network_status() {
        let network = MemoryNetwork::new();
        let router = router(&network, Id::random());

        let (tx, rx) = flume::unbounded();
        router.on_network_status().subscribe(move |size| {
            let _ = tx.send(*size);
        });

        let node = NodeInfo::random();
        assert!(router.add_node(node));
        assert!(!router.add_node(node));

        assert_eq!(router.drop_node_by_address(&node.address), Some(node));
        assert_eq!(router.drop_node(&node.id), None);

        assert_eq!(rx.drain().collect::<Vec<_>>(), vec![1, 0]);
    }

    #[test]
    fn close_group_agreement() {
        let network = MemoryNetwork::new();
        let router = Router::new(
            Config {
                group_size: 4,
                quorum_size: 2,
                ..Default::default()
            },
            network.bind(),
        )
        .unwrap();

        let difference = CloseGroupDifference {
            entering: vec![Id::random()],
            leaving: vec![],
        };

        assert_eq!(router.observe_close_group_change(Id::random(), &difference), None);
        assert!(router.close_group().is_empty());
        assert_eq!(
            router.observe_close_group_change(Id::random(), &difference),
            Some(difference.clone())
        );
        assert_eq!(router.close_group(), difference.entering);
    }

    #[test]
    fn close_group_changes_only_at_quorum() {
        let network = MemoryNetwork::new();
        let router = Router::new(
            Config {
                group_size: 4,
                quorum_size: 3,
                ..Default::default()
            },
            network.bind(),
        )
        .unwrap();

        let node = NodeInfo::random();
        let entering = CloseGroupDifference {
            entering: vec![node.id],
            leaving: vec![],
        };

        // The local routing table counts as one observation.
        assert!(router.add_node(node));
        assert!(router.close_group().is_empty());

        assert_eq!(router.observe_close_group_change(Id::random(), &entering), None);
        assert!(router.close_group().is_empty());

        assert_eq!(
            router.observe_close_group_change(Id::random(), &entering),
            Some(entering)
        );
        assert_eq!(router.close_group(), vec![node.id]);

        let leaving = CloseGroupDifference {
            entering: vec![],
            leaving: vec![node.id],
        };

        assert!(router.drop_node(&node.id).is_some());
        assert_eq!(router.close_group(), vec![node.id]);

        assert_eq!(router.observe_close_group_change(Id::random(), &leaving), None);
        assert_eq!(router.close_group(), vec![node.id]);

        assert_eq!(
            router.observe_close_group_change(Id::random(), &leaving),
            Some(leaving)
        );
        assert!(router.close_group().is_empty());
    }

    #[test]
    fn close_group_keeps_nearest_members() {
        let network = MemoryNetwork::new();
        let local = Id::random();
        let router = Router::new(
            Config {
                id: Some(local),
                group_size: 2,
                quorum_size: 1,
                ..Default::default()
            },
            network.bind(),
        )
        .unwrap();

        let far = NodeInfo::new(id_at_distance(&local, 200), "127.0.0.1:3000".parse().unwrap());
        let near = NodeInfo::new(id_at_distance(&local, 1), "127.0.0.1:3001".parse().unwrap());
        let middle = NodeInfo::new(id_at_distance(&local, 50), "127.0.0.1:3002".parse().unwrap());

        router.add_node(far);
        assert_eq!(router.close_group(), vec![far.id]);

        router.add_node(near);
        router.add_node(middle);
        assert_eq!(router.close_group(), vec![near.id, middle.id]);
    }

    #[test]
    fn invalid_config() {
        let network = MemoryNetwork::new();

        let result = Router::new(
            Config {
                group_size: 0,
                ..Default::default()
            },
            network.bind(),
        );

        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }
}
