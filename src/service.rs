//! Handlers for the overlay's reserved request types.

use bytes::Bytes;
use tracing::debug;

use crate::common::{
    address_to_bytes, bytes_to_address, nodes_to_bytes, Id, Message, NodeInfo,
};
use crate::Router;

/// Handles ping, find-nodes and connect requests addressed to this node.
///
/// Only called for requests, never responses, and only when the local node
/// is the closest known node to the request's destination. Handlers run on
/// the thread that delivered the message, so they need to be fast.
pub trait Service: std::fmt::Debug + Send + Sync {
    fn ping(&self, router: &Router, request: Message);

    fn find_nodes(&self, router: &Router, request: Message);

    fn connect(&self, router: &Router, request: Message);
}

#[derive(Debug, Default, Clone, Copy)]
/// Default implementation of [Service].
///
/// - ping: replies with an empty payload.
/// - find-nodes: replies with the close group around the target carried in
///   the payload (or around the requester) in compact node format.
/// - connect: adds the requester at the compact address carried in the
///   payload, and replies with this node's compact address.
pub struct DefaultService;

impl DefaultService {
    fn reply(router: &Router, request: &Message, payload: impl Into<Bytes>) {
        let reply = request.reply(router.id(), payload);

        if let Err(error) = router.forward(reply) {
            debug!(context = "service", ?error, kind = request.kind, "Could not reply");
        }
    }
}

impl Service for DefaultService {
    fn ping(&self, router: &Router, request: Message) {
        Self::reply(router, &request, Bytes::new());
    }

    fn find_nodes(&self, router: &Router, request: Message) {
        let target = Id::from_bytes(&request.payload).unwrap_or(request.source_id);

        let closest = router
            .routing_table()
            .closest_nodes(&target, router.group_size());

        Self::reply(router, &request, nodes_to_bytes(&closest));
    }

    fn connect(&self, router: &Router, request: Message) {
        let address = match bytes_to_address(&request.payload) {
            Ok(address) if address.ip().is_unspecified() => {
                debug!(context = "service", ?address, "Connect request without reachable address");
                return;
            }
            Ok(address) => address,
            Err(error) => {
                debug!(context = "service", ?error, "Invalid connect request");
                return;
            }
        };

        router.add_node(NodeInfo::new(request.source_id, address));

        let payload = address_to_bytes(&router.local_addr())
            .map(|bytes| bytes.to_vec())
            .unwrap_or_default();

        Self::reply(router, &request, payload);
    }
}
