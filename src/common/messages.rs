//! Overlay messages as seen by the router.
//!
//! Message types below [MIN_APPLICATION_KIND] are reserved for the overlay's
//! own protocol, everything above belongs to applications.

mod internal;

use bytes::Bytes;
use serde_bytes::ByteBuf;

use crate::common::Id;
use crate::Result;

pub use internal::WireMessage;

/// Liveness check.
pub const PING: u32 = 0;
/// Ask a node for the peers it knows closest to a target.
pub const FIND_NODES: u32 = 1;
/// Bootstrap request, asks a node to add the sender to its routing table.
pub const CONNECT: u32 = 2;
/// Smallest message type available to applications.
pub const MIN_APPLICATION_KIND: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Typed view of a message's `kind`.
pub enum MessageKind {
    Ping,
    FindNodes,
    Connect,
    /// Reserved but without a handler.
    Reserved(u32),
    Application(u32),
}

impl From<u32> for MessageKind {
    fn from(kind: u32) -> Self {
        match kind {
            PING => MessageKind::Ping,
            FIND_NODES => MessageKind::FindNodes,
            CONNECT => MessageKind::Connect,
            kind if kind < MIN_APPLICATION_KIND => MessageKind::Reserved(kind),
            kind => MessageKind::Application(kind),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A decoded overlay message.
///
/// Mutated in place as it traverses the router.
pub struct Message {
    /// Correlation id linking a response to its request.
    pub id: u32,
    /// Message type, see [MessageKind].
    pub kind: u32,
    pub source_id: Id,
    pub destination_id: Id,
    pub payload: Bytes,
    /// Whether the payload may be served from, or offered to, content caches.
    pub cacheable: bool,
    /// Set on replicas and replies that should not be treated as new requests.
    pub direct: bool,
    pub response: bool,
    /// How many peers close to the destination receive a replica.
    pub replication: u16,
}

impl Message {
    /// Create a request of `kind` from `source_id` to `destination_id`.
    pub fn new(kind: u32, source_id: Id, destination_id: Id, payload: impl Into<Bytes>) -> Self {
        Message {
            id: 0,
            kind,
            source_id,
            destination_id,
            payload: payload.into(),
            cacheable: false,
            direct: false,
            response: false,
            replication: 0,
        }
    }

    pub fn with_cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    pub fn with_direct(mut self, direct: bool) -> Self {
        self.direct = direct;
        self
    }

    pub fn with_response(mut self, response: bool) -> Self {
        self.response = response;
        self
    }

    pub fn with_replication(mut self, replication: u16) -> Self {
        self.replication = replication;
        self
    }

    pub fn message_kind(&self) -> MessageKind {
        MessageKind::from(self.kind)
    }

    /// Returns `true` for types reserved to the overlay protocol.
    pub fn is_reserved(&self) -> bool {
        self.kind < MIN_APPLICATION_KIND
    }

    /// Build the reply a `responder` sends back to the author of this request.
    pub fn reply(&self, responder: Id, payload: impl Into<Bytes>) -> Message {
        Message {
            id: self.id,
            kind: self.kind,
            source_id: responder,
            destination_id: self.source_id,
            payload: payload.into(),
            cacheable: false,
            direct: true,
            response: true,
            replication: 0,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.to_wire().to_bytes()?)
    }

    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Message> {
        Message::from_wire(WireMessage::from_bytes(bytes.as_ref())?)
    }

    fn to_wire(&self) -> WireMessage {
        WireMessage {
            id: self.id,
            kind: self.kind,
            source_id: ByteBuf::from(self.source_id.to_vec()),
            destination_id: ByteBuf::from(self.destination_id.to_vec()),
            data: ByteBuf::from(self.payload.to_vec()),
            cacheable: self.cacheable.into(),
            direct: self.direct.into(),
            response: self.response.into(),
            replication: self.replication,
        }
    }

    fn from_wire(wire: WireMessage) -> Result<Message> {
        Ok(Message {
            id: wire.id,
            kind: wire.kind,
            source_id: Id::from_bytes(&wire.source_id)?,
            destination_id: Id::from_bytes(&wire.destination_id)?,
            payload: Bytes::from(wire.data.into_vec()),
            cacheable: wire.cacheable > 0,
            direct: wire.direct > 0,
            response: wire.response > 0,
            replication: wire.replication,
        })
    }
}
