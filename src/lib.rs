#![doc = include_str!("../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

mod common;
mod error;

// Public modules
pub mod codec;
pub mod router;
pub mod service;
pub mod transport;

pub use crate::common::{
    address_to_bytes, bytes_to_address, bytes_to_nodes, content_id, hash_content, nodes_to_bytes,
    validate_content, ClosestNodes, Id, Message, MessageKind, NodeInfo, RoutingTable, WireMessage,
    CONNECT, FIND_NODES, ID_SIZE, MIN_APPLICATION_KIND, PING,
};
pub use bytes::Bytes;
pub use error::{Error, Result};
pub use router::{Config, Dispatch, Router};

pub use ed25519_dalek::SigningKey;
