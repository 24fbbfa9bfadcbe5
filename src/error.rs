//! Main Crate Error

use crate::common::Id;
use crate::transport::TransportError;

#[derive(thiserror::Error, Debug)]
/// Overlay routing error enum.
pub enum Error {
    /// An application tried to send a message with a type below
    /// [MIN_APPLICATION_KIND](crate::MIN_APPLICATION_KIND).
    #[error("Message type {0} is reserved for internal protocol use")]
    ReservedTypeViolation(u32),

    /// A cache candidate whose content id is not the hash of its payload.
    #[error("Content id {0} does not match the hash of its payload")]
    CacheIntegrityFailure(Id),

    /// No response arrived within the request timeout.
    #[error("Request {0} timed out")]
    RequestTimeout(u32),

    /// A completion referenced a request id that is not pending.
    #[error("No pending request with id {0}")]
    UnknownCorrelationId(u32),

    /// A closeness query had no peers to compare against, or fewer peers
    /// than the requested rank of [RoutingTable::closest_node](crate::RoutingTable::closest_node).
    #[error("Routing table is empty")]
    EmptyRoutingTable,

    /// Could not draw a request id that is not already pending.
    #[error("Could not allocate a free request id after {0} attempts")]
    CorrelationIdsExhausted(usize),

    #[error("Invalid Id size, expected 20, got {0}")]
    InvalidIdSize(usize),

    #[error("Invalid Id encoding: {0}")]
    InvalidIdEncoding(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// A reserved message carried a payload its handler could not read.
    #[error("Malformed payload: {0}")]
    MalformedPayload(&'static str),

    #[error("Failed to parse packet bytes: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),
}

/// Alias for `Result<T, Error>`.
pub type Result<T, E = Error> = std::result::Result<T, E>;
