use std::net::SocketAddr;
use std::time::Duration;

use ed25519_dalek::SigningKey;

use crate::codec::Codec;
use crate::common::Id;
use crate::service::Service;
use crate::{Error, Result};

use super::cache::DEFAULT_CACHE_SIZE_HINT;
use super::close_group::{GroupChangeAgreement, GROUP_SIZE, QUORUM_SIZE};

/// Default time to wait for a response before failing a request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// Default number of connections the transport is initialized with.
pub const DEFAULT_CONNECTION_CAPACITY: usize = 20;

#[derive(Debug)]
/// Router configuration
pub struct Config {
    /// Identifier of this node.
    ///
    /// Defaults to None, where the id is derived from `signing_key` if set,
    /// or picked at random.
    pub id: Option<Id>,
    /// Private key of this node.
    ///
    /// Defaults to None
    pub signing_key: Option<SigningKey>,
    /// Addresses to send connect requests to on [crate::Router::join].
    ///
    /// Defaults to an empty list
    pub bootstrap: Vec<SocketAddr>,
    /// Number of peers in the close group.
    ///
    /// Defaults to [GROUP_SIZE]
    pub group_size: usize,
    /// Observations required to accept a close group change, must be
    /// smaller than `group_size`.
    ///
    /// Defaults to [QUORUM_SIZE]
    pub quorum_size: usize,
    /// Initial bound of the content cache.
    ///
    /// Defaults to [DEFAULT_CACHE_SIZE_HINT]
    pub cache_size_hint: usize,
    /// How long a request waits for its response.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]
    pub request_timeout: Duration,
    /// Capacity passed to [crate::transport::Transport::init].
    ///
    /// Defaults to [DEFAULT_CONNECTION_CAPACITY]
    pub connection_capacity: usize,
    /// Handlers for ping, find-nodes and connect requests.
    ///
    /// Defaults to None, where the [crate::service::DefaultService] is used.
    pub service: Option<Box<dyn Service>>,
    /// Wire codec.
    ///
    /// Defaults to None, where the [crate::codec::BencodeCodec] is used.
    pub codec: Option<Box<dyn Codec>>,
    /// Acceptance rule for reported close group changes.
    ///
    /// Defaults to None, where a [super::QuorumAgreement] of `quorum_size` is used.
    pub agreement: Option<Box<dyn GroupChangeAgreement>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            id: None,
            signing_key: None,
            bootstrap: Vec::new(),
            group_size: GROUP_SIZE,
            quorum_size: QUORUM_SIZE,
            cache_size_hint: DEFAULT_CACHE_SIZE_HINT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connection_capacity: DEFAULT_CONNECTION_CAPACITY,
            service: None,
            codec: None,
            agreement: None,
        }
    }
}

impl Config {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.group_size == 0 {
            return Err(Error::InvalidConfig("group_size must be positive"));
        }
        if self.quorum_size >= self.group_size {
            return Err(Error::InvalidConfig(
                "quorum_size must be smaller than group_size",
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::InvalidConfig("request_timeout must be positive"));
        }
        if self.connection_capacity == 0 {
            return Err(Error::InvalidConfig("connection_capacity must be positive"));
        }

        Ok(())
    }

    /// The configured id, or one derived from the signing key, or a random one.
    pub(crate) fn resolve_id(&self) -> Id {
        match (&self.id, &self.signing_key) {
            (Some(id), _) => *id,
            (None, Some(signing_key)) => Id::from_public_key(&signing_key.verifying_key()),
            (None, None) => Id::random(),
        }
    }
}
