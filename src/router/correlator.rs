//! Correlation of outbound requests with their responses.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, trace};

use crate::common::Message;
use crate::{Error, Result};

/// How many random ids to try before giving up on finding a free one.
const MAX_ID_ATTEMPTS: usize = 64;

/// Receives either the response to a request, or [Error::RequestTimeout].
pub type ResponseCallback = Box<dyn FnOnce(Result<Message>) + Send>;

struct PendingRequest {
    callback: ResponseCallback,
    deadline: Instant,
}

/// Maps outstanding request ids to the callbacks waiting for them.
///
/// Every registered callback is invoked exactly once, either by
/// [Correlator::complete] or by [Correlator::expire]. Lookup and removal
/// happen under a single lock, and callbacks run after it is released, so
/// they may register new requests.
pub struct Correlator {
    pending: Mutex<HashMap<u32, PendingRequest>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Store `callback` under a fresh id that expires after `timeout`.
    pub fn register(&self, callback: ResponseCallback, timeout: Duration) -> Result<u32> {
        let mut rng = rand::thread_rng();
        let mut pending = self.pending();

        for _ in 0..MAX_ID_ATTEMPTS {
            let id: u32 = rng.gen();

            if pending.contains_key(&id) {
                continue;
            }

            pending.insert(
                id,
                PendingRequest {
                    callback,
                    deadline: Instant::now() + timeout,
                },
            );
            trace!(context = "correlator", id, "Registered pending request");

            return Ok(id);
        }

        Err(Error::CorrelationIdsExhausted(MAX_ID_ATTEMPTS))
    }

    /// Deliver `response` to the request registered under `id`.
    ///
    /// Returns [Error::UnknownCorrelationId] if the request already completed,
    /// timed out, or never existed.
    pub fn complete(&self, id: u32, response: Message) -> Result<()> {
        self.resolve(id, Ok(response))
    }

    /// Fail the request registered under `id` with `error`, for requests that
    /// could not be sent at all.
    pub fn fail(&self, id: u32, error: Error) -> Result<()> {
        self.resolve(id, Err(error))
    }

    fn resolve(&self, id: u32, result: Result<Message>) -> Result<()> {
        let request = self.pending().remove(&id);

        match request {
            Some(request) => {
                (request.callback)(result);
                Ok(())
            }
            None => Err(Error::UnknownCorrelationId(id)),
        }
    }

    /// Fire [Error::RequestTimeout] for every request whose deadline is not
    /// after `now`. Returns the number of expired requests.
    pub fn expire(&self, now: Instant) -> usize {
        let expired: Vec<(u32, PendingRequest)> = {
            let mut pending = self.pending();

            let ids: Vec<u32> = pending
                .iter()
                .filter(|(_, request)| request.deadline <= now)
                .map(|(id, _)| *id)
                .collect();

            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|request| (id, request)))
                .collect()
        };

        let count = expired.len();

        for (id, request) in expired {
            debug!(context = "correlator", id, "Request timed out");
            (request.callback)(Err(Error::RequestTimeout(id)));
        }

        count
    }

    /// Returns `true` if `id` is still waiting for a response.
    pub fn is_pending(&self, id: u32) -> bool {
        self.pending().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<u32, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("pending", &self.len())
            .finish()
    }
}
