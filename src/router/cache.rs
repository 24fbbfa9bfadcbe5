//! Bounded FIFO store of content-addressed payloads.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use bytes::Bytes;
use tracing::debug;

use crate::common::{validate_content, Id};
use crate::{Error, Result};

/// Default number of payloads kept before the oldest are evicted.
pub const DEFAULT_CACHE_SIZE_HINT: usize = 100;

/// Content cache serving cacheable requests without forwarding them.
///
/// Entries are only stored when their id is the hash of their payload.
/// Every rejected entry halves the bound, so a peer feeding forged content
/// shrinks the cache instead of poisoning it.
pub struct ContentCache {
    state: Mutex<CacheState>,
}

#[derive(Debug)]
struct CacheState {
    bound: usize,
    entries: VecDeque<(Id, Bytes)>,
}

impl CacheState {
    fn evict(&mut self) {
        while self.entries.len() > self.bound {
            self.entries.pop_front();
        }
    }
}

impl ContentCache {
    pub fn new(size_hint: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                bound: size_hint,
                entries: VecDeque::with_capacity(size_hint.min(1024)),
            }),
        }
    }

    /// Store `payload` under `content_id`, evicting the oldest entries if
    /// the cache grows over its bound.
    ///
    /// Returns [Error::CacheIntegrityFailure] and shrinks the cache if
    /// `content_id` is not the hash of `payload`.
    pub fn add(&self, content_id: Id, payload: Bytes) -> Result<()> {
        let valid = validate_content(&payload, &content_id);
        let mut state = self.state();

        if !valid {
            state.bound /= 2;
            state.evict();

            debug!(
                context = "content_cache",
                ?content_id,
                bound = state.bound,
                "Rejected content with mismatching hash"
            );

            return Err(Error::CacheIntegrityFailure(content_id));
        }

        if state.entries.iter().any(|(id, _)| id == &content_id) {
            return Ok(());
        }

        state.entries.push_back((content_id, payload));
        state.evict();

        Ok(())
    }

    pub fn lookup(&self, content_id: &Id) -> Option<Bytes> {
        self.state()
            .entries
            .iter()
            .find(|(id, _)| id == content_id)
            .map(|(_, payload)| payload.clone())
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current maximum number of entries.
    pub fn bound(&self) -> usize {
        self.state().bound
    }

    fn state(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ContentCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_SIZE_HINT)
    }
}

impl std::fmt::Debug for ContentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();

        f.debug_struct("ContentCache")
            .field("bound", &state.bound)
            .field("len", &state.entries.len())
            .finish()
    }
}
