//! Abstract coordination store interface.
//!
//! `CoordinationStore` is the seam between the election primitives and the
//! external store. It is implemented by [`ConsulClient`] for real deployments
//! and by [`MemoryStore`] for tests and single-process runs.
//!
//! [`ConsulClient`]: crate::consul::ConsulClient
//! [`MemoryStore`]: crate::memory::MemoryStore

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::error::CoordinationResult;

/// Shared handle to a store, as held by every component.
pub type SharedStore = Arc<dyn CoordinationStore>;

/// A single key/value entry as reported by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
    /// session currently holding the key, if any
    pub session: Option<String>,
    pub modify_index: u64,
}

/// What happens to keys held by a session once it is invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionBehavior {
    /// held keys stay, but lose their holder
    Release,
    /// held keys are deleted
    #[default]
    Delete,
}

impl SessionBehavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionBehavior::Release => "release",
            SessionBehavior::Delete => "delete",
        }
    }
}

/// Parameters for a new session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub name: String,
    pub ttl: Duration,
    /// keys released by an invalidated session cannot be re-acquired for this long
    pub lock_delay: Duration,
    pub behavior: SessionBehavior,
}

/// What a watch subscribes to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WatchTarget {
    Key(String),
    Prefix(String),
}

impl WatchTarget {
    pub fn key(&self) -> &str {
        match self {
            WatchTarget::Key(key) | WatchTarget::Prefix(key) => key,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WatchTarget::Key(_) => "key",
            WatchTarget::Prefix(_) => "keyprefix",
        }
    }
}

impl fmt::Display for WatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.key())
    }
}

/// Result of a single blocking watch call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchUpdate {
    /// store index the payload corresponds to; unchanged from the request
    /// index when the wait elapsed without a change
    pub index: u64,
    pub payload: WatchPayload,
}

/// Data observed by a watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchPayload {
    /// a single key; `None` when it does not exist
    Key(Option<KvPair>),
    /// every key under a prefix
    Prefix(Vec<KvPair>),
    /// the store answered, but the body could not be decoded
    Malformed(String),
}

/// Operations consumed from the coordination store.
///
/// Every method is safe for concurrent use; implementations do not serialize
/// callers behind a global lock.
#[async_trait]
pub trait CoordinationStore: Send + Sync + fmt::Debug + 'static {
    /// Create a TTL-bound session and return its id.
    async fn create_session(&self, req: &SessionRequest) -> CoordinationResult<String>;

    /// Invalidate a session, applying its behavior to held keys.
    async fn destroy_session(&self, id: &str) -> CoordinationResult<()>;

    /// Refresh the TTL of a session. Fails with `SessionNotFound` once the
    /// session has expired.
    async fn renew_session(&self, id: &str) -> CoordinationResult<()>;

    /// Read a key.
    async fn kv_get(&self, key: &str) -> CoordinationResult<Option<KvPair>>;

    /// Unconditionally write a key.
    async fn kv_put(&self, key: &str, value: &[u8]) -> CoordinationResult<()>;

    /// Delete a key.
    async fn kv_delete(&self, key: &str) -> CoordinationResult<()>;

    /// Read every key under a prefix.
    async fn kv_list(&self, prefix: &str) -> CoordinationResult<Vec<KvPair>>;

    /// Take the key for `session` if nobody holds it. `Ok(false)` when it is
    /// held by another session.
    async fn kv_acquire(&self, key: &str, value: &[u8], session: &str)
        -> CoordinationResult<bool>;

    /// Give up the key if `session` holds it. `Ok(false)` otherwise.
    async fn kv_release(&self, key: &str, session: &str) -> CoordinationResult<bool>;

    /// Blocking query: returns as soon as the target's index moves past
    /// `index`, or after `wait` with the index unchanged. An `index` of 0
    /// returns immediately.
    async fn watch(
        &self,
        target: &WatchTarget,
        index: u64,
        wait: Duration,
    ) -> CoordinationResult<WatchUpdate>;
}
