//! Session-tagged compare-and-set locking over a single key.

use tracing::{debug, trace};

use crate::{error::CoordinationResult, store::SharedStore};

/// Stateless lock operations. The lock value is the holder's session id.
#[derive(Debug, Clone)]
pub struct Locker {
    store: SharedStore,
}

impl Locker {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Take `key` for `session_id` if nobody holds it. `Ok(false)` when
    /// another session does.
    pub async fn acquire(&self, key: &str, session_id: &str) -> CoordinationResult<bool> {
        let acquired = self
            .store
            .kv_acquire(key, session_id.as_bytes(), session_id)
            .await
            .map_err(|e| e.context(format!("failed to acquire key {key}")))?;
        debug!(key, session = session_id, acquired, "lock acquire");
        Ok(acquired)
    }

    /// Give up `key` if `session_id` holds it, otherwise a no-op `Ok(false)`.
    pub async fn release(&self, key: &str, session_id: &str) -> CoordinationResult<bool> {
        let released = self
            .store
            .kv_release(key, session_id)
            .await
            .map_err(|e| e.context(format!("failed to release key {key}")))?;
        debug!(key, session = session_id, released, "lock release");
        Ok(released)
    }

    /// Session currently holding `key`, `None` when unheld or missing.
    pub async fn key_owner(&self, key: &str) -> CoordinationResult<Option<String>> {
        let owner = self
            .store
            .kv_get(key)
            .await
            .map_err(|e| e.context(format!("failed to read key {key}")))?
            .and_then(|pair| pair.session);
        trace!(key, ?owner, "lock owner");
        Ok(owner)
    }
}
