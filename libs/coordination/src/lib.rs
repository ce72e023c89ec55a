//! # coordination
//!
//! Client-side leader election over a Consul-style coordination store.
//!
//! This library provides:
//! - **Store abstraction** ([`CoordinationStore`]) with a Consul HTTP client
//!   and an in-process store with the same semantics.
//! - **Sessions**: one TTL-bound identity per instance, kept alive by a
//!   heartbeat.
//! - **Locks**: session-tagged compare-and-set on a single key.
//! - **Watches**: long-lived key and key-prefix subscriptions dispatching to
//!   registered handlers.
//! - **Leader election**: a state machine combining the three, with a
//!   non-blocking `is_leader` and a teardown that attempts every step.
//!
//! ## Design Principles
//!
//! - The leadership flag is a cached, eventually consistent view of the lock
//!   holder. Two instances may both believe they lead for less than one TTL
//!   during a partition.
//! - Background failures are logged, never fatal.
//! - No HTTP details leak past [`CoordinationError`].

use std::sync::Arc;

use config::ConsulConfig;
use tracing::warn;

pub mod consul;
pub mod error;
pub mod leader;
pub mod lock;
pub mod memory;
pub mod metrics;
pub mod registry;
pub mod session;
pub mod store;
pub mod watcher;

// Re-export key types for convenient access
pub use consul::{ConnectionState, ConsulClient};
pub use error::{CoordinationError, CoordinationResult, ErrorJoin};
pub use leader::{LeaderCoordinator, Phase};
pub use lock::Locker;
pub use memory::MemoryStore;
pub use registry::{KeyHandler, PrefixHandler, WatchHandler, key_handler, prefix_handler};
pub use session::SessionManager;
pub use store::{
    CoordinationStore, KvPair, SessionBehavior, SessionRequest, SharedStore, WatchPayload,
    WatchTarget, WatchUpdate,
};
pub use watcher::Watcher;

/// Builds the election components over one store and one config.
#[derive(Debug, Clone)]
pub struct Coordination {
    store: SharedStore,
    config: ConsulConfig,
}

impl Coordination {
    pub fn new(store: SharedStore, config: ConsulConfig) -> Self {
        Self { store, config }
    }

    /// Connect to the Consul agent described by `config`.
    pub async fn consul(config: ConsulConfig) -> CoordinationResult<Self> {
        let client = ConsulClient::new(&config)?;
        client.connect().await?;
        Ok(Self::new(Arc::new(client), config))
    }

    /// Use a fresh in-process store.
    pub fn memory(config: ConsulConfig) -> Self {
        Self::new(Arc::new(MemoryStore::new()), config)
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn config(&self) -> &ConsulConfig {
        &self.config
    }

    pub fn watcher(&self) -> Watcher {
        Watcher::new(self.store.clone(), self.config.watch_wait)
    }

    pub fn locker(&self) -> Locker {
        Locker::new(self.store.clone())
    }

    /// A session named after the lock key.
    ///
    /// The lock-delay must stay below `leader_ttl`, or every handoff waits
    /// out the full delay; a longer one is cut to half of `leader_ttl`.
    pub fn session(&self) -> SessionManager {
        let mut lock_delay = self.config.lock_delay;
        if lock_delay >= self.config.leader_ttl {
            lock_delay = self.config.leader_ttl / 2;
            warn!(
                configured = ?self.config.lock_delay,
                leader_ttl = ?self.config.leader_ttl,
                ?lock_delay,
                "lock delay not below leader ttl, shortening it"
            );
        }
        SessionManager::new(
            self.store.clone(),
            self.config.lock_key.clone(),
            self.config.session_ttl,
            lock_delay,
        )
    }

    /// A coordinator with its own session and watcher.
    pub fn leader(&self) -> LeaderCoordinator {
        LeaderCoordinator::new(
            self.session(),
            self.locker(),
            self.watcher(),
            self.config.lock_key.clone(),
            self.config.leader_ttl,
        )
    }
}
