//! TTL-bound session lifecycle and heartbeat.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::{
    sync::mpsc,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    error::{CoordinationError, CoordinationResult},
    metrics,
    store::{SessionBehavior, SessionRequest, SharedStore},
};

/// Owns one ephemeral session at the store.
///
/// A manager creates at most one session and destroys it at most once.
/// Destroying also stops any heartbeat loop started with [`renew`].
///
/// [`renew`]: SessionManager::renew
#[derive(Debug)]
pub struct SessionManager {
    store: SharedStore,
    key: String,
    ttl: Duration,
    lock_delay: Duration,
    state: Mutex<SessionState>,
    stop: CancellationToken,
}

#[derive(Debug, Default)]
struct SessionState {
    id: Option<String>,
    creating: bool,
    destroyed: bool,
}

impl SessionManager {
    /// `key` is used as the session name.
    pub fn new(store: SharedStore, key: impl Into<String>, ttl: Duration, lock_delay: Duration) -> Self {
        Self {
            store,
            key: key.into(),
            ttl,
            lock_delay,
            state: Mutex::new(SessionState::default()),
            stop: CancellationToken::new(),
        }
    }

    /// Create the session. Fails with `SessionExists` if this manager already
    /// created one.
    pub async fn create(&self) -> CoordinationResult<String> {
        {
            let mut state = self.state.lock();
            if let Some(id) = &state.id {
                return Err(CoordinationError::SessionExists(id.clone()));
            }
            if state.creating {
                return Err(CoordinationError::SessionExists(
                    "creation in progress".into(),
                ));
            }
            state.creating = true;
        }

        let req = SessionRequest {
            name: self.key.clone(),
            ttl: self.ttl,
            lock_delay: self.lock_delay,
            behavior: SessionBehavior::Delete,
        };
        let res = self.store.create_session(&req).await;

        let mut state = self.state.lock();
        state.creating = false;
        let id = res.map_err(|e| e.context(format!("failed to create session {}", self.key)))?;
        state.id = Some(id.clone());
        info!(session = %id, key = %self.key, ttl = ?self.ttl, "session created");
        Ok(id)
    }

    /// Destroy the session at the store and stop the heartbeat.
    ///
    /// Returns `EmptySession` if the session was never created or was already
    /// destroyed.
    pub async fn destroy(&self) -> CoordinationResult<()> {
        let id = {
            let mut state = self.state.lock();
            let id = match state.id.clone() {
                Some(id) if !state.destroyed => id,
                _ => return Err(CoordinationError::EmptySession),
            };
            state.destroyed = true;
            id
        };
        self.stop.cancel();

        self.store
            .destroy_session(&id)
            .await
            .map_err(|e| e.context(format!("failed to destroy session {id}")))?;
        info!(session = %id, key = %self.key, "session destroyed");
        Ok(())
    }

    /// Start the heartbeat loop, refreshing the TTL every `ttl / 2` until the
    /// session is destroyed or `shutdown` is cancelled.
    ///
    /// The returned channel receives at most one terminal error: the session
    /// expired at the store, or renewals kept failing for longer than one TTL.
    /// Delivery never blocks the loop; the error is dropped if the receiver is
    /// full or gone.
    pub fn renew(&self, shutdown: CancellationToken) -> mpsc::Receiver<CoordinationError> {
        let (tx, rx) = mpsc::channel(1);
        let Some(id) = self.live_id() else {
            let _ = tx.try_send(CoordinationError::EmptySession);
            return rx;
        };

        let store = self.store.clone();
        let stop = self.stop.clone();
        let ttl = self.ttl;
        let period = (ttl / 2).max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last_ok = Instant::now();

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let res = tokio::select! {
                    _ = stop.cancelled() => break,
                    res = store.renew_session(&id) => res,
                };
                match res {
                    Ok(()) => {
                        metrics::SESSION_RENEWALS.inc();
                        last_ok = Instant::now();
                        trace!(session = %id, "session renewed");
                    }
                    Err(err) if err.is_session_not_found() => {
                        metrics::SESSION_RENEW_FAILURES.inc();
                        warn!(session = %id, error = %err, "session no longer exists, stopping renewal");
                        let _ = tx.try_send(err.context(format!("session {id} expired")));
                        return;
                    }
                    Err(err) => {
                        metrics::SESSION_RENEW_FAILURES.inc();
                        if last_ok.elapsed() >= ttl {
                            error!(session = %id, error = %err, ?ttl, "session renewal failing for longer than ttl");
                            let _ = tx.try_send(err.context(format!(
                                "session {id} not renewed within {ttl:?}"
                            )));
                            return;
                        }
                        warn!(session = %id, error = %err, "session renewal failed, retrying");
                    }
                }
            }
            debug!(session = %id, "session renewal stopped");
        });
        rx
    }

    /// id of the session, once created; still readable after destroy
    pub fn session_id(&self) -> Option<String> {
        self.state.lock().id.clone()
    }

    /// name the session was created under
    pub fn session_key(&self) -> &str {
        &self.key
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// how long the store keeps a key unacquirable after this session is
    /// invalidated
    pub fn lock_delay(&self) -> Duration {
        self.lock_delay
    }

    fn live_id(&self) -> Option<String> {
        let state = self.state.lock();
        if state.destroyed {
            None
        } else {
            state.id.clone()
        }
    }
}
