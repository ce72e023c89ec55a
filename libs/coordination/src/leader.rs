//! Leader election state machine.
//!
//! `start` creates a session, tries the lock once, arms a watch on the lock
//! key and starts two background tasks: session renewal and a periodic
//! recheck of the lock holder. Watch notifications and recheck ticks both
//! update the same leadership flag; the last writer wins. `is_leader` only
//! reads that flag.
//!
//! A session the store no longer knows cannot hold the lock, so any sign of
//! that (a failed acquire, a terminal renewal error) clears the flag at once.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{
    sync::Notify,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    error::{CoordinationError, CoordinationResult, ErrorJoin},
    lock::Locker,
    metrics,
    registry::key_handler,
    session::SessionManager,
    watcher::Watcher,
};

/// Lifecycle of a [`LeaderCoordinator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Starting,
    /// leader or follower, see [`LeaderCoordinator::is_leader`]
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::Starting => "starting",
            Phase::Running => "running",
            Phase::Stopping => "stopping",
            Phase::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Decides whether this instance is the leader among everyone contending for
/// the same lock key.
#[derive(Debug, Clone)]
pub struct LeaderCoordinator {
    inner: Arc<LeaderInner>,
}

#[derive(Debug)]
struct LeaderInner {
    lock_key: String,
    leader_ttl: Duration,
    session: SessionManager,
    locker: Locker,
    watcher: Watcher,
    state: Mutex<LeaderState>,
    /// stop signal shared by every background task, created by `start`
    stop: Mutex<Option<CancellationToken>>,
    /// woken when a `start` interrupted by `stop` has finished tearing down
    settled: Notify,
}

#[derive(Debug)]
struct LeaderState {
    phase: Phase,
    is_leader: bool,
    /// set once teardown begins; later flag updates are discarded
    stopped: bool,
    /// `stop` was called while starting
    abort: bool,
}

impl LeaderCoordinator {
    /// `leader_ttl` is the interval of the fallback holder recheck.
    pub fn new(
        session: SessionManager,
        locker: Locker,
        watcher: Watcher,
        lock_key: impl Into<String>,
        leader_ttl: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(LeaderInner {
                lock_key: lock_key.into(),
                leader_ttl,
                session,
                locker,
                watcher,
                state: Mutex::new(LeaderState {
                    phase: Phase::Idle,
                    is_leader: false,
                    stopped: false,
                    abort: false,
                }),
                stop: Mutex::new(None),
                settled: Notify::new(),
            }),
        }
    }

    /// Join the election. Only valid once, from `Idle`.
    ///
    /// If the session cannot be created nothing was started and the
    /// coordinator is `Idle` again. Any later failure tears down whatever was
    /// set up and leaves the coordinator `Stopped`; so does a [`stop`] arriving
    /// before `start` returns, or a cancelled `shutdown` once the session
    /// exists. Background tasks
    /// end on [`stop`] or when `shutdown` is cancelled.
    ///
    /// [`stop`]: LeaderCoordinator::stop
    pub async fn start(&self, shutdown: CancellationToken) -> CoordinationResult<()> {
        let token = shutdown.child_token();
        {
            let mut state = self.inner.state.lock();
            if state.phase != Phase::Idle {
                return Err(CoordinationError::InvalidState(format!(
                    "cannot start leader election from {}",
                    state.phase
                )));
            }
            state.phase = Phase::Starting;
            *self.inner.stop.lock() = Some(token.clone());
        }
        let inner = &self.inner;
        info!(key = %inner.lock_key, "starting leader election");

        let created = tokio::select! {
            _ = token.cancelled() => Err(cancelled_while_starting()),
            res = inner.session.create() => res,
        };
        let session_id = match created {
            Ok(id) => id,
            Err(err) => {
                let aborted = {
                    let mut state = inner.state.lock();
                    state.phase = if state.abort { Phase::Stopped } else { Phase::Idle };
                    state.abort
                };
                if aborted {
                    inner.settled.notify_waiters();
                } else {
                    *inner.stop.lock() = None;
                }
                return Err(err);
            }
        };

        let armed = tokio::select! {
            _ = token.cancelled() => Err(cancelled_while_starting()),
            res = self.arm(&session_id, &token) => res,
        };
        if let Err(err) = armed {
            error!(key = %inner.lock_key, error = %err, "leader election failed to start, tearing down");
            inner.abandon_start().await;
            return Err(err);
        }

        self.spawn_renewal(&session_id, &token);
        self.spawn_recheck(&session_id, &token);
        let aborted = {
            let mut state = inner.state.lock();
            if !state.abort {
                state.phase = Phase::Running;
            }
            state.abort
        };
        if aborted {
            inner.abandon_start().await;
            return Err(cancelled_while_starting());
        }
        info!(
            key = %inner.lock_key,
            session = %session_id,
            leader = self.is_leader(),
            "leader election started"
        );
        Ok(())
    }

    /// initial acquire, then watch the lock key
    async fn arm(&self, session_id: &str, token: &CancellationToken) -> CoordinationResult<()> {
        let inner = &self.inner;
        let acquired = inner.locker.acquire(&inner.lock_key, session_id).await?;
        inner.set_leader(acquired);

        let weak = Arc::downgrade(inner);
        let local = session_id.to_owned();
        let handler = key_handler(move |_key, holder, _value| {
            let weak = weak.clone();
            let local = local.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.on_holder_change(&local, holder).await;
                }
            }
        });
        inner
            .watcher
            .watch_keys(HashMap::from([(inner.lock_key.clone(), handler)]))
            .await
            .map_err(|e| e.context("failed to watch lock key"))?;
        inner.watcher.start(token.clone()).await;
        Ok(())
    }

    fn spawn_renewal(&self, session_id: &str, token: &CancellationToken) {
        let mut errs = self.inner.session.renew(token.clone());
        let weak = Arc::downgrade(&self.inner);
        let session_id = session_id.to_owned();
        tokio::spawn(async move {
            // closed without an error when renewal stops normally
            if let Some(err) = errs.recv().await {
                error!(session = %session_id, error = %err, "session renewal ended");
                // the session is gone, or will be within one ttl
                if let Some(inner) = weak.upgrade() {
                    inner.set_leader(false);
                }
            }
        });
    }

    fn spawn_recheck(&self, session_id: &str, token: &CancellationToken) {
        let weak = Arc::downgrade(&self.inner);
        let session_id = session_id.to_owned();
        let token = token.clone();
        let period = self.inner.leader_ttl.max(Duration::from_millis(1));

        tokio::spawn(async move {
            // first tick one period from now; start already tried the lock
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                metrics::RECHECK_TICKS.inc();
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = inner.recheck(&session_id) => {}
                }
            }
            // without renewal and recheck the flag can no longer be trusted
            if let Some(inner) = weak.upgrade() {
                inner.set_leader(false);
            }
            debug!(session = %session_id, "leadership recheck stopped");
        });
    }

    /// Leave the election: stop background work, then destroy the session,
    /// release the lock and stop the watcher. Every step is attempted; their
    /// failures are joined. A no-op once stopped, or if never started.
    ///
    /// Called while `start` is still running, it interrupts `start` and waits
    /// for its teardown; `start` then reports the outcome.
    pub async fn stop(&self) -> CoordinationResult<()> {
        let settled = self.inner.settled.notified();
        tokio::pin!(settled);
        settled.as_mut().enable();

        let interrupt = {
            let mut state = self.inner.state.lock();
            match state.phase {
                Phase::Idle | Phase::Stopping | Phase::Stopped => return Ok(()),
                Phase::Starting => {
                    state.abort = true;
                    true
                }
                Phase::Running => {
                    state.phase = Phase::Stopping;
                    false
                }
            }
        };
        if interrupt {
            info!(key = %self.inner.lock_key, "stopping leader election while it is starting");
            if let Some(token) = self.inner.stop.lock().clone() {
                token.cancel();
            }
            settled.await;
            return Ok(());
        }
        info!(key = %self.inner.lock_key, "stopping leader election");
        self.inner.teardown().await
    }

    /// Whether this instance currently believes it is the leader. Never
    /// touches the store.
    pub fn is_leader(&self) -> bool {
        self.inner.state.lock().is_leader
    }

    pub fn state(&self) -> Phase {
        self.inner.state.lock().phase
    }

    /// id of this instance's session, once created
    pub fn session_id(&self) -> Option<String> {
        self.inner.session.session_id()
    }

    pub fn lock_key(&self) -> &str {
        &self.inner.lock_key
    }
}

fn cancelled_while_starting() -> CoordinationError {
    CoordinationError::InvalidState("leader election stopped while starting".into())
}

impl LeaderInner {
    fn set_leader(&self, leader: bool) {
        let mut state = self.state.lock();
        if state.stopped {
            trace!(leader, "ignoring leadership update after stop");
            return;
        }
        Self::update_flag(&mut state, &self.lock_key, leader);
    }

    fn update_flag(state: &mut LeaderState, key: &str, leader: bool) {
        if state.is_leader == leader {
            return;
        }
        state.is_leader = leader;
        metrics::LEADER_STATUS.set(i64::from(leader));
        if leader {
            metrics::LEADERSHIP_ACQUIRED.inc();
            info!(key, "became leader");
        } else {
            metrics::LEADERSHIP_LOST.inc();
            info!(key, "no longer leader");
        }
    }

    /// adopt the outcome of an acquire attempt
    fn adopt(&self, res: CoordinationResult<bool>, what: &str) {
        match res {
            Ok(acquired) => self.set_leader(acquired),
            Err(err) if err.is_session_not_found() => {
                warn!(key = %self.lock_key, error = %err, "{what} failed, session is gone");
                self.set_leader(false);
            }
            Err(err) => {
                warn!(key = %self.lock_key, error = %err, "{what} failed, leadership unchanged");
            }
        }
    }

    /// watch notification for the lock key
    async fn on_holder_change(&self, local: &str, holder: Option<String>) {
        if holder.as_deref() == Some(local) {
            self.set_leader(true);
            return;
        }
        debug!(key = %self.lock_key, ?holder, "lock holder changed, trying to acquire");
        let res = self.locker.acquire(&self.lock_key, local).await;
        let lock_delay = self.session.lock_delay();
        if holder.is_none() && matches!(res, Ok(false)) && !lock_delay.is_zero() {
            // free, but inside the lock-delay of the previous holder
            self.set_leader(false);
            trace!(key = %self.lock_key, ?lock_delay, "lock delayed, retrying once it expires");
            tokio::time::sleep(lock_delay).await;
            let res = self.locker.acquire(&self.lock_key, local).await;
            self.adopt(res, "acquire after lock delay");
            return;
        }
        self.adopt(res, "acquire after lock change");
    }

    /// fallback for missed notifications
    async fn recheck(&self, local: &str) {
        match self.locker.key_owner(&self.lock_key).await {
            Ok(Some(owner)) => self.set_leader(owner == local),
            Ok(None) => {
                let res = self.locker.acquire(&self.lock_key, local).await;
                self.adopt(res, "recheck acquire");
            }
            Err(err) => {
                warn!(key = %self.lock_key, error = %err, "recheck failed, leadership unchanged");
            }
        }
    }

    /// teardown after `start` failed or was interrupted
    async fn abandon_start(&self) {
        if let Err(err) = self.teardown().await {
            warn!(error = %err, "teardown after failed start");
        }
        self.settled.notify_waiters();
    }

    async fn teardown(&self) -> CoordinationResult<()> {
        if let Some(token) = self.stop.lock().clone() {
            token.cancel();
        }
        {
            let mut state = self.state.lock();
            Self::update_flag(&mut state, &self.lock_key, false);
            state.stopped = true;
        }

        let session_id = self.session.session_id();
        let mut join = ErrorJoin::new();
        join.push(self.session.destroy().await);
        if let Some(id) = &session_id {
            join.push(self.locker.release(&self.lock_key, id).await);
        }
        join.push(self.watcher.stop().await);

        self.state.lock().phase = Phase::Stopped;
        let res = join.into_result();
        match &res {
            Ok(()) => info!(key = %self.lock_key, "leader election stopped"),
            Err(err) => warn!(key = %self.lock_key, error = %err, "leader election stopped with errors"),
        }
        res
    }
}
