//! In-process coordination store.
//!
//! Mirrors the semantics the election code relies on from Consul: TTL
//! sessions that invalidate themselves, release/delete session behaviors,
//! lock-delay, monotonically increasing modify indexes and blocking watches.
//! Expiry is evaluated lazily on every call and blocked watches wake up at
//! the next expiry deadline, so no reaper task is needed.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{sync::watch, time::Instant};
use tracing::debug;

use crate::{
    error::{CoordinationError, CoordinationResult},
    store::{
        CoordinationStore, KvPair, SessionBehavior, SessionRequest, WatchPayload, WatchTarget,
        WatchUpdate,
    },
};

/// index reported for keys that have never been written
const BASE_INDEX: u64 = 1;

#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
    changes: Arc<watch::Sender<u64>>,
}

#[derive(Debug)]
struct MemoryInner {
    index: u64,
    available: bool,
    sessions: HashMap<String, SessionEntry>,
    kv: BTreeMap<String, KvEntry>,
    tombstones: BTreeMap<String, u64>,
    lock_delays: HashMap<String, Instant>,
}

#[derive(Debug, Clone)]
struct SessionEntry {
    name: String,
    ttl: Duration,
    lock_delay: Duration,
    behavior: SessionBehavior,
    /// `None` for sessions without a TTL
    expires_at: Option<Instant>,
}

#[derive(Debug, Clone)]
struct KvEntry {
    value: Vec<u8>,
    session: Option<String>,
    modify_index: u64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        let (tx, _) = watch::channel(BASE_INDEX);
        Self {
            inner: Arc::new(Mutex::new(MemoryInner {
                index: BASE_INDEX,
                available: true,
                sessions: HashMap::new(),
                kv: BTreeMap::new(),
                tombstones: BTreeMap::new(),
                lock_delays: HashMap::new(),
            })),
            changes: Arc::new(tx),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the store becoming unreachable (or reachable again). While
    /// unavailable every call fails with a transport error.
    pub fn set_available(&self, available: bool) {
        self.inner.lock().available = available;
        let index = self.inner.lock().index;
        // wake blocked watches so they observe the outage
        self.changes.send_replace(index);
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        let mut inner = self.inner.lock();
        let changed = inner.reap(Instant::now());
        let count = inner.sessions.len();
        drop(inner);
        if changed {
            self.notify();
        }
        count
    }

    fn notify(&self) {
        let index = self.inner.lock().index;
        self.changes.send_replace(index);
    }

    /// Run `f` against the store state after expiring stale sessions, waking
    /// watchers if anything changed.
    fn with_inner<T>(
        &self,
        f: impl FnOnce(&mut MemoryInner, Instant) -> CoordinationResult<T>,
    ) -> CoordinationResult<T> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.check_available()?;
        let before = inner.index;
        inner.reap(now);
        let res = f(&mut inner, now);
        let changed = inner.index != before;
        drop(inner);
        if changed {
            self.notify();
        }
        res
    }
}

impl MemoryInner {
    fn check_available(&self) -> CoordinationResult<()> {
        if self.available {
            Ok(())
        } else {
            Err(CoordinationError::Transport(
                "memory store unavailable".into(),
            ))
        }
    }

    fn bump(&mut self) -> u64 {
        self.index += 1;
        self.index
    }

    /// invalidate every session whose TTL has run out, and forget lock-delays
    /// that have passed
    fn reap(&mut self, now: Instant) -> bool {
        self.lock_delays.retain(|_, until| *until > now);
        let expired = self
            .sessions
            .iter()
            .filter(|(_, s)| s.expires_at.is_some_and(|at| at <= now))
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        let mut changed = false;
        for id in expired {
            debug!(session = %id, "memory store session expired");
            changed |= self.invalidate(&id, now);
        }
        changed
    }

    fn invalidate(&mut self, id: &str, now: Instant) -> bool {
        let Some(session) = self.sessions.remove(id) else {
            return false;
        };
        let held = self
            .kv
            .iter()
            .filter(|(_, e)| e.session.as_deref() == Some(id))
            .map(|(k, _)| k.clone())
            .collect::<Vec<_>>();

        for key in held {
            if !session.lock_delay.is_zero() {
                self.lock_delays.insert(key.clone(), now + session.lock_delay);
            }
            let index = self.bump();
            match session.behavior {
                SessionBehavior::Delete => {
                    self.kv.remove(&key);
                    self.tombstones.insert(key, index);
                }
                SessionBehavior::Release => {
                    if let Some(entry) = self.kv.get_mut(&key) {
                        entry.session = None;
                        entry.modify_index = index;
                    }
                }
            }
        }
        debug!(session = %id, name = %session.name, "memory store session invalidated");
        true
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.sessions.values().filter_map(|s| s.expires_at).min()
    }

    fn pair(key: &str, entry: &KvEntry) -> KvPair {
        KvPair {
            key: key.to_owned(),
            value: entry.value.clone(),
            session: entry.session.clone(),
            modify_index: entry.modify_index,
        }
    }

    fn prefixed<'a, V>(
        map: &'a BTreeMap<String, V>,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a V)> + 'a {
        map.range(prefix.to_owned()..)
            .take_while(move |(k, _)| k.starts_with(prefix))
    }

    fn index_of(&self, target: &WatchTarget) -> u64 {
        match target {
            WatchTarget::Key(key) => self
                .kv
                .get(key)
                .map(|e| e.modify_index)
                .or_else(|| self.tombstones.get(key).copied())
                .unwrap_or(BASE_INDEX),
            WatchTarget::Prefix(prefix) => Self::prefixed(&self.kv, prefix)
                .map(|(_, e)| e.modify_index)
                .chain(Self::prefixed(&self.tombstones, prefix).map(|(_, i)| *i))
                .max()
                .unwrap_or(BASE_INDEX),
        }
    }

    fn payload(&self, target: &WatchTarget) -> WatchPayload {
        match target {
            WatchTarget::Key(key) => {
                WatchPayload::Key(self.kv.get(key).map(|e| Self::pair(key, e)))
            }
            WatchTarget::Prefix(prefix) => WatchPayload::Prefix(
                Self::prefixed(&self.kv, prefix)
                    .map(|(k, e)| Self::pair(k, e))
                    .collect(),
            ),
        }
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn create_session(&self, req: &SessionRequest) -> CoordinationResult<String> {
        self.with_inner(|inner, now| {
            let id = uuid::Uuid::new_v4().to_string();
            let expires_at = (!req.ttl.is_zero()).then(|| now + req.ttl);
            inner.sessions.insert(
                id.clone(),
                SessionEntry {
                    name: req.name.clone(),
                    ttl: req.ttl,
                    lock_delay: req.lock_delay,
                    behavior: req.behavior,
                    expires_at,
                },
            );
            Ok(id)
        })
    }

    async fn destroy_session(&self, id: &str) -> CoordinationResult<()> {
        self.with_inner(|inner, now| {
            inner.invalidate(id, now);
            Ok(())
        })
    }

    async fn renew_session(&self, id: &str) -> CoordinationResult<()> {
        self.with_inner(|inner, now| match inner.sessions.get_mut(id) {
            Some(session) => {
                if !session.ttl.is_zero() {
                    session.expires_at = Some(now + session.ttl);
                }
                Ok(())
            }
            None => Err(CoordinationError::SessionNotFound(id.to_owned())),
        })
    }

    async fn kv_get(&self, key: &str) -> CoordinationResult<Option<KvPair>> {
        self.with_inner(|inner, _| Ok(inner.kv.get(key).map(|e| MemoryInner::pair(key, e))))
    }

    async fn kv_put(&self, key: &str, value: &[u8]) -> CoordinationResult<()> {
        self.with_inner(|inner, _| {
            let index = inner.bump();
            inner.tombstones.remove(key);
            let entry = inner.kv.entry(key.to_owned()).or_insert_with(|| KvEntry {
                value: Vec::new(),
                session: None,
                modify_index: index,
            });
            entry.value = value.to_vec();
            entry.modify_index = index;
            Ok(())
        })
    }

    async fn kv_delete(&self, key: &str) -> CoordinationResult<()> {
        self.with_inner(|inner, _| {
            if inner.kv.contains_key(key) {
                let index = inner.bump();
                inner.kv.remove(key);
                inner.tombstones.insert(key.to_owned(), index);
            }
            Ok(())
        })
    }

    async fn kv_list(&self, prefix: &str) -> CoordinationResult<Vec<KvPair>> {
        self.with_inner(|inner, _| {
            Ok(MemoryInner::prefixed(&inner.kv, prefix)
                .map(|(k, e)| MemoryInner::pair(k, e))
                .collect())
        })
    }

    async fn kv_acquire(
        &self,
        key: &str,
        value: &[u8],
        session: &str,
    ) -> CoordinationResult<bool> {
        self.with_inner(|inner, now| {
            if !inner.sessions.contains_key(session) {
                return Err(CoordinationError::SessionNotFound(format!(
                    "invalid session \"{session}\""
                )));
            }
            let holder = inner.kv.get(key).and_then(|e| e.session.clone());
            match holder.as_deref() {
                Some(current) if current != session => return Ok(false),
                Some(_) => {}
                None => {
                    if inner.lock_delays.get(key).is_some_and(|until| *until > now) {
                        return Ok(false);
                    }
                }
            }
            let index = inner.bump();
            inner.tombstones.remove(key);
            inner.kv.insert(
                key.to_owned(),
                KvEntry {
                    value: value.to_vec(),
                    session: Some(session.to_owned()),
                    modify_index: index,
                },
            );
            Ok(true)
        })
    }

    async fn kv_release(&self, key: &str, session: &str) -> CoordinationResult<bool> {
        self.with_inner(|inner, _| {
            let held = inner
                .kv
                .get(key)
                .is_some_and(|e| e.session.as_deref() == Some(session));
            if !held {
                return Ok(false);
            }
            let index = inner.bump();
            if let Some(entry) = inner.kv.get_mut(key) {
                entry.session = None;
                entry.modify_index = index;
            }
            Ok(true)
        })
    }

    async fn watch(
        &self,
        target: &WatchTarget,
        index: u64,
        wait: Duration,
    ) -> CoordinationResult<WatchUpdate> {
        // subscribe before reading so a change between the read and the wait
        // is not lost
        let mut rx = self.changes.subscribe();
        let deadline = Instant::now() + wait;
        loop {
            let (update, next_expiry) = self.with_inner(|inner, _| {
                let update = WatchUpdate {
                    index: inner.index_of(target),
                    payload: inner.payload(target),
                };
                Ok((update, inner.next_expiry()))
            })?;

            if index == 0 || update.index != index {
                return Ok(update);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(update);
            }
            let wake = next_expiry.map_or(deadline, |at| at.max(now).min(deadline));
            let _ = tokio::time::timeout_at(wake, rx.changed()).await;
        }
    }
}
