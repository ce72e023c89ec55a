//! Long-lived key and prefix subscriptions.
//!
//! Each registration runs one task that long-polls the store with blocking
//! queries and hands every change to its handler. The registry lock is held
//! for reading while a handler runs, so a handler must not call `unwatch_*`
//! or `stop` directly (spawn it instead).

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    error::{CoordinationResult, ErrorJoin},
    metrics,
    registry::{KeyHandler, PrefixHandler, WatchHandler, WatchRegistry},
    store::{SharedStore, WatchPayload, WatchTarget},
};

/// first delay after a failed watch query
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
/// cap for the exponential backoff between failed queries
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Dynamic set of watch subscriptions.
#[derive(Debug, Clone)]
pub struct Watcher {
    inner: Arc<WatcherInner>,
}

#[derive(Debug)]
struct WatcherInner {
    store: SharedStore,
    wait: Duration,
    registry: RwLock<WatchRegistry>,
    /// watcher-wide token, set while started
    running: Mutex<Option<CancellationToken>>,
}

impl Watcher {
    /// `wait` bounds how long a single blocking query is held open.
    pub fn new(store: SharedStore, wait: Duration) -> Self {
        Self {
            inner: Arc::new(WatcherInner {
                store,
                wait,
                registry: RwLock::new(WatchRegistry::new()),
                running: Mutex::new(None),
            }),
        }
    }

    /// Watch individual keys. Fails without registering anything if one of
    /// the keys is already watched.
    pub async fn watch_keys(&self, keys: HashMap<String, KeyHandler>) -> CoordinationResult<()> {
        let entries = keys
            .into_iter()
            .map(|(key, handler)| (WatchTarget::Key(key), WatchHandler::Key(handler)))
            .collect();
        self.register(entries).await
    }

    /// Watch key prefixes. Handlers receive the full set of children whenever
    /// it changes; an empty set is not reported.
    pub async fn watch_prefix_keys(
        &self,
        prefixes: HashMap<String, PrefixHandler>,
    ) -> CoordinationResult<()> {
        let entries = prefixes
            .into_iter()
            .map(|(prefix, handler)| (WatchTarget::Prefix(prefix), WatchHandler::Prefix(handler)))
            .collect();
        self.register(entries).await
    }

    async fn register(&self, entries: Vec<(WatchTarget, WatchHandler)>) -> CoordinationResult<()> {
        let mut registry = self.inner.registry.write().await;
        // all or nothing
        if let Some((target, _)) = entries.iter().find(|(t, _)| registry.contains(t)) {
            return Err(crate::CoordinationError::WatchFuncAlreadyExists {
                kind: target.kind(),
                key: target.key().to_owned(),
            });
        }
        let running = self.inner.running.lock().clone();
        for (target, handler) in entries {
            registry.insert(target.clone(), handler)?;
            debug!(%target, "watch registered");
            if let Some(parent) = &running {
                self.spawn(&mut registry, &target, parent);
            }
        }
        Ok(())
    }

    /// Stop watching `key`.
    pub async fn unwatch_key(&self, key: &str) -> CoordinationResult<()> {
        self.unwatch(&WatchTarget::Key(key.to_owned())).await
    }

    /// Stop watching `prefix`.
    pub async fn unwatch_prefix(&self, prefix: &str) -> CoordinationResult<()> {
        self.unwatch(&WatchTarget::Prefix(prefix.to_owned())).await
    }

    async fn unwatch(&self, target: &WatchTarget) -> CoordinationResult<()> {
        let registration = self.inner.registry.write().await.remove(target)?;
        if let Some(task) = registration.task {
            task.cancel();
        }
        debug!(%target, "watch unregistered");
        Ok(())
    }

    /// Activate every registration made so far. Registrations made later
    /// start on their own. Subscriptions end when `shutdown` is cancelled or
    /// [`stop`] is called.
    ///
    /// [`stop`]: Watcher::stop
    pub async fn start(&self, shutdown: CancellationToken) {
        let mut registry = self.inner.registry.write().await;
        let parent = {
            let mut running = self.inner.running.lock();
            match &*running {
                Some(token) => token.clone(),
                None => {
                    let token = shutdown.child_token();
                    *running = Some(token.clone());
                    token
                }
            }
        };
        let targets = registry.targets();
        for target in &targets {
            self.spawn(&mut registry, target, &parent);
        }
        info!(watches = targets.len(), "watcher started");
    }

    /// Unregister every watch. Every registration is torn down even if some
    /// fail; failures are joined.
    pub async fn stop(&self) -> CoordinationResult<()> {
        // cancel first so in-flight handlers give up the registry lock
        if let Some(token) = self.inner.running.lock().take() {
            token.cancel();
        }
        let targets = self.inner.registry.read().await.targets();
        let mut join = ErrorJoin::new();
        for target in &targets {
            join.push(self.unwatch(target).await);
        }
        info!(watches = targets.len(), "watcher stopped");
        join.into_result()
    }

    /// number of registered watches
    pub async fn len(&self) -> usize {
        self.inner.registry.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.registry.read().await.is_empty()
    }

    fn spawn(&self, registry: &mut WatchRegistry, target: &WatchTarget, parent: &CancellationToken) {
        let Some(registration) = registry.get_mut(target) else {
            return;
        };
        if registration.task.is_some() {
            return;
        }
        let token = parent.child_token();
        registration.task = Some(token.clone());
        tokio::spawn(run_plan(
            Arc::downgrade(&self.inner),
            self.inner.store.clone(),
            target.clone(),
            self.inner.wait,
            token,
        ));
    }
}

/// Blocking-query loop for one registration.
async fn run_plan(
    watcher: Weak<WatcherInner>,
    store: SharedStore,
    target: WatchTarget,
    wait: Duration,
    token: CancellationToken,
) {
    metrics::WATCH_ACTIVE.inc();
    debug!(%target, "watch started");
    let mut index = 0;
    let mut backoff = RETRY_BASE_DELAY;

    loop {
        let res = tokio::select! {
            _ = token.cancelled() => break,
            res = store.watch(&target, index, wait) => res,
        };
        let update = match res {
            Ok(update) => {
                backoff = RETRY_BASE_DELAY;
                update
            }
            Err(err) => {
                metrics::WATCH_ERRORS.inc();
                warn!(
                    %target,
                    error = %err,
                    retry_in_ms = backoff.as_millis(),
                    "watch query failed, retrying"
                );
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = backoff.saturating_mul(2).min(MAX_RETRY_DELAY);
                continue;
            }
        };

        // an index must never be zero, or the next query would not block
        let new_index = update.index.max(1);
        if new_index == index {
            trace!(%target, index, "watch wait elapsed without change");
            continue;
        }
        // the store index went backwards (e.g. restored snapshot): start over
        index = if new_index < index { 0 } else { new_index };

        if !dispatch(&watcher, &target, update.payload, &token).await {
            break;
        }
    }
    metrics::WATCH_ACTIVE.dec();
    debug!(%target, "watch stopped");
}

/// Hand a payload to the registered handler. Returns false when the
/// registration or the watcher is gone.
async fn dispatch(
    watcher: &Weak<WatcherInner>,
    target: &WatchTarget,
    payload: WatchPayload,
    token: &CancellationToken,
) -> bool {
    let Some(inner) = watcher.upgrade() else {
        return false;
    };
    let registry = inner.registry.read().await;
    let Some(handler) = registry.handler(target) else {
        return false;
    };

    let fut = match (handler, payload) {
        (WatchHandler::Key(handler), WatchPayload::Key(pair)) => {
            let (holder, value) = pair.map(|p| (p.session, p.value)).unwrap_or_default();
            trace!(%target, ?holder, "dispatching key change");
            handler(target.key().to_owned(), holder, value)
        }
        (WatchHandler::Prefix(handler), WatchPayload::Prefix(pairs)) => {
            let children = pairs
                .into_iter()
                .filter(|p| !p.key.is_empty())
                .map(|p| (p.key, p.value))
                .collect::<HashMap<_, _>>();
            if children.is_empty() {
                trace!(%target, "prefix empty, not dispatching");
                return true;
            }
            trace!(%target, children = children.len(), "dispatching prefix change");
            handler(children)
        }
        (_, WatchPayload::Malformed(reason)) => {
            metrics::WATCH_MALFORMED.inc();
            warn!(%target, reason = %reason, "dropping malformed watch payload");
            return true;
        }
        (_, payload) => {
            metrics::WATCH_MALFORMED.inc();
            warn!(%target, ?payload, "dropping watch payload of unexpected shape");
            return true;
        }
    };
    metrics::WATCH_NOTIFICATIONS.inc();
    tokio::select! {
        _ = token.cancelled() => {
            debug!(%target, "watch cancelled during handler");
        }
        _ = fut => {}
    }
    true
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::mpsc;
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        CoordinationError,
        memory::MemoryStore,
        registry::{key_handler, prefix_handler},
        store::{CoordinationStore, WatchUpdate},
    };

    fn watcher(store: &MemoryStore) -> Watcher {
        Watcher::new(Arc::new(store.clone()), Duration::from_secs(60))
    }

    fn recording_key_handler() -> (KeyHandler, mpsc::UnboundedReceiver<(String, Option<String>, Vec<u8>)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = key_handler(move |key, holder, value| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((key, holder, value));
            }
        });
        (handler, rx)
    }

    #[tokio::test]
    async fn test_duplicate_registration() {
        let store = MemoryStore::new();
        let watcher = watcher(&store);
        let (h, _rx) = recording_key_handler();
        watcher
            .watch_keys(HashMap::from([("a".to_owned(), h.clone())]))
            .await
            .unwrap();

        let err = watcher
            .watch_keys(HashMap::from([("b".to_owned(), h.clone()), ("a".to_owned(), h)]))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::WatchFuncAlreadyExists { .. }));
        // nothing from the failed batch was registered
        assert_eq!(watcher.len().await, 1);
    }

    #[tokio::test]
    async fn test_unwatch_missing() {
        let store = MemoryStore::new();
        let watcher = watcher(&store);
        let err = watcher.unwatch_key("nope").await.unwrap_err();
        assert!(matches!(err, CoordinationError::WatchFuncNotExists { kind: "key", .. }));
        let err = watcher.unwatch_prefix("nope/").await.unwrap_err();
        assert!(matches!(
            err,
            CoordinationError::WatchFuncNotExists { kind: "keyprefix", .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_key_changes_are_dispatched() {
        let store = MemoryStore::new();
        let watcher = watcher(&store);
        let (h, mut rx) = recording_key_handler();
        watcher
            .watch_keys(HashMap::from([("cfg".to_owned(), h)]))
            .await
            .unwrap();
        watcher.start(CancellationToken::new()).await;

        // first observation: the key is missing
        assert_eq!(rx.recv().await.unwrap(), ("cfg".to_owned(), None, Vec::new()));

        store.kv_put("cfg", b"v1").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), ("cfg".to_owned(), None, b"v1".to_vec()));

        store.kv_put("cfg", b"v2").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().2, b"v2".to_vec());

        watcher.stop().await.unwrap();
        assert!(watcher.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_after_start_self_activates() {
        let store = MemoryStore::new();
        store.kv_put("late", b"x").await.unwrap();
        let watcher = watcher(&store);
        watcher.start(CancellationToken::new()).await;

        let (h, mut rx) = recording_key_handler();
        watcher
            .watch_keys(HashMap::from([("late".to_owned(), h)]))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().2, b"x".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_prefix_suppresses_empty_set() {
        let store = MemoryStore::new();
        let watcher = watcher(&store);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = prefix_handler(move |children| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(children);
            }
        });
        watcher
            .watch_prefix_keys(HashMap::from([("svc/".to_owned(), handler)]))
            .await
            .unwrap();
        watcher.start(CancellationToken::new()).await;

        store.kv_put("svc/a", b"1").await.unwrap();
        let children = rx.recv().await.unwrap();
        assert_eq!(children, HashMap::from([("svc/a".to_owned(), b"1".to_vec())]));

        store.kv_put("svc/b", b"2").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().len(), 2);

        // emptying the prefix is not reported, the next non-empty set is
        store.kv_delete("svc/a").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().len(), 1);
        store.kv_delete("svc/b").await.unwrap();
        store.kv_put("svc/c", b"3").await.unwrap();
        let children = rx.recv().await.unwrap();
        assert_eq!(children, HashMap::from([("svc/c".to_owned(), b"3".to_vec())]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unwatch_stops_only_that_watch() {
        let store = MemoryStore::new();
        let watcher = watcher(&store);
        let (a, mut rx_a) = recording_key_handler();
        let (b, mut rx_b) = recording_key_handler();
        watcher
            .watch_keys(HashMap::from([("a".to_owned(), a), ("b".to_owned(), b)]))
            .await
            .unwrap();
        watcher.start(CancellationToken::new()).await;
        rx_a.recv().await.unwrap();
        rx_b.recv().await.unwrap();

        watcher.unwatch_key("a").await.unwrap();
        store.kv_put("a", b"1").await.unwrap();
        store.kv_put("b", b"1").await.unwrap();
        assert_eq!(rx_b.recv().await.unwrap().2, b"1".to_vec());
        // the task for `a` exits and drops its handler
        assert!(rx_a.recv().await.is_none());
        assert_eq!(watcher.len().await, 1);
    }

    /// returns a malformed payload first, then delegates
    #[derive(Debug)]
    struct Garbled {
        inner: MemoryStore,
        served: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl CoordinationStore for Garbled {
        async fn create_session(&self, req: &crate::store::SessionRequest) -> CoordinationResult<String> {
            self.inner.create_session(req).await
        }
        async fn destroy_session(&self, id: &str) -> CoordinationResult<()> {
            self.inner.destroy_session(id).await
        }
        async fn renew_session(&self, id: &str) -> CoordinationResult<()> {
            self.inner.renew_session(id).await
        }
        async fn kv_get(&self, key: &str) -> CoordinationResult<Option<crate::store::KvPair>> {
            self.inner.kv_get(key).await
        }
        async fn kv_put(&self, key: &str, value: &[u8]) -> CoordinationResult<()> {
            self.inner.kv_put(key, value).await
        }
        async fn kv_delete(&self, key: &str) -> CoordinationResult<()> {
            self.inner.kv_delete(key).await
        }
        async fn kv_list(&self, prefix: &str) -> CoordinationResult<Vec<crate::store::KvPair>> {
            self.inner.kv_list(prefix).await
        }
        async fn kv_acquire(&self, key: &str, value: &[u8], session: &str) -> CoordinationResult<bool> {
            self.inner.kv_acquire(key, value, session).await
        }
        async fn kv_release(&self, key: &str, session: &str) -> CoordinationResult<bool> {
            self.inner.kv_release(key, session).await
        }
        async fn watch(
            &self,
            target: &WatchTarget,
            index: u64,
            wait: Duration,
        ) -> CoordinationResult<WatchUpdate> {
            if self.served.fetch_add(1, Ordering::SeqCst) == 0 {
                return Ok(WatchUpdate {
                    index: 1,
                    payload: WatchPayload::Malformed("not json".into()),
                });
            }
            self.inner.watch(target, index, wait).await
        }
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_malformed_payload_is_dropped() {
        let inner = MemoryStore::new();
        let store = Garbled {
            inner: inner.clone(),
            served: AtomicUsize::new(0),
        };
        let watcher = Watcher::new(Arc::new(store), Duration::from_secs(60));
        let (h, mut rx) = recording_key_handler();
        watcher
            .watch_keys(HashMap::from([("k".to_owned(), h)]))
            .await
            .unwrap();
        watcher.start(CancellationToken::new()).await;

        // the subscription survives and reports the next real change
        inner.kv_put("k", b"ok").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().2, b"ok".to_vec());
        assert!(metrics::WATCH_MALFORMED.get() >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_errors_back_off_and_recover() {
        let store = MemoryStore::new();
        store.set_available(false);
        let watcher = watcher(&store);
        let (h, mut rx) = recording_key_handler();
        watcher
            .watch_keys(HashMap::from([("k".to_owned(), h)]))
            .await
            .unwrap();
        watcher.start(CancellationToken::new()).await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());

        store.set_available(true);
        assert_eq!(rx.recv().await.unwrap(), ("k".to_owned(), None, Vec::new()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_token_ends_subscriptions() {
        let store = MemoryStore::new();
        let watcher = watcher(&store);
        let (h, mut rx) = recording_key_handler();
        watcher
            .watch_keys(HashMap::from([("k".to_owned(), h)]))
            .await
            .unwrap();
        let shutdown = CancellationToken::new();
        watcher.start(shutdown.clone()).await;
        rx.recv().await.unwrap();

        shutdown.cancel();
        store.kv_put("k", b"after").await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
    }
}
