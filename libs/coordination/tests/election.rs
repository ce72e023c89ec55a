//! Multi-instance election scenarios over the in-process store.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use config::ConsulConfig;
use coordination::{
    Coordination, CoordinationError, CoordinationResult, CoordinationStore, KvPair,
    LeaderCoordinator, MemoryStore, Phase, SessionRequest, SharedStore, WatchTarget, WatchUpdate,
};
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

fn config(session_ttl: Duration, leader_ttl: Duration) -> ConsulConfig {
    let mut config = ConsulConfig::for_app("election-test").unwrap();
    config.session_ttl = session_ttl;
    config.leader_ttl = leader_ttl;
    config.lock_delay = Duration::ZERO;
    config.watch_wait = Duration::from_secs(60);
    config
}

fn coordinators(store: SharedStore, config: ConsulConfig, n: usize) -> Vec<LeaderCoordinator> {
    let coordination = Coordination::new(store, config);
    (0..n).map(|_| coordination.leader()).collect()
}

fn leader_count(coordinators: &[LeaderCoordinator]) -> usize {
    coordinators.iter().filter(|c| c.is_leader()).count()
}

fn leader_index(coordinators: &[LeaderCoordinator]) -> Option<usize> {
    coordinators.iter().position(|c| c.is_leader())
}

/// Injectable failures on top of a [`MemoryStore`].
#[derive(Debug, Default)]
struct Faults {
    watch_never_returns: AtomicBool,
    acquire_delay_ms: AtomicU64,
    fail_destroy: AtomicBool,
    fail_release: AtomicBool,
}

#[derive(Debug)]
struct FaultyStore {
    inner: MemoryStore,
    faults: Arc<Faults>,
}

impl FaultyStore {
    fn new() -> (Self, Arc<Faults>) {
        let faults = Arc::new(Faults::default());
        (
            Self {
                inner: MemoryStore::new(),
                faults: faults.clone(),
            },
            faults,
        )
    }
}

#[async_trait]
impl CoordinationStore for FaultyStore {
    async fn create_session(&self, req: &SessionRequest) -> CoordinationResult<String> {
        self.inner.create_session(req).await
    }

    async fn destroy_session(&self, id: &str) -> CoordinationResult<()> {
        if self.faults.fail_destroy.load(Ordering::SeqCst) {
            return Err(CoordinationError::Transport("destroy refused".into()));
        }
        self.inner.destroy_session(id).await
    }

    async fn renew_session(&self, id: &str) -> CoordinationResult<()> {
        self.inner.renew_session(id).await
    }

    async fn kv_get(&self, key: &str) -> CoordinationResult<Option<KvPair>> {
        self.inner.kv_get(key).await
    }

    async fn kv_put(&self, key: &str, value: &[u8]) -> CoordinationResult<()> {
        self.inner.kv_put(key, value).await
    }

    async fn kv_delete(&self, key: &str) -> CoordinationResult<()> {
        self.inner.kv_delete(key).await
    }

    async fn kv_list(&self, prefix: &str) -> CoordinationResult<Vec<KvPair>> {
        self.inner.kv_list(prefix).await
    }

    async fn kv_acquire(
        &self,
        key: &str,
        value: &[u8],
        session: &str,
    ) -> CoordinationResult<bool> {
        let delay = self.faults.acquire_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.inner.kv_acquire(key, value, session).await
    }

    async fn kv_release(&self, key: &str, session: &str) -> CoordinationResult<bool> {
        if self.faults.fail_release.load(Ordering::SeqCst) {
            return Err(CoordinationError::Transport("release refused".into()));
        }
        self.inner.kv_release(key, session).await
    }

    async fn watch(
        &self,
        target: &WatchTarget,
        index: u64,
        wait: Duration,
    ) -> CoordinationResult<WatchUpdate> {
        if self.faults.watch_never_returns.load(Ordering::SeqCst) {
            return futures::future::pending().await;
        }
        self.inner.watch(target, index, wait).await
    }
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn at_most_one_leader_through_handoffs() {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let nodes = coordinators(
        store,
        config(Duration::from_secs(2), Duration::from_secs(1)),
        5,
    );
    for node in &nodes {
        node.start(CancellationToken::new()).await.unwrap();
    }

    let mut stopped = 0;
    for round in 0..200 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(leader_count(&nodes) <= 1, "two leaders in round {round}");
        // hand off every two seconds until one node is left
        if round % 40 == 39 && stopped < nodes.len() - 1 {
            let idx = leader_index(&nodes).expect("a leader after two seconds");
            nodes[idx].stop().await.unwrap();
            stopped += 1;
        }
    }
    assert_eq!(stopped, 4);
    assert_eq!(leader_count(&nodes), 1);

    for node in &nodes {
        node.stop().await.unwrap();
    }
    assert_eq!(leader_count(&nodes), 0);
}

#[tokio::test(start_paused = true)]
async fn follower_takes_over_on_watch_event() {
    let store: SharedStore = Arc::new(MemoryStore::new());
    // recheck far in the future: only the watch can trigger the handoff
    let nodes = coordinators(
        store,
        config(Duration::from_secs(10), Duration::from_secs(60)),
        2,
    );
    nodes[0].start(CancellationToken::new()).await.unwrap();
    nodes[1].start(CancellationToken::new()).await.unwrap();
    assert!(nodes[0].is_leader());
    assert!(!nodes[1].is_leader());

    nodes[0].stop().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(nodes[1].is_leader());
    assert!(!nodes[0].is_leader());

    nodes[1].stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn follower_takes_over_by_polling_without_notifications() {
    let (store, faults) = FaultyStore::new();
    faults.watch_never_returns.store(true, Ordering::SeqCst);
    let nodes = coordinators(
        Arc::new(store),
        config(Duration::from_secs(10), Duration::from_secs(1)),
        2,
    );
    nodes[0].start(CancellationToken::new()).await.unwrap();
    nodes[1].start(CancellationToken::new()).await.unwrap();
    assert!(nodes[0].is_leader());

    nodes[0].stop().await.unwrap();
    assert!(!nodes[1].is_leader());

    // within one recheck interval
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(nodes[1].is_leader());

    nodes[1].stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn stop_during_in_flight_callback_is_bounded() {
    let (store, faults) = FaultyStore::new();
    let nodes = coordinators(
        Arc::new(store),
        config(Duration::from_secs(10), Duration::from_secs(60)),
        2,
    );
    nodes[0].start(CancellationToken::new()).await.unwrap();
    nodes[1].start(CancellationToken::new()).await.unwrap();

    // the follower's handler will block in acquire once the lock frees up
    faults.acquire_delay_ms.store(30_000, Ordering::SeqCst);
    nodes[0].stop().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let res = tokio::time::timeout(Duration::from_secs(5), nodes[1].stop()).await;
    assert!(res.expect("stop did not finish in time").is_ok());
    assert_eq!(nodes[1].state(), Phase::Stopped);
    assert!(!nodes[1].is_leader());
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn stop_attempts_every_step_and_joins_errors() {
    let (store, faults) = FaultyStore::new();
    let nodes = coordinators(
        Arc::new(store),
        config(Duration::from_secs(10), Duration::from_secs(5)),
        1,
    );
    let node = &nodes[0];
    node.start(CancellationToken::new()).await.unwrap();
    assert!(node.is_leader());

    faults.fail_destroy.store(true, Ordering::SeqCst);
    faults.fail_release.store(true, Ordering::SeqCst);
    let err = node.stop().await.unwrap_err();
    let failures = err.failures();
    assert_eq!(failures.len(), 2, "unexpected failures: {err}");
    assert!(failures.iter().all(|e| e.is_retryable()));
    assert!(err.to_string().contains("destroy refused"));
    assert!(err.to_string().contains("release refused"));

    // the watcher was still torn down and the flag cleared
    assert_eq!(node.state(), Phase::Stopped);
    assert!(!node.is_leader());
    // and a second stop is a no-op
    node.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failed_initial_acquire_tears_down() {
    let (store, faults) = FaultyStore::new();
    let memory = store.inner.clone();
    let nodes = coordinators(
        Arc::new(store),
        config(Duration::from_secs(10), Duration::from_secs(5)),
        1,
    );
    // the session disappears between create and the first acquire
    faults.acquire_delay_ms.store(1_000, Ordering::SeqCst);
    let node = nodes[0].clone();
    let start = tokio::spawn(async move { node.start(CancellationToken::new()).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let id = nodes[0].session_id().expect("session created");
    memory.destroy_session(&id).await.unwrap();

    let err = start.await.unwrap().unwrap_err();
    assert!(err.is_session_not_found());
    assert_eq!(nodes[0].state(), Phase::Stopped);
    assert!(!nodes[0].is_leader());
    assert_eq!(memory.session_count(), 0);
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn three_instances_survive_leader_crash() {
    let memory = MemoryStore::new();
    let nodes = coordinators(
        Arc::new(memory.clone()),
        config(Duration::from_secs(2), Duration::from_secs(1)),
        3,
    );
    for node in &nodes {
        node.start(CancellationToken::new()).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(leader_count(&nodes), 1);

    // the leader's session vanishes at the store while its coordinator runs on
    let crashed = leader_index(&nodes).unwrap();
    let id = nodes[crashed].session_id().unwrap();
    memory.destroy_session(&id).await.unwrap();

    for sample in 0..40 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(leader_count(&nodes), 1, "sample {sample}");
        assert_ne!(leader_index(&nodes), Some(crashed), "sample {sample}");
    }
    let successor = leader_index(&nodes).unwrap();

    // stays stable
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(leader_index(&nodes), Some(successor));

    for node in &nodes {
        node.stop().await.unwrap();
    }
    assert_eq!(leader_count(&nodes), 0);
}

#[tokio::test(start_paused = true)]
async fn leader_crash_with_lock_delay_hands_off_once_it_expires() {
    let memory = MemoryStore::new();
    let mut config = config(Duration::from_secs(2), Duration::from_secs(1));
    config.lock_delay = Duration::from_millis(500);
    let nodes = coordinators(Arc::new(memory.clone()), config, 3);
    for node in &nodes {
        node.start(CancellationToken::new()).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(leader_count(&nodes), 1);

    let crashed = leader_index(&nodes).unwrap();
    let id = nodes[crashed].session_id().unwrap();
    memory.destroy_session(&id).await.unwrap();

    let started = tokio::time::Instant::now();
    let mut successor_after = None;
    for sample in 0..40 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(leader_count(&nodes) <= 1, "two leaders at sample {sample}");
        assert!(!nodes[crashed].is_leader(), "crashed node leads at sample {sample}");
        if successor_after.is_none() && leader_count(&nodes) == 1 {
            successor_after = Some(started.elapsed());
        }
    }
    let successor_after = successor_after.expect("no successor");
    assert!(successor_after >= Duration::from_millis(500), "successor took {successor_after:?}");
    assert!(successor_after <= Duration::from_secs(1), "successor took {successor_after:?}");
    assert_eq!(leader_count(&nodes), 1);
    assert_ne!(leader_index(&nodes), Some(crashed));

    for node in &nodes {
        node.stop().await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn failed_renewal_clears_leadership() {
    let (store, faults) = FaultyStore::new();
    let memory = store.inner.clone();
    // no notifications and no recheck before the renewal notices
    faults.watch_never_returns.store(true, Ordering::SeqCst);
    let nodes = coordinators(
        Arc::new(store),
        config(Duration::from_secs(2), Duration::from_secs(60)),
        1,
    );
    let node = &nodes[0];
    node.start(CancellationToken::new()).await.unwrap();
    assert!(node.is_leader());

    let id = node.session_id().unwrap();
    memory.destroy_session(&id).await.unwrap();
    // renewal runs every ttl / 2
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(!node.is_leader());
    assert_eq!(node.state(), Phase::Running);

    node.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn stop_interrupts_hanging_start() {
    let (store, faults) = FaultyStore::new();
    let memory = store.inner.clone();
    let nodes = coordinators(
        Arc::new(store),
        config(Duration::from_secs(10), Duration::from_secs(5)),
        1,
    );
    faults.acquire_delay_ms.store(30_000, Ordering::SeqCst);
    let node = nodes[0].clone();
    let start = tokio::spawn(async move { node.start(CancellationToken::new()).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(nodes[0].state(), Phase::Starting);

    let res = tokio::time::timeout(Duration::from_secs(5), nodes[0].stop()).await;
    assert!(res.expect("stop did not finish in time").is_ok());
    assert_eq!(nodes[0].state(), Phase::Stopped);

    let err = start.await.unwrap().unwrap_err();
    assert!(matches!(err, CoordinationError::InvalidState(_)));
    assert!(!nodes[0].is_leader());
    assert_eq!(memory.session_count(), 0);

    // nothing left to restart from
    assert!(nodes[0].start(CancellationToken::new()).await.is_err());
    nodes[0].stop().await.unwrap();
}
