//! Watch handler registry keyed by `(kind, key)`.

use std::{collections::HashMap, fmt, future::Future, sync::Arc};

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{CoordinationError, CoordinationResult},
    store::WatchTarget,
};

/// Called with `(key, holder session, value)` on every change of a watched
/// key. A missing key is reported as `(key, None, [])`.
pub type KeyHandler =
    Arc<dyn Fn(String, Option<String>, Vec<u8>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Called with every non-empty `key → value` under a watched prefix.
pub type PrefixHandler = Arc<dyn Fn(HashMap<String, Vec<u8>>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`KeyHandler`].
pub fn key_handler<F, Fut>(f: F) -> KeyHandler
where
    F: Fn(String, Option<String>, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |key, holder, value| Box::pin(f(key, holder, value)))
}

/// Wrap an async closure as a [`PrefixHandler`].
pub fn prefix_handler<F, Fut>(f: F) -> PrefixHandler
where
    F: Fn(HashMap<String, Vec<u8>>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |pairs| Box::pin(f(pairs)))
}

/// The two handler shapes a registration can carry.
#[derive(Clone)]
pub enum WatchHandler {
    Key(KeyHandler),
    Prefix(PrefixHandler),
}

impl fmt::Debug for WatchHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchHandler::Key(_) => f.write_str("WatchHandler::Key"),
            WatchHandler::Prefix(_) => f.write_str("WatchHandler::Prefix"),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Registration {
    pub(crate) handler: WatchHandler,
    /// cancels the subscription task, `None` until the watcher is started
    pub(crate) task: Option<CancellationToken>,
}

/// Live registrations. At most one per `(kind, key)`.
#[derive(Debug, Default)]
pub struct WatchRegistry {
    entries: HashMap<WatchTarget, Registration>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `target`; a duplicate is an error, never an
    /// overwrite.
    pub(crate) fn insert(
        &mut self,
        target: WatchTarget,
        handler: WatchHandler,
    ) -> CoordinationResult<()> {
        if self.entries.contains_key(&target) {
            return Err(CoordinationError::WatchFuncAlreadyExists {
                kind: target.kind(),
                key: target.key().to_owned(),
            });
        }
        self.entries.insert(
            target,
            Registration {
                handler,
                task: None,
            },
        );
        Ok(())
    }

    pub(crate) fn remove(&mut self, target: &WatchTarget) -> CoordinationResult<Registration> {
        self.entries
            .remove(target)
            .ok_or_else(|| CoordinationError::WatchFuncNotExists {
                kind: target.kind(),
                key: target.key().to_owned(),
            })
    }

    pub fn contains(&self, target: &WatchTarget) -> bool {
        self.entries.contains_key(target)
    }

    pub fn handler(&self, target: &WatchTarget) -> Option<&WatchHandler> {
        self.entries.get(target).map(|r| &r.handler)
    }

    pub(crate) fn get_mut(&mut self, target: &WatchTarget) -> Option<&mut Registration> {
        self.entries.get_mut(target)
    }

    pub fn targets(&self) -> Vec<WatchTarget> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_key() -> WatchHandler {
        WatchHandler::Key(key_handler(|_, _, _| async {}))
    }

    #[test]
    fn test_duplicate_is_rejected() {
        let mut registry = WatchRegistry::new();
        let target = WatchTarget::Key("service/a/leader".into());
        registry.insert(target.clone(), noop_key()).unwrap();

        let err = registry.insert(target.clone(), noop_key()).unwrap_err();
        assert!(matches!(
            err,
            CoordinationError::WatchFuncAlreadyExists { kind: "key", .. }
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_kind_is_part_of_identity() {
        let mut registry = WatchRegistry::new();
        registry
            .insert(WatchTarget::Key("svc/".into()), noop_key())
            .unwrap();
        registry
            .insert(
                WatchTarget::Prefix("svc/".into()),
                WatchHandler::Prefix(prefix_handler(|_| async {})),
            )
            .unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_remove_missing() {
        let mut registry = WatchRegistry::new();
        let err = registry
            .remove(&WatchTarget::Prefix("nope/".into()))
            .unwrap_err();
        assert_eq!(err.to_string(), "watch func not exists: keyprefix nope/");

        registry
            .insert(WatchTarget::Key("k".into()), noop_key())
            .unwrap();
        registry.remove(&WatchTarget::Key("k".into())).unwrap();
        assert!(registry.is_empty());
    }
}
