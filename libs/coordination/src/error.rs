//! Error types for coordination operations.
//!
//! Provides typed error variants so that callers can distinguish transport
//! failures, session lifecycle misuse, watch registration conflicts and
//! malformed store payloads without leaking HTTP details.

use std::fmt;

use thiserror::Error;

/// Top-level error type for the coordination crate.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// Store unreachable or a transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Operation timed out waiting for the store.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Payload returned by the store did not have the expected shape.
    #[error("codec error: {0}")]
    Codec(String),

    /// Configuration error (e.g. invalid address).
    #[error("configuration error: {0}")]
    Config(String),

    /// The session was never created, or has already been destroyed.
    #[error("empty session")]
    EmptySession,

    /// `create` was called on a session manager that already owns a session.
    #[error("session already created: {0}")]
    SessionExists(String),

    /// The store does not know the session (expired or destroyed).
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// A handler is already registered for this watch.
    #[error("watch func already exists: {kind} {key}")]
    WatchFuncAlreadyExists { kind: &'static str, key: String },

    /// No handler is registered for this watch.
    #[error("watch func not exists: {kind} {key}")]
    WatchFuncNotExists { kind: &'static str, key: String },

    /// Operation is not valid in the current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Another error with a description of the failing step.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<CoordinationError>,
    },

    /// Several independent failures, e.g. from a teardown that attempts
    /// every step.
    #[error("{}", JoinedDisplay(.0))]
    Joined(Vec<CoordinationError>),
}

struct JoinedDisplay<'a>(&'a [CoordinationError]);

impl fmt::Display for JoinedDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl CoordinationError {
    /// Wrap this error with a description of the step that failed.
    pub fn context(self, context: impl Into<String>) -> Self {
        CoordinationError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, looking through [`CoordinationError::Context`].
    pub fn root(&self) -> &CoordinationError {
        match self {
            CoordinationError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Returns true if this error indicates a transient failure that may
    /// succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            CoordinationError::Transport(_) | CoordinationError::Timeout(_)
        )
    }

    /// Returns true if the session was never created or already destroyed.
    pub fn is_empty_session(&self) -> bool {
        matches!(self.root(), CoordinationError::EmptySession)
    }

    /// Returns true if the store no longer knows the session.
    pub fn is_session_not_found(&self) -> bool {
        matches!(self.root(), CoordinationError::SessionNotFound(_))
    }

    /// Every individual failure carried by this error. A joined error yields
    /// its members, anything else yields itself.
    pub fn failures(&self) -> Vec<&CoordinationError> {
        match self {
            CoordinationError::Joined(errs) => errs.iter().flat_map(|e| e.failures()).collect(),
            other => vec![other],
        }
    }
}

/// Shorthand result alias for coordination operations.
pub type CoordinationResult<T> = Result<T, CoordinationError>;

/// Collects failures from independent steps so none of them is skipped.
#[derive(Debug, Default)]
pub struct ErrorJoin {
    errors: Vec<CoordinationError>,
}

impl ErrorJoin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the error of a step, if any.
    pub fn push<T>(&mut self, res: CoordinationResult<T>) -> Option<T> {
        match res {
            Ok(val) => Some(val),
            Err(err) => {
                self.errors.push(err);
                None
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// `Ok` when no step failed, the single error when one did, and
    /// [`CoordinationError::Joined`] otherwise.
    pub fn into_result(mut self) -> CoordinationResult<()> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(CoordinationError::Joined(self.errors)),
        }
    }
}
