//! convenience fns for reading config overrides from environment variables
use std::{collections::HashMap, env, fmt, str, time::Duration};

use anyhow::{Context, Result};

use crate::wire::parse_duration;

/// Somewhere to look up environment-style variables. The process environment
/// in production, a plain map in tests.
pub trait VarSource {
    /// raw value of `name`, if set
    fn var(&self, name: &str) -> Option<String>;
}

/// the process environment
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl VarSource for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        env::var(name).ok()
    }
}

impl VarSource for HashMap<String, String> {
    fn var(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Returns the value of the variable with the given key, or None if it
/// doesn't exist or is blank.
pub fn var_opt<V: VarSource + ?Sized>(src: &V, name: &str) -> Option<String> {
    src.var(name)
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
}

/// Parses the variable with the given key, if it is set. A value that is
/// present but fails to parse is an error naming the variable.
pub fn parse_var_opt<T, V>(src: &V, name: &str) -> Result<Option<T>>
where
    T: str::FromStr,
    <T as str::FromStr>::Err: fmt::Display,
    V: VarSource + ?Sized,
{
    var_opt(src, name)
        .map(|s| {
            s.parse::<T>()
                .map_err(|e| anyhow::anyhow!("{e}"))
                .with_context(|| format!("error parsing env var {name}"))
        })
        .transpose()
}

/// Like [`parse_var_opt`] for durations ("15s", "500ms", or plain seconds).
pub fn duration_var_opt<V: VarSource + ?Sized>(src: &V, name: &str) -> Result<Option<Duration>> {
    var_opt(src, name)
        .map(|s| parse_duration(&s).with_context(|| format!("error parsing env var {name}")))
        .transpose()
}
