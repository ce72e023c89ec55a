use std::{fmt, str::FromStr, time::Duration};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::env::{self, VarSource};

/// top-level config type
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// name of the application taking part in the election
    #[serde(default)]
    pub app_name: String,
    #[serde(default)]
    pub consul: Consul,
}

/// coordination store connection and election timing
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Consul {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default)]
    pub scheme: Scheme,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// lock key becomes `service/{service_name}/leader`, defaults to `app_name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    /// explicit lock key, wins over `service_name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_key: Option<String>,
    #[serde(default = "default_session_ttl", with = "duration")]
    pub session_ttl: Duration,
    /// recheck interval for the leadership flag
    #[serde(default = "default_leader_ttl", with = "duration")]
    pub leader_ttl: Duration,
    #[serde(default = "default_lock_delay", with = "duration")]
    pub lock_delay: Duration,
    #[serde(default = "default_request_timeout", with = "duration")]
    pub request_timeout: Duration,
    /// max time a blocking watch query is held open by the server
    #[serde(default = "default_watch_wait", with = "duration")]
    pub watch_wait: Duration,
    #[serde(default = "default_connect_retry_max")]
    pub connect_retry_max: u32,
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

impl Default for Consul {
    fn default() -> Self {
        Self {
            address: default_address(),
            scheme: Scheme::default(),
            token: None,
            service_name: None,
            lock_key: None,
            session_ttl: default_session_ttl(),
            leader_ttl: default_leader_ttl(),
            lock_delay: default_lock_delay(),
            request_timeout: default_request_timeout(),
            watch_wait: default_watch_wait(),
            connect_retry_max: default_connect_retry_max(),
            insecure_skip_verify: false,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            other => bail!("unsupported scheme '{other}', only 'http' or 'https' are supported"),
        }
    }
}

pub fn default_address() -> String {
    "127.0.0.1:8500".to_owned()
}

pub const fn default_session_ttl() -> Duration {
    Duration::from_secs(15)
}

pub const fn default_leader_ttl() -> Duration {
    Duration::from_secs(10)
}

pub const fn default_lock_delay() -> Duration {
    Duration::from_secs(2)
}

pub const fn default_request_timeout() -> Duration {
    Duration::from_secs(5)
}

pub const fn default_watch_wait() -> Duration {
    Duration::from_secs(300)
}

pub const fn default_connect_retry_max() -> u32 {
    3
}

impl Config {
    /// Overlay `APP_NAME` and the `CONSUL_*` variables on top of this config.
    pub fn apply_env<V: VarSource + ?Sized>(&mut self, src: &V) -> Result<()> {
        if let Some(app_name) = env::var_opt(src, "APP_NAME") {
            self.app_name = app_name;
        }
        let consul = &mut self.consul;
        if let Some(address) = env::var_opt(src, "CONSUL_ADDRESS") {
            consul.address = address;
        }
        if let Some(scheme) = env::parse_var_opt(src, "CONSUL_SCHEME")? {
            consul.scheme = scheme;
        }
        if let Some(token) = env::var_opt(src, "CONSUL_TOKEN") {
            consul.token = Some(token);
        }
        if let Some(service_name) = env::var_opt(src, "CONSUL_SERVICE_NAME") {
            consul.service_name = Some(service_name);
        }
        if let Some(lock_key) = env::var_opt(src, "CONSUL_LOCK_KEY") {
            consul.lock_key = Some(lock_key);
        }
        if let Some(ttl) = env::duration_var_opt(src, "CONSUL_SESSION_TTL")? {
            consul.session_ttl = ttl;
        }
        if let Some(ttl) = env::duration_var_opt(src, "CONSUL_LEADER_TTL")? {
            consul.leader_ttl = ttl;
        }
        if let Some(skip) = env::parse_var_opt(src, "CONSUL_INSECURE_SKIP_VERIFY")? {
            consul.insecure_skip_verify = skip;
        }
        Ok(())
    }
}

/// Parse a duration string with optional time units
/// Accepts: "15", "15s", "500ms", "5m", "1h"
/// If no unit is specified, assumes seconds
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        bail!("empty duration string");
    }

    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    // split units
    let (num, unit) = s.split_at(end);
    let num = num.parse::<u64>().context("invalid number")?;

    let millis_per_unit = match unit.trim() {
        "ms" => 1,
        "" | "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        other => bail!("unknown time unit '{other}', only 'h', 'm', 's' or 'ms' are supported"),
    };

    num.checked_mul(millis_per_unit)
        .map(Duration::from_millis)
        .context("duration value overflow")
}

/// serde helpers for durations written as seconds or unit strings
mod duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum WireDuration {
        Seconds(u64),
        String(String),
    }

    pub(super) fn serialize<S: Serializer>(d: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        if d.subsec_millis() == 0 {
            ser.serialize_str(&format!("{}s", d.as_secs()))
        } else {
            ser.serialize_str(&format!("{}ms", d.as_millis()))
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match WireDuration::deserialize(deserializer)? {
            WireDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
            WireDuration::String(s) => super::parse_duration(&s).map_err(de::Error::custom),
        }
    }
}
