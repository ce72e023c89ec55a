use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use tracing::debug;

pub mod env;
pub mod wire;

pub use wire::Scheme;

use env::{ProcessEnv, VarSource};

/// validated coordination config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsulConfig {
    pub app_name: String,
    /// `host:port` of the store's HTTP API
    pub address: String,
    pub scheme: Scheme,
    pub token: Option<String>,
    pub service_name: String,
    /// key contended for by every instance
    pub lock_key: String,
    pub session_ttl: Duration,
    /// interval of the fallback leadership recheck
    pub leader_ttl: Duration,
    pub lock_delay: Duration,
    pub request_timeout: Duration,
    pub watch_wait: Duration,
    pub connect_retry_max: u32,
    pub insecure_skip_verify: bool,
    path: Option<PathBuf>,
}

impl ConsulConfig {
    /// attempts to decode the config first as JSON, then YAML, finally erroring if neither work.
    /// Environment overrides are applied on top.
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path)
            .with_context(|| format!("failed to find config at {}", &path.display()))?;
        let mut config = Self::from_wire(Self::decode(&input)?, &ProcessEnv)?;
        config.path = Some(path.to_path_buf());
        debug!(?config);
        Ok(config)
    }

    /// attempts to decode the config first as JSON, then YAML, finally erroring if neither work
    pub fn parse_str<S: AsRef<str>>(s: S) -> Result<Self> {
        let config = Self::from_wire(Self::decode(s.as_ref())?, &ProcessEnv)?;
        debug!(?config);
        Ok(config)
    }

    /// Build the config from defaults plus environment variables only.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(&ProcessEnv)
    }

    /// Build the config from defaults plus the given variables only.
    pub fn from_vars<V: VarSource + ?Sized>(src: &V) -> Result<Self> {
        let wire = wire::Config {
            app_name: String::new(),
            consul: wire::Consul::default(),
        };
        Self::from_wire(wire, src)
    }

    fn decode(input: &str) -> Result<wire::Config> {
        match serde_json::from_str::<wire::Config>(input) {
            Ok(r) => Ok(r),
            Err(_err) => serde_yaml::from_str::<wire::Config>(input)
                .context("config is neither valid JSON nor YAML"),
        }
    }

    /// apply env overrides then validate
    pub fn from_wire<V: VarSource + ?Sized>(mut wire: wire::Config, src: &V) -> Result<Self> {
        wire.apply_env(src)?;
        Self::try_from(wire)
    }

    /// base URL of the store's HTTP API, e.g. `http://127.0.0.1:8500`
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme, self.address)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl TryFrom<wire::Config> for ConsulConfig {
    type Error = anyhow::Error;

    fn try_from(cfg: wire::Config) -> Result<Self> {
        let wire::Config { app_name, consul } = cfg;
        let address = consul.address.trim().to_owned();
        if address.is_empty() {
            bail!("consul address must not be empty");
        }
        if consul.session_ttl.is_zero() {
            bail!("session_ttl must be greater than zero");
        }
        if consul.leader_ttl.is_zero() {
            bail!("leader_ttl must be greater than zero");
        }
        if consul.lock_delay >= consul.leader_ttl {
            bail!(
                "lock_delay ({:?}) must be shorter than leader_ttl ({:?})",
                consul.lock_delay,
                consul.leader_ttl
            );
        }
        let service_name = consul
            .service_name
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| app_name.clone());
        let lock_key = match consul.lock_key.filter(|s| !s.is_empty()) {
            Some(key) => key,
            None if service_name.is_empty() => {
                bail!("one of app_name, service_name or lock_key must be set")
            }
            None => format!("service/{service_name}/leader"),
        };

        Ok(Self {
            app_name,
            address,
            scheme: consul.scheme,
            token: consul.token.filter(|s| !s.is_empty()),
            service_name,
            lock_key,
            session_ttl: consul.session_ttl,
            leader_ttl: consul.leader_ttl,
            lock_delay: consul.lock_delay,
            request_timeout: consul.request_timeout,
            watch_wait: consul.watch_wait,
            connect_retry_max: consul.connect_retry_max,
            insecure_skip_verify: consul.insecure_skip_verify,
            path: None,
        })
    }
}

impl ConsulConfig {
    /// Config for `app_name` with every other value defaulted and no
    /// environment lookups.
    pub fn for_app<S: Into<String>>(app_name: S) -> Result<Self> {
        Self::try_from(wire::Config {
            app_name: app_name.into(),
            consul: wire::Consul::default(),
        })
    }
}
