//! Log output for the warden binary.
//!
//! Leadership changes are logged by the coordination crate at `info`, so the
//! default filter keeps those and quiets the HTTP stack underneath the Consul
//! client.
use std::str::FromStr;

use anyhow::Result;
use config::env::{self, ProcessEnv};
use tracing_subscriber::{
    filter::EnvFilter,
    fmt::{
        self,
        format::{Format, PrettyFields},
    },
    prelude::__tracing_subscriber_SubscriberExt,
    util::SubscriberInitExt,
};

/// Shape of each log line, chosen with `LOG_FORMAT`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// single-line, human readable
    #[default]
    Standard,
    /// one JSON object per event, for log shippers
    Json,
    /// multi-line, for a terminal
    Pretty,
}

impl FromStr for LogFormat {
    type Err = std::convert::Infallible;

    /// unknown names fall back to `Standard`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "json" => LogFormat::Json,
            "pretty" => LogFormat::Pretty,
            _ => LogFormat::Standard,
        })
    }
}

#[derive(Debug)]
pub struct Config {
    pub format: LogFormat,
}

impl Config {
    /// Install the global subscriber. `warden_log` takes any `RUST_LOG`
    /// directive; an invalid one falls back to `info`.
    pub fn parse(warden_log: &str) -> Result<Self> {
        let format: LogFormat = env::var_opt(&ProcessEnv, "LOG_FORMAT")
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();
        let filter = filter(warden_log)?;

        let registry = tracing_subscriber::registry().with(filter);
        match format {
            LogFormat::Json => registry.with(fmt::layer().json()).init(),
            LogFormat::Pretty => registry
                .with(
                    fmt::layer()
                        .event_format(Format::default().pretty().with_source_location(false))
                        .fmt_fields(PrettyFields::new()),
                )
                .init(),
            LogFormat::Standard => registry.with(fmt::layer()).init(),
        }

        Ok(Self { format })
    }
}

/// level filter for warden, with the Consul client's transport kept quiet
fn filter(warden_log: &str) -> Result<EnvFilter> {
    Ok(EnvFilter::try_new(warden_log)
        .or_else(|_| EnvFilter::try_new("info"))?
        .add_directive("hyper=off".parse()?)
        .add_directive("reqwest=warn".parse()?))
}
