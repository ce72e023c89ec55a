//! Parse from either cli or env var

use std::{path::PathBuf, time::Duration};

pub use clap::Parser;
use clap::ValueEnum;

/// tokio worker thread name
pub static DEFAULT_THREAD_NAME: &str = "warden-worker";
/// default log level. Can use this argument or WARDEN_LOG env var
pub const DEFAULT_WARDEN_LOG: &str = "info";
/// seconds between leadership status logs
pub const DEFAULT_STATUS_INTERVAL: u64 = 30;

/// which coordination store to run the election against
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// a Consul agent, see the `CONSUL_*` variables
    Consul,
    /// in-process store; only useful for local runs
    Memory,
}

#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[clap(author, name = "warden", bin_name = "warden", about, long_about = None)]
/// parses from cli & environment var. warden will load `.env` in the same dir as the binary as well
pub struct Config {
    /// path to the election config (JSON or YAML). Without it the config is
    /// read from `APP_NAME` and the `CONSUL_*` env vars
    #[clap(short, long, value_parser, env = "WARDEN_CONFIG")]
    pub config_path: Option<PathBuf>,
    /// coordination store
    #[clap(long, env = "WARDEN_STORE", value_enum, default_value_t = StoreKind::Consul)]
    pub store: StoreKind,
    /// seconds between leadership status logs
    #[clap(long, env, value_parser, default_value_t = DEFAULT_STATUS_INTERVAL)]
    pub status_interval: u64,
    /// Worker thread name
    #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
    pub thread_name: String,
    /// number of worker threads, defaults to the number of logical CPUs
    #[clap(long, env, value_parser)]
    pub threads: Option<usize>,
    /// set the log level. All valid RUST_LOG arguments are accepted
    #[clap(long, env, value_parser, default_value = DEFAULT_WARDEN_LOG)]
    pub warden_log: String,
}

impl Config {
    /// status log interval as `Duration`
    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval.max(1))
    }
}
