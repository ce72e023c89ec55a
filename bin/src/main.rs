#![allow(clippy::cognitive_complexity)]
use std::time::Duration;

use anyhow::{Result, anyhow};

mod cli;
mod trace;

use cli::{Parser, StoreKind};
use config::ConsulConfig;
use coordination::{Coordination, LeaderCoordinator};
use tokio::{runtime::Builder, signal, task::JoinHandle};
use tracing::*;

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;
use tokio_util::sync::CancellationToken;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() -> Result<()> {
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.warden_log)?;
    debug!(?config, ?trace_config);
    if let Err(err) = dotenv::dotenv() {
        debug!(?err, ".env file not loaded");
    }

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    // default num threads will be num logical CPUs
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    let rt = builder.build()?;

    rt.block_on(async move {
        match tokio::spawn(async move { start(config).await }).await {
            Err(err) => error!(?err, "failed to start election"),
            Ok(Err(err)) => error!(?err, "exited with error"),
            Ok(_) => debug!("exiting..."),
        }
    });

    Ok(())
}

async fn start(config: cli::Config) -> Result<()> {
    let election_cfg = match &config.config_path {
        Some(path) => {
            debug!(?path, "parsing election config");
            ConsulConfig::parse(path)?
        }
        None => {
            debug!("reading election config from environment");
            ConsulConfig::from_env()?
        }
    };
    info!(
        app_name = %election_cfg.app_name,
        lock_key = %election_cfg.lock_key,
        address = %election_cfg.base_url(),
        "election config loaded"
    );

    let coordination = match config.store {
        StoreKind::Consul => Coordination::consul(election_cfg)
            .await
            .map_err(|err| anyhow!("consul connection failed: {err}"))?,
        StoreKind::Memory => {
            warn!("using in-process store, leadership is local to this process");
            Coordination::memory(election_cfg)
        }
    };

    let token = CancellationToken::new();
    let leader = coordination.leader();
    leader
        .start(token.clone())
        .await
        .map_err(|err| anyhow!("failed to start leader election: {err}"))?;

    let status_task = spawn_status_task(leader.clone(), config.status_interval(), token.clone());

    if let Err(err) = shutdown_signal(token.clone()).await {
        error!(?err, "error waiting for shutdown signal");
        token.cancel();
    }
    info!("shutting down leader election");

    let res = leader.stop().await;
    if let Err(err) = status_task.await {
        error!(?err, "error waiting for status task");
    }
    res.map_err(|err| anyhow!("leader election teardown incomplete: {err}"))
}

fn spawn_status_task(
    leader: LeaderCoordinator,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("status task stopping");
                    return;
                }
                _ = ticker.tick() => {
                    info!(
                        is_leader = leader.is_leader(),
                        state = %leader.state(),
                        session_id = ?leader.session_id(),
                        lock_key = %leader.lock_key(),
                        "leadership status"
                    );
                }
            }
        }
    })
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    let ret = signal::ctrl_c().await.map_err(|err| anyhow!(err));
    token.cancel();
    ret
}
