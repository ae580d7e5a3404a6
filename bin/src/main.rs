use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow};
use leader_election::LeaderElector;
use tokio::{runtime::Builder, signal};
use tokio_util::sync::CancellationToken;
use tracing::*;

mod config;

use config::{
    cli::{self, Parser},
    trace,
};

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() -> Result<()> {
    if let Err(err) = dotenv::dotenv() {
        eprintln!(".env file not loaded: {err}");
    }
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.elector_log, &config.log_format)?;
    debug!(?config, ?trace_config);

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    // default num threads will be num logical CPUs
    // if we have a configured value here, set it
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    // build the runtime
    let rt = builder.build()?;

    rt.block_on(async move {
        match tokio::spawn(async move { start(config).await }).await {
            Err(err) => error!(?err, "failed to start elector"),
            Ok(Err(err)) => error!(?err, "exited with error"),
            Ok(_) => debug!("exiting..."),
        }
    });

    Ok(())
}

async fn start(config: cli::Config) -> Result<()> {
    debug!("parsing election config");
    let election_cfg = config.election_config()?;
    let elector = Arc::new(
        LeaderElector::from_config(&election_cfg).context("invalid election config")?,
    );
    info!(identity = %elector.identity(), role = %elector.role(), "using identity");

    let handle = tokio::runtime::Handle::current();
    let interval = config.work_interval();
    let role = elector.role().to_string();
    elector.add_on_started_leading(move |session| {
        info!(%role, "started leading");
        handle.spawn(singleton_work(session, interval));
    });
    let role = elector.role().to_string();
    elector.add_on_stopped_leading(move || info!(%role, "stopped leading"));

    let token = CancellationToken::new();
    let signal_task = tokio::spawn(shutdown_signal(token.clone()));

    let result = elector
        .run(token.clone())
        .await
        .context("leader election failed");
    token.cancel();
    signal_task.abort();
    result
}

/// Stand-in for the work only the leader may do. Stops as soon as the
/// session token is cancelled.
async fn singleton_work(session: CancellationToken, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    let mut ticks: u64 = 0;
    loop {
        tokio::select! {
            _ = session.cancelled() => {
                debug!(ticks, "singleton work stopping");
                return;
            }
            _ = ticker.tick() => {
                ticks += 1;
                info!(ticks, "performing singleton work");
            }
        }
    }
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    let ret = signal::ctrl_c().await.map_err(|err| anyhow!(err));
    token.cancel();
    ret
}
