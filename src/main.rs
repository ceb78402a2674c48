use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use olt_poller::probe::HttpProbeExecutor;
use olt_poller::store::postgres::{PgEventSink, PgStore};
use olt_poller::{Config, FatalError, RuntimeBuilder};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Base URL of the probe engine service.
    #[arg(long, env = "PROBE_ENGINE_URL")]
    probe_engine_url: reqwest::Url,

    /// Bind address for the control surface. Omit to run headless.
    #[arg(long, env = "POLLER_HTTP_ADDR")]
    http_addr: Option<SocketAddr>,

    /// Number of worker slots in the poller pool.
    #[arg(long, env = "POLLER_POOL_SIZE", default_value_t = 10)]
    pool_size: usize,

    /// Soft cap on each device's pending queue.
    #[arg(long, default_value_t = 100)]
    queue_soft_limit: u64,

    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
    tick_period: Duration,

    /// Upper bound on one probe out-call.
    #[arg(long, default_value = "2m", value_parser = humantime::parse_duration)]
    probe_timeout: Duration,

    /// Delete events older than this horizon. Omit to keep everything.
    #[arg(long, value_parser = humantime::parse_duration)]
    event_retention: Option<Duration>,

    /// Apply pending schema migrations on startup.
    #[arg(long)]
    migrate: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            use clap::error::ErrorKind;

            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => FatalError::Config(String::new()).exit_code() as u8,
            };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run(args: Args) -> Result<(), FatalError> {
    let config = Config {
        tick_period: args.tick_period,
        pool_size: args.pool_size,
        queue_soft_limit: args.queue_soft_limit,
        probe_timeout: args.probe_timeout,
        event_retention: args.event_retention,
        ..Config::default()
    };

    let pool = sqlx::PgPool::connect(&args.database_url)
        .await
        .context("failed to connect to the database")
        .map_err(FatalError::Persistence)?;

    let store = Arc::new(PgStore::new(pool.clone(), config.queue_soft_limit));
    if args.migrate {
        store.migrate().await.map_err(FatalError::Persistence)?;
    }

    let executor = HttpProbeExecutor::new(args.probe_engine_url, config.probe_timeout)
        .map_err(|e| FatalError::Config(format!("invalid probe engine client: {e:#}")))?;

    let mut builder = RuntimeBuilder::new(
        store.clone(),
        store.clone(),
        store,
        Arc::new(executor),
    )
    .config(config)
    .event_sink(Arc::new(PgEventSink::new(pool)));

    if let Some(addr) = args.http_addr {
        builder = builder.http_addr(addr);
    }

    let mut runtime = builder.build();
    let handle = runtime.handle();

    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;

        tracing::info!("got Ctrl^C, shutting down");
        handle.shutdown();
    });

    tracing::info!("poller coordinator starting up");
    runtime.run().await.map_err(FatalError::Persistence)?;

    Ok(())
}
