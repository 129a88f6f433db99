//! Fleetline Worker - school bus fleet scheduling service
//!
//! Serves the job API over HTTP/WebSocket and runs the optimization
//! worker pool against a persistent job store.

mod cli;
mod config;
mod db;
mod handlers;
mod services;
mod types;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use config::{Config, ProviderKind};
use services::cancellation::CancellationRegistry;
use services::jobs::{InlineRunner, JobExecutor, JobManager, JobRunner, JobsConfig, PooledRunner};
use services::optimizer::{run_optimization, OptimizeEnv};
use services::progress::{
    BrokerConfig, NatsProgressTransport, NullSink, ProgressBroker, ProgressTransport,
};
use services::travel_time::{
    check_remote_health, HaversineProvider, RemoteRoutingClient, RemoteRoutingConfig,
    TravelTimeProvider,
};
use types::{JobError, OptimizeJobRequest};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    dotenvy::dotenv().ok();

    match cli.command {
        Some(cli::Command::Optimize { input, pretty }) => run_optimize_file(input, pretty).await,
        Some(cli::Command::Migrate) => {
            tracing_subscriber::fmt::init();
            let config = Config::from_env()?;
            let pool = db::create_pool(&config.database_url).await?;
            db::run_migrations(&pool).await?;
            info!("Migrations complete, exiting.");
            Ok(())
        }
        Some(cli::Command::Serve) | None => {
            let config = Config::from_env()?;
            run_server(config).await
        }
    }
}

async fn run_server(config: Config) -> Result<()> {
    let logs_dir = std::env::var("LOGS_DIR").unwrap_or_else(|_| "./logs".to_string());
    std::fs::create_dir_all(&logs_dir).ok();

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &logs_dir, "worker.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,fleetline_worker=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .init();

    info!("Starting Fleetline Worker...");

    let pool = db::create_pool(&config.database_url).await?;
    info!("Connected to PostgreSQL");

    db::run_migrations(&pool).await?;
    info!("Database migrations complete");

    let recovered = db::queries::job::recover_interrupted(&pool).await?;
    if recovered > 0 {
        warn!(recovered, "interrupted jobs marked failed after restart");
    }

    let transport: Option<Arc<dyn ProgressTransport>> = match &config.nats_url {
        Some(url) => match async_nats::connect(url).await {
            Ok(client) => {
                info!("Connected to NATS at {}", url);
                Some(Arc::new(NatsProgressTransport::new(client)))
            }
            Err(e) => {
                warn!(error = %e, "NATS unavailable, progress stays in-process");
                None
            }
        },
        None => None,
    };

    let broker = ProgressBroker::spawn(
        BrokerConfig {
            min_interval: Duration::from_millis(config.progress_min_interval_ms),
            min_delta_pct: config.progress_min_delta_pct,
            queue_capacity: 32,
        },
        transport,
    );

    let provider = build_provider(&config).await?;
    let cancellations = CancellationRegistry::default();

    let jobs_config = JobsConfig {
        worker_concurrency: config.worker_concurrency,
        job_time_limit: Duration::from_secs(config.job_time_limit_seconds),
        detour_factor: config.fallback_detour_factor,
        speed_kmh: config.haversine_speed_kmh,
        ..Default::default()
    };
    let executor = Arc::new(JobExecutor::new(
        pool.clone(),
        broker.clone(),
        cancellations.clone(),
        provider,
        jobs_config,
    ));

    let runner: Arc<dyn JobRunner> = if config.queue_enabled {
        info!(workers = config.worker_concurrency, "worker pool enabled");
        Arc::new(PooledRunner::start(
            Arc::clone(&executor),
            config.worker_concurrency,
        ))
    } else {
        info!("async fabric disabled, running submissions inline");
        Arc::new(InlineRunner::new(Arc::clone(&executor)))
    };

    let manager = Arc::new(JobManager::new(
        pool,
        broker.clone(),
        cancellations.clone(),
        runner,
    ));

    let state = handlers::AppState {
        manager,
        broker,
        websocket_enabled: config.websocket_enabled,
        config: Arc::new(config.clone()),
    };
    let router = handlers::router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("Listening on {}", config.bind_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down, cancelling running jobs");
    cancellations.cancel_all();
    tokio::time::sleep(Duration::from_millis(500)).await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
}

async fn build_provider(config: &Config) -> Result<Arc<dyn TravelTimeProvider>> {
    match config.travel_time_provider {
        ProviderKind::Haversine => Ok(Arc::new(HaversineProvider::new(
            config.fallback_detour_factor,
            config.haversine_speed_kmh,
        ))),
        ProviderKind::Remote => {
            let base_url = config
                .remote_routing_url
                .clone()
                .expect("validated in Config::from_env");
            let table_url = config
                .remote_routing_table_url
                .clone()
                .expect("validated in Config::from_env");

            if let Err(e) = check_remote_health(&base_url).await {
                warn!(
                    error = %e,
                    "remote routing service not healthy, per-call fallback estimates apply"
                );
            } else {
                info!("Remote routing service available at {}", base_url);
            }

            Ok(Arc::new(RemoteRoutingClient::new(RemoteRoutingConfig::new(
                base_url, table_url,
            ))?))
        }
    }
}

/// CLI runner: optimize one request file inline, print the result, exit
/// with the documented code
async fn run_optimize_file(input: PathBuf, pretty: bool) -> Result<()> {
    // Keep stdout clean for the schedule JSON
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let raw = match std::fs::read_to_string(&input) {
        Ok(raw) => raw,
        Err(e) => {
            eprintln!("cannot read {}: {}", input.display(), e);
            std::process::exit(1);
        }
    };
    let request: OptimizeJobRequest = match serde_json::from_str(&raw) {
        Ok(request) => request,
        Err(e) => {
            eprintln!("invalid request file: {}", e);
            std::process::exit(1);
        }
    };

    let time_limit: u64 = std::env::var("JOB_TIME_LIMIT_SECONDS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3_600);

    let env = OptimizeEnv {
        job_id: Uuid::new_v4(),
        provider: Arc::new(HaversineProvider::default()),
        sink: Arc::new(NullSink),
        cancel: CancellationToken::new(),
        deadline: Some(Instant::now() + Duration::from_secs(time_limit)),
        detour_factor: services::geo::DEFAULT_DETOUR_FACTOR,
        speed_kmh: services::geo::DEFAULT_SPEED_KMH,
    };

    match run_optimization(request, env).await {
        Ok(result) => {
            let json = if pretty {
                serde_json::to_string_pretty(&result)?
            } else {
                serde_json::to_string(&result)?
            };
            println!("{}", json);
            Ok(())
        }
        Err(e) => {
            eprintln!("{}: {}", e.code(), e);
            let code = match e {
                JobError::InvalidInput(_) | JobError::Infeasible(_) => 1,
                JobError::Timeout => 2,
                JobError::Cancelled => 3,
                _ => 4,
            };
            std::process::exit(code);
        }
    }
}
