use std::{path::PathBuf, sync::Arc};

use clap::{Parser, ValueEnum};
use osqmon_collector::QueryCollector;
use osqmon_server::{
    config::{Config, listen_address, validate_telemetry_path},
    router::{AppState, app_router},
    runner::build_runner,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "osqmon", about = "Prometheus exporter for osquery query results")]
struct Cli {
    #[arg(long = "config.file", default_value = "config.yaml")]
    config_file: PathBuf,

    #[arg(long = "web.listen-address", default_value = ":9232")]
    listen_address: String,

    #[arg(long = "web.telemetry-path", default_value = "/metrics")]
    telemetry_path: String,

    #[arg(long = "log.level", default_value = "info")]
    log_level: String,

    #[arg(long = "log.format", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&cli.log_level)?,
    };
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(env_filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init(),
    }

    validate_telemetry_path(&cli.telemetry_path)?;
    let settings = Config::load(&cli.config_file)?.settings()?;
    let runner = build_runner(&settings.runner).await?;
    let collector = Arc::new(QueryCollector::new(
        runner,
        settings.definitions,
        settings.throttle_interval,
    )?);

    let state = Arc::new(AppState::new(collector, cli.telemetry_path.clone())?);
    let app = app_router(state);

    let addr = listen_address(&cli.listen_address);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(
        address = %addr,
        telemetry_path = %cli.telemetry_path,
        "osquery exporter listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("osquery exporter stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
