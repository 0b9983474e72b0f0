use anyhow::Context;
use clap::{Parser, Subcommand};
use eventlog_core::{
    Cluster, ClusterDeps, EventLogConfig, IngressServers, LogStatusSink, PipelineMetrics,
    RegistryBuilder, system_clock,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod http;
mod signals;

const DEFAULT_LOG_FILTER: &str = "eventlog=info,eventlog_core=info,eventlog_server=info";

#[derive(Parser)]
#[command(name = "eventlog")]
#[command(about = "Clustered event and container log ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an ingestion node
    Server {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Server { config } => {
            let cfg = match EventLogConfig::from_file(&config) {
                Ok(cfg) => cfg,
                Err(e) => {
                    init_tracing(None);
                    tracing::error!("Failed to load config {}: {}", config, e);
                    std::process::exit(1);
                }
            };
            init_tracing(cfg.log_level.as_deref());
            tracing::info!("Starting eventlog node with config: {}", config);

            if let Err(e) = run_server(cfg).await {
                tracing::error!("Server error: {:#}", e);
                std::process::exit(1);
            }
        }
    }
}

fn init_tracing(log_level: Option<&str>) {
    let fallback = log_level.unwrap_or(DEFAULT_LOG_FILTER).to_string();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| fallback.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run_server(config: EventLogConfig) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let root = CancellationToken::new();

    let registry = RegistryBuilder::from_config(
        &config.cluster.registry,
        &config.cluster.discover_home,
    )
    .build()
    .await
    .context("failed to connect to the coordination store")?;

    let metrics = PipelineMetrics::new(prometheus::Registry::new())?;
    let cluster = Arc::new(
        Cluster::start(
            config.clone(),
            ClusterDeps {
                registry,
                clock: system_clock(),
                metrics: metrics.clone(),
                status: Arc::new(LogStatusSink),
            },
            &root,
        )
        .await
        .context("failed to start cluster node")?,
    );
    let mut fatal = cluster
        .take_fatal_receiver()
        .context("fatal channel already taken")?;

    let ingress = match IngressServers::start(
        &config.entry,
        cluster.store().inputs(),
        metrics.clone(),
        &root,
        cluster.fatal_sender(),
    )
    .await
    {
        Ok(ingress) => ingress,
        Err(e) => {
            cluster.stop().await;
            return Err(e).context("failed to start ingress listeners");
        }
    };

    let listener = match tokio::net::TcpListener::bind(config.web.addr()).await {
        Ok(listener) => listener,
        Err(e) => {
            ingress.stop().await;
            cluster.stop().await;
            return Err(e).with_context(|| format!("failed to bind {}", config.web.addr()));
        }
    };
    tracing::info!("HTTP server listening on {}", config.web.addr());

    let http_token = root.child_token();
    let app = http::router(http::AppState {
        cluster: cluster.clone(),
        metrics,
    });
    let http_shutdown = http_token.clone();
    let http_task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { http_shutdown.cancelled().await })
            .await
    });

    let mut exit: anyhow::Result<()> = Ok(());
    tokio::select! {
        signal = signals::wait_for_shutdown_signal() => {
            if let Err(e) = signal {
                exit = Err(e).context("failed to install signal handlers");
            }
        }
        Some(error) = fatal.recv() => {
            tracing::error!("Fatal component error: {}", error);
            exit = Err(error.into());
        }
    }

    tracing::info!("Shutting down eventlog node {}", cluster.instance_id());
    ingress.stop().await;
    http_token.cancel();
    match http_task.await {
        Ok(Err(e)) => tracing::warn!("HTTP server stopped with error: {}", e),
        Err(e) => tracing::warn!("HTTP server task failed: {}", e),
        Ok(Ok(())) => {}
    }
    cluster.stop().await;
    root.cancel();
    tracing::info!("Eventlog node stopped");

    exit
}
