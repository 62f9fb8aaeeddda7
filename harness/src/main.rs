use metrics_exporter_prometheus::PrometheusBuilder;
use sessionbench::config::Config;
use sessionbench::load::BenchmarkRunner;
use sessionbench::server::metrics_router;
use std::net::SocketAddr;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize Prometheus metrics recorder (must be done before any metrics are recorded)
    let prometheus_handle = PrometheusBuilder::new().install_recorder()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sessionbench=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(
        "Loaded configuration: peers={}, duration={:?}, concurrency={}, suites={}",
        config.load.peers_per_room,
        config.load.duration,
        config.load.concurrency,
        config.suites.len()
    );

    if config.metrics.enabled {
        let addr: SocketAddr =
            format!("{}:{}", config.metrics.host, config.metrics.port).parse()?;
        let app = metrics_router(prometheus_handle).layer(TraceLayer::new_for_http());
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("Metrics listening on {}", addr);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("Metrics server stopped: {}", e);
            }
        });
    }

    let runner = BenchmarkRunner::new(config.load, config.suites, config.pause_between_samples);
    for report in runner.run_all().await {
        println!("{}", serde_json::to_string(&report)?);
    }

    Ok(())
}
