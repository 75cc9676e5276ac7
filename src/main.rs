use std::sync::Arc;

use scene_stream_server::config::ServerConfig;
use scene_stream_server::metrics::{self, Metrics};
use scene_stream_server::scheduler::StreamServer;
use scene_stream_server::simulation::Simulation;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Scene Stream Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = ServerConfig::load_or_default();
    config.validate().map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
    info!(
        "Configuration loaded: tick_rate={}Hz, max_packets_per_tick={}, max_observers={}",
        config.tick_rate_hz, config.max_packets_per_tick, config.max_observers
    );

    // Initialize metrics
    let metrics = Arc::new(Metrics::new());

    let metrics_clone = metrics.clone();
    let (bind_address, metrics_port) = (config.bind_address, config.metrics_port);
    tokio::spawn(async move {
        if let Err(e) = metrics::start_metrics_server(metrics_clone, bind_address, metrics_port).await {
            error!("Metrics server error: {}", e);
        }
    });

    let mut server = StreamServer::new(config.clone(), metrics.clone());
    let mut simulation = Simulation::new(&config, rand::random());
    let admitted = simulation.connect_all(&mut server);
    info!(
        "Simulating {} observers over {} scene elements",
        admitted,
        simulation.live_cells()
    );

    let sender = server.arrival_sender();
    let tick_interval = config.tick_interval();
    let tick_loop = async {
        let mut interval = tokio::time::interval(tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            simulation.advance(tick_interval, &sender);
            let report = server.tick(|observer| simulation.candidates_for(observer.id()));
            debug!(
                "Tick {}: sent={} removed={} deferred={}",
                report.tick, report.stats.elements_sent, report.stats.removals_sent, report.stats.elements_deferred
            );
            simulation.finish_tick(&report);
        }
    };

    // Shutdown signal handler
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Shutdown signal received");
    };

    tokio::select! {
        _ = tick_loop => {}
        _ = shutdown => {
            info!("Shutting down...");
        }
    }

    info!(
        "Server stopped after {} ticks, {} elements sent",
        metrics.tick_count.load(std::sync::atomic::Ordering::Relaxed),
        metrics.elements_sent.load(std::sync::atomic::Ordering::Relaxed)
    );

    Ok(())
}
