use modserve::config::Config;
use modserve::logging::Logger;
use modserve::service::{build_runtime, TcpHost};
use modserve::wire::Encoding;

use tokio::sync::watch;

#[tokio::main]
async fn main() {
    // Read command-line arguments
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "modserve.yaml".to_string());

    // Load configuration
    let config = Config::load_from_yaml(&config_path).expect("Failed to load configuration");

    // Initialize logging
    let logger = Logger::new(config.log.clone());
    logger.init_env_logger();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let log_writer = tokio::spawn(logger.run(shutdown_rx.clone()));

    // Load modules and assemble the runtime
    log::info!("Loading modules...");
    let (registry, broker) = build_runtime(&config)
        .await
        .expect("Failed to build runtime");
    let stats = registry.stats();
    log::info!(
        "Runtime ready: {} module(s) in {} dispatch group(s)",
        stats.module_count,
        stats.group_count
    );

    let default_encoding =
        Encoding::from_name(&config.runtime.default_encoding).unwrap_or_default();
    let host = TcpHost::new(config.server.address, broker, default_encoding);

    log::info!("Starting host...");
    tokio::select! {
        result = host.run(shutdown_rx) => {
            result.expect("Host failed");
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("Interrupt received");
        }
    }

    // Graceful shutdown: tear down modules, then drain the log writer
    let _ = shutdown_tx.send(true);
    registry.destroy().await;
    let _ = log_writer.await;
}
