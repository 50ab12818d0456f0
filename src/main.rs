use std::time::Duration;

use meshgate_core::config;
use tokio::signal;
use tracing::info;

const SHUTDOWN_BUDGET: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    config::init();
    let cfg = config::get();

    let _guard = cfg.log.guard();
    tracing::info!("log level: {}", &cfg.log.filter_level);

    let gateway = meshgate_core::Gateway::new(cfg);
    gateway.start(cfg);
    info!(host = %cfg.server.host, port = cfg.server.port, "gateway started");

    shutdown_signal().await;

    info!("shutting down, budget {:?}", SHUTDOWN_BUDGET);
    if let Err(err) = gateway.stop(SHUTDOWN_BUDGET).await {
        eprintln!("error during shutdown: {err}");
        std::process::exit(1);
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("ctrl_c signal received"),
        _ = terminate => info!("terminate signal received"),
    }
}
