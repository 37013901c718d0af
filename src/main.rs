use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::info;

use slotgate::config::Config;
use slotgate::counter::InMemoryCounterStore;
use slotgate::service::ReservationService;
use slotgate::wire;

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    slotgate::observability::init(config.metrics_port);

    let service = Arc::new(
        ReservationService::open(
            &config.data_dir,
            Arc::new(InMemoryCounterStore::new()),
            config.pipeline.clone(),
        )
        .await?,
    );
    let shutdown = CancellationToken::new();
    let background = service.start(&shutdown);

    let max_connections = config.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("slotgate listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  max_connections: {max_connections}");
    info!("  workers: {}", config.pipeline.workers);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    let signal = shutdown_signal();
    tokio::pin!(signal);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(slotgate::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(slotgate::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(slotgate::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let service = service.clone();
                let shutdown = shutdown.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, service, shutdown).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(slotgate::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut signal => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Connections finish their current request; workers finish their current job.
    shutdown.cancel();

    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(std::time::Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
        }
    }

    for handle in background {
        if let Err(e) = handle.await {
            tracing::warn!("background task ended abnormally: {e}");
        }
    }

    info!("slotgate stopped");
    Ok(())
}
