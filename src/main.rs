use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use quorum::engine::Engine;
use quorum::{compactor, wire};

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = std::env::var("QUORUM_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    quorum::observability::init(metrics_port)?;

    let port: u16 = env_or("QUORUM_PORT", 5433);
    let bind = std::env::var("QUORUM_BIND").unwrap_or_else(|_| "0.0.0.0".into());
    let data_dir = std::env::var("QUORUM_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let max_connections: usize = env_or("QUORUM_MAX_CONNECTIONS", 256);
    let compact_threshold: u64 = env_or("QUORUM_COMPACT_THRESHOLD", 1000);

    let tls_cert = std::env::var("QUORUM_TLS_CERT").ok();
    let tls_key = std::env::var("QUORUM_TLS_KEY").ok();
    let tls_acceptor = quorum::tls::load_tls_acceptor(tls_cert.as_deref(), tls_key.as_deref())?;

    std::fs::create_dir_all(&data_dir)?;
    let wal_path = PathBuf::from(&data_dir).join("quorum.wal");
    let engine = Arc::new(Engine::new(wal_path)?);

    let compactor_engine = engine.clone();
    tokio::spawn(async move {
        compactor::run_compactor(compactor_engine, compact_threshold).await;
    });

    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("quorum listening on {addr}");
    info!("  data_dir: {data_dir}");
    info!("  max_connections: {max_connections}");
    info!("  compact_threshold: {compact_threshold}");
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });
    info!("  metrics: {}", metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    let shutdown = async {
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
                    tracing::warn!("cannot install SIGTERM handler: {e}");
                    ctrl_c.await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

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
                        metrics::counter!(quorum::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(quorum::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(quorum::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let engine = engine.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, engine, tls).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(quorum::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Wait for in-flight connections to finish (up to 10s)
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

    info!("quorum stopped");
    Ok(())
}
