use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;

use shareit::config::ServerConfig;
use shareit::observability;
use shareit::server::Server;
use shareit::service::Service;
use shareit::wire::ShareitFactory;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    observability::init_tracing();

    let config = ServerConfig::from_env();
    observability::init_metrics(config.metrics_port)?;
    let tls = shareit::tls::load_tls_acceptor(config.tls_cert.as_deref(), config.tls_key.as_deref())?;

    let service = Service::open(&config.data_dir, config.compact_threshold)?;
    let factory = Arc::new(ShareitFactory::new(
        service,
        config.password.clone(),
        config.request_timeout,
    ));

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("shareit listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  max_connections: {}", config.max_connections);
    info!("  request_timeout: {:?}", config.request_timeout);
    info!("  tls: {}", if tls.is_some() { "enabled" } else { "disabled" });

    let server = Server::new(listener, factory, tls, config.max_connections);
    let remaining = server.run(shutdown_signal(), DRAIN_TIMEOUT).await;
    if remaining == 0 {
        info!("all connections drained");
    }
    info!("shareit stopped");
    Ok(())
}

/// Resolves on ctrl-c, or SIGTERM where available.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::error!("failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
