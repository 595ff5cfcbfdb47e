use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use crate::observability::{CONNECTIONS_ACTIVE, CONNECTIONS_REJECTED_TOTAL, CONNECTIONS_TOTAL};
use crate::wire::{self, ShareitFactory};

const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Accepts pgwire connections, bounded by a connection limit.
pub struct Server {
    listener: TcpListener,
    factory: Arc<ShareitFactory>,
    tls: Option<TlsAcceptor>,
    max_connections: usize,
    slots: Arc<Semaphore>,
}

impl Server {
    pub fn new(
        listener: TcpListener,
        factory: Arc<ShareitFactory>,
        tls: Option<TlsAcceptor>,
        max_connections: usize,
    ) -> Self {
        Self {
            listener,
            factory,
            tls,
            max_connections,
            slots: Arc::new(Semaphore::new(max_connections)),
        }
    }

    /// Serve until `shutdown` resolves, then wait up to `drain` for open
    /// connections to finish. Returns how many were still open.
    pub async fn run(self, shutdown: impl Future<Output = ()>, drain: Duration) -> usize {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, peer)) => self.dispatch(socket, peer),
                    Err(e) => tracing::error!("accept error: {e}"),
                },
                _ = &mut shutdown => {
                    info!("shutdown signal received, stopping accept loop");
                    break;
                }
            }
        }
        self.drain(drain).await
    }

    fn dispatch(&self, socket: tokio::net::TcpStream, peer: std::net::SocketAddr) {
        let Ok(slot) = self.slots.clone().try_acquire_owned() else {
            tracing::warn!("connection limit reached, rejecting {peer}");
            metrics::counter!(CONNECTIONS_REJECTED_TOTAL).increment(1);
            return;
        };

        tracing::debug!("connection from {peer}");
        metrics::counter!(CONNECTIONS_TOTAL).increment(1);
        metrics::gauge!(CONNECTIONS_ACTIVE).increment(1.0);
        let factory = self.factory.clone();
        let tls = self.tls.clone();
        tokio::spawn(async move {
            let _slot = slot;
            if let Err(e) = wire::process_connection(socket, factory, tls).await {
                tracing::error!("connection error from {peer}: {e}");
            }
            metrics::gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
        });
    }

    fn open_connections(&self) -> usize {
        self.max_connections - self.slots.available_permits()
    }

    async fn drain(&self, timeout: Duration) -> usize {
        info!("draining {} connections", self.open_connections());
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        while self.open_connections() > 0 {
            tokio::select! {
                _ = &mut deadline => {
                    tracing::warn!("drain timeout, {} connections still open", self.open_connections());
                    break;
                }
                _ = tokio::time::sleep(DRAIN_POLL) => {}
            }
        }
        self.open_connections()
    }
}
