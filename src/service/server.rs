use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio::sync::broadcast;
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};

use crate::network::{ConnManager, ConnRegistry, Connection};
use crate::AppResult;

use super::{BaseService, ServerConfig, Shutdown};

/// Server only options.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub max_conn: usize,
    /// Defaults to a fresh [`ConnRegistry`].
    pub conn_manager: Option<Arc<dyn ConnManager>>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerConfig::default().into()
    }
}

impl From<ServerConfig> for ServerOptions {
    fn from(config: ServerConfig) -> Self {
        ServerOptions {
            max_conn: config.max_conn,
            conn_manager: None,
        }
    }
}

#[derive(Debug)]
pub struct Server {
    service: Arc<BaseService>,
    conn_mgr: Arc<dyn ConnManager>,
    max_conn: usize,
    next_conn_id: AtomicU32,
    notify_shutdown: broadcast::Sender<()>,
}

impl Server {
    pub fn new(service: BaseService, options: ServerOptions) -> Self {
        let (notify_shutdown, _) = broadcast::channel(1);
        Server {
            service: Arc::new(service),
            conn_mgr: options
                .conn_manager
                .unwrap_or_else(|| Arc::new(ConnRegistry::new())),
            max_conn: options.max_conn,
            next_conn_id: AtomicU32::new(0),
            notify_shutdown,
        }
    }

    pub fn service(&self) -> &Arc<BaseService> {
        &self.service
    }

    pub fn conn_mgr(&self) -> &Arc<dyn ConnManager> {
        &self.conn_mgr
    }

    /// Starts the worker pool, binds the listener and spawns the accept loop.
    ///
    /// Returns the bound address once the server is listening, so an address
    /// with port 0 can be used.
    pub async fn start(self: &Arc<Self>) -> AppResult<SocketAddr> {
        self.service.msg_handler().start_worker_pool();

        let addr = self.service.resolve_addr().await?;
        let listener = TcpListener::bind(addr).await.map_err(|err| {
            error!("Failed to bind server to address: {} - Error: {}", addr, err);
            err
        })?;
        let local_addr = listener.local_addr()?;
        info!("[START] tcp server listening at {}", local_addr);

        let server = self.clone();
        tokio::spawn(async move { server.run(listener).await });
        Ok(local_addr)
    }

    /// Stops accepting, stops the workers and stops every live connection.
    pub fn stop(&self) {
        info!("[STOP] tcp server");
        let _ = self.notify_shutdown.send(());
        self.service.msg_handler().stop_worker_pool();
        self.conn_mgr.clear_conn();
    }

    /// Runs until Ctrl-C, then stops.
    pub async fn serve(self: &Arc<Self>) -> AppResult<()> {
        self.start().await?;
        signal::ctrl_c().await?;
        info!("get shutdown signal");
        self.stop();
        Ok(())
    }

    /// Accept loop. Sockets beyond `max_conn` are closed right away, without a
    /// `Connection` ever being built for them.
    async fn run(&self, listener: TcpListener) {
        let mut shutdown = Shutdown::subscribe(&self.notify_shutdown);

        loop {
            let (socket, remote_addr) = tokio::select! {
                accepted = Self::accept(&listener) => accepted,
                _ = shutdown.recv() => {
                    debug!("accept loop exit after recv shutdown signal");
                    return;
                }
            };
            debug!("accept new connection from {}", remote_addr);

            if self.conn_mgr.len() >= self.max_conn {
                warn!(
                    "too many connections, max conn = {}, close {}",
                    self.max_conn, remote_addr
                );
                drop(socket);
                continue;
            }

            let conn_id = self.next_conn_id();
            let conn = match Connection::new(
                self.service.clone(),
                socket,
                conn_id,
                Some(Arc::downgrade(&self.conn_mgr)),
            ) {
                Ok(conn) => conn,
                Err(err) => {
                    warn!("drop connection from {}: {}", remote_addr, err);
                    continue;
                }
            };
            self.conn_mgr.add(conn.clone());

            let service = self.service.clone();
            tokio::spawn(async move {
                service.call_on_conn_start(&conn);
                conn.start().await;
            });
        }
    }

    /// Ids wrap around on overflow; one still held by a live connection is skipped.
    fn next_conn_id(&self) -> u32 {
        loop {
            let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
            if self.conn_mgr.get(conn_id).is_err() {
                return conn_id;
            }
            debug!("conn id {} is still in use, skip it", conn_id);
        }
    }

    /// Retries failed accepts until one succeeds, sleeping 1s, 2s, 4s and so
    /// on, capped at 64s.
    async fn accept(listener: &TcpListener) -> (TcpStream, SocketAddr) {
        let mut backoff = 1;

        loop {
            match listener.accept().await {
                Ok(accepted) => return accepted,
                Err(err) => error!("accept error: {}, retry in {}s", err, backoff),
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff = next_backoff(backoff);
        }
    }
}

const MAX_ACCEPT_BACKOFF_SECS: u64 = 64;

fn next_backoff(backoff: u64) -> u64 {
    (backoff * 2).min(MAX_ACCEPT_BACKOFF_SECS)
}

impl Drop for Server {
    fn drop(&mut self) {
        debug!("tcp server dropped");
    }
}
