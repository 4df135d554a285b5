use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::network::Connection;
use crate::AppError::{IllegalStateError, ReconnectLimitExceeded};
use crate::AppResult;

use super::{BaseService, ClientConfig};

/// Id of the single connection a client owns.
const CLIENT_CONN_ID: u32 = 0;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Fixed wait between two dial attempts.
    pub reconnect_wait_time: Duration,
    /// 0 retries forever
    pub max_reconnect_count: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientConfig::default().into()
    }
}

impl From<ClientConfig> for ClientOptions {
    fn from(config: ClientConfig) -> Self {
        ClientOptions {
            reconnect_wait_time: config.reconnect_wait_time(),
            max_reconnect_count: config.max_reconnect_count,
        }
    }
}

/// Dials the configured address and runs one connection at a time.
#[derive(Debug)]
pub struct Client {
    service: Arc<BaseService>,
    options: ClientOptions,
    reconnect_count: AtomicU32,
    current: Mutex<Option<Connection>>,
    stopped: CancellationToken,
}

impl Client {
    pub fn new(service: BaseService, options: ClientOptions) -> Self {
        Client {
            service: Arc::new(service),
            options,
            reconnect_count: AtomicU32::new(0),
            current: Mutex::new(None),
            stopped: CancellationToken::new(),
        }
    }

    pub fn service(&self) -> &Arc<BaseService> {
        &self.service
    }

    /// Consecutive failed dials since the last successful one.
    pub fn reconnect_count(&self) -> u32 {
        self.reconnect_count.load(Ordering::Acquire)
    }

    /// The live connection, if any.
    pub fn connection(&self) -> Option<Connection> {
        self.current.lock().clone()
    }

    /// Dials once and runs the connection until it ends.
    pub async fn start(&self) -> AppResult<()> {
        self.service.msg_handler().start_worker_pool();
        let conn = self.dial().await?;
        self.run_connection(conn).await;
        Ok(())
    }

    /// Dials, runs the connection to its end, and dials again until stopped.
    ///
    /// A failed dial is retried after `reconnect_wait_time`. Once
    /// `max_reconnect_count` consecutive dials failed, gives up with
    /// `ReconnectLimitExceeded`.
    pub async fn serve(&self) -> AppResult<()> {
        self.service.msg_handler().start_worker_pool();

        while !self.stopped.is_cancelled() {
            match self.dial().await {
                Ok(conn) => {
                    self.reconnect_count.store(0, Ordering::Release);
                    self.run_connection(conn).await;
                    continue;
                }
                Err(err) => {
                    let count = self.reconnect_count.fetch_add(1, Ordering::AcqRel) + 1;
                    warn!(
                        "dial {} failed: {}, reconnect count = {}",
                        self.service.addr(),
                        err,
                        count
                    );
                    let max = self.options.max_reconnect_count;
                    if max > 0 && count >= max {
                        return Err(ReconnectLimitExceeded(count));
                    }
                }
            }

            tokio::select! {
                _ = self.stopped.cancelled() => break,
                _ = time::sleep(self.options.reconnect_wait_time) => {}
            }
        }

        debug!("client dial loop exit");
        Ok(())
    }

    /// Stops the dial loop and the live connection, if any.
    pub fn stop(&self) {
        info!("[STOP] tcp client");
        self.stopped.cancel();
        if let Some(conn) = self.current.lock().take() {
            conn.stop();
        }
        self.service.msg_handler().stop_worker_pool();
    }

    async fn dial(&self) -> AppResult<Connection> {
        let addr = self.service.resolve_addr().await?;
        let socket = TcpStream::connect(addr).await?;
        debug!("dial {} succeeded", addr);
        Connection::new(self.service.clone(), socket, CLIENT_CONN_ID, None)
    }

    async fn run_connection(&self, conn: Connection) {
        {
            let mut current = self.current.lock();
            // checked under the lock, so `stop` either sees this connection or
            // this check sees the cancellation
            if self.stopped.is_cancelled() {
                conn.stop();
            }
            *current = Some(conn.clone());
        }
        self.service.call_on_conn_start(&conn);
        conn.start().await;

        let mut current = self.current.lock();
        if current.as_ref() == Some(&conn) {
            current.take();
        }
    }

    /// Sends on the live connection, straight to the socket.
    pub async fn send_msg(&self, msg_id: u32, data: &[u8]) -> AppResult<()> {
        let conn = self
            .connection()
            .ok_or_else(|| IllegalStateError("client is not connected".to_string()))?;
        conn.send_msg(msg_id, data).await
    }
}
