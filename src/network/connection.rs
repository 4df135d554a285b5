use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, RwLock};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::network::{ConnManager, Message};
use crate::request::Request;
use crate::service::BaseService;
use crate::AppError::{ConnectionClosed, InvalidValue, PropertyNotFound, SendTimeout};
use crate::{AppError, AppResult};

/// Value stored in the per-connection property map.
pub type Property = Arc<dyn Any + Send + Sync>;

/// One live TCP stream with its reader and writer tasks.
///
/// `Connection` is a cheap handle; clones share the same socket, outbound
/// queue and cancellation token. Business handlers receive a clone inside
/// every [`Request`] and use it to send replies.
///
/// Lifecycle: created -> started (reader and writer running) -> cancelled
/// (either task failed or someone called [`Connection::stop`]) -> finalized.
/// Finalization runs once: the stop hook fires, the outbound queue and the
/// socket are closed, and a server side connection leaves its registry.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    conn_id: u32,
    remote_addr: SocketAddr,
    service: Arc<BaseService>,
    conn_mgr: Option<Weak<dyn ConnManager>>,
    cancel: CancellationToken,

    // taken by `start`
    reader: Mutex<Option<OwnedReadHalf>>,
    msg_buff_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,

    // Send paths hold the read side; only finalization takes the write side,
    // so a closed connection never sees another write. `None` means closed.
    msg_buff_tx: RwLock<Option<mpsc::Sender<Bytes>>>,
    writer: tokio::sync::Mutex<Option<BufWriter<OwnedWriteHalf>>>,
    is_closed: AtomicBool,
    finalized: AtomicBool,

    // kept apart from the send path lock
    property: Mutex<HashMap<String, Property>>,
}

impl Connection {
    pub(crate) fn new(
        service: Arc<BaseService>,
        socket: TcpStream,
        conn_id: u32,
        conn_mgr: Option<Weak<dyn ConnManager>>,
    ) -> AppResult<Connection> {
        let remote_addr = socket.peer_addr()?;
        let (reader, writer) = socket.into_split();
        let (msg_buff_tx, msg_buff_rx) = mpsc::channel(service.config().max_msg_chan_len.max(1));

        Ok(Connection {
            inner: Arc::new(ConnectionInner {
                conn_id,
                remote_addr,
                service,
                conn_mgr,
                cancel: CancellationToken::new(),
                reader: Mutex::new(Some(reader)),
                msg_buff_rx: Mutex::new(Some(msg_buff_rx)),
                msg_buff_tx: RwLock::new(Some(msg_buff_tx)),
                writer: tokio::sync::Mutex::new(Some(BufWriter::new(writer))),
                is_closed: AtomicBool::new(false),
                finalized: AtomicBool::new(false),
                property: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Spawns the reader and writer tasks, then waits until the connection is
    /// cancelled and finalizes it.
    ///
    /// Calling `start` on a connection that was already started only logs a warning.
    pub async fn start(&self) {
        let reader = self.inner.reader.lock().take();
        let msg_buff_rx = self.inner.msg_buff_rx.lock().take();
        let (reader, msg_buff_rx) = match (reader, msg_buff_rx) {
            (Some(reader), Some(rx)) => (reader, rx),
            _ => {
                warn!("connection {} has already been started", self.conn_id());
                return;
            }
        };
        info!(
            "connection {} started, remote addr: {}",
            self.conn_id(),
            self.remote_addr()
        );

        tokio::spawn(self.clone().start_reader(reader));
        tokio::spawn(self.clone().start_writer(msg_buff_rx));

        self.inner.cancel.cancelled().await;
        self.finalize().await;
    }

    /// Requests teardown without waiting for it. Safe to call any number of times.
    pub fn stop(&self) {
        self.inner.cancel.cancel();
    }

    pub fn conn_id(&self) -> u32 {
        self.inner.conn_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed.load(Ordering::Acquire)
    }

    /// A token cancelled together with this connection, for user spawned tasks.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.child_token()
    }

    /// Gives access to the underlying socket while the connection is open,
    /// e.g. to tune `nodelay` or `ttl`.
    pub async fn with_tcp_stream<R>(&self, f: impl FnOnce(&TcpStream) -> R) -> AppResult<R> {
        let guard = self.inner.writer.lock().await;
        let writer = guard.as_ref().ok_or(ConnectionClosed(self.conn_id()))?;
        Ok(f(writer.get_ref().as_ref()))
    }

    /// Encodes the message and writes it straight to the socket.
    ///
    /// Fails with `ConnectionClosed` as soon as `stop` was called.
    pub async fn send_msg(&self, msg_id: u32, data: &[u8]) -> AppResult<()> {
        let msg_buff_tx = self.inner.msg_buff_tx.read().await;
        if msg_buff_tx.is_none() || self.inner.cancel.is_cancelled() {
            return Err(ConnectionClosed(self.conn_id()));
        }

        let packet = self.inner.service.packet().encode(msg_id, data)?;
        let result = self.write_to_socket(&packet).await;
        if let Err(AppError::IoError(err)) = &result {
            warn!(
                "connection {} send msg {} failed: {}",
                self.conn_id(),
                msg_id,
                err
            );
            self.stop();
        }
        result
    }

    /// Encodes the message and queues it for the writer task, waiting at most
    /// the configured send timeout for room in the queue.
    pub async fn send_buff_msg(&self, msg_id: u32, data: &[u8]) -> AppResult<()> {
        let timeout = self.inner.service.config().send_buff_timeout();
        self.send_buff_msg_timeout(msg_id, data, timeout).await
    }

    /// Same as [`Connection::send_buff_msg`] with an explicit timeout.
    ///
    /// Fails with `SendTimeout` when the queue stays full for the whole
    /// timeout; the connection remains open in that case. Fails with
    /// `ConnectionClosed` as soon as `stop` was called.
    pub async fn send_buff_msg_timeout(
        &self,
        msg_id: u32,
        data: &[u8],
        timeout: Duration,
    ) -> AppResult<()> {
        let msg_buff_tx = self.inner.msg_buff_tx.read().await;
        // a stopped connection is closed for senders even before finalize
        let sender = msg_buff_tx
            .as_ref()
            .filter(|_| !self.inner.cancel.is_cancelled())
            .ok_or(ConnectionClosed(self.conn_id()))?;

        let packet = self.inner.service.packet().encode(msg_id, data)?;
        tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => Err(ConnectionClosed(self.conn_id())),
            res = sender.send_timeout(packet, timeout) => res.map_err(|err| match err {
                SendTimeoutError::Timeout(_) => SendTimeout(self.conn_id()),
                SendTimeoutError::Closed(_) => ConnectionClosed(self.conn_id()),
            }),
        }
    }

    pub fn set_property<V: Any + Send + Sync>(&self, key: impl Into<String>, value: V) {
        self.inner.property.lock().insert(key.into(), Arc::new(value));
    }

    pub fn get_property(&self, key: &str) -> AppResult<Property> {
        self.inner
            .property
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| PropertyNotFound(key.to_string()))
    }

    /// Typed variant of [`Connection::get_property`].
    pub fn get_property_as<V: Any + Send + Sync>(&self, key: &str) -> AppResult<Arc<V>> {
        self.get_property(key)?.downcast::<V>().map_err(|_| {
            InvalidValue(format!(
                "property {} is not a {}",
                key,
                std::any::type_name::<V>()
            ))
        })
    }

    pub fn remove_property(&self, key: &str) {
        self.inner.property.lock().remove(key);
    }

    async fn start_reader(self, mut reader: OwnedReadHalf) {
        let cancel = self.inner.cancel.clone();
        let msg_handler = self.inner.service.msg_handler();

        loop {
            let msg = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                res = self.read_msg(&mut reader) => match res {
                    Ok(msg) => msg,
                    Err(AppError::IoError(err)) if err.kind() == ErrorKind::UnexpectedEof => {
                        debug!("connection {} closed by peer", self.conn_id());
                        break;
                    }
                    Err(err) => {
                        warn!("connection {} read msg error: {}", self.conn_id(), err);
                        break;
                    }
                }
            };
            trace!(
                "connection {} read msg {} with {} bytes",
                self.conn_id(),
                msg.msg_id(),
                msg.data_len()
            );

            let request = Request::new(self.clone(), msg);
            if msg_handler.is_pool_enabled() {
                // blocks while the worker queue is full, throttling this reader
                let res = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    res = msg_handler.send_msg_to_task_queue(request) => res,
                };
                if let Err(err) = res {
                    error!(
                        "connection {} failed to submit request: {}",
                        self.conn_id(),
                        err
                    );
                    break;
                }
            } else {
                msg_handler.dispatch_inline(request);
            }
        }

        debug!("connection {} reader exit", self.conn_id());
        self.stop();
    }

    async fn start_writer(self, mut msg_buff_rx: mpsc::Receiver<Bytes>) {
        let cancel = self.inner.cancel.clone();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                maybe_packet = msg_buff_rx.recv() => match maybe_packet {
                    Some(packet) => {
                        if let Err(err) = self.write_to_socket(&packet).await {
                            warn!("connection {} send buff data error: {}", self.conn_id(), err);
                            self.stop();
                            break;
                        }
                    }
                    None => {
                        debug!("connection {} msg buff chan is closed", self.conn_id());
                        break;
                    }
                }
            }
        }

        debug!("connection {} writer exit", self.conn_id());
    }

    async fn read_msg(&self, reader: &mut OwnedReadHalf) -> AppResult<Message> {
        let packet = self.inner.service.packet();

        let mut head = BytesMut::zeroed(packet.head_len());
        self.read_exact(reader, &mut head).await?;
        let header = packet.decode_header(&head)?;

        let mut data = BytesMut::zeroed(header.data_len as usize);
        if header.data_len > 0 {
            self.read_exact(reader, &mut data).await?;
        }
        Ok(Message::new(header.msg_id, data.freeze()))
    }

    async fn read_exact(&self, reader: &mut OwnedReadHalf, buf: &mut [u8]) -> AppResult<()> {
        match self.inner.service.config().read_deadline() {
            Some(deadline) => {
                time::timeout(deadline, reader.read_exact(buf))
                    .await
                    .map_err(|_| deadline_exceeded("read"))??;
            }
            None => {
                reader.read_exact(buf).await?;
            }
        }
        Ok(())
    }

    /// Shared by the direct send path and the writer task.
    async fn write_to_socket(&self, packet: &[u8]) -> AppResult<()> {
        let mut guard = self.inner.writer.lock().await;
        let writer = guard.as_mut().ok_or(ConnectionClosed(self.conn_id()))?;

        let write = async {
            writer.write_all(packet).await?;
            writer.flush().await?;
            Ok::<_, io::Error>(())
        };
        let write = async {
            match self.inner.service.config().write_deadline() {
                Some(deadline) => time::timeout(deadline, write)
                    .await
                    .unwrap_or_else(|_| Err(deadline_exceeded("write"))),
                None => write.await,
            }
        };

        tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => Err(ConnectionClosed(self.conn_id())),
            res = write => Ok(res?),
        }
    }

    pub(crate) async fn finalize(&self) {
        if self.inner.finalized.swap(true, Ordering::AcqRel) {
            return;
        }

        self.inner.service.call_on_conn_stop(self);

        {
            let mut msg_buff_tx = self.inner.msg_buff_tx.write().await;
            self.inner.is_closed.store(true, Ordering::Release);
            // dropping the only sender closes the outbound queue
            msg_buff_tx.take();
        }
        // dropping the write half shuts the socket down, the reader task owns
        // the read half and drops it on exit
        self.inner.writer.lock().await.take();
        self.inner.cancel.cancel();

        if let Some(conn_mgr) = self.inner.conn_mgr.as_ref().and_then(Weak::upgrade) {
            conn_mgr.remove(self);
        }
        info!(
            "connection {} stopped, remote addr: {}",
            self.conn_id(),
            self.remote_addr()
        );
    }
}

fn deadline_exceeded(op: &str) -> io::Error {
    io::Error::new(ErrorKind::TimedOut, format!("{} deadline exceeded", op))
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("conn_id", &self.inner.conn_id)
            .field("remote_addr", &self.inner.remote_addr)
            .field("is_closed", &self.is_closed())
            .finish()
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Connection {}
