use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::lookup_host;

use crate::network::{Connection, DataPack, PacketCodec};
use crate::request::{MsgHandler, Route};
use crate::utils::WorkerPoolConfig;
use crate::AppError::InvalidValue;
use crate::AppResult;

use super::{IpVersion, ServiceConfig};

/// Connection lifecycle hook.
pub type ConnHook = Arc<dyn Fn(&Connection) + Send + Sync>;

/// State shared by a server or client and all of its connections: settings,
/// codec, router table with its worker pool, and the lifecycle hooks.
///
/// Read-only once the service has started, except for routes which may still
/// be added through [`BaseService::add_router`].
pub struct BaseService {
    config: ServiceConfig,
    packet: Arc<dyn PacketCodec>,
    msg_handler: MsgHandler,
    on_conn_start: Option<ConnHook>,
    on_conn_stop: Option<ConnHook>,
}

impl BaseService {
    pub fn builder() -> ServiceBuilder {
        ServiceBuilder::new(ServiceConfig::default())
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn ip_version(&self) -> IpVersion {
        self.config.ip_version
    }

    pub fn addr(&self) -> &str {
        &self.config.addr
    }

    pub fn packet(&self) -> &Arc<dyn PacketCodec> {
        &self.packet
    }

    pub fn msg_handler(&self) -> &MsgHandler {
        &self.msg_handler
    }

    pub fn add_router(&self, msg_id: u32, route: Route) {
        self.msg_handler.add_router(msg_id, route);
    }

    pub fn call_on_conn_start(&self, conn: &Connection) {
        if let Some(hook) = &self.on_conn_start {
            hook(conn);
        }
    }

    pub fn call_on_conn_stop(&self, conn: &Connection) {
        if let Some(hook) = &self.on_conn_stop {
            hook(conn);
        }
    }

    /// Resolves the configured address, keeping only the configured family.
    pub async fn resolve_addr(&self) -> AppResult<SocketAddr> {
        let ip_version = self.ip_version();
        let mut addrs = lookup_host(self.addr()).await?;
        addrs
            .find(|addr| match ip_version {
                IpVersion::Tcp4 => addr.is_ipv4(),
                IpVersion::Tcp6 => addr.is_ipv6(),
            })
            .ok_or_else(|| {
                InvalidValue(format!(
                    "no {:?} address found for {}",
                    ip_version,
                    self.addr()
                ))
            })
    }
}

impl fmt::Debug for BaseService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaseService")
            .field("config", &self.config)
            .field("packet", &self.packet)
            .field("msg_handler", &self.msg_handler)
            .finish_non_exhaustive()
    }
}

/// Options style construction of a [`BaseService`].
pub struct ServiceBuilder {
    config: ServiceConfig,
    packet: Option<Arc<dyn PacketCodec>>,
    routes: Vec<(u32, Route)>,
    on_conn_start: Option<ConnHook>,
    on_conn_stop: Option<ConnHook>,
}

impl ServiceBuilder {
    pub fn new(config: ServiceConfig) -> Self {
        ServiceBuilder {
            config,
            packet: None,
            routes: Vec::new(),
            on_conn_start: None,
            on_conn_stop: None,
        }
    }

    pub fn addr(mut self, addr: impl Into<String>) -> Self {
        self.config.addr = addr.into();
        self
    }

    pub fn ip_version(mut self, ip_version: IpVersion) -> Self {
        self.config.ip_version = ip_version;
        self
    }

    /// `Duration::ZERO` removes the deadline.
    pub fn read_deadline(mut self, deadline: Duration) -> Self {
        self.config.read_deadline_ms = ceil_millis(deadline);
        self
    }

    /// `Duration::ZERO` removes the deadline.
    pub fn write_deadline(mut self, deadline: Duration) -> Self {
        self.config.write_deadline_ms = ceil_millis(deadline);
        self
    }

    /// 0 handles every request on its own task.
    pub fn worker_pool_size(mut self, size: usize) -> Self {
        self.config.worker_pool_size = size;
        self
    }

    pub fn max_worker_task_len(mut self, len: usize) -> Self {
        self.config.max_worker_task_len = len;
        self
    }

    pub fn max_msg_chan_len(mut self, len: usize) -> Self {
        self.config.max_msg_chan_len = len;
        self
    }

    /// Only used by the default codec.
    pub fn max_packet_size(mut self, size: u32) -> Self {
        self.config.max_packet_size = size;
        self
    }

    pub fn send_buff_timeout(mut self, timeout: Duration) -> Self {
        self.config.send_buff_timeout_ms = ceil_millis(timeout);
        self
    }

    /// Replaces the default [`DataPack`] codec.
    pub fn packet(mut self, packet: Arc<dyn PacketCodec>) -> Self {
        self.packet = Some(packet);
        self
    }

    pub fn add_router(mut self, msg_id: u32, route: Route) -> Self {
        self.routes.push((msg_id, route));
        self
    }

    pub fn on_conn_start(mut self, hook: impl Fn(&Connection) + Send + Sync + 'static) -> Self {
        self.on_conn_start = Some(Arc::new(hook));
        self
    }

    pub fn on_conn_stop(mut self, hook: impl Fn(&Connection) + Send + Sync + 'static) -> Self {
        self.on_conn_stop = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> BaseService {
        let config = self.config;
        let packet = self.packet.unwrap_or_else(|| {
            Arc::new(DataPack::new(config.byte_order, config.max_packet_size))
        });
        let msg_handler = MsgHandler::new(WorkerPoolConfig {
            channel_capacity: config.max_worker_task_len,
            num_channels: config.worker_pool_size,
            monitor_interval: config.worker_monitor_interval(),
        });
        for (msg_id, route) in self.routes {
            msg_handler.add_router(msg_id, route);
        }

        BaseService {
            config,
            packet,
            msg_handler,
            on_conn_start: self.on_conn_start,
            on_conn_stop: self.on_conn_stop,
        }
    }
}

/// Rounds up, so a sub-millisecond duration never collapses to 0.
fn ceil_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos().div_ceil(1_000_000)).unwrap_or(u64::MAX)
}
