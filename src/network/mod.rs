//! Network Module Implementation
//!
//! Everything that touches the byte stream: framing, the per-connection
//! reader/writer tasks and the registry of live connections.
//!
//! # Components
//!
//! - `PacketCodec` / `DataPack`: length-delimited framing, `[data_len][msg_id][data]`
//! - `Connection`: one TCP stream, a reader task, a writer task fed by a
//!   bounded outbound queue, and a cancellation token tying both together
//! - `ConnManager` / `ConnRegistry`: concurrent set of live server connections

pub use codec::{DataPack, MsgHeader, PacketCodec};
pub use conn_manager::{ConnManager, ConnRegistry};
pub use connection::{Connection, Property};
pub use message::Message;
mod codec;
mod conn_manager;
mod connection;
mod message;

#[cfg(test)]
pub(crate) mod test_util {
    use std::sync::{Arc, Weak};

    use tokio::net::{TcpListener, TcpStream};

    use super::{ConnManager, Connection};
    use crate::service::{BaseService, ServiceBuilder, ServiceConfig};

    pub(crate) fn test_service(
        config: ServiceConfig,
        configure: impl FnOnce(ServiceBuilder) -> ServiceBuilder,
    ) -> Arc<BaseService> {
        Arc::new(configure(ServiceBuilder::new(config)).build())
    }

    /// Returns the framework side connection and the raw peer socket.
    pub(crate) async fn new_test_connection(
        service: Arc<BaseService>,
        conn_id: u32,
        conn_mgr: Option<Weak<dyn ConnManager>>,
    ) -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (peer, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (socket, _) = accepted.unwrap();
        let conn = Connection::new(service, socket, conn_id, conn_mgr).unwrap();
        (conn, peer.unwrap())
    }
}
