use std::fmt::Debug;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::network::Connection;
use crate::AppError::NotFound;
use crate::AppResult;

/// Registry of the live connections of one server.
///
/// Implementations must be safe to call from any task; the accept loop adds,
/// finalizing connections remove, and handlers look connections up.
pub trait ConnManager: Send + Sync + Debug {
    /// Inserts under the connection's id, replacing any previous entry.
    fn add(&self, conn: Connection);

    /// No-op if the connection is not registered.
    fn remove(&self, conn: &Connection);

    fn get(&self, conn_id: u32) -> AppResult<Connection>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops every registered connection and empties the registry.
    fn clear_conn(&self);
}

/// Default [`ConnManager`] backed by a sharded concurrent map.
#[derive(Debug, Default)]
pub struct ConnRegistry {
    connections: DashMap<u32, Connection>,
}

impl ConnRegistry {
    pub fn new() -> Self {
        ConnRegistry {
            connections: DashMap::new(),
        }
    }
}

impl ConnManager for ConnRegistry {
    fn add(&self, conn: Connection) {
        let conn_id = conn.conn_id();
        self.connections.insert(conn_id, conn);
        debug!(
            "connection {} added to registry, conn num = {}",
            conn_id,
            self.connections.len()
        );
    }

    fn remove(&self, conn: &Connection) {
        // an id can be reused after wraparound, only drop the very same connection
        if self
            .connections
            .remove_if(&conn.conn_id(), |_, registered| registered == conn)
            .is_some()
        {
            debug!(
                "connection {} removed from registry, conn num = {}",
                conn.conn_id(),
                self.connections.len()
            );
        }
    }

    fn get(&self, conn_id: u32) -> AppResult<Connection> {
        self.connections
            .get(&conn_id)
            .map(|entry| entry.value().clone())
            .ok_or(NotFound(conn_id))
    }

    fn len(&self) -> usize {
        self.connections.len()
    }

    fn clear_conn(&self) {
        // collect first, a stopping connection removes itself from the map
        let connections: Vec<Connection> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for conn in &connections {
            conn.stop();
        }
        self.connections.clear();
        info!("clear all connections, {} stopped", connections.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::test_util::{new_test_connection, test_service};
    use crate::service::ServiceConfig;
    use crate::AppError;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_add_get_remove() {
        let service = test_service(ServiceConfig::default(), |builder| builder);
        let registry = ConnRegistry::new();
        let (conn, _peer) = new_test_connection(service, 11, None).await;

        assert!(registry.is_empty());
        registry.add(conn.clone());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(11).unwrap(), conn);
        assert!(matches!(registry.get(12), Err(AppError::NotFound(12))));

        registry.remove(&conn);
        assert!(registry.is_empty());
        // removing twice is harmless
        registry.remove(&conn);
    }

    #[tokio::test]
    async fn test_remove_keeps_newer_connection_with_same_id() {
        let service = test_service(ServiceConfig::default(), |builder| builder);
        let registry = ConnRegistry::new();
        let (old, _old_peer) = new_test_connection(service.clone(), 1, None).await;
        let (new, _new_peer) = new_test_connection(service, 1, None).await;

        registry.add(old.clone());
        registry.add(new.clone());
        assert_eq!(registry.len(), 1);

        registry.remove(&old);
        assert_eq!(registry.get(1).unwrap(), new);
    }

    #[tokio::test]
    async fn test_clear_conn_stops_everything() {
        let service = test_service(ServiceConfig::default(), |builder| builder);
        let registry: Arc<dyn ConnManager> = Arc::new(ConnRegistry::new());
        let mut peers = Vec::new();
        let mut handles = Vec::new();
        for conn_id in 0..3 {
            let (conn, peer) =
                new_test_connection(service.clone(), conn_id, Some(Arc::downgrade(&registry)))
                    .await;
            registry.add(conn.clone());
            handles.push(tokio::spawn(async move { conn.start().await }));
            peers.push(peer);
        }
        assert_eq!(registry.len(), 3);

        registry.clear_conn();
        assert!(registry.is_empty());
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
