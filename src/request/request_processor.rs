// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::utils::{MultipleChannelWorkerPool, PoolHandler, WorkerPoolConfig};
use crate::AppError::IllegalStateError;
use crate::AppResult;

use super::{Request, Route};

/// Looks up the route of a request and runs it.
#[derive(Debug, Clone, Default)]
pub struct RequestProcessor {
    apis: Arc<DashMap<u32, Route>>,
}

impl RequestProcessor {
    pub async fn process_request(&self, request: Request) {
        let msg_id = request.msg_id();
        // clone out of the map, the shard lock must not be held across the handlers
        let route = match self.apis.get(&msg_id) {
            Some(route) => route.value().clone(),
            None => {
                warn!(
                    "api msg id = {} is not found, drop request from connection {}",
                    msg_id,
                    request.connection().conn_id()
                );
                return;
            }
        };
        trace!(
            "processing msg {} from connection {}",
            msg_id,
            request.connection().conn_id()
        );
        route.run(request).await;
    }
}

impl PoolHandler<Request> for RequestProcessor {
    fn handle(&self, task: Request) -> impl Future<Output = ()> + Send {
        let processor = self.clone();
        async move { processor.process_request(task).await }
    }
}

/// Router table plus the worker pool requests are dispatched to.
///
/// With a pool of `W` workers every request of connection `id` goes to worker
/// `id % W`, so one connection's messages are handled in arrival order while
/// at most `W` handlers run at the same time. With `W == 0` each request runs
/// on its own task and no ordering is kept.
#[derive(Debug)]
pub struct MsgHandler {
    processor: RequestProcessor,
    pool_config: WorkerPoolConfig,
    worker_pool: OnceCell<MultipleChannelWorkerPool<Request>>,
    notify_shutdown: broadcast::Sender<()>,
}

impl MsgHandler {
    pub fn new(pool_config: WorkerPoolConfig) -> Self {
        let (notify_shutdown, _) = broadcast::channel(1);
        MsgHandler {
            processor: RequestProcessor::default(),
            pool_config,
            worker_pool: OnceCell::new(),
            notify_shutdown,
        }
    }

    /// Registers `route` for `msg_id`. A second registration replaces the first.
    pub fn add_router(&self, msg_id: u32, route: Route) {
        if self.processor.apis.insert(msg_id, route).is_some() {
            warn!("api msg id = {} is already registered, replaced", msg_id);
        } else {
            debug!("add api msg id = {}", msg_id);
        }
    }

    pub fn route_count(&self) -> usize {
        self.processor.apis.len()
    }

    pub fn worker_pool_size(&self) -> usize {
        self.pool_config.num_channels
    }

    pub fn is_pool_enabled(&self) -> bool {
        self.pool_config.num_channels > 0
    }

    /// Worker that serves every request of `conn_id`, `None` without a pool.
    pub fn worker_index(&self, conn_id: u32) -> Option<usize> {
        self.is_pool_enabled()
            .then(|| conn_id as usize % self.pool_config.num_channels)
    }

    /// Spawns the workers. Later calls are no-ops, as is a pool size of 0.
    pub fn start_worker_pool(&self) {
        if !self.is_pool_enabled() {
            debug!("worker pool disabled, requests are handled inline");
            return;
        }
        let mut started = false;
        self.worker_pool.get_or_init(|| {
            started = true;
            MultipleChannelWorkerPool::new(
                &self.notify_shutdown,
                self.processor.clone(),
                self.pool_config.clone(),
            )
        });
        if started {
            info!(
                "worker pool started, {} workers, queue capacity {}",
                self.pool_config.num_channels, self.pool_config.channel_capacity
            );
        }
    }

    /// Signals every worker and the pool monitor to exit.
    pub fn stop_worker_pool(&self) {
        if self.notify_shutdown.send(()).is_ok() {
            info!("worker pool stopping");
        }
    }

    /// Queues the request on its connection's worker, waiting while that
    /// worker's queue is full.
    pub async fn send_msg_to_task_queue(&self, request: Request) -> AppResult<()> {
        let worker_pool = self
            .worker_pool
            .get()
            .ok_or_else(|| IllegalStateError("worker pool is not started".to_string()))?;
        let worker_id = request.connection().conn_id() as usize % worker_pool.channel_count();
        trace!(
            "add conn id = {} request msg id = {} to worker {}",
            request.connection().conn_id(),
            request.msg_id(),
            worker_id
        );
        worker_pool.send(request, worker_id).await
    }

    /// Runs the request on a task of its own.
    pub fn dispatch_inline(&self, request: Request) -> JoinHandle<()> {
        let processor = self.processor.clone();
        tokio::spawn(async move { processor.process_request(request).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::test_util::{new_test_connection, test_service};
    use crate::network::{Connection, Message};
    use crate::service::ServiceConfig;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::net::TcpStream;

    type Seen = Arc<Mutex<Vec<(u32, String)>>>;

    fn recording_route(seen: Seen) -> Route {
        Route::new().handle(move |request: Request| {
            let seen = seen.clone();
            async move {
                let jitter = u64::from(rand::random::<u8>() % 4);
                tokio::time::sleep(Duration::from_millis(jitter)).await;
                let data = String::from_utf8_lossy(request.data()).to_string();
                seen.lock().push((request.connection().conn_id(), data));
            }
        })
    }

    async fn connections(ids: &[u32]) -> Vec<(Connection, TcpStream)> {
        let service = test_service(ServiceConfig::default(), |builder| builder);
        let mut conns = Vec::new();
        for id in ids {
            conns.push(new_test_connection(service.clone(), *id, None).await);
        }
        conns
    }

    fn pool_config(workers: usize) -> WorkerPoolConfig {
        WorkerPoolConfig {
            channel_capacity: 8,
            num_channels: workers,
            monitor_interval: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_worker_index() {
        let handler = MsgHandler::new(pool_config(4));
        assert_eq!(handler.worker_index(5), Some(1));
        assert_eq!(handler.worker_index(13), Some(1));
        assert_eq!(handler.worker_index(6), Some(2));
        assert_eq!(MsgHandler::new(pool_config(0)).worker_index(5), None);
    }

    #[tokio::test]
    async fn test_same_worker_keeps_connection_order() {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let handler = MsgHandler::new(pool_config(4));
        handler.add_router(1, recording_route(seen.clone()));
        handler.start_worker_pool();

        let conns = connections(&[5, 13]).await;
        let (conn5, conn13) = (&conns[0].0, &conns[1].0);

        // A and B on connection 5, C on connection 13, interleaved
        for (conn, data) in [(conn5, "A"), (conn13, "C"), (conn5, "B")] {
            let request = Request::new(conn.clone(), Message::new(1, data.as_bytes().to_vec()));
            handler.send_msg_to_task_queue(request).await.unwrap();
        }
        for seq in 0..40 {
            let conn = if seq % 2 == 0 { conn5 } else { conn13 };
            let data = format!("{}", seq);
            let request = Request::new(conn.clone(), Message::new(1, data.into_bytes()));
            handler.send_msg_to_task_queue(request).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(500)).await;

        let seen = seen.lock().clone();
        assert_eq!(seen.len(), 43);
        let of = |conn_id: u32| -> Vec<String> {
            seen.iter()
                .filter(|(id, _)| *id == conn_id)
                .map(|(_, data)| data.clone())
                .collect()
        };
        let from5 = of(5);
        assert_eq!(&from5[..2], &["A".to_string(), "B".to_string()]);
        let expected5: Vec<String> = (0..40).step_by(2).map(|seq| seq.to_string()).collect();
        assert_eq!(&from5[2..], &expected5[..]);
        let expected13: Vec<String> = std::iter::once("C".to_string())
            .chain((1..40).step_by(2).map(|seq| seq.to_string()))
            .collect();
        assert_eq!(of(13), expected13);

        handler.stop_worker_pool();
    }

    #[tokio::test]
    async fn test_submit_before_start_fails() {
        let handler = MsgHandler::new(pool_config(2));
        let conns = connections(&[1]).await;
        let request = Request::new(conns[0].0.clone(), Message::new(1, Vec::new()));
        assert!(handler.send_msg_to_task_queue(request).await.is_err());
    }

    #[tokio::test]
    async fn test_hooks_run_in_order_inline() {
        let steps = Arc::new(Mutex::new(Vec::new()));
        let (pre, handle, post) = (steps.clone(), steps.clone(), steps.clone());
        let handler = MsgHandler::new(pool_config(0));
        handler.add_router(
            7,
            Route::new()
                .post_handle(move |_req: Request| {
                    let post = post.clone();
                    async move { post.lock().push("post") }
                })
                .pre_handle(move |_req: Request| {
                    let pre = pre.clone();
                    async move { pre.lock().push("pre") }
                })
                .handle(move |_req: Request| {
                    let handle = handle.clone();
                    async move { handle.lock().push("handle") }
                }),
        );
        handler.start_worker_pool();

        let conns = connections(&[1]).await;
        let request = Request::new(conns[0].0.clone(), Message::new(7, Vec::new()));
        handler.dispatch_inline(request).await.unwrap();
        assert_eq!(*steps.lock(), vec!["pre", "handle", "post"]);

        // an unknown msg id is dropped quietly
        let request = Request::new(conns[0].0.clone(), Message::new(8, Vec::new()));
        handler.dispatch_inline(request).await.unwrap();
        assert_eq!(steps.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_add_router_last_write_wins() {
        let steps = Arc::new(Mutex::new(Vec::new()));
        let (first, second) = (steps.clone(), steps.clone());
        let handler = MsgHandler::new(pool_config(0));
        handler.add_router(
            1,
            Route::new().handle(move |_req: Request| {
                let first = first.clone();
                async move { first.lock().push("first") }
            }),
        );
        handler.add_router(
            1,
            Route::new().handle(move |_req: Request| {
                let second = second.clone();
                async move { second.lock().push("second") }
            }),
        );
        assert_eq!(handler.route_count(), 1);

        let conns = connections(&[1]).await;
        handler
            .dispatch_inline(Request::new(conns[0].0.clone(), Message::new(1, Vec::new())))
            .await
            .unwrap();
        assert_eq!(*steps.lock(), vec!["second"]);
    }
}
