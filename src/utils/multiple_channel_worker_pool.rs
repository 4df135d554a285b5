use std::any::type_name;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, trace, warn};

use crate::AppError::{ChannelSendError, IllegalStateError};
use crate::{AppResult, Shutdown};

/// Handler trait for processing tasks
pub trait PoolHandler<T>: Clone + Send + 'static + Sync {
    /// Handle the task
    fn handle(&self, task: T) -> impl Future<Output = ()> + Send;
}

/// Worker Pool Config Parameters
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Capacity of every worker's queue
    pub channel_capacity: usize,
    /// Number of workers, one queue each
    pub num_channels: usize,
    /// How often the monitor looks for dead workers
    pub monitor_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            num_channels: 4,
            monitor_interval: Duration::from_secs(5),
        }
    }
}

/// A worker pool with multiple independent task channels.
///
/// Each channel has exactly one dedicated worker, so tasks sent to the same
/// channel are handled one after another in send order. A full channel makes
/// `send` wait, which pushes back on the producer instead of buffering.
#[derive(Debug)]
pub struct MultipleChannelWorkerPool<T> {
    channels: Arc<Vec<TaskChannel<T>>>,
}

/// represent a task channel
#[derive(Debug)]
struct TaskChannel<T> {
    sender: async_channel::Sender<T>,
    receiver: async_channel::Receiver<T>,
}

/// represent a running worker
#[derive(Debug)]
struct Worker {
    id: usize,
    handle: JoinHandle<()>,
}

impl<T: Send + Debug + 'static> MultipleChannelWorkerPool<T> {
    /// Spawns the workers and their monitor. Everything exits once
    /// `notify_shutdown` fires or all of its senders are dropped.
    pub fn new<H: PoolHandler<T>>(
        notify_shutdown: &broadcast::Sender<()>,
        handler: H,
        config: WorkerPoolConfig,
    ) -> Self {
        let channels = Self::spawn_channels_with_monitor(
            config,
            Shutdown::subscribe(notify_shutdown),
            handler,
        );

        Self { channels }
    }

    /// Send request to specified channel, waiting while the channel is full.
    pub async fn send(&self, request: T, channel_id: usize) -> AppResult<()> {
        let channel = self.channels.get(channel_id).ok_or_else(|| {
            IllegalStateError(format!(
                "channel {} not found, pool has {} channels",
                channel_id,
                self.channels.len()
            ))
        })?;
        channel
            .sender
            .send(request)
            .await
            .map_err(|e| ChannelSendError(format!("channel {}: {}", channel_id, e)))
    }

    /// Get channel count
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn spawn_channels_with_monitor<H: PoolHandler<T>>(
        config: WorkerPoolConfig,
        shutdown: Shutdown,
        handler: H,
    ) -> Arc<Vec<TaskChannel<T>>> {
        let mut workers = Vec::with_capacity(config.num_channels);
        let mut channels = Vec::with_capacity(config.num_channels);

        // Create a dedicated worker for each channel
        for id in 0..config.num_channels {
            let (sender, receiver) = async_channel::bounded(config.channel_capacity.max(1));
            let worker =
                Self::spawn_worker(id, handler.clone(), shutdown.resubscribe(), receiver.clone());
            workers.push(worker);
            channels.push(TaskChannel { sender, receiver });
        }

        let channels = Arc::new(channels);

        // Start monitor
        Self::spawn_monitor(workers, channels.clone(), shutdown, handler, config);

        channels
    }

    fn spawn_worker<H: PoolHandler<T>>(
        id: usize,
        handler: H,
        mut shutdown: Shutdown,
        receiver: async_channel::Receiver<T>,
    ) -> Worker {
        let handle = tokio::spawn(async move {
            debug!("Worker {id} started");

            loop {
                tokio::select! {
                    res = receiver.recv() => match res {
                        Ok(request) => handler.handle(request).await,
                        Err(_) => {
                            debug!("Worker {id} channel closed");
                            break;
                        }
                    },
                    _ = shutdown.recv() => {
                        debug!("Worker {id} shutting down");
                        break;
                    }
                }
            }
        });

        Worker { id, handle }
    }

    fn spawn_monitor<H: PoolHandler<T>>(
        mut workers: Vec<Worker>,
        channels: Arc<Vec<TaskChannel<T>>>,
        mut shutdown: Shutdown,
        handler: H,
        config: WorkerPoolConfig,
    ) {
        tokio::spawn(async move {
            let mut interval = time::interval(config.monitor_interval);

            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!("Worker monitor received shutdown signal");
                        break;
                    }
                    _ = interval.tick() => {
                        for worker in &mut workers {
                            if !worker.handle.is_finished() {
                                trace!("Worker {} is running", worker.id);
                                continue;
                            }
                            match (&mut worker.handle).await {
                                Ok(_) => {
                                    // channel closed, nothing left to serve
                                    warn!("Worker {} completed unexpectedly", worker.id);
                                    continue;
                                }
                                Err(err) if err.is_panic() => Self::log_worker_panic(worker.id, err),
                                Err(_) => error!("Worker {} was cancelled", worker.id),
                            }

                            warn!("Worker {} failed, restarting...", worker.id);
                            *worker = Self::spawn_worker(
                                worker.id,
                                handler.clone(),
                                shutdown.resubscribe(),
                                channels[worker.id].receiver.clone(),
                            );
                            debug!("Worker {} restarted", worker.id);
                        }
                    }
                }
            }
            debug!("Worker monitor exiting");
        });
    }

    fn log_worker_panic(worker_id: usize, err: tokio::task::JoinError) {
        let payload = err.into_panic();
        if let Some(message) = payload.downcast_ref::<&'static str>() {
            error!("Worker {worker_id} panicked with message: {message}");
        } else if let Some(message) = payload.downcast_ref::<String>() {
            error!("Worker {worker_id} panicked with message: {message}");
        } else {
            error!(
                "Worker {worker_id} panicked with an unknown type: {}",
                get_type_name(&payload)
            );
        }
    }
}

#[inline]
fn get_type_name<R>(_: &R) -> &'static str {
    type_name::<R>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[derive(Clone)]
    struct TestHandler {
        counter: Arc<AtomicI32>,
    }

    impl PoolHandler<i32> for TestHandler {
        fn handle(&self, task: i32) -> impl Future<Output = ()> + Send {
            let counter = self.counter.clone();
            async move {
                counter.fetch_add(task, Ordering::SeqCst);
            }
        }
    }

    #[tokio::test]
    async fn test_worker_pool() {
        let (notify_shutdown, _) = broadcast::channel(1);

        let handler = TestHandler {
            counter: Arc::new(AtomicI32::new(0)),
        };

        let config = WorkerPoolConfig {
            channel_capacity: 10,
            num_channels: 2,
            monitor_interval: Duration::from_millis(100),
        };

        let pool = MultipleChannelWorkerPool::new(&notify_shutdown, handler.clone(), config);

        // one task per channel, the third channel does not exist
        pool.send(1, 0).await.unwrap();
        pool.send(2, 1).await.unwrap();
        assert!(pool.send(3, 2).await.is_err());

        // wait for both tasks
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(handler.counter.load(Ordering::SeqCst), 3);
        assert_eq!(pool.channel_count(), 2);
    }

    #[derive(Clone)]
    struct RecordingHandler {
        seen: Arc<Mutex<Vec<(u8, u32)>>>,
    }

    impl PoolHandler<(u8, u32)> for RecordingHandler {
        fn handle(&self, task: (u8, u32)) -> impl Future<Output = ()> + Send {
            let seen = self.seen.clone();
            async move {
                // uneven work per task must not reorder a channel
                let jitter = u64::from(rand::random::<u8>() % 3);
                tokio::time::sleep(Duration::from_millis(jitter)).await;
                seen.lock().push(task);
            }
        }
    }

    #[tokio::test]
    async fn test_channel_keeps_send_order() {
        let (notify_shutdown, _) = broadcast::channel(1);
        let handler = RecordingHandler {
            seen: Arc::new(Mutex::new(Vec::new())),
        };
        let config = WorkerPoolConfig {
            channel_capacity: 4,
            num_channels: 1,
            monitor_interval: Duration::from_secs(1),
        };
        let pool = MultipleChannelWorkerPool::new(&notify_shutdown, handler.clone(), config);

        for seq in 0..30 {
            pool.send((0, seq), 0).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let seen: Vec<u32> = handler.seen.lock().iter().map(|(_, seq)| *seq).collect();
        assert_eq!(seen, (0..30).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_worker_panic_recovery() {
        let (notify_shutdown, _) = broadcast::channel(1);

        #[derive(Clone)]
        struct PanicHandler {
            handled: Arc<AtomicI32>,
        }

        impl PoolHandler<bool> for PanicHandler {
            fn handle(&self, should_panic: bool) -> impl Future<Output = ()> + Send {
                let handled = self.handled.clone();
                async move {
                    if should_panic {
                        panic!("Test panic");
                    }
                    handled.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        let config = WorkerPoolConfig {
            channel_capacity: 10,
            num_channels: 1,
            monitor_interval: Duration::from_millis(100),
        };

        let handler = PanicHandler {
            handled: Arc::new(AtomicI32::new(0)),
        };
        let pool = MultipleChannelWorkerPool::new(&notify_shutdown, handler.clone(), config);

        // kill the only worker
        pool.send(true, 0).await.unwrap();

        // give the monitor time to notice
        tokio::time::sleep(Duration::from_millis(300)).await;

        // the restarted worker serves the same channel
        pool.send(false, 0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handler.handled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_workers() {
        let (notify_shutdown, _) = broadcast::channel(1);
        let handler = TestHandler {
            counter: Arc::new(AtomicI32::new(0)),
        };
        let config = WorkerPoolConfig {
            channel_capacity: 1,
            num_channels: 1,
            monitor_interval: Duration::from_millis(50),
        };
        let pool = MultipleChannelWorkerPool::new(&notify_shutdown, handler.clone(), config);

        notify_shutdown.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // the queue still accepts one task but nobody consumes it any more
        pool.send(1, 0).await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(50), pool.send(1, 0)).await;
        assert!(blocked.is_err());
        assert_eq!(handler.counter.load(Ordering::SeqCst), 0);
    }
}
