pub use multiple_channel_worker_pool::{MultipleChannelWorkerPool, PoolHandler, WorkerPoolConfig};
mod multiple_channel_worker_pool;
