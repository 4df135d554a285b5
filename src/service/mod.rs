pub use app_error::{AppError, AppResult};
pub use base_service::{BaseService, ConnHook, ServiceBuilder};
pub use client::{Client, ClientOptions};
pub use config::{ByteOrder, ClientConfig, IpVersion, ServerConfig, ServiceConfig, StoneNetConfig};
pub use server::{Server, ServerOptions};
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing};

mod app_error;
mod base_service;
mod client;
mod config;
mod server;
mod shutdown;
mod tracing_config;
