//! A message oriented TCP server and client framework.
//!
//! Messages travel as `[data_len][msg_id][data]` frames. A [`Server`] accepts
//! connections, a [`Client`] dials one; both hand every decoded message to the
//! [`Route`] registered for its id, run by a worker pool that keeps each
//! connection's messages in order.

pub mod network;
pub mod request;
pub mod service;
pub mod utils;

pub use network::{Connection, DataPack, Message, PacketCodec};
pub use request::{Request, Route};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, BaseService, Client, ClientOptions,
    Server, ServerOptions, ServiceBuilder, Shutdown, StoneNetConfig,
};
