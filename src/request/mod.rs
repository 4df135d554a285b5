//! Request dispatch: the router table keyed by message id and the worker pool
//! that runs the matched routes.

mod request_context;
mod request_processor;
mod route;

pub use request_context::Request;
pub use request_processor::{MsgHandler, RequestProcessor};
pub use route::{HandlerFn, Route};
