pub mod config;
pub mod dispatcher;
pub mod exception;
pub mod headers;
pub mod param;
pub mod pattern;
pub mod request;
pub mod response;
pub mod route;
pub mod server;
pub mod transport;

#[cfg(test)]
mod test_util;

pub use config::Config;
pub use dispatcher::Dispatcher;
pub use exception::Exception;
pub use headers::Headers;
pub use param::{HttpRequestMethod, HttpVersion};
pub use pattern::RoutePattern;
pub use request::Request;
pub use response::Response;
pub use route::{async_callback, sync_callback, Callback, Completion, Handler, Params, Route, Servelet};
pub use server::{Server, ShutdownHandle};
pub use transport::{RawRequest, RawResponse, RequestHead};
