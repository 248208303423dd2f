//! HTTP/1.1 request parsing, response assembly and per-connection state.

pub mod connection;
pub mod request;
pub mod response;

pub use connection::HttpConn;
pub use request::Request;
pub use response::Response;
