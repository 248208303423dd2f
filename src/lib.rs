#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports
)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]

//! vev is a readiness-based HTTP/1.1 server for small static assets.
//!
//! One reactor thread multiplexes all sockets through epoll; a fixed pool of
//! worker threads performs the per-connection parse and encode work. Each
//! connection is armed one-shot, so a single worker at a time drives it, and
//! idle connections are reaped by an indexed deadline heap that also bounds
//! the reactor's poll timeout.

pub mod buffer;
pub mod config;
pub mod http;
pub mod logging;
pub mod poller;
pub mod pool;
pub mod server;
pub mod timer;

pub use config::Config;
pub use server::Server;
