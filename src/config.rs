//! Server configuration record.

use std::path::PathBuf;

/// Everything the server needs to run, decided before startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP port to listen on. Port 0 asks the OS for an ephemeral port.
    pub port: u16,
    /// Trigger mode: bit 0 arms the listener edge-triggered, bit 1 the
    /// connections.
    pub trig_mode: u8,
    /// Idle-connection timeout in milliseconds; zero disables reaping.
    pub timeout_ms: u64,
    /// Whether to set `SO_LINGER` with a one-second drain on the listener.
    pub opt_linger: bool,
    /// Worker thread count; must be positive.
    pub thread_num: usize,
    /// Whether to install the asynchronous file logger.
    pub open_log: bool,
    /// Log verbosity: 0 debug, 1 info, 2 warn, 3+ error.
    pub log_level: u8,
    /// Capacity of the logger's blocking queue.
    pub log_queue_size: usize,
    /// Directory static assets are served from; resolved at startup.
    pub root: PathBuf,
}

impl Config {
    /// Whether connections should be registered edge-triggered.
    pub fn conn_edge_triggered(&self) -> bool {
        self.trig_mode & 0b10 != 0
    }

    /// Whether the listener should be registered edge-triggered.
    pub fn listen_edge_triggered(&self) -> bool {
        self.trig_mode & 0b01 != 0
    }
}
