//! Binary entry point with the stock configuration record.

use std::io::Result;
use std::path::PathBuf;

use vev::{logging, Config, Server};

fn main() -> Result<()> {
    let config = Config {
        port: 20000,
        trig_mode: 3,
        timeout_ms: 60_000,
        opt_linger: false,
        thread_num: 6,
        open_log: true,
        log_level: 1,
        log_queue_size: 1024,
        root: PathBuf::from("resources"),
    };

    let _log = logging::init(&config);
    let mut server = Server::new(&config)?;
    server.run()
}
