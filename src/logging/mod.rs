//! Asynchronous file logging.
//!
//! Formatted `tracing` output is pushed onto a bounded [`BlockingQueue`] and
//! drained by a dedicated writer thread, so socket-path threads never wait on
//! disk. Writer failures are dropped rather than propagated; logging is
//! best-effort by design.

pub mod queue;

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::thread;

use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;

use crate::config::Config;
use queue::BlockingQueue;

const LOG_DIR: &str = "log";

/// Keeps the writer thread alive; dropping it closes the queue and joins the
/// writer.
#[derive(Debug)]
pub struct LogHandle {
    queue: Arc<BlockingQueue<Vec<u8>>>,
    writer: Option<thread::JoinHandle<()>>,
}

impl Drop for LogHandle {
    fn drop(&mut self) {
        self.queue.close();
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
    }
}

/// `MakeWriter` that hands each formatted event to the queue.
#[derive(Debug, Clone)]
struct QueueWriter {
    queue: Arc<BlockingQueue<Vec<u8>>>,
}

impl Write for QueueWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.queue.push(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for QueueWriter {
    type Writer = QueueWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn level_from(log_level: u8) -> Level {
    match log_level {
        0 => Level::DEBUG,
        1 => Level::INFO,
        2 => Level::WARN,
        _ => Level::ERROR,
    }
}

/// Installs the global subscriber backed by the async writer.
///
/// Returns `None` without installing anything when logging is disabled in
/// `config`, or when the log file cannot be created.
pub fn init(config: &Config) -> Option<LogHandle> {
    if !config.open_log {
        return None;
    }

    if fs::create_dir_all(LOG_DIR).is_err() {
        return None;
    }
    let name = format!("{}.log", chrono::Local::now().format("%Y_%m_%d"));
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(Path::new(LOG_DIR).join(name))
        .ok()?;

    let queue: Arc<BlockingQueue<Vec<u8>>> = Arc::new(BlockingQueue::new(config.log_queue_size));
    let writer = {
        let queue = Arc::clone(&queue);
        thread::Builder::new()
            .name("logger".into())
            .spawn(move || {
                while let Some(line) = queue.pop() {
                    if file.write_all(&line).is_err() {
                        break;
                    }
                    let _ = file.flush();
                }
            })
            .ok()?
    };

    tracing_subscriber::fmt()
        .with_max_level(level_from(config.log_level))
        .with_ansi(false)
        .with_target(false)
        .with_writer(QueueWriter {
            queue: Arc::clone(&queue),
        })
        .init();

    Some(LogHandle {
        queue,
        writer: Some(writer),
    })
}
