//! Per-client connection state.
//!
//! Owns the non-blocking socket, the read/write buffers, the parser and the
//! response builder. The response is transmitted as two regions, the header
//! bytes in the write buffer and the mapped file body, drained together by a
//! vectored write with a cursor over each.

use std::io::{ErrorKind, IoSlice, Result, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::buffer::Buffer;
use crate::http::request::Request;
use crate::http::response::Response;

/// Once below this many queued bytes, a level-triggered write loop yields and
/// lets the next readiness event continue the flush.
const WRITE_LOOP_FLOOR: usize = 10240;

static USER_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Number of live connections across the process.
pub fn user_count() -> usize {
    USER_COUNT.load(Ordering::Relaxed)
}

/// One accepted client: socket, buffers, parser, builder and send cursors.
#[derive(Debug)]
pub struct HttpConn {
    stream: Option<TcpStream>,
    fd: RawFd,
    addr: SocketAddr,
    edge_triggered: bool,
    root: Arc<PathBuf>,
    read_buf: Buffer,
    write_buf: Buffer,
    request: Request,
    response: Response,
    /// Bytes of the mapped body already handed to the kernel.
    file_written: usize,
}

impl HttpConn {
    /// Wraps an accepted socket, incrementing the process-wide user count.
    pub fn new(stream: TcpStream, addr: SocketAddr, root: Arc<PathBuf>, edge_triggered: bool) -> Self {
        let fd = stream.as_raw_fd();
        USER_COUNT.fetch_add(1, Ordering::Relaxed);
        tracing::info!(fd, client = %addr, users = user_count(), "client in");
        Self {
            stream: Some(stream),
            fd,
            addr,
            edge_triggered,
            root,
            read_buf: Buffer::default(),
            write_buf: Buffer::default(),
            request: Request::new(),
            response: Response::new(),
            file_written: 0,
        }
    }

    /// The kernel descriptor, also the connection's id in every table.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Peer address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether [`HttpConn::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// Releases the socket and the body mapping; idempotent.
    pub fn close(&mut self) {
        self.response.unmap();
        if let Some(stream) = self.stream.take() {
            USER_COUNT.fetch_sub(1, Ordering::Relaxed);
            tracing::info!(fd = self.fd, client = %self.addr, users = user_count(), "client quit");
            drop(stream);
        }
    }

    /// Pulls bytes from the socket into the read buffer.
    ///
    /// Edge-triggered connections drain until `WouldBlock`; level-triggered
    /// ones issue a single scatter read. `Ok(0)` means the peer closed.
    pub fn read(&mut self) -> Result<usize> {
        let mut total = 0;
        loop {
            let Some(stream) = self.stream.as_mut() else {
                return Err(ErrorKind::NotConnected.into());
            };
            match self.read_buf.read_from(stream) {
                Ok(0) => return Ok(0),
                Ok(n) => {
                    total += n;
                    if !self.edge_triggered {
                        return Ok(total);
                    }
                }
                Err(e) => match e.kind() {
                    ErrorKind::WouldBlock => {
                        if total == 0 {
                            return Err(e);
                        }
                        return Ok(total);
                    }
                    ErrorKind::Interrupted => {}
                    _ => return Err(e),
                },
            }
        }
    }

    /// Drains the staged response with vectored writes.
    ///
    /// Runs until everything is flushed or the socket stops accepting;
    /// level-triggered connections additionally stop once no more than
    /// 10 KiB remains queued, deferring the tail to the next event.
    pub fn write(&mut self) -> Result<usize> {
        let mut total = 0;
        loop {
            if self.to_write_bytes() == 0 {
                break;
            }

            let head = self.write_buf.peek();
            let head_len = head.len();
            let body = self.response.file().unwrap_or(&[]);
            let tail = &body[self.file_written.min(body.len())..];
            let iovs = [IoSlice::new(head), IoSlice::new(tail)];

            let n = match self.stream.as_mut() {
                Some(stream) => stream.write_vectored(&iovs),
                None => return Err(ErrorKind::NotConnected.into()),
            };
            let n = match n {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };

            if n > head_len {
                // Header region fully gone; the remainder came off the body.
                self.file_written += n - head_len;
                self.write_buf.retrieve_all();
            } else {
                self.write_buf.retrieve(n);
            }
            total += n;

            if !self.edge_triggered && self.to_write_bytes() <= WRITE_LOOP_FLOOR {
                break;
            }
        }
        Ok(total)
    }

    /// Parses whatever the read buffer holds and stages a response.
    ///
    /// Returns `false` while there is nothing to answer yet, either because
    /// no bytes arrived or because the request is still incomplete; `true`
    /// once a response is staged and the connection should be armed for
    /// writing. The parser resumes where it left off across calls and is
    /// reset only after a completed request, so a request trickling in one
    /// packet at a time parses exactly like one arriving whole.
    pub fn process(&mut self) -> bool {
        if self.request.is_finished() {
            self.request.init();
        }
        if self.read_buf.readable_len() == 0 {
            return false;
        }

        if !self.request.parse(&mut self.read_buf) {
            self.response
                .init(Arc::clone(&self.root), self.request.path(), false, Some(400));
        } else if self.request.is_finished() {
            tracing::debug!(fd = self.fd, path = %self.request.path(), "request ok");
            self.response.init(
                Arc::clone(&self.root),
                self.request.path(),
                self.request.is_keep_alive(),
                None,
            );
        } else {
            // Headers or body still on the wire.
            return false;
        }

        self.response.make_response(&mut self.write_buf);
        self.file_written = 0;
        true
    }

    /// Queued bytes across the header buffer and the unsent body tail.
    pub fn to_write_bytes(&self) -> usize {
        self.write_buf.readable_len() + self.response.file_len() - self.file_written.min(self.response.file_len())
    }

    /// Whether the staged response keeps the connection open.
    pub fn is_keep_alive(&self) -> bool {
        self.response.keep_alive()
    }
}

impl Drop for HttpConn {
    fn drop(&mut self) {
        self.close();
    }
}

/// Best-effort blocking rejection used when the connection cap is reached.
pub fn send_error(mut stream: TcpStream, info: &str) {
    if let Err(err) = stream.write_all(info.as_bytes()) {
        tracing::warn!(fd = stream.as_raw_fd(), "error rejecting client: {err}");
    }
    // stream drops here, sending FIN after the best-effort payload
}
