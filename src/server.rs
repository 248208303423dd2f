//! The reactor: accepts clients, dispatches readiness, reaps idle sockets.
//!
//! One thread owns the epoll wait loop, the deadline heap and the connection
//! table; parse and transmit work runs on the worker pool. Connections are
//! armed one-shot, so the kernel delivers no further event for a socket
//! until the worker handling the previous one re-arms it through the shared
//! [`Registry`] — at most one worker ever touches a connection at a time,
//! and the per-connection mutex it locks is uncontended in steady state.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Result;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::config::Config;
use crate::http::connection::{self, HttpConn};
use crate::poller::{self, Events, Poller, Registry};
use crate::pool::WorkerPool;
use crate::timer::TimerHeap;

/// Hard cap on concurrent clients; excess accepts are turned away.
const MAX_FD: usize = 65536;

const EVENTS_PER_WAIT: usize = 1024;
const LISTEN_BACKLOG: i32 = 1024;

type ConnTable = Rc<RefCell<HashMap<RawFd, Arc<Mutex<HttpConn>>>>>;

/// Static file server: listener, reactor, deadline heap, worker pool and
/// connection table.
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    listen_fd: RawFd,
    listen_event: u32,
    conn_event: u32,
    timeout: Option<Duration>,
    root: Arc<PathBuf>,
    poller: Poller,
    registry: Arc<Registry>,
    timer: TimerHeap,
    pool: WorkerPool,
    conns: ConnTable,
}

impl Server {
    /// Binds the listener, resolves the serving root and registers with the
    /// reactor. Failures here are fatal to the process.
    pub fn new(config: &Config) -> Result<Self> {
        let root = Arc::new(std::fs::canonicalize(&config.root)?);
        let listener = bind_listener(config)?;
        let listen_fd = listener.as_raw_fd();

        let mut listen_event = poller::READ;
        if config.listen_edge_triggered() {
            listen_event |= poller::EDGE;
        }
        let mut conn_event = poller::ONESHOT | poller::RDHUP;
        if config.conn_edge_triggered() {
            conn_event |= poller::EDGE;
        }

        let poller = Poller::new()?;
        let registry = poller.registry();
        registry.add(listen_fd, listen_event)?;

        tracing::info!(
            port = listener.local_addr()?.port(),
            root = %root.display(),
            listener_et = config.listen_edge_triggered(),
            conn_et = config.conn_edge_triggered(),
            workers = config.thread_num,
            "server up"
        );

        Ok(Self {
            listener,
            listen_fd,
            listen_event,
            conn_event,
            timeout: (config.timeout_ms > 0).then(|| Duration::from_millis(config.timeout_ms)),
            root,
            poller,
            registry,
            timer: TimerHeap::new(),
            pool: WorkerPool::new(config.thread_num),
            conns: Rc::new(RefCell::new(HashMap::new())),
        })
    }

    /// The port actually bound, for configurations requesting port 0.
    pub fn port(&self) -> Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Runs the reactor loop. Only a failed `epoll_wait` returns.
    pub fn run(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(EVENTS_PER_WAIT);
        loop {
            let timeout_ms = match self.timeout {
                Some(_) => self
                    .timer
                    .next_tick()
                    .map_or(-1, |until| until.as_millis().min(i32::MAX as u128) as i32),
                None => -1,
            };

            self.poller.wait(&mut events, timeout_ms)?;
            for event in events.iter() {
                if event.fd == self.listen_fd {
                    self.deal_listen();
                } else if event.is(poller::ERROR | poller::HUP | poller::RDHUP) {
                    self.close_conn(event.fd);
                } else if event.is(poller::READ) {
                    self.deal_read(event.fd);
                } else if event.is(poller::WRITE) {
                    self.deal_write(event.fd);
                } else {
                    tracing::error!(fd = event.fd, readiness = event.readiness, "unexpected event");
                }
            }
        }
    }

    fn deal_listen(&mut self) {
        loop {
            let (stream, addr) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::error!("accept failed: {e}");
                    break;
                }
            };

            if connection::user_count() >= MAX_FD {
                connection::send_error(stream, "Server busy!");
                tracing::warn!("client rejected, server busy");
            } else {
                self.add_client(stream, addr);
            }

            if self.listen_event & poller::EDGE == 0 {
                // Level-triggered listener: one accept per event.
                break;
            }
        }
    }

    fn add_client(&mut self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nonblocking(true) {
            tracing::error!(client = %addr, "failed to set client non-blocking: {e}");
            return;
        }

        let fd = stream.as_raw_fd();
        let conn = Arc::new(Mutex::new(HttpConn::new(
            stream,
            addr,
            Arc::clone(&self.root),
            self.conn_event & poller::EDGE != 0,
        )));
        self.conns.borrow_mut().insert(fd, conn);

        if let Some(timeout) = self.timeout {
            let conns = Rc::clone(&self.conns);
            let registry = Arc::clone(&self.registry);
            self.timer.add(fd, timeout, move || {
                tracing::debug!(fd, "idle connection expired");
                drop_client(&conns, &registry, fd);
            });
        }

        if let Err(e) = self.registry.add(fd, self.conn_event | poller::READ) {
            tracing::error!(fd, "failed to register client: {e}");
            self.close_conn(fd);
        }
    }

    /// Pushes the idle deadline out again; called on every event for the fd.
    fn extend_time(&mut self, fd: RawFd) {
        if let Some(timeout) = self.timeout {
            self.timer.adjust(fd, timeout);
        }
    }

    fn deal_read(&mut self, fd: RawFd) {
        let Some(conn) = self.conns.borrow().get(&fd).cloned() else {
            return;
        };
        self.extend_time(fd);
        let registry = Arc::clone(&self.registry);
        let conn_event = self.conn_event;
        self.pool.submit(move || on_read(&conn, &registry, conn_event));
    }

    fn deal_write(&mut self, fd: RawFd) {
        let Some(conn) = self.conns.borrow().get(&fd).cloned() else {
            return;
        };
        self.extend_time(fd);
        let registry = Arc::clone(&self.registry);
        let conn_event = self.conn_event;
        self.pool.submit(move || on_write(&conn, &registry, conn_event));
    }

    /// Full reactor-side teardown: heap node, registration, fd, table entry.
    fn close_conn(&mut self, fd: RawFd) {
        self.timer.remove(fd);
        drop_client(&self.conns, &self.registry, fd);
    }
}

/// Erases `fd` from the table and releases its registration and socket.
/// Idempotent; also installed as the idle callback in the deadline heap.
fn drop_client(conns: &ConnTable, registry: &Arc<Registry>, fd: RawFd) {
    let Some(conn) = conns.borrow_mut().remove(&fd) else {
        return;
    };
    let _ = registry.remove(fd);
    if let Ok(mut conn) = conn.lock() {
        conn.close();
    };
}

/// Worker-side teardown: deregister and close the socket. The table entry
/// stays behind for the reactor, reaped by the timer callback or overwritten
/// when the kernel reuses the fd.
fn worker_close(conn: &mut HttpConn, registry: &Registry) {
    let _ = registry.remove(conn.fd());
    conn.close();
}

fn on_read(conn: &Arc<Mutex<HttpConn>>, registry: &Arc<Registry>, conn_event: u32) {
    let Ok(mut conn) = conn.lock() else {
        return;
    };
    if conn.is_closed() {
        return;
    }

    match conn.read() {
        Ok(0) => {
            worker_close(&mut conn, registry);
            return;
        }
        Err(e) if e.kind() != std::io::ErrorKind::WouldBlock => {
            tracing::warn!(fd = conn.fd(), "read failed: {e}");
            worker_close(&mut conn, registry);
            return;
        }
        _ => {}
    }

    on_process(&mut conn, registry, conn_event);
}

fn on_process(conn: &mut HttpConn, registry: &Registry, conn_event: u32) {
    let interest = if conn.process() {
        conn_event | poller::WRITE
    } else {
        conn_event | poller::READ
    };
    if let Err(e) = registry.modify(conn.fd(), interest) {
        tracing::warn!(fd = conn.fd(), "failed to re-arm connection: {e}");
        worker_close(conn, registry);
    }
}

fn on_write(conn: &Arc<Mutex<HttpConn>>, registry: &Arc<Registry>, conn_event: u32) {
    let Ok(mut conn) = conn.lock() else {
        return;
    };
    if conn.is_closed() {
        return;
    }

    match conn.write() {
        Ok(_) => {
            if conn.to_write_bytes() == 0 {
                if conn.is_keep_alive() {
                    // Re-enters the parser: drains any pipelined bytes, or
                    // re-arms for reading on an empty buffer.
                    on_process(&mut conn, registry, conn_event);
                } else {
                    worker_close(&mut conn, registry);
                }
            } else if let Err(e) = registry.modify(conn.fd(), conn_event | poller::WRITE) {
                tracing::warn!(fd = conn.fd(), "failed to re-arm writer: {e}");
                worker_close(&mut conn, registry);
            }
        }
        Err(e) => {
            tracing::warn!(fd = conn.fd(), "write failed: {e}");
            worker_close(&mut conn, registry);
        }
    }
}

fn bind_listener(config: &Config) -> Result<TcpListener> {
    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if config.opt_linger {
        socket.set_linger(Some(Duration::from_secs(1)))?;
    }
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}
