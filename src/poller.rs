//! Readiness multiplexer over epoll.
//!
//! mio deliberately hides `EPOLLONESHOT` and level-triggered registration,
//! and this server leans on both: one-shot arming is what serialises worker
//! access to a connection, and the trigger mode is operator-selectable. So
//! the wrapper goes straight to the syscalls, but keeps the familiar
//! `Poller` / `Registry` / `Events` split: the [`Registry`] is a cheap,
//! thread-safe handle workers use to re-arm file descriptors, while
//! [`Poller::wait`] stays on the reactor thread.

use std::io::{Error, Result};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

/// Readiness: data available to read.
pub const READ: u32 = libc::EPOLLIN as u32;
/// Readiness: socket accepts writes.
pub const WRITE: u32 = libc::EPOLLOUT as u32;
/// Peer closed the connection entirely.
pub const HUP: u32 = libc::EPOLLHUP as u32;
/// Peer shut down its writing half.
pub const RDHUP: u32 = libc::EPOLLRDHUP as u32;
/// Error condition on the descriptor.
pub const ERROR: u32 = libc::EPOLLERR as u32;
/// Edge-triggered delivery.
pub const EDGE: u32 = libc::EPOLLET as u32;
/// Deliver one event, then stay silent until the fd is re-armed.
pub const ONESHOT: u32 = libc::EPOLLONESHOT as u32;

/// A single readiness notification.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    /// Descriptor the notification is for.
    pub fd: RawFd,
    /// Bitset of the `READ`/`WRITE`/`HUP`/`RDHUP`/`ERROR` constants.
    pub readiness: u32,
}

impl Event {
    /// Whether any of `mask`'s bits are set.
    #[inline]
    pub fn is(&self, mask: u32) -> bool {
        self.readiness & mask != 0
    }
}

/// Registration handle, shareable across threads.
///
/// `epoll_ctl` is thread-safe, so workers may re-arm a descriptor while the
/// reactor is blocked in `epoll_wait`.
#[derive(Debug)]
pub struct Registry {
    epfd: OwnedFd,
}

impl Registry {
    /// Watches `fd` with the given event mask.
    pub fn add(&self, fd: RawFd, events: u32) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events)
    }

    /// Replaces the event mask for `fd`, re-arming a one-shot registration.
    pub fn modify(&self, fd: RawFd, events: u32) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events)
    }

    /// Stops watching `fd`.
    pub fn remove(&self, fd: RawFd) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        // Safety: epfd is a live epoll descriptor owned by self, and ev is a
        // valid epoll_event for the duration of the call.
        let rc = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut ev) };
        if rc < 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }
}

/// Collection filled by [`Poller::wait`], reused across iterations.
#[derive(Debug)]
pub struct Events {
    ready: Vec<Event>,
    capacity: usize,
}

impl Events {
    /// Creates storage for up to `capacity` events per wait.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            ready: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Iterates over the events of the last wait.
    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.ready.iter().copied()
    }

    /// Number of events delivered by the last wait.
    pub fn len(&self) -> usize {
        self.ready.len()
    }

    /// Whether the last wait delivered nothing.
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }
}

/// The wait side of the multiplexer. Lives on the reactor thread.
#[derive(Debug)]
pub struct Poller {
    registry: Arc<Registry>,
}

impl Poller {
    /// Creates the epoll instance.
    pub fn new() -> Result<Self> {
        // Safety: epoll_create1 returns a fresh descriptor or -1.
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(Error::last_os_error());
        }
        // Safety: epfd is a valid descriptor we exclusively own.
        let epfd = unsafe { OwnedFd::from_raw_fd(epfd) };
        Ok(Self {
            registry: Arc::new(Registry { epfd }),
        })
    }

    /// Clones the registration handle.
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Blocks until readiness or `timeout_ms` elapses, filling `events`.
    ///
    /// Negative `timeout_ms` blocks indefinitely; zero polls. Returns the
    /// number of events delivered. `EINTR` is retried internally.
    pub fn wait(&self, events: &mut Events, timeout_ms: i32) -> Result<usize> {
        let mut raw: Vec<libc::epoll_event> = Vec::with_capacity(events.capacity);
        let n = loop {
            // Safety: raw's spare capacity holds events.capacity entries, and
            // epoll_wait writes at most that many before we set the length.
            let rc = unsafe {
                libc::epoll_wait(
                    self.registry.epfd.as_raw_fd(),
                    raw.as_mut_ptr(),
                    events.capacity as libc::c_int,
                    timeout_ms,
                )
            };
            if rc < 0 {
                let err = Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(err);
            }
            break rc as usize;
        };
        // Safety: epoll_wait initialised the first n entries.
        unsafe { raw.set_len(n) };

        events.ready.clear();
        events.ready.extend(raw.iter().map(|ev| Event {
            fd: ev.u64 as RawFd,
            readiness: ev.events,
        }));
        Ok(n)
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::AsRawFd;

    use super::{Event, Events, Poller, EDGE, ONESHOT, READ, WRITE};

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn wait_times_out_with_no_registrations() {
        let poller = Poller::new().unwrap();
        let mut events = Events::with_capacity(8);
        assert_eq!(0, poller.wait(&mut events, 0).unwrap());
        assert!(events.is_empty());
    }

    #[test]
    fn readable_socket_is_reported() {
        let poller = Poller::new().unwrap();
        let (mut client, server) = pair();
        poller.registry().add(server.as_raw_fd(), READ).unwrap();

        client.write_all(b"x").unwrap();
        let mut events = Events::with_capacity(8);
        assert_eq!(1, poller.wait(&mut events, 1000).unwrap());
        let event: Event = events.iter().next().unwrap();
        assert_eq!(server.as_raw_fd(), event.fd);
        assert!(event.is(READ));
    }

    #[test]
    fn oneshot_registration_fires_once_until_rearmed() {
        let poller = Poller::new().unwrap();
        let (mut client, server) = pair();
        let registry = poller.registry();
        registry
            .add(server.as_raw_fd(), READ | EDGE | ONESHOT)
            .unwrap();

        client.write_all(b"x").unwrap();
        let mut events = Events::with_capacity(8);
        assert_eq!(1, poller.wait(&mut events, 1000).unwrap());

        // More data, but the registration is spent.
        client.write_all(b"y").unwrap();
        assert_eq!(0, poller.wait(&mut events, 50).unwrap());

        registry
            .modify(server.as_raw_fd(), READ | EDGE | ONESHOT)
            .unwrap();
        assert_eq!(1, poller.wait(&mut events, 1000).unwrap());
    }

    #[test]
    fn removed_fd_stops_reporting() {
        let poller = Poller::new().unwrap();
        let (mut client, server) = pair();
        let registry = poller.registry();
        registry.add(server.as_raw_fd(), READ).unwrap();
        registry.remove(server.as_raw_fd()).unwrap();

        client.write_all(b"x").unwrap();
        let mut events = Events::with_capacity(8);
        assert_eq!(0, poller.wait(&mut events, 50).unwrap());
    }

    #[test]
    fn write_readiness_is_reported_for_fresh_socket() {
        let poller = Poller::new().unwrap();
        let (_client, server) = pair();
        poller.registry().add(server.as_raw_fd(), WRITE).unwrap();

        let mut events = Events::with_capacity(8);
        assert_eq!(1, poller.wait(&mut events, 1000).unwrap());
        assert!(events.iter().next().unwrap().is(WRITE));
    }
}
