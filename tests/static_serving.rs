//! End-to-end tests over loopback TCP: a real server thread, real sockets,
//! real files.

use std::fs;
use std::io::Read;
use std::io::Write;
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use vev::http::connection::user_count;
use vev::{Config, Server};

const WELCOME: &str = "<html><body>welcome</body></html>";
const NOT_FOUND: &str = "<html><body>404</body></html>";
const BAD_REQUEST: &str = "<html><body>400</body></html>";

// The user count is process-global, so tests run one at a time.
static LOCK: Mutex<()> = Mutex::new(());

fn lock() -> MutexGuard<'static, ()> {
    LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

fn make_root(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("vev-e2e-{}-{name}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("welcome.html"), WELCOME).unwrap();
    fs::write(dir.join("404.html"), NOT_FOUND).unwrap();
    fs::write(dir.join("400.html"), BAD_REQUEST).unwrap();
    dir
}

/// Boots a server on an ephemeral port; the reactor thread runs detached for
/// the rest of the test process.
fn start_server(name: &str, trig_mode: u8, timeout_ms: u64) -> u16 {
    let config = Config {
        port: 0,
        trig_mode,
        timeout_ms,
        opt_linger: false,
        thread_num: 2,
        open_log: false,
        log_level: 1,
        log_queue_size: 64,
        root: make_root(name),
    };

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut server = Server::new(&config).expect("server setup failed");
        tx.send(server.port().unwrap()).unwrap();
        let _ = server.run();
    });
    rx.recv_timeout(Duration::from_secs(5)).unwrap()
}

fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Reads one framed response: status line, raw header text, exact body.
fn read_response(stream: &mut TcpStream) -> (String, String, Vec<u8>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        if let Some(pos) = find_blank_line(&buf) {
            break pos;
        }
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "peer closed before the response completed");
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let content_length: usize = head
        .lines()
        .find_map(|line| line.strip_prefix("Content-length: "))
        .expect("response lacks Content-length")
        .trim()
        .parse()
        .unwrap();

    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "peer closed mid-body");
        body.extend_from_slice(&chunk[..n]);
    }
    assert_eq!(content_length, body.len(), "body longer than advertised");

    let status = head.lines().next().unwrap().to_string();
    (status, head, body)
}

#[test]
fn get_root_serves_welcome_page_with_keep_alive() {
    let _guard = lock();
    let port = start_server("welcome", 3, 60_000);
    let mut stream = connect(port);

    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let (status, head, body) = read_response(&mut stream);

    assert_eq!("HTTP/1.1 200 OK", status);
    assert!(head.contains("Connection: keep-alive"));
    assert!(head.contains("Content-type: text/html"));
    assert_eq!(WELCOME.as_bytes(), body.as_slice());
}

#[test]
fn missing_asset_returns_404_with_error_page_body() {
    let _guard = lock();
    let port = start_server("missing", 3, 60_000);
    let mut stream = connect(port);

    stream
        .write_all(b"GET /nope HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let (status, _head, body) = read_response(&mut stream);

    assert_eq!("HTTP/1.1 404 Not Found", status);
    assert_eq!(NOT_FOUND.as_bytes(), body.as_slice());
}

#[test]
fn malformed_request_line_gets_400_then_fin() {
    let _guard = lock();
    let port = start_server("malformed", 3, 60_000);
    let mut stream = connect(port);

    stream.write_all(b"GET\r\n").unwrap();
    let (status, head, body) = read_response(&mut stream);

    assert_eq!("HTTP/1.1 400 Bad Request", status);
    assert!(head.contains("Connection: close"));
    assert_eq!(BAD_REQUEST.as_bytes(), body.as_slice());

    // Flushed, then closed: the next read sees EOF.
    let mut rest = [0u8; 16];
    assert_eq!(0, stream.read(&mut rest).unwrap());
}

#[test]
fn keep_alive_connection_serves_sequential_requests() {
    let _guard = lock();
    let port = start_server("keepalive", 3, 60_000);
    // Let teardown from earlier tests settle before sampling the count.
    thread::sleep(Duration::from_millis(200));
    let mut stream = connect(port);

    stream
        .write_all(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let (status, _, body) = read_response(&mut stream);
    assert_eq!("HTTP/1.1 200 OK", status);
    assert_eq!(WELCOME.as_bytes(), body.as_slice());

    let users_between = user_count();

    stream
        .write_all(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let (status, _, body) = read_response(&mut stream);
    assert_eq!("HTTP/1.1 200 OK", status);
    assert_eq!(WELCOME.as_bytes(), body.as_slice());

    assert_eq!(users_between, user_count());
}

#[test]
fn level_triggered_mode_serves_requests_too() {
    let _guard = lock();
    let port = start_server("level", 0, 60_000);
    let mut stream = connect(port);

    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let (status, _, body) = read_response(&mut stream);
    assert_eq!("HTTP/1.1 200 OK", status);
    assert_eq!(WELCOME.as_bytes(), body.as_slice());
}

#[test]
fn request_split_across_packets_is_served() {
    let _guard = lock();
    let port = start_server("split", 3, 60_000);
    let mut stream = connect(port);

    stream.write_all(b"GET / HTT").unwrap();
    thread::sleep(Duration::from_millis(100));
    stream.write_all(b"P/1.1\r\nHost: x\r\n").unwrap();
    thread::sleep(Duration::from_millis(100));
    stream.write_all(b"\r\n").unwrap();

    let (status, _, body) = read_response(&mut stream);
    assert_eq!("HTTP/1.1 200 OK", status);
    assert_eq!(WELCOME.as_bytes(), body.as_slice());
}

#[test]
fn idle_connection_is_reaped_after_timeout() {
    let _guard = lock();
    let port = start_server("idle", 3, 300);
    let mut stream = connect(port);

    // Send nothing. The deadline heap should fire and the peer sees FIN.
    let mut buf = [0u8; 16];
    assert_eq!(0, stream.read(&mut buf).unwrap());
}

#[test]
fn http_1_0_request_is_answered_with_connection_close() {
    let _guard = lock();
    let port = start_server("http10", 3, 60_000);
    let mut stream = connect(port);

    stream.write_all(b"GET / HTTP/1.0\r\n\r\n").unwrap();
    let (status, head, body) = read_response(&mut stream);
    assert_eq!("HTTP/1.1 200 OK", status);
    assert!(head.contains("Connection: close"));
    assert_eq!(WELCOME.as_bytes(), body.as_slice());

    let mut rest = [0u8; 16];
    assert_eq!(0, stream.read(&mut rest).unwrap());
}
