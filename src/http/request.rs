//! Incremental HTTP/1.1 request parser.
//!
//! Line-oriented state machine driven directly off the connection's read
//! buffer. Bytes are only consumed once a full CRLF-terminated line is
//! present, so a request arriving one byte per packet parses identically to
//! one arriving whole.

use std::collections::HashMap;

use crate::buffer::Buffer;

const CRLF: &[u8] = b"\r\n";

/// Parser position within a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    /// Expecting the request line.
    RequestLine,
    /// Expecting header lines or the empty terminator.
    Headers,
    /// Expecting the body line.
    Body,
    /// A full request has been consumed.
    Finish,
}

/// Incrementally parsed request: method, path, version, headers and body.
#[derive(Debug)]
pub struct Request {
    state: ParseState,
    method: String,
    path: String,
    version: String,
    body: String,
    headers: HashMap<String, String>,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            state: ParseState::RequestLine,
            method: String::new(),
            path: String::new(),
            version: String::new(),
            body: String::new(),
            headers: HashMap::new(),
        }
    }
}

impl Request {
    /// Creates an empty parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets all state for the next request on a kept-alive connection.
    pub fn init(&mut self) {
        self.state = ParseState::RequestLine;
        self.method.clear();
        self.path.clear();
        self.version.clear();
        self.body.clear();
        self.headers.clear();
    }

    /// Consumes complete lines from `buf`, advancing the state machine.
    ///
    /// Returns `true` for a complete or not-yet-complete request (call again
    /// once more bytes arrive), `false` only for a malformed request line.
    pub fn parse(&mut self, buf: &mut Buffer) -> bool {
        if buf.readable_len() == 0 {
            return false;
        }

        while buf.readable_len() > 0 && self.state != ParseState::Finish {
            let readable = buf.peek();
            let Some(line_end) = find_crlf(readable) else {
                // No full line yet; leave the bytes for the next read.
                return true;
            };
            let line = String::from_utf8_lossy(&readable[..line_end]).into_owned();

            match self.state {
                ParseState::RequestLine => {
                    if !self.parse_request_line(&line) {
                        return false;
                    }
                    self.canonicalize_path();
                }
                ParseState::Headers => {
                    self.parse_header(&line);
                    // Nothing beyond the terminating CRLF: the request ends
                    // here, body or not.
                    if buf.readable_len() <= 2 {
                        self.state = ParseState::Finish;
                    }
                }
                ParseState::Body => {
                    self.body.push_str(&line);
                    self.state = ParseState::Finish;
                }
                ParseState::Finish => {}
            }

            buf.retrieve_until(line_end + CRLF.len());
        }

        tracing::debug!(
            method = %self.method,
            path = %self.path,
            version = %self.version,
            "request parsed"
        );
        true
    }

    /// Matches `^(\S+) (\S+) HTTP/(\S+)$`: three non-empty fields split by
    /// exactly two single spaces, none containing whitespace.
    fn parse_request_line(&mut self, line: &str) -> bool {
        let Some((method, path, version)) = split_request_line(line) else {
            tracing::error!(%line, "malformed request line");
            return false;
        };
        self.method = method.to_string();
        self.path = path.to_string();
        self.version = version.to_string();
        self.state = ParseState::Headers;
        true
    }

    fn canonicalize_path(&mut self) {
        if self.path == "/" {
            self.path = "/welcome.html".to_string();
        } else if matches!(self.path.as_str(), "/400" | "/403" | "/404") {
            self.path.push_str(".html");
        }
    }

    /// Matches `^([^:]*): ?(.*)$`. Any line without a colon, notably the
    /// empty header terminator, flips the state to Body.
    fn parse_header(&mut self, line: &str) {
        match line.split_once(':') {
            Some((name, value)) => {
                let value = value.strip_prefix(' ').unwrap_or(value);
                self.headers.insert(name.to_string(), value.to_string());
            }
            None => self.state = ParseState::Body,
        }
    }

    /// Request method token, verbatim.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Canonicalised request path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Version token after `HTTP/`.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Stored body line, if any.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Value of `name`, matched case-sensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Whether a full request has been consumed.
    pub fn is_finished(&self) -> bool {
        self.state == ParseState::Finish
    }

    /// True iff the client sent `Connection: keep-alive` and speaks 1.1.
    pub fn is_keep_alive(&self) -> bool {
        self.version == "1.1" && self.header("Connection") == Some("keep-alive")
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(CRLF.len()).position(|w| w == CRLF)
}

fn split_request_line(line: &str) -> Option<(&str, &str, &str)> {
    let fields: Vec<&str> = line.split(' ').collect();
    let [method, path, rest] = fields.as_slice() else {
        return None;
    };
    let version = rest.strip_prefix("HTTP/")?;
    [*method, *path, version]
        .iter()
        .all(|f| !f.is_empty() && !f.chars().any(char::is_whitespace))
        .then_some((*method, *path, version))
}
