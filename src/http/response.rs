//! HTTP/1.1 response assembly.
//!
//! Status line and headers are appended to the connection's write buffer;
//! the body is a read-only private memory mapping of the target file, sent
//! alongside the buffer by a vectored write. The source descriptor is closed
//! as soon as the mapping exists, so the client receives the snapshot taken
//! at map time even if the file is replaced on disk afterwards.

use std::fs::{self, File};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::{Mmap, MmapOptions};

use crate::buffer::Buffer;

/// Builds one response from a resolved request, owning the body mapping.
#[derive(Debug, Default)]
pub struct Response {
    code: Option<u16>,
    root: Arc<PathBuf>,
    path: String,
    keep_alive: bool,
    file: Option<Mmap>,
}

fn reason(code: u16) -> Option<&'static str> {
    match code {
        200 => Some("OK"),
        400 => Some("Bad Request"),
        403 => Some("Forbidden"),
        404 => Some("Not Found"),
        _ => None,
    }
}

fn error_page(code: u16) -> Option<&'static str> {
    match code {
        400 => Some("/400.html"),
        403 => Some("/403.html"),
        404 => Some("/404.html"),
        _ => None,
    }
}

/// Content type by path suffix. The trailing spaces on `text/css ` and
/// `text/javascript ` are load-bearing: clients have only ever seen these
/// bytes, so they stay.
fn file_type(path: &str) -> &'static str {
    let Some(dot) = path.rfind('.') else {
        return "text/plain";
    };
    match &path[dot..] {
        ".html" => "text/html",
        ".xml" => "text/xml",
        ".xhtml" => "application/xhtml+xml",
        ".txt" => "text/plain",
        ".rtf" => "application/rtf",
        ".pdf" => "application/pdf",
        ".word" => "application/nsword",
        ".png" => "image/png",
        ".gif" => "image/gif",
        ".jpg" | ".jpeg" => "image/jpeg",
        ".au" => "audio/basic",
        ".mpeg" | ".mpg" => "video/mpeg",
        ".avi" => "video/x-msvideo",
        ".gz" => "application/x-gzip",
        ".tar" => "application/x-tar",
        ".css" => "text/css ",
        ".js" => "text/javascript ",
        _ => "text/plain",
    }
}

/// `root` + `path` by plain concatenation; `path` always starts with `/`,
/// and `Path::join` would discard the root for such components.
fn resolve(root: &Path, path: &str) -> PathBuf {
    PathBuf::from(format!("{}{}", root.display(), path))
}

impl Response {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the inputs for the next response, dropping any previous body
    /// mapping. `code: None` asks [`Response::make_response`] to classify
    /// the target itself; a preset code (the parser's 400) is served as-is.
    pub fn init(&mut self, root: Arc<PathBuf>, path: &str, keep_alive: bool, code: Option<u16>) {
        self.file = None;
        self.code = code;
        self.root = root;
        self.path = path.to_string();
        self.keep_alive = keep_alive;
    }

    /// Appends status line and headers to `buf` and maps the body file.
    pub fn make_response(&mut self, buf: &mut Buffer) {
        if self.code.is_none() {
            self.code = Some(match fs::metadata(resolve(&self.root, &self.path)) {
                Err(_) => 404,
                Ok(meta) if meta.is_dir() => 404,
                Ok(meta) if meta.permissions().mode() & 0o004 == 0 => 403,
                Ok(_) => 200,
            });
        }

        let code = self.code.unwrap_or(400);
        if let Some(page) = error_page(code) {
            self.path = page.to_string();
        }

        self.append_status_line(buf);
        self.append_headers(buf);
        self.append_content(buf);
    }

    /// `HTTP/1.1 <code> <reason>`; unknown codes degrade to 400.
    fn append_status_line(&mut self, buf: &mut Buffer) {
        let (code, status) = match self.code.and_then(|c| reason(c).map(|r| (c, r))) {
            Some(pair) => pair,
            None => (400, "Bad Request"),
        };
        self.code = Some(code);
        buf.append(format!("HTTP/1.1 {code} {status}\r\n").as_bytes());
    }

    fn append_headers(&self, buf: &mut Buffer) {
        buf.append(b"Connection: ");
        if self.keep_alive {
            buf.append(b"keep-alive\r\n");
            buf.append(b"keep-alive: max=6, timeout=120\r\n");
        } else {
            buf.append(b"close\r\n");
        }
        buf.append(format!("Content-type: {}\r\n", file_type(&self.path)).as_bytes());
    }

    fn append_content(&mut self, buf: &mut Buffer) {
        let target = resolve(&self.root, &self.path);
        let Ok(file) = File::open(&target) else {
            self.error_content(buf, "File NotFound!");
            return;
        };

        tracing::debug!(path = %target.display(), "mapping response body");
        // Safety: the mapping is private copy-on-write and read-only; writes
        // to the underlying file by other processes cannot alter the pages we
        // serve, and the Mmap's lifetime is tied to this Response.
        let mapped = unsafe { MmapOptions::new().map_copy_read_only(&file) };
        let Ok(mapped) = mapped else {
            self.error_content(buf, "File NotFound!");
            return;
        };

        buf.append(format!("Content-length: {}\r\n\r\n", mapped.len()).as_bytes());
        self.file = Some(mapped);
        // `file` drops here; the mapping outlives the descriptor.
    }

    /// Self-contained HTML error body, carrying its own `Content-length`.
    fn error_content(&self, buf: &mut Buffer, message: &str) {
        let code = self.code.unwrap_or(400);
        let status = reason(code).unwrap_or("Bad Request");

        let body = format!(
            "<html><title>Error</title><body bgcolor=\"ffffff\">{code} : {status}\n\
             <p>{message}</p><hr><em>vev</em></body></html>"
        );
        buf.append(format!("Content-length: {}\r\n\r\n", body.len()).as_bytes());
        buf.append(body.as_bytes());
    }

    /// The mapped body, when a file was mapped.
    pub fn file(&self) -> Option<&[u8]> {
        self.file.as_deref()
    }

    /// Length of the mapped body, 0 when none.
    pub fn file_len(&self) -> usize {
        self.file.as_ref().map_or(0, |m| m.len())
    }

    /// Drops the body mapping, if any.
    pub fn unmap(&mut self) {
        self.file = None;
    }

    /// Whether this response keeps the connection open.
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// The status code, once decided.
    pub fn code(&self) -> Option<u16> {
        self.code
    }
}
