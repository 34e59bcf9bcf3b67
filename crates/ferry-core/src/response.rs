//! Response assembly and incremental, non-blocking streaming.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::SystemTime;

use tracing::debug;

use crate::date::truncate_to_secs;
use crate::docroot::DocRoot;
use crate::error::HttpError;
use crate::grammar::{ByteRange, parse_range};
use crate::http::{ALLOWED_METHODS, Method, Status};

/// Size of the buffer file bodies are streamed through.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Per-reactor values every response needs while preparing its headers.
pub struct ServeContext<'a> {
    pub root: &'a DocRoot,
    pub server_name: &'a str,
    pub date: &'a str,
}

enum Body {
    Empty,
    Text {
        bytes: Vec<u8>,
        sent: usize,
    },
    File {
        file: File,
        remaining: u64,
        buf: Box<[u8]>,
        pos: usize,
        len: usize,
    },
}

/// One HTTP reply, written across as many `write` calls as the socket needs.
pub struct Response {
    method: Method,
    path: String,
    request_headers: HashMap<String, String>,
    status: Status,
    message: String,
    close: bool,

    prepared: bool,
    file: Option<File>,
    content_type: Option<String>,
    last_modified: Option<SystemTime>,
    resource_len: u64,
    range: Option<ByteRange>,

    head: Option<Vec<u8>>,
    head_sent: usize,
    body: Body,
    bytes_sent: u64,
}

impl Response {
    /// A file response for a parsed request. Its final status is decided by
    /// `prepare`.
    pub fn for_request(
        method: Method,
        path: impl Into<String>,
        request_headers: HashMap<String, String>,
        close: bool,
    ) -> Self {
        Self::with_status(method, path.into(), request_headers, Status::Ok, String::new(), close)
    }

    /// An error reply for a protocol failure.
    pub fn error(err: &HttpError, method: Method, close: bool) -> Self {
        Self::with_status(
            method,
            String::new(),
            HashMap::new(),
            err.status,
            err.message.clone(),
            close,
        )
    }

    fn with_status(
        method: Method,
        path: String,
        request_headers: HashMap<String, String>,
        status: Status,
        message: String,
        close: bool,
    ) -> Self {
        Self {
            method,
            path,
            request_headers,
            status,
            message,
            close,
            prepared: false,
            file: None,
            content_type: None,
            last_modified: None,
            resource_len: 0,
            range: None,
            head: None,
            head_sent: 0,
            body: Body::Empty,
            bytes_sent: 0,
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn close(&self) -> bool {
        self.close
    }

    pub fn range(&self) -> Option<ByteRange> {
        self.range
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Resolve the file, conditional and range headers, then build the header
    /// block. Runs once; later calls are no-ops. Failures never escape: they
    /// rewrite the status in place.
    pub fn prepare(&mut self, ctx: &ServeContext<'_>) {
        if self.prepared {
            return;
        }
        self.prepared = true;

        if self.status == Status::Ok {
            self.resolve_file(ctx.root);
        }
        if self.status.is_error() {
            self.file = None;
            self.range = None;
        }

        let head = self.header_block(ctx);
        self.body = self.take_body();
        self.head = Some(head.into_bytes());

        debug!(
            status = self.status.code(),
            path = %self.path,
            close = self.close,
            "response prepared"
        );
    }

    fn resolve_file(&mut self, root: &DocRoot) {
        let Some(path) = root.resolve(&self.path) else {
            return self.not_found();
        };
        let Ok(metadata) = fs::metadata(&path) else {
            return self.not_found();
        };
        let modified = metadata.modified().ok().map(truncate_to_secs);
        self.last_modified = modified;

        let since = self
            .request_headers
            .get("if-modified-since")
            .and_then(|v| httpdate::parse_http_date(v).ok());
        if let (Some(since), Some(modified)) = (since, modified) {
            if modified <= since {
                self.status = Status::NotModified;
                return;
            }
        }

        let Ok(mut file) = File::open(&path) else {
            return self.not_found();
        };
        self.resource_len = metadata.len();
        self.content_type = Some(content_type_for(&path));

        if !self.request_headers.contains_key("if-range") {
            let range = self
                .request_headers
                .get("range")
                .and_then(|v| parse_range(v, self.resource_len));
            if let Some(range) = range {
                if file.seek(SeekFrom::Start(range.start)).is_err() {
                    return self.not_found();
                }
                self.status = Status::PartialContent;
                self.range = Some(range);
            }
        }
        self.file = Some(file);
    }

    fn not_found(&mut self) {
        self.status = Status::NotFound;
        self.message = format!("{} was not found on this server", self.path);
        self.file = None;
        self.content_type = None;
        self.last_modified = None;
        self.range = None;
    }

    fn body_len(&self) -> u64 {
        match (self.status, self.range) {
            (Status::NotModified, _) => 0,
            (Status::PartialContent, Some(range)) => range.length,
            (status, _) if status.is_error() => self.error_text().len() as u64,
            _ => self.resource_len,
        }
    }

    fn error_text(&self) -> String {
        format!(
            "{} {}\n{}\n",
            self.status.code(),
            self.status.reason(),
            self.message
        )
    }

    /// Pure string assembly of the status line and headers.
    fn header_block(&self, ctx: &ServeContext<'_>) -> String {
        let mut h = String::with_capacity(256);
        let _ = write!(
            h,
            "HTTP/1.1 {} {}\r\nServer: {}\r\nX-Frame-Options: SAMEORIGIN\r\nDate: {}\r\n",
            self.status.code(),
            self.status.reason(),
            ctx.server_name,
            ctx.date
        );
        if self.close {
            h.push_str("Connection: close\r\n");
        }
        if self.status == Status::MethodNotAllowed {
            let _ = write!(h, "Allow: {ALLOWED_METHODS}\r\n");
        }

        if self.status.is_error() {
            h.push_str("Content-Type: text/plain; charset=utf-8\r\n");
            let _ = write!(h, "Content-Length: {}\r\n", self.body_len());
        } else if self.status != Status::NotModified {
            if let Some(ct) = &self.content_type {
                let _ = write!(h, "Content-Type: {ct}\r\n");
            }
            if let Some(range) = self.range {
                let _ = write!(
                    h,
                    "Content-Range: bytes {}-{}/{}\r\n",
                    range.start, range.end, self.resource_len
                );
            }
            let _ = write!(h, "Content-Length: {}\r\n", self.body_len());
        }

        if let Some(modified) = self.last_modified {
            let _ = write!(h, "Last-Modified: {}\r\n", httpdate::fmt_http_date(modified));
        }
        if !self.status.is_error() {
            h.push_str("Accept-Ranges: bytes\r\n");
        }
        h.push_str("\r\n");
        h
    }

    fn take_body(&mut self) -> Body {
        if self.method == Method::Head || self.status == Status::NotModified {
            self.file = None;
            return Body::Empty;
        }
        if self.status.is_error() {
            return Body::Text {
                bytes: self.error_text().into_bytes(),
                sent: 0,
            };
        }
        let remaining = self.body_len();
        match self.file.take() {
            Some(file) if remaining > 0 => Body::File {
                file,
                remaining,
                buf: vec![0u8; CHUNK_SIZE].into_boxed_slice(),
                pos: 0,
                len: 0,
            },
            _ => Body::Empty,
        }
    }

    /// Push as much of the reply as `out` accepts.
    ///
    /// Returns `Ok(true)` once headers and body are fully flushed and
    /// `Ok(false)` when the writer would block; calling again resumes exactly
    /// where the previous call stopped.
    pub fn write<W: Write>(&mut self, ctx: &ServeContext<'_>, out: &mut W) -> io::Result<bool> {
        self.prepare(ctx);

        if let Some(head) = &self.head {
            while self.head_sent < head.len() {
                match write_some(out, &head[self.head_sent..])? {
                    Some(n) => {
                        self.head_sent += n;
                        self.bytes_sent += n as u64;
                    }
                    None => return Ok(false),
                }
            }
            self.head = None;
        }

        loop {
            match &mut self.body {
                Body::Empty => return Ok(true),
                Body::Text { bytes, sent } => {
                    if *sent == bytes.len() {
                        return Ok(true);
                    }
                    match write_some(out, &bytes[*sent..])? {
                        Some(n) => {
                            *sent += n;
                            self.bytes_sent += n as u64;
                        }
                        None => return Ok(false),
                    }
                }
                Body::File {
                    file,
                    remaining,
                    buf,
                    pos,
                    len,
                } => {
                    if *pos == *len {
                        if *remaining == 0 {
                            return Ok(true);
                        }
                        let want = (*remaining).min(buf.len() as u64) as usize;
                        let n = loop {
                            match file.read(&mut buf[..want]) {
                                Ok(n) => break n,
                                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                                Err(e) => return Err(e),
                            }
                        };
                        if n == 0 {
                            return Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "file shrank while streaming",
                            ));
                        }
                        *remaining -= n as u64;
                        *pos = 0;
                        *len = n;
                    }
                    match write_some(out, &buf[*pos..*len])? {
                        Some(n) => {
                            *pos += n;
                            self.bytes_sent += n as u64;
                        }
                        None => return Ok(false),
                    }
                }
            }
        }
    }
}

/// One non-blocking write. `None` means the writer accepted nothing.
fn write_some<W: Write>(out: &mut W, bytes: &[u8]) -> io::Result<Option<usize>> {
    loop {
        match out.write(bytes) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => return Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Content type for a file, `application/octet-stream` when unknown.
pub fn content_type_for(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    const DATE: &str = "Sun, 06 Nov 1994 08:49:37 GMT";

    /// A writer that accepts at most `limit` bytes per call and then blocks
    /// every other call.
    struct Trickle {
        out: Vec<u8>,
        limit: usize,
        block_next: bool,
    }

    impl Write for Trickle {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.block_next = !self.block_next;
            if !self.block_next {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.limit);
            self.out.extend_from_slice(&buf[..n]);
            Ok(n)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn site() -> (tempfile::TempDir, DocRoot) {
        let dir = tempfile::tempdir().unwrap();
        let body: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(dir.path().join("data.bin"), &body).unwrap();
        fs::write(dir.path().join("page.html"), b"<h1>hi</h1>").unwrap();
        let root = DocRoot::new(dir.path()).unwrap();
        (dir, root)
    }

    fn ctx(root: &DocRoot) -> ServeContext<'_> {
        ServeContext {
            root,
            server_name: "ferry-test",
            date: DATE,
        }
    }

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn drain(resp: &mut Response, ctx: &ServeContext<'_>) -> Vec<u8> {
        let mut out = Vec::new();
        assert!(resp.write(ctx, &mut out).unwrap());
        out
    }

    fn split(raw: &[u8]) -> (String, Vec<u8>) {
        let at = raw.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        (String::from_utf8(raw[..at].to_vec()).unwrap(), raw[at..].to_vec())
    }

    #[test]
    fn full_file_response() {
        let (_dir, root) = site();
        let ctx = ctx(&root);
        let mut resp = Response::for_request(Method::Get, "/page.html", HashMap::new(), false);
        let (head, body) = split(&drain(&mut resp, &ctx));

        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Server: ferry-test\r\n"));
        assert!(head.contains("X-Frame-Options: SAMEORIGIN\r\n"));
        assert!(head.contains(&format!("Date: {DATE}\r\n")));
        assert!(head.contains("Content-Type: text/html\r\n"));
        assert!(head.contains("Content-Length: 11\r\n"));
        assert!(head.contains("Last-Modified: "));
        assert!(head.contains("Accept-Ranges: bytes\r\n"));
        assert!(!head.contains("Connection: close"));
        assert_eq!(body, b"<h1>hi</h1>");
    }

    #[test]
    fn head_suppresses_body_but_keeps_length() {
        let (_dir, root) = site();
        let ctx = ctx(&root);
        let mut resp = Response::for_request(Method::Head, "/data.bin", HashMap::new(), true);
        let (head, body) = split(&drain(&mut resp, &ctx));
        assert!(head.contains("Content-Length: 10000\r\n"));
        assert!(head.contains("Content-Type: application/octet-stream\r\n"));
        assert!(head.contains("Connection: close\r\n"));
        assert!(body.is_empty());
    }

    #[test]
    fn range_request_streams_slice() {
        let (dir, root) = site();
        let ctx = ctx(&root);
        let full = fs::read(dir.path().join("data.bin")).unwrap();

        let mut resp = Response::for_request(
            Method::Get,
            "/data.bin",
            headers(&[("range", "bytes=9500-")]),
            false,
        );
        let (head, body) = split(&drain(&mut resp, &ctx));
        assert!(head.starts_with("HTTP/1.1 206 Partial Content\r\n"));
        assert!(head.contains("Content-Range: bytes 9500-9999/10000\r\n"));
        assert!(head.contains("Content-Length: 500\r\n"));
        assert_eq!(body, &full[9_500..]);
        assert_eq!(
            resp.range(),
            Some(ByteRange { start: 9_500, end: 9_999, length: 500 })
        );
    }

    #[test]
    fn backwards_range_serves_everything() {
        let (_dir, root) = site();
        let ctx = ctx(&root);
        let mut resp = Response::for_request(
            Method::Get,
            "/data.bin",
            headers(&[("range", "bytes=500-100")]),
            false,
        );
        let (head, body) = split(&drain(&mut resp, &ctx));
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(body.len(), 10_000);
    }

    #[test]
    fn if_range_disables_ranges() {
        let (_dir, root) = site();
        let ctx = ctx(&root);
        let mut resp = Response::for_request(
            Method::Get,
            "/data.bin",
            headers(&[("range", "bytes=0-99"), ("if-range", "\"abc\"")]),
            false,
        );
        let (head, body) = split(&drain(&mut resp, &ctx));
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(body.len(), 10_000);
    }

    #[test]
    fn not_modified_when_unchanged_since() {
        let (dir, root) = site();
        let ctx = ctx(&root);
        let modified = fs::metadata(dir.path().join("page.html"))
            .unwrap()
            .modified()
            .unwrap();

        for since in [modified, modified + Duration::from_secs(3600)] {
            let ims = httpdate::fmt_http_date(since);
            let mut resp = Response::for_request(
                Method::Get,
                "/page.html",
                headers(&[("if-modified-since", ims.as_str())]),
                false,
            );
            let (head, body) = split(&drain(&mut resp, &ctx));
            assert!(head.starts_with("HTTP/1.1 304 Not Modified\r\n"), "{head}");
            assert!(!head.contains("Content-Length"));
            assert!(body.is_empty());
        }

        let stale = httpdate::fmt_http_date(UNIX_EPOCH + Duration::from_secs(1_000));
        let mut resp = Response::for_request(
            Method::Get,
            "/page.html",
            headers(&[("if-modified-since", stale.as_str())]),
            false,
        );
        assert!(drain(&mut resp, &ctx).starts_with(b"HTTP/1.1 200 OK\r\n"));
    }

    #[test]
    fn missing_file_downgrades_to_404() {
        let (_dir, root) = site();
        let ctx = ctx(&root);
        let mut resp = Response::for_request(Method::Get, "/nope.html", HashMap::new(), false);
        let (head, body) = split(&drain(&mut resp, &ctx));
        assert_eq!(resp.status(), Status::NotFound);
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(head.contains("Content-Type: text/plain; charset=utf-8\r\n"));
        assert!(!head.contains("Accept-Ranges"));
        assert!(String::from_utf8(body).unwrap().starts_with("404 Not Found\n"));
    }

    #[test]
    fn method_not_allowed_lists_allow() {
        let (_dir, root) = site();
        let ctx = ctx(&root);
        let err = HttpError::method_not_allowed("POST");
        let mut resp = Response::error(&err, Method::Post, true);
        let (head, _) = split(&drain(&mut resp, &ctx));
        assert!(head.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
        assert!(head.contains("Allow: GET, HEAD\r\n"));
        assert!(head.contains("Connection: close\r\n"));
    }

    #[test]
    fn resumes_after_backpressure() {
        let (dir, root) = site();
        let ctx = ctx(&root);
        let full = fs::read(dir.path().join("data.bin")).unwrap();
        let mut resp = Response::for_request(
            Method::Get,
            "/data.bin",
            headers(&[("range", "bytes=0-6999")]),
            false,
        );
        let mut sink = Trickle {
            out: Vec::new(),
            limit: 777,
            block_next: false,
        };

        let mut calls = 0;
        while !resp.write(&ctx, &mut sink).unwrap() {
            calls += 1;
            assert!(calls < 10_000);
        }
        assert!(calls > 1);
        let (_, body) = split(&sink.out);
        assert_eq!(body, &full[..7_000]);
        assert_eq!(resp.bytes_sent(), sink.out.len() as u64);
    }

    #[test]
    fn prepare_runs_once() {
        let (dir, root) = site();
        let ctx = ctx(&root);
        let mut resp = Response::for_request(Method::Get, "/page.html", HashMap::new(), false);
        resp.prepare(&ctx);
        fs::remove_file(dir.path().join("page.html")).unwrap();
        resp.prepare(&ctx);
        assert_eq!(resp.status(), Status::Ok);
        let (_, body) = split(&drain(&mut resp, &ctx));
        assert_eq!(body, b"<h1>hi</h1>");
    }
}
