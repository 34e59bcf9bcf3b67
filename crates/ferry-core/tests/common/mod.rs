#![allow(dead_code)]

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ferry_core::{Message, Server, ServerHandle, StateObserver, WebSocketHandler};
use tempfile::TempDir;

pub const HELLO: &str = "hello world";

/// Sends every text and binary message straight back.
pub struct Echo;

impl WebSocketHandler for Echo {
    fn on_message(&self, _peer: Option<SocketAddr>, message: Message) -> Option<Message> {
        match message {
            Message::Text(_) | Message::Binary(_) => Some(message),
            _ => None,
        }
    }
}

/// A running server over a throwaway document root:
///
/// ```text
/// <tmp>/secret.txt          outside the root
/// <tmp>/www/hello.txt       "hello world"
/// <tmp>/www/sub/index.html
/// <tmp>/www/big.bin         1 MiB pattern
/// ```
pub struct TestServer {
    pub dir: TempDir,
    handle: Option<ServerHandle>,
}

impl TestServer {
    pub fn start() -> Self {
        Self::start_with(|server| server)
    }

    pub fn with_observer(observer: Arc<dyn StateObserver>) -> Self {
        Self::start_with(move |server| server.observer(observer))
    }

    pub fn start_with(configure: impl FnOnce(Server) -> Server) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let www = dir.path().join("www");
        std::fs::create_dir_all(www.join("sub")).unwrap();
        std::fs::write(dir.path().join("secret.txt"), "top secret").unwrap();
        std::fs::write(www.join("hello.txt"), HELLO).unwrap();
        std::fs::write(www.join("sub/index.html"), "<h1>sub</h1>").unwrap();
        std::fs::write(www.join("big.bin"), big_body()).unwrap();

        let server = Server::bind("127.0.0.1:0")
            .doc_root(&www)
            .ws_workers(2)
            .server_name("ferry-test");
        let handle = configure(server).start(Arc::new(Echo)).unwrap();
        Self {
            dir,
            handle: Some(handle),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.handle().local_addr()
    }

    pub fn handle(&self) -> &ServerHandle {
        self.handle.as_ref().unwrap()
    }

    pub fn root(&self) -> PathBuf {
        self.dir.path().join("www")
    }

    pub fn client(&self) -> Client {
        Client::connect(self.addr())
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.stop();
        }
    }
}

pub fn big_body() -> Vec<u8> {
    (0..1024 * 1024).map(|i| (i % 251) as u8).collect()
}

pub fn mtime_header(path: &Path) -> String {
    let modified = std::fs::metadata(path).unwrap().modified().unwrap();
    httpdate::fmt_http_date(modified)
}

#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Blocking client that keeps whatever it over-reads for the next call.
pub struct Client {
    pub stream: TcpStream,
    buf: Vec<u8>,
}

impl Client {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    pub fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
    }

    /// Pull more bytes off the socket. `false` on orderly close or reset.
    fn read_more(&mut self) -> bool {
        let mut chunk = [0u8; 16 * 1024];
        match self.stream.read(&mut chunk) {
            Ok(0) => false,
            Ok(n) => {
                self.buf.extend_from_slice(&chunk[..n]);
                true
            }
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => false,
            Err(e) => panic!("read failed: {e}"),
        }
    }

    /// Take exactly `n` bytes.
    pub fn take(&mut self, n: usize) -> Vec<u8> {
        while self.buf.len() < n {
            assert!(self.read_more(), "connection closed early");
        }
        self.buf.drain(..n).collect()
    }

    /// Read one response head; the body is read when `with_body` is set,
    /// using `Content-Length`.
    pub fn response(&mut self, with_body: bool) -> Response {
        let end = loop {
            if let Some(pos) = self.buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos;
            }
            assert!(self.read_more(), "connection closed before a full response head");
        };
        let head: Vec<u8> = self.buf.drain(..end + 4).collect();
        let head = String::from_utf8(head).unwrap();
        let mut lines = head.split("\r\n");
        let status = lines
            .next()
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|s| s.parse().ok())
            .unwrap();
        let headers: Vec<(String, String)> = lines
            .filter(|l| !l.is_empty())
            .filter_map(|l| l.split_once(':'))
            .map(|(k, v)| (k.to_string(), v.trim().to_string()))
            .collect();

        let mut response = Response {
            status,
            headers,
            body: Vec::new(),
        };
        if with_body {
            let len: usize = response
                .header("content-length")
                .map(|v| v.parse().unwrap())
                .unwrap_or(0);
            response.body = self.take(len);
        }
        response
    }

    /// The server closed the connection with nothing left unread.
    pub fn closed(&mut self) -> bool {
        self.buf.is_empty() && !self.read_more()
    }
}
