// src/conn.rs
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Instant;

use crate::connection::Connection;

/// A socket registered with the download reactor, plus its HTTP state.
pub struct Conn {
    pub stream: TcpStream,
    pub peer: Option<SocketAddr>,
    pub http: Connection,
    pub write_interest: bool,
    pub last_active: Instant,
}

impl Conn {
    pub fn new(stream: TcpStream, http: Connection, now: Instant) -> Self {
        let peer = stream.peer_addr().ok();
        Self {
            stream,
            peer,
            http,
            write_interest: false,
            last_active: now,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Printable remote address for log lines.
    pub fn peer_label(&self) -> String {
        self.peer
            .map(|p| p.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}
