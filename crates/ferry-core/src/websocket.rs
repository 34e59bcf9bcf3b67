//! WebSocket reactors: each owns a subset of upgraded connections, finishes
//! their opening handshake and pumps frames to a [`WebSocketHandler`].

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};
use tungstenite::handshake::server::{NoCallback, ServerHandshake};
use tungstenite::handshake::{HandshakeError, MidHandshake};
use tungstenite::{Error as WsError, Message, WebSocket};

use crate::error::FerryResult;
use crate::inbox::Mailbox;
use crate::metrics::Metrics;
use crate::slab::Slab;
use crate::syscalls::{EPOLLIN, EPOLLOUT, Epoll, empty_event, event_token};
use crate::upgrade::Handoff;
use crate::worker::{MAILBOX_TOKEN, WAIT_TIMEOUT_MS};

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const MAX_EVENTS: usize = 256;

/// Application callbacks for upgraded connections. Called on the owning
/// reactor's thread; must not block.
pub trait WebSocketHandler: Send + Sync + 'static {
    fn on_open(&self, _peer: Option<SocketAddr>) {}

    /// Called for every text or binary message. A returned message is sent
    /// back on the same connection.
    fn on_message(&self, peer: Option<SocketAddr>, message: Message) -> Option<Message>;

    fn on_close(&self, _peer: Option<SocketAddr>) {}
}

/// Replays bytes already taken off the socket before reading from it.
///
/// Bytes passed to [`hold`](Self::hold) stay hidden until
/// [`release`](Self::release): once the prefix is used up, reads report
/// `WouldBlock` instead of reaching the socket, which would return data out
/// of order. Writes go straight to the inner stream.
pub struct PrefixedStream<S> {
    prefix: Vec<u8>,
    pos: usize,
    held: Option<Vec<u8>>,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            pos: 0,
            held: None,
            inner,
        }
    }

    /// Queue `bytes` behind the prefix, unreadable until released.
    pub fn hold(mut self, bytes: Vec<u8>) -> Self {
        self.held = Some(bytes);
        self
    }

    /// Make held bytes readable right after whatever prefix is left.
    pub fn release(&mut self) {
        let Some(held) = self.held.take() else {
            return;
        };
        if self.pos < self.prefix.len() {
            self.prefix.drain(..self.pos);
            self.prefix.extend_from_slice(&held);
        } else {
            self.prefix = held;
        }
        self.pos = 0;
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Readable prefix bytes not yet consumed.
    pub fn pending(&self) -> usize {
        self.prefix.len() - self.pos
    }
}

impl<S: Read> Read for PrefixedStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos < self.prefix.len() {
            let n = buf.len().min(self.prefix.len() - self.pos);
            buf[..n].copy_from_slice(&self.prefix[self.pos..self.pos + n]);
            self.pos += n;
            if self.pos == self.prefix.len() {
                self.prefix = Vec::new();
                self.pos = 0;
            }
            return Ok(n);
        }
        if self.held.is_some() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        self.inner.read(buf)
    }
}

impl<S: Write> Write for PrefixedStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

type Stream = PrefixedStream<TcpStream>;

enum Phase {
    Accepting(Stream),
    Handshaking(MidHandshake<ServerHandshake<Stream, NoCallback>>),
    Open(WebSocket<Stream>),
    Closed,
}

struct Session {
    fd: RawFd,
    peer: Option<SocketAddr>,
    phase: Phase,
    opened: bool,
    since: Instant,
}

pub struct WebSocketWorker {
    id: usize,
    mailbox: Mailbox<Handoff>,
    handler: Arc<dyn WebSocketHandler>,
    metrics: Arc<Metrics>,
    handshake_timeout: Duration,
    max_sessions: usize,
}

impl WebSocketWorker {
    pub fn new(
        id: usize,
        mailbox: Mailbox<Handoff>,
        handler: Arc<dyn WebSocketHandler>,
        metrics: Arc<Metrics>,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            id,
            mailbox,
            handler,
            metrics,
            handshake_timeout,
            max_sessions: 100_000,
        }
    }

    pub fn run(self, shutdown: Arc<AtomicBool>) -> FerryResult<()> {
        let epoll = Epoll::new()?;
        epoll.add(self.mailbox.wake_fd(), MAILBOX_TOKEN, EPOLLIN)?;

        let mut sessions: Slab<Session> = Slab::new(self.max_sessions);
        let mut events = vec![empty_event(); MAX_EVENTS];
        let mut last_sweep = Instant::now();

        info!(worker = self.id, "websocket reactor entering event loop");
        self.accept_queued(&epoll, &mut sessions)?;

        while !shutdown.load(Ordering::Acquire) {
            let n = epoll.wait(&mut events, WAIT_TIMEOUT_MS)?;
            let now = Instant::now();
            if now.duration_since(last_sweep) >= SWEEP_INTERVAL {
                self.sweep_handshakes(&epoll, &mut sessions, now);
                last_sweep = now;
            }

            for ev in &events[..n] {
                let token = event_token(ev);
                if token == MAILBOX_TOKEN {
                    self.accept_queued(&epoll, &mut sessions)?;
                } else {
                    self.drive(&epoll, &mut sessions, token as usize);
                }
            }
        }

        info!(worker = self.id, open = sessions.len(), "websocket reactor shutting down");
        for key in sessions.keys() {
            if let Some(Session {
                phase: Phase::Open(ws),
                ..
            }) = sessions.get_mut(key)
            {
                let _ = ws.close(None);
                let _ = ws.flush();
            }
            self.close(&epoll, &mut sessions, key, "shutdown");
        }
        Ok(())
    }

    fn accept_queued(&self, epoll: &Epoll, sessions: &mut Slab<Session>) -> FerryResult<()> {
        for handoff in self.mailbox.drain()? {
            self.register(epoll, sessions, handoff);
        }
        Ok(())
    }

    fn register(&self, epoll: &Epoll, sessions: &mut Slab<Session>, handoff: Handoff) {
        let Handoff {
            stream,
            peer,
            head,
            leftover,
        } = handoff;
        let fd = stream.as_raw_fd();
        // The handshake must see the request head alone; early frames follow
        // once it completes.
        let stream = PrefixedStream::new(head, stream).hold(leftover);
        let session = Session {
            fd,
            peer,
            phase: Phase::Accepting(stream),
            opened: false,
            since: Instant::now(),
        };
        let Some(idx) = sessions.insert(session) else {
            warn!(worker = self.id, ?peer, "websocket table full, dropping upgrade");
            return;
        };
        if let Err(e) = epoll.add(fd, idx as u64, EPOLLIN | EPOLLOUT) {
            warn!(worker = self.id, ?peer, error = %e, "failed to register websocket");
            sessions.remove(idx);
            return;
        }
        debug!(worker = self.id, session = idx, ?peer, "upgrade received");
        // Buffered bytes produce no readiness event of their own.
        self.drive(epoll, sessions, idx);
    }

    fn drive(&self, epoll: &Epoll, sessions: &mut Slab<Session>, idx: usize) {
        let Some(session) = sessions.get_mut(idx) else {
            return;
        };
        let phase = std::mem::replace(&mut session.phase, Phase::Closed);
        session.phase = match phase {
            Phase::Accepting(stream) => self.advance(idx, tungstenite::accept(stream)),
            Phase::Handshaking(mid) => self.advance(idx, mid.handshake()),
            other => other,
        };

        if !session.opened {
            if let Phase::Open(ws) = &mut session.phase {
                ws.get_mut().release();
                session.opened = true;
                self.metrics.inc_websocket();
                debug!(worker = self.id, session = idx, peer = ?session.peer, "websocket open");
                self.handler.on_open(session.peer);
            }
        }

        let alive = match &mut session.phase {
            Phase::Open(ws) => self.pump(idx, session.peer, ws),
            Phase::Closed => false,
            _ => true,
        };
        if !alive {
            self.close(epoll, sessions, idx, "closed");
        }
    }

    fn advance(
        &self,
        idx: usize,
        result: Result<WebSocket<Stream>, HandshakeError<ServerHandshake<Stream, NoCallback>>>,
    ) -> Phase {
        match result {
            Ok(ws) => Phase::Open(ws),
            Err(HandshakeError::Interrupted(mid)) => Phase::Handshaking(mid),
            Err(HandshakeError::Failure(e)) => {
                debug!(worker = self.id, session = idx, error = %e, "websocket handshake failed");
                Phase::Closed
            }
        }
    }

    /// Read every available message, answer through the handler, then flush.
    /// Returns `false` once the connection is finished.
    fn pump(&self, idx: usize, peer: Option<SocketAddr>, ws: &mut WebSocket<Stream>) -> bool {
        loop {
            match ws.read() {
                Ok(message) => {
                    if !(message.is_text() || message.is_binary()) {
                        continue;
                    }
                    trace!(worker = self.id, session = idx, len = message.len(), "message");
                    if let Some(reply) = self.handler.on_message(peer, message) {
                        match ws.write(reply) {
                            Ok(()) => {}
                            // Queued inside tungstenite; goes out with the next flush.
                            Err(WsError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {}
                            Err(e) => {
                                debug!(worker = self.id, session = idx, error = %e, "websocket write failed");
                                return false;
                            }
                        }
                    }
                }
                Err(WsError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(WsError::Io(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => return false,
                Err(e) => {
                    debug!(worker = self.id, session = idx, error = %e, "websocket read failed");
                    return false;
                }
            }
        }

        match ws.flush() {
            Ok(()) => true,
            Err(WsError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => true,
            Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => false,
            Err(e) => {
                debug!(worker = self.id, session = idx, error = %e, "websocket flush failed");
                false
            }
        }
    }

    fn close(&self, epoll: &Epoll, sessions: &mut Slab<Session>, idx: usize, reason: &'static str) {
        let Some(session) = sessions.remove(idx) else {
            return;
        };
        if let Err(e) = epoll.delete(session.fd) {
            debug!(worker = self.id, session = idx, error = %e, "failed to deregister websocket");
        }
        if session.opened {
            self.metrics.dec_websocket();
            self.handler.on_close(session.peer);
        }
        debug!(worker = self.id, session = idx, peer = ?session.peer, reason, "websocket closed");
    }

    fn sweep_handshakes(&self, epoll: &Epoll, sessions: &mut Slab<Session>, now: Instant) {
        for key in sessions.keys() {
            let stale = sessions.get(key).is_some_and(|s| {
                !s.opened && now.duration_since(s.since) > self.handshake_timeout
            });
            if stale {
                self.close(epoll, sessions, key, "handshake timeout");
            }
        }
    }
}
