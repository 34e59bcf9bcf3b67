// src/worker.rs
//! The download reactor: one thread, one epoll instance, every plain HTTP
//! connection.

use std::io::{self, Read};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, error, info, trace, warn};

use crate::conn::Conn;
use crate::connection::{Connection, State, StateObserver};
use crate::date::DateCache;
use crate::docroot::DocRoot;
use crate::error::FerryResult;
use crate::grammar::MAX_HEADER_LINE;
use crate::inbox::Mailbox;
use crate::metrics::Metrics;
use crate::response::ServeContext;
use crate::slab::Slab;
use crate::syscalls::{
    EPOLLIN, EPOLLOUT, Epoll, Readiness, empty_event, event_flags, event_token,
};
use crate::upgrade::{Handoff, UpgradeDispatcher};

/// Token reserved for the inbound socket queue's wake pipe.
pub const MAILBOX_TOKEN: u64 = u64::MAX;
/// Upper bound on one wait, so shutdown and idle sweeps are never starved.
pub const WAIT_TIMEOUT_MS: i32 = 500;

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const RECV_WINDOW: usize = 64 * 1024;
const MAX_EVENTS: usize = 1024;
/// Most unread input discarded when closing a finished connection.
const MAX_DRAIN: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub idle_timeout: Duration,
    pub server_name: String,
    pub max_connections: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30),
            server_name: concat!("ferry/", env!("CARGO_PKG_VERSION")).to_string(),
            max_connections: 100_000,
        }
    }
}

enum Outcome {
    Keep,
    /// Every response is out; close after discarding unread input.
    Finish,
    Evict(&'static str),
    Upgrade,
}

pub struct DownloadWorker {
    root: Arc<DocRoot>,
    settings: WorkerSettings,
    mailbox: Mailbox<TcpStream>,
    dispatcher: UpgradeDispatcher,
    metrics: Arc<Metrics>,
    observer: Option<Arc<dyn StateObserver>>,
}

impl DownloadWorker {
    pub fn new(
        root: Arc<DocRoot>,
        settings: WorkerSettings,
        mailbox: Mailbox<TcpStream>,
        dispatcher: UpgradeDispatcher,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            root,
            settings,
            mailbox,
            dispatcher,
            metrics,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Option<Arc<dyn StateObserver>>) -> Self {
        self.observer = observer;
        self
    }

    /// Run until `shutdown` is set. Errors returned from here are fatal to
    /// this reactor only.
    pub fn run(self, shutdown: Arc<AtomicBool>) -> FerryResult<()> {
        let epoll = Epoll::new()?;
        epoll.add(self.mailbox.wake_fd(), MAILBOX_TOKEN, EPOLLIN)?;

        let mut conns: Slab<Conn> = Slab::new(self.settings.max_connections);
        let mut events = vec![empty_event(); MAX_EVENTS];
        // Room for one carried-over line plus one receive window.
        let mut recv_buf = vec![0u8; MAX_HEADER_LINE + RECV_WINDOW];
        let mut dates = DateCache::new();
        let mut last_sweep = Instant::now();

        info!(root = %self.root.path().display(), "download reactor entering event loop");

        // Sockets queued before the wake pipe was registered.
        self.register_queued(&epoll, &mut conns)?;

        while !shutdown.load(Ordering::Acquire) {
            let n = epoll.wait(&mut events, WAIT_TIMEOUT_MS)?;
            let now = Instant::now();
            let date = dates.refresh(SystemTime::now());

            if now.duration_since(last_sweep) >= SWEEP_INTERVAL {
                self.sweep_idle(&epoll, &mut conns, now);
                last_sweep = now;
            }

            for ev in &events[..n] {
                let token = event_token(ev);
                if token == MAILBOX_TOKEN {
                    self.register_queued(&epoll, &mut conns)?;
                    continue;
                }
                let ready = Readiness::from_flags(event_flags(ev));
                self.drive(
                    &epoll,
                    &mut conns,
                    token as usize,
                    ready,
                    &mut recv_buf,
                    date,
                    now,
                );
            }
        }

        info!(open = conns.len(), "download reactor shutting down");
        for key in conns.keys() {
            self.evict(&epoll, &mut conns, key, "shutdown");
        }
        Ok(())
    }

    fn register_queued(&self, epoll: &Epoll, conns: &mut Slab<Conn>) -> FerryResult<()> {
        let now = Instant::now();
        for stream in self.mailbox.drain()? {
            self.register(epoll, conns, stream, now);
        }
        Ok(())
    }

    fn register(&self, epoll: &Epoll, conns: &mut Slab<Conn>, stream: TcpStream, now: Instant) {
        if let Err(e) = stream.set_nonblocking(true) {
            warn!(error = %e, "dropping socket that cannot be made non-blocking");
            return;
        }
        let Some(id) = conns.vacant_key() else {
            warn!(
                limit = self.settings.max_connections,
                "connection table full, dropping socket"
            );
            return;
        };
        let http = Connection::new(id).with_observer(self.observer.clone());
        let conn = Conn::new(stream, http, now);
        let fd = conn.fd();
        let peer = conn.peer_label();
        let Some(idx) = conns.insert(conn) else {
            return;
        };
        if let Err(e) = epoll.add(fd, idx as u64, EPOLLIN) {
            warn!(%peer, error = %e, "failed to register socket");
            conns.remove(idx);
            return;
        }
        self.metrics.inc_conn();
        debug!(conn = idx, %peer, "connection registered");
    }

    #[allow(clippy::too_many_arguments)]
    fn drive(
        &self,
        epoll: &Epoll,
        conns: &mut Slab<Conn>,
        idx: usize,
        ready: Readiness,
        recv_buf: &mut [u8],
        date: &str,
        now: Instant,
    ) {
        // Events for a slot evicted earlier in the same batch.
        let Some(conn) = conns.get_mut(idx) else {
            return;
        };
        conn.last_active = now;
        match self.service(epoll, conn, idx, ready, recv_buf, date) {
            Outcome::Keep => {}
            Outcome::Finish => self.finish(epoll, conns, idx),
            Outcome::Evict(reason) => self.evict(epoll, conns, idx, reason),
            Outcome::Upgrade => self.hand_off(epoll, conns, idx),
        }
    }

    fn service(
        &self,
        epoll: &Epoll,
        conn: &mut Conn,
        idx: usize,
        ready: Readiness,
        recv_buf: &mut [u8],
        date: &str,
    ) -> Outcome {
        if ready.readable && !conn.http.is_finished() {
            loop {
                match conn.stream.read(recv_buf) {
                    Ok(0) => return Outcome::Evict("peer closed"),
                    Ok(n) => {
                        trace!(conn = idx, bytes = n, "read");
                        conn.http.feed(&recv_buf[..n]);
                        if conn.http.is_finished() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!(conn = idx, error = %e, "read failed");
                        return Outcome::Evict("read error");
                    }
                }
            }
        }

        if conn.http.has_pending_responses() {
            let ctx = ServeContext {
                root: self.root.as_ref(),
                server_name: &self.settings.server_name,
                date,
            };
            let flush = match conn.http.write_responses(&ctx, &mut conn.stream) {
                Ok(flush) => flush,
                Err(e) => {
                    debug!(conn = idx, error = %e, "write failed");
                    return Outcome::Evict("write error");
                }
            };
            self.metrics.add_bytes(flush.bytes);
            self.metrics.add_requests(flush.completed);

            let want_write = !flush.drained;
            if want_write != conn.write_interest {
                let interests = if want_write {
                    EPOLLIN | EPOLLOUT
                } else {
                    EPOLLIN
                };
                if let Err(e) = epoll.modify(conn.fd(), idx as u64, interests) {
                    warn!(conn = idx, error = %e, "failed to update interests");
                    return Outcome::Evict("epoll error");
                }
                conn.write_interest = want_write;
            }
            if !flush.drained {
                return Outcome::Keep;
            }
        }

        match conn.http.state() {
            State::Closed | State::BadRequest => Outcome::Finish,
            State::Upgrade => Outcome::Upgrade,
            _ => Outcome::Keep,
        }
    }

    fn evict(&self, epoll: &Epoll, conns: &mut Slab<Conn>, idx: usize, reason: &'static str) {
        let Some(mut conn) = conns.remove(idx) else {
            return;
        };
        // Deregister before the socket is closed by drop.
        if let Err(e) = epoll.delete(conn.fd()) {
            debug!(conn = idx, error = %e, "failed to deregister socket");
        }
        let state = conn.http.state();
        conn.http.mark_closed();
        self.metrics.dec_conn();
        debug!(conn = idx, peer = %conn.peer_label(), ?state, reason, "connection closed");
    }

    fn finish(&self, epoll: &Epoll, conns: &mut Slab<Conn>, idx: usize) {
        if let Some(conn) = conns.get_mut(idx) {
            // Closing with unread input sends RST, which can discard the
            // response before the peer reads it.
            let _ = conn.stream.shutdown(Shutdown::Write);
            let dropped = drain_unread(&mut conn.stream);
            if dropped > 0 {
                trace!(conn = idx, bytes = dropped, "discarded unread input");
            }
        }
        self.evict(epoll, conns, idx, "done");
    }

    fn hand_off(&self, epoll: &Epoll, conns: &mut Slab<Conn>, idx: usize) {
        let Some(mut conn) = conns.remove(idx) else {
            return;
        };
        if let Err(e) = epoll.delete(conn.fd()) {
            debug!(conn = idx, error = %e, "failed to deregister socket");
        }
        self.metrics.dec_conn();

        let Some(upgrade) = conn.http.take_upgrade() else {
            warn!(conn = idx, "upgrade state without a request head, closing");
            return;
        };
        let handoff = Handoff {
            stream: conn.stream,
            peer: conn.peer,
            head: upgrade.head,
            leftover: upgrade.leftover,
        };
        match self.dispatcher.dispatch(handoff) {
            Ok(target) => {
                self.metrics.inc_upgrade();
                debug!(conn = idx, target, "upgrade handed off");
            }
            Err(e) => error!(conn = idx, error = %e, "upgrade dispatch failed, socket closed"),
        }
    }

    fn sweep_idle(&self, epoll: &Epoll, conns: &mut Slab<Conn>, now: Instant) {
        for key in conns.keys() {
            let idle = conns
                .get(key)
                .is_some_and(|c| now.duration_since(c.last_active) > self.settings.idle_timeout);
            if idle {
                self.evict(epoll, conns, key, "idle timeout");
            }
        }
    }
}

/// Read and drop whatever the peer has already sent, up to `MAX_DRAIN`.
fn drain_unread(stream: &mut TcpStream) -> usize {
    let mut scratch = [0u8; 16 * 1024];
    let mut total = 0;
    while total < MAX_DRAIN {
        match stream.read(&mut scratch) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inbox::{Inbox, channel};
    use std::io::Write;
    use std::net::TcpListener;
    use std::thread::{self, JoinHandle};

    struct Harness {
        _dir: tempfile::TempDir,
        listener: TcpListener,
        inbox: Inbox<TcpStream>,
        upgrades: Mailbox<Handoff>,
        metrics: Arc<Metrics>,
        shutdown: Arc<AtomicBool>,
        thread: Option<JoinHandle<FerryResult<()>>>,
    }

    impl Harness {
        fn start(idle_timeout: Duration) -> Self {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("hello.txt"), "hello world").unwrap();
            let root = Arc::new(DocRoot::new(dir.path()).unwrap());

            let (inbox, mailbox) = channel::<TcpStream>().unwrap();
            let (ws_inbox, upgrades) = channel::<Handoff>().unwrap();
            let metrics = Arc::new(Metrics::new());
            let shutdown = Arc::new(AtomicBool::new(false));
            let settings = WorkerSettings {
                idle_timeout,
                server_name: "ferry-test".to_string(),
                max_connections: 64,
            };
            let worker = DownloadWorker::new(
                root,
                settings,
                mailbox,
                UpgradeDispatcher::new(vec![ws_inbox]),
                Arc::clone(&metrics),
            );
            let flag = Arc::clone(&shutdown);
            let thread = thread::spawn(move || worker.run(flag));

            Self {
                _dir: dir,
                listener: TcpListener::bind("127.0.0.1:0").unwrap(),
                inbox,
                upgrades,
                metrics,
                shutdown,
                thread: Some(thread),
            }
        }

        fn connect(&self) -> TcpStream {
            self.connect_after(b"")
        }

        /// Send `early` before the reactor learns about the socket, so all of
        /// it is waiting in the kernel when the first read happens.
        fn connect_after(&self, early: &[u8]) -> TcpStream {
            let mut client = TcpStream::connect(self.listener.local_addr().unwrap()).unwrap();
            socket2::SockRef::from(&client)
                .set_send_buffer_size(1024 * 1024)
                .unwrap();
            let (server, _) = self.listener.accept().unwrap();
            if !early.is_empty() {
                client.write_all(early).unwrap();
                thread::sleep(Duration::from_millis(50));
            }
            self.inbox.push(server).unwrap();
            client
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            client
        }

        fn wait_until_empty(&self) -> bool {
            for _ in 0..100 {
                if self.metrics.snapshot().active_conns == 0 {
                    return true;
                }
                thread::sleep(Duration::from_millis(20));
            }
            false
        }

        fn wait_for_upgrade(&self) -> Handoff {
            for _ in 0..100 {
                if let Some(h) = self.upgrades.drain().unwrap().into_iter().next() {
                    return h;
                }
                thread::sleep(Duration::from_millis(50));
            }
            panic!("no upgrade arrived");
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.shutdown.store(true, Ordering::Release);
            if let Some(t) = self.thread.take() {
                t.join().unwrap().unwrap();
            }
        }
    }

    fn read_to_close(stream: &mut TcpStream) -> String {
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        String::from_utf8_lossy(&out).into_owned()
    }

    #[test]
    fn serves_file_and_closes() {
        let h = Harness::start(Duration::from_secs(30));
        let mut client = h.connect();
        client
            .write_all(b"GET /hello.txt HTTP/1.0\r\n\r\n")
            .unwrap();
        let text = read_to_close(&mut client);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
        assert!(text.contains("Server: ferry-test\r\n"));
        assert!(text.ends_with("\r\n\r\nhello world"));
        assert_eq!(h.metrics.snapshot().requests, 1);
    }

    #[test]
    fn peer_close_evicts_immediately() {
        let h = Harness::start(Duration::from_secs(30));
        let mut client = h.connect();
        client.write_all(b"GET /hello").unwrap();
        client.shutdown(Shutdown::Write).unwrap();
        let text = read_to_close(&mut client);
        assert!(text.is_empty(), "{text}");
        assert!(h.wait_until_empty());
    }

    #[test]
    fn refusal_survives_unread_body() {
        let h = Harness::start(Duration::from_secs(30));
        // Larger than one receive buffer, so part of the body is never parsed.
        let mut wire = b"GET /hello.txt HTTP/1.1\r\nContent-Length: 90000\r\n\r\n".to_vec();
        wire.resize(wire.len() + 90_000, b'x');
        let mut client = h.connect_after(&wire);

        let text = read_to_close(&mut client);
        assert!(text.starts_with("HTTP/1.1 413 "), "{text}");
        assert!(text.contains("Connection: close\r\n"));
        assert!(h.wait_until_empty());
    }

    #[test]
    fn idle_connection_is_swept() {
        let h = Harness::start(Duration::from_millis(200));
        let mut client = h.connect();
        client.write_all(b"GET /hello").unwrap();
        let text = read_to_close(&mut client);
        assert!(text.is_empty());
        assert_eq!(h.metrics.snapshot().active_conns, 0);
    }

    #[test]
    fn upgrade_is_handed_off_with_leftover() {
        let h = Harness::start(Duration::from_secs(30));
        let mut client = h.connect();
        let head: &[u8] = b"GET /chat HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        let frame: &[u8] = &[0x81, 0x82, 1, 2, 3, 4, 0x69, 0x6b];
        let mut wire = head.to_vec();
        wire.extend_from_slice(frame);
        client.write_all(&wire).unwrap();

        let handoff = h.wait_for_upgrade();
        assert_eq!(handoff.head, head);
        assert_eq!(handoff.leftover, frame);
        assert_eq!(h.metrics.snapshot().upgrades, 1);
        assert_eq!(h.metrics.snapshot().active_conns, 0);
    }
}
