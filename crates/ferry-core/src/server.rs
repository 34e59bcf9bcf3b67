// src/server.rs
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use core_affinity::CoreId;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::connection::StateObserver;
use crate::docroot::DocRoot;
use crate::error::{FerryError, FerryResult};
use crate::inbox::{self, Inbox};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::syscalls::{EPOLLIN, Epoll, empty_event};
use crate::upgrade::UpgradeDispatcher;
use crate::websocket::{WebSocketHandler, WebSocketWorker};
use crate::worker::{DownloadWorker, WAIT_TIMEOUT_MS, WorkerSettings};

const LISTEN_BACKLOG: i32 = 1024;

pub struct Server {
    bind: String,
    doc_root: PathBuf,
    ws_workers: usize,
    settings: WorkerSettings,
    pin_cores: bool,
    metrics_interval: Duration,
    observer: Option<Arc<dyn StateObserver>>,
}

impl Server {
    pub fn bind(addr: &str) -> Self {
        Self {
            bind: addr.to_string(),
            doc_root: PathBuf::from("./web"),
            ws_workers: num_cpus::get().max(1),
            settings: WorkerSettings::default(),
            pin_cores: false,
            metrics_interval: Duration::from_secs(5),
            observer: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::bind(&config.bind)
            .doc_root(&config.doc_root)
            .ws_workers(config.ws_workers)
            .idle_timeout(config.idle_timeout())
            .server_name(&config.server_name)
            .pin_cores(config.pin_cores)
    }

    pub fn doc_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.doc_root = path.into();
        self
    }

    /// Size of the WebSocket reactor pool; at least one.
    pub fn ws_workers(mut self, workers: usize) -> Self {
        self.ws_workers = workers.max(1);
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.settings.idle_timeout = timeout;
        self
    }

    pub fn server_name(mut self, name: &str) -> Self {
        self.settings.server_name = name.to_string();
        self
    }

    pub fn max_connections(mut self, limit: usize) -> Self {
        self.settings.max_connections = limit;
        self
    }

    pub fn pin_cores(mut self, pin: bool) -> Self {
        self.pin_cores = pin;
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }

    /// Observe every connection state transition of the download reactor.
    pub fn observer(mut self, observer: Arc<dyn StateObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Bind, spawn every thread and return immediately.
    pub fn start(self, handler: Arc<dyn WebSocketHandler>) -> FerryResult<ServerHandle> {
        let root = DocRoot::new(&self.doc_root).map_err(|e| {
            FerryError::Config(format!("document root {}: {e}", self.doc_root.display()))
        })?;
        let listener = bind_listener(&self.bind)?;
        let local_addr = listener.local_addr()?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let metrics = Arc::new(Metrics::new());
        let mut threads = ThreadSet::new(Arc::clone(&shutdown));

        let core_ids = if self.pin_cores {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };
        let core_for = |slot: usize| -> Option<CoreId> {
            (!core_ids.is_empty()).then(|| core_ids[slot % core_ids.len()])
        };

        let mut ws_inboxes = Vec::with_capacity(self.ws_workers);
        for i in 0..self.ws_workers {
            let (inbox, mailbox) = inbox::channel()?;
            ws_inboxes.push(inbox);
            let worker = WebSocketWorker::new(
                i,
                mailbox,
                Arc::clone(&handler),
                Arc::clone(&metrics),
                self.settings.idle_timeout,
            );
            threads.spawn_reactor(format!("ferry-ws-{i}"), core_for(i + 1), move |flag| {
                worker.run(flag)
            })?;
        }

        let (download_inbox, download_mailbox) = inbox::channel()?;
        let download = DownloadWorker::new(
            Arc::new(root),
            self.settings,
            download_mailbox,
            UpgradeDispatcher::new(ws_inboxes),
            Arc::clone(&metrics),
        )
        .with_observer(self.observer);
        threads.spawn_reactor("ferry-download".to_string(), core_for(0), move |flag| {
            download.run(flag)
        })?;

        let acceptor_inbox = download_inbox.clone();
        threads.spawn_reactor("ferry-accept".to_string(), None, move |flag| {
            run_acceptor(listener, acceptor_inbox, flag)
        })?;

        let interval = self.metrics_interval;
        let reporter = Arc::clone(&metrics);
        threads.spawn_reactor("ferry-metrics".to_string(), None, move |flag| {
            report_metrics(&reporter, interval, &flag);
            Ok(())
        })?;

        info!(
            %local_addr,
            root = %self.doc_root.display(),
            ws_workers = self.ws_workers,
            "ferry listening"
        );

        Ok(ServerHandle {
            local_addr,
            shutdown,
            threads: threads.finish(),
            download_inbox,
            metrics,
        })
    }

    /// Start and block until shutdown.
    pub fn serve(self, handler: Arc<dyn WebSocketHandler>) -> FerryResult<()> {
        self.start(handler)?.join();
        Ok(())
    }
}

/// A running server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    download_inbox: Inbox<TcpStream>,
    metrics: Arc<Metrics>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Queue an already-connected socket on the download reactor, bypassing
    /// the listener.
    pub fn download_inbox(&self) -> Inbox<TcpStream> {
        self.download_inbox.clone()
    }

    /// Flag observed by every thread; setting it starts a graceful shutdown.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Wait for every thread to exit.
    pub fn join(self) {
        for handle in self.threads {
            if handle.join().is_err() {
                error!("server thread panicked");
            }
        }
        info!("ferry shut down");
    }

    pub fn stop(self) {
        self.shutdown();
        self.join();
    }
}

/// Threads spawned so far. If startup fails halfway the ones already running
/// are told to stop.
struct ThreadSet {
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl ThreadSet {
    fn new(shutdown: Arc<AtomicBool>) -> Self {
        Self {
            shutdown,
            handles: Vec::new(),
        }
    }

    fn spawn_reactor<F>(&mut self, name: String, core: Option<CoreId>, body: F) -> io::Result<()>
    where
        F: FnOnce(Arc<AtomicBool>) -> FerryResult<()> + Send + 'static,
    {
        let flag = Arc::clone(&self.shutdown);
        let thread_name = name.clone();
        let handle = thread::Builder::new().name(name).spawn(move || {
            if let Some(id) = core {
                if core_affinity::set_for_current(id) {
                    debug!(thread = %thread_name, core = id.id, "pinned to core");
                } else {
                    warn!(thread = %thread_name, core = id.id, "failed to pin to core");
                }
            }
            if let Err(e) = body(flag) {
                error!(thread = %thread_name, error = %e, "thread stopped on error");
            }
        })?;
        self.handles.push(handle);
        Ok(())
    }

    fn finish(mut self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut self.handles)
    }
}

impl Drop for ThreadSet {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            self.shutdown.store(true, Ordering::SeqCst);
        }
    }
}

fn bind_listener(bind: &str) -> FerryResult<TcpListener> {
    let addr = bind
        .to_socket_addrs()
        .map_err(|e| FerryError::Config(format!("bind address {bind:?}: {e}")))?
        .next()
        .ok_or_else(|| FerryError::Config(format!("bind address {bind:?} resolved to nothing")))?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

fn run_acceptor(
    listener: TcpListener,
    inbox: Inbox<TcpStream>,
    shutdown: Arc<AtomicBool>,
) -> FerryResult<()> {
    let epoll = Epoll::new()?;
    epoll.add(listener.as_raw_fd(), 0, EPOLLIN)?;
    let mut events = vec![empty_event(); 8];

    while !shutdown.load(Ordering::Acquire) {
        if epoll.wait(&mut events, WAIT_TIMEOUT_MS)? == 0 {
            continue;
        }
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    trace!(%peer, "accepted");
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(%peer, error = %e, "failed to set TCP_NODELAY");
                    }
                    inbox.push(stream)?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }
    debug!("acceptor exiting");
    Ok(())
}

fn report_metrics(metrics: &Metrics, interval: Duration, shutdown: &AtomicBool) {
    let step = Duration::from_millis(100);
    let mut waited = Duration::ZERO;
    while !shutdown.load(Ordering::Acquire) {
        thread::sleep(step);
        waited += step;
        if waited < interval {
            continue;
        }
        waited = Duration::ZERO;
        let snap = metrics.snapshot();
        debug!(
            active_conns = snap.active_conns,
            requests = snap.requests,
            bytes_sent = snap.bytes_sent,
            upgrades = snap.upgrades,
            active_websockets = snap.active_websockets,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_listener_picks_ephemeral_port() {
        let listener = bind_listener("127.0.0.1:0").unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn bad_bind_address_is_config_error() {
        assert!(matches!(
            bind_listener("not an address"),
            Err(FerryError::Config(_))
        ));
    }

    #[test]
    fn missing_doc_root_is_config_error() {
        struct Silent;
        impl WebSocketHandler for Silent {
            fn on_message(
                &self,
                _peer: Option<SocketAddr>,
                _message: tungstenite::Message,
            ) -> Option<tungstenite::Message> {
                None
            }
        }
        let result = Server::bind("127.0.0.1:0")
            .doc_root("/definitely/not/here")
            .start(Arc::new(Silent));
        assert!(matches!(result, Err(FerryError::Config(_))));
    }
}
