use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use ferry_core::{Config, Message, Server, WebSocketHandler, logging};
use mimalloc::MiMalloc;
use tracing::{debug, info};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Sends every text and binary message straight back.
struct Echo;

impl WebSocketHandler for Echo {
    fn on_open(&self, peer: Option<SocketAddr>) {
        debug!(?peer, "echo session opened");
    }

    fn on_message(&self, _peer: Option<SocketAddr>, message: Message) -> Option<Message> {
        match message {
            Message::Text(_) | Message::Binary(_) => Some(message),
            _ => None,
        }
    }

    fn on_close(&self, peer: Option<SocketAddr>) {
        debug!(?peer, "echo session closed");
    }
}

fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    logging::init_from_config(&config);

    let handle = Server::from_config(&config).start(Arc::new(Echo))?;
    info!(addr = %handle.local_addr(), "press Ctrl-C to stop");

    let shutdown = handle.shutdown_flag();
    ctrlc::set_handler(move || {
        info!("received SIGINT, shutting down");
        shutdown.store(true, Ordering::SeqCst);
    })?;

    handle.join();
    Ok(())
}
