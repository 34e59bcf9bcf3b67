//! Hand-off of upgrading connections from the download reactor to the
//! WebSocket pool.

use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use crate::error::{FerryError, FerryResult};
use crate::inbox::Inbox;

/// An upgrading connection, removed from the download reactor.
///
/// `head` is the verbatim request head; `leftover` is whatever the client
/// sent after it, byte-exact.
#[derive(Debug)]
pub struct Handoff {
    pub stream: TcpStream,
    pub peer: Option<SocketAddr>,
    pub head: Vec<u8>,
    pub leftover: Vec<u8>,
}

/// Assigns handoffs to WebSocket reactors round-robin.
#[derive(Clone)]
pub struct UpgradeDispatcher {
    targets: Arc<[Inbox<Handoff>]>,
    next: Arc<AtomicUsize>,
}

impl UpgradeDispatcher {
    pub fn new(targets: Vec<Inbox<Handoff>>) -> Self {
        Self {
            targets: targets.into(),
            next: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Queue `handoff` on the next reactor and wake it. Returns the index of
    /// the chosen reactor. On error the socket is dropped, closing it.
    pub fn dispatch(&self, handoff: Handoff) -> FerryResult<usize> {
        if self.targets.is_empty() {
            return Err(FerryError::QueueClosed);
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.targets.len();
        debug!(
            peer = ?handoff.peer,
            target = index,
            leftover = handoff.leftover.len(),
            "dispatching upgrade"
        );
        self.targets[index].push(handoff)?;
        Ok(index)
    }
}
