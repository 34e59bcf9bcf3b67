//! Cross-thread hand-off queue into a reactor.
//!
//! Producers on any thread push and then wake the reactor through a
//! self-pipe; the owning reactor alone registers the pipe and drains the
//! queue.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};

use crate::error::{FerryError, FerryResult};
use crate::syscalls::{create_pipe, drain_pipe, wake_pipe};

/// Producer half; cheap to clone and `Send`.
pub struct Inbox<T> {
    tx: Sender<T>,
    waker: Arc<OwnedFd>,
}

impl<T> Clone for Inbox<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            waker: Arc::clone(&self.waker),
        }
    }
}

/// Consumer half, owned by exactly one reactor.
pub struct Mailbox<T> {
    rx: Receiver<T>,
    wake_read: OwnedFd,
}

pub fn channel<T>() -> FerryResult<(Inbox<T>, Mailbox<T>)> {
    let (read, write) = create_pipe()?;
    let (tx, rx) = mpsc::channel();
    Ok((
        Inbox {
            tx,
            waker: Arc::new(write),
        },
        Mailbox {
            rx,
            wake_read: read,
        },
    ))
}

impl<T> Inbox<T> {
    /// Enqueue an item and wake the owning reactor.
    pub fn push(&self, item: T) -> FerryResult<()> {
        self.tx.send(item).map_err(|_| FerryError::QueueClosed)?;
        wake_pipe(&self.waker)?;
        Ok(())
    }
}

impl<T> Mailbox<T> {
    /// Descriptor to register for readability.
    pub fn wake_fd(&self) -> RawFd {
        self.wake_read.as_raw_fd()
    }

    /// Clear pending wake-ups and take everything queued so far.
    pub fn drain(&self) -> FerryResult<Vec<T>> {
        drain_pipe(&self.wake_read)?;
        let mut items = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(item) => items.push(item),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn items_cross_threads_in_order() {
        let (inbox, mailbox) = channel::<u32>().unwrap();
        let producer = inbox.clone();
        thread::spawn(move || {
            for i in 0..100 {
                producer.push(i).unwrap();
            }
        })
        .join()
        .unwrap();

        let items = mailbox.drain().unwrap();
        assert_eq!(items, (0..100).collect::<Vec<_>>());
        assert!(mailbox.drain().unwrap().is_empty());
    }

    #[test]
    fn push_after_mailbox_dropped_fails() {
        let (inbox, mailbox) = channel::<u32>().unwrap();
        drop(mailbox);
        assert!(matches!(inbox.push(1), Err(FerryError::QueueClosed)));
    }
}
