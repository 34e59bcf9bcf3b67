// src/syscalls.rs
//! Thin readiness layer over epoll (Linux) and kqueue (macOS), plus the
//! self-pipe used to wake a reactor from another thread.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use libc::{c_int, c_void};

use crate::error::FerryResult;

// ---- Epoll Operations (Linux Only) ----

#[cfg(target_os = "linux")]
pub use linux_epoll::*;

#[cfg(target_os = "linux")]
mod linux_epoll {
    use super::*;
    use libc::EPOLLET;
    pub use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, epoll_event};

    pub struct Epoll {
        pub fd: c_int,
    }

    impl Epoll {
        pub fn new() -> FerryResult<Self> {
            unsafe {
                let fd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
                if fd < 0 {
                    return Err(io::Error::last_os_error().into());
                }
                Ok(Self { fd })
            }
        }

        /// Register a descriptor, edge triggered.
        pub fn add(&self, fd: RawFd, token: u64, interests: i32) -> FerryResult<()> {
            self.ctl(libc::EPOLL_CTL_ADD, fd, token, interests)
        }

        pub fn modify(&self, fd: RawFd, token: u64, interests: i32) -> FerryResult<()> {
            self.ctl(libc::EPOLL_CTL_MOD, fd, token, interests)
        }

        fn ctl(&self, op: c_int, fd: RawFd, token: u64, interests: i32) -> FerryResult<()> {
            let mut event = epoll_event {
                events: (interests | EPOLLET) as u32,
                u64: token,
            };
            unsafe {
                if libc::epoll_ctl(self.fd, op, fd, &mut event) < 0 {
                    return Err(io::Error::last_os_error().into());
                }
            }
            Ok(())
        }

        pub fn delete(&self, fd: RawFd) -> FerryResult<()> {
            unsafe {
                if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() != Some(libc::ENOENT) {
                        return Err(err.into());
                    }
                }
            }
            Ok(())
        }

        /// Wait up to `timeout_ms`. An interrupted wait reports zero events.
        pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> FerryResult<usize> {
            unsafe {
                let res = libc::epoll_wait(
                    self.fd,
                    events.as_mut_ptr(),
                    events.len() as c_int,
                    timeout_ms,
                );
                if res < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        return Ok(0);
                    }
                    return Err(err.into());
                }
                Ok(res as usize)
            }
        }
    }

    impl Drop for Epoll {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }

    pub fn event_token(ev: &epoll_event) -> u64 {
        ev.u64
    }

    pub fn event_flags(ev: &epoll_event) -> u32 {
        ev.events
    }

    pub fn empty_event() -> epoll_event {
        epoll_event { events: 0, u64: 0 }
    }
}

// ---- Epoll/Kqueue Fallback for MacOS development ----
#[cfg(target_os = "macos")]
pub use macos_epoll::*;

#[cfg(target_os = "macos")]
mod macos_epoll {
    use super::*;
    use libc::{EV_ADD, EV_CLEAR, EV_DELETE, EV_ENABLE, EV_EOF, EVFILT_READ, EVFILT_WRITE, kevent, kqueue, timespec};
    use std::ptr;

    #[allow(non_camel_case_types)]
    #[derive(Clone, Copy)]
    pub struct epoll_event {
        pub events: u32,
        pub u64: u64,
    }

    pub const EPOLLIN: i32 = 1;
    pub const EPOLLOUT: i32 = 4;
    pub const EPOLLERR: i32 = 8;
    pub const EPOLLHUP: i32 = 16;

    pub struct Epoll {
        pub fd: c_int,
    }

    impl Epoll {
        pub fn new() -> FerryResult<Self> {
            unsafe {
                let fd = kqueue();
                if fd < 0 {
                    return Err(io::Error::last_os_error().into());
                }
                Ok(Self { fd })
            }
        }

        pub fn add(&self, fd: RawFd, token: u64, interests: i32) -> FerryResult<()> {
            self.modify(fd, token, interests)
        }

        /// Enable the filters in `interests` and drop the others.
        pub fn modify(&self, fd: RawFd, token: u64, interests: i32) -> FerryResult<()> {
            if interests & EPOLLIN != 0 {
                self.change(fd, token, EVFILT_READ, EV_ADD | EV_ENABLE | EV_CLEAR)?;
            } else {
                let _ = self.change(fd, token, EVFILT_READ, EV_DELETE);
            }
            if interests & EPOLLOUT != 0 {
                self.change(fd, token, EVFILT_WRITE, EV_ADD | EV_ENABLE | EV_CLEAR)?;
            } else {
                let _ = self.change(fd, token, EVFILT_WRITE, EV_DELETE);
            }
            Ok(())
        }

        pub fn delete(&self, fd: RawFd) -> FerryResult<()> {
            let _ = self.change(fd, 0, EVFILT_READ, EV_DELETE);
            let _ = self.change(fd, 0, EVFILT_WRITE, EV_DELETE);
            Ok(())
        }

        fn change(&self, fd: RawFd, token: u64, filter: i16, action: u16) -> FerryResult<()> {
            let change = kevent {
                ident: fd as usize,
                filter,
                flags: action,
                fflags: 0,
                data: 0,
                udata: token as *mut c_void,
            };
            unsafe {
                let res = libc::kevent(self.fd, &change, 1, ptr::null_mut(), 0, ptr::null());
                if res < 0 {
                    return Err(io::Error::last_os_error().into());
                }
            }
            Ok(())
        }

        pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> FerryResult<usize> {
            const MAX_BATCH: usize = 128;
            let mut kevents = [unsafe { std::mem::zeroed::<kevent>() }; MAX_BATCH];
            let batch_size = events.len().min(MAX_BATCH);

            let ts = timespec {
                tv_sec: (timeout_ms / 1000) as libc::time_t,
                tv_nsec: ((timeout_ms % 1000) * 1_000_000) as libc::c_long,
            };

            unsafe {
                let res = libc::kevent(
                    self.fd,
                    ptr::null(),
                    0,
                    kevents.as_mut_ptr(),
                    batch_size as c_int,
                    &ts,
                );
                if res < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        return Ok(0);
                    }
                    return Err(err.into());
                }

                let n = res as usize;
                for i in 0..n {
                    let mut ep_ev = 0;
                    if kevents[i].filter == EVFILT_READ {
                        ep_ev |= EPOLLIN;
                    }
                    if kevents[i].filter == EVFILT_WRITE {
                        ep_ev |= EPOLLOUT;
                    }
                    if kevents[i].flags & EV_EOF != 0 {
                        ep_ev |= EPOLLHUP;
                    }
                    events[i] = epoll_event {
                        events: ep_ev as u32,
                        u64: kevents[i].udata as u64,
                    };
                }
                Ok(n)
            }
        }
    }

    impl Drop for Epoll {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }

    pub fn event_token(ev: &epoll_event) -> u64 {
        ev.u64
    }

    pub fn event_flags(ev: &epoll_event) -> u32 {
        ev.events
    }

    pub fn empty_event() -> epoll_event {
        epoll_event { events: 0, u64: 0 }
    }
}

/// Readiness bits decoded from one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

impl Readiness {
    pub fn from_flags(flags: u32) -> Self {
        let read_mask = (EPOLLIN | EPOLLERR | EPOLLHUP) as u32;
        Self {
            readable: flags & read_mask != 0,
            writable: flags & EPOLLOUT as u32 != 0,
        }
    }
}

// ---- Wake Pipe Operations ----

fn set_nonblocking(fd: c_int) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd_flags = libc::fcntl(fd, libc::F_GETFD, 0);
        if fd_flags < 0 || libc::fcntl(fd, libc::F_SETFD, fd_flags | libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Create a Unix pipe with both ends non-blocking. Returns (read, write).
pub fn create_pipe() -> FerryResult<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        if libc::pipe(fds.as_mut_ptr()) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    // Ownership first, so both ends close on the error path.
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    set_nonblocking(read.as_raw_fd())?;
    set_nonblocking(write.as_raw_fd())?;
    Ok((read, write))
}

/// Post one wake-up byte. A full pipe already guarantees a pending wake-up.
pub fn wake_pipe(write: &OwnedFd) -> io::Result<()> {
    let byte = [1u8];
    loop {
        let n = unsafe { libc::write(write.as_raw_fd(), byte.as_ptr() as *const c_void, 1) };
        if n >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            io::ErrorKind::WouldBlock => return Ok(()),
            _ => return Err(err),
        }
    }
}

/// Swallow every pending wake-up byte.
pub fn drain_pipe(read: &OwnedFd) -> io::Result<()> {
    let mut buf = [0u8; 64];
    loop {
        let n = unsafe {
            libc::read(
                read.as_raw_fd(),
                buf.as_mut_ptr() as *mut c_void,
                buf.len(),
            )
        };
        if n > 0 {
            continue;
        }
        if n == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            io::ErrorKind::WouldBlock => return Ok(()),
            _ => return Err(err),
        }
    }
}
