use super::{Fd, Interest, LoopError};
use mio::unix::{EventedFd, UnixReady};
use mio::{Events, PollOpt, Ready, Token};
use std::time::Duration;

/// Readiness backend behind the event loop. `prev` is the mask registered
/// before the call so implementations can decide between a fresh
/// registration and a modification.
pub trait Backend {
    fn name(&self) -> &'static str;
    fn resize(&mut self, setsize: usize) -> Result<(), LoopError>;
    fn add(&mut self, fd: Fd, prev: Interest, added: Interest) -> Result<(), LoopError>;
    fn del(&mut self, fd: Fd, prev: Interest, removed: Interest) -> Result<(), LoopError>;
    fn poll(
        &mut self,
        timeout: Option<Duration>,
        fired: &mut Vec<(Fd, Interest)>,
    ) -> Result<usize, LoopError>;
}

/// The default backend: epoll on Linux, kqueue on the BSDs, level-triggered
/// either way.
pub struct MioBackend {
    poll: mio::Poll,
    events: Events,
}

impl MioBackend {
    pub fn new(setsize: usize) -> Result<MioBackend, LoopError> {
        Ok(MioBackend {
            poll: mio::Poll::new()?,
            events: Events::with_capacity(setsize.max(64)),
        })
    }

    fn ready(mask: Interest) -> Ready {
        let mut ready = Ready::empty();
        if mask.is_readable() {
            ready |= Ready::readable();
        }
        if mask.is_writable() {
            ready |= Ready::writable();
        }
        ready
    }
}

impl Backend for MioBackend {
    fn name(&self) -> &'static str {
        if cfg!(target_os = "linux") {
            "mio(epoll)"
        } else if cfg!(any(target_os = "macos", target_os = "freebsd", target_os = "openbsd")) {
            "mio(kqueue)"
        } else {
            "mio"
        }
    }

    fn resize(&mut self, setsize: usize) -> Result<(), LoopError> {
        self.events = Events::with_capacity(setsize.max(64));
        Ok(())
    }

    fn add(&mut self, fd: Fd, prev: Interest, added: Interest) -> Result<(), LoopError> {
        let merged = prev | added;
        let raw = fd;
        if prev.is_none() {
            self.poll
                .register(&EventedFd(&raw), Token(fd as usize), Self::ready(merged), PollOpt::level())?;
        } else {
            self.poll
                .reregister(&EventedFd(&raw), Token(fd as usize), Self::ready(merged), PollOpt::level())?;
        }
        Ok(())
    }

    fn del(&mut self, fd: Fd, prev: Interest, removed: Interest) -> Result<(), LoopError> {
        let remaining = prev.remove(removed);
        let raw = fd;
        if remaining.is_none() {
            self.poll.deregister(&EventedFd(&raw))?;
        } else {
            self.poll
                .reregister(&EventedFd(&raw), Token(fd as usize), Self::ready(remaining), PollOpt::level())?;
        }
        Ok(())
    }

    fn poll(
        &mut self,
        timeout: Option<Duration>,
        fired: &mut Vec<(Fd, Interest)>,
    ) -> Result<usize, LoopError> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(_) => (),
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e.into()),
        }

        for event in &self.events {
            let ready = event.readiness();
            let mut mask = Interest::NONE;
            if ready.is_readable() {
                mask = mask | Interest::READABLE;
            }
            if ready.is_writable() {
                mask = mask | Interest::WRITABLE;
            }
            let unix = UnixReady::from(ready);
            if unix.is_hup() || unix.is_error() {
                mask = Interest::READABLE | Interest::WRITABLE;
            }
            if !mask.is_none() {
                fired.push((event.token().0 as Fd, mask));
            }
        }
        Ok(fired.len())
    }
}
