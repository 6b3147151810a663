//! Single-threaded event loop. File descriptor interests and an unsorted
//! timer list are multiplexed over a pluggable readiness backend; the only
//! place the thread blocks is inside the backend poll.
//!
//! Callbacks are plain function pointers over a caller-supplied context, so
//! handlers key into their own state by fd or timer id.

pub mod backend;
pub mod select;

use crate::util;
use backend::{Backend, MioBackend};
use std::io;
use std::mem;
use std::ops::BitOr;
use std::time::Duration;

pub type Fd = std::os::unix::io::RawFd;
pub type TimerId = u64;

pub const FILE_EVENTS: u8 = 1;
pub const TIME_EVENTS: u8 = 2;
pub const ALL_EVENTS: u8 = FILE_EVENTS | TIME_EVENTS;
pub const DONT_WAIT: u8 = 4;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READABLE: Interest = Interest(1);
    pub const WRITABLE: Interest = Interest(2);

    #[inline]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn is_readable(self) -> bool {
        self.0 & Interest::READABLE.0 != 0
    }

    #[inline]
    pub fn is_writable(self) -> bool {
        self.0 & Interest::WRITABLE.0 != 0
    }

    #[inline]
    pub fn remove(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }
}

impl BitOr for Interest {
    type Output = Interest;

    #[inline]
    fn bitor(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum LoopError {
    Range,
    NotFound,
    Io(io::ErrorKind),
}

impl From<io::Error> for LoopError {
    #[inline]
    fn from(err: io::Error) -> LoopError {
        LoopError::Io(err.kind())
    }
}

/// Timer callback verdict: re-arm after the given delay or drop the timer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TimerNext {
    After(u64),
    Stop,
}

pub type FileProc<C> = fn(&mut EventLoop<C>, &mut C, Fd, Interest);
pub type TimeProc<C> = fn(&mut EventLoop<C>, &mut C, TimerId) -> TimerNext;
pub type TimeFinalizer<C> = fn(&mut EventLoop<C>, &mut C, TimerId);
pub type BeforeSleep<C> = fn(&mut EventLoop<C>, &mut C);

struct FileEvent<C> {
    mask: Interest,
    read: Option<FileProc<C>>,
    write: Option<FileProc<C>>,
}

impl<C> Copy for FileEvent<C> {}

impl<C> Clone for FileEvent<C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C> FileEvent<C> {
    const EMPTY: FileEvent<C> = FileEvent { mask: Interest::NONE, read: None, write: None };
}

struct TimeEvent<C> {
    id: TimerId,
    when_ms: u64,
    proc: TimeProc<C>,
    finalizer: Option<TimeFinalizer<C>>,
}

pub struct EventLoop<C> {
    setsize: usize,
    files: Vec<FileEvent<C>>,
    maxfd: Fd,
    timers: Vec<TimeEvent<C>>,
    next_timer_id: TimerId,
    last_poll_secs: u64,
    stopped: bool,
    backend: Box<dyn Backend>,
    fired: Vec<(Fd, Interest)>,
    before_sleep: Option<BeforeSleep<C>>,
}

impl<C> EventLoop<C> {
    pub fn new(setsize: usize) -> Result<EventLoop<C>, LoopError> {
        let backend = MioBackend::new(setsize)?;
        Ok(Self::with_backend(Box::new(backend), setsize))
    }

    pub fn with_backend(backend: Box<dyn Backend>, setsize: usize) -> EventLoop<C> {
        EventLoop {
            setsize,
            files: vec![FileEvent::EMPTY; setsize],
            maxfd: -1,
            timers: Vec::new(),
            next_timer_id: 0,
            last_poll_secs: util::now_secs(),
            stopped: false,
            backend,
            fired: Vec::new(),
            before_sleep: None,
        }
    }

    #[inline]
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    #[inline]
    pub fn setsize(&self) -> usize {
        self.setsize
    }

    /// Grows or shrinks the fd table. Fails when a registered fd would no
    /// longer fit.
    pub fn resize(&mut self, setsize: usize) -> Result<(), LoopError> {
        if self.maxfd >= setsize as Fd {
            return Err(LoopError::Range);
        }
        self.backend.resize(setsize)?;
        self.files.resize(setsize, FileEvent::EMPTY);
        self.setsize = setsize;
        Ok(())
    }

    pub fn set_before_sleep(&mut self, hook: Option<BeforeSleep<C>>) {
        self.before_sleep = hook;
    }

    #[inline]
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// Registers interest in `mask` directions for `fd`. Repeated calls
    /// merge masks; the callback is overwritten for the directions present
    /// in `mask`.
    pub fn register_file(
        &mut self,
        fd: Fd,
        mask: Interest,
        proc: FileProc<C>,
    ) -> Result<(), LoopError> {
        if fd < 0 || fd as usize >= self.setsize {
            return Err(LoopError::Range);
        }
        let prev = self.files[fd as usize].mask;
        self.backend.add(fd, prev, mask)?;

        let slot = &mut self.files[fd as usize];
        slot.mask = prev | mask;
        if mask.is_readable() {
            slot.read = Some(proc);
        }
        if mask.is_writable() {
            slot.write = Some(proc);
        }
        if fd > self.maxfd {
            self.maxfd = fd;
        }
        Ok(())
    }

    /// Clears interest in `mask` directions; the slot is freed once every
    /// direction is gone.
    pub fn unregister_file(&mut self, fd: Fd, mask: Interest) {
        if fd < 0 || fd as usize >= self.setsize {
            return;
        }
        let prev = self.files[fd as usize].mask;
        if prev.is_none() {
            return;
        }
        let _ = self.backend.del(fd, prev, mask);

        let slot = &mut self.files[fd as usize];
        slot.mask = prev.remove(mask);
        if !slot.mask.is_readable() {
            slot.read = None;
        }
        if !slot.mask.is_writable() {
            slot.write = None;
        }

        if slot.mask.is_none() && fd == self.maxfd {
            let mut new_max = -1;
            for candidate in (0..fd).rev() {
                if !self.files[candidate as usize].mask.is_none() {
                    new_max = candidate;
                    break;
                }
            }
            self.maxfd = new_max;
        }
    }

    #[inline]
    pub fn file_mask(&self, fd: Fd) -> Interest {
        if fd < 0 || fd as usize >= self.setsize {
            return Interest::NONE;
        }
        self.files[fd as usize].mask
    }

    /// Arms a timer `delay_ms` from now. Ids are monotonically increasing.
    pub fn create_timer(
        &mut self,
        delay_ms: u64,
        proc: TimeProc<C>,
        finalizer: Option<TimeFinalizer<C>>,
    ) -> TimerId {
        let id = self.next_timer_id;
        self.next_timer_id += 1;
        self.timers.push(TimeEvent {
            id,
            when_ms: util::now_ms() + delay_ms,
            proc,
            finalizer,
        });
        id
    }

    /// Removes a timer, running its finalizer.
    pub fn delete_timer(&mut self, ctx: &mut C, id: TimerId) -> Result<(), LoopError> {
        match self.timers.iter().position(|t| t.id == id) {
            Some(pos) => {
                let timer = self.timers.remove(pos);
                if let Some(finalizer) = timer.finalizer {
                    finalizer(self, ctx, id);
                }
                Ok(())
            }
            None => Err(LoopError::NotFound),
        }
    }

    #[inline]
    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    /// Loops until `stop` is called, invoking the pre-sleep hook before
    /// every iteration.
    pub fn run(&mut self, ctx: &mut C) {
        self.stopped = false;
        while !self.stopped {
            if let Some(hook) = self.before_sleep {
                hook(self, ctx);
            }
            self.process_events(ctx, ALL_EVENTS);
        }
    }

    /// A single iteration: poll the backend for at most the time until the
    /// nearest timer, dispatch ready files in registration mask order, then
    /// process due timers. Returns the number of events handled.
    pub fn process_events(&mut self, ctx: &mut C, flags: u8) -> usize {
        if flags & ALL_EVENTS == 0 {
            return 0;
        }

        let mut processed = 0;
        let wants_timers = flags & TIME_EVENTS != 0;

        if self.maxfd != -1 || (wants_timers && flags & DONT_WAIT == 0) {
            let timeout = if wants_timers && flags & DONT_WAIT == 0 {
                match self.nearest_timer_ms() {
                    Some(when) => {
                        Some(Duration::from_millis(when.saturating_sub(util::now_ms())))
                    }
                    None => None,
                }
            } else {
                Some(Duration::from_millis(0))
            };

            let mut fired = mem::take(&mut self.fired);
            fired.clear();
            if self.backend.poll(timeout, &mut fired).is_err() {
                self.fired = fired;
                return 0;
            }

            for i in 0..fired.len() {
                let (fd, ready) = fired[i];
                if fd < 0 || fd as usize >= self.files.len() {
                    continue;
                }

                let mask = self.files[fd as usize].mask;
                let read_proc = self.files[fd as usize].read;
                let mut read_fired = false;
                if mask.is_readable() && ready.is_readable() {
                    if let Some(proc) = read_proc {
                        proc(self, ctx, fd, ready);
                        read_fired = true;
                    }
                }

                // The handler may have unregistered or replaced the slot;
                // consult it again before firing the write side.
                if (fd as usize) < self.files.len() {
                    let slot = self.files[fd as usize];
                    if slot.mask.is_writable() && ready.is_writable() {
                        if let Some(proc) = slot.write {
                            if !read_fired || slot.read != Some(proc) {
                                proc(self, ctx, fd, ready);
                            }
                        }
                    }
                }
                processed += 1;
            }
            self.fired = fired;
        }

        if wants_timers {
            processed += self.process_time_events(ctx);
        }
        processed
    }

    fn nearest_timer_ms(&self) -> Option<u64> {
        self.timers.iter().map(|t| t.when_ms).min()
    }

    fn process_time_events(&mut self, ctx: &mut C) -> usize {
        let mut processed = 0;

        // A clock that moved backwards is handled by firing every timer
        // early rather than late.
        let now_secs = util::now_secs();
        if now_secs < self.last_poll_secs {
            for timer in &mut self.timers {
                timer.when_ms = 0;
            }
        }
        self.last_poll_secs = now_secs;

        // Timers created by callbacks during this pass are skipped until the
        // next pass.
        let max_id = self.next_timer_id.wrapping_sub(1);

        let mut idx = 0;
        while idx < self.timers.len() {
            let timer = &self.timers[idx];
            if timer.id > max_id {
                idx += 1;
                continue;
            }
            if timer.when_ms > util::now_ms() {
                idx += 1;
                continue;
            }

            let id = timer.id;
            let proc = timer.proc;
            match proc(self, ctx, id) {
                TimerNext::After(ms) => {
                    if let Some(t) = self.timers.iter_mut().find(|t| t.id == id) {
                        t.when_ms = util::now_ms() + ms;
                    }
                }
                TimerNext::Stop => {
                    let _ = self.delete_timer(ctx, id);
                }
            }
            processed += 1;

            // The callback may have mutated the timer list arbitrarily;
            // restart the scan from the head.
            idx = 0;
        }
        processed
    }
}

/// Blocks the calling thread until `fd` is ready for `mask` or the timeout
/// expires. Used by the synchronous deadline I/O helpers, independent of any
/// loop instance.
pub fn wait(fd: Fd, mask: Interest, timeout_ms: u64) -> io::Result<Interest> {
    let mut pfd = libc::pollfd { fd, events: 0, revents: 0 };
    if mask.is_readable() {
        pfd.events |= libc::POLLIN;
    }
    if mask.is_writable() {
        pfd.events |= libc::POLLOUT;
    }

    let retval = unsafe { libc::poll(&mut pfd, 1, timeout_ms as libc::c_int) };
    if retval < 0 {
        return Err(io::Error::last_os_error());
    }
    if retval == 0 {
        return Ok(Interest::NONE);
    }

    let mut ready = Interest::NONE;
    if pfd.revents & libc::POLLIN != 0 {
        ready = ready | Interest::READABLE;
    }
    if pfd.revents & libc::POLLOUT != 0 {
        ready = ready | Interest::WRITABLE;
    }
    if pfd.revents & (libc::POLLERR | libc::POLLHUP) != 0 {
        ready = Interest::READABLE | Interest::WRITABLE;
    }
    Ok(ready)
}

#[cfg(test)]
mod tests {
    use super::select::SelectBackend;
    use super::*;
    use std::os::unix::io::RawFd;

    struct Ctx {
        reads: Vec<Fd>,
        writes: Vec<Fd>,
        ticks: usize,
        chained: usize,
        finalized: bool,
        spawn_chained: bool,
    }

    impl Ctx {
        fn new() -> Ctx {
            Ctx {
                reads: Vec::new(),
                writes: Vec::new(),
                ticks: 0,
                chained: 0,
                finalized: false,
                spawn_chained: false,
            }
        }
    }

    fn pipe_pair() -> (RawFd, RawFd) {
        let mut fds = [0 as libc::c_int; 2];
        let rv = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rv, 0);
        (fds[0], fds[1])
    }

    fn close_fd(fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    fn write_byte(fd: RawFd) {
        let byte = [1u8];
        let rv = unsafe { libc::write(fd, byte.as_ptr() as *const libc::c_void, 1) };
        assert_eq!(rv, 1);
    }

    fn on_read(el: &mut EventLoop<Ctx>, ctx: &mut Ctx, fd: Fd, _mask: Interest) {
        let mut byte = [0u8];
        unsafe { libc::read(fd, byte.as_mut_ptr() as *mut libc::c_void, 1) };
        ctx.reads.push(fd);
        el.unregister_file(fd, Interest::READABLE);
    }

    fn on_write(el: &mut EventLoop<Ctx>, ctx: &mut Ctx, fd: Fd, _mask: Interest) {
        ctx.writes.push(fd);
        el.unregister_file(fd, Interest::WRITABLE);
    }

    fn tick(_el: &mut EventLoop<Ctx>, ctx: &mut Ctx, _id: TimerId) -> TimerNext {
        ctx.ticks += 1;
        TimerNext::Stop
    }

    fn chained_tick(_el: &mut EventLoop<Ctx>, ctx: &mut Ctx, _id: TimerId) -> TimerNext {
        ctx.chained += 1;
        TimerNext::Stop
    }

    fn spawning_tick(el: &mut EventLoop<Ctx>, ctx: &mut Ctx, _id: TimerId) -> TimerNext {
        if ctx.spawn_chained {
            ctx.spawn_chained = false;
            el.create_timer(0, chained_tick, None);
        }
        ctx.ticks += 1;
        TimerNext::Stop
    }

    fn finalize(_el: &mut EventLoop<Ctx>, ctx: &mut Ctx, _id: TimerId) {
        ctx.finalized = true;
    }

    fn never(_el: &mut EventLoop<Ctx>, _ctx: &mut Ctx, _id: TimerId) -> TimerNext {
        panic!("Timer should not have fired");
    }

    #[test]
    fn test_readable_dispatch() {
        let mut el: EventLoop<Ctx> = EventLoop::new(1024).unwrap();
        let mut ctx = Ctx::new();
        let (r, w) = pipe_pair();

        el.register_file(r, Interest::READABLE, on_read).unwrap();
        write_byte(w);

        let n = el.process_events(&mut ctx, FILE_EVENTS | DONT_WAIT);
        assert_eq!(n, 1);
        assert_eq!(ctx.reads, vec![r]);
        assert!(el.file_mask(r).is_none());

        close_fd(r);
        close_fd(w);
    }

    #[test]
    fn test_writable_dispatch() {
        let mut el: EventLoop<Ctx> = EventLoop::new(1024).unwrap();
        let mut ctx = Ctx::new();
        let (r, w) = pipe_pair();

        el.register_file(w, Interest::WRITABLE, on_write).unwrap();
        el.process_events(&mut ctx, FILE_EVENTS | DONT_WAIT);
        assert_eq!(ctx.writes, vec![w]);

        close_fd(r);
        close_fd(w);
    }

    #[test]
    fn test_select_backend_dispatch() {
        let backend = SelectBackend::new(256).unwrap();
        let mut el: EventLoop<Ctx> = EventLoop::with_backend(Box::new(backend), 256);
        let mut ctx = Ctx::new();
        let (r, w) = pipe_pair();

        el.register_file(r, Interest::READABLE, on_read).unwrap();
        write_byte(w);

        let n = el.process_events(&mut ctx, FILE_EVENTS | DONT_WAIT);
        assert_eq!(n, 1);
        assert_eq!(ctx.reads, vec![r]);

        close_fd(r);
        close_fd(w);
    }

    #[test]
    fn test_select_backend_respects_fd_setsize() {
        assert!(SelectBackend::new(libc::FD_SETSIZE + 1).is_err());
    }

    #[test]
    fn test_register_beyond_setsize_fails() {
        let mut el: EventLoop<Ctx> = EventLoop::new(8).unwrap();
        assert_eq!(
            el.register_file(9, Interest::READABLE, on_read),
            Err(LoopError::Range)
        );
    }

    #[test]
    fn test_resize_below_maxfd_fails() {
        let mut el: EventLoop<Ctx> = EventLoop::new(1024).unwrap();
        let (r, w) = pipe_pair();
        el.register_file(r, Interest::READABLE, on_read).unwrap();

        assert_eq!(el.resize(r as usize), Err(LoopError::Range));
        assert!(el.resize(r as usize + 1).is_ok());

        close_fd(r);
        close_fd(w);
    }

    #[test]
    fn test_timer_fires_and_stops() {
        let mut el: EventLoop<Ctx> = EventLoop::new(64).unwrap();
        let mut ctx = Ctx::new();
        el.create_timer(0, tick, None);

        let n = el.process_events(&mut ctx, TIME_EVENTS | DONT_WAIT);
        assert_eq!(n, 1);
        assert_eq!(ctx.ticks, 1);
        assert_eq!(el.timer_count(), 0);
    }

    #[test]
    fn test_timer_ids_monotonic() {
        let mut el: EventLoop<Ctx> = EventLoop::new(64).unwrap();
        let a = el.create_timer(1000, never, None);
        let b = el.create_timer(1000, never, None);
        assert!(b > a);
    }

    #[test]
    fn test_delete_timer_runs_finalizer() {
        let mut el: EventLoop<Ctx> = EventLoop::new(64).unwrap();
        let mut ctx = Ctx::new();
        let id = el.create_timer(1000, never, Some(finalize));

        assert!(el.delete_timer(&mut ctx, id).is_ok());
        assert!(ctx.finalized);
        assert_eq!(el.delete_timer(&mut ctx, id), Err(LoopError::NotFound));
    }

    #[test]
    fn test_timer_created_in_callback_waits_for_next_pass() {
        let mut el: EventLoop<Ctx> = EventLoop::new(64).unwrap();
        let mut ctx = Ctx::new();
        ctx.spawn_chained = true;
        el.create_timer(0, spawning_tick, None);

        el.process_events(&mut ctx, TIME_EVENTS | DONT_WAIT);
        assert_eq!(ctx.ticks, 1);
        assert_eq!(ctx.chained, 0);

        el.process_events(&mut ctx, TIME_EVENTS | DONT_WAIT);
        assert_eq!(ctx.chained, 1);
    }

    #[test]
    fn test_no_flags_is_noop() {
        let mut el: EventLoop<Ctx> = EventLoop::new(64).unwrap();
        let mut ctx = Ctx::new();
        el.create_timer(0, never, None);
        assert_eq!(el.process_events(&mut ctx, DONT_WAIT), 0);
    }

    #[test]
    fn test_wait_readable() {
        let (r, w) = pipe_pair();
        write_byte(w);
        let ready = wait(r, Interest::READABLE, 100).unwrap();
        assert!(ready.is_readable());

        close_fd(r);
        close_fd(w);
    }

    #[test]
    fn test_wait_timeout() {
        let (r, w) = pipe_pair();
        let ready = wait(r, Interest::READABLE, 10).unwrap();
        assert!(ready.is_none());

        close_fd(r);
        close_fd(w);
    }
}
