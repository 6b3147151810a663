//! `select(2)` fallback backend. Portable everywhere but capped at
//! `FD_SETSIZE` descriptors.

use super::backend::Backend;
use super::{Fd, Interest, LoopError};
use std::io;
use std::time::Duration;

pub struct SelectBackend {
    masks: Vec<Interest>,
}

impl SelectBackend {
    pub fn new(setsize: usize) -> Result<SelectBackend, LoopError> {
        if setsize > libc::FD_SETSIZE {
            return Err(LoopError::Range);
        }
        Ok(SelectBackend { masks: vec![Interest::NONE; setsize] })
    }
}

impl Backend for SelectBackend {
    fn name(&self) -> &'static str {
        "select"
    }

    fn resize(&mut self, setsize: usize) -> Result<(), LoopError> {
        if setsize > libc::FD_SETSIZE {
            return Err(LoopError::Range);
        }
        self.masks.resize(setsize, Interest::NONE);
        Ok(())
    }

    fn add(&mut self, fd: Fd, prev: Interest, added: Interest) -> Result<(), LoopError> {
        let slot = self
            .masks
            .get_mut(fd as usize)
            .ok_or(LoopError::Range)?;
        *slot = prev | added;
        Ok(())
    }

    fn del(&mut self, fd: Fd, prev: Interest, removed: Interest) -> Result<(), LoopError> {
        let slot = self
            .masks
            .get_mut(fd as usize)
            .ok_or(LoopError::Range)?;
        *slot = prev.remove(removed);
        Ok(())
    }

    fn poll(
        &mut self,
        timeout: Option<Duration>,
        fired: &mut Vec<(Fd, Interest)>,
    ) -> Result<usize, LoopError> {
        let mut rfds: libc::fd_set = unsafe { std::mem::zeroed() };
        let mut wfds: libc::fd_set = unsafe { std::mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut rfds);
            libc::FD_ZERO(&mut wfds);
        }

        let mut maxfd: Fd = -1;
        for (fd, mask) in self.masks.iter().enumerate() {
            if mask.is_none() {
                continue;
            }
            let fd = fd as Fd;
            unsafe {
                if mask.is_readable() {
                    libc::FD_SET(fd, &mut rfds);
                }
                if mask.is_writable() {
                    libc::FD_SET(fd, &mut wfds);
                }
            }
            maxfd = maxfd.max(fd);
        }

        let mut tv;
        let tv_ptr = match timeout {
            Some(d) => {
                tv = libc::timeval {
                    tv_sec: d.as_secs() as libc::time_t,
                    tv_usec: libc::suseconds_t::from(d.subsec_micros() as i32),
                };
                &mut tv as *mut libc::timeval
            }
            None => std::ptr::null_mut(),
        };

        let retval = unsafe {
            libc::select(maxfd + 1, &mut rfds, &mut wfds, std::ptr::null_mut(), tv_ptr)
        };
        if retval < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err.into());
        }
        if retval == 0 {
            return Ok(0);
        }

        for (fd, mask) in self.masks.iter().enumerate() {
            if mask.is_none() {
                continue;
            }
            let fd = fd as Fd;
            let mut ready = Interest::NONE;
            unsafe {
                if mask.is_readable() && libc::FD_ISSET(fd, &rfds) {
                    ready = ready | Interest::READABLE;
                }
                if mask.is_writable() && libc::FD_ISSET(fd, &wfds) {
                    ready = ready | Interest::WRITABLE;
                }
            }
            if !ready.is_none() {
                fired.push((fd, ready));
            }
        }
        Ok(fired.len())
    }
}
