use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr;
use std::time::Duration;

use crate::poller::{Event, WAKE_FD};
use crate::sync::SpinLock;

// EVFILT_USER ident for the wake channel. Casting to RawFd yields -1, which
// can never collide with a real descriptor.
const WAKE_IDENT: libc::uintptr_t = libc::uintptr_t::MAX;

/// The BSD/macOS readiness backend: a kqueue with an EVFILT_USER wake
/// channel. kevent has no modify operation, so the currently-registered
/// filter set is tracked per descriptor and every interest change is issued
/// as an add/delete delta.
pub struct Selector {
    kq: RawFd,
    // fd -> write filter currently registered (read is always on)
    interests: SpinLock<HashMap<RawFd, bool>>,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        let kq = syscall!(kqueue())?;

        if let Err(e) = syscall!(fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC)) {
            let _ = syscall!(close(kq));
            return Err(e);
        }

        let selector = Selector {
            kq,
            interests: SpinLock::new(HashMap::new()),
        };

        selector.apply(&[kevent(
            WAKE_IDENT,
            libc::EVFILT_USER,
            libc::EV_ADD | libc::EV_CLEAR,
            0,
        )])?;

        Ok(selector)
    }

    fn apply(&self, changes: &[libc::kevent]) -> io::Result<()> {
        syscall!(kevent(
            self.kq,
            changes.as_ptr(),
            changes.len() as libc::c_int,
            ptr::null_mut(),
            0,
            ptr::null()
        ))
        .map(|_| ())
    }

    pub fn add_read(&self, fd: RawFd) -> io::Result<()> {
        self.apply(&[kevent(
            fd as libc::uintptr_t,
            libc::EVFILT_READ,
            libc::EV_ADD,
            0,
        )])?;
        self.interests.lock().insert(fd, false);
        Ok(())
    }

    pub fn enable_read(&self, fd: RawFd) -> io::Result<()> {
        let mut interests = self.interests.lock();
        if interests.get(&fd).copied().unwrap_or(false) {
            self.apply(&[kevent(
                fd as libc::uintptr_t,
                libc::EVFILT_WRITE,
                libc::EV_DELETE,
                0,
            )])?;
            interests.insert(fd, false);
        }
        Ok(())
    }

    pub fn enable_read_write(&self, fd: RawFd) -> io::Result<()> {
        let mut interests = self.interests.lock();
        if !interests.get(&fd).copied().unwrap_or(false) {
            self.apply(&[kevent(
                fd as libc::uintptr_t,
                libc::EVFILT_WRITE,
                libc::EV_ADD,
                0,
            )])?;
            interests.insert(fd, true);
        }
        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let write_on = self.interests.lock().remove(&fd).unwrap_or(false);

        if write_on {
            // One kevent call per filter: a dead write filter must not keep
            // the read delete from going through.
            let _ = self.apply(&[kevent(
                fd as libc::uintptr_t,
                libc::EVFILT_WRITE,
                libc::EV_DELETE,
                0,
            )]);
        }
        self.apply(&[kevent(
            fd as libc::uintptr_t,
            libc::EVFILT_READ,
            libc::EV_DELETE,
            0,
        )])
    }

    pub fn wake(&self) -> io::Result<()> {
        self.apply(&[kevent(WAKE_IDENT, libc::EVFILT_USER, 0, libc::NOTE_TRIGGER)])
    }

    /// EV_CLEAR resets the user filter when the event is retrieved; there is
    /// no marker to drain.
    pub fn drain_wake(&self) {}

    pub fn events(&self, capacity: usize) -> Events {
        Events {
            events: Vec::with_capacity(capacity),
        }
    }

    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        let timespec = timeout.map(|to| libc::timespec {
            tv_sec: to.as_secs() as libc::time_t,
            tv_nsec: to.subsec_nanos() as libc::c_long,
        });
        let timespec_ptr = timespec
            .as_ref()
            .map(|ts| ts as *const libc::timespec)
            .unwrap_or(ptr::null());

        events.events.clear();
        let cnt = syscall!(kevent(
            self.kq,
            ptr::null(),
            0,
            events.events.as_mut_ptr(),
            events.events.capacity() as libc::c_int,
            timespec_ptr
        ))?;

        unsafe { events.events.set_len(cnt as usize) };

        Ok(cnt as usize)
    }
}

fn kevent(ident: libc::uintptr_t, filter: i16, flags: u16, fflags: u32) -> libc::kevent {
    libc::kevent {
        ident,
        filter,
        flags,
        fflags,
        data: 0,
        udata: ptr::null_mut(),
    }
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.kq
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.kq);
        }
    }
}

pub struct Events {
    events: Vec<libc::kevent>,
}

impl Events {
    #[inline]
    pub fn capacity(&self) -> usize {
        self.events.capacity()
    }

    pub fn grow(&mut self) {
        let cap = self.events.capacity();
        self.events = Vec::with_capacity(cap * 2);
    }

    /// Returns the event at `idx` as `(fd, readiness)`. The wake channel is
    /// reported as `(WAKE_FD, empty)`.
    #[inline]
    pub fn get(&self, idx: usize) -> Option<(RawFd, Event)> {
        self.events.get(idx).map(|raw| {
            if raw.ident == WAKE_IDENT {
                return (WAKE_FD, Event::empty());
            }

            let mut kind = Event::empty();

            if (raw.flags & libc::EV_ERROR) != 0 || (raw.flags & libc::EV_EOF) != 0 {
                kind.insert(Event::error());
            }
            if raw.filter == libc::EVFILT_WRITE {
                kind.insert(Event::writable());
            }
            if raw.filter == libc::EVFILT_READ {
                kind.insert(Event::readable());
            }

            (raw.ident as RawFd, kind)
        })
    }
}
