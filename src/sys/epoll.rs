use std::cmp;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLPRI, EPOLLRDHUP};

use crate::poller::{Event, WAKE_FD};

use super::eventfd::EventFd;

const READ_EVENTS: u32 = (EPOLLIN | EPOLLPRI) as u32;
const WRITE_EVENTS: u32 = EPOLLOUT as u32;

/// The Linux readiness backend: one epoll instance plus an eventfd
/// registered for readable events as the wake channel.
pub struct Selector {
    epfd: RawFd,
    event_fd: EventFd,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        let epfd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        let event_fd = match EventFd::new() {
            Ok(event_fd) => event_fd,
            Err(e) => {
                let _ = syscall!(close(epfd));
                return Err(e);
            }
        };

        let selector = Selector { epfd, event_fd };
        selector.ctl(libc::EPOLL_CTL_ADD, selector.event_fd.as_raw_fd(), READ_EVENTS)?;

        Ok(selector)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events,
            u64: fd as u64,
        };

        syscall!(epoll_ctl(self.epfd, op, fd, &mut info))?;
        Ok(())
    }

    pub fn add_read(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, READ_EVENTS)
    }

    pub fn enable_read(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, READ_EVENTS)
    }

    pub fn enable_read_write(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, READ_EVENTS | WRITE_EVENTS)
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let mut info = libc::epoll_event { events: 0, u64: 0 };
        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut info))?;
        Ok(())
    }

    pub fn wake(&self) -> io::Result<()> {
        match self.event_fd.write(1) {
            Ok(_) => Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Drains the marker so a fresh `wake` becomes observable again.
    pub fn drain_wake(&self) {
        match self.event_fd.read() {
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => log::error!("drain wake eventfd: {}", e),
        }
    }

    pub fn events(&self, capacity: usize) -> Events {
        Events {
            events: Vec::with_capacity(capacity),
            wake_fd: self.event_fd.as_raw_fd(),
        }
    }

    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout = timeout
            .map(|to| cmp::min(to.as_millis(), libc::c_int::MAX as u128) as libc::c_int)
            .unwrap_or(-1);

        events.events.clear();
        let cnt = syscall!(epoll_wait(
            self.epfd,
            events.events.as_mut_ptr(),
            events.events.capacity() as i32,
            timeout
        ))?;

        unsafe { events.events.set_len(cnt as usize) };

        Ok(cnt as usize)
    }
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.epfd);
        }
    }
}

pub struct Events {
    events: Vec<libc::epoll_event>,
    wake_fd: RawFd,
}

impl Events {
    #[inline]
    pub fn capacity(&self) -> usize {
        self.events.capacity()
    }

    /// Doubles the event buffer after a full batch, the cheap way to keep
    /// up with bursts without sizing for the worst case up front.
    pub fn grow(&mut self) {
        let cap = self.events.capacity();
        self.events = Vec::with_capacity(cap * 2);
    }

    /// Returns the event at `idx` as `(fd, readiness)`. The wake channel is
    /// reported as `(WAKE_FD, empty)`.
    #[inline]
    pub fn get(&self, idx: usize) -> Option<(RawFd, Event)> {
        self.events.get(idx).map(|raw| {
            let fd = raw.u64 as RawFd;
            if fd == self.wake_fd {
                return (WAKE_FD, Event::empty());
            }

            let bits = raw.events as libc::c_int;
            let mut kind = Event::empty();

            if (bits & EPOLLHUP) != 0 && (bits & EPOLLIN) == 0 {
                kind.insert(Event::error());
            }
            if (bits & EPOLLERR) != 0 || (bits & EPOLLOUT) != 0 {
                kind.insert(Event::writable());
            }
            if (bits & (EPOLLIN | EPOLLPRI | EPOLLRDHUP)) != 0 {
                kind.insert(Event::readable());
            }

            (fd, kind)
        })
    }
}
