use std::fmt;
use std::io;
use std::ops;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use log::error;

use crate::error::{Error, Result};
use crate::sys;

/// Synthetic descriptor delivered to the poll handler for the wake channel.
/// It is reported exactly once per batch no matter how many `wake` calls
/// landed while the loop was away.
pub const WAKE_FD: RawFd = -1;

const WAIT_EVENTS_BEGIN: usize = 1024;

/// A set of readiness events reported for one descriptor.
///
/// `error` covers both local socket errors and remote hangup; the event
/// loop treats it as a close signal.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Event(u32);

const READABLE: u32 = 0x1;
const WRITABLE: u32 = 0x2;
const ERROR: u32 = 0x80;

impl Event {
    #[inline]
    pub fn empty() -> Event {
        Event(0)
    }

    #[inline]
    pub fn readable() -> Event {
        Event(READABLE)
    }

    #[inline]
    pub fn writable() -> Event {
        Event(WRITABLE)
    }

    #[inline]
    pub fn error() -> Event {
        Event(ERROR)
    }

    #[inline]
    pub fn is_readable(&self) -> bool {
        self.contains(Event::readable())
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.contains(Event::writable())
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.contains(Event::error())
    }

    #[inline]
    pub fn contains(&self, other: Event) -> bool {
        (*self & other) == other
    }

    #[inline]
    pub fn insert(&mut self, other: Event) {
        self.0 |= other.0;
    }
}

impl ops::BitOr for Event {
    type Output = Event;

    #[inline]
    fn bitor(self, other: Event) -> Event {
        Event(self.0 | other.0)
    }
}

impl ops::BitAnd for Event {
    type Output = Event;

    #[inline]
    fn bitand(self, other: Event) -> Event {
        Event(self.0 & other.0)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let mut one = false;
        let flags = [
            (Event::readable(), "Readable"),
            (Event::writable(), "Writable"),
            (Event::error(), "Error"),
        ];

        write!(fmt, "Event {{")?;

        for (flag, msg) in flags {
            if self.contains(flag) {
                if one {
                    write!(fmt, " | ")?;
                }
                write!(fmt, "{}", msg)?;

                one = true;
            }
        }

        write!(fmt, "}}")?;

        Ok(())
    }
}

/// Wraps the OS readiness multiplexer (epoll on Linux, kqueue elsewhere)
/// together with its wake channel.
///
/// Interest management uses the named operations the event loop needs:
/// every registered descriptor keeps readable interest for its whole life,
/// and writable interest is toggled around a non-empty out-buffer.
pub struct Poller {
    selector: sys::Selector,
    running: AtomicBool,
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        Ok(Poller {
            selector: sys::Selector::new()?,
            running: AtomicBool::new(false),
        })
    }

    /// Registers `fd` with readable interest.
    pub fn add_read(&self, fd: RawFd) -> io::Result<()> {
        self.selector.add_read(fd)
    }

    /// Drops writable interest, leaving readable.
    pub fn enable_read(&self, fd: RawFd) -> io::Result<()> {
        self.selector.enable_read(fd)
    }

    pub fn enable_read_write(&self, fd: RawFd) -> io::Result<()> {
        self.selector.enable_read_write(fd)
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.selector.delete(fd)
    }

    /// Unblocks the current or next `poll` iteration. Callable from any
    /// thread.
    pub fn wake(&self) -> io::Result<()> {
        self.selector.wake()
    }

    /// Requests the poll loop to exit and wakes it once. Closing twice is
    /// an error.
    pub fn close(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Err(Error::PollerClosed);
        }

        self.wake()?;
        Ok(())
    }

    /// Runs the wait loop until `close`.
    ///
    /// For every ready descriptor the handler is invoked as
    /// `handler(fd, events)`; after a batch that contained at least one
    /// wake, the handler is invoked once more as `handler(WAKE_FD, empty)`.
    /// Interrupted waits re-enter; other wait errors are logged and the
    /// loop continues.
    pub fn poll<F>(&self, mut handler: F)
    where
        F: FnMut(RawFd, Event),
    {
        let mut events = self.selector.events(WAIT_EVENTS_BEGIN);
        self.running.store(true, Ordering::Release);

        loop {
            let n = match self.selector.wait(&mut events, None) {
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("poller wait: {}", e);
                    continue;
                }
            };

            let mut wake = false;
            for i in 0..n {
                let (fd, kind) = match events.get(i) {
                    Some(event) => event,
                    None => break,
                };

                if fd == WAKE_FD {
                    self.selector.drain_wake();
                    wake = true;
                } else {
                    handler(fd, kind);
                }
            }

            if wake {
                handler(WAKE_FD, Event::empty());
                if !self.running.load(Ordering::Acquire) {
                    return;
                }
            }

            if n == events.capacity() {
                events.grow();
            }
        }
    }
}
