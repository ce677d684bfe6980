use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use log::error;

use crate::error::Result;
use crate::event_loop::{EventLoop, Socket};
use crate::poller::Event;
use crate::sync::SpinLock;
use crate::sys;

const BACKLOG: libc::c_int = 1024;

pub(crate) type AcceptHook = Box<dyn Fn(RawFd, SocketAddr) + Send + Sync>;

/// The accepting socket, registered for readable events on the server's
/// listener loop. Every readable event drains the accept queue until
/// EAGAIN; each new descriptor comes back non-blocking and is handed to
/// the server's accept hook.
pub(crate) struct Listener {
    socket: SpinLock<Option<sys::socket::Socket>>,
    fd: RawFd,
    local_addr: SocketAddr,
    event_loop: Arc<EventLoop>,
    accept: AcceptHook,
}

impl Listener {
    pub(crate) fn new(
        network: &str,
        address: &str,
        reuse_port: bool,
        event_loop: Arc<EventLoop>,
        accept: AcceptHook,
    ) -> io::Result<Listener> {
        if network != "tcp" {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "only tcp is supported",
            ));
        }

        let local_addr: SocketAddr = address.parse().map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "invalid listen address")
        })?;

        let socket = sys::socket::Socket::new(&local_addr)?;
        socket.set_reuse_addr(true)?;
        if reuse_port {
            socket.set_reuse_port(true)?;
        }
        socket.bind(&local_addr)?;
        socket.listen(BACKLOG)?;
        socket.set_nonblocking(true)?;

        let fd = socket.raw();
        Ok(Listener {
            socket: SpinLock::new(Some(socket)),
            fd,
            local_addr,
            event_loop,
            accept,
        })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    #[allow(dead_code)]
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Socket for Listener {
    fn handle_event(&self, fd: RawFd, events: Event) {
        if !events.is_readable() {
            return;
        }

        loop {
            match sys::socket::accept_nonblocking(fd) {
                Ok((nfd, peer)) => (self.accept)(nfd, peer),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("accept: {}", e);
                    break;
                }
            }
        }
    }

    fn close(&self) -> Result<()> {
        if let Some(socket) = self.socket.lock().take() {
            self.event_loop.delete_fd_in_loop(self.fd);
            drop(socket);
        }
        Ok(())
    }
}
