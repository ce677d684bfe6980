use std::io::{self, Error, ErrorKind};
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;

use libc::{c_int, c_void, sockaddr, sockaddr_storage, socklen_t};

use super::fd::FileDesc;

pub fn setsockopt<T>(fd: RawFd, opt: c_int, val: c_int, payload: T) -> io::Result<()> {
    let payload = &payload as *const T as *const c_void;
    syscall!(setsockopt(
        fd,
        opt,
        val,
        payload,
        mem::size_of::<T>() as socklen_t
    ))?;
    Ok(())
}

pub fn getsockopt<T: Copy>(fd: RawFd, opt: c_int, val: c_int) -> io::Result<T> {
    let mut slot: T = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<T>() as socklen_t;
    syscall!(getsockopt(
        fd,
        opt,
        val,
        &mut slot as *mut _ as *mut _,
        &mut len
    ))?;
    assert_eq!(len as usize, mem::size_of::<T>());
    Ok(slot)
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = syscall!(read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()))?;
    Ok(n as usize)
}

pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = syscall!(write(fd, buf.as_ptr() as *const c_void, buf.len()))?;
    Ok(n as usize)
}

pub fn close(fd: RawFd) -> io::Result<()> {
    syscall!(close(fd)).map(|_| ())
}

pub fn shutdown_write(fd: RawFd) -> io::Result<()> {
    syscall!(shutdown(fd, libc::SHUT_WR)).map(|_| ())
}

pub fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    let mut nonblocking = nonblocking as c_int;
    syscall!(ioctl(fd, libc::FIONBIO, &mut nonblocking)).map(|_| ())
}

/// SO_ERROR: pending asynchronous error on the socket, if any. Reading
/// clears it.
pub fn take_error(fd: RawFd) -> io::Result<Option<io::Error>> {
    let raw: c_int = getsockopt(fd, libc::SOL_SOCKET, libc::SO_ERROR)?;
    if raw == 0 {
        Ok(None)
    } else {
        Ok(Some(io::Error::from_raw_os_error(raw)))
    }
}

pub fn peer_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of_val(&storage) as socklen_t;
    syscall!(getpeername(
        fd,
        &mut storage as *mut _ as *mut sockaddr,
        &mut len
    ))?;
    sockaddr_to_addr(&storage, len as usize)
}

/// Accepts one pending connection; the returned descriptor is already
/// non-blocking and close-on-exec.
#[cfg(target_os = "linux")]
pub fn accept_nonblocking(fd: RawFd) -> io::Result<(RawFd, SocketAddr)> {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of_val(&storage) as socklen_t;
    let nfd = syscall!(accept4(
        fd,
        &mut storage as *mut _ as *mut sockaddr,
        &mut len,
        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC
    ))?;
    let addr = sockaddr_to_addr(&storage, len as usize)?;
    Ok((nfd, addr))
}

#[cfg(not(target_os = "linux"))]
pub fn accept_nonblocking(fd: RawFd) -> io::Result<(RawFd, SocketAddr)> {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of_val(&storage) as socklen_t;
    let nfd = syscall!(accept(
        fd,
        &mut storage as *mut _ as *mut sockaddr,
        &mut len
    ))?;

    if let Err(e) = syscall!(fcntl(nfd, libc::F_SETFD, libc::FD_CLOEXEC))
        .and_then(|_| set_nonblocking(nfd, true).map(|_| 0))
    {
        let _ = close(nfd);
        return Err(e);
    }

    let addr = sockaddr_to_addr(&storage, len as usize)?;
    Ok((nfd, addr))
}

pub fn sockaddr_to_addr(storage: &sockaddr_storage, len: usize) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            assert!(len >= mem::size_of::<libc::sockaddr_in>());
            let sin = unsafe { *(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Ok(SocketAddr::V4(SocketAddrV4::new(
                ip,
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            assert!(len >= mem::size_of::<libc::sockaddr_in6>());
            let sin6 = unsafe { *(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => Err(Error::new(ErrorKind::InvalidInput, "invalid argument")),
    }
}

fn addr_to_sockaddr(addr: &SocketAddr) -> (sockaddr_storage, socklen_t) {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };

    let len = match addr {
        SocketAddr::V4(a) => {
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = a.port().to_be();
            sin.sin_addr = libc::in_addr {
                s_addr: u32::from(*a.ip()).to_be(),
            };
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(a) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = a.port().to_be();
            sin6.sin6_addr = libc::in6_addr {
                s6_addr: a.ip().octets(),
            };
            sin6.sin6_flowinfo = a.flowinfo();
            sin6.sin6_scope_id = a.scope_id();
            mem::size_of::<libc::sockaddr_in6>()
        }
    };

    (storage, len as socklen_t)
}

/// A raw stream socket used while setting up listeners and outbound
/// connections. Closes on drop; `into_raw` releases ownership.
#[derive(Debug)]
pub struct Socket(FileDesc);

impl Socket {
    pub fn new(addr: &SocketAddr) -> io::Result<Socket> {
        let fam = match addr {
            SocketAddr::V4(..) => libc::AF_INET,
            SocketAddr::V6(..) => libc::AF_INET6,
        };

        #[cfg(target_os = "linux")]
        let fd = syscall!(socket(fam, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0))?;

        #[cfg(not(target_os = "linux"))]
        let fd = {
            let fd = syscall!(socket(fam, libc::SOCK_STREAM, 0))?;
            let desc = FileDesc::new(fd);
            desc.set_cloexec()?;
            desc.into_raw()
        };

        Ok(Socket(FileDesc::new(fd)))
    }

    pub fn raw(&self) -> RawFd {
        self.0.raw()
    }

    pub fn into_raw(self) -> RawFd {
        self.0.into_raw()
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.0.set_nonblocking(nonblocking)
    }

    pub fn set_reuse_addr(&self, reuse: bool) -> io::Result<()> {
        setsockopt(
            self.raw(),
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            reuse as c_int,
        )
    }

    pub fn set_reuse_port(&self, reuse: bool) -> io::Result<()> {
        setsockopt(
            self.raw(),
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            reuse as c_int,
        )
    }

    pub fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        let (storage, len) = addr_to_sockaddr(addr);
        syscall!(bind(self.raw(), &storage as *const _ as *const sockaddr, len)).map(|_| ())
    }

    pub fn listen(&self, backlog: c_int) -> io::Result<()> {
        syscall!(listen(self.raw(), backlog)).map(|_| ())
    }

    /// Issues `connect(2)`. On a non-blocking socket the expected result is
    /// an `EINPROGRESS` error; the caller completes the handshake through
    /// poller writability plus `take_error`.
    pub fn connect(&self, addr: &SocketAddr) -> io::Result<()> {
        let (storage, len) = addr_to_sockaddr(addr);
        syscall!(connect(
            self.raw(),
            &storage as *const _ as *const sockaddr,
            len
        ))
        .map(|_| ())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sockaddr_round_trip_v4() {
        let addr: SocketAddr = "127.0.0.1:1833".parse().unwrap();
        let (storage, len) = addr_to_sockaddr(&addr);
        let back = sockaddr_to_addr(&storage, len as usize).unwrap();
        assert_eq!(addr, back);
    }

    #[test]
    fn sockaddr_round_trip_v6() {
        let addr: SocketAddr = "[::1]:1833".parse().unwrap();
        let (storage, len) = addr_to_sockaddr(&addr);
        let back = sockaddr_to_addr(&storage, len as usize).unwrap();
        assert_eq!(addr, back);
    }
}
