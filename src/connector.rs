use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::error;

use crate::connection::{Connection, Handler};
use crate::error::{Error, Result};
use crate::event_loop::{EventLoop, Socket};
use crate::load_balance::LoadBalance;
use crate::options::Options;
use crate::poller::Event;
use crate::protocol::Protocol;
use crate::sync::SpinLock;
use crate::sys;
use crate::timing_wheel::TimingWheel;

/// Outbound counterpart of the server: its own worker loops and timing
/// wheel, sharing the whole connection machinery.
///
/// `start` blocks like `Server::start`; run it on a dedicated thread and
/// dial from wherever.
pub struct Connector {
    work_loops: Vec<Arc<EventLoop>>,
    timing_wheel: TimingWheel,
    strategy: SpinLock<Box<dyn LoadBalance>>,
    opts: Options,
    stopped: AtomicBool,
}

impl Connector {
    pub fn new(mut opts: Options) -> Result<Connector> {
        if opts.num_loops == 0 {
            opts.num_loops = thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
        }

        let timing_wheel = TimingWheel::new(opts.tick, opts.wheel_size);

        let mut work_loops = Vec::with_capacity(opts.num_loops);
        for _ in 0..opts.num_loops {
            work_loops.push(Arc::new(EventLoop::new()?));
        }

        let strategy = SpinLock::new(opts.take_strategy());

        Ok(Connector {
            work_loops,
            timing_wheel,
            strategy,
            opts,
            stopped: AtomicBool::new(false),
        })
    }

    /// Runs every worker loop on its own thread and blocks until all of
    /// them return.
    pub fn start(&self) -> Result<()> {
        self.timing_wheel.start();

        let mut handles = Vec::with_capacity(self.work_loops.len());
        for (i, event_loop) in self.work_loops.iter().enumerate() {
            let event_loop = event_loop.clone();
            let handle = thread::Builder::new()
                .name(format!("gale-connector-{}", i))
                .spawn(move || event_loop.run());

            match handle {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    self.stop();
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(e.into());
                }
            }
        }

        for handle in handles {
            let _ = handle.join();
        }
        Ok(())
    }

    /// Stops the wheel and each worker loop. Idempotent. Live connections
    /// are torn down on their loops, firing `on_close`.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        self.timing_wheel.stop();
        for event_loop in &self.work_loops {
            event_loop.stop();
        }
    }

    pub fn options(&self) -> &Options {
        &self.opts
    }

    /// Dials with no deadline.
    pub fn dial(
        &self,
        network: &str,
        address: &str,
        handler: Arc<dyn Handler>,
        protocol: Option<Arc<dyn Protocol>>,
        idle_time: Option<Duration>,
    ) -> Result<Arc<Connection>> {
        self.dial_with_timeout(None, network, address, handler, protocol, idle_time)
    }

    /// Opens a non-blocking socket, issues `connect`, and parks the
    /// handshake on a strategy-picked worker loop. Returns once the first
    /// writable event confirms the connection (`SO_ERROR` clean), the
    /// connect fails, or `timeout` elapses; the timeout case tears the
    /// pending socket down and reports `DialTimeout`.
    pub fn dial_with_timeout(
        &self,
        timeout: Option<Duration>,
        network: &str,
        address: &str,
        handler: Arc<dyn Handler>,
        protocol: Option<Arc<dyn Protocol>>,
        idle_time: Option<Duration>,
    ) -> Result<Arc<Connection>> {
        if network != "tcp" {
            return Err(
                io::Error::new(io::ErrorKind::InvalidInput, "only tcp is supported").into(),
            );
        }

        let addr: SocketAddr = address.parse().map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "invalid dial address")
        })?;

        let socket = sys::socket::Socket::new(&addr)?;
        socket.set_nonblocking(true)?;
        match socket.connect(&addr) {
            Ok(()) => {}
            Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => return Err(e.into()),
        }

        let fd = socket.into_raw();
        let event_loop = self.strategy.lock().pick(&self.work_loops);
        let protocol = protocol.unwrap_or_else(|| self.opts.shared_protocol());

        let (tx, rx) = mpsc::sync_channel(1);
        let outbound = Arc::new(Outbound {
            fd,
            event_loop: event_loop.clone(),
            protocol,
            timing_wheel: self.timing_wheel.clone(),
            idle_time,
            handler,
            state: SpinLock::new(DialState::Connecting),
            result: SpinLock::new(Some(tx)),
        });

        let owner = event_loop.clone();
        let pending = outbound.clone();
        event_loop.queue_task(move || {
            if let Err(e) = owner.add_socket_read(fd, pending.clone()) {
                let _ = sys::socket::close(fd);
                *pending.state.lock() = DialState::Failed;
                pending.resolve(Err(e));
                return;
            }

            // Connect completion is reported as writability.
            if let Err(e) = owner.enable_read_write(fd) {
                owner.delete_fd_in_loop(fd);
                let _ = sys::socket::close(fd);
                *pending.state.lock() = DialState::Failed;
                pending.resolve(Err(e));
            }
        });

        let outcome = match timeout {
            Some(timeout) => rx.recv_timeout(timeout),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match outcome {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(e.into()),
            Err(RecvTimeoutError::Timeout) => {
                let pending = outbound.clone();
                event_loop.queue_task(move || {
                    if let Err(e) = Socket::close(&*pending) {
                        error!("abandon pending dial: {}", e);
                    }
                });
                Err(Error::DialTimeout)
            }
            Err(RecvTimeoutError::Disconnected) => Err(Error::ConnectionClosed),
        }
    }
}

enum DialState {
    Connecting,
    Connected(Arc<Connection>),
    Failed,
}

// The socket registered while the TCP handshake is in flight. It stays in
// the loop's map for the connection's whole life, delegating events to the
// inner Connection once established.
struct Outbound {
    fd: RawFd,
    event_loop: Arc<EventLoop>,
    protocol: Arc<dyn Protocol>,
    timing_wheel: TimingWheel,
    idle_time: Option<Duration>,
    handler: Arc<dyn Handler>,
    state: SpinLock<DialState>,
    result: SpinLock<Option<SyncSender<io::Result<Arc<Connection>>>>>,
}

impl Outbound {
    fn resolve(&self, outcome: io::Result<Arc<Connection>>) {
        if let Some(tx) = self.result.lock().take() {
            let _ = tx.send(outcome);
        }
    }

    // Loop thread; the handshake is over and lost.
    fn fail(&self, e: io::Error) {
        *self.state.lock() = DialState::Failed;
        self.event_loop.delete_fd_in_loop(self.fd);
        if let Err(e) = sys::socket::close(self.fd) {
            error!("close failed dial fd {}: {}", self.fd, e);
        }
        self.resolve(Err(e));
    }

    fn establish(&self) {
        let peer_addr = match sys::socket::peer_addr(self.fd) {
            Ok(peer_addr) => peer_addr,
            Err(e) => {
                self.fail(e);
                return;
            }
        };

        // Back to read-only interest; the connection arms writability
        // itself when its out-buffer fills.
        if let Err(e) = self.event_loop.enable_read(self.fd) {
            self.fail(e);
            return;
        }

        let conn = Connection::new(
            self.fd,
            self.event_loop.clone(),
            peer_addr,
            self.protocol.clone(),
            self.timing_wheel.clone(),
            self.idle_time,
            self.handler.clone(),
        );

        *self.state.lock() = DialState::Connected(conn.clone());

        // on_connect first, so it is ordered before the dialer returns and
        // before any on_message for this connection.
        self.handler.on_connect(&conn);
        self.resolve(Ok(conn.clone()));
    }
}

impl Socket for Outbound {
    fn handle_event(&self, fd: RawFd, events: Event) {
        let established = {
            match &*self.state.lock() {
                DialState::Connected(conn) => Some(conn.clone()),
                _ => None,
            }
        };

        if let Some(conn) = established {
            conn.handle_event(fd, events);
            return;
        }

        if !matches!(*self.state.lock(), DialState::Connecting) {
            return;
        }

        if events.is_error() {
            let e = sys::socket::take_error(fd)
                .ok()
                .flatten()
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "connect failed"));
            self.fail(e);
            return;
        }

        if events.is_writable() {
            match sys::socket::take_error(fd) {
                Ok(None) => self.establish(),
                Ok(Some(e)) => self.fail(e),
                Err(e) => self.fail(e),
            }
        }
    }

    fn close(&self) -> Result<()> {
        let state = mem::replace(&mut *self.state.lock(), DialState::Failed);

        match state {
            DialState::Connected(conn) => Socket::close(&*conn),
            DialState::Connecting => {
                self.event_loop.delete_fd_in_loop(self.fd);
                if let Err(e) = sys::socket::close(self.fd) {
                    error!("close pending dial fd {}: {}", self.fd, e);
                }
                self.resolve(Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "dial abandoned",
                )));
                Ok(())
            }
            DialState::Failed => Ok(()),
        }
    }
}
