use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, error};

use crate::context::{KeyValueContext, Value};
use crate::error::{Error, Result};
use crate::event_loop::{EventLoop, Socket};
use crate::poller::Event;
use crate::protocol::{MessageCtx, Protocol};
use crate::ring_buffer::{self, RingBuffer};
use crate::sync::{SpinLock, SpinLockGuard};
use crate::sys;
use crate::timing_wheel::TimingWheel;

/// The callback set a user supplies when creating a server or dialing out.
///
/// All three methods run on the connection's owning loop thread and must
/// not block; long work has to be posted elsewhere. A non-empty return from
/// `on_message` is packed through the connection's protocol and queued for
/// write before the loop moves on.
pub trait Handler: Send + Sync + 'static {
    fn on_connect(&self, _conn: &Arc<Connection>) {}

    fn on_message(
        &self,
        conn: &Arc<Connection>,
        ctx: Option<MessageCtx>,
        data: &[u8],
    ) -> Option<Vec<u8>>;

    fn on_close(&self, _conn: &Arc<Connection>) {}
}

type AfterSend = Box<dyn FnOnce(Vec<u8>) + Send + 'static>;

/// Options for a single `send_with` call.
#[derive(Default)]
pub struct SendOptions {
    after_send: Option<AfterSend>,
}

impl SendOptions {
    pub fn new() -> SendOptions {
        SendOptions::default()
    }

    /// Invoked on the loop thread with the original value once it has been
    /// packed and handed to `send_in_loop`. Lets callers recycle pooled
    /// buffers.
    pub fn after_send<F>(mut self, f: F) -> SendOptions
    where
        F: FnOnce(Vec<u8>) + Send + 'static,
    {
        self.after_send = Some(Box::new(f));
        self
    }
}

// Loop-thread-only state. The spinlock around it is taken exclusively by
// the owning loop thread once the connection is registered.
struct ConnIo {
    in_buffer: RingBuffer,
    out_buffer: RingBuffer,
    // Staging buffer for reads that arrive while the in-buffer is empty:
    // the protocol runs over the fresh bytes directly and only the
    // unconsumed tail is copied into the in-buffer.
    head_buffer: RingBuffer,
}

/// One TCP connection, identified by its file descriptor and owned by
/// exactly one event loop.
///
/// `send` and `close` may be called from any thread; they post work to the
/// owning loop and fail with `ConnectionClosed` once the connection is
/// gone. Everything else that mutates the connection happens on the loop
/// thread.
pub struct Connection {
    fd: RawFd,
    peer_addr: String,
    connected: AtomicBool,
    in_buffer_len: AtomicUsize,
    out_buffer_len: AtomicUsize,
    event_loop: Arc<EventLoop>,
    protocol: Arc<dyn Protocol>,
    handler: Arc<dyn Handler>,
    io: SpinLock<ConnIo>,
    context: RwLock<Option<Value>>,
    kv: KeyValueContext,
    idle_time: Option<Duration>,
    active_time: AtomicI64,
    timing_wheel: TimingWheel,
    me: Weak<Connection>,
}

impl Connection {
    pub(crate) fn new(
        fd: RawFd,
        event_loop: Arc<EventLoop>,
        peer_addr: SocketAddr,
        protocol: Arc<dyn Protocol>,
        timing_wheel: TimingWheel,
        idle_time: Option<Duration>,
        handler: Arc<dyn Handler>,
    ) -> Arc<Connection> {
        let conn = Arc::new_cyclic(|me| Connection {
            fd,
            peer_addr: peer_addr.to_string(),
            connected: AtomicBool::new(true),
            in_buffer_len: AtomicUsize::new(0),
            out_buffer_len: AtomicUsize::new(0),
            event_loop,
            protocol,
            handler,
            io: SpinLock::new(ConnIo {
                in_buffer: ring_buffer::get_from_pool(),
                out_buffer: ring_buffer::get_from_pool(),
                head_buffer: RingBuffer::new(),
            }),
            context: RwLock::new(None),
            kv: KeyValueContext::default(),
            idle_time,
            active_time: AtomicI64::new(0),
            timing_wheel,
            me: me.clone(),
        });

        if let Some(idle) = conn.idle_time {
            conn.active_time.store(unix_now(), Ordering::Release);
            Connection::schedule_idle_close(&conn, idle);
        }

        conn
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Bytes currently backed up in the inbound ring buffer, as of the last
    /// event processed for this connection.
    pub fn read_buffer_length(&self) -> usize {
        self.in_buffer_len.load(Ordering::Acquire)
    }

    /// Bytes currently backed up in the outbound ring buffer, as of the
    /// last event processed for this connection.
    pub fn write_buffer_length(&self) -> usize {
        self.out_buffer_len.load(Ordering::Acquire)
    }

    pub fn context(&self) -> Option<Value> {
        self.context.read().unwrap().clone()
    }

    pub fn set_context(&self, value: Value) {
        *self.context.write().unwrap() = Some(value);
    }

    pub fn set(&self, key: &str, value: Value) {
        self.kv.set(key, value)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.kv.get(key)
    }

    pub fn delete(&self, key: &str) {
        self.kv.delete(key)
    }

    /// The owning loop's scratch buffer for framers. Loop thread only.
    pub fn user_buffer(&self) -> SpinLockGuard<'_, Vec<u8>> {
        self.event_loop.user_buffer()
    }

    /// Queues `data` for delivery. Thread-safe; serialization through the
    /// protocol and the actual write happen on the owning loop thread.
    /// Calls from a single thread go out in call order.
    pub fn send(&self, data: Vec<u8>) -> Result<()> {
        self.send_with(data, SendOptions::default())
    }

    pub fn send_with(&self, data: Vec<u8>, options: SendOptions) -> Result<()> {
        if !self.connected() {
            return Err(Error::ConnectionClosed);
        }

        let me = match self.me.upgrade() {
            Some(me) => me,
            None => return Err(Error::ConnectionClosed),
        };

        self.event_loop.queue_task(move || {
            if !me.connected() {
                return;
            }

            let packed = me.protocol.pack(&me, &data);
            let closed = {
                let mut io = me.io.lock();
                let closed = me.send_in_loop(&packed, &mut io);
                if !closed {
                    me.in_buffer_len.store(io.in_buffer.len(), Ordering::Release);
                    me.out_buffer_len.store(io.out_buffer.len(), Ordering::Release);
                }
                closed
            };

            if closed {
                me.handle_close(me.fd);
            }

            if let Some(after_send) = options.after_send {
                after_send(data);
            }
        });

        Ok(())
    }

    /// Requests teardown. Returns immediately; deregistration, the user
    /// `on_close` callback and the fd close run as a task on the owning
    /// loop. Idempotent in effect, but a second call reports
    /// `ConnectionClosed`.
    pub fn close(&self) -> Result<()> {
        if !self.connected() {
            return Err(Error::ConnectionClosed);
        }

        let me = match self.me.upgrade() {
            Some(me) => me,
            None => return Err(Error::ConnectionClosed),
        };

        self.event_loop.queue_task(move || me.handle_close(me.fd));
        Ok(())
    }

    /// Half-closes the write side (SHUT_WR). The descriptor stays
    /// registered, so inbound bytes keep flowing until the peer closes.
    pub fn shutdown_write(&self) -> Result<()> {
        if !self.connected() {
            return Err(Error::ConnectionClosed);
        }

        sys::socket::shutdown_write(self.fd)?;
        Ok(())
    }

    fn schedule_idle_close(conn: &Arc<Connection>, delay: Duration) {
        let c = conn.clone();
        let wheel = conn.timing_wheel.clone();

        wheel.after_func(delay, move || {
            // Wheel thread: never touch connection state here beyond the
            // atomics; close() re-posts onto the owning loop.
            if !c.connected() {
                return;
            }

            let idle = match c.idle_time {
                Some(idle) => idle,
                None => return,
            };

            let inactive = unix_now().saturating_sub(c.active_time.load(Ordering::Acquire));
            let inactive = Duration::from_secs(inactive.max(0) as u64);

            if inactive >= idle {
                let _ = c.close();
            } else {
                Connection::schedule_idle_close(&c, idle - inactive);
            }
        });
    }

    fn run_protocol(&self, out: &mut Vec<u8>, buffer: &mut RingBuffer) {
        let me = match self.me.upgrade() {
            Some(me) => me,
            None => return,
        };

        while let Some((ctx, data)) = self.protocol.unpack(self, buffer) {
            if let Some(reply) = self.handler.on_message(&me, ctx, &data) {
                if !reply.is_empty() {
                    out.extend_from_slice(&self.protocol.pack(self, &reply));
                }
            }
        }
    }

    fn handle_read(&self, io: &mut ConnIo) -> bool {
        let mut out = Vec::new();

        {
            let mut packet = self.event_loop.packet_buf();
            let n = match sys::socket::read(self.fd, &mut packet[..]) {
                Ok(0) => return true,
                Ok(n) => n,
                Err(ref e) if is_transient(e) => return false,
                Err(_) => return true,
            };

            if io.in_buffer.is_empty() {
                io.head_buffer.with_data(&packet[..n]);
                self.run_protocol(&mut out, &mut io.head_buffer);

                if !io.head_buffer.is_empty() {
                    let ConnIo {
                        head_buffer,
                        in_buffer,
                        ..
                    } = io;
                    let (first, second) = head_buffer.peek_all();
                    in_buffer.write(first);
                    in_buffer.write(second);
                }
            } else {
                io.in_buffer.write(&packet[..n]);
                self.run_protocol(&mut out, &mut io.in_buffer);
            }
        }

        if !out.is_empty() {
            return self.send_in_loop(&out, io);
        }
        false
    }

    fn handle_write(&self, io: &mut ConnIo) -> bool {
        let (first_len, n) = {
            let (first, _) = io.out_buffer.peek_all();
            match sys::socket::write(self.fd, first) {
                Ok(n) => (first.len(), n),
                Err(ref e) if is_transient(e) => return false,
                Err(_) => return true,
            }
        };
        io.out_buffer.retrieve(n);

        if n == first_len && !io.out_buffer.is_empty() {
            let n = {
                let (first, _) = io.out_buffer.peek_all();
                match sys::socket::write(self.fd, first) {
                    Ok(n) => n,
                    Err(ref e) if is_transient(e) => return false,
                    Err(_) => return true,
                }
            };
            io.out_buffer.retrieve(n);
        }

        if io.out_buffer.is_empty() {
            if let Err(e) = self.event_loop.enable_read(self.fd) {
                error!("enable read on fd {}: {}", self.fd, e);
            }
        }

        false
    }

    // Write what the socket accepts now, buffer the rest, and arm writable
    // interest while the out-buffer is non-empty. Returns true if the
    // connection must close.
    fn send_in_loop(&self, data: &[u8], io: &mut ConnIo) -> bool {
        if !io.out_buffer.is_empty() {
            io.out_buffer.write(data);
        } else {
            let n = match sys::socket::write(self.fd, data) {
                Ok(n) => n,
                Err(ref e) if is_transient(e) => 0,
                Err(_) => return true,
            };

            if n < data.len() {
                io.out_buffer.write(&data[n..]);
            }

            if !io.out_buffer.is_empty() {
                if let Err(e) = self.event_loop.enable_read_write(self.fd) {
                    error!("enable read write on fd {}: {}", self.fd, e);
                }
            }
        }

        false
    }

    fn handle_close(&self, fd: RawFd) {
        if self
            .connected
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        debug!("close connection {}", self.peer_addr);
        self.event_loop.delete_fd_in_loop(fd);

        if let Some(me) = self.me.upgrade() {
            self.handler.on_close(&me);
        }

        if let Err(e) = sys::socket::close(fd) {
            error!("close fd {}: {}", fd, e);
        }

        let (in_buffer, out_buffer) = {
            let mut io = self.io.lock();
            (
                mem::take(&mut io.in_buffer),
                mem::take(&mut io.out_buffer),
            )
        };
        ring_buffer::put_in_pool(in_buffer);
        ring_buffer::put_in_pool(out_buffer);

        self.kv.reset();
    }
}

impl Socket for Connection {
    fn handle_event(&self, fd: RawFd, events: Event) {
        if !self.connected() {
            return;
        }

        if self.idle_time.is_some() {
            self.active_time.store(unix_now(), Ordering::Release);
        }

        if events.is_error() {
            self.handle_close(fd);
            return;
        }

        let closed = {
            let mut io = self.io.lock();

            let closed = if !io.out_buffer.is_empty() {
                if events.is_writable() {
                    let closed = self.handle_write(&mut io);
                    if !closed && io.out_buffer.is_empty() {
                        io.out_buffer.reset();
                    }
                    closed
                } else {
                    false
                }
            } else if events.is_readable() {
                let closed = self.handle_read(&mut io);
                if !closed && io.in_buffer.is_empty() {
                    io.in_buffer.reset();
                }
                closed
            } else {
                false
            };

            if !closed {
                self.in_buffer_len
                    .store(io.in_buffer.len(), Ordering::Release);
                self.out_buffer_len
                    .store(io.out_buffer.len(), Ordering::Release);
            }

            closed
        };

        if closed {
            self.handle_close(fd);
        }
    }

    fn close(&self) -> Result<()> {
        self.handle_close(self.fd);
        Ok(())
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
