use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use log::error;

use crate::error::Result;
use crate::poller::{Event, Poller, WAKE_FD};
use crate::sync::{SpinLock, SpinLockGuard};

pub(crate) const DEFAULT_PACKET_SIZE: usize = 65536;
pub(crate) const DEFAULT_BUFFER_SIZE: usize = 4096;
const DEFAULT_TASK_QUEUE_SIZE: usize = 1024;

/// A handler owned by one event loop.
///
/// `handle_event` is invoked on the loop thread for every readiness event
/// of the registered descriptor. `close` is also invoked on the loop thread
/// (during loop teardown) and must release the descriptor synchronously.
pub trait Socket: Send + Sync {
    fn handle_event(&self, fd: RawFd, events: Event);

    fn close(&self) -> Result<()>;
}

type Task = Box<dyn FnOnce() + Send + 'static>;

/// One reactor thread: a poller, the descriptors it owns, and a mailbox for
/// closures posted from other threads.
///
/// The descriptor map and the scratch buffers belong to the loop thread;
/// the spinlocks around them are uncontended and exist to make the sharing
/// explicit. The only state written cross-thread is the write-side task
/// vector and the `need_wake` flag.
// Aligned to 128 so two loops never share a cache line holding the hot
// `need_wake` flag (128 mod cache-line-size = 0 on mainstream platforms).
#[repr(align(128))]
pub struct EventLoop {
    poll: Poller,
    conn_count: AtomicI64,
    need_wake: AtomicBool,
    stopping: AtomicBool,
    sockets: SpinLock<IndexMap<RawFd, Arc<dyn Socket>>>,
    packet: SpinLock<Box<[u8]>>,
    user_buffer: SpinLock<Vec<u8>>,
    tasks: SpinLock<Vec<Task>>,
}

impl EventLoop {
    pub fn new() -> io::Result<EventLoop> {
        Ok(EventLoop {
            poll: Poller::new()?,
            conn_count: AtomicI64::new(0),
            need_wake: AtomicBool::new(true),
            stopping: AtomicBool::new(false),
            sockets: SpinLock::new(IndexMap::new()),
            packet: SpinLock::new(vec![0u8; DEFAULT_PACKET_SIZE].into_boxed_slice()),
            user_buffer: SpinLock::new(vec![0u8; DEFAULT_BUFFER_SIZE]),
            tasks: SpinLock::new(Vec::with_capacity(DEFAULT_TASK_QUEUE_SIZE)),
        })
    }

    /// The per-loop read scratch buffer. Loop thread only.
    pub fn packet_buf(&self) -> SpinLockGuard<'_, Box<[u8]>> {
        self.packet.lock()
    }

    /// The per-loop scratch buffer lent to framers. Loop thread only.
    pub fn user_buffer(&self) -> SpinLockGuard<'_, Vec<u8>> {
        self.user_buffer.lock()
    }

    /// Number of descriptors currently registered. Readable from any thread;
    /// the least-connections balancer polls this.
    pub fn connection_count(&self) -> i64 {
        self.conn_count.load(Ordering::Acquire)
    }

    /// Registers `socket` for readable events under `fd`.
    pub fn add_socket_read(&self, fd: RawFd, socket: Arc<dyn Socket>) -> io::Result<()> {
        self.sockets.lock().insert(fd, socket);
        if let Err(e) = self.poll.add_read(fd) {
            self.sockets.lock().swap_remove(&fd);
            return Err(e);
        }

        self.conn_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Unregisters `fd`. Loop thread only.
    pub fn delete_fd_in_loop(&self, fd: RawFd) {
        if let Err(e) = self.poll.delete(fd) {
            error!("delete fd {} from poller: {}", fd, e);
        }
        self.sockets.lock().swap_remove(&fd);
        self.conn_count.fetch_add(-1, Ordering::AcqRel);
    }

    /// Keeps readable interest only.
    pub fn enable_read(&self, fd: RawFd) -> io::Result<()> {
        self.poll.enable_read(fd)
    }

    pub fn enable_read_write(&self, fd: RawFd) -> io::Result<()> {
        self.poll.enable_read_write(fd)
    }

    /// Posts `f` to run on the loop thread. Thread-safe.
    ///
    /// The wake syscall is elided while a previous wake is still pending: a
    /// burst of posts against an idle loop costs one wake, and posts from
    /// within the loop thread itself cost none until the next drain re-arms
    /// the flag.
    pub fn queue_task<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.tasks.lock().push(Box::new(f));

        if self
            .need_wake
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if let Err(e) = self.poll.wake() {
                error!("queue_task wake loop: {}", e);
            }
        }
    }

    /// Runs the loop until `stop`. Call from the thread that is to own it.
    pub fn run(&self) {
        let mut ready_tasks: Vec<Task> = Vec::with_capacity(DEFAULT_TASK_QUEUE_SIZE);

        self.poll.poll(|fd, events| {
            if fd != WAKE_FD {
                let socket = self.sockets.lock().get(&fd).cloned();
                if let Some(socket) = socket {
                    socket.handle_event(fd, events);
                }
            } else {
                self.need_wake.store(true, Ordering::Release);

                {
                    let mut write_side = self.tasks.lock();
                    mem::swap(&mut *write_side, &mut ready_tasks);
                }

                // Tasks posted by the tasks below land on the write side and
                // run on the next iteration, not this one.
                for task in ready_tasks.drain(..) {
                    task();
                }

                if self.stopping.load(Ordering::Acquire) {
                    self.teardown();
                }
            }
        });
    }

    /// Requests the loop to tear down and exit: every registered socket is
    /// closed on the loop thread, the map is cleared, then the poller is
    /// closed, at which point `run` returns. Idempotent; returns without
    /// waiting.
    pub fn stop(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }

        // Empty task to guarantee a wake; the drain notices `stopping`.
        self.queue_task(|| {});
    }

    fn teardown(&self) {
        let sockets: Vec<Arc<dyn Socket>> = self.sockets.lock().drain(..).map(|(_, s)| s).collect();

        for socket in sockets {
            if let Err(e) = socket.close() {
                error!("close socket on loop teardown: {}", e);
            }
        }

        self.conn_count.store(0, Ordering::Release);
        if let Err(e) = self.poll.close() {
            error!("close poller on loop teardown: {}", e);
        }
    }
}
