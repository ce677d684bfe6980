use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::error;

use crate::connection::{Connection, Handler};
use crate::error::Result;
use crate::event_loop::EventLoop;
use crate::listener::{AcceptHook, Listener};
use crate::options::Options;
use crate::sync::SpinLock;
use crate::sys;
use crate::timing_wheel::{Timer, TimingWheel};

/// A TCP server: one listener loop, `num_loops` worker loops and a shared
/// timing wheel.
///
/// Construction binds the listen socket and builds every loop; `start`
/// spins one thread per loop and blocks until all of them return, which
/// happens after `stop`.
pub struct Server {
    listener_loop: Arc<EventLoop>,
    work_loops: Vec<Arc<EventLoop>>,
    timing_wheel: TimingWheel,
    opts: Options,
    stopped: AtomicBool,
}

impl Server {
    pub fn new(handler: Arc<dyn Handler>, mut opts: Options) -> Result<Server> {
        if opts.num_loops == 0 {
            opts.num_loops = thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
        }

        let timing_wheel = TimingWheel::new(opts.tick, opts.wheel_size);
        let listener_loop = Arc::new(EventLoop::new()?);

        let mut work_loops = Vec::with_capacity(opts.num_loops);
        for _ in 0..opts.num_loops {
            work_loops.push(Arc::new(EventLoop::new()?));
        }

        let accept = Server::accept_hook(
            handler,
            &mut opts,
            work_loops.clone(),
            timing_wheel.clone(),
        );

        let listener = Arc::new(Listener::new(
            &opts.network,
            &opts.address,
            opts.reuse_port,
            listener_loop.clone(),
            accept,
        )?);
        listener_loop.add_socket_read(listener.fd(), listener.clone())?;

        Ok(Server {
            listener_loop,
            work_loops,
            timing_wheel,
            opts,
            stopped: AtomicBool::new(false),
        })
    }

    // Runs on the listener thread for every accepted descriptor: pick a
    // worker loop, build the connection, then register it and fire
    // on_connect from a task on that loop, so on_connect already runs on
    // the thread that owns the connection.
    fn accept_hook(
        handler: Arc<dyn Handler>,
        opts: &mut Options,
        work_loops: Vec<Arc<EventLoop>>,
        timing_wheel: TimingWheel,
    ) -> AcceptHook {
        let strategy = SpinLock::new(opts.take_strategy());
        let protocol = opts.shared_protocol();
        let idle_time = opts.idle_time;

        Box::new(move |fd, peer_addr| {
            let event_loop = strategy.lock().pick(&work_loops);

            let conn = Connection::new(
                fd,
                event_loop.clone(),
                peer_addr,
                protocol.clone(),
                timing_wheel.clone(),
                idle_time,
                handler.clone(),
            );

            let owner = event_loop.clone();
            let handler = handler.clone();
            event_loop.queue_task(move || {
                if let Err(e) = owner.add_socket_read(fd, conn.clone()) {
                    error!("register accepted fd {}: {}", fd, e);
                    let _ = sys::socket::close(fd);
                    return;
                }

                handler.on_connect(&conn);
            });
        })
    }

    /// Runs every loop on its own thread and blocks until all of them
    /// return.
    pub fn start(&self) -> Result<()> {
        self.timing_wheel.start();

        let mut handles = Vec::with_capacity(self.work_loops.len() + 1);
        for (i, event_loop) in self.work_loops.iter().enumerate() {
            let event_loop = event_loop.clone();
            let handle = thread::Builder::new()
                .name(format!("gale-loop-{}", i))
                .spawn(move || event_loop.run());

            match handle {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    self.stop();
                    self.join(handles);
                    return Err(e.into());
                }
            }
        }

        let listener_loop = self.listener_loop.clone();
        let handle = thread::Builder::new()
            .name("gale-listener".to_string())
            .spawn(move || listener_loop.run());

        match handle {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                self.stop();
                self.join(handles);
                return Err(e.into());
            }
        }

        self.join(handles);
        Ok(())
    }

    fn join(&self, handles: Vec<thread::JoinHandle<()>>) {
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Stops the wheel, the listener loop, then each worker loop.
    /// Idempotent; `start` returns once every loop has torn down.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        self.timing_wheel.stop();
        self.listener_loop.stop();

        for event_loop in &self.work_loops {
            event_loop.stop();
        }
    }

    /// Schedules `f` once after `d` on the server's timing wheel.
    pub fn run_after<F>(&self, d: Duration, f: F) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timing_wheel.after_func(d, f)
    }

    /// Schedules `f` every `d` on the server's timing wheel.
    pub fn run_every<F>(&self, d: Duration, f: F) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timing_wheel.every_func(d, f)
    }

    pub fn options(&self) -> &Options {
        &self.opts
    }
}
