//! A fast non-blocking TCP network library built on the reactor pattern:
//! one listener loop accepts connections and hands each one to a worker
//! loop driven by epoll (Linux) or kqueue (BSD/macOS). A pluggable
//! [`Protocol`] turns the byte stream into messages, per-connection ring
//! buffers batch reads and writes, and a hashed timing wheel drives idle
//! timeouts and scheduled tasks.
//!
//! ## Usage
//!
//! First, add this to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! gale = "0.3"
//! ```
//!
//! # Example
//!
//! An echo server:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use gale::{Connection, Handler, MessageCtx, Options, Server};
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn on_connect(&self, conn: &Arc<Connection>) {
//!         println!("connected: {}", conn.peer_addr());
//!     }
//!
//!     fn on_message(
//!         &self,
//!         _conn: &Arc<Connection>,
//!         _ctx: Option<MessageCtx>,
//!         data: &[u8],
//!     ) -> Option<Vec<u8>> {
//!         Some(data.to_vec())
//!     }
//! }
//!
//! fn main() -> gale::Result<()> {
//!     let server = Server::new(
//!         Arc::new(Echo),
//!         Options::new().address("0.0.0.0:1833").num_loops(4),
//!     )?;
//!
//!     server.start()
//! }
//! ```
//!
//! `Server::start` blocks; call `stop` from another thread (or from a
//! callback) for a graceful shutdown that fires `on_close` for every live
//! connection.

mod connection;
mod connector;
mod context;
mod error;
mod event_loop;
mod listener;
mod load_balance;
mod options;
mod poller;
mod protocol;
mod ring_buffer;
mod server;
mod sync;
mod sys;
mod timing_wheel;

pub use connection::{Connection, Handler, SendOptions};

pub use connector::Connector;

pub use context::Value;

pub use error::{Error, Result};

pub use event_loop::{EventLoop, Socket};

pub use load_balance::{LeastConnection, LoadBalance, RoundRobin};

pub use options::Options;

pub use poller::{Event, Poller, WAKE_FD};

pub use protocol::{DefaultProtocol, MessageCtx, Protocol};

pub use ring_buffer::RingBuffer;

pub use server::Server;

pub use sync::{SpinLock, SpinLockGuard};

pub use timing_wheel::{Timer, TimingWheel};
