use std::sync::Arc;
use std::time::Duration;

use crate::load_balance::{LoadBalance, RoundRobin};
use crate::protocol::{DefaultProtocol, Protocol};

/// Server and connector configuration.
///
/// Built by chaining setters over `Options::new()`; unset fields keep their
/// defaults.
///
/// ```
/// use gale::{Options, LeastConnection};
/// use std::time::Duration;
///
/// let opts = Options::new()
///     .address("0.0.0.0:1833")
///     .num_loops(4)
///     .reuse_port(true)
///     .idle_time(Duration::from_secs(30))
///     .strategy(LeastConnection::new());
/// ```
pub struct Options {
    pub network: String,
    pub address: String,
    /// Worker-loop count; 0 means the CPU count.
    pub num_loops: usize,
    pub reuse_port: bool,
    /// Per-connection idle timeout; `None` disables it.
    pub idle_time: Option<Duration>,
    /// Timing-wheel resolution.
    pub tick: Duration,
    /// Timing-wheel slot count.
    pub wheel_size: usize,

    protocol: Arc<dyn Protocol>,
    strategy: Option<Box<dyn LoadBalance>>,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            network: "tcp".to_string(),
            address: "0.0.0.0:1388".to_string(),
            num_loops: 0,
            reuse_port: false,
            idle_time: None,
            tick: Duration::from_millis(1),
            wheel_size: 1000,
            protocol: Arc::new(DefaultProtocol),
            strategy: Some(Box::new(RoundRobin::new())),
        }
    }
}

impl Options {
    pub fn new() -> Options {
        Options::default()
    }

    /// Only "tcp" is supported.
    pub fn network(mut self, network: &str) -> Options {
        self.network = network.to_string();
        self
    }

    /// "host:port" to bind.
    pub fn address(mut self, address: &str) -> Options {
        self.address = address.to_string();
        self
    }

    pub fn num_loops(mut self, num_loops: usize) -> Options {
        self.num_loops = num_loops;
        self
    }

    /// Enables SO_REUSEPORT on the listen socket.
    pub fn reuse_port(mut self, reuse_port: bool) -> Options {
        self.reuse_port = reuse_port;
        self
    }

    pub fn idle_time(mut self, idle_time: Duration) -> Options {
        self.idle_time = Some(idle_time);
        self
    }

    /// Installs a framing strategy; the default passes bytes through.
    pub fn protocol<P>(mut self, protocol: P) -> Options
    where
        P: Protocol + 'static,
    {
        self.protocol = Arc::new(protocol);
        self
    }

    /// Installs a load-balance strategy; the default is round-robin.
    pub fn strategy<S>(mut self, strategy: S) -> Options
    where
        S: LoadBalance + 'static,
    {
        self.strategy = Some(Box::new(strategy));
        self
    }

    pub fn tick(mut self, tick: Duration) -> Options {
        self.tick = tick;
        self
    }

    pub fn wheel_size(mut self, wheel_size: usize) -> Options {
        self.wheel_size = wheel_size;
        self
    }

    pub(crate) fn shared_protocol(&self) -> Arc<dyn Protocol> {
        self.protocol.clone()
    }

    pub(crate) fn take_strategy(&mut self) -> Box<dyn LoadBalance> {
        self.strategy
            .take()
            .unwrap_or_else(|| Box::new(RoundRobin::new()))
    }
}
