use std::sync::Arc;

use crate::event_loop::EventLoop;

/// Picks the worker loop that will own a new connection.
///
/// `pick` takes `&mut self` and is called from the listener thread only
/// (or the dialing thread, for a connector), so strategies keep plain
/// unsynchronized state like the round-robin cursor.
pub trait LoadBalance: Send + Sync {
    fn pick(&mut self, loops: &[Arc<EventLoop>]) -> Arc<EventLoop>;
}

/// Hands connections to the loops in rotation.
#[derive(Default)]
pub struct RoundRobin {
    next: usize,
}

impl RoundRobin {
    pub fn new() -> RoundRobin {
        RoundRobin::default()
    }
}

impl LoadBalance for RoundRobin {
    fn pick(&mut self, loops: &[Arc<EventLoop>]) -> Arc<EventLoop> {
        let picked = loops[self.next].clone();
        self.next = (self.next + 1) % loops.len();
        picked
    }
}

/// Scans the loops and picks the one with the fewest registered
/// connections at the instant of the pick.
#[derive(Default)]
pub struct LeastConnection;

impl LeastConnection {
    pub fn new() -> LeastConnection {
        LeastConnection
    }
}

impl LoadBalance for LeastConnection {
    fn pick(&mut self, loops: &[Arc<EventLoop>]) -> Arc<EventLoop> {
        let mut picked = &loops[0];

        for candidate in &loops[1..] {
            if candidate.connection_count() < picked.connection_count() {
                picked = candidate;
            }
        }

        picked.clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn loops(n: usize) -> Vec<Arc<EventLoop>> {
        (0..n)
            .map(|_| Arc::new(EventLoop::new().unwrap()))
            .collect()
    }

    #[test]
    fn round_robin_rotates_evenly() {
        let loops = loops(4);
        let mut strategy = RoundRobin::new();

        let mut counts = vec![0usize; 4];
        for _ in 0..12 {
            let picked = strategy.pick(&loops);
            let idx = loops
                .iter()
                .position(|l| Arc::ptr_eq(l, &picked))
                .unwrap();
            counts[idx] += 1;
        }

        assert_eq!(counts, vec![3, 3, 3, 3]);
    }

    #[test]
    fn least_connection_prefers_the_first_of_equals() {
        let loops = loops(3);
        let mut strategy = LeastConnection::new();

        let picked = strategy.pick(&loops);
        assert!(Arc::ptr_eq(&picked, &loops[0]));
    }
}
