use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use gale::{Connection, Error, Handler, MessageCtx, Options, Server};

struct Tracking {
    conns: Mutex<Vec<Arc<Connection>>>,
    closes: AtomicUsize,
}

impl Tracking {
    fn new() -> Tracking {
        Tracking {
            conns: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        }
    }
}

impl Handler for Tracking {
    fn on_connect(&self, conn: &Arc<Connection>) {
        self.conns.lock().unwrap().push(conn.clone());
    }

    fn on_message(
        &self,
        _conn: &Arc<Connection>,
        _ctx: Option<MessageCtx>,
        data: &[u8],
    ) -> Option<Vec<u8>> {
        Some(data.to_vec())
    }

    fn on_close(&self, _conn: &Arc<Connection>) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn graceful_shutdown_closes_every_client() {
    let handler = Arc::new(Tracking::new());

    let server = Arc::new(
        Server::new(
            handler.clone(),
            Options::new().address("127.0.0.1:1835").num_loops(4),
        )
        .unwrap(),
    );

    let s = server.clone();
    let th = thread::spawn(move || s.start().unwrap());
    thread::sleep(Duration::from_millis(200));

    let clients = 100;
    let mut sockets = Vec::new();
    for _ in 0..clients {
        let conn = TcpStream::connect("127.0.0.1:1835").unwrap();
        conn.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        sockets.push(conn);
    }

    // Let every registration task drain before pulling the plug.
    thread::sleep(Duration::from_millis(500));
    assert_eq!(handler.conns.lock().unwrap().len(), clients);

    server.stop();

    // start() returns once every loop has torn down.
    th.join().unwrap();

    for mut socket in sockets {
        let mut buf = [0u8; 1];
        let n = socket.read(&mut buf).unwrap();
        assert_eq!(n, 0);
    }

    assert_eq!(handler.closes.load(Ordering::SeqCst), clients);

    // Anything sent now fails synchronously.
    let conns = handler.conns.lock().unwrap();
    for conn in conns.iter() {
        assert!(!conn.connected());
        assert!(matches!(
            conn.send(b"late".to_vec()),
            Err(Error::ConnectionClosed)
        ));
        assert!(matches!(conn.close(), Err(Error::ConnectionClosed)));
    }
}

#[test]
fn cross_thread_send_burst_delivers_every_byte() {
    let handler = Arc::new(Tracking::new());

    let server = Arc::new(
        Server::new(
            handler.clone(),
            Options::new().address("127.0.0.1:1836").num_loops(1),
        )
        .unwrap(),
    );

    let s = server.clone();
    let th = thread::spawn(move || s.start().unwrap());
    thread::sleep(Duration::from_millis(200));

    let mut client = TcpStream::connect("127.0.0.1:1836").unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    thread::sleep(Duration::from_millis(200));

    let conn = handler.conns.lock().unwrap()[0].clone();

    // Many threads hammer send() against an idle loop. The wake elision
    // keeps the loop from being woken per call; every byte still arrives.
    let producers = 50;
    let per_producer = 20;
    let payload = vec![0xabu8; 32];

    let mut workers = Vec::new();
    for _ in 0..producers {
        let conn = conn.clone();
        let payload = payload.clone();
        workers.push(thread::spawn(move || {
            for _ in 0..per_producer {
                conn.send(payload.clone()).unwrap();
            }
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }

    let expected = producers * per_producer * payload.len();
    let mut received = vec![0u8; expected];
    client.read_exact(&mut received).unwrap();
    assert!(received.iter().all(|&b| b == 0xab));

    server.stop();
    th.join().unwrap();
}

#[test]
fn back_pressure_buffers_and_drains() {
    let handler = Arc::new(Tracking::new());

    let server = Arc::new(
        Server::new(
            handler.clone(),
            Options::new().address("127.0.0.1:1837").num_loops(1),
        )
        .unwrap(),
    );

    let s = server.clone();
    let th = thread::spawn(move || s.start().unwrap());
    thread::sleep(Duration::from_millis(200));

    let mut client = TcpStream::connect("127.0.0.1:1837").unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(30)))
        .unwrap();
    thread::sleep(Duration::from_millis(200));

    let conn = handler.conns.lock().unwrap()[0].clone();

    // 32 MiB into a peer that is not reading: send returns at once, the
    // overflow lands in the out-buffer and writable interest drains it as
    // the peer catches up. The size comfortably exceeds what the kernel
    // send and receive buffers can absorb between them.
    let total = 32 * 1024 * 1024;
    let blob = vec![0x5au8; total];

    let queued_at = Instant::now();
    conn.send(blob).unwrap();
    assert!(queued_at.elapsed() < Duration::from_secs(1));

    thread::sleep(Duration::from_millis(300));
    assert!(conn.write_buffer_length() > 0);

    let mut received = 0usize;
    let mut buf = vec![0u8; 64 * 1024];
    while received < total {
        let n = client.read(&mut buf).unwrap();
        assert!(n > 0);
        assert!(buf[..n].iter().all(|&b| b == 0x5a));
        received += n;
    }
    assert_eq!(received, total);

    // Fully drained: writable interest has been dropped and the cached
    // length settles back to zero.
    let deadline = Instant::now() + Duration::from_secs(5);
    while conn.write_buffer_length() > 0 {
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(50));
    }

    server.stop();
    th.join().unwrap();
}

#[test]
fn run_after_and_run_every_fire_on_the_wheel() {
    let handler = Arc::new(Tracking::new());

    let server = Arc::new(
        Server::new(
            handler.clone(),
            Options::new().address("127.0.0.1:1838").num_loops(1),
        )
        .unwrap(),
    );

    let s = server.clone();
    let th = thread::spawn(move || s.start().unwrap());
    thread::sleep(Duration::from_millis(200));

    let once = Arc::new(AtomicUsize::new(0));
    let many = Arc::new(AtomicUsize::new(0));

    let o = once.clone();
    server.run_after(Duration::from_millis(50), move || {
        o.fetch_add(1, Ordering::SeqCst);
    });

    let m = many.clone();
    let every = server.run_every(Duration::from_millis(30), move || {
        m.fetch_add(1, Ordering::SeqCst);
    });

    thread::sleep(Duration::from_millis(300));

    assert_eq!(once.load(Ordering::SeqCst), 1);
    assert!(many.load(Ordering::SeqCst) >= 3);

    every.stop();
    let settled = many.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(150));
    assert!(many.load(Ordering::SeqCst) <= settled + 1);

    server.stop();
    th.join().unwrap();
}
