use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use gale::{Connection, Handler, MessageCtx, Options, Server};

struct Echo {
    connects: AtomicUsize,
    closes: AtomicUsize,
}

impl Echo {
    fn new() -> Echo {
        Echo {
            connects: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        }
    }
}

impl Handler for Echo {
    fn on_connect(&self, _conn: &Arc<Connection>) {
        // The accept handoff promises on_connect runs on the loop thread
        // that owns the connection from here on.
        let name = thread::current().name().unwrap_or("").to_string();
        assert!(name.starts_with("gale-loop-"), "on_connect ran on {}", name);

        self.connects.fetch_add(1, Ordering::SeqCst);
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
fn echo_round_trip() {
    let handler = Arc::new(Echo::new());

    let server = Arc::new(
        Server::new(
            handler.clone(),
            Options::new().address("127.0.0.1:1833").num_loops(1),
        )
        .unwrap(),
    );

    let s = server.clone();
    let th = thread::spawn(move || s.start().unwrap());
    thread::sleep(Duration::from_millis(200));

    let mut client = TcpStream::connect("127.0.0.1:1833").unwrap();
    client.write_all(b"hello").unwrap();

    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello");

    drop(client);
    thread::sleep(Duration::from_millis(300));

    assert_eq!(handler.connects.load(Ordering::SeqCst), 1);
    assert_eq!(handler.closes.load(Ordering::SeqCst), 1);

    server.stop();
    th.join().unwrap();
}

#[test]
fn echo_survives_many_writes() {
    let handler = Arc::new(Echo::new());

    let server = Arc::new(
        Server::new(
            handler.clone(),
            Options::new().address("127.0.0.1:1853").num_loops(2),
        )
        .unwrap(),
    );

    let s = server.clone();
    let th = thread::spawn(move || s.start().unwrap());
    thread::sleep(Duration::from_millis(200));

    let mut client = TcpStream::connect("127.0.0.1:1853").unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    // The stream property: concatenated echoes equal concatenated writes,
    // whatever the segmentation.
    let mut sent = Vec::new();
    for i in 0..200usize {
        let chunk = vec![(i % 251) as u8; 1 + i % 64];
        client.write_all(&chunk).unwrap();
        sent.extend_from_slice(&chunk);
    }

    let mut received = vec![0u8; sent.len()];
    client.read_exact(&mut received).unwrap();
    assert_eq!(received, sent);

    server.stop();
    th.join().unwrap();
}

struct CloseOnConnect {
    closes: AtomicUsize,
}

impl Handler for CloseOnConnect {
    fn on_connect(&self, conn: &Arc<Connection>) {
        conn.close().unwrap();
    }

    fn on_message(
        &self,
        _conn: &Arc<Connection>,
        _ctx: Option<MessageCtx>,
        _data: &[u8],
    ) -> Option<Vec<u8>> {
        None
    }

    fn on_close(&self, _conn: &Arc<Connection>) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn close_from_on_connect_yields_eof() {
    let handler = Arc::new(CloseOnConnect {
        closes: AtomicUsize::new(0),
    });

    let server = Arc::new(
        Server::new(
            handler.clone(),
            Options::new().address("127.0.0.1:1843").num_loops(2),
        )
        .unwrap(),
    );

    let s = server.clone();
    let th = thread::spawn(move || s.start().unwrap());
    thread::sleep(Duration::from_millis(200));

    let mut client = TcpStream::connect("127.0.0.1:1843").unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let mut buf = [0u8; 10];
    let n = client.read(&mut buf).unwrap();
    assert_eq!(n, 0);

    thread::sleep(Duration::from_millis(100));
    assert_eq!(handler.closes.load(Ordering::SeqCst), 1);

    server.stop();
    th.join().unwrap();
}
