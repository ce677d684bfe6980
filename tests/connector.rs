use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use gale::{Connection, Connector, Error, Handler, MessageCtx, Options, Server};

struct Echo;

impl Handler for Echo {
    fn on_message(
        &self,
        _conn: &Arc<Connection>,
        _ctx: Option<MessageCtx>,
        data: &[u8],
    ) -> Option<Vec<u8>> {
        Some(data.to_vec())
    }
}

struct ClientSide {
    connects: AtomicUsize,
    closes: AtomicUsize,
    messages: Mutex<Vec<Vec<u8>>>,
}

impl ClientSide {
    fn new() -> ClientSide {
        ClientSide {
            connects: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            messages: Mutex::new(Vec::new()),
        }
    }
}

impl Handler for ClientSide {
    fn on_connect(&self, _conn: &Arc<Connection>) {
        self.connects.fetch_add(1, Ordering::SeqCst);
    }

    fn on_message(
        &self,
        _conn: &Arc<Connection>,
        _ctx: Option<MessageCtx>,
        data: &[u8],
    ) -> Option<Vec<u8>> {
        self.messages.lock().unwrap().push(data.to_vec());
        None
    }

    fn on_close(&self, _conn: &Arc<Connection>) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn dial_send_and_receive() {
    let server = Arc::new(
        Server::new(
            Arc::new(Echo),
            Options::new().address("127.0.0.1:1845").num_loops(1),
        )
        .unwrap(),
    );

    let s = server.clone();
    let server_th = thread::spawn(move || s.start().unwrap());
    thread::sleep(Duration::from_millis(200));

    let connector = Arc::new(Connector::new(Options::new().num_loops(1)).unwrap());
    let c = connector.clone();
    let connector_th = thread::spawn(move || c.start().unwrap());
    thread::sleep(Duration::from_millis(200));

    let handler = Arc::new(ClientSide::new());
    let conn = connector
        .dial_with_timeout(
            Some(Duration::from_secs(5)),
            "tcp",
            "127.0.0.1:1845",
            handler.clone(),
            None,
            None,
        )
        .unwrap();

    assert!(conn.connected());
    assert_eq!(handler.connects.load(Ordering::SeqCst), 1);

    conn.send(b"over and out".to_vec()).unwrap();

    // The echo comes back through the connector's loop.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        {
            let messages = handler.messages.lock().unwrap();
            if !messages.is_empty() {
                assert_eq!(messages[0], b"over and out");
                break;
            }
        }
        assert!(std::time::Instant::now() < deadline, "no echo received");
        thread::sleep(Duration::from_millis(20));
    }

    conn.close().unwrap();
    thread::sleep(Duration::from_millis(200));
    assert_eq!(handler.closes.load(Ordering::SeqCst), 1);
    assert!(matches!(
        conn.send(b"too late".to_vec()),
        Err(Error::ConnectionClosed)
    ));

    connector.stop();
    connector_th.join().unwrap();

    server.stop();
    server_th.join().unwrap();
}

#[test]
fn dial_refused_reports_the_connect_error() {
    let connector = Arc::new(Connector::new(Options::new().num_loops(1)).unwrap());
    let c = connector.clone();
    let connector_th = thread::spawn(move || c.start().unwrap());
    thread::sleep(Duration::from_millis(200));

    // Nothing listens on this port; the first writable event carries
    // ECONNREFUSED out of SO_ERROR.
    let handler = Arc::new(ClientSide::new());
    let outcome = connector.dial_with_timeout(
        Some(Duration::from_secs(5)),
        "tcp",
        "127.0.0.1:1846",
        handler.clone(),
        None,
        None,
    );

    assert!(outcome.is_err());
    assert!(!matches!(outcome, Err(Error::DialTimeout)));
    assert_eq!(handler.connects.load(Ordering::SeqCst), 0);

    connector.stop();
    connector_th.join().unwrap();
}
