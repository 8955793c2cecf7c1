mod common;

use std::net::{SocketAddr, TcpListener};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use common::{base_loop, start_server, wait_until, TIMEOUT};
use mill_reactor::net::tcp::{
    ConnectionHandler, TcpClient, TcpClientConfig, TcpConnectionPtr, TcpServer, TcpServerConfig,
};
use mill_reactor::{Buffer, EventLoop};

#[derive(Debug, PartialEq)]
enum Event {
    Up(String),
    Down(String),
    Data(Vec<u8>),
}

struct Recorder {
    greeting: Option<&'static [u8]>,
    echo: bool,
    events: Mutex<Sender<Event>>,
}

impl Recorder {
    fn new(greeting: Option<&'static [u8]>, echo: bool) -> (Self, Receiver<Event>) {
        let (tx, rx) = mpsc::channel();
        (
            Self {
                greeting,
                echo,
                events: Mutex::new(tx),
            },
            rx,
        )
    }
}

impl ConnectionHandler for Recorder {
    fn on_connection(&self, conn: &TcpConnectionPtr) {
        let event = if conn.connected() {
            if let Some(greeting) = self.greeting {
                conn.send(greeting);
            }
            Event::Up(conn.name().to_owned())
        } else {
            Event::Down(conn.name().to_owned())
        };
        let _ = self.events.lock().unwrap().send(event);
    }

    fn on_message(&self, conn: &TcpConnectionPtr, buf: &mut Buffer, _receive_time: Instant) {
        let _ = self
            .events
            .lock()
            .unwrap()
            .send(Event::Data(buf.peek().to_vec()));
        if self.echo {
            conn.send_buffer(buf);
        } else {
            buf.retrieve_all();
        }
    }
}

fn echo_server(event_loop: &Arc<EventLoop>, addr: SocketAddr) -> (Arc<TcpServer>, Receiver<Event>) {
    let config = TcpServerConfig::builder()
        .name("echo")
        .address(addr)
        .io_threads(1)
        .build();
    let (handler, events) = Recorder::new(None, true);
    let server = TcpServer::new(event_loop, config, handler).unwrap();
    start_server(&server);
    (server, events)
}

fn client_config(addr: SocketAddr, retry: bool) -> TcpClientConfig {
    TcpClientConfig::builder()
        .name("tester")
        .server_addr(addr)
        .retry(retry)
        .initial_retry_delay(Duration::from_millis(50))
        .max_retry_delay(Duration::from_millis(200))
        .build()
}

fn next(events: &Receiver<Event>) -> Event {
    events.recv_timeout(TIMEOUT).expect("event")
}

fn unused_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

#[test]
fn test_client_echo_and_disconnect() {
    let (server_thread, server_loop) = base_loop("echo-server");
    let (server, server_events) = echo_server(&server_loop, "127.0.0.1:0".parse().unwrap());
    let (client_thread, client_loop) = base_loop("echo-client");

    let (recorder, events) = Recorder::new(Some(b"hello"), false);
    let client = TcpClient::new(&client_loop, client_config(server.local_addr(), false), recorder).unwrap();
    client.connect();

    let Event::Up(name) = next(&events) else {
        panic!("expected client connection up");
    };
    assert!(name.starts_with(&format!("tester:{}#", server.local_addr())));
    assert_eq!(next(&events), Event::Data(b"hello".to_vec()));
    assert!(client.connection().is_some_and(|c| c.connected()));

    client.disconnect();
    assert_eq!(next(&events), Event::Down(name));
    assert!(wait_until(|| client.connection().is_none()));
    assert!(matches!(next(&server_events), Event::Up(_)));
    assert_eq!(next(&server_events), Event::Data(b"hello".to_vec()));
    assert!(matches!(next(&server_events), Event::Down(_)));

    // No reconnect after an explicit disconnect.
    assert!(events.recv_timeout(Duration::from_millis(300)).is_err());

    drop(client);
    drop(client_thread);
    drop(server);
    drop(server_thread);
}

#[test]
fn test_client_retries_until_server_appears() {
    let addr = unused_port();
    let (client_thread, client_loop) = base_loop("retry-client");
    let (recorder, events) = Recorder::new(Some(b"late"), false);
    let client = TcpClient::new(&client_loop, client_config(addr, true), recorder).unwrap();
    client.connect();

    // Several refused attempts go by before the listener exists.
    std::thread::sleep(Duration::from_millis(300));
    assert!(client.connection().is_none());

    let (server_thread, server_loop) = base_loop("retry-server");
    let (server, server_events) = echo_server(&server_loop, addr);

    let Event::Up(first) = next(&events) else {
        panic!("expected client connection up");
    };
    assert_eq!(next(&events), Event::Data(b"late".to_vec()));
    let Event::Up(server_name) = next(&server_events) else {
        panic!("expected server connection up");
    };

    // Server-side close: the client reconnects because retry is on.
    assert!(server.close_connection(&server_name));
    assert_eq!(next(&events), Event::Down(first.clone()));
    let Event::Up(second) = next(&events) else {
        panic!("expected reconnect");
    };
    assert_ne!(first, second);

    client.stop();
    drop(client);
    drop(client_thread);
    drop(server);
    drop(server_thread);
}

#[test]
fn test_dropping_client_closes_connection() {
    let (server_thread, server_loop) = base_loop("drop-server");
    let (server, server_events) = echo_server(&server_loop, "127.0.0.1:0".parse().unwrap());
    let (client_thread, client_loop) = base_loop("drop-client");

    let (recorder, events) = Recorder::new(None, false);
    let client = TcpClient::new(&client_loop, client_config(server.local_addr(), true), recorder).unwrap();
    client.connect();
    assert!(matches!(next(&events), Event::Up(_)));
    assert!(matches!(next(&server_events), Event::Up(_)));

    drop(client);
    assert!(matches!(next(&events), Event::Down(_)));
    assert!(matches!(next(&server_events), Event::Down(_)));
    assert!(wait_until(|| server.connection_count() == 0));

    drop(client_thread);
    drop(server);
    drop(server_thread);
}

#[test]
fn test_stop_before_connected() {
    let addr = unused_port();
    let (client_thread, client_loop) = base_loop("stop-client");
    let (recorder, events) = Recorder::new(None, false);
    let client = TcpClient::new(&client_loop, client_config(addr, true), recorder).unwrap();
    client.connect();
    std::thread::sleep(Duration::from_millis(100));
    client.stop();

    // Even once a listener shows up, a stopped client stays away.
    let (server_thread, server_loop) = base_loop("stop-server");
    let (server, server_events) = echo_server(&server_loop, addr);
    assert!(server_events.recv_timeout(Duration::from_millis(500)).is_err());
    assert!(events.try_recv().is_err());

    drop(client);
    drop(client_thread);
    drop(server);
    drop(server_thread);
}
