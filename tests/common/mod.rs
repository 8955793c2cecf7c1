#![allow(dead_code)]

use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use mill_reactor::net::tcp::TcpServer;
use mill_reactor::{EventLoop, EventLoopThread};
use tracing_subscriber::EnvFilter;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A base loop running on its own thread.
pub fn base_loop(name: &str) -> (EventLoopThread, Arc<EventLoop>) {
    init_tracing();
    let mut thread = EventLoopThread::new(name, None);
    let event_loop = thread.start_loop().expect("start base loop");
    (thread, event_loop)
}

/// Starts `server` and waits until it is listening.
pub fn start_server(server: &Arc<TcpServer>) {
    let (tx, rx) = mpsc::channel();
    let target = Arc::clone(server);
    server.event_loop().run_in_loop(move || {
        target.start();
        let _ = tx.send(());
    });
    rx.recv_timeout(TIMEOUT).expect("server start");
}

/// Polls `cond` until it holds or the timeout elapses.
pub fn wait_until<F: FnMut() -> bool>(mut cond: F) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
