use anyhow::Result;
use mill_reactor::net::tcp::{ConnectionHandler, TcpClient, TcpClientConfig, TcpConnectionPtr};
use mill_reactor::{Buffer, EventLoop};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

const ROUNDS: usize = 5;

/// Sends a line, waits for the echo, repeats, then quits the loop.
struct PingHandler {
    event_loop: Arc<EventLoop>,
    rounds: AtomicUsize,
}

impl ConnectionHandler for PingHandler {
    fn on_connection(&self, conn: &TcpConnectionPtr) {
        if conn.connected() {
            info!(conn = conn.name(), "connected, sending first ping");
            conn.send(b"ping 1\n");
        } else {
            info!(conn = conn.name(), "disconnected");
            self.event_loop.quit();
        }
    }

    fn on_message(&self, conn: &TcpConnectionPtr, buf: &mut Buffer, _receive_time: Instant) {
        while let Some(eol) = buf.find_eol() {
            let line = buf.retrieve_as_string(eol + 1);
            info!(reply = line.trim_end(), "got echo");
            let done = self.rounds.fetch_add(1, Ordering::Relaxed) + 1;
            if done < ROUNDS {
                conn.send(format!("ping {}\n", done + 1).as_bytes());
            } else {
                conn.shutdown();
            }
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let server_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8080".to_string())
        .parse()?;

    let event_loop = EventLoop::new()?;
    let config = TcpClientConfig::builder()
        .name("echo-client")
        .server_addr(server_addr)
        .initial_retry_delay(Duration::from_millis(200))
        .build();
    let handler = PingHandler {
        event_loop: Arc::clone(&event_loop),
        rounds: AtomicUsize::new(0),
    };
    let client = TcpClient::new(&event_loop, config, handler)?;
    client.connect();

    event_loop.run();
    info!("client finished");
    Ok(())
}
