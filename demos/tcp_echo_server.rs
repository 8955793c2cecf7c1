use anyhow::Result;
use mill_reactor::net::tcp::{ConnectionHandler, TcpConnectionPtr, TcpServer, TcpServerConfig};
use mill_reactor::utils::available_io_threads;
use mill_reactor::{Buffer, EventLoop};
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Echoes every byte back to the sender.
#[derive(Clone, Default)]
struct EchoHandler;

impl ConnectionHandler for EchoHandler {
    fn on_connection(&self, conn: &TcpConnectionPtr) {
        if conn.connected() {
            info!(conn = conn.name(), peer = %conn.peer_addr(), "client connected");
        } else {
            info!(conn = conn.name(), "client disconnected");
        }
    }

    fn on_message(&self, conn: &TcpConnectionPtr, buf: &mut Buffer, _receive_time: Instant) {
        info!(
            conn = conn.name(),
            bytes = buf.readable_bytes(),
            "echoing {:?}",
            String::from_utf8_lossy(buf.peek()).trim_end()
        );
        conn.send_buffer(buf);
    }

    fn on_high_water_mark(&self, conn: &TcpConnectionPtr, queued: usize) {
        // Slow reader: stop taking input until its output drains.
        info!(conn = conn.name(), queued, "high water mark reached, pausing reads");
        conn.stop_read();
    }

    fn on_write_complete(&self, conn: &TcpConnectionPtr) {
        if !conn.is_reading() {
            conn.start_read();
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let address = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8080".to_string())
        .parse()?;

    // the base loop accepts; one I/O loop per core serves the connections.
    let event_loop = EventLoop::new()?;
    let config = TcpServerConfig::builder()
        .name("echo")
        .address(address)
        .io_threads(available_io_threads())
        .no_delay(true)
        .build();
    let server = TcpServer::new(&event_loop, config, EchoHandler)?;
    server.start();

    let stats = server.clone();
    event_loop.run_every(Duration::from_secs(10), move || {
        info!(connections = stats.connection_count(), "server stats");
    });

    info!(addr = %server.local_addr(), "echo server running");
    event_loop.run();
    Ok(())
}
