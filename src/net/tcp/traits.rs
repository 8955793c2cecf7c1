use std::sync::Arc;
use std::time::Instant;

use tracing::info;

use crate::buffer::Buffer;
use crate::net::tcp::connection::TcpConnection;

pub type TcpConnectionPtr = Arc<TcpConnection>;

/// Registry hook run after a connection has closed.
pub type CloseCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

/// Application callbacks for one server's or client's connections.
///
/// Every method runs on the loop that owns the connection. The defaults
/// log connection up/down and discard incoming bytes.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Called once when the connection is established and once when it goes
    /// down; [`TcpConnection::connected`] tells which.
    fn on_connection(&self, conn: &TcpConnectionPtr) {
        info!(
            name = conn.name(),
            local = %conn.local_addr(),
            peer = %conn.peer_addr(),
            "connection is {}",
            if conn.connected() { "UP" } else { "DOWN" }
        );
    }

    /// Called whenever new bytes were appended to `buf`. Consume complete
    /// frames and leave partial ones in the buffer.
    fn on_message(&self, conn: &TcpConnectionPtr, buf: &mut Buffer, receive_time: Instant) {
        let _ = (conn, receive_time);
        buf.retrieve_all();
    }

    /// Called when the output buffer has fully drained.
    fn on_write_complete(&self, conn: &TcpConnectionPtr) {
        let _ = conn;
    }

    /// Called once each time queued output crosses the high-water mark.
    fn on_high_water_mark(&self, conn: &TcpConnectionPtr, queued: usize) {
        let _ = (conn, queued);
    }
}

/// Handler that keeps every default.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHandler;

impl ConnectionHandler for DefaultHandler {}
