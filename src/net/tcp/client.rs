use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use mio::net::TcpStream;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::net::connector::{Backoff, Connector};
use crate::net::tcp::config::TcpClientConfig;
use crate::net::tcp::connection::{destroy_later, TcpConnection};
use crate::net::tcp::traits::{ConnectionHandler, TcpConnectionPtr};
use crate::reactor::EventLoop;

/// Client side of one TCP connection at a time, with optional reconnect.
///
/// Dropping the client while connected detaches the live connection and
/// force-closes it; the connection finishes its teardown on its own.
pub struct TcpClient {
    event_loop: Arc<EventLoop>,
    config: TcpClientConfig,
    connector: Arc<Connector>,
    handler: Arc<dyn ConnectionHandler>,
    retry: AtomicBool,
    connect: AtomicBool,
    next_conn_id: AtomicU64,
    connection: Mutex<Option<TcpConnectionPtr>>,
    self_ref: Weak<TcpClient>,
}

impl TcpClient {
    pub fn new<H>(event_loop: &Arc<EventLoop>, config: TcpClientConfig, handler: H) -> Result<Arc<Self>>
    where
        H: ConnectionHandler,
    {
        config.validate()?;
        let connector = Connector::new(
            event_loop,
            config.server_addr,
            Backoff::new(config.initial_retry_delay, config.max_retry_delay),
        );
        let client = Arc::new_cyclic(|self_ref: &Weak<TcpClient>| Self {
            event_loop: Arc::clone(event_loop),
            retry: AtomicBool::new(config.retry),
            connect: AtomicBool::new(true),
            next_conn_id: AtomicU64::new(0),
            connection: Mutex::new(None),
            handler: Arc::new(handler),
            connector,
            config,
            self_ref: self_ref.clone(),
        });

        let weak = client.self_ref.clone();
        client.connector.set_new_connection_callback(move |stream| {
            if let Some(client) = weak.upgrade() {
                client.new_connection(stream);
            }
        });
        debug!(name = %client.config.name, "TcpClient created");
        Ok(client)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    pub fn retry(&self) -> bool {
        self.retry.load(Ordering::Acquire)
    }

    /// Reconnect whenever an established connection goes down.
    pub fn enable_retry(&self) {
        self.retry.store(true, Ordering::Release);
    }

    pub fn connection(&self) -> Option<TcpConnectionPtr> {
        self.connection.lock().clone()
    }

    pub fn connect(&self) {
        info!(
            name = %self.config.name,
            addr = %self.connector.server_addr(),
            "connecting"
        );
        self.connect.store(true, Ordering::Release);
        self.connector.start();
    }

    /// Gracefully shuts down the current connection, if any.
    pub fn disconnect(&self) {
        self.connect.store(false, Ordering::Release);
        if let Some(conn) = self.connection() {
            conn.shutdown();
        }
    }

    /// Cancels a connection attempt in progress.
    pub fn stop(&self) {
        self.connect.store(false, Ordering::Release);
        self.connector.stop();
    }

    fn new_connection(&self, stream: TcpStream) {
        self.event_loop.assert_in_loop_thread();
        let (local, peer) = match (stream.local_addr(), stream.peer_addr()) {
            (Ok(local), Ok(peer)) => (local, peer),
            (Err(e), _) | (_, Err(e)) => {
                error!(name = %self.config.name, error = %e, "connected socket has no address");
                return;
            }
        };
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        let conn_name = format!("{}:{}#{}", self.config.name, peer, id);

        let conn = TcpConnection::new(
            &self.event_loop,
            conn_name,
            stream,
            local,
            peer,
            Arc::clone(&self.handler),
            self.config.high_water_mark,
        );
        if self.config.no_delay {
            if let Err(e) = conn.set_tcp_no_delay(true) {
                warn!(conn = conn.name(), error = %e, "failed to set TCP_NODELAY");
            }
        }
        let weak = self.self_ref.clone();
        conn.set_close_callback(Arc::new(move |conn: &TcpConnectionPtr| match weak.upgrade() {
            Some(client) => client.remove_connection(conn),
            None => destroy_later(conn),
        }));
        *self.connection.lock() = Some(Arc::clone(&conn));
        conn.connect_established();
    }

    fn remove_connection(&self, conn: &TcpConnectionPtr) {
        self.event_loop.assert_in_loop_thread();
        {
            let mut current = self.connection.lock();
            if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, conn)) {
                *current = None;
            }
        }
        destroy_later(conn);

        if self.retry() && self.connect.load(Ordering::Acquire) {
            info!(
                name = %self.config.name,
                addr = %self.connector.server_addr(),
                "reconnecting"
            );
            self.connector.restart();
        }
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        debug!(name = %self.config.name, "TcpClient dropping");
        match self.connection.lock().take() {
            Some(conn) => {
                conn.set_close_callback(Arc::new(destroy_later));
                conn.force_close();
            }
            None => self.connector.stop(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::tcp::traits::DefaultHandler;
    use std::time::Duration;

    #[test]
    fn test_invalid_config_rejected() {
        let event_loop = EventLoop::new().unwrap();
        let config = TcpClientConfig::builder()
            .initial_retry_delay(Duration::from_secs(2))
            .max_retry_delay(Duration::from_secs(1))
            .build();
        assert!(TcpClient::new(&event_loop, config, DefaultHandler).is_err());
    }

    #[test]
    fn test_retry_flag() {
        let event_loop = EventLoop::new().unwrap();
        let client = TcpClient::new(&event_loop, TcpClientConfig::default(), DefaultHandler).unwrap();
        assert!(!client.retry());
        client.enable_retry();
        assert!(client.retry());
        assert!(client.connection().is_none());
    }
}
