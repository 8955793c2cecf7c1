use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use mio::net::TcpStream;
use parking_lot::Mutex;
use tracing::{error, info, trace, warn};

use crate::error::Result;
use crate::net::acceptor::Acceptor;
use crate::net::tcp::config::{LoopDistribution, TcpServerConfig};
use crate::net::tcp::connection::{destroy_later, TcpConnection};
use crate::net::tcp::traits::{ConnectionHandler, TcpConnectionPtr};
use crate::reactor::EventLoop;
use crate::thread_pool::{EventLoopThreadPool, ThreadInitCallback};
use crate::utils::LoopCell;

/// Multi-reactor TCP server.
///
/// The acceptor lives on the base loop; each accepted stream is handed to an
/// I/O loop picked by the configured distribution, where its
/// [`TcpConnection`] is built and driven. With zero I/O threads everything
/// runs on the base loop.
///
/// ```rust,no_run
/// use mill_reactor::net::tcp::{ConnectionHandler, TcpConnectionPtr, TcpServer, TcpServerConfig};
/// use mill_reactor::{Buffer, EventLoop};
/// use std::time::Instant;
///
/// struct Echo;
///
/// impl ConnectionHandler for Echo {
///     fn on_message(&self, conn: &TcpConnectionPtr, buf: &mut Buffer, _: Instant) {
///         conn.send_buffer(buf);
///     }
/// }
///
/// let event_loop = EventLoop::new()?;
/// let config = TcpServerConfig::builder()
///     .name("echo")
///     .address("127.0.0.1:2007".parse().unwrap())
///     .io_threads(4)
///     .build();
/// let server = TcpServer::new(&event_loop, config, Echo)?;
/// server.start();
/// event_loop.run();
/// # Ok::<(), mill_reactor::Error>(())
/// ```
pub struct TcpServer {
    event_loop: Arc<EventLoop>,
    config: TcpServerConfig,
    local_addr: SocketAddr,
    ip_port: String,
    acceptor: Arc<Acceptor>,
    pool: LoopCell<EventLoopThreadPool>,
    handler: Arc<dyn ConnectionHandler>,
    thread_init: Mutex<Option<ThreadInitCallback>>,
    started: AtomicBool,
    next_conn_id: AtomicU64,
    live: AtomicUsize,
    connections: Mutex<HashMap<String, TcpConnectionPtr>>,
}

impl TcpServer {
    /// Binds the listening socket. Nothing is accepted before
    /// [`start`](Self::start).
    pub fn new<H>(event_loop: &Arc<EventLoop>, config: TcpServerConfig, handler: H) -> Result<Arc<Self>>
    where
        H: ConnectionHandler,
    {
        config.validate()?;
        let acceptor = Acceptor::new(event_loop, config.address, config.reuse_port)?;
        let local_addr = acceptor.local_addr()?;
        let mut pool = EventLoopThreadPool::new(Arc::clone(event_loop), config.name.clone());
        pool.set_thread_num(config.io_threads);

        let server = Arc::new(Self {
            event_loop: Arc::clone(event_loop),
            ip_port: local_addr.to_string(),
            local_addr,
            acceptor,
            pool: LoopCell::new(event_loop.thread_id(), pool),
            handler: Arc::new(handler),
            thread_init: Mutex::new(None),
            started: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(0),
            live: AtomicUsize::new(0),
            connections: Mutex::new(HashMap::new()),
            config,
        });

        let weak: Weak<TcpServer> = Arc::downgrade(&server);
        server
            .acceptor
            .set_new_connection_callback(move |stream, peer| {
                if let Some(server) = weak.upgrade() {
                    server.new_connection(stream, peer);
                }
            });
        Ok(server)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn ip_port(&self) -> &str {
        &self.ip_port
    }

    /// The bound address, with the real port when configured with port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    /// Runs on every I/O loop before it starts, or on the base loop when
    /// there are no I/O threads. Set before [`start`](Self::start).
    pub fn set_thread_init_callback<F>(&self, cb: F)
    where
        F: Fn(&Arc<EventLoop>) + Send + Sync + 'static,
    {
        *self.thread_init.lock() = Some(Arc::new(cb));
    }

    /// Starts the I/O threads and begins listening. Idempotent and safe from
    /// any thread; the work happens on the base loop.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let this = Arc::clone(self);
        self.event_loop.run_in_loop(move || this.start_in_loop());
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    fn start_in_loop(&self) {
        let init = self.thread_init.lock().clone();
        if let Err(e) = self.pool.borrow_mut().start(init) {
            error!(name = %self.config.name, error = %e, "failed to start I/O threads");
            return;
        }
        if self.acceptor.listening() {
            return;
        }
        match self.acceptor.listen() {
            Ok(()) => info!(name = %self.config.name, addr = %self.ip_port, "server listening"),
            Err(e) => error!(name = %self.config.name, addr = %self.ip_port, error = %e, "listen failed"),
        }
    }

    /// Number of connections currently registered.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn connection(&self, name: &str) -> Option<TcpConnectionPtr> {
        self.connections.lock().get(name).cloned()
    }

    /// Sends to the named connection; false when it is not registered.
    pub fn send_to(&self, name: &str, data: &[u8]) -> bool {
        match self.connection(name) {
            Some(conn) => {
                conn.send(data);
                true
            }
            None => false,
        }
    }

    pub fn broadcast(&self, data: &[u8]) {
        let conns: Vec<TcpConnectionPtr> = self.connections.lock().values().cloned().collect();
        for conn in conns {
            conn.send(data);
        }
    }

    /// Force-closes the named connection; false when it is not registered.
    pub fn close_connection(&self, name: &str) -> bool {
        match self.connection(name) {
            Some(conn) => {
                conn.force_close();
                true
            }
            None => false,
        }
    }

    fn new_connection(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        self.event_loop.assert_in_loop_thread();
        if let Some(max) = self.config.max_connections {
            if self.live.load(Ordering::Acquire) >= max {
                warn!(name = %self.config.name, %peer, max, "too many connections, rejecting");
                return;
            }
        }
        let local = match stream.local_addr() {
            Ok(local) => local,
            Err(e) => {
                error!(name = %self.config.name, %peer, error = %e, "failed to read local address");
                return;
            }
        };

        let io_loop = {
            let pool = self.pool.borrow();
            match self.config.distribution {
                LoopDistribution::RoundRobin => pool.next_loop(),
                LoopDistribution::PeerHash => pool.loop_for_hash(hash_ip(peer.ip())),
            }
        };
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        let conn_name = format!("{}-{}#{}", self.config.name, self.ip_port, id);
        info!(server = %self.config.name, conn = %conn_name, %peer, "new connection");
        self.live.fetch_add(1, Ordering::AcqRel);

        let this = Arc::downgrade(self);
        let target = Arc::clone(&io_loop);
        io_loop.run_in_loop(move || {
            let Some(server) = this.upgrade() else {
                return;
            };
            server.establish(&target, conn_name, stream, local, peer);
        });
    }

    fn establish(
        self: &Arc<Self>,
        io_loop: &Arc<EventLoop>,
        name: String,
        stream: TcpStream,
        local: SocketAddr,
        peer: SocketAddr,
    ) {
        io_loop.assert_in_loop_thread();
        let conn = TcpConnection::new(
            io_loop,
            name.clone(),
            stream,
            local,
            peer,
            Arc::clone(&self.handler),
            self.config.high_water_mark,
        );
        if self.config.no_delay {
            if let Err(e) = conn.set_tcp_no_delay(true) {
                warn!(conn = %name, error = %e, "failed to set TCP_NODELAY");
            }
        }
        if self.config.keep_alive {
            if let Err(e) = conn.set_keep_alive(true) {
                warn!(conn = %name, error = %e, "failed to set SO_KEEPALIVE");
            }
        }
        let weak = Arc::downgrade(self);
        conn.set_close_callback(Arc::new(move |conn: &TcpConnectionPtr| match weak.upgrade() {
            Some(server) => server.remove_connection(conn),
            None => destroy_later(conn),
        }));
        self.connections.lock().insert(name, Arc::clone(&conn));
        conn.connect_established();
    }

    fn remove_connection(&self, conn: &TcpConnectionPtr) {
        trace!(server = %self.config.name, conn = conn.name(), "remove connection");
        if self.connections.lock().remove(conn.name()).is_some() {
            self.live.fetch_sub(1, Ordering::AcqRel);
        }
        destroy_later(conn);
    }
}

fn hash_ip(ip: IpAddr) -> u64 {
    let mut hasher = DefaultHasher::new();
    ip.hash(&mut hasher);
    hasher.finish()
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        trace!(name = %self.config.name, "TcpServer dropping");
        let acceptor = Arc::clone(&self.acceptor);
        self.event_loop.run_in_loop(move || acceptor.close_in_loop());
        let conns: Vec<TcpConnectionPtr> = self.connections.lock().drain().map(|(_, c)| c).collect();
        for conn in conns {
            let io_loop = Arc::clone(conn.event_loop());
            io_loop.run_in_loop(move || conn.connect_destroyed());
        }
    }
}
