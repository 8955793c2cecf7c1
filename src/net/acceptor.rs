use std::fs::File;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use mio::net::{TcpListener, TcpStream};
use parking_lot::Mutex;
use socket2::SockRef;
use tracing::{debug, error, trace, warn};

use crate::channel::{Channel, ChannelHandlers};
use crate::error::{Error, Result};
use crate::net::socket;
use crate::reactor::EventLoop;
use crate::utils::LoopCell;

/// Receives each accepted stream together with its peer address.
pub type NewConnectionCallback = Arc<dyn Fn(TcpStream, SocketAddr) + Send + Sync>;

const IDLE_PATH: &str = "/dev/null";

/// Listening socket on a base loop that hands accepted streams to a callback.
///
/// One spare descriptor is kept open so that, when the process runs out of
/// descriptors, a pending connection can still be accepted and closed
/// instead of staying ready forever.
pub struct Acceptor {
    event_loop: Arc<EventLoop>,
    listener: TcpListener,
    channel: Arc<Channel>,
    listening: AtomicBool,
    idle: LoopCell<Option<File>>,
    callback: Mutex<Option<NewConnectionCallback>>,
}

impl Acceptor {
    /// Binds `addr` without listening yet. Safe from any thread.
    pub fn new(event_loop: &Arc<EventLoop>, addr: SocketAddr, reuse_port: bool) -> Result<Arc<Self>> {
        let socket = socket::create_nonblocking(&addr)?;
        socket.set_reuse_address(true)?;
        socket.set_reuse_port(reuse_port)?;
        socket
            .bind(&addr.into())
            .map_err(|source| Error::Bind { addr, source })?;
        let listener = TcpListener::from_std(std::net::TcpListener::from(socket));
        let idle = File::open(IDLE_PATH)?;

        Ok(Arc::new_cyclic(|acceptor: &Weak<Acceptor>| {
            let acceptor = acceptor.clone();
            let handlers = ChannelHandlers::new().on_read(move |_| {
                if let Some(acceptor) = acceptor.upgrade() {
                    acceptor.handle_read();
                }
            });
            let channel = Channel::new(event_loop, listener.as_raw_fd(), handlers);
            Self {
                event_loop: Arc::clone(event_loop),
                listener,
                channel,
                listening: AtomicBool::new(false),
                idle: LoopCell::new(event_loop.thread_id(), Some(idle)),
                callback: Mutex::new(None),
            }
        }))
    }

    pub fn set_new_connection_callback<F>(&self, cb: F)
    where
        F: Fn(TcpStream, SocketAddr) + Send + Sync + 'static,
    {
        *self.callback.lock() = Some(Arc::new(cb));
    }

    pub fn listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// The bound address, with the real port when bound to port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Starts listening and watching for inbound connections.
    pub fn listen(&self) -> io::Result<()> {
        self.event_loop.assert_in_loop_thread();
        SockRef::from(&self.listener).listen(libc::SOMAXCONN)?;
        self.listening.store(true, Ordering::Release);
        self.channel.enable_reading();
        debug!(addr = ?self.listener.local_addr().ok(), "acceptor listening");
        Ok(())
    }

    /// Detaches the listening channel. The socket closes when the last
    /// handle to the acceptor is dropped.
    pub(crate) fn close_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        if self.listening.swap(false, Ordering::AcqRel) {
            self.channel.disable_all();
            self.channel.remove();
        }
    }

    fn handle_read(&self) {
        self.event_loop.assert_in_loop_thread();
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    trace!(fd = stream.as_raw_fd(), %peer, "accepted connection");
                    let callback = self.callback.lock().clone();
                    match callback {
                        Some(cb) => cb(stream, peer),
                        None => drop(stream),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => continue,
                Err(e) if e.raw_os_error() == Some(libc::EMFILE) => {
                    error!(error = %e, "accept failed: out of file descriptors");
                    if !self.reject_with_idle_fd() {
                        break;
                    }
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    /// Frees the spare descriptor to accept and drop one pending connection,
    /// then takes the spare back. Returns false when no spare is available.
    fn reject_with_idle_fd(&self) -> bool {
        let mut idle = self.idle.borrow_mut();
        if idle.take().is_none() {
            return false;
        }
        match self.listener.accept() {
            Ok((stream, peer)) => {
                warn!(%peer, "rejected connection while out of file descriptors");
                drop(stream);
            }
            Err(e) => trace!(error = %e, "nothing to reject"),
        }
        *idle = File::open(IDLE_PATH).ok();
        idle.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_bind_conflict_reports_address() {
        let event_loop = EventLoop::new().unwrap();
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();
        match Acceptor::new(&event_loop, addr, false) {
            Err(Error::Bind { addr: reported, .. }) => assert_eq!(reported, addr),
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => panic!("bind should fail"),
        }
    }

    #[test]
    fn test_accepts_connections() {
        let event_loop = EventLoop::new().unwrap();
        let acceptor = Acceptor::new(&event_loop, "127.0.0.1:0".parse().unwrap(), false).unwrap();
        let (tx, rx) = mpsc::channel();
        let lp = Arc::clone(&event_loop);
        acceptor.set_new_connection_callback(move |stream, peer| {
            tx.send((stream.peer_addr().unwrap(), peer)).unwrap();
            lp.quit();
        });
        assert!(!acceptor.listening());
        acceptor.listen().unwrap();
        assert!(acceptor.listening());

        let addr = acceptor.local_addr().unwrap();
        let client = thread::spawn(move || std::net::TcpStream::connect(addr).unwrap());
        event_loop.run();

        let (stream_peer, peer) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(stream_peer, peer);
        let client = client.join().unwrap();
        assert_eq!(client.local_addr().unwrap(), peer);

        acceptor.close_in_loop();
        assert!(!acceptor.listening());
    }
}
