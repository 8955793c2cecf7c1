use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use mio::net::TcpStream;
use parking_lot::Mutex;
use socket2::Socket;
use tracing::{debug, error, info, trace, warn};

use crate::channel::{Channel, ChannelHandlers};
use crate::net::socket::{self, ConnectOutcome};
use crate::reactor::EventLoop;
use crate::timer::TimerId;
use crate::utils::LoopCell;

pub const DEFAULT_INITIAL_RETRY_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Receives the connected stream.
pub type ConnectedCallback = Arc<dyn Fn(TcpStream) + Send + Sync>;

/// Doubling retry delay with a ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial.min(max),
        }
    }

    /// Delay to wait now; the following call returns twice as much, up to
    /// the ceiling.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial.min(self.max);
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_RETRY_DELAY, DEFAULT_MAX_RETRY_DELAY)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl State {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => State::Connecting,
            2 => State::Connected,
            _ => State::Disconnected,
        }
    }
}

struct Attempt {
    socket: Option<Socket>,
    channel: Option<Arc<Channel>>,
    backoff: Backoff,
    retry_timer: Option<TimerId>,
}

/// Drives outbound connection attempts to one address, retrying transient
/// failures with exponential backoff.
///
/// [`start`](Self::start) and [`stop`](Self::stop) may be called from any
/// thread; the work happens on the connector's loop.
pub struct Connector {
    event_loop: Arc<EventLoop>,
    server_addr: SocketAddr,
    connect: AtomicBool,
    state: AtomicU8,
    attempt: LoopCell<Attempt>,
    callback: Mutex<Option<ConnectedCallback>>,
    self_ref: Weak<Connector>,
}

impl Connector {
    pub fn new(event_loop: &Arc<EventLoop>, server_addr: SocketAddr, backoff: Backoff) -> Arc<Self> {
        let connector = Arc::new_cyclic(|self_ref: &Weak<Connector>| Self {
            event_loop: Arc::clone(event_loop),
            server_addr,
            connect: AtomicBool::new(false),
            state: AtomicU8::new(State::Disconnected as u8),
            attempt: LoopCell::new(
                event_loop.thread_id(),
                Attempt {
                    socket: None,
                    channel: None,
                    backoff,
                    retry_timer: None,
                },
            ),
            callback: Mutex::new(None),
            self_ref: self_ref.clone(),
        });
        debug!(addr = %server_addr, "Connector created");
        connector
    }

    pub fn set_new_connection_callback<F>(&self, cb: F)
    where
        F: Fn(TcpStream) + Send + Sync + 'static,
    {
        *self.callback.lock() = Some(Arc::new(cb));
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn start(self: &Arc<Self>) {
        self.connect.store(true, Ordering::Release);
        let this = Arc::clone(self);
        self.event_loop.run_in_loop(move || this.start_in_loop());
    }

    /// Restarts from scratch with the initial retry delay. Loop thread only.
    pub fn restart(&self) {
        self.event_loop.assert_in_loop_thread();
        self.set_state(State::Disconnected);
        self.attempt.borrow_mut().backoff.reset();
        self.connect.store(true, Ordering::Release);
        self.start_in_loop();
    }

    /// Cancels a pending retry and any attempt in flight. Takes effect on the
    /// loop thread.
    pub fn stop(self: &Arc<Self>) {
        self.connect.store(false, Ordering::Release);
        let this = Arc::clone(self);
        self.event_loop.queue_in_loop(move || this.stop_in_loop());
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn start_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        self.attempt.borrow_mut().retry_timer = None;
        assert_eq!(self.state(), State::Disconnected);
        if self.connect.load(Ordering::Acquire) {
            self.connect_once();
        } else {
            debug!(addr = %self.server_addr, "do not connect");
        }
    }

    fn stop_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        let retry_timer = self.attempt.borrow_mut().retry_timer.take();
        if let Some(id) = retry_timer {
            self.event_loop.cancel(id);
        }
        if self.state() == State::Connecting {
            self.set_state(State::Disconnected);
            let socket = self.remove_and_reset_channel();
            self.retry(socket);
        }
    }

    fn connect_once(&self) {
        let socket = match socket::create_nonblocking(&self.server_addr) {
            Ok(socket) => socket,
            Err(e) => {
                error!(addr = %self.server_addr, error = %e, "failed to create socket");
                self.retry(None);
                return;
            }
        };
        let (errno, err) = match socket.connect(&self.server_addr.into()) {
            Ok(()) => (0, None),
            Err(e) => (e.raw_os_error().unwrap_or(libc::EINVAL), Some(e)),
        };
        match socket::classify_connect_error(errno) {
            ConnectOutcome::Proceed => self.connecting(socket),
            ConnectOutcome::Retry => {
                debug!(addr = %self.server_addr, errno, "connect failed, will retry");
                self.retry(Some(socket));
            }
            ConnectOutcome::Fatal => {
                error!(addr = %self.server_addr, errno, error = ?err, "unrecoverable connect error");
                std::process::abort();
            }
        }
    }

    fn connecting(&self, socket: Socket) {
        self.set_state(State::Connecting);
        let on_write = self.self_ref.clone();
        let on_error = self.self_ref.clone();
        let handlers = ChannelHandlers::new()
            .on_write(move || {
                if let Some(connector) = on_write.upgrade() {
                    connector.handle_write();
                }
            })
            .on_error(move || {
                if let Some(connector) = on_error.upgrade() {
                    connector.handle_error();
                }
            });
        let channel = Channel::new(&self.event_loop, socket.as_raw_fd(), handlers);
        {
            let mut attempt = self.attempt.borrow_mut();
            attempt.socket = Some(socket);
            attempt.channel = Some(Arc::clone(&channel));
        }
        channel.enable_writing();
    }

    /// Detaches the attempt's channel and hands back the socket it watched.
    fn remove_and_reset_channel(&self) -> Option<Socket> {
        let (channel, socket) = {
            let mut attempt = self.attempt.borrow_mut();
            (attempt.channel.take(), attempt.socket.take())
        };
        if let Some(channel) = channel {
            channel.disable_all();
            channel.remove();
        }
        socket
    }

    fn handle_write(&self) {
        trace!(state = ?self.state(), "Connector::handle_write");
        if self.state() != State::Connecting {
            assert_eq!(self.state(), State::Disconnected);
            return;
        }
        let Some(socket) = self.remove_and_reset_channel() else {
            return;
        };
        match socket.take_error() {
            Ok(Some(e)) | Err(e) => {
                warn!(addr = %self.server_addr, error = %e, "connect failed");
                self.retry(Some(socket));
            }
            Ok(None) if socket::is_self_connect(&socket) => {
                warn!(addr = %self.server_addr, "self connect");
                self.retry(Some(socket));
            }
            Ok(None) => {
                self.set_state(State::Connected);
                if !self.connect.load(Ordering::Acquire) {
                    return;
                }
                let stream = TcpStream::from_std(std::net::TcpStream::from(socket));
                let callback = self.callback.lock().clone();
                if let Some(cb) = callback {
                    cb(stream);
                }
            }
        }
    }

    fn handle_error(&self) {
        if self.state() != State::Connecting {
            return;
        }
        let socket = self.remove_and_reset_channel();
        if let Some(Ok(Some(e))) = socket.as_ref().map(Socket::take_error) {
            trace!(addr = %self.server_addr, error = %e, "SO_ERROR");
        }
        self.retry(socket);
    }

    fn retry(&self, socket: Option<Socket>) {
        drop(socket);
        self.set_state(State::Disconnected);
        if !self.connect.load(Ordering::Acquire) {
            debug!(addr = %self.server_addr, "do not connect");
            return;
        }
        let delay = self.attempt.borrow_mut().backoff.next_delay();
        info!(
            addr = %self.server_addr,
            delay_ms = delay.as_millis() as u64,
            "retry connecting"
        );
        let this = self.self_ref.clone();
        let id = self.event_loop.run_after(delay, move || {
            if let Some(connector) = this.upgrade() {
                connector.start_in_loop();
            }
        });
        self.attempt.borrow_mut().retry_timer = Some(id);
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        debug!(addr = %self.server_addr, "Connector destroyed");
    }
}
