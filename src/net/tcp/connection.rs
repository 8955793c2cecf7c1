use std::any::Any;
use std::fmt;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use parking_lot::Mutex;
use socket2::SockRef;
use tracing::{debug, error, trace, warn};

use crate::buffer::Buffer;
use crate::channel::{Channel, ChannelHandlers};
use crate::net::tcp::traits::{CloseCallback, ConnectionHandler, TcpConnectionPtr};
use crate::reactor::EventLoop;
use crate::utils::LoopCell;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Disconnecting,
            _ => ConnectionState::Disconnected,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnecting => "Disconnecting",
            ConnectionState::Disconnected => "Disconnected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upper bound on the bytes one connection reads before yielding the loop to
/// the other ready channels. The rest is read on the next pass.
pub const MAX_READ_PER_WAKEUP: usize = 1024 * 1024;

/// True when queuing `adding` bytes on top of `queued` moves the output
/// from below `mark` to at or above it.
pub(crate) fn crosses_high_water_mark(queued: usize, adding: usize, mark: usize) -> bool {
    queued < mark && queued.saturating_add(adding) >= mark
}

/// One established TCP connection, driven entirely by its owning loop.
///
/// The stream, both buffers and the channel are only touched on the loop
/// thread. `send`, `shutdown` and `force_close` may be called from any
/// thread and hop onto the loop when needed.
pub struct TcpConnection {
    event_loop: Arc<EventLoop>,
    name: String,
    state: AtomicU8,
    reading: AtomicBool,
    stream: TcpStream,
    channel: Arc<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    input: LoopCell<Buffer>,
    output: LoopCell<Buffer>,
    handler: Arc<dyn ConnectionHandler>,
    close_callback: Mutex<Option<CloseCallback>>,
    high_water_mark: AtomicUsize,
    context: Mutex<Option<Box<dyn Any + Send>>>,
    self_ref: Weak<TcpConnection>,
}

impl TcpConnection {
    pub fn new(
        event_loop: &Arc<EventLoop>,
        name: String,
        stream: TcpStream,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        handler: Arc<dyn ConnectionHandler>,
        high_water_mark: usize,
    ) -> TcpConnectionPtr {
        let owner = event_loop.thread_id();
        let conn = Arc::new_cyclic(|self_ref: &Weak<TcpConnection>| {
            let on_read = self_ref.clone();
            let on_write = self_ref.clone();
            let on_close = self_ref.clone();
            let on_error = self_ref.clone();
            let handlers = ChannelHandlers::new()
                .on_read(move |receive_time| {
                    if let Some(conn) = on_read.upgrade() {
                        conn.handle_read(receive_time);
                    }
                })
                .on_write(move || {
                    if let Some(conn) = on_write.upgrade() {
                        conn.handle_write();
                    }
                })
                .on_close(move || {
                    if let Some(conn) = on_close.upgrade() {
                        conn.handle_close();
                    }
                })
                .on_error(move || {
                    if let Some(conn) = on_error.upgrade() {
                        conn.handle_error();
                    }
                });
            let channel = Channel::new(event_loop, stream.as_raw_fd(), handlers);
            Self {
                event_loop: Arc::clone(event_loop),
                name,
                state: AtomicU8::new(ConnectionState::Connecting as u8),
                reading: AtomicBool::new(true),
                stream,
                channel,
                local_addr,
                peer_addr,
                input: LoopCell::new(owner, Buffer::new()),
                output: LoopCell::new(owner, Buffer::new()),
                handler,
                close_callback: Mutex::new(None),
                high_water_mark: AtomicUsize::new(high_water_mark),
                context: Mutex::new(None),
                self_ref: self_ref.clone(),
            }
        });
        debug!(name = %conn.name, fd = conn.channel.fd(), "TcpConnection created");
        conn
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.state() == ConnectionState::Disconnected
    }

    pub fn is_reading(&self) -> bool {
        self.reading.load(Ordering::Acquire)
    }

    pub fn set_high_water_mark(&self, bytes: usize) {
        self.high_water_mark.store(bytes, Ordering::Relaxed);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        *self.close_callback.lock() = Some(cb);
    }

    pub fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        self.stream.set_nodelay(on)
    }

    pub fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        SockRef::from(&self.stream).set_keepalive(on)
    }

    /// Kernel statistics for this socket, from `getsockopt(TCP_INFO)`.
    pub fn tcp_info(&self) -> io::Result<libc::tcp_info> {
        // SAFETY: tcp_info is plain old data, so all-zero is a valid value.
        let mut info: libc::tcp_info = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::tcp_info>() as libc::socklen_t;
        // SAFETY: the pointer and length describe `info`, which outlives the call.
        let rc = unsafe {
            libc::getsockopt(
                self.stream.as_raw_fd(),
                libc::IPPROTO_TCP,
                libc::TCP_INFO,
                &mut info as *mut libc::tcp_info as *mut libc::c_void,
                &mut len,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(info)
    }

    /// One-line summary of [`tcp_info`](Self::tcp_info) for logs.
    pub fn tcp_info_string(&self) -> io::Result<String> {
        self.tcp_info().map(|info| format_tcp_info(&info))
    }

    /// Attaches arbitrary per-connection state, replacing any previous value.
    pub fn set_context<T: Any + Send>(&self, value: T) {
        *self.context.lock() = Some(Box::new(value));
    }

    /// A copy of the context, if one of type `T` is attached.
    pub fn context<T: Any + Send + Clone>(&self) -> Option<T> {
        self.context
            .lock()
            .as_ref()
            .and_then(|ctx| ctx.downcast_ref::<T>())
            .cloned()
    }

    pub fn take_context(&self) -> Option<Box<dyn Any + Send>> {
        self.context.lock().take()
    }

    /// Queues `data` for sending. Dropped with a warning unless connected.
    pub fn send(&self, data: &[u8]) {
        if !self.check_can_send() {
            return;
        }
        if self.event_loop.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            self.send_owned(data.to_vec());
        }
    }

    /// Like [`send`](Self::send) without copying when called off the loop.
    pub fn send_vec(&self, data: Vec<u8>) {
        if !self.check_can_send() {
            return;
        }
        if self.event_loop.is_in_loop_thread() {
            self.send_in_loop(&data);
        } else {
            self.send_owned(data);
        }
    }

    /// Sends every readable byte of `buf` and empties it.
    pub fn send_buffer(&self, buf: &mut Buffer) {
        if !self.check_can_send() {
            return;
        }
        if self.event_loop.is_in_loop_thread() {
            self.send_in_loop(buf.peek());
            buf.retrieve_all();
        } else {
            self.send_owned(buf.retrieve_all_as_bytes());
        }
    }

    fn check_can_send(&self) -> bool {
        let state = self.state();
        if state != ConnectionState::Connected {
            warn!(name = %self.name, %state, "not connected, give up sending");
            return false;
        }
        true
    }

    fn send_owned(&self, data: Vec<u8>) {
        if let Some(this) = self.self_ref.upgrade() {
            self.event_loop.queue_in_loop(move || this.send_in_loop(&data));
        }
    }

    fn send_in_loop(&self, data: &[u8]) {
        self.event_loop.assert_in_loop_thread();
        if self.state() == ConnectionState::Disconnected {
            warn!(name = %self.name, "disconnected, give up writing");
            return;
        }

        let mut written = 0;
        let mut fault = false;
        let nothing_queued = !self.channel.is_writing() && self.output.borrow().is_empty();
        if nothing_queued {
            while written < data.len() {
                match (&self.stream).write(&data[written..]) {
                    Ok(0) => break,
                    Ok(n) => written += n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        error!(name = %self.name, error = %e, "TcpConnection::send_in_loop");
                        if matches!(
                            e.kind(),
                            io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
                        ) {
                            fault = true;
                        }
                        break;
                    }
                }
            }
            if written == data.len() {
                self.queue_write_complete();
            }
        }

        let remaining = data.len() - written;
        if fault || remaining == 0 {
            return;
        }
        let queued = self.output.borrow().readable_bytes();
        let mark = self.high_water_mark.load(Ordering::Relaxed);
        if crosses_high_water_mark(queued, remaining, mark) {
            if let Some(this) = self.self_ref.upgrade() {
                let handler = Arc::clone(&self.handler);
                let total = queued + remaining;
                self.event_loop
                    .queue_in_loop(move || handler.on_high_water_mark(&this, total));
            }
        }
        self.output.borrow_mut().append(&data[written..]);
        if !self.channel.is_writing() {
            self.channel.enable_writing();
        }
    }

    fn queue_write_complete(&self) {
        if let Some(this) = self.self_ref.upgrade() {
            let handler = Arc::clone(&self.handler);
            self.event_loop
                .queue_in_loop(move || handler.on_write_complete(&this));
        }
    }

    /// Half-closes once all queued output has been written.
    pub fn shutdown(&self) {
        if self
            .state
            .compare_exchange(
                ConnectionState::Connected as u8,
                ConnectionState::Disconnecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            if let Some(this) = self.self_ref.upgrade() {
                self.event_loop.run_in_loop(move || this.shutdown_in_loop());
            }
        }
    }

    fn shutdown_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        if !self.channel.is_writing() {
            if let Err(e) = self.stream.shutdown(Shutdown::Write) {
                error!(name = %self.name, error = %e, "shutdown write failed");
            }
        }
    }

    /// Closes the connection without waiting for queued output.
    pub fn force_close(&self) {
        if self.begin_disconnecting() {
            if let Some(this) = self.self_ref.upgrade() {
                self.event_loop.queue_in_loop(move || this.force_close_in_loop());
            }
        }
    }

    pub fn force_close_with_delay(&self, delay: Duration) {
        if self.begin_disconnecting() {
            let conn = self.self_ref.clone();
            self.event_loop.run_after(delay, move || {
                if let Some(conn) = conn.upgrade() {
                    conn.force_close();
                }
            });
        }
    }

    fn begin_disconnecting(&self) -> bool {
        let state = self.state();
        if state == ConnectionState::Connected || state == ConnectionState::Disconnecting {
            self.set_state(ConnectionState::Disconnecting);
            true
        } else {
            false
        }
    }

    fn force_close_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        let state = self.state();
        if state == ConnectionState::Connected || state == ConnectionState::Disconnecting {
            self.handle_close();
        }
    }

    pub fn start_read(&self) {
        if let Some(this) = self.self_ref.upgrade() {
            self.event_loop.run_in_loop(move || this.start_read_in_loop());
        }
    }

    fn start_read_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        if !self.is_reading() || !self.channel.is_reading() {
            self.channel.enable_reading();
            self.reading.store(true, Ordering::Release);
        }
    }

    pub fn stop_read(&self) {
        if let Some(this) = self.self_ref.upgrade() {
            self.event_loop.run_in_loop(move || this.stop_read_in_loop());
        }
    }

    fn stop_read_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        if self.is_reading() || self.channel.is_reading() {
            self.channel.disable_reading();
            self.reading.store(false, Ordering::Release);
        }
    }

    /// Called once by the owning server or client, on the loop thread.
    pub fn connect_established(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        assert_eq!(self.state(), ConnectionState::Connecting);
        self.set_state(ConnectionState::Connected);
        let owner: Arc<dyn Any + Send + Sync> = Arc::clone(self) as Arc<dyn Any + Send + Sync>;
        self.channel.tie(&owner);
        self.channel.enable_reading();
        self.handler.on_connection(self);
    }

    /// Called once by the owning server or client after the connection has
    /// left its registry. Detaches the channel.
    pub fn connect_destroyed(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        let state = self.state();
        if state == ConnectionState::Connected || state == ConnectionState::Disconnecting {
            self.set_state(ConnectionState::Disconnected);
            self.channel.disable_all();
            self.handler.on_connection(self);
        }
        if !self.channel.is_none_event() {
            self.channel.disable_all();
        }
        if self.channel.is_added_to_loop() {
            self.channel.remove();
        }
    }

    fn handle_read(&self, receive_time: Instant) {
        self.event_loop.assert_in_loop_thread();
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };

        let mut input = self.input.borrow_mut();
        let before = input.readable_bytes();
        let mut eof = false;
        let mut failure = None;
        let mut exhausted = false;
        let mut taken = 0;
        loop {
            if taken >= MAX_READ_PER_WAKEUP {
                exhausted = true;
                break;
            }
            match input.read_from(&mut &self.stream) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => taken += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        if input.readable_bytes() > before {
            self.handler.on_message(&this, &mut input, receive_time);
        }
        drop(input);

        if let Some(e) = failure {
            error!(name = %self.name, error = %e, "TcpConnection::handle_read");
            self.handle_error();
        }
        if eof {
            self.handle_close();
        } else if exhausted && self.channel.is_reading() {
            // The edge was consumed without reaching WouldBlock, so no new
            // readiness will be reported. Resume after the other channels.
            trace!(name = %self.name, taken, "read budget exhausted");
            self.event_loop.queue_in_loop(move || {
                if this.channel.is_reading() {
                    this.handle_read(Instant::now());
                }
            });
        }
    }

    fn handle_write(&self) {
        self.event_loop.assert_in_loop_thread();
        if !self.channel.is_writing() {
            trace!(name = %self.name, fd = self.channel.fd(), "connection is down, no more writing");
            return;
        }

        let drained = {
            let mut output = self.output.borrow_mut();
            while !output.is_empty() {
                match (&self.stream).write(output.peek()) {
                    Ok(0) => break,
                    Ok(n) => output.retrieve(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        error!(name = %self.name, error = %e, "TcpConnection::handle_write");
                        break;
                    }
                }
            }
            output.is_empty()
        };

        if drained {
            self.channel.disable_writing();
            self.queue_write_complete();
            if self.state() == ConnectionState::Disconnecting {
                self.shutdown_in_loop();
            }
        }
    }

    fn handle_close(&self) {
        self.event_loop.assert_in_loop_thread();
        let state = self.state();
        trace!(name = %self.name, fd = self.channel.fd(), %state, "handle close");
        if state == ConnectionState::Disconnected {
            return;
        }
        assert!(
            state == ConnectionState::Connected || state == ConnectionState::Disconnecting,
            "closing connection {} in state {state}",
            self.name
        );
        self.set_state(ConnectionState::Disconnected);
        self.channel.disable_all();

        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        self.handler.on_connection(&this);
        let close_callback = self.close_callback.lock().clone();
        if let Some(cb) = close_callback {
            cb(&this);
        }
    }

    fn handle_error(&self) {
        match self.stream.take_error() {
            Ok(Some(e)) => error!(name = %self.name, error = %e, "TcpConnection::handle_error SO_ERROR"),
            Ok(None) => {}
            Err(e) => error!(name = %self.name, error = %e, "TcpConnection::handle_error"),
        }
    }
}

fn format_tcp_info(info: &libc::tcp_info) -> String {
    format!(
        "unrecovered={} rto={} ato={} snd_mss={} rcv_mss={} lost={} retrans={} \
         rtt={} rttvar={} ssthresh={} cwnd={} total_retrans={}",
        info.tcpi_retransmits,
        info.tcpi_rto,
        info.tcpi_ato,
        info.tcpi_snd_mss,
        info.tcpi_rcv_mss,
        info.tcpi_lost,
        info.tcpi_retrans,
        info.tcpi_rtt,
        info.tcpi_rttvar,
        info.tcpi_snd_ssthresh,
        info.tcpi_snd_cwnd,
        info.tcpi_total_retrans,
    )
}

/// Destroys `conn` on its loop after the current dispatch pass.
pub(crate) fn destroy_later(conn: &TcpConnectionPtr) {
    let target = Arc::clone(conn);
    conn.event_loop()
        .queue_in_loop(move || target.connect_destroyed());
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        debug!(name = %self.name, fd = self.channel.fd(), state = %self.state(), "TcpConnection dropped");
    }
}
