//! # Mill-Reactor
//! A multi-reactor TCP networking core for Rust: one event loop per thread, non-blocking
//! sockets, timers and a bounded set of I/O threads, without an async runtime.
//!
//! Mill-Reactor is built on top of [`mio`] (epoll on Linux). Each [`EventLoop`] owns a
//! poller, a timer queue and a queue of tasks submitted by other threads. Network
//! objects ([`TcpServer`](net::tcp::TcpServer), [`TcpClient`](net::tcp::TcpClient),
//! [`TcpConnection`](net::tcp::TcpConnection)) are bound to a single loop and are only
//! touched from its thread.
//! ## Core Philosophy
//! - **One loop per thread**: loop-owned state is never shared, so it is never locked
//! - **Explicit hand-off**: other threads reach a loop only through
//!   [`EventLoop::run_in_loop`] and [`EventLoop::queue_in_loop`]
//! - **Callbacks, not futures**: application code implements
//!   [`ConnectionHandler`](net::tcp::ConnectionHandler)
//! ## Architecture Overview
//! ```text
//!                 ┌──────────────────────┐
//!                 │ base EventLoop       │   Acceptor
//!                 └──────────┬───────────┘
//!                            │ accepted stream (round-robin / peer hash)
//!          ┌─────────────────┼─────────────────┐
//!          ▼                 ▼                 ▼
//!   ┌─────────────┐   ┌─────────────┐   ┌─────────────┐
//!   │ I/O loop 0  │   │ I/O loop 1  │   │ I/O loop N  │   EventLoopThreadPool
//!   │  Poller     │   │  Poller     │   │  Poller     │
//!   │  TimerQueue │   │  TimerQueue │   │  TimerQueue │
//!   │  Channels   │   │  Channels   │   │  Channels   │
//!   └─────────────┘   └─────────────┘   └─────────────┘
//! ```
//! ## Quick Start
//!
//! ```rust,no_run
//! use mill_reactor::net::tcp::{ConnectionHandler, TcpConnectionPtr, TcpServer, TcpServerConfig};
//! use mill_reactor::{Buffer, EventLoop};
//! use std::time::Instant;
//!
//! struct Echo;
//!
//! impl ConnectionHandler for Echo {
//!     fn on_message(&self, conn: &TcpConnectionPtr, buf: &mut Buffer, _: Instant) {
//!         conn.send_buffer(buf);
//!     }
//! }
//!
//! fn main() -> mill_reactor::Result<()> {
//!     let event_loop = EventLoop::new()?;
//!     let config = TcpServerConfig::builder()
//!         .name("echo")
//!         .address("127.0.0.1:2007".parse().unwrap())
//!         .io_threads(4)
//!         .build();
//!     let server = TcpServer::new(&event_loop, config, Echo)?;
//!     server.start();
//!     event_loop.run();
//!     Ok(())
//! }
//! ```
//!
//! Timers run on the loop that scheduled them:
//!
//! ```rust,no_run
//! use mill_reactor::EventLoop;
//! use std::time::Duration;
//!
//! let event_loop = EventLoop::new()?;
//! let handle = event_loop.clone();
//! let ticker = event_loop.run_every(Duration::from_millis(100), || println!("tick"));
//! event_loop.run_after(Duration::from_secs(1), move || {
//!     handle.cancel(ticker);
//!     handle.quit();
//! });
//! event_loop.run();
//! # Ok::<(), mill_reactor::Error>(())
//! ```
//!
//! - [`EventLoop`]: the reactor, its task queue and timer API
//! - [`channel`]: binding of one descriptor to its interest mask and handlers
//! - [`poll`]: the multiplexer abstraction and its mio implementation
//! - [`buffer`]: the growable I/O buffer
//! - [`thread_pool`]: loop threads and the I/O loop pool
//! - [`net`]: acceptor, connector, TCP server, client and connection
//! - [`error`]: error types and result handling

pub mod buffer;
pub mod channel;
pub mod error;
pub mod event;
pub mod net;
pub mod poll;
pub mod reactor;
pub mod thread_pool;
pub mod timer;
pub mod timer_queue;
pub mod utils;

pub use buffer::Buffer;
pub use error::{Error, Result};
pub use event::Ready;
pub use reactor::{EventLoop, EventLoopConfig};
pub use thread_pool::{EventLoopThread, EventLoopThreadPool};
pub use timer::TimerId;

/// A convenient prelude module that re-exports commonly used types and traits.
///
/// ```rust
/// use mill_reactor::prelude::*;
/// ```
pub mod prelude {
    pub use crate::buffer::Buffer;
    pub use crate::error::{Error, Result};
    pub use crate::net::tcp::{
        ConnectionHandler, TcpClient, TcpClientConfig, TcpConnection, TcpConnectionPtr,
        TcpServer, TcpServerConfig,
    };
    pub use crate::reactor::{EventLoop, EventLoopConfig};
    pub use crate::thread_pool::{EventLoopThread, EventLoopThreadPool};
    pub use crate::timer::TimerId;
}
