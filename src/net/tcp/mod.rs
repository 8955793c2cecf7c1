//! TCP server and client built on per-thread event loops.
//!
//! Every [`TcpConnection`] belongs to exactly one loop and is only ever
//! touched by that loop's thread. Servers keep a registry of live
//! connections keyed by name; clients hold at most one connection.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! Connecting ──connect_established──> Connected
//!                                        │
//!                 shutdown() ────────────┤──> Disconnecting ──(output drained)──> half-close
//!                                        │         │
//!        EOF / HUP / force_close() ──────┴─────────┴──> Disconnected
//!                                                          │
//!                        on_connection (down), close callback, connect_destroyed
//! ```
//!
//! ## Server Pipeline
//!
//! ```text
//! base loop                          I/O loop (round-robin or peer hash)
//! ─────────                          ───────────────────────────────────
//! Acceptor::handle_read
//!   accept() until WouldBlock
//!   pick loop ──run_in_loop──────>   TcpConnection::new
//!                                    registry.insert(name)
//!                                    connect_established
//!                                      └─ on_connection (up)
//!                                    readable ─> on_message(buf)
//!                                    close ───> registry.remove(name)
//!                                               connect_destroyed (queued)
//! ```
//!
//! ## Configuration
//!
//! ```rust
//! use mill_reactor::net::tcp::config::{LoopDistribution, TcpServerConfig};
//!
//! let config = TcpServerConfig::builder()
//!     .name("chat")
//!     .address("0.0.0.0:9000".parse().unwrap())
//!     .io_threads(4)
//!     .distribution(LoopDistribution::PeerHash)
//!     .high_water_mark(8 * 1024 * 1024)
//!     .max_connections(1000)
//!     .no_delay(true)
//!     .build();
//! assert_eq!(config.io_threads, 4);
//! ```
//!
//! ## Handler Implementation
//!
//! Only override what you need; the defaults log connection up/down and
//! discard input.
//!
//! ```rust
//! use mill_reactor::net::tcp::{ConnectionHandler, TcpConnectionPtr};
//! use mill_reactor::Buffer;
//! use std::time::Instant;
//!
//! struct LineCounter;
//!
//! impl ConnectionHandler for LineCounter {
//!     fn on_message(&self, conn: &TcpConnectionPtr, buf: &mut Buffer, _: Instant) {
//!         while let Some(eol) = buf.find_eol() {
//!             let line = buf.retrieve_as_string(eol + 1);
//!             conn.send(line.to_uppercase().as_bytes());
//!         }
//!     }
//! }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod server;
pub mod traits;

pub use client::TcpClient;
pub use config::{
    LoopDistribution, TcpClientConfig, TcpClientConfigBuilder, TcpServerConfig,
    TcpServerConfigBuilder,
};
pub use connection::{ConnectionState, TcpConnection};
pub use server::TcpServer;
pub use traits::{CloseCallback, ConnectionHandler, DefaultHandler, TcpConnectionPtr};
