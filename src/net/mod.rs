//! Networking on top of the event loop: listening, connecting and the TCP
//! connection machinery.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      User Application                        │
//! │   ┌──────────────┐          ┌──────────────────────┐         │
//! │   │ TcpServer /  │─────────>│ ConnectionHandler    │         │
//! │   │ TcpClient    │          │ (on_message, ...)    │         │
//! │   └──────────────┘          └──────────────────────┘         │
//! └─────────┬───────────────────────────────┬────────────────────┘
//!           │ Acceptor / Connector          │ callbacks on the owning loop
//!           ▼                               │
//! ┌──────────────────────────────────────────────────────────────┐
//! │           EventLoop (one per thread) + Channels              │
//! └─────────┬────────────────────────────────────────────────────┘
//!           │ readiness
//!           ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                   Operating System (epoll)                   │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod acceptor;
pub mod connector;
pub(crate) mod socket;
pub mod tcp;
